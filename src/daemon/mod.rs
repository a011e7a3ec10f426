//! Unix socket daemon driving the broker.
//!
//! One task owns the [`Broker`] and multiplexes new connections, frames
//! from per-connection reader tasks, gated requests from the kernel side,
//! and shutdown. Reader and writer tasks only move bytes. Outbound messages
//! are queued with `try_send`; a full queue drops the client.

pub mod frame;

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{
    Broker, BrokerError, ChannelId, Completion, EventKind, Filter, SendError, SessionId, Transport,
};
use crate::config::DaemonConfig;
use crate::wire::view::{self, View};
use crate::wire::{
    self, build, opcode, Message, Verdict, WireError, PROTOCOL_MIN_VERSION, PROTOCOL_VERSION,
};

/// Daemon errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The daemon task has exited.
    #[error("daemon is not running")]
    Stopped,
    /// A frame announced a length outside the accepted range.
    #[error("frame length {0} out of range")]
    FrameLength(u32),
    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Encoding or validation failed.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// The broker refused the request.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// A gated event from the kernel side, answered through `reply`.
#[derive(Debug)]
pub struct GateRequest {
    /// `N_ASK` or `N_NOTIFY` message.
    pub message: Message,
    /// Receives the final verdict. Notifications are answered with
    /// [`Verdict::ALLOW`] once distributed.
    pub reply: oneshot::Sender<Verdict>,
}

/// Cloneable handle for submitting events to a running daemon.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    tx: mpsc::Sender<GateRequest>,
}

impl DaemonHandle {
    /// Queue `message` and return the receiver for its verdict.
    pub async fn submit(&self, message: Message) -> Result<oneshot::Receiver<Verdict>, DaemonError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(GateRequest { message, reply })
            .await
            .map_err(|_| DaemonError::Stopped)?;
        Ok(rx)
    }

    /// Queue `message` and wait for its verdict.
    pub async fn ask(&self, message: Message) -> Result<Verdict, DaemonError> {
        let rx = self.submit(message).await?;
        rx.await.map_err(|_| DaemonError::Stopped)
    }
}

/// Create the socket, replacing a stale one.
pub fn bind(path: &Path) -> Result<UnixListener, DaemonError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(UnixListener::bind(path)?)
}

enum Inbound {
    Frame(ChannelId, Message),
    Closed(ChannelId, Option<DaemonError>),
}

struct Connection {
    uid: u32,
    /// Set once the version handshake succeeded.
    session: Option<SessionId>,
    outbound: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
}

/// Outbound side of the broker over per-connection queues.
struct Queues<'a> {
    connections: &'a HashMap<ChannelId, Connection>,
}

impl Transport for Queues<'_> {
    fn send(&mut self, channel: ChannelId, msg: &Message) -> Result<(), SendError> {
        let conn = self.connections.get(&channel).ok_or(SendError::Closed)?;
        conn.outbound.try_send(msg.clone()).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }
}

/// The daemon. Build with [`Daemon::new`], take handles, then [`Daemon::run`].
pub struct Daemon {
    config: DaemonConfig,
    broker: Broker,
    connections: HashMap<ChannelId, Connection>,
    next_channel: u64,
    gate_tx: mpsc::Sender<GateRequest>,
    gate_rx: mpsc::Receiver<GateRequest>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: mpsc::Receiver<Inbound>,
}

impl Daemon {
    /// Build a daemon with an empty broker.
    pub fn new(config: DaemonConfig) -> Self {
        let (gate_tx, gate_rx) = mpsc::channel(config.inbound_queue_depth);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_depth);
        Self {
            broker: Broker::new(config.settled_token_capacity),
            config,
            connections: HashMap::new(),
            next_channel: 1,
            gate_tx,
            gate_rx,
            inbound_tx,
            inbound_rx,
        }
    }

    /// Handle for submitting gated events.
    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            tx: self.gate_tx.clone(),
        }
    }

    /// Serve `listener` until `shutdown` turns true or its sender drops.
    ///
    /// On exit every session is torn down, so pending events resolve with
    /// [`Verdict::NO_DECISION`].
    pub async fn run(mut self, listener: UnixListener, mut shutdown: watch::Receiver<bool>) {
        info!(
            version = PROTOCOL_VERSION,
            default_verdict = self.config.default_verdict,
            "daemon started"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => self.accept(stream),
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(inbound) = self.inbound_rx.recv() => match inbound {
                    Inbound::Frame(channel, msg) => self.handle_frame(channel, msg),
                    Inbound::Closed(channel, err) => {
                        match err {
                            Some(e) => warn!(channel = channel.0, error = %e, "connection failed"),
                            None => debug!(channel = channel.0, "peer hung up"),
                        }
                        self.close(channel);
                    }
                },
                Some(req) = self.gate_rx.recv() => self.handle_gate(req),
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("daemon shutting down");
                        break;
                    }
                }
            }
            self.reap_lost();
        }

        let channels: Vec<ChannelId> = self.connections.keys().copied().collect();
        for channel in channels {
            self.close(channel);
        }
        self.gate_rx.close();
        while let Ok(req) = self.gate_rx.try_recv() {
            let _ = req.reply.send(Verdict::NO_DECISION);
        }
        info!("daemon stopped");
    }

    fn accept(&mut self, stream: UnixStream) {
        let uid = match stream.peer_cred() {
            Ok(cred) => cred.uid(),
            Err(e) => {
                warn!(error = %e, "peer credentials unavailable, refusing connection");
                return;
            }
        };
        let channel = ChannelId(self.next_channel);
        self.next_channel = self.next_channel.wrapping_add(1);

        let (rd, wr) = stream.into_split();
        let (outbound, out_rx) = mpsc::channel(self.config.outbound_queue_depth);
        let reader = tokio::spawn(read_loop(
            channel,
            rd,
            self.inbound_tx.clone(),
            self.config.max_message_len,
        ));
        tokio::spawn(write_loop(channel, wr, out_rx));

        match build::hello(PROTOCOL_VERSION, PROTOCOL_MIN_VERSION) {
            Ok(hello) => {
                let _ = outbound.try_send(hello);
            }
            Err(e) => warn!(error = %e, "could not build hello"),
        }
        self.connections.insert(
            channel,
            Connection {
                uid,
                session: None,
                outbound,
                reader,
            },
        );
        info!(channel = channel.0, uid, "client connected");
    }

    fn handle_frame(&mut self, channel: ChannelId, msg: Message) {
        let Some(conn) = self.connections.get(&channel) else {
            return;
        };
        let (uid, session) = (conn.uid, conn.session);

        if let Err(e) = wire::check(&msg) {
            warn!(channel = channel.0, error = %e, "dropping invalid frame");
            return;
        }
        let op = msg.opcode().unwrap_or_default();
        let token = view::token(&msg).unwrap_or_default();
        let decoded = match view::decode(&msg) {
            Ok(v) => v,
            Err(e) => {
                warn!(channel = channel.0, error = %e, "dropping undecodable frame");
                return;
            }
        };
        debug!(channel = channel.0, opcode = opcode::name(op), token, "frame received");

        let Some(session) = session else {
            self.handshake(channel, uid, decoded, token, op);
            return;
        };

        match decoded {
            View::Register(r) => {
                let filter = Filter::new(r.uid, r.rule_id, r.subsystem);
                let code = errno_of(self.broker.register(session, filter));
                self.reply(channel, r.token, op, code);
            }
            View::Unregister(r) => {
                let filter = Filter::new(r.uid, r.rule_id, r.subsystem);
                let code = errno_of(self.broker.unregister(session, filter));
                self.reply(channel, r.token, op, code);
            }
            View::Answer(a) => {
                let mut tx = Queues {
                    connections: &self.connections,
                };
                match self
                    .broker
                    .answer(&mut tx, session, a.token, a.verdict, a.delegate)
                {
                    Ok(outcome) => {
                        debug!(session = %session, token = a.token, ?outcome, "answer accepted");
                    }
                    Err(e) => {
                        debug!(session = %session, token = a.token, error = %e, "answer refused");
                        self.reply(channel, a.token, op, e.errno());
                    }
                }
            }
            View::Close { token } => {
                self.reply(channel, token, op, 0);
                self.close(channel);
            }
            _ => {
                debug!(channel = channel.0, opcode = opcode::name(op), "unsupported request");
                self.reply(channel, token, op, wire::EINVAL.saturating_neg());
            }
        }
    }

    fn handshake(&mut self, channel: ChannelId, uid: u32, decoded: View<'_>, token: u64, op: u32) {
        match decoded {
            View::Versel { token, version }
                if (PROTOCOL_MIN_VERSION..=PROTOCOL_VERSION).contains(&version) =>
            {
                let session = self.broker.open_session(uid, channel);
                if let Some(conn) = self.connections.get_mut(&channel) {
                    conn.session = Some(session);
                }
                self.reply(channel, token, op, 0);
            }
            View::Versel { token, version } => {
                warn!(channel = channel.0, version, "unsupported protocol version");
                self.reply(channel, token, op, wire::EPROTO.saturating_neg());
                self.close(channel);
            }
            _ => {
                warn!(channel = channel.0, opcode = opcode::name(op), "request before handshake");
                self.reply(channel, token, op, wire::EPROTO.saturating_neg());
                self.close(channel);
            }
        }
    }

    fn reply(&mut self, channel: ChannelId, token: u64, answered: u32, error: i32) {
        let msg = match build::reply(token, answered, error) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "could not build reply");
                return;
            }
        };
        let mut tx = Queues {
            connections: &self.connections,
        };
        if let Err(e) = tx.send(channel, &msg) {
            warn!(channel = channel.0, error = %e, "reply not delivered, dropping client");
            self.close(channel);
        }
    }

    fn handle_gate(&mut self, req: GateRequest) {
        let GateRequest { message, reply } = req;
        let head = match self.broker.create_head(message, None) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "rejecting gate request");
                let _ = reply.send(Verdict::NO_DECISION);
                return;
            }
        };
        let kind = self.broker.head_kind(head);

        let mut tx = Queues {
            connections: &self.connections,
        };
        let delivered = self.broker.dispatch_all(&mut tx, head).unwrap_or_default();

        if kind == Some(EventKind::Ask) && delivered > 0 {
            let attached = self.broker.set_completion(
                head,
                Box::new(move |done: Completion| {
                    let _ = reply.send(done.verdict);
                }),
            );
            if let Err(e) = attached {
                warn!(head = %head, error = %e, "event resolved before completion was attached");
            }
            return;
        }

        let verdict = match kind {
            Some(EventKind::Ask) => self.config.default_verdict(),
            _ => Verdict::ALLOW,
        };
        if let Err(e) = self.broker.abandon(head) {
            warn!(head = %head, error = %e, "could not release event");
        }
        debug!(head = %head, delivered, %verdict, "event answered without a decision");
        let _ = reply.send(verdict);
    }

    /// Tear down sessions whose sends failed, including any lost while
    /// resolving the heads of earlier ones.
    fn reap_lost(&mut self) {
        loop {
            let lost = self.broker.take_lost_sessions();
            if lost.is_empty() {
                break;
            }
            for session in lost {
                self.reap(session);
            }
        }
    }

    fn reap(&mut self, session: SessionId) {
        let channel = self
            .connections
            .iter()
            .find(|(_, c)| c.session == Some(session))
            .map(|(ch, _)| *ch);
        match channel {
            Some(ch) => self.close(ch),
            None => {
                let mut tx = Queues {
                    connections: &self.connections,
                };
                let _ = self.broker.teardown(&mut tx, session);
            }
        }
    }

    /// Drop the connection and tear down its session.
    fn close(&mut self, channel: ChannelId) {
        let Some(conn) = self.connections.remove(&channel) else {
            return;
        };
        conn.reader.abort();
        if let Some(session) = conn.session {
            let mut tx = Queues {
                connections: &self.connections,
            };
            if let Err(e) = self.broker.teardown(&mut tx, session) {
                warn!(session = %session, error = %e, "teardown failed");
            }
        }
        info!(channel = channel.0, uid = conn.uid, "client disconnected");
    }
}

fn errno_of(result: Result<(), BrokerError>) -> i32 {
    result.err().map_or(0, |e| e.errno())
}

async fn read_loop(
    channel: ChannelId,
    mut rd: OwnedReadHalf,
    inbound: mpsc::Sender<Inbound>,
    max_len: usize,
) {
    let err = loop {
        match frame::read_frame(&mut rd, max_len).await {
            Ok(Some(msg)) => {
                if inbound.send(Inbound::Frame(channel, msg)).await.is_err() {
                    return;
                }
            }
            Ok(None) => break None,
            Err(e) => break Some(e),
        }
    };
    let _ = inbound.send(Inbound::Closed(channel, err)).await;
}

async fn write_loop(channel: ChannelId, mut wr: OwnedWriteHalf, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = frame::write_frame(&mut wr, &msg).await {
            debug!(channel = channel.0, error = %e, "write failed");
            break;
        }
    }
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut wr).await;
}
