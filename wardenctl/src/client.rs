//! Sans-io protocol client.
//!
//! [`Client`] holds the protocol state of one connection. Feed it inbound
//! messages with [`Client::receive`]; it answers with a [`Step`] listing
//! messages to send and [`ClientEvent`]s for the caller. It never touches a
//! socket.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;
use warden::broker::Filter;
use warden::wire::view::{self, View};
use warden::wire::{
    self, build, opcode, Message, Verdict, WireError, PROTOCOL_MIN_VERSION, PROTOCOL_VERSION,
};

use crate::transaction::{
    Control, Delivery, Flags, ProcessFn, Transaction, TransactionError, TransactionSet,
};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Encoding or validation failed.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// A transaction could not be created.
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    /// No protocol version is supported by both sides.
    #[error("server speaks versions {min}..={max}, none of which is supported")]
    Incompatible {
        /// Server minimum.
        min: u32,
        /// Server maximum.
        max: u32,
    },
    /// A request was made before the handshake finished.
    #[error("not connected")]
    NotConnected,
}

/// Owned copy of an `N_ASK` or `N_NOTIFY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInfo {
    /// Event token; answer with it.
    pub token: u64,
    /// Triggering process.
    pub pid: u32,
    /// Uid of the triggering process.
    pub uid: u32,
    /// Matching rule.
    pub rule_id: u32,
    /// Originating subsystem.
    pub subsystem: u32,
    /// Display priority.
    pub priority: u32,
    /// Path involved, lossily decoded.
    pub path: Option<String>,
    /// Subsystem-specific blob.
    pub payload: Vec<u8>,
}

/// Something the caller should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Handshake finished at `version`.
    Connected {
        /// Negotiated version.
        version: u32,
    },
    /// The server refused the version selection.
    Refused {
        /// Error code from the reply.
        error: i32,
    },
    /// A registration was acknowledged.
    Registered {
        /// Request token.
        token: u64,
        /// The filter now active.
        filter: Filter,
    },
    /// A registration or unregistration was refused.
    RequestFailed {
        /// Request token.
        token: u64,
        /// Negative errno.
        error: i32,
    },
    /// An unregistration was acknowledged.
    Unregistered {
        /// Request token.
        token: u64,
        /// The filter removed.
        filter: Filter,
    },
    /// A verdict is requested.
    Ask(EventInfo),
    /// Informational event.
    Notify(EventInfo),
    /// Final verdict for an event this client saw.
    Outcome {
        /// Event token.
        token: u64,
        /// This client decided.
        you: bool,
        /// Uid of the deciding session.
        uid: u32,
        /// Final verdict.
        verdict: Verdict,
    },
    /// An answer was refused.
    AnswerRejected {
        /// Event token.
        token: u64,
        /// Negative errno.
        error: i32,
    },
    /// Status subsystem message.
    Status {
        /// Status key.
        key: u32,
        /// Status value.
        value: u32,
    },
    /// The server acknowledged `C_CLOSE`.
    Closed,
}

/// Result of feeding one message.
#[derive(Debug, Default)]
pub struct Step {
    /// Messages to write, in order.
    pub send: Vec<Message>,
    /// Events for the caller, in order.
    pub events: Vec<ClientEvent>,
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    Hello,
    Versel(u32),
    Register(Filter),
    Unregister(Filter),
    Close,
}

/// Protocol state of one connection.
#[derive(Debug)]
pub struct Client {
    next_token: u64,
    transactions: TransactionSet,
    pending: HashMap<u64, Pending>,
    version: Option<u32>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

/// Stage hook for requests acknowledged by a single `C_REPLY`.
fn finish_on_reply() -> ProcessFn {
    Box::new(|ctl: &mut Control, msg: &Message| {
        let code = match view::decode(msg) {
            Ok(View::Reply(r)) => r.error,
            _ => wire::EPROTO.saturating_neg(),
        };
        ctl.done(code);
    })
}

impl Client {
    /// Fresh client waiting for the server greeting.
    pub fn new() -> Self {
        let mut client = Self {
            next_token: u64::from(rand::random::<u32>()).saturating_add(1),
            transactions: TransactionSet::new(),
            pending: HashMap::new(),
            version: None,
        };
        // Token 0 never collides with allocated tokens.
        if let Ok(tx) = Transaction::create(
            0,
            Flags::INIT_PEER | Flags::RETAIN_FINAL | Flags::DEQUEUE,
            &[opcode::C_HELLO],
            None,
            None,
        ) {
            client.transactions.insert(tx);
            client.pending.insert(0, Pending::Hello);
        }
        client
    }

    /// Negotiated version once connected.
    pub fn version(&self) -> Option<u32> {
        self.version
    }

    fn token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token = self.next_token.checked_add(1).unwrap_or(1);
        token
    }

    fn request(&mut self, token: u64, what: Pending) -> Result<(), ClientError> {
        let tx = Transaction::create(
            token,
            Flags::INIT_SELF | Flags::RETAIN_FINAL | Flags::DEQUEUE,
            &[opcode::C_REPLY],
            Some(finish_on_reply()),
            None,
        )?;
        self.transactions.insert(tx);
        self.pending.insert(token, what);
        Ok(())
    }

    /// Build an `N_REGISTER` and track its acknowledgement.
    pub fn register(&mut self, filter: Filter) -> Result<Message, ClientError> {
        if self.version.is_none() {
            return Err(ClientError::NotConnected);
        }
        let token = self.token();
        let msg = build::register(token, filter.uid, filter.rule_id, filter.subsystem, None)?;
        self.request(token, Pending::Register(filter))?;
        Ok(msg)
    }

    /// Build an `N_UNREGISTER` and track its acknowledgement.
    pub fn unregister(&mut self, filter: Filter) -> Result<Message, ClientError> {
        if self.version.is_none() {
            return Err(ClientError::NotConnected);
        }
        let token = self.token();
        let msg = build::unregister(token, filter.uid, filter.rule_id, filter.subsystem)?;
        self.request(token, Pending::Unregister(filter))?;
        Ok(msg)
    }

    /// Build an `N_ANSWER`. The server only replies on error.
    pub fn answer(&self, token: u64, verdict: Verdict, delegate: bool) -> Result<Message, ClientError> {
        if self.version.is_none() {
            return Err(ClientError::NotConnected);
        }
        Ok(build::answer(token, verdict, delegate)?)
    }

    /// Build a `C_CLOSE` and track its acknowledgement.
    pub fn close(&mut self) -> Result<Message, ClientError> {
        let token = self.token();
        let msg = build::close(token)?;
        self.request(token, Pending::Close)?;
        Ok(msg)
    }

    /// Feed one inbound message.
    pub fn receive(&mut self, msg: Message) -> Result<Step, ClientError> {
        wire::check(&msg)?;
        let is_self = msg.opcode() == Some(opcode::C_REPLY);
        match self.transactions.deliver(msg, is_self) {
            Delivery::Unmatched(msg) => self.unsolicited(&msg),
            Delivery::Pending | Delivery::Finished(None) => Ok(Step::default()),
            Delivery::Finished(Some(tx)) => self.finished(&tx),
        }
    }

    fn finished(&mut self, tx: &Transaction) -> Result<Step, ClientError> {
        let mut step = Step::default();
        let token = tx.token();
        let code = tx.result().unwrap_or_default();
        let Some(what) = self.pending.remove(&token) else {
            return Ok(step);
        };
        debug!(token, code, ?what, "transaction finished");

        match what {
            Pending::Hello => {
                let hello = match tx.retained().first().map(view::decode) {
                    Some(Ok(View::Hello(h))) => h,
                    _ => return Ok(step),
                };
                let version = hello.version.min(PROTOCOL_VERSION);
                if version < hello.min_version.max(PROTOCOL_MIN_VERSION) {
                    return Err(ClientError::Incompatible {
                        min: hello.min_version,
                        max: hello.version,
                    });
                }
                let token = self.token();
                step.send.push(build::versel(token, version)?);
                self.request(token, Pending::Versel(version))?;
            }
            Pending::Versel(version) if code == 0 => {
                self.version = Some(version);
                step.events.push(ClientEvent::Connected { version });
            }
            Pending::Versel(_) => step.events.push(ClientEvent::Refused { error: code }),
            Pending::Register(filter) if code == 0 => {
                step.events.push(ClientEvent::Registered { token, filter });
            }
            Pending::Unregister(filter) if code == 0 => {
                step.events.push(ClientEvent::Unregistered { token, filter });
            }
            Pending::Register(_) | Pending::Unregister(_) => {
                step.events.push(ClientEvent::RequestFailed { token, error: code });
            }
            Pending::Close => {
                self.version = None;
                step.events.push(ClientEvent::Closed);
            }
        }
        Ok(step)
    }

    fn unsolicited(&mut self, msg: &Message) -> Result<Step, ClientError> {
        let mut step = Step::default();
        match view::decode(msg)? {
            View::Event(ev) => {
                let info = EventInfo {
                    token: ev.token,
                    pid: ev.pid,
                    uid: ev.uid,
                    rule_id: ev.rule_id,
                    subsystem: ev.subsystem,
                    priority: ev.priority,
                    path: ev.path.map(|p| String::from_utf8_lossy(p).into_owned()),
                    payload: ev.payload.to_vec(),
                };
                step.events.push(if ev.needs_verdict {
                    ClientEvent::Ask(info)
                } else {
                    ClientEvent::Notify(info)
                });
            }
            View::Outcome(o) => step.events.push(ClientEvent::Outcome {
                token: o.token,
                you: o.you,
                uid: o.uid,
                verdict: o.verdict,
            }),
            View::Reply(r) if r.opcode == opcode::N_ANSWER => {
                step.events.push(ClientEvent::AnswerRejected {
                    token: r.token,
                    error: r.error,
                });
            }
            View::Status { key, value, .. } => step.events.push(ClientEvent::Status { key, value }),
            other => debug!(?other, "ignoring unsolicited message"),
        }
        Ok(step)
    }
}
