//! Daemon behaviour over a real unix socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use warden::config::DaemonConfig;
use warden::daemon::frame::{read_frame, write_frame};
use warden::daemon::{bind, Daemon, DaemonHandle};
use warden::wire::build::{self, EventSpec};
use warden::wire::view::{self, View};
use warden::wire::{self, opcode, Message, Verdict, MAX_MESSAGE_LEN, PROTOCOL_VERSION};

const WAIT: Duration = Duration::from_secs(5);
const RULE: u32 = 7;

struct Running {
    _dir: tempfile::TempDir,
    socket: PathBuf,
    handle: DaemonHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

fn start(default_verdict: i32) -> Running {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let socket = dir.path().join("run").join("warden.sock");
    let listener = bind(&socket).expect("should bind");
    let daemon = Daemon::new(DaemonConfig {
        socket_path: socket.clone(),
        default_verdict,
        ..DaemonConfig::default()
    });
    let handle = daemon.handle();
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(daemon.run(listener, rx));
    Running {
        _dir: dir,
        socket,
        handle,
        shutdown,
        task,
    }
}

struct Peer {
    uid: u32,
    rd: OwnedReadHalf,
    wr: OwnedWriteHalf,
}

impl Peer {
    async fn connect(socket: &Path) -> Self {
        let stream = UnixStream::connect(socket).await.expect("should connect");
        let uid = stream.peer_cred().expect("peer credentials").uid();
        let (rd, wr) = stream.into_split();
        Self { uid, rd, wr }
    }

    /// Connect and complete the version handshake.
    async fn ready(socket: &Path) -> Self {
        let mut peer = Self::connect(socket).await;
        let hello = peer.recv().await.expect("hello");
        assert!(matches!(
            view::decode(&hello),
            Ok(View::Hello(h)) if h.version == PROTOCOL_VERSION
        ));
        peer.send(&build::versel(1, PROTOCOL_VERSION).expect("versel"))
            .await;
        assert_eq!(peer.reply().await, (1, opcode::C_VERSEL, 0));
        peer
    }

    async fn send(&mut self, msg: &Message) {
        write_frame(&mut self.wr, msg).await.expect("should write");
    }

    async fn recv(&mut self) -> Option<Message> {
        timeout(WAIT, read_frame(&mut self.rd, MAX_MESSAGE_LEN))
            .await
            .expect("frame should arrive in time")
            .expect("frame should be readable")
    }

    async fn reply(&mut self) -> (u64, u32, i32) {
        let msg = self.recv().await.expect("reply");
        match view::decode(&msg) {
            Ok(View::Reply(r)) => (r.token, r.opcode, r.error),
            other => panic!("expected C_REPLY, got {other:?}"),
        }
    }

    async fn register(&mut self, token: u64, rule_id: u32) {
        self.send(&build::register(token, self.uid, rule_id, 0, Some("test")).expect("register"))
            .await;
        assert_eq!(self.reply().await, (token, opcode::N_REGISTER, 0));
    }
}

fn ask(token: u64, uid: u32, rule_id: u32) -> Message {
    build::ask(&EventSpec {
        token,
        pid: 99,
        uid,
        rule_id,
        subsystem: 1,
        path: Some(&b"/usr/bin/env"[..]),
        ..EventSpec::default()
    })
    .expect("ask")
}

async fn stop(running: Running) {
    running.shutdown.send(true).expect("daemon alive");
    timeout(WAIT, running.task)
        .await
        .expect("daemon should stop in time")
        .expect("daemon task should not panic");
}

#[tokio::test]
async fn answer_resolves_the_gate() {
    let running = start(1);
    let mut peer = Peer::ready(&running.socket).await;
    peer.register(2, RULE).await;

    let verdict = running
        .handle
        .submit(ask(50, peer.uid, RULE))
        .await
        .expect("submit");

    let event = peer.recv().await.expect("ask");
    match view::decode(&event) {
        Ok(View::Event(ev)) => {
            assert!(ev.needs_verdict);
            assert_eq!(ev.token, 50);
            assert_eq!(ev.path, Some(&b"/usr/bin/env"[..]));
        }
        other => panic!("expected event, got {other:?}"),
    }

    let four = Verdict::new(4).expect("verdict");
    peer.send(&build::answer(50, four, false).expect("answer"))
        .await;
    let result = peer.recv().await.expect("result");
    assert!(matches!(
        view::decode(&result),
        Ok(View::Outcome(o)) if o.you && o.token == 50 && o.verdict == four
    ));
    assert_eq!(timeout(WAIT, verdict).await.expect("in time"), Ok(four));

    stop(running).await;
}

#[tokio::test]
async fn uninterested_events_get_defaults() {
    let running = start(6);
    let mut peer = Peer::ready(&running.socket).await;
    peer.register(2, RULE).await;

    let verdict = running
        .handle
        .ask(ask(51, peer.uid, RULE + 1))
        .await
        .expect("ask");
    assert_eq!(verdict.code(), 6);

    let note = build::notify(&EventSpec {
        token: 52,
        uid: peer.uid,
        rule_id: RULE,
        ..EventSpec::default()
    })
    .expect("notify");
    assert_eq!(
        running.handle.ask(note).await.expect("notify"),
        Verdict::ALLOW
    );
    let seen = peer.recv().await.expect("notification");
    assert_eq!(seen.opcode(), Some(opcode::N_NOTIFY));

    stop(running).await;
}

#[tokio::test]
async fn protocol_errors_are_replied() {
    let running = start(1);
    let mut peer = Peer::ready(&running.socket).await;

    peer.send(&build::unregister(3, peer.uid, RULE, 0).expect("unregister"))
        .await;
    assert_eq!(
        peer.reply().await,
        (3, opcode::N_UNREGISTER, -wire::ENOENT)
    );

    peer.send(&build::answer(404, Verdict::ALLOW, false).expect("answer"))
        .await;
    assert_eq!(peer.reply().await, (404, opcode::N_ANSWER, -wire::ENOENT));

    peer.send(&build::status(5, 1, 1).expect("status")).await;
    assert_eq!(peer.reply().await, (5, opcode::N_STATUS, -wire::EINVAL));

    // A corrupted trailer is dropped silently; the next request still works.
    let mut bytes = build::close(6).expect("close").into_bytes();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x55;
    peer.send(&Message::from_bytes(bytes)).await;

    peer.send(&build::close(7).expect("close")).await;
    assert_eq!(peer.reply().await, (7, opcode::C_CLOSE, 0));
    assert!(peer.recv().await.is_none());

    stop(running).await;
}

#[tokio::test]
async fn handshake_rejects_bad_versions_and_early_requests() {
    let running = start(1);

    let mut old = Peer::connect(&running.socket).await;
    old.recv().await.expect("hello");
    old.send(&build::versel(1, 1).expect("versel")).await;
    assert_eq!(old.reply().await, (1, opcode::C_VERSEL, -wire::EPROTO));
    assert!(old.recv().await.is_none());

    let mut eager = Peer::connect(&running.socket).await;
    eager.recv().await.expect("hello");
    eager
        .send(&build::register(9, eager.uid, 0, 0, None).expect("register"))
        .await;
    assert_eq!(eager.reply().await, (9, opcode::N_REGISTER, -wire::EPROTO));
    assert!(eager.recv().await.is_none());

    stop(running).await;
}

#[tokio::test]
async fn departing_client_resolves_with_no_decision() {
    let running = start(1);
    let mut peer = Peer::ready(&running.socket).await;
    peer.register(2, RULE).await;

    let verdict = running
        .handle
        .submit(ask(60, peer.uid, RULE))
        .await
        .expect("submit");
    peer.recv().await.expect("ask");
    drop(peer);

    assert_eq!(
        timeout(WAIT, verdict).await.expect("in time"),
        Ok(Verdict::NO_DECISION)
    );
    stop(running).await;
}

#[tokio::test]
async fn shutdown_resolves_pending_events() {
    let running = start(1);
    let mut peer = Peer::ready(&running.socket).await;
    peer.register(2, RULE).await;

    let verdict = running
        .handle
        .submit(ask(70, peer.uid, RULE))
        .await
        .expect("submit");
    peer.recv().await.expect("ask");

    let handle = running.handle.clone();
    stop(running).await;
    assert_eq!(
        timeout(WAIT, verdict).await.expect("in time"),
        Ok(Verdict::NO_DECISION)
    );
    assert!(handle.ask(ask(71, 0, RULE)).await.is_err());
}
