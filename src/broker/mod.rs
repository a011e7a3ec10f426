//! Notification broker: sessions, registrations, and event fan-out.
//!
//! The broker owns every session, event head, and instance in one arena
//! keyed by opaque ids. It never does I/O itself; outbound messages go
//! through a [`Transport`] supplied by the caller, so the same broker drives
//! the socket daemon and the in-memory tests.
//!
//! An `N_ASK` event becomes a head. Each interested session gets an
//! instance. The first non-delegating answer, or the last instance going
//! away, triggers a broadcast: every remaining instance receives a
//! `N_RESULT_YOU` or `N_RESULT_OTHER`, the head is removed, and its
//! completion callback runs with the owned event.
//!
//! Nothing here runs reentrantly. A send failure during broadcast only flags
//! the session as lost; the owner collects those with
//! [`Broker::take_lost_sessions`] and tears them down afterwards.

mod instance;
mod session;

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::wire::{self, view, Message, Verdict, WireError};

pub use instance::{Completion, CompletionFn, EventKind, InstanceState};
pub use session::{Filter, SUBSYSTEM_STATUS};

use instance::{Decider, EventHead, Instance};
use session::Session;

/// Default bound on remembered settled tokens per session.
pub const DEFAULT_SETTLED_CAPACITY: usize = 1024;

/// Identifies a session inside one broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

/// Identifies an event head inside one broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeadId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct InstanceId(u64);

/// Opaque handle the transport uses to find a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl std::fmt::Display for HeadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Why a message could not be handed to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The peer is gone.
    #[error("channel closed")]
    Closed,
    /// The peer is not draining its queue.
    #[error("outbound queue full")]
    Full,
}

/// Outbound side of the broker.
pub trait Transport {
    /// Queue `msg` for `channel`. Must not block.
    fn send(&mut self, channel: ChannelId, msg: &Message) -> Result<(), SendError>;
}

/// Broker errors. [`BrokerError::errno`] gives the wire code.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// No such session.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    /// No such head, or it was already resolved.
    #[error("unknown event head {0}")]
    UnknownHead(HeadId),
    /// The session may not hold this registration.
    #[error("uid {uid} may not register for {filter:?}")]
    PermissionDenied {
        /// Session uid.
        uid: u32,
        /// Requested filter.
        filter: Filter,
    },
    /// Unregister named a filter the session does not hold.
    #[error("no registration matching {0:?}")]
    NoSuchRegistration(Filter),
    /// The session already has a pending instance with this token.
    #[error("token {0:#x} already pending")]
    DuplicateToken(u64),
    /// The session never received this token, or forgot it.
    #[error("unknown token {0:#x}")]
    UnknownToken(u64),
    /// The session already answered this token.
    #[error("token {0:#x} already answered")]
    AlreadyAnswered(u64),
    /// The first send of a dispatch failed.
    #[error("send failed: {0}")]
    SendFailed(SendError),
    /// The recipient's outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,
    /// The head still has instances.
    #[error("event head {0} has live instances")]
    HeadInUse(HeadId),
    /// The message is not an event.
    #[error("not an event message: {0}")]
    NotAnEvent(&'static str),
    /// The message failed validation.
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl BrokerError {
    /// Negative errno reported to peers.
    pub fn errno(&self) -> i32 {
        let code = match self {
            Self::UnknownSession(_)
            | Self::UnknownHead(_)
            | Self::NoSuchRegistration(_)
            | Self::UnknownToken(_) => wire::ENOENT,
            Self::PermissionDenied { .. } => wire::EPERM,
            Self::DuplicateToken(_) => wire::EEXIST,
            Self::AlreadyAnswered(_) | Self::HeadInUse(_) => wire::EBUSY,
            Self::SendFailed(_) => wire::EPIPE,
            Self::QueueFull => wire::ENOMEM,
            Self::NotAnEvent(_) | Self::Wire(_) => wire::EINVAL,
        };
        code.saturating_neg()
    }
}

impl From<SendError> for BrokerError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::Full => Self::QueueFull,
            SendError::Closed => Self::SendFailed(e),
        }
    }
}

/// Result of offering a head to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A notification was sent.
    Sent,
    /// No registration matched.
    NotInterested,
    /// An instance was created; an answer is expected.
    Queued,
}

/// Result of a successful answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    /// The verdict was final and has been broadcast.
    Decided,
    /// The verdict was recorded; other sessions may still decide.
    Delegated,
    /// The event was already resolved. Nothing changed.
    Duplicate,
}

/// What a teardown cleaned up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Teardown {
    /// Registrations dropped.
    pub registrations: usize,
    /// Pending instances drained.
    pub drained: usize,
    /// Heads that resolved as a consequence.
    pub resolved: usize,
}

/// The broker arena.
#[derive(Debug)]
pub struct Broker {
    sessions: HashMap<SessionId, Session>,
    heads: HashMap<HeadId, EventHead>,
    instances: HashMap<InstanceId, Instance>,
    next_id: u64,
    settled_capacity: usize,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(DEFAULT_SETTLED_CAPACITY)
    }
}

impl Broker {
    /// Empty broker remembering up to `settled_capacity` settled tokens per
    /// session.
    pub fn new(settled_capacity: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            heads: HashMap::new(),
            instances: HashMap::new(),
            next_id: 1,
            settled_capacity,
        }
    }

    fn next(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    // ── Sessions ──

    /// Add a session for a peer with `uid`, reachable through `channel`.
    pub fn open_session(&mut self, uid: u32, channel: ChannelId) -> SessionId {
        let id = SessionId(self.next());
        self.sessions
            .insert(id, Session::new(uid, channel, self.settled_capacity));
        info!(session = %id, uid, channel = channel.0, "session opened");
        id
    }

    /// Add a registration. Zero fields are wildcards.
    ///
    /// Unprivileged sessions may only register for their own uid. The status
    /// subsystem needs a privileged session and wildcard uid and rule.
    pub fn register(&mut self, session: SessionId, filter: Filter) -> Result<(), BrokerError> {
        let sess = self
            .sessions
            .get_mut(&session)
            .ok_or(BrokerError::UnknownSession(session))?;

        let allowed = if filter.subsystem == SUBSYSTEM_STATUS {
            sess.is_privileged() && filter.uid == 0 && filter.rule_id == 0
        } else {
            sess.is_privileged() || filter.uid == sess.uid
        };
        if !allowed {
            warn!(session = %session, uid = sess.uid, ?filter, "registration refused");
            return Err(BrokerError::PermissionDenied {
                uid: sess.uid,
                filter,
            });
        }

        sess.registrations.push(filter);
        debug!(session = %session, ?filter, "registered");
        Ok(())
    }

    /// Remove one registration equal to `filter`.
    pub fn unregister(&mut self, session: SessionId, filter: Filter) -> Result<(), BrokerError> {
        let sess = self
            .sessions
            .get_mut(&session)
            .ok_or(BrokerError::UnknownSession(session))?;
        let pos = sess
            .registrations
            .iter()
            .position(|r| *r == filter)
            .ok_or(BrokerError::NoSuchRegistration(filter))?;
        sess.registrations.remove(pos);
        debug!(session = %session, ?filter, "unregistered");
        Ok(())
    }

    // ── Heads ──

    /// Wrap an `N_NOTIFY` or `N_ASK` message in a head.
    ///
    /// `on_complete` runs once, after broadcast. Notification heads never
    /// broadcast; release them with [`Broker::abandon`].
    pub fn create_head(
        &mut self,
        message: Message,
        on_complete: Option<CompletionFn>,
    ) -> Result<HeadId, BrokerError> {
        let (token, key, kind) = match view::decode(&message)? {
            view::View::Event(ev) => (
                ev.token,
                Filter::new(ev.uid, ev.rule_id, ev.subsystem),
                if ev.needs_verdict {
                    EventKind::Ask
                } else {
                    EventKind::Notify
                },
            ),
            _ => {
                let op = message.opcode().unwrap_or_default();
                return Err(BrokerError::NotAnEvent(wire::opcode::name(op)));
            }
        };

        let id = HeadId(self.next());
        self.heads.insert(
            id,
            EventHead {
                message,
                token,
                key,
                kind,
                verdict: None,
                decider: None,
                live: 0,
                instances: Default::default(),
                on_complete,
            },
        );
        debug!(head = %id, token, ?key, ?kind, "event head created");
        Ok(id)
    }

    /// Attach or replace the completion callback of an unresolved head.
    pub fn set_completion(&mut self, head: HeadId, f: CompletionFn) -> Result<(), BrokerError> {
        let h = self
            .heads
            .get_mut(&head)
            .ok_or(BrokerError::UnknownHead(head))?;
        h.on_complete = Some(f);
        Ok(())
    }

    /// Kind of an unresolved head.
    pub fn head_kind(&self, head: HeadId) -> Option<EventKind> {
        self.heads.get(&head).map(|h| h.kind)
    }

    /// Drop a head that has no instances, returning its message.
    ///
    /// The completion callback is not called.
    pub fn abandon(&mut self, head: HeadId) -> Result<Message, BrokerError> {
        let h = self
            .heads
            .get(&head)
            .ok_or(BrokerError::UnknownHead(head))?;
        if !h.instances.is_empty() {
            return Err(BrokerError::HeadInUse(head));
        }
        let h = self
            .heads
            .remove(&head)
            .ok_or(BrokerError::UnknownHead(head))?;
        debug!(head = %head, "event head abandoned");
        Ok(h.message)
    }

    /// Offer `head` to one session.
    ///
    /// A failed send is returned and leaves no instance behind.
    pub fn dispatch<T: Transport + ?Sized>(
        &mut self,
        tx: &mut T,
        session: SessionId,
        head: HeadId,
    ) -> Result<Dispatch, BrokerError> {
        let sess = self
            .sessions
            .get_mut(&session)
            .ok_or(BrokerError::UnknownSession(session))?;
        let h = self
            .heads
            .get_mut(&head)
            .ok_or(BrokerError::UnknownHead(head))?;

        if !sess.interested(&h.key) {
            return Ok(Dispatch::NotInterested);
        }

        match h.kind {
            EventKind::Notify => {
                tx.send(sess.channel, &h.message)?;
                Ok(Dispatch::Sent)
            }
            EventKind::Ask => {
                if sess.pending.contains_key(&h.token) {
                    return Err(BrokerError::DuplicateToken(h.token));
                }
                tx.send(sess.channel, &h.message)?;

                let id = InstanceId(self.next_id);
                self.next_id = self.next_id.wrapping_add(1);
                self.instances
                    .insert(id, Instance::new(h.token, session, head));
                sess.pending.insert(h.token, id);
                sess.settled.forget(h.token);
                h.instances.insert(id);
                h.live = h.live.saturating_add(1);
                debug!(session = %session, head = %head, token = h.token, "instance queued");
                Ok(Dispatch::Queued)
            }
        }
    }

    /// Offer `head` to every session, in session order.
    ///
    /// Sessions whose send fails are flagged as lost and skipped. Returns
    /// how many sessions received the event.
    pub fn dispatch_all<T: Transport + ?Sized>(
        &mut self,
        tx: &mut T,
        head: HeadId,
    ) -> Result<usize, BrokerError> {
        if !self.heads.contains_key(&head) {
            return Err(BrokerError::UnknownHead(head));
        }
        let mut ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| !s.lost)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();

        let mut delivered = 0usize;
        for id in ids {
            match self.dispatch(tx, id, head) {
                Ok(Dispatch::Sent | Dispatch::Queued) => delivered = delivered.saturating_add(1),
                Ok(Dispatch::NotInterested) => {}
                Err(e @ (BrokerError::SendFailed(_) | BrokerError::QueueFull)) => {
                    warn!(session = %id, head = %head, error = %e, "dispatch failed, session lost");
                    if let Some(sess) = self.sessions.get_mut(&id) {
                        sess.lost = true;
                    }
                }
                Err(e) => warn!(session = %id, head = %head, error = %e, "dispatch skipped"),
            }
        }
        Ok(delivered)
    }

    // ── Answers ──

    /// Record `session`'s verdict for `token`.
    ///
    /// A non-delegating answer, or a delegating one from the last live
    /// instance, resolves the event immediately. A session that already
    /// delegated may answer again before resolution; its new verdict replaces
    /// the recorded one. An answer for a token that was already resolved
    /// returns [`Answer::Duplicate`].
    pub fn answer<T: Transport + ?Sized>(
        &mut self,
        tx: &mut T,
        session: SessionId,
        token: u64,
        verdict: Verdict,
        delegate: bool,
    ) -> Result<Answer, BrokerError> {
        let sess = self
            .sessions
            .get(&session)
            .ok_or(BrokerError::UnknownSession(session))?;
        let Some(&id) = sess.pending.get(&token) else {
            if sess.settled.contains(token) {
                debug!(session = %session, token, "late answer ignored");
                return Ok(Answer::Duplicate);
            }
            return Err(BrokerError::UnknownToken(token));
        };
        let uid = sess.uid;

        let inst = self
            .instances
            .get_mut(&id)
            .ok_or(BrokerError::UnknownToken(token))?;
        // Replied instances are freed with their head, so an answer that
        // crosses the result is caught by the settled set above.
        if matches!(inst.state(), InstanceState::Replied | InstanceState::Done) {
            return Err(BrokerError::AlreadyAnswered(token));
        }
        let first = inst.give_verdict();
        let head_id = inst.head;

        let head = self
            .heads
            .get_mut(&head_id)
            .ok_or(BrokerError::UnknownHead(head_id))?;
        if first {
            head.live = head.live.saturating_sub(1);
        } else {
            debug!(session = %session, head = %head_id, %verdict, "verdict replaced");
        }
        head.verdict = Some(verdict);
        head.decider = Some(Decider { instance: id, uid });

        if delegate && head.live > 0 {
            debug!(session = %session, head = %head_id, %verdict, "verdict delegated");
            return Ok(Answer::Delegated);
        }

        info!(session = %session, head = %head_id, uid, %verdict, delegate, "event decided");
        self.broadcast(tx, head_id);
        Ok(Answer::Decided)
    }

    /// Resolve `head`: send results to every remaining instance, remove it,
    /// and run its completion callback.
    ///
    /// Returns false if the head was already gone.
    pub fn broadcast<T: Transport + ?Sized>(&mut self, tx: &mut T, head: HeadId) -> bool {
        let Some(mut h) = self.heads.remove(&head) else {
            return false;
        };
        let verdict = h.verdict.unwrap_or(Verdict::NO_DECISION);
        let decider = h.decider;
        let decider_uid = decider.map_or(0, |d| d.uid);

        let mut notified = 0usize;
        for id in std::mem::take(&mut h.instances) {
            let Some(mut inst) = self.instances.remove(&id) else {
                continue;
            };
            let you = decider.is_some_and(|d| d.instance == id);
            if let Some(sess) = self.sessions.get_mut(&inst.session) {
                match wire::build::result(inst.token, you, decider_uid, verdict) {
                    Ok(msg) => match tx.send(sess.channel, &msg) {
                        Ok(()) => notified = notified.saturating_add(1),
                        Err(e) => {
                            warn!(session = %inst.session, head = %head, error = %e, "result not delivered, session lost");
                            sess.lost = true;
                        }
                    },
                    Err(e) => warn!(head = %head, error = %e, "could not build result"),
                }
                sess.pending.remove(&inst.token);
                sess.settled.insert(inst.token);
            }
            inst.mark_replied();
            inst.give_verdict();
            debug_assert!(inst.is_done());
        }
        h.live = 0;

        debug!(head = %head, %verdict, notified, "event broadcast");
        if let Some(done) = h.on_complete.take() {
            done(Completion {
                head,
                message: h.message,
                verdict,
                decided_by: decider.map(|d| d.uid),
                notified,
            });
        }
        true
    }

    // ── Teardown ──

    /// Remove `session`, draining its pending instances.
    ///
    /// Heads left with no live instance are broadcast; if nobody ever
    /// answered they resolve to [`Verdict::NO_DECISION`].
    pub fn teardown<T: Transport + ?Sized>(
        &mut self,
        tx: &mut T,
        session: SessionId,
    ) -> Result<Teardown, BrokerError> {
        let sess = self
            .sessions
            .remove(&session)
            .ok_or(BrokerError::UnknownSession(session))?;

        let mut pending: Vec<InstanceId> = sess.pending.values().copied().collect();
        pending.sort_unstable();

        let mut report = Teardown {
            registrations: sess.registrations.len(),
            ..Teardown::default()
        };
        let mut ready = Vec::new();
        for id in pending {
            let Some(mut inst) = self.instances.remove(&id) else {
                continue;
            };
            report.drained = report.drained.saturating_add(1);
            let Some(head) = self.heads.get_mut(&inst.head) else {
                continue;
            };
            head.instances.remove(&id);
            if inst.give_verdict() {
                head.live = head.live.saturating_sub(1);
                if head.live == 0 && head.verdict.is_none() {
                    head.verdict = Some(Verdict::NO_DECISION);
                }
            }
            inst.mark_replied();
            if head.live == 0 {
                ready.push(inst.head);
            }
        }

        for head in ready {
            if self.broadcast(tx, head) {
                report.resolved = report.resolved.saturating_add(1);
            }
        }

        info!(
            session = %session,
            uid = sess.uid,
            connected_at = %sess.connected_at,
            registrations = report.registrations,
            drained = report.drained,
            resolved = report.resolved,
            "session torn down"
        );
        Ok(report)
    }

    /// Sessions flagged lost since they were opened, in id order.
    pub fn take_lost_sessions(&mut self) -> Vec<SessionId> {
        let mut lost: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.lost)
            .map(|(id, _)| *id)
            .collect();
        lost.sort_unstable();
        lost
    }

    // ── Introspection ──

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of unresolved heads.
    pub fn head_count(&self) -> usize {
        self.heads.len()
    }

    /// Number of live instance records.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Uid of a session.
    pub fn session_uid(&self, session: SessionId) -> Option<u32> {
        self.sessions.get(&session).map(|s| s.uid)
    }

    /// Registrations held by a session.
    pub fn registrations(&self, session: SessionId) -> Option<&[Filter]> {
        self.sessions
            .get(&session)
            .map(|s| s.registrations.as_slice())
    }

    /// Whether any of the session's registrations selects `key`.
    pub fn interested(&self, session: SessionId, key: &Filter) -> bool {
        self.sessions
            .get(&session)
            .is_some_and(|s| s.interested(key))
    }

    /// State of the session's instance for `token`, if one is pending.
    pub fn instance_state(&self, session: SessionId, token: u64) -> Option<InstanceState> {
        let id = self.sessions.get(&session)?.pending.get(&token)?;
        self.instances.get(id).map(Instance::state)
    }

    /// Live counter of an unresolved head.
    pub fn live_count(&self, head: HeadId) -> Option<usize> {
        self.heads.get(&head).map(|h| h.live)
    }

    /// Verdict recorded so far for an unresolved head.
    pub fn recorded_verdict(&self, head: HeadId) -> Option<Verdict> {
        self.heads.get(&head).and_then(|h| h.verdict)
    }
}
