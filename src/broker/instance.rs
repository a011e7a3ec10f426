//! Event heads and their per-session instances.

use std::collections::BTreeSet;

use crate::wire::{Message, Verdict};

use super::{Filter, HeadId, InstanceId, SessionId};

/// Whether recipients are expected to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Informational; no instances are created.
    Notify,
    /// Gated; the producer waits for a verdict.
    Ask,
}

/// Lifecycle of one instance.
///
/// `Pending -> VerdictGiven -> Done` on the answer path, or
/// `Pending -> Replied -> Done` when a broadcast overtakes the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Sent, nothing heard back.
    Pending,
    /// The session answered; the result is still owed.
    VerdictGiven,
    /// The result went out before this session answered.
    Replied,
    /// Both sides are settled; the instance is freed.
    Done,
}

/// A copy of an event handed to one session.
#[derive(Debug)]
pub(crate) struct Instance {
    pub(crate) token: u64,
    pub(crate) session: SessionId,
    pub(crate) head: HeadId,
    verdict_received: bool,
    replied: bool,
}

impl Instance {
    pub(crate) fn new(token: u64, session: SessionId, head: HeadId) -> Self {
        Self {
            token,
            session,
            head,
            verdict_received: false,
            replied: false,
        }
    }

    pub(crate) fn state(&self) -> InstanceState {
        match (self.verdict_received, self.replied) {
            (false, false) => InstanceState::Pending,
            (true, false) => InstanceState::VerdictGiven,
            (false, true) => InstanceState::Replied,
            (true, true) => InstanceState::Done,
        }
    }

    /// Returns true on the first call only.
    pub(crate) fn give_verdict(&mut self) -> bool {
        !std::mem::replace(&mut self.verdict_received, true)
    }

    pub(crate) fn mark_replied(&mut self) {
        self.replied = true;
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state() == InstanceState::Done
    }
}

/// Who produced the recorded verdict.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Decider {
    pub(crate) instance: InstanceId,
    pub(crate) uid: u32,
}

/// Handed to the completion callback once a head is resolved.
#[derive(Debug)]
pub struct Completion {
    /// The resolved head. Its id is no longer valid.
    pub head: HeadId,
    /// The original event message.
    pub message: Message,
    /// Final verdict, [`Verdict::NO_DECISION`] if nobody answered.
    pub verdict: Verdict,
    /// Uid of the deciding session, `None` when nobody answered.
    pub decided_by: Option<u32>,
    /// Number of instances that received a result.
    pub notified: usize,
}

/// Called exactly once when a head is broadcast.
pub type CompletionFn = Box<dyn FnOnce(Completion) + Send>;

/// One event being distributed.
pub(crate) struct EventHead {
    pub(crate) message: Message,
    pub(crate) token: u64,
    pub(crate) key: Filter,
    pub(crate) kind: EventKind,
    pub(crate) verdict: Option<Verdict>,
    pub(crate) decider: Option<Decider>,
    /// Instances that have not yet delivered a verdict.
    pub(crate) live: usize,
    pub(crate) instances: BTreeSet<InstanceId>,
    pub(crate) on_complete: Option<CompletionFn>,
}

impl std::fmt::Debug for EventHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHead")
            .field("token", &self.token)
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("verdict", &self.verdict)
            .field("live", &self.live)
            .field("instances", &self.instances.len())
            .finish_non_exhaustive()
    }
}
