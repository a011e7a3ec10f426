//! Shared fakes for broker tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use warden::broker::{ChannelId, Completion, CompletionFn, SendError, Transport};
use warden::wire::build::{self, EventSpec};
use warden::wire::view::{self, View};
use warden::wire::{Message, Verdict};

/// Records every send; channels in `closed` or `full` refuse.
#[derive(Default)]
pub struct Recorder {
    pub sent: Vec<(ChannelId, Message)>,
    pub closed: HashSet<ChannelId>,
    pub full: HashSet<ChannelId>,
}

impl Transport for Recorder {
    fn send(&mut self, channel: ChannelId, msg: &Message) -> Result<(), SendError> {
        if self.closed.contains(&channel) {
            return Err(SendError::Closed);
        }
        if self.full.contains(&channel) {
            return Err(SendError::Full);
        }
        self.sent.push((channel, msg.clone()));
        Ok(())
    }
}

/// A decoded `N_RESULT_*` as seen by one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seen {
    pub token: u64,
    pub you: bool,
    pub uid: u32,
    pub verdict: Verdict,
}

impl Recorder {
    /// Results delivered to `channel`, in order.
    pub fn results(&self, channel: ChannelId) -> Vec<Seen> {
        self.sent
            .iter()
            .filter(|(c, _)| *c == channel)
            .filter_map(|(_, m)| match view::decode(m) {
                Ok(View::Outcome(o)) => Some(Seen {
                    token: o.token,
                    you: o.you,
                    uid: o.uid,
                    verdict: o.verdict,
                }),
                _ => None,
            })
            .collect()
    }

    /// Number of messages delivered to `channel`.
    pub fn count(&self, channel: ChannelId) -> usize {
        self.sent.iter().filter(|(c, _)| *c == channel).count()
    }
}

/// An `N_ASK` for `(uid, rule, subsystem)`.
pub fn ask(token: u64, uid: u32, rule_id: u32, subsystem: u32) -> Message {
    build::ask(&EventSpec {
        token,
        pid: 1234,
        uid,
        rule_id,
        subsystem,
        path: Some(&b"/usr/bin/true"[..]),
        ..EventSpec::default()
    })
    .expect("ask should build")
}

/// An `N_NOTIFY` for `(uid, rule, subsystem)`.
pub fn notify(token: u64, uid: u32, rule_id: u32, subsystem: u32) -> Message {
    build::notify(&EventSpec {
        token,
        uid,
        rule_id,
        subsystem,
        ..EventSpec::default()
    })
    .expect("notify should build")
}

/// Collects every completion handed out.
#[derive(Clone, Default)]
pub struct Completions(Arc<Mutex<Vec<Completion>>>);

impl Completions {
    pub fn callback(&self) -> CompletionFn {
        let sink = Arc::clone(&self.0);
        Box::new(move |c| sink.lock().expect("lock").push(c))
    }

    pub fn len(&self) -> usize {
        self.0.lock().expect("lock").len()
    }

    /// `(verdict, decided_by, notified)` of every completion.
    pub fn outcomes(&self) -> Vec<(Verdict, Option<u32>, usize)> {
        self.0
            .lock()
            .expect("lock")
            .iter()
            .map(|c| (c.verdict, c.decided_by, c.notified))
            .collect()
    }
}

pub fn verdict(code: i32) -> Verdict {
    Verdict::new(code).expect("non-negative verdict")
}
