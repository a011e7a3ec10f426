//! Per-connection subscription state.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};

use super::{ChannelId, InstanceId};

/// Subsystem reserved for daemon status notifications.
///
/// Only privileged sessions may subscribe, and only with a wildcard uid and
/// rule. Status events never match a wildcard subsystem.
pub const SUBSYSTEM_STATUS: u32 = 0xff;

/// Filter tuple for registrations, and the concrete key of an event.
///
/// In a registration a zero field matches any value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Filter {
    /// Uid of the process that triggered the event.
    pub uid: u32,
    /// Policy rule that fired.
    pub rule_id: u32,
    /// Originating subsystem.
    pub subsystem: u32,
}

impl Filter {
    /// Build a filter tuple.
    pub fn new(uid: u32, rule_id: u32, subsystem: u32) -> Self {
        Self {
            uid,
            rule_id,
            subsystem,
        }
    }

    /// True iff this registration selects the event `key`.
    pub fn matches(&self, key: &Filter) -> bool {
        if key.subsystem == SUBSYSTEM_STATUS {
            return self.subsystem == SUBSYSTEM_STATUS;
        }
        field_matches(self.uid, key.uid)
            && field_matches(self.rule_id, key.rule_id)
            && field_matches(self.subsystem, key.subsystem)
    }
}

fn field_matches(filter: u32, value: u32) -> bool {
    filter == 0 || filter == value
}

/// Tokens whose instances completed recently, so a late answer can be
/// acknowledged as a duplicate instead of rejected as unknown.
#[derive(Debug)]
pub(crate) struct SettledTokens {
    order: VecDeque<u64>,
    set: HashSet<u64>,
    capacity: usize,
}

impl SettledTokens {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity,
        }
    }

    pub(crate) fn insert(&mut self, token: u64) {
        if self.capacity == 0 || !self.set.insert(token) {
            return;
        }
        self.order.push_back(token);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
    }

    pub(crate) fn contains(&self, token: u64) -> bool {
        self.set.contains(&token)
    }

    /// A token reused for a fresh event is no longer settled.
    pub(crate) fn forget(&mut self, token: u64) {
        if self.set.remove(&token) {
            self.order.retain(|t| *t != token);
        }
    }
}

/// One connected peer as seen by the broker.
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) uid: u32,
    pub(crate) channel: ChannelId,
    pub(crate) connected_at: DateTime<Utc>,
    pub(crate) registrations: Vec<Filter>,
    /// Pending instances by event token.
    pub(crate) pending: HashMap<u64, InstanceId>,
    pub(crate) settled: SettledTokens,
    /// Set when a send to this session failed; the owner tears it down.
    pub(crate) lost: bool,
}

impl Session {
    pub(crate) fn new(uid: u32, channel: ChannelId, settled_capacity: usize) -> Self {
        Self {
            uid,
            channel,
            connected_at: Utc::now(),
            registrations: Vec::new(),
            pending: HashMap::new(),
            settled: SettledTokens::new(settled_capacity),
            lost: false,
        }
    }

    pub(crate) fn is_privileged(&self) -> bool {
        self.uid == 0
    }

    pub(crate) fn interested(&self, key: &Filter) -> bool {
        self.registrations.iter().any(|r| r.matches(key))
    }
}
