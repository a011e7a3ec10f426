//! Client-side correlation of multi-message exchanges.
//!
//! A [`Transaction`] waits for messages with a given call token, direction,
//! and opcode. Each accepted message runs the stage hook, which may advance
//! the stage ([`Control::progress`]) or finish the exchange
//! ([`Control::done`]). The finish callback runs exactly once.

use std::ops::BitOr;

use thiserror::Error;
use warden::wire::{view, Message};

/// Transaction flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u32);

impl Flags {
    /// We sent the first message; replies arrive with `is_self`.
    pub const INIT_SELF: Flags = Flags(1);
    /// The peer sent the first message.
    pub const INIT_PEER: Flags = Flags(1 << 1);
    /// Keep every processed message.
    pub const RETAIN_ALL: Flags = Flags(1 << 2);
    /// Keep only the latest processed message.
    pub const RETAIN_FINAL: Flags = Flags(1 << 3);
    /// Remove from the owning set and hand back on completion.
    pub const DEQUEUE: Flags = Flags(1 << 4);
    /// Remove from the owning set and drop on completion.
    pub const DESTROY: Flags = Flags(1 << 5);

    /// No flags.
    pub const fn empty() -> Self {
        Flags(0)
    }

    /// True iff every bit of `other` is set.
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    const fn intersects(self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// Transaction errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// Two mutually exclusive flags were combined.
    #[error("conflicting transaction flags {0:?}")]
    ConflictingFlags(Flags),
    /// Neither `INIT_SELF` nor `INIT_PEER` was given.
    #[error("transaction flags name no direction")]
    NoDirection,
    /// The transaction already finished.
    #[error("transaction {0:#x} already finished")]
    Finished(u64),
}

/// Where a transaction stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting at the given stage.
    Active(u32),
    /// Finished with a result code.
    Done(i32),
}

/// Stage state handed to the hook.
#[derive(Debug)]
pub struct Control {
    token: u64,
    flags: Flags,
    accepted: Vec<u32>,
    state: State,
}

impl Control {
    /// Call token.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Current stage, or `None` once done.
    pub fn stage(&self) -> Option<u32> {
        match self.state {
            State::Active(stage) => Some(stage),
            State::Done(_) => None,
        }
    }

    /// Advance to the next stage, now accepting `opcodes`. Ignored once done.
    pub fn progress(&mut self, opcodes: &[u32]) {
        if let State::Active(stage) = self.state {
            self.state = State::Active(stage.saturating_add(1));
            self.accepted = opcodes.to_vec();
        }
    }

    /// Finish with `code`. Later calls keep the first code.
    pub fn done(&mut self, code: i32) {
        if matches!(self.state, State::Active(_)) {
            self.state = State::Done(code);
        }
    }
}

/// Stage hook.
pub type ProcessFn = Box<dyn FnMut(&mut Control, &Message) + Send>;

/// Completion callback. Receives the finished transaction.
pub type FinishFn = Box<dyn FnOnce(&Transaction) + Send>;

/// One tracked exchange.
pub struct Transaction {
    control: Control,
    process_fn: Option<ProcessFn>,
    finish_fn: Option<FinishFn>,
    retained: Vec<Message>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("control", &self.control)
            .field("retained", &self.retained.len())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// Create a transaction at stage 0 accepting `opcodes`.
    ///
    /// Without a `process_fn` the first accepted message finishes it with
    /// code 0.
    pub fn create(
        token: u64,
        flags: Flags,
        opcodes: &[u32],
        process_fn: Option<ProcessFn>,
        finish_fn: Option<FinishFn>,
    ) -> Result<Self, TransactionError> {
        let direction = Flags::INIT_SELF | Flags::INIT_PEER;
        let retention = Flags::RETAIN_ALL | Flags::RETAIN_FINAL;
        if flags.contains(direction) {
            return Err(TransactionError::ConflictingFlags(direction));
        }
        if flags.contains(retention) {
            return Err(TransactionError::ConflictingFlags(retention));
        }
        if !flags.intersects(direction) {
            return Err(TransactionError::NoDirection);
        }

        Ok(Self {
            control: Control {
                token,
                flags,
                accepted: opcodes.to_vec(),
                state: State::Active(0),
            },
            process_fn,
            finish_fn,
            retained: Vec::new(),
        })
    }

    /// Call token.
    pub fn token(&self) -> u64 {
        self.control.token
    }

    /// Flags given at creation.
    pub fn flags(&self) -> Flags {
        self.control.flags
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.control.state
    }

    /// Result code once done.
    pub fn result(&self) -> Option<i32> {
        match self.control.state {
            State::Done(code) => Some(code),
            State::Active(_) => None,
        }
    }

    /// Messages kept under `RETAIN_ALL` or `RETAIN_FINAL`.
    pub fn retained(&self) -> &[Message] {
        &self.retained
    }

    /// True iff active, `token` matches, the direction matches, and the
    /// current stage accepts `opcode`.
    pub fn matches(&self, token: u64, is_self: bool, opcode: u32) -> bool {
        let direction = if is_self {
            Flags::INIT_SELF
        } else {
            Flags::INIT_PEER
        };
        matches!(self.control.state, State::Active(_))
            && self.control.token == token
            && self.control.flags.contains(direction)
            && self.control.accepted.contains(&opcode)
    }

    /// Run the stage hook on `msg` and apply retention.
    ///
    /// Returns true when this call finished the transaction; the finish
    /// callback has then run.
    pub fn process(&mut self, msg: Message) -> Result<bool, TransactionError> {
        if !matches!(self.control.state, State::Active(_)) {
            return Err(TransactionError::Finished(self.control.token));
        }

        match self.process_fn.as_mut() {
            Some(hook) => hook(&mut self.control, &msg),
            None => self.control.done(0),
        }

        if self.control.flags.contains(Flags::RETAIN_ALL) {
            self.retained.push(msg);
        } else if self.control.flags.contains(Flags::RETAIN_FINAL) {
            self.retained.clear();
            self.retained.push(msg);
        }

        if matches!(self.control.state, State::Done(_)) {
            if let Some(finish) = self.finish_fn.take() {
                finish(self);
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Advance to the next stage.
    pub fn progress(&mut self, opcodes: &[u32]) {
        self.control.progress(opcodes);
    }

    /// Finish with `code` without running the finish callback.
    pub fn done(&mut self, code: i32) {
        self.control.done(code);
    }
}

/// Outcome of [`TransactionSet::deliver`].
#[derive(Debug)]
pub enum Delivery {
    /// No transaction wanted the message.
    Unmatched(Message),
    /// A transaction took it and is still active.
    Pending,
    /// A transaction finished. Carries it back if it was `DEQUEUE`.
    Finished(Option<Transaction>),
}

/// Owning collection of transactions.
#[derive(Debug, Default)]
pub struct TransactionSet {
    items: Vec<Transaction>,
}

impl TransactionSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `tx`.
    pub fn insert(&mut self, tx: Transaction) {
        self.items.push(tx);
    }

    /// Number of tracked transactions.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True iff nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Route `msg` to the first matching transaction.
    ///
    /// Messages without a token (`C_HELLO`) are matched as token 0.
    pub fn deliver(&mut self, msg: Message, is_self: bool) -> Delivery {
        let Some(opcode) = msg.opcode() else {
            return Delivery::Unmatched(msg);
        };
        let token = view::token(&msg).unwrap_or(0);
        let Some(idx) = self
            .items
            .iter()
            .position(|t| t.matches(token, is_self, opcode))
        else {
            return Delivery::Unmatched(msg);
        };
        let Some(tx) = self.items.get_mut(idx) else {
            return Delivery::Unmatched(msg);
        };

        match tx.process(msg) {
            Ok(true) => {
                let flags = tx.flags();
                if flags.contains(Flags::DEQUEUE) {
                    Delivery::Finished(Some(self.items.remove(idx)))
                } else {
                    if flags.contains(Flags::DESTROY) {
                        self.items.remove(idx);
                    }
                    Delivery::Finished(None)
                }
            }
            Ok(false) | Err(_) => Delivery::Pending,
        }
    }

    /// Remove finished transactions left in the set.
    pub fn take_finished(&mut self) -> Vec<Transaction> {
        let (done, active): (Vec<_>, Vec<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|t| matches!(t.state(), State::Done(_)));
        self.items = active;
        done
    }
}
