//! Warden: notification broker and wire codec for a security policy daemon.
//!
//! The kernel side hands gated events to the daemon; connected clients
//! subscribe with filter tuples, receive copies, and answer. The first
//! final answer wins and every recipient learns the outcome.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;

pub mod broker;
pub mod daemon;
pub mod wire;
