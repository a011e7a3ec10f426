//! Wardenctl: client side of the Warden broker protocol.
//!
//! [`transaction`] correlates multi-message exchanges; [`client`] drives the
//! handshake, registrations, and answers on top of it without doing I/O.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod transaction;
