//! Binary wire format shared by the daemon and its clients.
//!
//! Every message is laid out as
//!
//! ```text
//! [length:u32 BE][opcode:u32 BE][opcode-specific fields ...][checksum:4]
//! ```
//!
//! `length` covers the whole message including itself and the trailing
//! checksum. The checksum is the first four bytes of the SHA-256 digest of
//! every byte before it. Multi-byte integers are big-endian.
//!
//! Inbound bytes become a [`Message`] without any interpretation. Nothing
//! reads typed fields from it until [`verify`] has proven the layout, and
//! even then every accessor is bounds-checked and returns `Option`.

pub mod build;
pub mod message;
pub mod verify;
pub mod view;

use serde::Serialize;
use thiserror::Error;

pub use message::Message;
pub use verify::{check, is_valid, verify};

/// Width of the trailing integrity checksum.
pub const CHECKSUM_LEN: usize = 4;

/// Length prefix plus opcode.
pub const HEADER_LEN: usize = 8;

/// Smallest possible message: header followed directly by the checksum.
pub const MIN_MESSAGE_LEN: usize = HEADER_LEN + CHECKSUM_LEN;

/// Largest total message length accepted anywhere.
pub const MAX_MESSAGE_LEN: usize = 100_000;

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 3;

/// Oldest protocol version still accepted during the handshake.
pub const PROTOCOL_MIN_VERSION: u32 = 2;

/// Operation not permitted.
pub const EPERM: i32 = 1;
/// No such entry.
pub const ENOENT: i32 = 2;
/// Out of memory.
pub const ENOMEM: i32 = 12;
/// Resource busy.
pub const EBUSY: i32 = 16;
/// Entry already exists.
pub const EEXIST: i32 = 17;
/// Invalid argument.
pub const EINVAL: i32 = 22;
/// Broken pipe.
pub const EPIPE: i32 = 32;
/// Protocol error.
pub const EPROTO: i32 = 71;

/// Message opcodes.
pub mod opcode {
    /// Server greeting with supported version range.
    pub const C_HELLO: u32 = 0x1000;
    /// Client version selection.
    pub const C_VERSEL: u32 = 0x1001;
    /// Client requests authentication.
    pub const C_AUTH: u32 = 0x1002;
    /// Authentication challenge carrying challenge and key-id blobs.
    pub const C_AUTH_CHALLENGE: u32 = 0x1003;
    /// Generic reply carrying a result code.
    pub const C_REPLY: u32 = 0x1004;
    /// Orderly close request.
    pub const C_CLOSE: u32 = 0x1005;

    /// Subscribe to events matching a filter tuple.
    pub const N_REGISTER: u32 = 0x2000;
    /// Drop a previously registered filter tuple.
    pub const N_UNREGISTER: u32 = 0x2001;
    /// Informational event; no verdict expected.
    pub const N_NOTIFY: u32 = 0x2002;
    /// Event that needs a verdict.
    pub const N_ASK: u32 = 0x2003;
    /// Client verdict for an `N_ASK`, optionally delegated.
    pub const N_ANSWER: u32 = 0x2004;
    /// Final verdict, sent to the session that decided.
    pub const N_RESULT_YOU: u32 = 0x2005;
    /// Final verdict, sent to every other recipient.
    pub const N_RESULT_OTHER: u32 = 0x2006;
    /// Status subsystem key/value notification.
    pub const N_STATUS: u32 = 0x2007;

    /// Checksum lookup or update for a single path.
    pub const P_CSUM_REQUEST: u32 = 0x3000;
    /// List of NUL-terminated strings.
    pub const P_STRING_LIST: u32 = 0x3001;
    /// Checksum lookup or update for several paths at once.
    pub const P_CSUM_MULTI_REQUEST: u32 = 0x3002;
    /// Per-record answers to a multi-checksum request.
    pub const P_CSUM_MULTI_REPLY: u32 = 0x3003;

    /// First-generation policy change notice. Accepted, never produced.
    pub const RETIRED_POLICY_CHANGE_V1: u32 = 0x2100;
    /// First-generation log notice. Accepted, never produced.
    pub const RETIRED_LOG_NOTIFY_V1: u32 = 0x2101;
    /// First-generation statistics dump. Accepted, never produced.
    pub const RETIRED_STAT_V1: u32 = 0x3100;

    /// Human-readable opcode name for logs.
    pub fn name(op: u32) -> &'static str {
        match op {
            C_HELLO => "C_HELLO",
            C_VERSEL => "C_VERSEL",
            C_AUTH => "C_AUTH",
            C_AUTH_CHALLENGE => "C_AUTH_CHALLENGE",
            C_REPLY => "C_REPLY",
            C_CLOSE => "C_CLOSE",
            N_REGISTER => "N_REGISTER",
            N_UNREGISTER => "N_UNREGISTER",
            N_NOTIFY => "N_NOTIFY",
            N_ASK => "N_ASK",
            N_ANSWER => "N_ANSWER",
            N_RESULT_YOU => "N_RESULT_YOU",
            N_RESULT_OTHER => "N_RESULT_OTHER",
            N_STATUS => "N_STATUS",
            P_CSUM_REQUEST => "P_CSUM_REQUEST",
            P_STRING_LIST => "P_STRING_LIST",
            P_CSUM_MULTI_REQUEST => "P_CSUM_MULTI_REQUEST",
            P_CSUM_MULTI_REPLY => "P_CSUM_MULTI_REPLY",
            RETIRED_POLICY_CHANGE_V1 | RETIRED_LOG_NOTIFY_V1 | RETIRED_STAT_V1 => "RETIRED",
            _ => "UNKNOWN",
        }
    }
}

/// A fixed-size field at a fixed offset from the start of a message.
///
/// Flexible trailing regions are described with `size == 0`; their extent
/// comes from length sub-fields elsewhere in the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Byte offset from the start of the message.
    pub offset: usize,
    /// Width in bytes.
    pub size: usize,
}

impl Field {
    /// Describe a field.
    pub const fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    /// One past the last byte of the field.
    pub const fn end(self) -> usize {
        self.offset.saturating_add(self.size)
    }
}

/// Field offsets for each opcode.
pub mod layout {
    use super::Field;

    /// Common header.
    pub mod header {
        use super::Field;
        /// Total length.
        pub const LENGTH: Field = Field::new(0, 4);
        /// Opcode.
        pub const OPCODE: Field = Field::new(4, 4);
    }

    /// `C_HELLO`.
    pub mod hello {
        use super::Field;
        /// Highest version the server speaks.
        pub const VERSION: Field = Field::new(8, 4);
        /// Lowest version the server accepts.
        pub const MIN_VERSION: Field = Field::new(12, 4);
        /// End of the fixed body.
        pub const END: usize = 16;
    }

    /// `C_VERSEL`.
    pub mod versel {
        use super::Field;
        /// Call token.
        pub const TOKEN: Field = Field::new(8, 8);
        /// Selected version.
        pub const VERSION: Field = Field::new(16, 4);
        /// End of the fixed body.
        pub const END: usize = 20;
    }

    /// `C_AUTH`.
    pub mod auth {
        use super::Field;
        /// Call token.
        pub const TOKEN: Field = Field::new(8, 8);
        /// Authentication method.
        pub const AUTH_TYPE: Field = Field::new(16, 4);
        /// End of the fixed body.
        pub const END: usize = 20;
    }

    /// `C_AUTH_CHALLENGE`.
    pub mod auth_challenge {
        use super::Field;
        /// Call token.
        pub const TOKEN: Field = Field::new(8, 8);
        /// Authentication method.
        pub const AUTH_TYPE: Field = Field::new(16, 4);
        /// Length of the challenge blob.
        pub const CHALLENGE_LEN: Field = Field::new(20, 4);
        /// Length of the key-id blob following the challenge.
        pub const ID_LEN: Field = Field::new(24, 4);
        /// Start of the challenge and key-id blobs.
        pub const PAYLOAD: Field = Field::new(28, 0);
    }

    /// `C_REPLY`.
    pub mod reply {
        use super::Field;
        /// Token of the request being answered.
        pub const TOKEN: Field = Field::new(8, 8);
        /// Opcode of the request being answered.
        pub const OPCODE: Field = Field::new(16, 4);
        /// Zero on success, negative errno otherwise.
        pub const ERROR: Field = Field::new(20, 4);
        /// End of the fixed body.
        pub const END: usize = 24;
    }

    /// `C_CLOSE`.
    pub mod close {
        use super::Field;
        /// Call token.
        pub const TOKEN: Field = Field::new(8, 8);
        /// End of the fixed body.
        pub const END: usize = 16;
    }

    /// `N_REGISTER` and `N_UNREGISTER`.
    pub mod register {
        use super::Field;
        /// Call token.
        pub const TOKEN: Field = Field::new(8, 8);
        /// Uid filter, zero matches any.
        pub const UID: Field = Field::new(16, 4);
        /// Rule filter, zero matches any.
        pub const RULE_ID: Field = Field::new(20, 4);
        /// Subsystem filter, zero matches any.
        pub const SUBSYSTEM: Field = Field::new(24, 4);
        /// Length of the optional label region, including its NUL.
        pub const LABEL_LEN: Field = Field::new(28, 4);
        /// Start of the label region.
        pub const LABEL: Field = Field::new(32, 0);
    }

    /// `N_NOTIFY` and `N_ASK`.
    pub mod event {
        use super::Field;
        /// Event token.
        pub const TOKEN: Field = Field::new(8, 8);
        /// Process that triggered the event.
        pub const PID: Field = Field::new(16, 4);
        /// Uid of that process.
        pub const UID: Field = Field::new(20, 4);
        /// Matching rule.
        pub const RULE_ID: Field = Field::new(24, 4);
        /// Originating subsystem.
        pub const SUBSYSTEM: Field = Field::new(28, 4);
        /// Display priority.
        pub const PRIORITY: Field = Field::new(32, 4);
        /// Offset of the checksum region inside the payload.
        pub const CSUM_OFF: Field = Field::new(36, 4);
        /// Length of the checksum region.
        pub const CSUM_LEN: Field = Field::new(40, 4);
        /// Offset of the path region inside the payload.
        pub const PATH_OFF: Field = Field::new(44, 4);
        /// Length of the path region, including its NUL.
        pub const PATH_LEN: Field = Field::new(48, 4);
        /// Offset of the subsystem-specific event blob inside the payload.
        pub const EV_OFF: Field = Field::new(52, 4);
        /// Length of the event blob.
        pub const EV_LEN: Field = Field::new(56, 4);
        /// Start of the payload.
        pub const PAYLOAD: Field = Field::new(60, 0);
    }

    /// `N_ANSWER`.
    pub mod answer {
        use super::Field;
        /// Event token.
        pub const TOKEN: Field = Field::new(8, 8);
        /// Verdict, non-negative.
        pub const VERDICT: Field = Field::new(16, 4);
        /// Non-zero to delegate to the remaining sessions.
        pub const DELEGATE: Field = Field::new(20, 4);
        /// End of the fixed body.
        pub const END: usize = 24;
    }

    /// `N_RESULT_YOU` and `N_RESULT_OTHER`.
    pub mod result {
        use super::Field;
        /// Event token.
        pub const TOKEN: Field = Field::new(8, 8);
        /// Uid of the deciding session.
        pub const UID: Field = Field::new(16, 4);
        /// Final verdict, non-negative.
        pub const VERDICT: Field = Field::new(20, 4);
        /// End of the fixed body.
        pub const END: usize = 24;
    }

    /// `N_STATUS`.
    pub mod status {
        use super::Field;
        /// Call token.
        pub const TOKEN: Field = Field::new(8, 8);
        /// Status key.
        pub const KEY: Field = Field::new(16, 4);
        /// Status value.
        pub const VALUE: Field = Field::new(20, 4);
        /// End of the fixed body.
        pub const END: usize = 24;
    }

    /// `P_CSUM_REQUEST`.
    pub mod csum_request {
        use super::Field;
        /// Call token.
        pub const TOKEN: Field = Field::new(8, 8);
        /// Requested checksum operation.
        pub const OPERATION: Field = Field::new(16, 4);
        /// Uid whose checksum store is addressed.
        pub const UID: Field = Field::new(20, 4);
        /// Length of the key-id region.
        pub const ID_LEN: Field = Field::new(24, 4);
        /// Length of the path region, including its NUL.
        pub const PATH_LEN: Field = Field::new(28, 4);
        /// Start of key id followed by path.
        pub const PAYLOAD: Field = Field::new(32, 0);
    }

    /// `P_STRING_LIST`.
    pub mod string_list {
        use super::Field;
        /// Call token.
        pub const TOKEN: Field = Field::new(8, 8);
        /// List flags.
        pub const FLAGS: Field = Field::new(16, 4);
        /// Start of the NUL-separated strings.
        pub const PAYLOAD: Field = Field::new(20, 0);
    }

    /// `P_CSUM_MULTI_REQUEST`.
    pub mod csum_multi_request {
        use super::Field;
        /// Call token.
        pub const TOKEN: Field = Field::new(8, 8);
        /// Requested checksum operation.
        pub const OPERATION: Field = Field::new(16, 4);
        /// Uid whose checksum store is addressed.
        pub const UID: Field = Field::new(20, 4);
        /// Length of the key-id region.
        pub const ID_LEN: Field = Field::new(24, 4);
        /// Number of records following the key id.
        pub const COUNT: Field = Field::new(28, 4);
        /// Start of key id followed by records.
        pub const PAYLOAD: Field = Field::new(32, 0);

        /// Record header, relative to the record start.
        pub mod record {
            use super::super::Field;
            /// Total record length.
            pub const REC_LEN: Field = Field::new(0, 4);
            /// Caller-chosen index echoed in the reply.
            pub const INDEX: Field = Field::new(4, 4);
            /// Length of the checksum bytes.
            pub const CS_LEN: Field = Field::new(8, 4);
            /// Length of the path, including its NUL.
            pub const PATH_LEN: Field = Field::new(12, 4);
            /// Size of the record header.
            pub const HEADER: usize = 16;
        }
    }

    /// `P_CSUM_MULTI_REPLY`.
    pub mod csum_multi_reply {
        use super::Field;
        /// Call token.
        pub const TOKEN: Field = Field::new(8, 8);
        /// Operation being answered.
        pub const OPERATION: Field = Field::new(16, 4);
        /// Overall result code.
        pub const ERROR: Field = Field::new(20, 4);
        /// Number of records.
        pub const COUNT: Field = Field::new(24, 4);
        /// Start of the records.
        pub const PAYLOAD: Field = Field::new(28, 0);

        /// Record header, relative to the record start.
        pub mod record {
            use super::super::Field;
            /// Total record length.
            pub const REC_LEN: Field = Field::new(0, 4);
            /// Index copied from the request record.
            pub const INDEX: Field = Field::new(4, 4);
            /// Per-record result code.
            pub const ERROR: Field = Field::new(8, 4);
            /// Length of the checksum bytes.
            pub const CS_LEN: Field = Field::new(12, 4);
            /// Size of the record header.
            pub const HEADER: usize = 16;
        }
    }
}

/// Outcome code for a gated event. Never negative; zero means allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Verdict(i32);

impl Verdict {
    /// Allow the gated operation.
    pub const ALLOW: Verdict = Verdict(0);

    /// Used when every recipient vanished before anyone decided.
    pub const NO_DECISION: Verdict = Verdict(EPERM);

    /// Wrap a wire code. Negative codes are rejected.
    pub fn new(code: i32) -> Option<Self> {
        (code >= 0).then_some(Self(code))
    }

    /// The raw code.
    pub fn code(self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn op_name(op: &u32) -> &'static str {
    opcode::name(*op)
}

/// Codec and validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Fewer bytes than the smallest valid message.
    #[error("message too short: {len} bytes")]
    TooShort {
        /// Actual length.
        len: usize,
    },
    /// More bytes than [`MAX_MESSAGE_LEN`].
    #[error("message too large: {len} bytes")]
    TooLarge {
        /// Requested or actual length.
        len: usize,
    },
    /// The length prefix disagrees with the buffer.
    #[error("declared length {declared} does not match buffer length {actual}")]
    LengthMismatch {
        /// Value of the length field.
        declared: u32,
        /// Bytes actually present.
        actual: usize,
    },
    /// The trailing checksum does not match the body.
    #[error("checksum mismatch")]
    BadChecksum,
    /// The opcode is not part of the protocol.
    #[error("unknown opcode {0:#06x}")]
    UnknownOpcode(u32),
    /// A fixed-layout message has the wrong size.
    #[error("{} must be {expected} bytes, got {actual}", op_name(.opcode))]
    BadLength {
        /// Opcode of the message.
        opcode: u32,
        /// Required total length.
        expected: usize,
        /// Actual total length.
        actual: usize,
    },
    /// A declared variable region extends past the message.
    #[error("{} region `{what}` out of bounds", op_name(.opcode))]
    OutOfBounds {
        /// Opcode of the message.
        opcode: u32,
        /// Name of the region.
        what: &'static str,
    },
    /// A string region lacks its NUL terminator.
    #[error("{} string `{what}` is not NUL-terminated", op_name(.opcode))]
    Unterminated {
        /// Opcode of the message.
        opcode: u32,
        /// Name of the region.
        what: &'static str,
    },
    /// A nested record header disagrees with its contents.
    #[error("{} record {index} is malformed", op_name(.opcode))]
    BadRecord {
        /// Opcode of the message.
        opcode: u32,
        /// Zero-based record position.
        index: u32,
    },
    /// A verdict field holds a negative value.
    #[error("{} carries negative verdict {value}", op_name(.opcode))]
    NegativeVerdict {
        /// Opcode of the message.
        opcode: u32,
        /// Offending value.
        value: i32,
    },
    /// A typed view was requested for a different opcode.
    #[error("expected {}, got {}", op_name(.expected), op_name(.actual))]
    WrongOpcode {
        /// Opcode the view decodes.
        expected: u32,
        /// Opcode in the message.
        actual: u32,
    },
    /// A builder input does not fit a 32-bit length field.
    #[error("region `{what}` too large to encode")]
    RegionTooLarge {
        /// Name of the region.
        what: &'static str,
    },
    /// The allocator refused the request.
    #[error("failed to allocate {0} bytes")]
    AllocationFailed(usize),
}
