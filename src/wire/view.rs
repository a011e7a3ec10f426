//! Typed, borrowed views over verified messages.

use super::build::{CsumRecord, CsumReplyRecord};
use super::layout::{
    answer, auth, auth_challenge, close, csum_multi_reply, csum_multi_request, csum_request,
    event, hello, register, reply, result, status, string_list, versel,
};
use super::opcode::*;
use super::{verify, Field, Message, Verdict, WireError};

/// `C_HELLO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    /// Highest version the server speaks.
    pub version: u32,
    /// Lowest version the server accepts.
    pub min_version: u32,
}

/// `C_REPLY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Token of the request being answered.
    pub token: u64,
    /// Opcode of the request being answered.
    pub opcode: u32,
    /// Zero on success, negative errno otherwise.
    pub error: i32,
}

/// `N_REGISTER` / `N_UNREGISTER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration<'a> {
    /// Call token.
    pub token: u64,
    /// Uid filter.
    pub uid: u32,
    /// Rule filter.
    pub rule_id: u32,
    /// Subsystem filter.
    pub subsystem: u32,
    /// Optional label, without terminator.
    pub label: Option<&'a [u8]>,
}

/// `N_NOTIFY` / `N_ASK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event<'a> {
    /// True for `N_ASK`.
    pub needs_verdict: bool,
    /// Event token.
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
    /// Checksum region.
    pub checksum: &'a [u8],
    /// Path, without terminator.
    pub path: Option<&'a [u8]>,
    /// Subsystem-specific blob.
    pub payload: &'a [u8],
}

/// `N_ANSWER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Answer {
    /// Event token.
    pub token: u64,
    /// Verdict given.
    pub verdict: Verdict,
    /// Whether decision authority is handed to the remaining sessions.
    pub delegate: bool,
}

/// `N_RESULT_YOU` / `N_RESULT_OTHER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Event token.
    pub token: u64,
    /// True if the receiving session made the decision.
    pub you: bool,
    /// Uid of the deciding session.
    pub uid: u32,
    /// Final verdict.
    pub verdict: Verdict,
}

/// Every message the protocol defines, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View<'a> {
    /// `C_HELLO`.
    Hello(Hello),
    /// `C_VERSEL`.
    Versel {
        /// Call token.
        token: u64,
        /// Selected version.
        version: u32,
    },
    /// `C_AUTH`.
    Auth {
        /// Call token.
        token: u64,
        /// Authentication method.
        auth_type: u32,
    },
    /// `C_AUTH_CHALLENGE`.
    AuthChallenge {
        /// Call token.
        token: u64,
        /// Authentication method.
        auth_type: u32,
        /// Challenge blob.
        challenge: &'a [u8],
        /// Key-id blob.
        key_id: &'a [u8],
    },
    /// `C_REPLY`.
    Reply(Reply),
    /// `C_CLOSE`.
    Close {
        /// Call token.
        token: u64,
    },
    /// `N_REGISTER`.
    Register(Registration<'a>),
    /// `N_UNREGISTER`.
    Unregister(Registration<'a>),
    /// `N_NOTIFY` or `N_ASK`.
    Event(Event<'a>),
    /// `N_ANSWER`.
    Answer(Answer),
    /// `N_RESULT_YOU` or `N_RESULT_OTHER`.
    Outcome(Outcome),
    /// `N_STATUS`.
    Status {
        /// Call token.
        token: u64,
        /// Status key.
        key: u32,
        /// Status value.
        value: u32,
    },
    /// `P_CSUM_REQUEST`.
    CsumRequest {
        /// Call token.
        token: u64,
        /// Requested operation.
        operation: u32,
        /// Addressed uid.
        uid: u32,
        /// Key id.
        key_id: &'a [u8],
        /// Path, without terminator.
        path: &'a [u8],
    },
    /// `P_STRING_LIST`.
    StringList {
        /// Call token.
        token: u64,
        /// List flags.
        flags: u32,
        /// Strings, without terminators.
        strings: Vec<&'a [u8]>,
    },
    /// `P_CSUM_MULTI_REQUEST`.
    CsumMultiRequest {
        /// Call token.
        token: u64,
        /// Requested operation.
        operation: u32,
        /// Addressed uid.
        uid: u32,
        /// Key id.
        key_id: &'a [u8],
        /// Records in wire order.
        records: Vec<CsumRecord<'a>>,
    },
    /// `P_CSUM_MULTI_REPLY`.
    CsumMultiReply {
        /// Call token.
        token: u64,
        /// Operation being answered.
        operation: u32,
        /// Overall result code.
        error: i32,
        /// Records in wire order.
        records: Vec<CsumReplyRecord<'a>>,
    },
    /// One of the retired opcodes; carries no decodable body.
    Retired(u32),
}

/// Token of any message that carries one.
///
/// `C_HELLO` and retired opcodes have no token. Every other opcode keeps it
/// in the first eight bytes after the header.
pub fn token(msg: &Message) -> Option<u64> {
    match msg.opcode()? {
        C_HELLO | RETIRED_POLICY_CHANGE_V1 | RETIRED_LOG_NOTIFY_V1 | RETIRED_STAT_V1 => None,
        _ => msg.read_u64(versel::TOKEN),
    }
}

/// Verify `msg` and decode it.
pub fn decode(msg: &Message) -> Result<View<'_>, WireError> {
    verify(msg)?;
    let op = msg.opcode().ok_or(WireError::TooShort { len: msg.len() })?;
    let r = Reader { msg, op };

    Ok(match op {
        C_HELLO => View::Hello(Hello {
            version: r.u32(hello::VERSION)?,
            min_version: r.u32(hello::MIN_VERSION)?,
        }),
        C_VERSEL => View::Versel {
            token: r.u64(versel::TOKEN)?,
            version: r.u32(versel::VERSION)?,
        },
        C_AUTH => View::Auth {
            token: r.u64(auth::TOKEN)?,
            auth_type: r.u32(auth::AUTH_TYPE)?,
        },
        C_AUTH_CHALLENGE => {
            let challenge_len = u64::from(r.u32(auth_challenge::CHALLENGE_LEN)?);
            let id_len = u64::from(r.u32(auth_challenge::ID_LEN)?);
            View::AuthChallenge {
                token: r.u64(auth_challenge::TOKEN)?,
                auth_type: r.u32(auth_challenge::AUTH_TYPE)?,
                challenge: r.region(auth_challenge::PAYLOAD, 0, challenge_len, "challenge")?,
                key_id: r.region(auth_challenge::PAYLOAD, challenge_len, id_len, "key id")?,
            }
        }
        C_REPLY => View::Reply(Reply {
            token: r.u64(reply::TOKEN)?,
            opcode: r.u32(reply::OPCODE)?,
            error: r.i32(reply::ERROR)?,
        }),
        C_CLOSE => View::Close {
            token: r.u64(close::TOKEN)?,
        },
        N_REGISTER => View::Register(r.registration()?),
        N_UNREGISTER => View::Unregister(r.registration()?),
        N_NOTIFY | N_ASK => View::Event(r.event()?),
        N_ANSWER => View::Answer(Answer {
            token: r.u64(answer::TOKEN)?,
            verdict: r.verdict(answer::VERDICT)?,
            delegate: r.u32(answer::DELEGATE)? != 0,
        }),
        N_RESULT_YOU | N_RESULT_OTHER => View::Outcome(Outcome {
            token: r.u64(result::TOKEN)?,
            you: op == N_RESULT_YOU,
            uid: r.u32(result::UID)?,
            verdict: r.verdict(result::VERDICT)?,
        }),
        N_STATUS => View::Status {
            token: r.u64(status::TOKEN)?,
            key: r.u32(status::KEY)?,
            value: r.u32(status::VALUE)?,
        },
        P_CSUM_REQUEST => {
            let id_len = u64::from(r.u32(csum_request::ID_LEN)?);
            let path_len = u64::from(r.u32(csum_request::PATH_LEN)?);
            let path = r.region(csum_request::PAYLOAD, id_len, path_len, "path")?;
            View::CsumRequest {
                token: r.u64(csum_request::TOKEN)?,
                operation: r.u32(csum_request::OPERATION)?,
                uid: r.u32(csum_request::UID)?,
                key_id: r.region(csum_request::PAYLOAD, 0, id_len, "key id")?,
                path: until_nul(path),
            }
        }
        P_STRING_LIST => {
            let payload = msg
                .tail(string_list::PAYLOAD)
                .ok_or(r.out_of_bounds("strings"))?;
            let strings = match payload.split_last() {
                Some((_, body)) => body.split(|b| *b == 0).collect(),
                None => Vec::new(),
            };
            View::StringList {
                token: r.u64(string_list::TOKEN)?,
                flags: r.u32(string_list::FLAGS)?,
                strings,
            }
        }
        P_CSUM_MULTI_REQUEST => r.csum_multi_request()?,
        P_CSUM_MULTI_REPLY => r.csum_multi_reply()?,
        other => View::Retired(other),
    })
}

fn until_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

struct Reader<'a> {
    msg: &'a Message,
    op: u32,
}

impl<'a> Reader<'a> {
    fn short(&self) -> WireError {
        WireError::TooShort {
            len: self.msg.len(),
        }
    }

    fn out_of_bounds(&self, what: &'static str) -> WireError {
        WireError::OutOfBounds {
            opcode: self.op,
            what,
        }
    }

    fn u32(&self, field: Field) -> Result<u32, WireError> {
        self.msg.read_u32(field).ok_or_else(|| self.short())
    }

    fn i32(&self, field: Field) -> Result<i32, WireError> {
        self.msg.read_i32(field).ok_or_else(|| self.short())
    }

    fn u64(&self, field: Field) -> Result<u64, WireError> {
        self.msg.read_u64(field).ok_or_else(|| self.short())
    }

    fn verdict(&self, field: Field) -> Result<Verdict, WireError> {
        let value = self.i32(field)?;
        Verdict::new(value).ok_or(WireError::NegativeVerdict {
            opcode: self.op,
            value,
        })
    }

    fn region(
        &self,
        base: Field,
        start: u64,
        count: u64,
        what: &'static str,
    ) -> Result<&'a [u8], WireError> {
        self.msg
            .region(base, start, count)
            .ok_or_else(|| self.out_of_bounds(what))
    }

    fn registration(&self) -> Result<Registration<'a>, WireError> {
        let label_len = u64::from(self.u32(register::LABEL_LEN)?);
        let label = if label_len == 0 {
            None
        } else {
            Some(until_nul(self.region(
                register::LABEL,
                0,
                label_len,
                "label",
            )?))
        };
        Ok(Registration {
            token: self.u64(register::TOKEN)?,
            uid: self.u32(register::UID)?,
            rule_id: self.u32(register::RULE_ID)?,
            subsystem: self.u32(register::SUBSYSTEM)?,
            label,
        })
    }

    fn event(&self) -> Result<Event<'a>, WireError> {
        let span = |off: Field, len: Field, what| -> Result<&'a [u8], WireError> {
            let off = u64::from(self.u32(off)?);
            let len = u64::from(self.u32(len)?);
            self.region(event::PAYLOAD, off, len, what)
        };
        // An empty path carries no offset worth checking.
        let path = if self.u32(event::PATH_LEN)? == 0 {
            None
        } else {
            Some(until_nul(span(event::PATH_OFF, event::PATH_LEN, "path")?))
        };
        Ok(Event {
            needs_verdict: self.op == N_ASK,
            token: self.u64(event::TOKEN)?,
            pid: self.u32(event::PID)?,
            uid: self.u32(event::UID)?,
            rule_id: self.u32(event::RULE_ID)?,
            subsystem: self.u32(event::SUBSYSTEM)?,
            priority: self.u32(event::PRIORITY)?,
            checksum: span(event::CSUM_OFF, event::CSUM_LEN, "checksum")?,
            path,
            payload: span(event::EV_OFF, event::EV_LEN, "event")?,
        })
    }

    fn csum_multi_request(&self) -> Result<View<'a>, WireError> {
        use csum_multi_request::record;

        let base = csum_multi_request::PAYLOAD;
        let id_len = u64::from(self.u32(csum_multi_request::ID_LEN)?);
        let count = self.u32(csum_multi_request::COUNT)?;
        let header = u64::try_from(record::HEADER).map_err(|_| self.short())?;
        let mut records = Vec::new();
        let mut cursor = id_len;
        for index in 0..count {
            let bad = WireError::BadRecord {
                opcode: self.op,
                index,
            };
            let at = usize::try_from(cursor).map_err(|_| bad.clone())?;
            let read = |field| self.msg.read_u32_at(base, at, field).ok_or(bad.clone());
            let rec_len = u64::from(read(record::REC_LEN)?);
            let cs_len = u64::from(read(record::CS_LEN)?);
            let path_len = u64::from(read(record::PATH_LEN)?);
            let data = cursor.checked_add(header).ok_or(bad.clone())?;
            let path_at = data.checked_add(cs_len).ok_or(bad.clone())?;
            records.push(CsumRecord {
                index: read(record::INDEX)?,
                checksum: self.region(base, data, cs_len, "record checksum")?,
                path: until_nul(self.region(base, path_at, path_len, "record path")?),
            });
            cursor = cursor.checked_add(rec_len).ok_or(bad)?;
        }
        Ok(View::CsumMultiRequest {
            token: self.u64(csum_multi_request::TOKEN)?,
            operation: self.u32(csum_multi_request::OPERATION)?,
            uid: self.u32(csum_multi_request::UID)?,
            key_id: self.region(base, 0, id_len, "key id")?,
            records,
        })
    }

    fn csum_multi_reply(&self) -> Result<View<'a>, WireError> {
        use csum_multi_reply::record;

        let base = csum_multi_reply::PAYLOAD;
        let count = self.u32(csum_multi_reply::COUNT)?;
        let header = u64::try_from(record::HEADER).map_err(|_| self.short())?;
        let mut records = Vec::new();
        let mut cursor: u64 = 0;
        for index in 0..count {
            let bad = WireError::BadRecord {
                opcode: self.op,
                index,
            };
            let at = usize::try_from(cursor).map_err(|_| bad.clone())?;
            let rec_len = self
                .msg
                .read_u32_at(base, at, record::REC_LEN)
                .ok_or(bad.clone())?;
            let cs_len = self
                .msg
                .read_u32_at(base, at, record::CS_LEN)
                .ok_or(bad.clone())?;
            let index_field = self
                .msg
                .read_u32_at(base, at, record::INDEX)
                .ok_or(bad.clone())?;
            let error = self
                .msg
                .read_u32_at(base, at, record::ERROR)
                .ok_or(bad.clone())?;
            let data = cursor.checked_add(header).ok_or(bad.clone())?;
            records.push(CsumReplyRecord {
                index: index_field,
                error: i32::from_be_bytes(error.to_be_bytes()),
                checksum: self.region(base, data, u64::from(cs_len), "record checksum")?,
            });
            cursor = cursor.checked_add(u64::from(rec_len)).ok_or(bad)?;
        }
        Ok(View::CsumMultiReply {
            token: self.u64(csum_multi_reply::TOKEN)?,
            operation: self.u32(csum_multi_reply::OPERATION)?,
            error: self.i32(csum_multi_reply::ERROR)?,
            records,
        })
    }
}
