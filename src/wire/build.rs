//! Encoders for every message the protocol defines.
//!
//! Each builder returns a sealed message that passes [`super::verify`].

use super::layout::{
    answer, auth, auth_challenge, close, csum_multi_reply, csum_multi_request, csum_request,
    event, hello, register, reply, result, status, string_list, versel,
};
use super::opcode;
use super::{Message, Verdict, WireError};

/// Inputs for an `N_NOTIFY` or `N_ASK` message.
#[derive(Debug, Clone, Default)]
pub struct EventSpec<'a> {
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
    /// Checksum of the object involved, possibly empty.
    pub checksum: &'a [u8],
    /// Path of the object involved, without terminator.
    pub path: Option<&'a [u8]>,
    /// Subsystem-specific event blob.
    pub payload: &'a [u8],
}

/// One record of a `P_CSUM_MULTI_REQUEST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsumRecord<'a> {
    /// Caller-chosen index echoed in the reply.
    pub index: u32,
    /// Checksum bytes, empty for lookups.
    pub checksum: &'a [u8],
    /// Path without terminator.
    pub path: &'a [u8],
}

/// One record of a `P_CSUM_MULTI_REPLY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsumReplyRecord<'a> {
    /// Index copied from the request.
    pub index: u32,
    /// Per-record result code.
    pub error: i32,
    /// Checksum bytes, empty on error.
    pub checksum: &'a [u8],
}

fn len32(n: usize, what: &'static str) -> Result<u32, WireError> {
    u32::try_from(n).map_err(|_| WireError::RegionTooLarge { what })
}

fn sum(parts: &[usize]) -> Result<usize, WireError> {
    parts
        .iter()
        .try_fold(0usize, |acc, n| acc.checked_add(*n))
        .ok_or(WireError::TooLarge { len: usize::MAX })
}

fn sealed(mut msg: Message) -> Result<Message, WireError> {
    msg.seal();
    Ok(msg)
}

/// `C_HELLO`.
pub fn hello(version: u32, min_version: u32) -> Result<Message, WireError> {
    let mut msg = Message::with_opcode(opcode::C_HELLO, hello::END)?;
    msg.write_u32(hello::VERSION, version)?;
    msg.write_u32(hello::MIN_VERSION, min_version)?;
    sealed(msg)
}

/// `C_VERSEL`.
pub fn versel(token: u64, version: u32) -> Result<Message, WireError> {
    let mut msg = Message::with_opcode(opcode::C_VERSEL, versel::END)?;
    msg.write_u64(versel::TOKEN, token)?;
    msg.write_u32(versel::VERSION, version)?;
    sealed(msg)
}

/// `C_AUTH`.
pub fn auth(token: u64, auth_type: u32) -> Result<Message, WireError> {
    let mut msg = Message::with_opcode(opcode::C_AUTH, auth::END)?;
    msg.write_u64(auth::TOKEN, token)?;
    msg.write_u32(auth::AUTH_TYPE, auth_type)?;
    sealed(msg)
}

/// `C_AUTH_CHALLENGE`.
pub fn auth_challenge(
    token: u64,
    auth_type: u32,
    challenge: &[u8],
    key_id: &[u8],
) -> Result<Message, WireError> {
    let base = auth_challenge::PAYLOAD;
    let body = sum(&[base.offset, challenge.len(), key_id.len()])?;
    let mut msg = Message::with_opcode(opcode::C_AUTH_CHALLENGE, body)?;
    msg.write_u64(auth_challenge::TOKEN, token)?;
    msg.write_u32(auth_challenge::AUTH_TYPE, auth_type)?;
    msg.write_u32(
        auth_challenge::CHALLENGE_LEN,
        len32(challenge.len(), "challenge")?,
    )?;
    msg.write_u32(auth_challenge::ID_LEN, len32(key_id.len(), "key id")?)?;
    msg.write_region(base, 0, challenge)?;
    msg.write_region(base, challenge.len(), key_id)?;
    sealed(msg)
}

/// `C_REPLY`.
pub fn reply(token: u64, answered: u32, error: i32) -> Result<Message, WireError> {
    let mut msg = Message::with_opcode(opcode::C_REPLY, reply::END)?;
    msg.write_u64(reply::TOKEN, token)?;
    msg.write_u32(reply::OPCODE, answered)?;
    msg.write_i32(reply::ERROR, error)?;
    sealed(msg)
}

/// `C_CLOSE`.
pub fn close(token: u64) -> Result<Message, WireError> {
    let mut msg = Message::with_opcode(opcode::C_CLOSE, close::END)?;
    msg.write_u64(close::TOKEN, token)?;
    sealed(msg)
}

fn registration(
    op: u32,
    token: u64,
    uid: u32,
    rule_id: u32,
    subsystem: u32,
    label: Option<&str>,
) -> Result<Message, WireError> {
    // The label region carries its own NUL.
    let label_len = label.map_or(0, |l| l.len().saturating_add(1));
    let body = sum(&[register::LABEL.offset, label_len])?;
    let mut msg = Message::with_opcode(op, body)?;
    msg.write_u64(register::TOKEN, token)?;
    msg.write_u32(register::UID, uid)?;
    msg.write_u32(register::RULE_ID, rule_id)?;
    msg.write_u32(register::SUBSYSTEM, subsystem)?;
    msg.write_u32(register::LABEL_LEN, len32(label_len, "label")?)?;
    if let Some(label) = label {
        msg.write_region(register::LABEL, 0, label.as_bytes())?;
    }
    sealed(msg)
}

/// `N_REGISTER`.
pub fn register(
    token: u64,
    uid: u32,
    rule_id: u32,
    subsystem: u32,
    label: Option<&str>,
) -> Result<Message, WireError> {
    registration(opcode::N_REGISTER, token, uid, rule_id, subsystem, label)
}

/// `N_UNREGISTER`.
pub fn unregister(
    token: u64,
    uid: u32,
    rule_id: u32,
    subsystem: u32,
) -> Result<Message, WireError> {
    registration(opcode::N_UNREGISTER, token, uid, rule_id, subsystem, None)
}

fn event_message(op: u32, spec: &EventSpec<'_>) -> Result<Message, WireError> {
    let base = event::PAYLOAD;
    let path_len = spec.path.map_or(0, |p| p.len().saturating_add(1));
    let csum_off = 0usize;
    let path_off = spec.checksum.len();
    let ev_off = sum(&[path_off, path_len])?;
    let body = sum(&[base.offset, ev_off, spec.payload.len()])?;

    let mut msg = Message::with_opcode(op, body)?;
    msg.write_u64(event::TOKEN, spec.token)?;
    msg.write_u32(event::PID, spec.pid)?;
    msg.write_u32(event::UID, spec.uid)?;
    msg.write_u32(event::RULE_ID, spec.rule_id)?;
    msg.write_u32(event::SUBSYSTEM, spec.subsystem)?;
    msg.write_u32(event::PRIORITY, spec.priority)?;
    msg.write_u32(event::CSUM_OFF, len32(csum_off, "checksum")?)?;
    msg.write_u32(event::CSUM_LEN, len32(spec.checksum.len(), "checksum")?)?;
    msg.write_u32(event::PATH_OFF, len32(path_off, "path")?)?;
    msg.write_u32(event::PATH_LEN, len32(path_len, "path")?)?;
    msg.write_u32(event::EV_OFF, len32(ev_off, "event")?)?;
    msg.write_u32(event::EV_LEN, len32(spec.payload.len(), "event")?)?;
    msg.write_region(base, csum_off, spec.checksum)?;
    if let Some(path) = spec.path {
        msg.write_region(base, path_off, path)?;
    }
    msg.write_region(base, ev_off, spec.payload)?;
    sealed(msg)
}

/// `N_NOTIFY`: informational, no verdict expected.
pub fn notify(spec: &EventSpec<'_>) -> Result<Message, WireError> {
    event_message(opcode::N_NOTIFY, spec)
}

/// `N_ASK`: needs a verdict.
pub fn ask(spec: &EventSpec<'_>) -> Result<Message, WireError> {
    event_message(opcode::N_ASK, spec)
}

/// `N_ANSWER`.
pub fn answer(token: u64, verdict: Verdict, delegate: bool) -> Result<Message, WireError> {
    let mut msg = Message::with_opcode(opcode::N_ANSWER, answer::END)?;
    msg.write_u64(answer::TOKEN, token)?;
    msg.write_i32(answer::VERDICT, verdict.code())?;
    msg.write_u32(answer::DELEGATE, u32::from(delegate))?;
    sealed(msg)
}

/// `N_RESULT_YOU` when `you` is set, `N_RESULT_OTHER` otherwise.
pub fn result(token: u64, you: bool, uid: u32, verdict: Verdict) -> Result<Message, WireError> {
    let op = if you {
        opcode::N_RESULT_YOU
    } else {
        opcode::N_RESULT_OTHER
    };
    let mut msg = Message::with_opcode(op, result::END)?;
    msg.write_u64(result::TOKEN, token)?;
    msg.write_u32(result::UID, uid)?;
    msg.write_i32(result::VERDICT, verdict.code())?;
    sealed(msg)
}

/// `N_STATUS`.
pub fn status(token: u64, key: u32, value: u32) -> Result<Message, WireError> {
    let mut msg = Message::with_opcode(opcode::N_STATUS, status::END)?;
    msg.write_u64(status::TOKEN, token)?;
    msg.write_u32(status::KEY, key)?;
    msg.write_u32(status::VALUE, value)?;
    sealed(msg)
}

/// `P_CSUM_REQUEST`.
pub fn csum_request(
    token: u64,
    operation: u32,
    uid: u32,
    key_id: &[u8],
    path: &[u8],
) -> Result<Message, WireError> {
    let base = csum_request::PAYLOAD;
    let path_len = path.len().saturating_add(1);
    let body = sum(&[base.offset, key_id.len(), path_len])?;
    let mut msg = Message::with_opcode(opcode::P_CSUM_REQUEST, body)?;
    msg.write_u64(csum_request::TOKEN, token)?;
    msg.write_u32(csum_request::OPERATION, operation)?;
    msg.write_u32(csum_request::UID, uid)?;
    msg.write_u32(csum_request::ID_LEN, len32(key_id.len(), "key id")?)?;
    msg.write_u32(csum_request::PATH_LEN, len32(path_len, "path")?)?;
    msg.write_region(base, 0, key_id)?;
    msg.write_region(base, key_id.len(), path)?;
    sealed(msg)
}

/// `P_STRING_LIST`. Strings must not contain NUL bytes.
pub fn string_list(token: u64, flags: u32, strings: &[&str]) -> Result<Message, WireError> {
    let base = string_list::PAYLOAD;
    let mut payload = Vec::new();
    for s in strings {
        if s.as_bytes().contains(&0) {
            return Err(WireError::Unterminated {
                opcode: opcode::P_STRING_LIST,
                what: "strings",
            });
        }
        payload.extend_from_slice(s.as_bytes());
        payload.push(0);
    }
    let body = sum(&[base.offset, payload.len()])?;
    let mut msg = Message::with_opcode(opcode::P_STRING_LIST, body)?;
    msg.write_u64(string_list::TOKEN, token)?;
    msg.write_u32(string_list::FLAGS, flags)?;
    msg.write_region(base, 0, &payload)?;
    sealed(msg)
}

/// `P_CSUM_MULTI_REQUEST`.
pub fn csum_multi_request(
    token: u64,
    operation: u32,
    uid: u32,
    key_id: &[u8],
    records: &[CsumRecord<'_>],
) -> Result<Message, WireError> {
    use csum_multi_request::record;

    let mut encoded = Vec::new();
    for rec in records {
        let path_len = rec.path.len().saturating_add(1);
        let rec_len = sum(&[record::HEADER, rec.checksum.len(), path_len])?;
        encoded.extend_from_slice(&len32(rec_len, "record")?.to_be_bytes());
        encoded.extend_from_slice(&rec.index.to_be_bytes());
        encoded.extend_from_slice(&len32(rec.checksum.len(), "record checksum")?.to_be_bytes());
        encoded.extend_from_slice(&len32(path_len, "record path")?.to_be_bytes());
        encoded.extend_from_slice(rec.checksum);
        encoded.extend_from_slice(rec.path);
        encoded.push(0);
    }
    let base = csum_multi_request::PAYLOAD;
    let body = sum(&[base.offset, key_id.len(), encoded.len()])?;
    let mut msg = Message::with_opcode(opcode::P_CSUM_MULTI_REQUEST, body)?;
    msg.write_u64(csum_multi_request::TOKEN, token)?;
    msg.write_u32(csum_multi_request::OPERATION, operation)?;
    msg.write_u32(csum_multi_request::UID, uid)?;
    msg.write_u32(csum_multi_request::ID_LEN, len32(key_id.len(), "key id")?)?;
    msg.write_u32(csum_multi_request::COUNT, len32(records.len(), "records")?)?;
    msg.write_region(base, 0, key_id)?;
    msg.write_region(base, key_id.len(), &encoded)?;
    sealed(msg)
}

/// `P_CSUM_MULTI_REPLY`.
pub fn csum_multi_reply(
    token: u64,
    operation: u32,
    error: i32,
    records: &[CsumReplyRecord<'_>],
) -> Result<Message, WireError> {
    use csum_multi_reply::record;

    let mut encoded = Vec::new();
    for rec in records {
        let rec_len = sum(&[record::HEADER, rec.checksum.len()])?;
        encoded.extend_from_slice(&len32(rec_len, "record")?.to_be_bytes());
        encoded.extend_from_slice(&rec.index.to_be_bytes());
        encoded.extend_from_slice(&rec.error.to_be_bytes());
        encoded.extend_from_slice(&len32(rec.checksum.len(), "record checksum")?.to_be_bytes());
        encoded.extend_from_slice(rec.checksum);
    }
    let base = csum_multi_reply::PAYLOAD;
    let body = sum(&[base.offset, encoded.len()])?;
    let mut msg = Message::with_opcode(opcode::P_CSUM_MULTI_REPLY, body)?;
    msg.write_u64(csum_multi_reply::TOKEN, token)?;
    msg.write_u32(csum_multi_reply::OPERATION, operation)?;
    msg.write_i32(csum_multi_reply::ERROR, error)?;
    msg.write_u32(csum_multi_reply::COUNT, len32(records.len(), "records")?)?;
    msg.write_region(base, 0, &encoded)?;
    sealed(msg)
}
