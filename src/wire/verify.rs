//! Structural validation of inbound messages.
//!
//! [`verify`] proves that every field a typed view may read lies inside the
//! message. It never panics on hostile input; the first violation found is
//! returned and the caller drops the message.

use super::layout::{
    answer, auth, auth_challenge, close, csum_multi_reply, csum_multi_request, csum_request,
    event, header, hello, register, reply, result, status, string_list, versel,
};
use super::opcode::*;
use super::{Field, Message, WireError, CHECKSUM_LEN, MAX_MESSAGE_LEN, MIN_MESSAGE_LEN};

/// Validate `msg` against the layout its opcode declares.
pub fn verify(msg: &Message) -> Result<(), WireError> {
    let len = msg.len();
    if len < MIN_MESSAGE_LEN {
        return Err(WireError::TooShort { len });
    }
    if len > MAX_MESSAGE_LEN {
        return Err(WireError::TooLarge { len });
    }
    let declared = msg
        .read_u32(header::LENGTH)
        .ok_or(WireError::TooShort { len })?;
    if usize::try_from(declared).ok() != Some(len) {
        return Err(WireError::LengthMismatch {
            declared,
            actual: len,
        });
    }
    let op = msg.opcode().ok_or(WireError::TooShort { len })?;

    match op {
        C_HELLO => exact(msg, op, hello::END),
        C_VERSEL => exact(msg, op, versel::END),
        C_AUTH => exact(msg, op, auth::END),
        C_REPLY => exact(msg, op, reply::END),
        C_CLOSE => exact(msg, op, close::END),
        C_AUTH_CHALLENGE => verify_auth_challenge(msg, op),
        N_REGISTER | N_UNREGISTER => verify_register(msg, op),
        N_NOTIFY | N_ASK => verify_event(msg, op),
        N_ANSWER => {
            exact(msg, op, answer::END)?;
            non_negative(msg, op, answer::VERDICT)
        }
        N_RESULT_YOU | N_RESULT_OTHER => {
            exact(msg, op, result::END)?;
            non_negative(msg, op, result::VERDICT)
        }
        N_STATUS => exact(msg, op, status::END),
        P_CSUM_REQUEST => verify_csum_request(msg, op),
        P_STRING_LIST => verify_string_list(msg, op),
        P_CSUM_MULTI_REQUEST => verify_csum_multi_request(msg, op),
        P_CSUM_MULTI_REPLY => verify_csum_multi_reply(msg, op),
        RETIRED_POLICY_CHANGE_V1 | RETIRED_LOG_NOTIFY_V1 | RETIRED_STAT_V1 => Ok(()),
        other => Err(WireError::UnknownOpcode(other)),
    }
}

/// Check the trailing checksum, then [`verify`]. Used on frames read from
/// a peer.
pub fn check(msg: &Message) -> Result<(), WireError> {
    if !msg.checksum_ok() {
        return Err(WireError::BadChecksum);
    }
    verify(msg)
}

/// Boolean form of [`verify`].
pub fn is_valid(msg: &Message) -> bool {
    verify(msg).is_ok()
}

fn exact(msg: &Message, op: u32, body_end: usize) -> Result<(), WireError> {
    let expected = body_end.saturating_add(CHECKSUM_LEN);
    if msg.len() == expected {
        Ok(())
    } else {
        Err(WireError::BadLength {
            opcode: op,
            expected,
            actual: msg.len(),
        })
    }
}

fn fixed_part(msg: &Message, op: u32, last: Field) -> Result<(), WireError> {
    if msg.field_fits(last) {
        Ok(())
    } else {
        Err(WireError::BadLength {
            opcode: op,
            expected: last.end().saturating_add(CHECKSUM_LEN),
            actual: msg.len(),
        })
    }
}

fn u32_field(msg: &Message, op: u32, field: Field) -> Result<u32, WireError> {
    msg.read_u32(field).ok_or(WireError::BadLength {
        opcode: op,
        expected: field.end().saturating_add(CHECKSUM_LEN),
        actual: msg.len(),
    })
}

fn non_negative(msg: &Message, op: u32, field: Field) -> Result<(), WireError> {
    match msg.read_i32(field) {
        Some(value) if value < 0 => Err(WireError::NegativeVerdict { opcode: op, value }),
        Some(_) => Ok(()),
        None => Err(WireError::TooShort { len: msg.len() }),
    }
}

fn blob(
    msg: &Message,
    op: u32,
    base: Field,
    start: u64,
    count: u64,
    what: &'static str,
) -> Result<(), WireError> {
    if msg.buffer_fits(base, start, count) {
        Ok(())
    } else {
        Err(WireError::OutOfBounds { opcode: op, what })
    }
}

/// A string region must fit and carry a NUL before its last byte is passed.
/// An empty region has no room for the terminator and is rejected.
fn string(
    msg: &Message,
    op: u32,
    base: Field,
    start: u64,
    count: u64,
    what: &'static str,
) -> Result<(), WireError> {
    let bytes = msg
        .region(base, start, count)
        .ok_or(WireError::OutOfBounds { opcode: op, what })?;
    if bytes.contains(&0) {
        Ok(())
    } else {
        Err(WireError::Unterminated { opcode: op, what })
    }
}

fn verify_auth_challenge(msg: &Message, op: u32) -> Result<(), WireError> {
    fixed_part(msg, op, auth_challenge::ID_LEN)?;
    let challenge = u32_field(msg, op, auth_challenge::CHALLENGE_LEN)?;
    let id = u32_field(msg, op, auth_challenge::ID_LEN)?;
    blob(
        msg,
        op,
        auth_challenge::PAYLOAD,
        0,
        u64::from(challenge),
        "challenge",
    )?;
    blob(
        msg,
        op,
        auth_challenge::PAYLOAD,
        u64::from(challenge),
        u64::from(id),
        "key id",
    )
}

fn verify_register(msg: &Message, op: u32) -> Result<(), WireError> {
    fixed_part(msg, op, register::LABEL_LEN)?;
    let label = u32_field(msg, op, register::LABEL_LEN)?;
    if label == 0 {
        return Ok(());
    }
    string(msg, op, register::LABEL, 0, u64::from(label), "label")
}

fn verify_event(msg: &Message, op: u32) -> Result<(), WireError> {
    fixed_part(msg, op, event::EV_LEN)?;
    let region = |off: Field, len: Field| -> Result<(u64, u64), WireError> {
        Ok((
            u64::from(u32_field(msg, op, off)?),
            u64::from(u32_field(msg, op, len)?),
        ))
    };
    let (csum_off, csum_len) = region(event::CSUM_OFF, event::CSUM_LEN)?;
    blob(msg, op, event::PAYLOAD, csum_off, csum_len, "checksum")?;
    let (path_off, path_len) = region(event::PATH_OFF, event::PATH_LEN)?;
    if path_len > 0 {
        string(msg, op, event::PAYLOAD, path_off, path_len, "path")?;
    }
    let (ev_off, ev_len) = region(event::EV_OFF, event::EV_LEN)?;
    blob(msg, op, event::PAYLOAD, ev_off, ev_len, "event")
}

fn verify_csum_request(msg: &Message, op: u32) -> Result<(), WireError> {
    fixed_part(msg, op, csum_request::PATH_LEN)?;
    let id = u64::from(u32_field(msg, op, csum_request::ID_LEN)?);
    let path = u64::from(u32_field(msg, op, csum_request::PATH_LEN)?);
    blob(msg, op, csum_request::PAYLOAD, 0, id, "key id")?;
    string(msg, op, csum_request::PAYLOAD, id, path, "path")
}

fn verify_string_list(msg: &Message, op: u32) -> Result<(), WireError> {
    fixed_part(msg, op, string_list::FLAGS)?;
    let payload = msg
        .tail(string_list::PAYLOAD)
        .ok_or(WireError::OutOfBounds {
            opcode: op,
            what: "strings",
        })?;
    match payload.last() {
        None | Some(0) => Ok(()),
        Some(_) => Err(WireError::Unterminated {
            opcode: op,
            what: "strings",
        }),
    }
}

fn verify_csum_multi_request(msg: &Message, op: u32) -> Result<(), WireError> {
    use csum_multi_request::record;

    fixed_part(msg, op, csum_multi_request::COUNT)?;
    let id = u64::from(u32_field(msg, op, csum_multi_request::ID_LEN)?);
    let count = u32_field(msg, op, csum_multi_request::COUNT)?;
    let base = csum_multi_request::PAYLOAD;
    blob(msg, op, base, 0, id, "key id")?;

    let mut cursor = id;
    for index in 0..count {
        let bad = WireError::BadRecord { opcode: op, index };
        let header_len = u64::try_from(record::HEADER).map_err(|_| bad.clone())?;
        if !msg.buffer_fits(base, cursor, header_len) {
            return Err(bad);
        }
        let at = usize::try_from(cursor).map_err(|_| bad.clone())?;
        let read = |field: Field| msg.read_u32_at(base, at, field).ok_or(bad.clone());
        let rec_len = u64::from(read(record::REC_LEN)?);
        let cs_len = u64::from(read(record::CS_LEN)?);
        let path_len = u64::from(read(record::PATH_LEN)?);

        let expected = header_len
            .checked_add(cs_len)
            .and_then(|n| n.checked_add(path_len));
        if expected != Some(rec_len) {
            return Err(bad);
        }
        let data = cursor.checked_add(header_len).ok_or(bad.clone())?;
        blob(msg, op, base, data, cs_len, "record checksum")?;
        let path_at = data.checked_add(cs_len).ok_or(bad.clone())?;
        string(msg, op, base, path_at, path_len, "record path")?;
        cursor = cursor.checked_add(rec_len).ok_or(bad)?;
    }
    Ok(())
}

fn verify_csum_multi_reply(msg: &Message, op: u32) -> Result<(), WireError> {
    use csum_multi_reply::record;

    fixed_part(msg, op, csum_multi_reply::COUNT)?;
    let count = u32_field(msg, op, csum_multi_reply::COUNT)?;
    let base = csum_multi_reply::PAYLOAD;

    let mut cursor: u64 = 0;
    for index in 0..count {
        let bad = WireError::BadRecord { opcode: op, index };
        let header_len = u64::try_from(record::HEADER).map_err(|_| bad.clone())?;
        if !msg.buffer_fits(base, cursor, header_len) {
            return Err(bad);
        }
        let at = usize::try_from(cursor).map_err(|_| bad.clone())?;
        let rec_len = msg
            .read_u32_at(base, at, record::REC_LEN)
            .map(u64::from)
            .ok_or(bad.clone())?;
        let cs_len = msg
            .read_u32_at(base, at, record::CS_LEN)
            .map(u64::from)
            .ok_or(bad.clone())?;
        if header_len.checked_add(cs_len) != Some(rec_len) {
            return Err(bad);
        }
        let data = cursor.checked_add(header_len).ok_or(bad.clone())?;
        blob(msg, op, base, data, cs_len, "record checksum")?;
        cursor = cursor.checked_add(rec_len).ok_or(bad)?;
    }
    Ok(())
}
