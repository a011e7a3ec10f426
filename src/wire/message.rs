//! Owned message buffer with bounds-checked field access.

use sha2::{Digest, Sha256};

use super::layout::header;
use super::{Field, WireError, CHECKSUM_LEN, HEADER_LEN, MAX_MESSAGE_LEN, MIN_MESSAGE_LEN};

/// One wire message.
///
/// The buffer always holds the complete message, trailer included. A
/// `Message` built from inbound bytes is untrusted until it passes
/// [`super::verify`].
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    buf: Vec<u8>,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("len", &self.buf.len())
            .field("opcode", &self.opcode().map(super::opcode::name))
            .finish()
    }
}

impl Message {
    /// Allocate a zeroed message whose body (header and fields) is `len`
    /// bytes. The trailer is added on top and the length field is written.
    pub fn allocate(len: usize) -> Result<Self, WireError> {
        let total = total_len(len)?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(total)
            .map_err(|_| WireError::AllocationFailed(total))?;
        buf.resize(total, 0);
        let mut msg = Self { buf };
        msg.write_length();
        Ok(msg)
    }

    /// Allocate a message and stamp its opcode.
    pub fn with_opcode(opcode: u32, len: usize) -> Result<Self, WireError> {
        let mut msg = Self::allocate(len)?;
        msg.write_u32(header::OPCODE, opcode)?;
        Ok(msg)
    }

    /// Wrap raw inbound bytes without interpreting them.
    pub fn from_bytes(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    /// Grow or shrink the body to `len` bytes.
    ///
    /// Consumes the message: if the allocator refuses, the message is gone
    /// and cannot be used half-resized. Existing bytes up to the new length
    /// are kept; the trailer must be recomputed with [`Message::seal`].
    pub fn resize(mut self, len: usize) -> Result<Self, WireError> {
        let total = total_len(len)?;
        if let Some(extra) = total.checked_sub(self.buf.len()) {
            self.buf
                .try_reserve_exact(extra)
                .map_err(|_| WireError::AllocationFailed(total))?;
        }
        self.buf.resize(total, 0);
        self.write_length();
        Ok(self)
    }

    /// Total length in bytes, trailer included.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True for a zero-length buffer.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Length of everything before the trailer.
    pub fn body_len(&self) -> usize {
        self.buf.len().saturating_sub(CHECKSUM_LEN)
    }

    /// The raw bytes, trailer included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the message and return its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// The length prefix, if present.
    pub fn declared_len(&self) -> Option<u32> {
        self.read_u32(header::LENGTH)
    }

    /// The opcode, if present.
    pub fn opcode(&self) -> Option<u32> {
        self.read_u32(header::OPCODE)
    }

    /// True iff `field` lies entirely before the trailer.
    pub fn field_fits(&self, field: Field) -> bool {
        field
            .end()
            .checked_add(CHECKSUM_LEN)
            .is_some_and(|need| self.buf.len() >= need)
    }

    /// True iff `0 <= n <= MAX_MESSAGE_LEN` and the body holds at least `n`
    /// bytes.
    pub fn length_at_least(&self, n: i64) -> bool {
        let Ok(n) = usize::try_from(n) else {
            return false;
        };
        n <= MAX_MESSAGE_LEN
            && n.checked_add(CHECKSUM_LEN)
                .is_some_and(|need| self.buf.len() >= need)
    }

    /// True iff the slice `[start, start + count)` of the flexible region
    /// beginning at `base` ends within `[0, MAX_MESSAGE_LEN]` and before
    /// the trailer.
    pub fn buffer_fits(&self, base: Field, start: u64, count: u64) -> bool {
        self.region_end(base, start, count).is_some()
    }

    /// End offset of `[start, start + count)` inside `base`, if it fits.
    pub(crate) fn region_end(&self, base: Field, start: u64, count: u64) -> Option<usize> {
        let end = u64::try_from(base.offset)
            .ok()?
            .checked_add(start)?
            .checked_add(count)?;
        let end = usize::try_from(end).ok()?;
        (end <= MAX_MESSAGE_LEN && end <= self.body_len()).then_some(end)
    }

    /// Borrow `[start, start + count)` of the flexible region at `base`.
    pub fn region(&self, base: Field, start: u64, count: u64) -> Option<&[u8]> {
        let end = self.region_end(base, start, count)?;
        let begin = end.checked_sub(usize::try_from(count).ok()?)?;
        self.buf.get(begin..end)
    }

    /// Bytes of the body from `base` up to the trailer.
    pub fn tail(&self, base: Field) -> Option<&[u8]> {
        self.buf.get(base.offset..self.body_len())
    }

    fn field_bytes(&self, field: Field) -> Option<&[u8]> {
        if !self.field_fits(field) {
            return None;
        }
        self.buf.get(field.offset..field.end())
    }

    /// Read a big-endian `u32` field.
    pub fn read_u32(&self, field: Field) -> Option<u32> {
        let bytes: [u8; 4] = self.field_bytes(field)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Read a big-endian `i32` field.
    pub fn read_i32(&self, field: Field) -> Option<i32> {
        let bytes: [u8; 4] = self.field_bytes(field)?.try_into().ok()?;
        Some(i32::from_be_bytes(bytes))
    }

    /// Read a big-endian `u64` field.
    pub fn read_u64(&self, field: Field) -> Option<u64> {
        let bytes: [u8; 8] = self.field_bytes(field)?.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// Read a `u32` at `offset` bytes past `base`.
    pub(crate) fn read_u32_at(&self, base: Field, offset: usize, field: Field) -> Option<u32> {
        let at = base.offset.checked_add(offset)?.checked_add(field.offset)?;
        self.read_u32(Field::new(at, field.size))
    }

    fn field_bytes_mut(&mut self, field: Field) -> Result<&mut [u8], WireError> {
        if !self.field_fits(field) {
            return Err(WireError::TooShort { len: self.len() });
        }
        let len = self.len();
        self.buf
            .get_mut(field.offset..field.end())
            .ok_or(WireError::TooShort { len })
    }

    /// Write a big-endian `u32` field.
    pub fn write_u32(&mut self, field: Field, value: u32) -> Result<(), WireError> {
        self.field_bytes_mut(field)?
            .copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Write a big-endian `i32` field.
    pub fn write_i32(&mut self, field: Field, value: i32) -> Result<(), WireError> {
        self.field_bytes_mut(field)?
            .copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Write a big-endian `u64` field.
    pub fn write_u64(&mut self, field: Field, value: u64) -> Result<(), WireError> {
        self.field_bytes_mut(field)?
            .copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Copy `bytes` to `offset` bytes past the flexible region at `base`.
    pub fn write_region(
        &mut self,
        base: Field,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), WireError> {
        let start = base
            .offset
            .checked_add(offset)
            .ok_or(WireError::TooLarge { len: usize::MAX })?;
        let field = Field::new(start, bytes.len());
        self.field_bytes_mut(field)?.copy_from_slice(bytes);
        Ok(())
    }

    /// Recompute the integrity trailer over the body.
    pub fn seal(&mut self) {
        let body = self.body_len();
        if self.buf.len() < CHECKSUM_LEN {
            return;
        }
        let digest = checksum(&self.buf[..body]);
        self.buf[body..].copy_from_slice(&digest);
    }

    /// True iff the trailer matches the body.
    pub fn checksum_ok(&self) -> bool {
        if self.buf.len() < MIN_MESSAGE_LEN {
            return false;
        }
        let body = self.body_len();
        self.buf[body..] == checksum(&self.buf[..body])
    }

    fn write_length(&mut self) {
        if let Ok(len) = u32::try_from(self.buf.len()) {
            if let Some(slot) = self.buf.get_mut(header::LENGTH.offset..header::LENGTH.end()) {
                slot.copy_from_slice(&len.to_be_bytes());
            }
        }
    }
}

fn total_len(body: usize) -> Result<usize, WireError> {
    if body < HEADER_LEN {
        return Err(WireError::TooShort { len: body });
    }
    body.checked_add(CHECKSUM_LEN)
        .filter(|total| *total <= MAX_MESSAGE_LEN)
        .ok_or(WireError::TooLarge { len: body })
}

fn checksum(body: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha256::digest(body);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}
