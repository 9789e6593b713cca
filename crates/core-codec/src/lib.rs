//! Wire codec: 14-bit variable-length prefixes and AEAD payload frames.
//!
//! The length prefix is little-endian with a continuation bit: values below
//! 0x80 take one byte, anything up to 0x3FFF takes two. Larger values are not
//! encodable; the second byte therefore never has its top bit set, and a
//! decoder treats one as malformed input.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// AEAD authentication tag length in bytes.
pub const TAG_SIZE: usize = 16;
/// Largest value the two-byte continuation encoding can carry.
pub const MAX_AEAD_PAYLOAD: usize = 0x3FFF;
/// Largest plaintext that still fits a frame once the tag is added.
/// Callers with more data must chunk.
pub const MAX_PLAINTEXT: usize = MAX_AEAD_PAYLOAD - TAG_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Value has bits set above the 14-bit ceiling.
    LengthOverflow,
    /// Input ended inside a length prefix.
    Truncated,
    /// Prefix bytes do not form a valid encoding.
    Invalid,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::LengthOverflow => write!(f, "value exceeds 14-bit length prefix"),
            CodecError::Truncated => write!(f, "truncated length prefix"),
            CodecError::Invalid => write!(f, "malformed length prefix"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Append the variable-length encoding of `value` to `out`.
pub fn encode_varlen_u14(value: u16, out: &mut BytesMut) -> Result<(), CodecError> {
    if value & 0xC000 != 0 {
        return Err(CodecError::LengthOverflow);
    }
    if value < 0x80 {
        out.put_u8(value as u8);
    } else {
        out.put_u8((value & 0x7F) as u8 | 0x80);
        out.put_u8((value >> 7) as u8);
    }
    Ok(())
}

/// Decode a length prefix from the front of `buf`.
///
/// Returns the value and the number of bytes consumed (1 or 2).
pub fn decode_varlen_u14(buf: &[u8]) -> Result<(u16, usize), CodecError> {
    let ls = *buf.first().ok_or(CodecError::Truncated)?;
    if ls & 0x80 == 0 {
        return Ok((u16::from(ls), 1));
    }
    let ms = *buf.get(1).ok_or(CodecError::Truncated)?;
    if ms & 0x80 != 0 {
        return Err(CodecError::Invalid);
    }
    Ok((u16::from(ms) << 7 | u16::from(ls & 0x7F), 2))
}

/// Number of bytes `encode_varlen_u14` produces for `value`.
pub fn varlen_u14_len(value: u16) -> usize {
    if value < 0x80 {
        1
    } else {
        2
    }
}

/// Frame an AEAD output (or any body up to [`MAX_AEAD_PAYLOAD`] bytes) as
/// `varlen(len) || body`.
pub fn encode_frame(body: &[u8]) -> Result<Bytes, CodecError> {
    if body.len() > MAX_AEAD_PAYLOAD {
        return Err(CodecError::LengthOverflow);
    }
    let mut out = BytesMut::with_capacity(2 + body.len());
    encode_varlen_u14(body.len() as u16, &mut out)?;
    out.extend_from_slice(body);
    Ok(out.freeze())
}

/// Split a frame off the front of `buf`.
///
/// Returns the body and the total number of bytes consumed.
pub fn decode_frame(buf: &[u8]) -> Result<(&[u8], usize), CodecError> {
    let (len, prefix) = decode_varlen_u14(buf)?;
    let total = prefix + len as usize;
    if buf.len() < total {
        return Err(CodecError::Truncated);
    }
    Ok((&buf[prefix..total], total))
}
