//! Variable-length integer encoding used by the CBPP wire format.
//!
//! Unsigned values use a one-byte fast path for anything below `0xFE`,
//! escaping to `0xFE` + `u16` or `0xFF` + `u64` (little-endian) for larger
//! values. Signed values are zig-zag mapped onto the unsigned encoding.

use bytes::BufMut;

/// Escape byte introducing a little-endian `u16` body.
pub const ESCAPE_U16: u8 = 0xFE;
/// Escape byte introducing a little-endian `u64` body.
pub const ESCAPE_U64: u8 = 0xFF;

/// Number of bytes `value` occupies when varuint-encoded.
#[must_use]
pub const fn varuint_len(value: u64) -> usize {
    if value < ESCAPE_U16 as u64 {
        1
    } else if value <= u16::MAX as u64 {
        3
    } else {
        9
    }
}

/// Append the varuint encoding of `value` to `dst`.
pub fn put_varuint(dst: &mut impl BufMut, value: u64) {
    if value < u64::from(ESCAPE_U16) {
        dst.put_u8(value as u8);
    } else if value <= u64::from(u16::MAX) {
        dst.put_u8(ESCAPE_U16);
        dst.put_u16_le(value as u16);
    } else {
        dst.put_u8(ESCAPE_U64);
        dst.put_u64_le(value);
    }
}

/// Decode a varuint from the front of `src`.
///
/// Returns the value and the number of bytes consumed, or `None` when more
/// bytes are needed. Nothing is consumed on `None`.
#[must_use]
pub fn get_varuint(src: &[u8]) -> Option<(u64, usize)> {
    let first = *src.first()?;
    match first {
        ESCAPE_U16 => {
            let body = src.get(1..3)?;
            Some((u64::from(u16::from_le_bytes([body[0], body[1]])), 3))
        }
        ESCAPE_U64 => {
            let body: [u8; 8] = src.get(1..9)?.try_into().ok()?;
            Some((u64::from_le_bytes(body), 9))
        }
        small => Some((u64::from(small), 1)),
    }
}

/// Append the zig-zag varint encoding of `value` to `dst`.
pub fn put_varint(dst: &mut impl BufMut, value: i64) {
    put_varuint(dst, zigzag_encode(value));
}

/// Decode a zig-zag varint from the front of `src`.
///
/// Returns the value and the number of bytes consumed, or `None` when more
/// bytes are needed.
#[must_use]
pub fn get_varint(src: &[u8]) -> Option<(i64, usize)> {
    get_varuint(src).map(|(raw, consumed)| (zigzag_decode(raw), consumed))
}

const fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

const fn zigzag_decode(raw: u64) -> i64 {
    ((raw >> 1) as i64) ^ -((raw & 1) as i64)
}
