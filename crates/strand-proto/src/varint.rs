//! Variable-length integer encoding for sizes and stream ids
//!
//! The two most significant bits of the first byte select the encoded width
//! (00 = 1 byte, 01 = 2 bytes, 10 = 4 bytes, 11 = 8 bytes), leaving 6, 14,
//! 30 or 62 bits of value, big-endian.

use crate::frame::FrameError;
use bytes::{Buf, BufMut, BytesMut};

/// Largest value representable as a varint (62 bits)
pub const MAX_VARINT: u64 = (1 << 62) - 1;

const MAX_1: u64 = (1 << 6) - 1;
const MAX_2: u64 = (1 << 14) - 1;
const MAX_4: u64 = (1 << 30) - 1;

/// Number of bytes `value` occupies once encoded
pub fn varint_len(value: u64) -> usize {
    if value <= MAX_1 {
        1
    } else if value <= MAX_2 {
        2
    } else if value <= MAX_4 {
        4
    } else {
        8
    }
}

/// Append the varint encoding of `value` to `buf`
pub fn encode_varint(buf: &mut BytesMut, value: u64) -> Result<(), FrameError> {
    if value > MAX_VARINT {
        return Err(FrameError::VarintOverflow(value));
    }

    if value <= MAX_1 {
        buf.put_u8(value as u8);
    } else if value <= MAX_2 {
        buf.put_u16(value as u16 | 0x4000);
    } else if value <= MAX_4 {
        buf.put_u32(value as u32 | 0x8000_0000);
    } else {
        buf.put_u64(value | 0xc000_0000_0000_0000);
    }

    Ok(())
}

/// Decode one varint from the front of `buf`
///
/// Returns `Ok(None)` when `buf` does not yet hold the complete encoding;
/// nothing is consumed in that case.
pub fn decode_varint(buf: &mut impl Buf) -> Result<Option<u64>, FrameError> {
    if buf.remaining() == 0 {
        return Ok(None);
    }

    let first = buf.chunk()[0];
    let len = 1usize << (first >> 6);

    if buf.remaining() < len {
        return Ok(None);
    }

    let value = match len {
        1 => buf.get_u8() as u64,
        2 => (buf.get_u16() & 0x3fff) as u64,
        4 => (buf.get_u32() & 0x3fff_ffff) as u64,
        8 => buf.get_u64() & 0x3fff_ffff_ffff_ffff,
        _ => unreachable!(),
    };

    Ok(Some(value))
}
