//! Variable-length byte-aligned segment (VBAS) integers.
//!
//! Each byte contributes its low 7 bits, accumulated big-endian; the
//! high bit signals continuation. The first byte of a Bin-ID field
//! contributes only its low 4 bits (the rest are flag bits), which the
//! message header parser handles by seeding [`decode_continuation`].

use crate::error::JpipError;

/// Largest value still representable without shifting bits off a `u64`.
const OVERFLOW_LIMIT: u64 = u64::MAX >> 7;

/// Decodes a VBAS starting at `pos`.
///
/// Returns `Ok(None)` when the continuation chain runs past the buffer
/// (more transport data needed), `(value, next_pos)` otherwise.
pub fn decode(bytes: &[u8], pos: usize) -> Result<Option<(u64, usize)>, JpipError> {
    decode_continuation(bytes, pos, 0, true)
}

/// Continues a VBAS whose leading bits were consumed by the caller.
///
/// `seed` holds the bits already accumulated; `more` is the first byte's
/// continuation flag. Used for the Bin-ID field, where the first byte
/// packs flags alongside its 4 value bits.
pub fn decode_continuation(
    bytes: &[u8],
    mut pos: usize,
    seed: u64,
    mut more: bool,
) -> Result<Option<(u64, usize)>, JpipError> {
    let mut value = seed;
    while more {
        let Some(&byte) = bytes.get(pos) else {
            return Ok(None);
        };
        if value > OVERFLOW_LIMIT {
            return Err(JpipError::VbasOverflow);
        }
        value = (value << 7) | u64::from(byte & 0x7F);
        more = byte & 0x80 != 0;
        pos += 1;
    }
    Ok(Some((value, pos)))
}

/// Encodes `value` as a VBAS, appending to `out`.
pub fn encode(value: u64, out: &mut Vec<u8>) {
    let mut groups = [0u8; 10];
    let mut count = 0;
    let mut v = value;
    loop {
        groups[count] = (v & 0x7F) as u8;
        count += 1;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    for i in (0..count).rev() {
        let continuation = if i == 0 { 0 } else { 0x80 };
        out.push(groups[i] | continuation);
    }
}
