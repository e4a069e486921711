//! Coding-pass-count decoding (Table B.4 of the JPEG 2000 core coding
//! system): a run of one-bits selects how many further bits to read and
//! what fixed value to add.

use crate::quality::bits::BitReader;

/// `(extra bits to read, value added)` per count of leading ones. A run
/// of 16 ones needs no terminating zero.
const TABLE: [(u8, u32); 17] = [
    (0, 1),
    (0, 2),
    (1, 3),
    (0, 5),
    (4, 6),
    (3, 22),
    (2, 30),
    (1, 34),
    (0, 36),
    (6, 37),
    (5, 101),
    (4, 117),
    (3, 149),
    (2, 157),
    (1, 161),
    (0, 163),
    (0, 164),
];

pub const MAX_CODING_PASSES: u32 = 164;

/// Decodes one coding-pass count (1..=164). `None` until enough bits
/// are loaded.
pub fn try_decode(reader: &mut BitReader<'_>) -> Option<u32> {
    let ones = reader.try_count_ones(16)?;
    let (extra, addend) = TABLE[ones as usize];
    Some(addend + reader.try_read_bits(extra)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::databin::{Databin, DatabinClass, DatabinId};
    use crate::quality::bits::BitCursor;

    fn databin_from_bits(bits: &[u8], complete: bool) -> Databin {
        let mut bin = Databin::new(
            DatabinId {
                class: DatabinClass::Precinct,
                in_class_id: 0,
            },
            0,
        );
        // Pack with bit stuffing: a byte following 0xFF starts with a
        // stuffed zero bit, which the reader will skip.
        let mut bytes: Vec<u8> = Vec::new();
        let mut byte = 0u8;
        let mut filled = 0u8;
        for &bit in bits {
            if filled == 0 && bytes.last() == Some(&0xFF) {
                filled = 1;
            }
            byte |= bit << (7 - filled);
            filled += 1;
            if filled == 8 {
                bytes.push(byte);
                byte = 0;
                filled = 0;
            }
        }
        // An incomplete databin only holds fully specified bytes.
        if filled > 0 && complete {
            bytes.push(byte);
        }
        bin.append(0, &bytes, complete).unwrap();
        bin
    }

    fn decode(bits: &[u8]) -> Option<u32> {
        let bin = databin_from_bits(bits, true);
        let mut reader = BitReader::new(&bin, BitCursor::start());
        try_decode(&mut reader)
    }

    #[test]
    fn decodes_table_entries() {
        assert_eq!(decode(&[0]), Some(1));
        assert_eq!(decode(&[1, 0]), Some(2));
        assert_eq!(decode(&[1, 1, 0, 0]), Some(3));
        assert_eq!(decode(&[1, 1, 0, 1]), Some(4));
        assert_eq!(decode(&[1, 1, 1, 0]), Some(5));
        assert_eq!(decode(&[1, 1, 1, 1, 0, 0, 0, 0, 0]), Some(6));
        assert_eq!(decode(&[1, 1, 1, 1, 1, 0, 0, 0, 1]), Some(23));
    }

    #[test]
    fn sixteen_ones_needs_no_terminating_zero() {
        assert_eq!(decode(&[1; 16]), Some(MAX_CODING_PASSES));
    }

    #[test]
    fn maximal_extra_bits_reach_the_table_ceiling() {
        // 15 ones, zero, then no extra bits: 163.
        let mut bits = vec![1; 15];
        bits.push(0);
        assert_eq!(decode(&bits), Some(163));
        // 9 ones, zero, extra 111111: 37 + 63 = 100.
        let mut bits = vec![1; 9];
        bits.push(0);
        bits.extend_from_slice(&[1; 6]);
        assert_eq!(decode(&bits), Some(100));
    }

    #[test]
    fn truncated_input_is_a_retry_not_an_error() {
        // Two ones and nothing after the first byte boundary would
        // still be readable, so truncate below a byte.
        let bin = databin_from_bits(&[1, 1], false);
        let mut reader = BitReader::new(&bin, BitCursor::start());
        assert_eq!(try_decode(&mut reader), None);
    }
}
