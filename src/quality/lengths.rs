//! Codeblock contribution lengths: the L-block accumulator plus the
//! `lblock + floor(log2(passes))` bit-width rule.

use crate::error::JpipError;
use crate::quality::bits::BitReader;

pub fn floor_log2(n: u32) -> u32 {
    debug_assert!(n > 0);
    31 - n.leading_zeros()
}

/// Per-codeblock length decoder. The L-block value only grows across
/// quality layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthDecoder {
    lblock: u32,
}

impl Default for LengthDecoder {
    fn default() -> Self {
        Self { lblock: 3 }
    }
}

impl LengthDecoder {
    pub fn lblock(&self) -> u32 {
        self.lblock
    }

    /// Reads the L-block increment and the byte length of one
    /// codeblock's contribution to the current packet. `Ok(None)` until
    /// enough bits are loaded; the caller commits or discards this
    /// decoder's state along with the rest of the parse attempt.
    pub fn try_decode(
        &mut self,
        reader: &mut BitReader<'_>,
        coding_passes: u32,
    ) -> Result<Option<u32>, JpipError> {
        let increment = match reader.try_count_ones(32) {
            Some(n) => n,
            None => return Ok(None),
        };
        self.lblock += increment;
        let bits = self.lblock + floor_log2(coding_passes);
        if bits > 32 {
            return Err(JpipError::InvalidMarkerSegment("oversized length field"));
        }
        match reader.try_read_bits(bits as u8) {
            Some(length) => Ok(Some(length)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::databin::{Databin, DatabinClass, DatabinId};
    use crate::quality::bits::BitCursor;

    fn databin_with(bytes: &[u8]) -> Databin {
        let mut bin = Databin::new(
            DatabinId {
                class: DatabinClass::Precinct,
                in_class_id: 0,
            },
            0,
        );
        bin.append(0, bytes, true).unwrap();
        bin
    }

    #[test]
    fn floor_log2_is_exact_on_powers_of_two() {
        assert_eq!(floor_log2(1), 0);
        assert_eq!(floor_log2(2), 1);
        assert_eq!(floor_log2(3), 1);
        assert_eq!(floor_log2(164), 7);
    }

    #[test]
    fn decodes_length_with_default_lblock() {
        // No increment (0), then 3 bits of length: 0b101 = 5.
        let bin = databin_with(&[0b0101_0000]);
        let mut reader = BitReader::new(&bin, BitCursor::start());
        let mut decoder = LengthDecoder::default();
        assert_eq!(decoder.try_decode(&mut reader, 1).unwrap(), Some(5));
        assert_eq!(decoder.lblock(), 3);
    }

    #[test]
    fn increment_persists_across_layers() {
        // Layer 1: increment 2 (bits 1,1,0), 5 length bits 0b10001 = 17.
        // Layer 2: no increment, passes=2 -> 6 bits 0b000011 = 3.
        let bin = databin_with(&[0b1101_0001, 0b0000_0110]);
        let mut reader = BitReader::new(&bin, BitCursor::start());
        let mut decoder = LengthDecoder::default();
        assert_eq!(decoder.try_decode(&mut reader, 1).unwrap(), Some(17));
        assert_eq!(decoder.lblock(), 5);
        assert_eq!(decoder.try_decode(&mut reader, 2).unwrap(), Some(3));
    }

    #[test]
    fn truncated_length_bits_are_a_retry() {
        let mut bin = Databin::new(
            DatabinId {
                class: DatabinClass::Precinct,
                in_class_id: 0,
            },
            0,
        );
        bin.append(0, &[0b1111_1111], false).unwrap();
        let mut reader = BitReader::new(&bin, BitCursor::start());
        let mut decoder = LengthDecoder::default();
        assert_eq!(decoder.try_decode(&mut reader, 1).unwrap(), None);
    }

    #[test]
    fn runaway_lblock_is_rejected() {
        let bin = databin_with(&[0xFF; 8]);
        let mut reader = BitReader::new(&bin, BitCursor::start());
        let mut decoder = LengthDecoder::default();
        assert!(decoder.try_decode(&mut reader, 1).is_err());
    }
}
