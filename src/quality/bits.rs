//! Bit-level reads over a databin's loaded bytes, with the packet-header
//! bit-stuffing rule: after a `0xFF` byte only the low 7 bits of the
//! following byte carry data.
//!
//! Every read returns `None` when it would need bytes that are not
//! loaded yet. Callers run compound read sequences on a snapshot
//! ([`BitCursor`]) and commit the advanced cursor only when the whole
//! sequence succeeded, so a failed attempt leaves no trace.

use crate::databin::Databin;

/// Resumable position within a databin's bitstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitCursor {
    pub byte_offset: usize,
    /// Bits already consumed from the current byte (stuffed bit
    /// included).
    pub bits_consumed: u8,
    /// Whether the byte before `byte_offset` was `0xFF`.
    prev_byte_was_ff: bool,
}

impl BitCursor {
    pub fn start() -> Self {
        Self::at(0)
    }

    /// A byte-aligned cursor with no stuffing context.
    pub fn at(byte_offset: usize) -> Self {
        Self {
            byte_offset,
            bits_consumed: 0,
            prev_byte_was_ff: false,
        }
    }
}

pub struct BitReader<'a> {
    databin: &'a Databin,
    cursor: BitCursor,
}

impl<'a> BitReader<'a> {
    pub fn new(databin: &'a Databin, cursor: BitCursor) -> Self {
        Self { databin, cursor }
    }

    pub fn cursor(&self) -> BitCursor {
        self.cursor
    }

    /// Byte offset of the cursor; meaningful after [`Self::align_to_byte`].
    pub fn byte_position(&self) -> usize {
        self.cursor.byte_offset
    }

    pub fn try_read_bit(&mut self) -> Option<u8> {
        let byte = self.databin.read_byte(self.cursor.byte_offset)?;
        // A stuffed byte carries 7 bits; its forced-zero high bit was
        // accounted for by pre-consuming one bit position.
        let mut consumed = self.cursor.bits_consumed;
        if consumed == 0 && self.cursor.prev_byte_was_ff {
            consumed = 1;
        }
        let bit = (byte >> (7 - consumed)) & 1;
        consumed += 1;
        if consumed == 8 {
            self.cursor.byte_offset += 1;
            self.cursor.bits_consumed = 0;
            self.cursor.prev_byte_was_ff = byte == 0xFF;
        } else {
            self.cursor.bits_consumed = consumed;
        }
        Some(bit)
    }

    pub fn try_read_bits(&mut self, count: u8) -> Option<u32> {
        let mut bits = 0u32;
        for _ in 0..count {
            bits = (bits << 1) | u32::from(self.try_read_bit()?);
        }
        Some(bits)
    }

    /// Counts consecutive one-bits. Stops after consuming the
    /// terminating zero bit, or without consuming further once `limit`
    /// ones were seen.
    pub fn try_count_ones(&mut self, limit: u32) -> Option<u32> {
        let mut count = 0;
        while count < limit {
            if self.try_read_bit()? == 0 {
                return Some(count);
            }
            count += 1;
        }
        Some(count)
    }

    /// Advances to the next byte boundary, also skipping the stuffed
    /// byte a trailing `0xFF` forces into the header.
    pub fn align_to_byte(&mut self) -> Option<()> {
        if self.cursor.bits_consumed > 0 {
            let byte = self.databin.read_byte(self.cursor.byte_offset)?;
            self.cursor.byte_offset += 1;
            self.cursor.bits_consumed = 0;
            self.cursor.prev_byte_was_ff = byte == 0xFF;
        }
        if self.cursor.prev_byte_was_ff {
            // The padding byte exists in the stream and belongs to the
            // header; a header may not end on a 0xFF byte.
            self.databin.read_byte(self.cursor.byte_offset)?;
            self.cursor.byte_offset += 1;
            self.cursor.prev_byte_was_ff = false;
        }
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::databin::{DatabinClass, DatabinId};

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
    fn reads_bits_most_significant_first() {
        let bin = databin_with(&[0b1011_0001]);
        let mut reader = BitReader::new(&bin, BitCursor::start());
        assert_eq!(reader.try_read_bit(), Some(1));
        assert_eq!(reader.try_read_bit(), Some(0));
        assert_eq!(reader.try_read_bits(6), Some(0b11_0001));
        assert_eq!(reader.try_read_bit(), None);
    }

    #[test]
    fn byte_after_ff_contributes_seven_bits() {
        let bin = databin_with(&[0xFF, 0b0101_0101]);
        let mut reader = BitReader::new(&bin, BitCursor::start());
        assert_eq!(reader.try_read_bits(8), Some(0xFF));
        // High bit of the stuffed byte is skipped.
        assert_eq!(reader.try_read_bits(7), Some(0b101_0101));
        assert_eq!(reader.byte_position(), 2);
    }

    #[test]
    fn count_ones_consumes_the_terminating_zero() {
        let bin = databin_with(&[0b1110_1000]);
        let mut reader = BitReader::new(&bin, BitCursor::start());
        assert_eq!(reader.try_count_ones(16), Some(3));
        assert_eq!(reader.try_read_bit(), Some(1));
    }

    #[test]
    fn count_ones_honors_the_limit() {
        let bin = databin_with(&[0b1111_0000]);
        let mut reader = BitReader::new(&bin, BitCursor::start());
        assert_eq!(reader.try_count_ones(2), Some(2));
        // The third one-bit was not consumed.
        assert_eq!(reader.try_read_bit(), Some(1));
    }

    #[test]
    fn missing_byte_yields_none_and_cursor_is_restorable() {
        let mut bin = Databin::new(
            DatabinId {
                class: DatabinClass::Precinct,
                in_class_id: 0,
            },
            0,
        );
        bin.append(0, &[0b1100_0000], false).unwrap();
        let mut reader = BitReader::new(&bin, BitCursor::start());
        let snapshot = reader.cursor();
        assert_eq!(reader.try_read_bits(8), Some(0b1100_0000));
        assert_eq!(reader.try_read_bit(), None);
        // Roll back and retry from the snapshot.
        let mut reader = BitReader::new(&bin, snapshot);
        assert_eq!(reader.try_read_bits(4), Some(0b1100));
    }

    #[test]
    fn align_skips_partial_byte_and_trailing_stuffing() {
        let bin = databin_with(&[0b1000_0000, 0x55, 0xFF, 0x00]);
        let mut reader = BitReader::new(&bin, BitCursor::start());
        assert_eq!(reader.try_read_bit(), Some(1));
        reader.align_to_byte().unwrap();
        assert_eq!(reader.byte_position(), 1);
        // Consume through the 0xFF; the stuffed byte is skipped too.
        assert_eq!(reader.try_read_bits(8), Some(0x55));
        assert_eq!(reader.try_read_bits(8), Some(0xFF));
        reader.align_to_byte().unwrap();
        assert_eq!(reader.byte_position(), 4);
    }
}
