//! Marker and segment emission for reconstructed codestreams.

use crate::codestream::markers::{Marker, MARKER_START_BYTE};

/// A growable big-endian codestream writer.
#[derive(Debug, Default)]
pub struct CodestreamWriter {
    out: Vec<u8>,
}

impl CodestreamWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    pub fn write_byte(&mut self, value: u8) {
        self.out.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    pub fn write_marker(&mut self, marker: Marker) {
        self.out.push(MARKER_START_BYTE);
        self.out.push(marker as u8);
    }

    /// Marker plus length field plus parameter bytes.
    pub fn write_segment(&mut self, marker: Marker, params: &[u8]) {
        self.write_marker(marker);
        self.write_u16((params.len() + 2) as u16);
        self.write_bytes(params);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_length_counts_itself() {
        let mut w = CodestreamWriter::new();
        w.write_marker(Marker::StartOfCodestream);
        w.write_segment(Marker::Comment, b"hi");
        assert_eq!(w.into_bytes(), vec![0xFF, 0x4F, 0xFF, 0x64, 0x00, 0x04, b'h', b'i']);
    }
}
