//! JPEG 2000 marker codes and the marker-offset index built over a
//! header databin.

use num_enum::TryFromPrimitive;

use crate::error::JpipError;

pub const MARKER_START_BYTE: u8 = 0xFF;

/// Second byte of a `0xFFxx` JPEG 2000 marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Marker {
    /// SOC: start of codestream.
    StartOfCodestream = 0x4F,
    /// CAP: extended capabilities.
    Capability = 0x50,
    /// SIZ: image and tile size.
    ImageAndTileSize = 0x51,
    /// COD: default coding style.
    CodingStyleDefault = 0x52,
    /// COC: per-component coding style override.
    CodingStyleComponent = 0x53,
    /// TLM: tile-part lengths.
    TilePartLengths = 0x55,
    /// PLM: packet lengths, main header.
    PacketLengthsMain = 0x57,
    /// PLT: packet lengths, tile-part header.
    PacketLengthsTile = 0x58,
    /// QCD: default quantization.
    QuantizationDefault = 0x5C,
    /// QCC: per-component quantization override.
    QuantizationComponent = 0x5D,
    /// RGN: region of interest.
    RegionOfInterest = 0x5E,
    /// POC: progression order change.
    ProgressionOrderChange = 0x5F,
    /// PPM: packed packet headers, main header.
    PackedHeadersMain = 0x60,
    /// PPT: packed packet headers, tile-part header.
    PackedHeadersTile = 0x61,
    /// CRG: component registration.
    ComponentRegistration = 0x63,
    /// COM: comment.
    Comment = 0x64,
    /// SOT: start of tile-part.
    StartOfTile = 0x90,
    /// SOP: start of packet.
    StartOfPacket = 0x91,
    /// EPH: end of packet header.
    EndOfPacketHeader = 0x92,
    /// SOD: start of data.
    StartOfData = 0x93,
    /// EOC: end of codestream.
    EndOfCodestream = 0xD9,
}

impl Marker {
    /// Markers that stand alone, with no length field.
    pub fn is_parameterless(self) -> bool {
        matches!(
            self,
            Self::StartOfCodestream
                | Self::StartOfPacket
                | Self::EndOfPacketHeader
                | Self::StartOfData
                | Self::EndOfCodestream
        )
    }
}

/// One marker segment located within a header databin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerSegment {
    pub marker: Marker,
    /// Offset of the `0xFF` byte within the databin.
    pub offset: usize,
    /// Total byte count including the two marker bytes.
    pub total_length: usize,
}

impl MarkerSegment {
    /// Offset of the first parameter byte (past marker and length field).
    pub fn params_offset(self) -> usize {
        self.offset + 4
    }

    pub fn end(self) -> usize {
        self.offset + self.total_length
    }
}

/// Marker-offset index over a header databin's bytes, built once.
///
/// A main header starts at SOC and the scan stops at the databin's end
/// (JPIP delivers the main header without the first SOT). A tile header
/// databin carries bare marker segments with neither SOT nor SOD.
#[derive(Debug, Clone, Default)]
pub struct MarkerIndex {
    segments: Vec<MarkerSegment>,
}

impl MarkerIndex {
    pub fn build(bytes: &[u8], expect_soc: bool) -> Result<Self, JpipError> {
        let mut segments = Vec::new();
        let mut pos = 0;
        if expect_soc {
            if bytes.len() < 2 || bytes[0] != MARKER_START_BYTE || bytes[1] != 0x4F {
                return Err(JpipError::InvalidMarkerSegment("missing SOC"));
            }
            segments.push(MarkerSegment {
                marker: Marker::StartOfCodestream,
                offset: 0,
                total_length: 2,
            });
            pos = 2;
        }
        while pos < bytes.len() {
            if bytes[pos] != MARKER_START_BYTE {
                return Err(JpipError::InvalidMarkerSegment("expected marker byte"));
            }
            if pos + 1 >= bytes.len() {
                return Err(JpipError::InvalidMarkerSegment("truncated marker"));
            }
            let marker = Marker::try_from(bytes[pos + 1])
                .map_err(|_| JpipError::InvalidMarkerSegment("unknown marker code"))?;
            let total_length = if marker.is_parameterless() {
                2
            } else {
                if pos + 4 > bytes.len() {
                    return Err(JpipError::InvalidMarkerSegment("truncated segment length"));
                }
                let len = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
                if len < 2 {
                    return Err(JpipError::InvalidMarkerSegment("segment length below 2"));
                }
                2 + len
            };
            if pos + total_length > bytes.len() {
                return Err(JpipError::InvalidMarkerSegment("segment runs past data"));
            }
            segments.push(MarkerSegment {
                marker,
                offset: pos,
                total_length,
            });
            pos += total_length;
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[MarkerSegment] {
        &self.segments
    }

    /// First segment with the given marker.
    pub fn find(&self, marker: Marker) -> Option<MarkerSegment> {
        self.segments.iter().copied().find(|s| s.marker == marker)
    }

    pub fn find_all<'a>(
        &'a self,
        marker: Marker,
    ) -> impl Iterator<Item = MarkerSegment> + 'a {
        self.segments
            .iter()
            .copied()
            .filter(move |s| s.marker == marker)
    }
}
