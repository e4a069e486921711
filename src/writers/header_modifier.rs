//! Rewrites main/tile header bytes for a resolution-reduced output.
//!
//! SIZ dimensions shrink to the reduced grid, COD/COC lose the dropped
//! decomposition levels and their precinct-size bytes (with the segment
//! length fixed up), and marker segments whose indices cannot stay
//! valid in the rewritten stream (TLM/PLM/PLT/POC/PPM/PPT) are
//! stripped.

use crate::codestream::markers::{Marker, MarkerIndex, MarkerSegment};
use crate::codestream::CodestreamStructure;
use crate::error::JpipError;
use crate::writers::stream::CodestreamWriter;

pub struct HeaderModifier<'a> {
    structure: &'a CodestreamStructure,
    resolution_reduction: u8,
}

impl<'a> HeaderModifier<'a> {
    pub fn new(structure: &'a CodestreamStructure, resolution_reduction: u8) -> Result<Self, JpipError> {
        if resolution_reduction > structure.max_decomposition_levels() {
            return Err(JpipError::Internal("reduction exceeds decomposition levels"));
        }
        Ok(Self {
            structure,
            resolution_reduction,
        })
    }

    /// Emits the modified main header, SOC included.
    pub fn modify_main_header(
        &self,
        bytes: &[u8],
        writer: &mut CodestreamWriter,
    ) -> Result<(), JpipError> {
        self.modify(bytes, true, writer)
    }

    /// Emits a modified tile header (bare marker segments).
    pub fn modify_tile_header(
        &self,
        bytes: &[u8],
        writer: &mut CodestreamWriter,
    ) -> Result<(), JpipError> {
        self.modify(bytes, false, writer)
    }

    fn modify(
        &self,
        bytes: &[u8],
        expect_soc: bool,
        writer: &mut CodestreamWriter,
    ) -> Result<(), JpipError> {
        let index = MarkerIndex::build(bytes, expect_soc)?;
        for segment in index.segments() {
            match segment.marker {
                Marker::StartOfCodestream => writer.write_marker(Marker::StartOfCodestream),
                Marker::ImageAndTileSize => self.rewrite_siz(bytes, *segment, writer)?,
                Marker::CodingStyleDefault => self.rewrite_cod(bytes, *segment, writer)?,
                Marker::CodingStyleComponent => self.rewrite_coc(bytes, *segment, writer)?,
                // Packet/tile-part index tables and progression changes
                // no longer match the rewritten stream.
                Marker::TilePartLengths
                | Marker::PacketLengthsMain
                | Marker::PacketLengthsTile
                | Marker::ProgressionOrderChange
                | Marker::PackedHeadersMain
                | Marker::PackedHeadersTile => {}
                _ => writer.write_bytes(&bytes[segment.offset..segment.end()]),
            }
        }
        Ok(())
    }

    fn rewrite_siz(
        &self,
        bytes: &[u8],
        segment: MarkerSegment,
        writer: &mut CodestreamWriter,
    ) -> Result<(), JpipError> {
        let params = &bytes[segment.params_offset()..segment.end()];
        if params.len() < 36 {
            return Err(JpipError::InvalidMarkerSegment("SIZ too short"));
        }
        let mut out = params.to_vec();
        // Eight u32 grid fields follow Rsiz; each shrinks by the dropped
        // resolution levels.
        for field in 0..8 {
            let at = 2 + field * 4;
            let value = u32::from_be_bytes([params[at], params[at + 1], params[at + 2], params[at + 3]]);
            let reduced = ceil_shift(value, self.resolution_reduction);
            out[at..at + 4].copy_from_slice(&reduced.to_be_bytes());
        }
        writer.write_segment(Marker::ImageAndTileSize, &out);
        Ok(())
    }

    fn rewrite_cod(
        &self,
        bytes: &[u8],
        segment: MarkerSegment,
        writer: &mut CodestreamWriter,
    ) -> Result<(), JpipError> {
        let params = &bytes[segment.params_offset()..segment.end()];
        if params.len() < 10 {
            return Err(JpipError::InvalidMarkerSegment("COD too short"));
        }
        // Scod(1) Sprog(1) layers(2) MCT(1), then the SPcod tail.
        let explicit_precincts = params[0] & 0x01 != 0;
        let out = self.rewrite_style_tail(params, 5, explicit_precincts)?;
        writer.write_segment(Marker::CodingStyleDefault, &out);
        Ok(())
    }

    fn rewrite_coc(
        &self,
        bytes: &[u8],
        segment: MarkerSegment,
        writer: &mut CodestreamWriter,
    ) -> Result<(), JpipError> {
        let params = &bytes[segment.params_offset()..segment.end()];
        let cindex_len = if self.structure.num_components() < 257 { 1 } else { 2 };
        if params.len() < cindex_len + 6 {
            return Err(JpipError::InvalidMarkerSegment("COC too short"));
        }
        let explicit_precincts = params[cindex_len] & 0x01 != 0;
        let out = self.rewrite_style_tail(params, cindex_len + 1, explicit_precincts)?;
        writer.write_segment(Marker::CodingStyleComponent, &out);
        Ok(())
    }

    /// Drops resolution levels from the SPcod/SPcoc tail whose
    /// decomposition-level byte sits at `levels_at`.
    fn rewrite_style_tail(
        &self,
        params: &[u8],
        levels_at: usize,
        explicit_precincts: bool,
    ) -> Result<Vec<u8>, JpipError> {
        let levels = params[levels_at];
        if self.resolution_reduction > levels {
            return Err(JpipError::Internal("reduction exceeds decomposition levels"));
        }
        let new_levels = levels - self.resolution_reduction;
        let mut out = params.to_vec();
        out[levels_at] = new_levels;
        if explicit_precincts {
            let precincts_at = levels_at + 5;
            let expected = precincts_at + levels as usize + 1;
            if params.len() < expected {
                return Err(JpipError::InvalidMarkerSegment("truncated precinct sizes"));
            }
            // Keep the low-resolution entries; the dropped levels' bytes
            // fall off the end.
            out.truncate(precincts_at + new_levels as usize + 1);
            out.extend_from_slice(&params[expected..]);
        }
        Ok(out)
    }
}

fn ceil_shift(x: u32, shift: u8) -> u32 {
    if shift == 0 {
        return x;
    }
    let d = 1u32 << shift;
    (x + d - 1) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codestream::structure::tests::synthetic_main_header;

    #[test]
    fn identity_when_no_reduction() {
        let bytes = synthetic_main_header();
        let structure = CodestreamStructure::from_bytes(&bytes).unwrap();
        let modifier = HeaderModifier::new(&structure, 0).unwrap();
        let mut writer = CodestreamWriter::new();
        modifier.modify_main_header(&bytes, &mut writer).unwrap();
        assert_eq!(writer.into_bytes(), bytes);
    }

    #[test]
    fn reduction_shrinks_siz_and_cod() {
        let bytes = synthetic_main_header();
        let structure = CodestreamStructure::from_bytes(&bytes).unwrap();
        let modifier = HeaderModifier::new(&structure, 1).unwrap();
        let mut writer = CodestreamWriter::new();
        modifier.modify_main_header(&bytes, &mut writer).unwrap();
        let out = writer.into_bytes();

        let reduced = CodestreamStructure::from_bytes(&out).unwrap();
        assert_eq!((reduced.width, reduced.height), (128, 128));
        assert_eq!((reduced.tile_width, reduced.tile_height), (128, 128));
        assert_eq!(reduced.style_for_component(0).decomposition_levels, 2);
        // One precinct-size byte dropped, segment length fixed up.
        assert_eq!(reduced.style_for_component(0).precinct_size_exps.len(), 3);
        assert_eq!(out.len(), bytes.len() - 1);
    }

    #[test]
    fn strips_index_tables() {
        let mut bytes = synthetic_main_header();
        // Append a TLM segment.
        bytes.extend_from_slice(&[0xFF, 0x55, 0x00, 0x06, 0x00, 0x60, 0x00, 0x00]);
        let structure = CodestreamStructure::from_bytes(&bytes).unwrap();
        let modifier = HeaderModifier::new(&structure, 0).unwrap();
        let mut writer = CodestreamWriter::new();
        modifier.modify_main_header(&bytes, &mut writer).unwrap();
        let out = writer.into_bytes();
        let index = MarkerIndex::build(&out, true).unwrap();
        assert!(index.find(Marker::TilePartLengths).is_none());
        assert!(index.find(Marker::QuantizationDefault).is_some());
    }

    #[test]
    fn excessive_reduction_is_rejected() {
        let bytes = synthetic_main_header();
        let structure = CodestreamStructure::from_bytes(&bytes).unwrap();
        assert!(HeaderModifier::new(&structure, 4).is_err());
    }
}
