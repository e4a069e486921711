//! Parses packet headers of one precinct's databin, one quality layer
//! at a time, yielding each packet's end byte offset.
//!
//! Parsing is transactional: every attempt runs on a clone of the
//! committed state and replaces it only when the whole packet header
//! (and its trailing markers) could be read from loaded bytes.

use crate::codestream::{CodestreamStructure, PrecinctPosition};
use crate::databin::Databin;
use crate::error::JpipError;
use crate::quality::bits::{BitCursor, BitReader};
use crate::quality::coding_passes;
use crate::quality::lengths::LengthDecoder;
use crate::quality::tag_tree::TagTree;

#[derive(Debug, Clone)]
struct CodeblockState {
    included: bool,
    zero_bitplanes: Option<u32>,
    lengths: LengthDecoder,
}

#[derive(Debug, Clone)]
struct SubbandState {
    inclusion_tree: TagTree,
    bitplane_tree: TagTree,
    codeblocks_wide: u32,
    codeblocks_high: u32,
    codeblocks: Vec<CodeblockState>,
}

impl SubbandState {
    fn new(wide: u32, high: u32) -> Self {
        let count = (wide * high) as usize;
        Self {
            inclusion_tree: TagTree::new(wide, high),
            bitplane_tree: TagTree::new(wide, high),
            codeblocks_wide: wide,
            codeblocks_high: high,
            codeblocks: vec![
                CodeblockState {
                    included: false,
                    zero_bitplanes: None,
                    lengths: LengthDecoder::default(),
                };
                count
            ],
        }
    }
}

/// Committed parse state; cloned per attempt.
#[derive(Debug, Clone)]
struct ParseProgress {
    cursor: BitCursor,
    /// End byte offset of each fully parsed layer's packet.
    packet_end_offsets: Vec<usize>,
    subbands: Vec<SubbandState>,
}

pub struct PrecinctParser {
    uses_sop: bool,
    uses_eph: bool,
    num_quality_layers: u32,
    progress: ParseProgress,
}

impl PrecinctParser {
    pub fn new(
        structure: &CodestreamStructure,
        position: PrecinctPosition,
    ) -> Result<Self, JpipError> {
        let tile = structure.tile(position.tile)?;
        let component = tile
            .components
            .get(position.component)
            .ok_or(JpipError::Internal("component out of range"))?;
        let level = component
            .resolutions
            .get(position.resolution as usize)
            .ok_or(JpipError::Internal("resolution out of range"))?;
        let (wide, high) = level.codeblocks_in_precinct(position.x, position.y);
        let subbands = (0..level.subband_count)
            .map(|_| SubbandState::new(wide, high))
            .collect();
        Ok(Self {
            uses_sop: structure.uses_sop,
            uses_eph: structure.uses_eph,
            num_quality_layers: u32::from(structure.num_quality_layers),
            progress: ParseProgress {
                cursor: BitCursor::start(),
                packet_end_offsets: Vec::new(),
                subbands,
            },
        })
    }

    /// Layers whose packets have been fully parsed so far.
    pub fn parsed_layers(&self) -> u32 {
        self.progress.packet_end_offsets.len() as u32
    }

    pub fn num_quality_layers(&self) -> u32 {
        self.num_quality_layers
    }

    /// End byte offset of the packet data covering `layer_count` layers,
    /// if that many layers have been parsed.
    pub fn packet_end_offset(&self, layer_count: u32) -> Option<usize> {
        if layer_count == 0 {
            return Some(0);
        }
        self.progress
            .packet_end_offsets
            .get(layer_count as usize - 1)
            .copied()
    }

    /// Attempts to parse the next layer's packet. `Ok(None)` leaves the
    /// committed state untouched for a later retry.
    pub fn try_parse_next_packet(
        &mut self,
        databin: &Databin,
    ) -> Result<Option<usize>, JpipError> {
        if self.parsed_layers() >= self.num_quality_layers {
            return Err(JpipError::Internal("all quality layers already parsed"));
        }
        let mut work = self.progress.clone();
        let layer = work.packet_end_offsets.len() as u32;
        match self.parse_packet(&mut work, databin, layer)? {
            Some(end) => {
                work.packet_end_offsets.push(end);
                work.cursor = BitCursor::at(end);
                self.progress = work;
                Ok(Some(end))
            }
            None => Ok(None),
        }
    }

    fn parse_packet(
        &self,
        work: &mut ParseProgress,
        databin: &Databin,
        layer: u32,
    ) -> Result<Option<usize>, JpipError> {
        let mut start = work.cursor.byte_offset;
        if self.uses_sop {
            match self.skip_sop(databin, start) {
                Some(next) => start = next,
                None => return Ok(None),
            }
        }
        let mut reader = BitReader::new(databin, BitCursor::at(start));

        let Some(not_empty) = reader.try_read_bit() else {
            return Ok(None);
        };
        let mut body_length = 0usize;
        if not_empty == 1 {
            for subband in &mut work.subbands {
                for y in 0..subband.codeblocks_high {
                    for x in 0..subband.codeblocks_wide {
                        let index = (y * subband.codeblocks_wide + x) as usize;
                        let included = if subband.codeblocks[index].included {
                            let Some(bit) = reader.try_read_bit() else {
                                return Ok(None);
                            };
                            bit == 1
                        } else {
                            let Some(above) =
                                subband.inclusion_tree.try_decode(&mut reader, x, y, layer + 1)
                            else {
                                return Ok(None);
                            };
                            let included = !above;
                            if included {
                                let Some(planes) =
                                    subband.bitplane_tree.try_decode_value(&mut reader, x, y)
                                else {
                                    return Ok(None);
                                };
                                let cb = &mut subband.codeblocks[index];
                                cb.included = true;
                                cb.zero_bitplanes = Some(planes);
                            }
                            included
                        };
                        if included {
                            let Some(passes) = coding_passes::try_decode(&mut reader) else {
                                return Ok(None);
                            };
                            let Some(length) =
                                subband.codeblocks[index].lengths.try_decode(&mut reader, passes)?
                            else {
                                return Ok(None);
                            };
                            body_length += length as usize;
                        }
                    }
                }
            }
        }
        if reader.align_to_byte().is_none() {
            return Ok(None);
        }
        let mut header_end = reader.byte_position();
        if self.uses_eph {
            match Self::expect_eph(databin, header_end)? {
                Some(next) => header_end = next,
                None => return Ok(None),
            }
        }
        Ok(Some(header_end + body_length))
    }

    /// Skips an SOP marker segment when one starts the packet.
    fn skip_sop(&self, databin: &Databin, pos: usize) -> Option<usize> {
        let b0 = databin.read_byte(pos)?;
        let b1 = databin.read_byte(pos + 1)?;
        if b0 != 0xFF || b1 != 0x91 {
            return Some(pos);
        }
        // FF 91, Lsop, Nsop: six bytes total, all part of the stream.
        databin.read_byte(pos + 5)?;
        Some(pos + 6)
    }

    fn expect_eph(databin: &Databin, pos: usize) -> Result<Option<usize>, JpipError> {
        let Some(b0) = databin.read_byte(pos) else {
            return Ok(None);
        };
        let Some(b1) = databin.read_byte(pos + 1) else {
            return Ok(None);
        };
        if b0 != 0xFF || b1 != 0x92 {
            return Err(JpipError::InvalidMarkerSegment("missing EPH"));
        }
        Ok(Some(pos + 2))
    }
}
