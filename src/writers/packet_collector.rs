//! Collects the certified-loaded packet bytes of a tile's precincts.
//!
//! For each precinct the quality-layer cache answers how many layers
//! are fully present; the collector keeps those bytes together with the
//! per-layer packet boundaries so the reconstructor can interleave them
//! in progression order.

use std::collections::HashMap;

use log::trace;

use crate::codestream::{CodestreamStructure, PrecinctPosition};
use crate::databin::{DatabinsSaver, ObjectPoolByDatabin};
use crate::error::JpipError;
use crate::quality::layer_cache::PacketOffsetSource;
use crate::quality::PrecinctQualityCache;

/// Packet data of one precinct, trimmed to fully loaded layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedPrecinct {
    pub position: PrecinctPosition,
    pub num_quality_layers: u32,
    /// Contiguous packet bytes for layers `1..=num_quality_layers`.
    pub bytes: Vec<u8>,
    /// Cumulative end offset per layer within `bytes`.
    pub layer_bounds: Vec<usize>,
}

impl CollectedPrecinct {
    fn absent(position: PrecinctPosition) -> Self {
        Self {
            position,
            num_quality_layers: 0,
            bytes: Vec::new(),
            layer_bounds: Vec::new(),
        }
    }

    /// Bytes of one packet, 0-based layer index. `None` past the
    /// collected layers.
    pub fn packet_bytes(&self, layer: u32) -> Option<&[u8]> {
        if layer >= self.num_quality_layers {
            return None;
        }
        let i = layer as usize;
        let start = if i == 0 { 0 } else { self.layer_bounds[i - 1] };
        Some(&self.bytes[start..self.layer_bounds[i]])
    }
}

/// Key within one tile: `(component, resolution, y, x)`.
pub type PrecinctKey = (usize, u8, u32, u32);

#[derive(Debug, Default)]
pub struct CollectedTile {
    pub precincts: HashMap<PrecinctKey, CollectedPrecinct>,
}

impl CollectedTile {
    pub fn get(&self, component: usize, resolution: u8, x: u32, y: u32) -> Option<&CollectedPrecinct> {
        self.precincts.get(&(component, resolution, y, x))
    }
}

pub struct PacketCollector<'a> {
    structure: &'a CodestreamStructure,
    pool: &'a mut ObjectPoolByDatabin<PrecinctQualityCache>,
}

impl<'a> PacketCollector<'a> {
    pub fn new(
        structure: &'a CodestreamStructure,
        pool: &'a mut ObjectPoolByDatabin<PrecinctQualityCache>,
    ) -> Self {
        Self { structure, pool }
    }

    /// Collects every precinct of `tile` up to `max_resolution` levels
    /// and at most `max_quality` layers each.
    pub fn collect_tile(
        &mut self,
        saver: &DatabinsSaver,
        tile: u32,
        max_resolution: u8,
        max_quality: u32,
    ) -> Result<CollectedTile, JpipError> {
        let tile_structure = self.structure.tile(tile)?;
        let mut collected = CollectedTile::default();
        for (component, tile_component) in tile_structure.components.iter().enumerate() {
            for (r, level) in tile_component.resolutions.iter().enumerate() {
                let resolution = r as u8;
                if resolution > max_resolution {
                    break;
                }
                for y in 0..level.precincts_high {
                    for x in 0..level.precincts_wide {
                        let position = PrecinctPosition {
                            tile,
                            component,
                            resolution,
                            x,
                            y,
                        };
                        let precinct = self.collect_precinct(saver, &tile_structure, position, max_quality)?;
                        collected
                            .precincts
                            .insert((component, resolution, y, x), precinct);
                    }
                }
            }
        }
        Ok(collected)
    }

    fn collect_precinct(
        &mut self,
        saver: &DatabinsSaver,
        tile_structure: &crate::codestream::TileStructure,
        position: PrecinctPosition,
        max_quality: u32,
    ) -> Result<CollectedPrecinct, JpipError> {
        let seq = tile_structure
            .precinct_seq(position.component, position.resolution, position.x, position.y)
            .ok_or(JpipError::Internal("precinct outside its level"))?;
        let in_class_id = self.structure.precinct_in_class_id(position.tile, position.component, seq);
        let Some(databin) = saver.loaded_precinct(in_class_id) else {
            trace!("precinct databin {in_class_id} absent, emitting empty");
            return Ok(CollectedPrecinct::absent(position));
        };
        let databin = databin.borrow();
        let structure = self.structure;
        let cache = self.pool.object_for(&databin, || {
            PrecinctQualityCache::for_precinct(structure, position)
        })?;
        let mut cache = cache.borrow_mut();
        let best = cache.best_quality(&databin, max_quality)?;
        if best.num_quality_layers == 0 {
            return Ok(CollectedPrecinct::absent(position));
        }
        let mut layer_bounds = Vec::with_capacity(best.num_quality_layers as usize);
        for layer in 1..=best.num_quality_layers {
            let end = cache
                .source_mut()
                .packet_end_offset(&databin, layer)?
                .ok_or(JpipError::Internal("resolved layer lost its offset"))?;
            layer_bounds.push(end);
        }
        let bytes = databin
            .read_bytes(0, best.end_offset)
            .ok_or(JpipError::Internal("certified bytes not loaded"))?
            .to_vec();
        Ok(CollectedPrecinct {
            position,
            num_quality_layers: best.num_quality_layers,
            bytes,
            layer_bounds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codestream::structure::tests::synthetic_main_header;
    use crate::databin::DatabinClass;
    use crate::protocol::MessageHeader;

    /// Loads `bytes` into the precinct databin with the given in-class
    /// id, marking it complete.
    fn load_precinct(saver: &mut DatabinsSaver, in_class_id: u64, bytes: &[u8]) {
        let header = MessageHeader {
            class: DatabinClass::Precinct,
            codestream_index: 0,
            in_class_id,
            body_offset: 0,
            body_length: bytes.len(),
            is_last_in_databin: true,
            aux: None,
        };
        let bin = saver.databin_for(&header).unwrap().unwrap();
        bin.borrow_mut().append(0, bytes, true).unwrap();
    }

    // Level-0 packets from the packet-parser tests: layer boundaries at
    // 6 and 10.
    const PRECINCT_BYTES: [u8; 10] = [
        0b1100_0100,
        0b1000_0000,
        0xAA,
        0xBB,
        0xCC,
        0xDD,
        0b1110_0001,
        0b0000_0000,
        0xEE,
        0xFF,
    ];

    #[test]
    fn collects_loaded_precincts_and_marks_absent_ones() {
        let structure = CodestreamStructure::from_bytes(&synthetic_main_header()).unwrap();
        let mut saver = DatabinsSaver::new();
        // Precinct 0 is the level-0 precinct of the only tile.
        load_precinct(&mut saver, 0, &PRECINCT_BYTES);
        let mut pool = ObjectPoolByDatabin::new();
        let mut collector = PacketCollector::new(&structure, &mut pool);
        let collected = collector.collect_tile(&saver, 0, 3, 2).unwrap();

        let level0 = collected.get(0, 0, 0, 0).unwrap();
        assert_eq!(level0.num_quality_layers, 2);
        assert_eq!(level0.layer_bounds, vec![6, 10]);
        assert_eq!(level0.packet_bytes(0).unwrap(), &PRECINCT_BYTES[..6]);
        assert_eq!(level0.packet_bytes(1).unwrap(), &PRECINCT_BYTES[6..]);
        assert_eq!(level0.packet_bytes(2), None);

        // Nothing was loaded for level 1's precinct.
        let level1 = collected.get(0, 1, 0, 0).unwrap();
        assert_eq!(level1.num_quality_layers, 0);
        // All precincts of levels 0..=3 are present in the map.
        assert_eq!(collected.precincts.len(), 1 + 1 + 4 + 16);
    }

    #[test]
    fn resolution_cap_limits_the_walk() {
        let structure = CodestreamStructure::from_bytes(&synthetic_main_header()).unwrap();
        let saver = DatabinsSaver::new();
        let mut pool = ObjectPoolByDatabin::new();
        let mut collector = PacketCollector::new(&structure, &mut pool);
        let collected = collector.collect_tile(&saver, 0, 1, 3).unwrap();
        assert_eq!(collected.precincts.len(), 2);
    }
}
