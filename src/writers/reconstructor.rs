//! Assembles a self-contained, decodable codestream from cached
//! partial data: modified main header, per-tile SOT/header/SOD, packet
//! bytes in progression order, EOC.

use log::debug;

use crate::codestream::markers::Marker;
use crate::codestream::{CodestreamStructure, ProgressionOrder};
use crate::databin::{DatabinsSaver, ObjectPoolByDatabin};
use crate::error::JpipError;
use crate::quality::PrecinctQualityCache;
use crate::writers::header_modifier::HeaderModifier;
use crate::writers::packet_collector::{CollectedTile, PacketCollector};
use crate::writers::stream::CodestreamWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconstructionParams {
    /// Resolution levels to drop from the output.
    pub resolution_reduction: u8,
    /// Upper bound on quality layers whose data is included; layers
    /// beyond the available data become empty packets.
    pub max_quality_layers: u32,
    /// Overrides the codestream's progression order for packet
    /// traversal.
    pub progression_order: Option<ProgressionOrder>,
}

impl Default for ReconstructionParams {
    fn default() -> Self {
        Self {
            resolution_reduction: 0,
            max_quality_layers: u32::MAX,
            progression_order: None,
        }
    }
}

/// One packet slot in emission order.
#[derive(Clone, Copy)]
struct PacketSlot {
    layer: u32,
    component: usize,
    resolution: u8,
    x: u32,
    y: u32,
}

pub struct Reconstructor<'a> {
    structure: &'a CodestreamStructure,
    pool: &'a mut ObjectPoolByDatabin<PrecinctQualityCache>,
}

impl<'a> Reconstructor<'a> {
    pub fn new(
        structure: &'a CodestreamStructure,
        pool: &'a mut ObjectPoolByDatabin<PrecinctQualityCache>,
    ) -> Self {
        Self { structure, pool }
    }

    /// Builds the codestream. `Ok(None)` until the main header databin
    /// is fully loaded.
    pub fn reconstruct(
        &mut self,
        saver: &DatabinsSaver,
        params: ReconstructionParams,
    ) -> Result<Option<Vec<u8>>, JpipError> {
        let main_header = saver.main_header();
        let main_header = main_header.borrow();
        if !main_header.is_fully_loaded() {
            return Ok(None);
        }
        let len = main_header
            .known_length()
            .ok_or(JpipError::Internal("fully loaded databin without length"))?;
        let header_bytes = main_header
            .read_bytes(0, len)
            .ok_or(JpipError::Internal("fully loaded databin without bytes"))?;

        let modifier = HeaderModifier::new(self.structure, params.resolution_reduction)?;
        let mut writer = CodestreamWriter::new();
        modifier.modify_main_header(header_bytes, &mut writer)?;

        let max_resolution = self.structure.max_decomposition_levels() - params.resolution_reduction;
        let max_quality = params
            .max_quality_layers
            .min(u32::from(self.structure.num_quality_layers));
        let order = params
            .progression_order
            .unwrap_or(self.structure.progression_order);

        for tile in 0..self.structure.num_tiles() {
            let collected = PacketCollector::new(self.structure, self.pool).collect_tile(
                saver,
                tile,
                max_resolution,
                max_quality,
            )?;

            let mut tile_writer = CodestreamWriter::new();
            if let Some(header) = saver.loaded_tile_header(u64::from(tile)) {
                let header = header.borrow();
                if let Some(bytes) = header
                    .known_length()
                    .and_then(|len| header.read_bytes(0, len))
                {
                    modifier.modify_tile_header(bytes, &mut tile_writer)?;
                } else {
                    debug!("tile {tile} header partially loaded, omitting");
                }
            }
            tile_writer.write_marker(Marker::StartOfData);
            self.write_packets(&collected, tile, order, max_resolution, &mut tile_writer)?;
            let tile_body = tile_writer.into_bytes();

            // Psot counts from the first byte of the SOT marker.
            let psot = (12 + tile_body.len()) as u32;
            let mut sot = Vec::with_capacity(8);
            sot.extend_from_slice(&(tile as u16).to_be_bytes());
            sot.extend_from_slice(&psot.to_be_bytes());
            sot.push(0); // TPsot
            sot.push(1); // TNsot
            writer.write_segment(Marker::StartOfTile, &sot);
            writer.write_bytes(&tile_body);
        }
        writer.write_marker(Marker::EndOfCodestream);
        Ok(Some(writer.into_bytes()))
    }

    fn write_packets(
        &self,
        collected: &CollectedTile,
        tile: u32,
        order: ProgressionOrder,
        max_resolution: u8,
        writer: &mut CodestreamWriter,
    ) -> Result<(), JpipError> {
        let slots = self.packet_order(tile, order, max_resolution)?;
        for slot in slots {
            let packet = collected
                .get(slot.component, slot.resolution, slot.x, slot.y)
                .and_then(|p| p.packet_bytes(slot.layer));
            match packet {
                Some(bytes) => writer.write_bytes(bytes),
                None => {
                    // Declared layer with no data: the empty packet.
                    writer.write_byte(0x00);
                    if self.structure.uses_eph {
                        writer.write_marker(Marker::EndOfPacketHeader);
                    }
                }
            }
        }
        Ok(())
    }

    /// All packet slots of a tile, sorted by the progression's loop
    /// nesting. Positional orders compare precinct anchors projected
    /// onto the reference grid.
    fn packet_order(
        &self,
        tile: u32,
        order: ProgressionOrder,
        max_resolution: u8,
    ) -> Result<Vec<PacketSlot>, JpipError> {
        let structure = self.structure.tile(tile)?;
        let mut slots = Vec::new();
        let mut keys: Vec<(u64, u64, u64, u64)> = Vec::new();
        for (component, tile_component) in structure.components.iter().enumerate() {
            let levels = tile_component.resolutions.len() as u8 - 1;
            for (r, level) in tile_component.resolutions.iter().enumerate() {
                let resolution = r as u8;
                if resolution > max_resolution {
                    break;
                }
                let shift = levels - resolution;
                for y in 0..level.precincts_high {
                    for x in 0..level.precincts_wide {
                        // Anchor on the reference grid, for the
                        // position-first progressions.
                        let anchor_x = u64::from(x + (level.x0 >> level.precinct_width_exp))
                            << (level.precinct_width_exp + shift);
                        let anchor_y = u64::from(y + (level.y0 >> level.precinct_height_exp))
                            << (level.precinct_height_exp + shift);
                        let position = (anchor_y << 32) | anchor_x;
                        for layer in 0..u32::from(self.structure.num_quality_layers) {
                            let key = match order {
                                ProgressionOrder::Lrcp => (
                                    u64::from(layer),
                                    u64::from(resolution),
                                    component as u64,
                                    position,
                                ),
                                ProgressionOrder::Rlcp => (
                                    u64::from(resolution),
                                    u64::from(layer),
                                    component as u64,
                                    position,
                                ),
                                ProgressionOrder::Rpcl => (
                                    u64::from(resolution),
                                    position,
                                    component as u64,
                                    u64::from(layer),
                                ),
                                ProgressionOrder::Pcrl => (
                                    position,
                                    component as u64,
                                    u64::from(resolution),
                                    u64::from(layer),
                                ),
                                ProgressionOrder::Cprl => (
                                    component as u64,
                                    position,
                                    u64::from(resolution),
                                    u64::from(layer),
                                ),
                            };
                            keys.push(key);
                            slots.push(PacketSlot {
                                layer,
                                component,
                                resolution,
                                x,
                                y,
                            });
                        }
                    }
                }
            }
        }
        let mut indices: Vec<usize> = (0..slots.len()).collect();
        indices.sort_by_key(|&i| keys[i]);
        Ok(indices.into_iter().map(|i| slots[i]).collect())
    }
}
