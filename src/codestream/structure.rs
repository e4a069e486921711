//! Immutable geometry model parsed from the main-header databin.
//!
//! Everything here is a pure function of the SIZ/COD/COC/QCD marker
//! content; there is no I/O. Tile structures are computed on first use
//! and memoized.

use std::cell::RefCell;
use std::rc::Rc;

use crate::codestream::markers::{Marker, MarkerIndex, MarkerSegment};
use crate::codestream::progression::ProgressionOrder;
use crate::databin::Databin;
use crate::error::JpipError;

/// Big-endian cursor over one marker segment's parameter bytes.
struct SegmentReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SegmentReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, JpipError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or(JpipError::InvalidMarkerSegment("segment too short"))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16, JpipError> {
        Ok(u16::from_be_bytes([self.read_u8()?, self.read_u8()?]))
    }

    fn read_u32(&mut self) -> Result<u32, JpipError> {
        Ok(u32::from_be_bytes([
            self.read_u8()?,
            self.read_u8()?,
            self.read_u8()?,
            self.read_u8()?,
        ]))
    }

}

fn ceil_div(a: u32, b: u32) -> u32 {
    a.div_ceil(b)
}

/// `ceil(x / 2^shift)`.
fn ceil_shift(x: u32, shift: u8) -> u32 {
    let d = 1u32 << shift;
    (x + d - 1) >> shift
}

/// Per-component fields of the SIZ marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentInfo {
    pub bit_depth: u8,
    pub is_signed: bool,
    /// Horizontal sub-sampling on the reference grid.
    pub dx: u8,
    pub dy: u8,
}

/// Coding-style parameters from COD, or COC for an overridden component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodingStyle {
    pub decomposition_levels: u8,
    /// log2 of the nominal codeblock width (offset from SPcod applied).
    pub codeblock_width_exp: u8,
    pub codeblock_height_exp: u8,
    /// Per resolution level `(PPx, PPy)` exponents, index 0 is level 0.
    pub precinct_size_exps: Vec<(u8, u8)>,
}

impl CodingStyle {
    /// Precinct exponents at a resolution level, the no-precinct default
    /// being the maximal partition.
    pub fn precinct_exps(&self, resolution: u8) -> (u8, u8) {
        self.precinct_size_exps
            .get(resolution as usize)
            .copied()
            .unwrap_or((15, 15))
    }
}

/// Default quantization from the QCD marker, kept verbatim for header
/// rewriting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantizationInfo {
    pub quant_style: u8,
    pub body: Vec<u8>,
}

/// One resolution level of one tile-component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionLevel {
    /// Bounds on the resolution grid.
    pub x0: u32,
    pub x1: u32,
    pub y0: u32,
    pub y1: u32,
    pub precincts_wide: u32,
    pub precincts_high: u32,
    /// Precinct exponents on the resolution grid.
    pub precinct_width_exp: u8,
    pub precinct_height_exp: u8,
    /// Codeblock exponents on the subband grid, clamped to the precinct.
    pub codeblock_width_exp: u8,
    pub codeblock_height_exp: u8,
    pub subband_count: u32,
    /// Precinct sequence number of this level's first precinct within
    /// the tile-component.
    pub first_precinct_seq: u32,
}

impl ResolutionLevel {
    pub fn precinct_count(&self) -> u32 {
        self.precincts_wide * self.precincts_high
    }

    /// Codeblock grid of one precinct's subbands, after intersecting the
    /// precinct cell with the level bounds. All subbands of a level
    /// share the grid.
    pub fn codeblocks_in_precinct(&self, px: u32, py: u32) -> (u32, u32) {
        let halved = self.subband_count > 1;
        (
            codeblock_span(self.x0, self.x1, self.precinct_width_exp, self.codeblock_width_exp, px, halved),
            codeblock_span(self.y0, self.y1, self.precinct_height_exp, self.codeblock_height_exp, py, halved),
        )
    }
}

fn codeblock_span(r0: u32, r1: u32, prec_exp: u8, cb_exp: u8, index: u32, halved: bool) -> u32 {
    let prec = 1u32 << prec_exp;
    let first = r0 >> prec_exp;
    let cell0 = (first + index) * prec;
    let cell1 = cell0 + prec;
    let a0 = r0.max(cell0);
    let a1 = r1.min(cell1);
    if a0 >= a1 {
        return 0;
    }
    // Subbands above level 0 live on the halved grid. Precinct origins
    // are even there, so the floor keeps grid alignment.
    let (b0, b1) = if halved {
        (a0 / 2, ceil_shift(a1, 1))
    } else {
        (a0, a1)
    };
    if b0 >= b1 {
        return 0;
    }
    let cb = 1u32 << cb_exp;
    ceil_div(b1, cb) - b0 / cb
}

/// One tile-component: the resolution ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileComponent {
    pub resolutions: Vec<ResolutionLevel>,
}

impl TileComponent {
    /// Total precincts across all resolution levels.
    pub fn precinct_count(&self) -> u32 {
        self.resolutions.iter().map(ResolutionLevel::precinct_count).sum()
    }
}

/// Geometry of one tile, memoized by [`CodestreamStructure::tile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileStructure {
    pub index: u32,
    pub components: Vec<TileComponent>,
}

impl TileStructure {
    /// Sequence number of precinct `(px, py)` of a component's
    /// resolution level within the tile-component.
    pub fn precinct_seq(&self, component: usize, resolution: u8, px: u32, py: u32) -> Option<u32> {
        let level = self
            .components
            .get(component)?
            .resolutions
            .get(resolution as usize)?;
        if px >= level.precincts_wide || py >= level.precincts_high {
            return None;
        }
        Some(level.first_precinct_seq + py * level.precincts_wide + px)
    }
}

/// Position of a precinct databin within the geometry model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecinctPosition {
    pub tile: u32,
    pub component: usize,
    pub resolution: u8,
    pub x: u32,
    pub y: u32,
}

/// Parsed main header: SIZ/COD/COC/QCD content plus derived tile and
/// precinct geometry.
#[derive(Debug)]
pub struct CodestreamStructure {
    pub width: u32,
    pub height: u32,
    pub x_origin: u32,
    pub y_origin: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub tile_x_origin: u32,
    pub tile_y_origin: u32,
    pub components: Vec<ComponentInfo>,
    pub progression_order: ProgressionOrder,
    pub num_quality_layers: u16,
    /// Scod bit 1: packets may begin with an SOP marker.
    pub uses_sop: bool,
    /// Scod bit 2: packet headers end with an EPH marker.
    pub uses_eph: bool,
    pub default_style: CodingStyle,
    /// Effective style per component, COC overrides merged.
    component_styles: Vec<CodingStyle>,
    pub quantization: QuantizationInfo,
    tiles: RefCell<Vec<Option<Rc<TileStructure>>>>,
}

impl CodestreamStructure {
    /// Builds the model from the main-header databin. `Ok(None)` until
    /// the databin is fully loaded.
    pub fn from_main_header(databin: &Databin) -> Result<Option<Self>, JpipError> {
        if !databin.is_fully_loaded() {
            return Ok(None);
        }
        let len = databin
            .known_length()
            .ok_or(JpipError::Internal("fully loaded databin without length"))?;
        let bytes = databin
            .read_bytes(0, len)
            .ok_or(JpipError::Internal("fully loaded databin without bytes"))?;
        Self::from_bytes(bytes).map(Some)
    }

    /// Builds the model from raw main-header bytes (starting at SOC).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, JpipError> {
        let index = MarkerIndex::build(bytes, true)?;
        let siz = index
            .find(Marker::ImageAndTileSize)
            .ok_or(JpipError::MissingMarkerSegment("SIZ"))?;
        let cod = index
            .find(Marker::CodingStyleDefault)
            .ok_or(JpipError::MissingMarkerSegment("COD"))?;
        let qcd = index
            .find(Marker::QuantizationDefault)
            .ok_or(JpipError::MissingMarkerSegment("QCD"))?;

        let mut structure = Self::parse_siz(params(bytes, siz))?;
        let (style, order, layers, uses_sop, uses_eph) = Self::parse_cod(params(bytes, cod))?;
        structure.progression_order = order;
        structure.num_quality_layers = layers;
        structure.uses_sop = uses_sop;
        structure.uses_eph = uses_eph;
        structure.component_styles = vec![style.clone(); structure.components.len()];
        structure.default_style = style;
        structure.quantization = Self::parse_qcd(params(bytes, qcd))?;

        for coc in index.find_all(Marker::CodingStyleComponent) {
            let (component, style) =
                Self::parse_coc(params(bytes, coc), structure.components.len())?;
            structure.component_styles[component] = style;
        }

        let tiles = structure.num_tiles() as usize;
        structure.tiles = RefCell::new(vec![None; tiles]);
        Ok(structure)
    }

    fn parse_siz(bytes: &[u8]) -> Result<Self, JpipError> {
        let mut r = SegmentReader::new(bytes);
        let _caps = r.read_u16()?;
        let width = r.read_u32()?;
        let height = r.read_u32()?;
        let x_origin = r.read_u32()?;
        let y_origin = r.read_u32()?;
        let tile_width = r.read_u32()?;
        let tile_height = r.read_u32()?;
        let tile_x_origin = r.read_u32()?;
        let tile_y_origin = r.read_u32()?;
        let component_count = r.read_u16()?;
        if width <= x_origin || height <= y_origin || tile_width == 0 || tile_height == 0 {
            return Err(JpipError::InvalidMarkerSegment("degenerate SIZ geometry"));
        }
        if component_count == 0 {
            return Err(JpipError::InvalidMarkerSegment("SIZ with no components"));
        }
        let mut components = Vec::with_capacity(component_count as usize);
        for _ in 0..component_count {
            let depth_byte = r.read_u8()?;
            let dx = r.read_u8()?;
            let dy = r.read_u8()?;
            if dx == 0 || dy == 0 {
                return Err(JpipError::InvalidMarkerSegment("zero sub-sampling factor"));
            }
            components.push(ComponentInfo {
                bit_depth: (depth_byte & 0x7F) + 1,
                is_signed: (depth_byte & 0x80) != 0,
                dx,
                dy,
            });
        }
        Ok(Self {
            width,
            height,
            x_origin,
            y_origin,
            tile_width,
            tile_height,
            tile_x_origin,
            tile_y_origin,
            components,
            progression_order: ProgressionOrder::Lrcp,
            num_quality_layers: 1,
            uses_sop: false,
            uses_eph: false,
            default_style: CodingStyle {
                decomposition_levels: 0,
                codeblock_width_exp: 6,
                codeblock_height_exp: 6,
                precinct_size_exps: Vec::new(),
            },
            component_styles: Vec::new(),
            quantization: QuantizationInfo {
                quant_style: 0,
                body: Vec::new(),
            },
            tiles: RefCell::new(Vec::new()),
        })
    }

    fn parse_cod(
        bytes: &[u8],
    ) -> Result<(CodingStyle, ProgressionOrder, u16, bool, bool), JpipError> {
        let mut r = SegmentReader::new(bytes);
        let scod = r.read_u8()?;
        let sprog = r.read_u8()?;
        let order = ProgressionOrder::try_from(sprog)
            .map_err(|_| JpipError::UnknownProgressionOrder(sprog))?;
        let layers = r.read_u16()?;
        if layers == 0 {
            return Err(JpipError::InvalidMarkerSegment("COD with zero layers"));
        }
        let _mct = r.read_u8()?;
        let style = Self::parse_style_tail(&mut r, scod & 0x01 != 0)?;
        Ok((style, order, layers, scod & 0x02 != 0, scod & 0x04 != 0))
    }

    fn parse_coc(bytes: &[u8], component_count: usize) -> Result<(usize, CodingStyle), JpipError> {
        let mut r = SegmentReader::new(bytes);
        let component = if component_count < 257 {
            r.read_u8()? as usize
        } else {
            r.read_u16()? as usize
        };
        if component >= component_count {
            return Err(JpipError::InvalidMarkerSegment("COC component out of range"));
        }
        let scoc = r.read_u8()?;
        let style = Self::parse_style_tail(&mut r, scoc & 0x01 != 0)?;
        Ok((component, style))
    }

    /// The SPcod/SPcoc tail shared by COD and COC.
    fn parse_style_tail(
        r: &mut SegmentReader<'_>,
        explicit_precincts: bool,
    ) -> Result<CodingStyle, JpipError> {
        let decomposition_levels = r.read_u8()?;
        if decomposition_levels > 32 {
            return Err(JpipError::UnsupportedCodestream(
                "more than 32 decomposition levels",
            ));
        }
        let codeblock_width_exp = (r.read_u8()? & 0x0F) + 2;
        let codeblock_height_exp = (r.read_u8()? & 0x0F) + 2;
        if codeblock_width_exp + codeblock_height_exp > 12 {
            return Err(JpipError::InvalidMarkerSegment("codeblock area above 4096"));
        }
        let _codeblock_style = r.read_u8()?;
        let _transformation = r.read_u8()?;
        let mut precinct_size_exps = Vec::new();
        if explicit_precincts {
            for level in 0..=decomposition_levels {
                let b = r.read_u8()?;
                let exps = (b & 0x0F, b >> 4);
                // Levels above 0 host subbands on the halved grid, so a
                // precinct there spans at least 2 resolution samples.
                if level > 0 && (exps.0 == 0 || exps.1 == 0) {
                    return Err(JpipError::InvalidMarkerSegment("zero precinct exponent"));
                }
                precinct_size_exps.push(exps);
            }
        }
        Ok(CodingStyle {
            decomposition_levels,
            codeblock_width_exp,
            codeblock_height_exp,
            precinct_size_exps,
        })
    }

    fn parse_qcd(bytes: &[u8]) -> Result<QuantizationInfo, JpipError> {
        let mut r = SegmentReader::new(bytes);
        let quant_style = r.read_u8()?;
        let body = bytes[r.pos..].to_vec();
        Ok(QuantizationInfo { quant_style, body })
    }

    pub fn num_tiles_x(&self) -> u32 {
        ceil_div(self.width - self.tile_x_origin, self.tile_width)
    }

    pub fn num_tiles_y(&self) -> u32 {
        ceil_div(self.height - self.tile_y_origin, self.tile_height)
    }

    pub fn num_tiles(&self) -> u32 {
        self.num_tiles_x() * self.num_tiles_y()
    }

    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    pub fn style_for_component(&self, component: usize) -> &CodingStyle {
        &self.component_styles[component]
    }

    /// Highest decomposition-level count across components; resolution
    /// levels available in the codestream are `0..=max`.
    pub fn max_decomposition_levels(&self) -> u8 {
        self.component_styles
            .iter()
            .map(|s| s.decomposition_levels)
            .max()
            .unwrap_or(0)
    }

    /// Geometry of one tile, computed on first use.
    pub fn tile(&self, index: u32) -> Result<Rc<TileStructure>, JpipError> {
        let slot = index as usize;
        if slot >= self.tiles.borrow().len() {
            return Err(JpipError::Internal("tile index out of range"));
        }
        if let Some(tile) = &self.tiles.borrow()[slot] {
            return Ok(Rc::clone(tile));
        }
        let tile = Rc::new(self.build_tile(index));
        self.tiles.borrow_mut()[slot] = Some(Rc::clone(&tile));
        Ok(tile)
    }

    fn build_tile(&self, index: u32) -> TileStructure {
        let ti = index % self.num_tiles_x();
        let tj = index / self.num_tiles_x();
        // Tile bounds on the reference grid, clamped to the image area.
        let tx0 = (self.tile_x_origin + ti * self.tile_width).max(self.x_origin);
        let tx1 = (self.tile_x_origin + (ti + 1) * self.tile_width).min(self.width);
        let ty0 = (self.tile_y_origin + tj * self.tile_height).max(self.y_origin);
        let ty1 = (self.tile_y_origin + (tj + 1) * self.tile_height).min(self.height);

        let components = self
            .components
            .iter()
            .zip(&self.component_styles)
            .map(|(info, style)| {
                // Component coordinates.
                let cx0 = ceil_div(tx0, info.dx as u32);
                let cx1 = ceil_div(tx1, info.dx as u32);
                let cy0 = ceil_div(ty0, info.dy as u32);
                let cy1 = ceil_div(ty1, info.dy as u32);
                let mut resolutions = Vec::with_capacity(style.decomposition_levels as usize + 1);
                let mut seq = 0u32;
                for r in 0..=style.decomposition_levels {
                    let shift = style.decomposition_levels - r;
                    let x0 = ceil_shift(cx0, shift);
                    let x1 = ceil_shift(cx1, shift);
                    let y0 = ceil_shift(cy0, shift);
                    let y1 = ceil_shift(cy1, shift);
                    let (ppx, ppy) = style.precinct_exps(r);
                    let precincts_wide = if x0 < x1 {
                        ceil_div(x1, 1 << ppx) - (x0 >> ppx)
                    } else {
                        0
                    };
                    let precincts_high = if y0 < y1 {
                        ceil_div(y1, 1 << ppy) - (y0 >> ppy)
                    } else {
                        0
                    };
                    let halve = u8::from(r > 0);
                    let level = ResolutionLevel {
                        x0,
                        x1,
                        y0,
                        y1,
                        precincts_wide,
                        precincts_high,
                        precinct_width_exp: ppx,
                        precinct_height_exp: ppy,
                        codeblock_width_exp: style.codeblock_width_exp.min(ppx - halve),
                        codeblock_height_exp: style.codeblock_height_exp.min(ppy - halve),
                        subband_count: if r == 0 { 1 } else { 3 },
                        first_precinct_seq: seq,
                    };
                    seq += level.precinct_count();
                    resolutions.push(level);
                }
                TileComponent { resolutions }
            })
            .collect();
        TileStructure { index, components }
    }

    /// In-class id of a precinct databin:
    /// `t + (c + s*C) * T` with `s` the precinct sequence number within
    /// the tile-component.
    pub fn precinct_in_class_id(&self, tile: u32, component: usize, seq: u32) -> u64 {
        let t = u64::from(tile);
        let c = component as u64;
        let s = u64::from(seq);
        let num_components = self.num_components() as u64;
        let num_tiles = u64::from(self.num_tiles());
        t + (c + s * num_components) * num_tiles
    }

    /// Inverse of [`Self::precinct_in_class_id`].
    pub fn precinct_position(&self, in_class_id: u64) -> Result<Option<PrecinctPosition>, JpipError> {
        let num_tiles = u64::from(self.num_tiles());
        let num_components = self.num_components() as u64;
        let tile = (in_class_id % num_tiles) as u32;
        let rest = in_class_id / num_tiles;
        let component = (rest % num_components) as usize;
        let seq = (rest / num_components) as u32;
        let structure = self.tile(tile)?;
        let tile_component = &structure.components[component];
        for (r, level) in tile_component.resolutions.iter().enumerate() {
            let base = level.first_precinct_seq;
            if seq < base + level.precinct_count() {
                let local = seq - base;
                return Ok(Some(PrecinctPosition {
                    tile,
                    component,
                    resolution: r as u8,
                    x: local % level.precincts_wide,
                    y: local / level.precincts_wide,
                }));
            }
        }
        Ok(None)
    }
}

fn params(bytes: &[u8], segment: MarkerSegment) -> &[u8] {
    &bytes[segment.params_offset()..segment.end()]
}
