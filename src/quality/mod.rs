//! Quality-layer engine: transactional bitstream parsing of precinct
//! packet headers and the per-precinct best-quality cache.

pub mod bits;
pub mod coding_passes;
pub mod layer_cache;
pub mod lengths;
pub mod packet_parser;
pub mod tag_tree;

pub use bits::{BitCursor, BitReader};
pub use layer_cache::{
    PacketOffsetSource, PrecinctQualityCache, QualityLayerCache, QualityLayersInfo,
};
pub use packet_parser::PrecinctParser;
pub use tag_tree::TagTree;
