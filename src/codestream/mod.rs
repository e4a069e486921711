//! Geometry model of a JPEG 2000 codestream, parsed from header
//! databins.

pub mod markers;
pub mod progression;
pub mod structure;

pub use markers::{Marker, MarkerIndex, MarkerSegment};
pub use progression::ProgressionOrder;
pub use structure::{
    CodestreamStructure, CodingStyle, ComponentInfo, PrecinctPosition, QuantizationInfo,
    ResolutionLevel, TileComponent, TileStructure,
};
