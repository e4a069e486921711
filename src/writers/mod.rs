//! Codestream output: byte-level writer, header rewriting, packet
//! collection and full reconstruction from cached databins.

pub mod header_modifier;
pub mod packet_collector;
pub mod reconstructor;
pub mod stream;

pub use header_modifier::HeaderModifier;
pub use packet_collector::{CollectedPrecinct, CollectedTile, PacketCollector, PrecinctKey};
pub use reconstructor::{ReconstructionParams, Reconstructor};
pub use stream::CodestreamWriter;
