//! Best-available-quality answers for a precinct databin.
//!
//! The cache searches decreasing layer candidates until one's packet
//! end offset fits inside the databin's loaded prefix. Answers are
//! monotone: more loaded bytes can only improve them, so resolved
//! layers are never re-derived.

use crate::codestream::{CodestreamStructure, PrecinctPosition};
use crate::databin::Databin;
use crate::error::JpipError;
use crate::quality::packet_parser::PrecinctParser;

/// Where packet end offsets come from. Implemented by the packet
/// parser; tests substitute fixed tables.
pub trait PacketOffsetSource {
    /// Upper bound on meaningful layer counts.
    fn max_layer(&self) -> u32;

    /// End byte offset of the packet data covering `layer_count`
    /// layers, `Ok(None)` while loaded bytes do not suffice to compute
    /// it.
    fn packet_end_offset(
        &mut self,
        databin: &Databin,
        layer_count: u32,
    ) -> Result<Option<usize>, JpipError>;
}

impl PacketOffsetSource for PrecinctParser {
    fn max_layer(&self) -> u32 {
        self.num_quality_layers()
    }

    fn packet_end_offset(
        &mut self,
        databin: &Databin,
        layer_count: u32,
    ) -> Result<Option<usize>, JpipError> {
        while self.parsed_layers() < layer_count {
            if self.try_parse_next_packet(databin)?.is_none() {
                break;
            }
        }
        Ok(PrecinctParser::packet_end_offset(self, layer_count))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QualityLayersInfo {
    pub num_quality_layers: u32,
    pub end_offset: usize,
}

pub struct QualityLayerCache<S> {
    source: S,
    best: QualityLayersInfo,
}

/// The pooled per-precinct cache: parser-backed, keyed by the precinct
/// databin in an `ObjectPoolByDatabin`.
pub type PrecinctQualityCache = QualityLayerCache<PrecinctParser>;

impl PrecinctQualityCache {
    pub fn for_precinct(
        structure: &CodestreamStructure,
        position: PrecinctPosition,
    ) -> Result<Self, JpipError> {
        Ok(Self::new(PrecinctParser::new(structure, position)?))
    }
}

impl<S: PacketOffsetSource> QualityLayerCache<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            best: QualityLayersInfo::default(),
        }
    }

    /// The underlying offset source, for per-layer packet boundaries of
    /// already-resolved layers.
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Largest layer count `n <= requested` whose packet data is fully
    /// within the loaded prefix, with the matching end offset. `{0, 0}`
    /// when nothing usable is loaded.
    pub fn best_quality(
        &mut self,
        databin: &Databin,
        requested: u32,
    ) -> Result<QualityLayersInfo, JpipError> {
        let Some(first) = databin.existing_ranges().first().copied() else {
            return Ok(QualityLayersInfo::default());
        };
        if first.start != 0 {
            return Ok(QualityLayersInfo::default());
        }
        let loaded = databin.loaded_prefix_len();
        let cap = requested.min(self.source.max_layer());
        for candidate in (self.best.num_quality_layers + 1..=cap).rev() {
            let Some(end) = self.source.packet_end_offset(databin, candidate)? else {
                continue;
            };
            if end <= loaded {
                self.best = QualityLayersInfo {
                    num_quality_layers: candidate,
                    end_offset: end,
                };
                break;
            }
        }
        if self.best.num_quality_layers <= cap {
            return Ok(self.best);
        }
        // The cached best exceeds this request's cap. The parse state
        // stays, but the answer is clamped to the capped layer's offset.
        match self.source.packet_end_offset(databin, cap)? {
            Some(end) => Ok(QualityLayersInfo {
                num_quality_layers: cap,
                end_offset: end,
            }),
            None => Ok(QualityLayersInfo::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::databin::{DatabinClass, DatabinId};

    struct FixedOffsets(Vec<Option<usize>>);

    impl PacketOffsetSource for FixedOffsets {
        fn max_layer(&self) -> u32 {
            self.0.len() as u32
        }

        fn packet_end_offset(
            &mut self,
            _databin: &Databin,
            layer_count: u32,
        ) -> Result<Option<usize>, JpipError> {
            if layer_count == 0 {
                return Ok(Some(0));
            }
            Ok(self.0[layer_count as usize - 1])
        }
    }

    fn precinct_databin(loaded: usize) -> Databin {
        let mut bin = Databin::new(
            DatabinId {
                class: DatabinClass::Precinct,
                in_class_id: 0,
            },
            0,
        );
        bin.append(0, &vec![0u8; loaded], false).unwrap();
        bin
    }

    #[test]
    fn picks_the_largest_layer_that_fits() {
        let mut cache = QualityLayerCache::new(FixedOffsets(vec![None, Some(70), Some(101)]));
        let bin = precinct_databin(100);
        assert_eq!(
            cache.best_quality(&bin, 3).unwrap(),
            QualityLayersInfo {
                num_quality_layers: 2,
                end_offset: 70,
            }
        );
    }

    #[test]
    fn empty_databin_answers_zero() {
        let mut cache = QualityLayerCache::new(FixedOffsets(vec![Some(10)]));
        let bin = Databin::new(
            DatabinId {
                class: DatabinClass::Precinct,
                in_class_id: 1,
            },
            0,
        );
        assert_eq!(
            cache.best_quality(&bin, 1).unwrap(),
            QualityLayersInfo::default()
        );
    }

    #[test]
    fn range_not_starting_at_zero_answers_zero() {
        let mut cache = QualityLayerCache::new(FixedOffsets(vec![Some(10)]));
        let mut bin = Databin::new(
            DatabinId {
                class: DatabinClass::Precinct,
                in_class_id: 2,
            },
            0,
        );
        bin.append(5, &[1, 2, 3], false).unwrap();
        assert_eq!(
            cache.best_quality(&bin, 1).unwrap(),
            QualityLayersInfo::default()
        );
    }

    #[test]
    fn answers_only_improve_as_bytes_arrive() {
        let mut cache = QualityLayerCache::new(FixedOffsets(vec![Some(40), Some(70), Some(101)]));
        let bin = precinct_databin(60);
        assert_eq!(cache.best_quality(&bin, 3).unwrap().num_quality_layers, 1);
        let bin = precinct_databin(101);
        let best = cache.best_quality(&bin, 3).unwrap();
        assert_eq!(best.num_quality_layers, 3);
        assert_eq!(best.end_offset, 101);
    }

    #[test]
    fn request_below_the_cached_best_is_clamped() {
        let mut cache = QualityLayerCache::new(FixedOffsets(vec![Some(40), Some(70)]));
        let bin = precinct_databin(80);
        assert_eq!(cache.best_quality(&bin, 2).unwrap().num_quality_layers, 2);
        // The parse state stays warm but the answer honors the cap.
        assert_eq!(
            cache.best_quality(&bin, 1).unwrap(),
            QualityLayersInfo {
                num_quality_layers: 1,
                end_offset: 40,
            }
        );
        // And a later, larger request still sees the cached best.
        assert_eq!(cache.best_quality(&bin, 2).unwrap().num_quality_layers, 2);
    }

    #[test]
    fn cap_without_a_known_offset_answers_zero() {
        let mut cache = QualityLayerCache::new(FixedOffsets(vec![None, Some(70), Some(101)]));
        let bin = precinct_databin(100);
        assert_eq!(cache.best_quality(&bin, 3).unwrap().num_quality_layers, 2);
        // Layer 1's end offset is unknowable here, so nothing below the
        // cached best can be certified.
        assert_eq!(
            cache.best_quality(&bin, 1).unwrap(),
            QualityLayersInfo::default()
        );
    }
}
