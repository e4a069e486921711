//! JPIP (JPEG 2000 Interactive Protocol) client core.
//!
//! Incrementally fetches, caches and reassembles fragments of a JPEG
//! 2000 codestream so that only the region/resolution/quality actually
//! needed crosses the wire, and hands standards-compliant codestream
//! fragments to an external pixel decoder.
//!
//! The crate is transport-agnostic: [`protocol::Session`] is a poll-style
//! state machine. The embedder takes [`protocol::TransportRequest`]s from
//! [`protocol::Session::next_request`], performs the HTTP exchange, and
//! feeds the outcome back through [`protocol::Session::handle_response`].

pub mod codestream;
pub mod databin;
pub mod error;
pub mod protocol;
pub mod quality;
pub mod writers;

pub use error::JpipError;

use codestream::ProgressionOrder;

/// Client configuration, built once and passed down explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JpipConfig {
    /// Upper bound on concurrently negotiated pooled channels.
    pub max_channels_in_session: usize,
    /// Per-channel cap on requests awaiting a response.
    pub max_requests_waiting_for_response_in_channel: usize,
    /// Reconnect attempts before the session fails terminally.
    pub max_reconnect_attempts: u32,
    /// Overrides the codestream's progression order for packet traversal.
    pub progression_order: Option<ProgressionOrder>,
}

impl Default for JpipConfig {
    fn default() -> Self {
        Self {
            max_channels_in_session: 1,
            max_requests_waiting_for_response_in_channel: 1,
            max_reconnect_attempts: 3,
            progression_order: None,
        }
    }
}
