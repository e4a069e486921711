use thiserror::Error;

/// Errors surfaced by the JPIP client.
///
/// "Not enough bytes arrived yet" is deliberately absent: speculative
/// parse paths report it as `Ok(None)` so the caller retries once more
/// transport data lands. Every variant here is a definite failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JpipError {
    // Parse errors: malformed bytes. Fatal for the parse that hit them,
    // never retried.
    #[error("Invalid VBAS field (value exceeds 63 bits)")]
    VbasOverflow,
    #[error("Invalid message header: bin-id indicator 00 in a non-EOR position")]
    InvalidBinIdIndicator,
    #[error("Unknown databin class id {0}")]
    UnknownDatabinClass(u64),
    #[error("Unknown end-of-response code {0}")]
    UnknownEorCode(u8),
    #[error("Invalid marker segment ({0})")]
    InvalidMarkerSegment(&'static str),
    #[error("Required marker segment {0} missing from main header")]
    MissingMarkerSegment(&'static str),
    #[error("Unsupported codestream feature ({0})")]
    UnsupportedCodestream(&'static str),
    #[error("Unknown progression order {0}")]
    UnknownProgressionOrder(u8),

    // Illegal data: the server violated the protocol contract.
    #[error("Appended data contradicts known databin length ({known} known, append ends at {end})")]
    DatabinLengthConflict { known: usize, end: usize },
    #[error("Databin length flag contradicts an earlier length ({known} known, now {claimed})")]
    DatabinLengthChanged { known: usize, claimed: usize },
    #[error("Server declared the response complete without delivering promised data")]
    ResponseIncomplete,
    #[error("Main-header message with nonzero in-class id {0}")]
    BadMainHeaderId(u64),
    #[error("Message body shorter than its declared length")]
    TruncatedMessageBody,

    // Internal consistency: programmer error, always fatal.
    #[error("Two databins collided on the same (class, in-class id) pool key")]
    DuplicateDatabinInPool,
    #[error("Internal error: {0}")]
    Internal(&'static str),

    // API misuse.
    #[error("Fetch handle was stopped and cannot be reused")]
    FetchStopped,
    #[error("Only a dedicated fetch can be moved")]
    FetchNotMovable,
    #[error("A dedicated fetch must be moved, not resumed, after a reconnect")]
    FetchNeedsMove,
    #[error("Session negotiation has already started")]
    SessionAlreadyOpen,
    #[error("Session is closed")]
    SessionClosed,
    #[error("Session has failed")]
    SessionFailed,
}
