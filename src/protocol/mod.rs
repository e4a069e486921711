//! JPIP wire protocol engine: VBAS fields, message headers, request
//! descriptors, channels and the reconnectable session state machine.

pub mod channel;
pub mod message;
pub mod request;
pub mod session;
pub mod vbas;

pub use message::{EndOfResponse, EorCode, MessageHeader, MessageHeaderParser, ParsedItem};
pub use request::{FetchWindow, RequestDescriptor, RequestId, WaitBehavior};
pub use session::{
    FetchEvent, FetchHandle, Session, SessionState, TransportFailure, TransportRequest,
    TransportResponse,
};
