//! Databin store: sparse partial-byte-range containers for the logical
//! data units JPIP delivers (main header, tile headers, tile data,
//! precincts), plus the routing and per-databin object pooling built on
//! top of them.

pub mod pool;
pub mod saver;

mod store;

pub use pool::ObjectPoolByDatabin;
pub use saver::DatabinsSaver;
pub use store::{
    append_and_notify, ByteRange, Databin, DatabinClass, DatabinId, Listener, ListenerHandle,
};
