/// X11 protocol implementation
///
/// This module implements the parts of the X11 wire protocol the dispatch
/// kernel speaks itself: request framing, errors, connection setup, and the
/// handful of replies and events owned by the core.
pub mod encoder;
pub mod errors;
pub mod events;
pub mod opcodes;
pub mod setup;
pub mod types;
pub mod wire;

pub use encoder::ProtocolEncoder;
pub use errors::*;
pub use events::{Event, SelectionClearEvent};
pub use setup::*;
pub use types::*;
pub use wire::{Reply, Request, WireReader, WireWriter};

/// X11 protocol version
pub const PROTOCOL_MAJOR_VERSION: u16 = 11;
pub const PROTOCOL_MINOR_VERSION: u16 = 0;

/// Padding helper - X11 requires data to be padded to 4-byte boundaries
pub fn pad(n: usize) -> usize {
    (4 - (n % 4)) % 4
}

/// Calculate padded length
pub fn padded_len(n: usize) -> usize {
    n + pad(n)
}
