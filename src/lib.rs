//! x11dix - the device-independent core of an X11 server
//!
//! This library holds the parts of an X server that do not depend on any
//! display hardware: the resource database, client sessions and their
//! close-down semantics, the request scheduler with server grabs, and the
//! extension registry. Output devices plug in as extension modules.

pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod resources;
pub mod security;
pub mod server;

pub use config::{SchedulerConfig, ScreenConfig, ServerConfig, TerminatePolicy};
pub use error::ServerError;
pub use protocol::{Atom, ClientId, Colormap, Window, XID};
pub use resources::{ResourceDatabase, ResourceError};
pub use server::{Client, ClientState, CloseDownMode, DispatchException, ExtensionModule, Server};

/// Server version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
