//! Process-level error type
//!
//! Per-request failures never surface here: they are protocol errors sent
//! back to the issuing client. `ServerError` covers the conditions that stop
//! the server from starting or from continuing to serve at all.

use crate::resources::ResourceError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("extension {0} does not fit in the event/error/opcode budget")]
    ExtensionBudget(String),

    #[error("resource initialization failed: {0}")]
    ResourceInit(#[from] ResourceError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
