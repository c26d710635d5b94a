//! CLI command implementations
//!
//! Each command probes the bank lazily, drives the engine in
//! `wchflash-core` and reports in human-readable form. All commands are
//! generic over [`wchflash_core::target::DebugTarget`] so they work with
//! any probe backend.

pub mod erase;
pub mod options;
pub mod probe;
pub mod protect;
pub mod write;

/// Error surfaced at the CLI boundary
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Engine-level failure
    #[error("flash operation failed: {0}")]
    Flash(#[from] wchflash_core::Error),
    /// File I/O failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Bad command usage caught before touching the target
    #[error("{0}")]
    Usage(String),
}
