//! Structured error types for loadtrace
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! None of these ever cross the loader callback: the operations that run
//! there fold them into their boolean/optional contracts and log them.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Loader notifications are not available on this platform")]
    HookUnavailable,

    #[error("Loader rejected the notification registration (status 0x{status:08x})")]
    HookRejected { status: u32 },
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("No managed runtime module is loaded in this process")]
    RuntimeNotFound,

    #[error("Failed to load debugging-data library {path}: {reason}")]
    LibraryLoad { path: PathBuf, reason: String },

    #[error("Debugging-data library does not export {name}")]
    MissingExport { name: &'static str },

    #[error("{0} is not supported by this data target")]
    NotImplemented(&'static str),

    #[error("{call} failed (status 0x{status:08x})")]
    Status { call: &'static str, status: u32 },

    #[error("No loaded image named {name}")]
    ImageNotFound { name: String },

    #[error("Cannot read {len} bytes at 0x{address:x}")]
    ReadFailed { address: u64, len: usize },
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("Failed to open library {path}: {reason}")]
    Open { path: PathBuf, reason: String },
}
