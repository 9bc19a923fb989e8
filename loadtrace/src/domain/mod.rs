//! Domain model for loadtrace
//!
//! This module contains core domain types and errors that provide:
//! - Case-insensitive module names via the newtype pattern
//! - A tagged resolution result (static module, managed module, unresolved)
//! - Structured error handling

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{Backtrace, ModuleName, Resolution, ResolvedFrame, StackFrame};

pub use errors::{BridgeError, LibraryError, ReportError, TrackerError};
