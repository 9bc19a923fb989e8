//! Report delivery: append to the destination file, or the debug channel

#![allow(unsafe_code)] // OutputDebugStringW is FFI

use log::{debug, warn};
use parking_lot::RwLock;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::ReportRecord;
use crate::domain::ReportError;

/// Where a record ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Appended to the destination file
    Persisted,
    /// No destination; written to the debug channel
    DebugOutput,
    /// Nowhere: no destination and debug output off, or the append failed
    Dropped,
}

/// Formats records and routes them to the current destination
#[derive(Debug)]
pub struct ReportSink {
    destination: RwLock<PathBuf>,
    debug_output: bool,
}

impl ReportSink {
    /// An empty `destination` means "debug output only"
    #[must_use]
    pub fn new(destination: impl Into<PathBuf>, debug_output: bool) -> Self {
        Self { destination: RwLock::new(destination.into()), debug_output }
    }

    /// Replace the destination; last write wins
    pub fn set_destination(&self, destination: impl Into<PathBuf>) {
        *self.destination.write() = destination.into();
    }

    #[must_use]
    pub fn destination(&self) -> PathBuf {
        self.destination.read().clone()
    }

    /// Deliver one record; never fails
    ///
    /// The destination is read at emission time. A failed append is logged
    /// and the record dropped: no retry, nothing propagated.
    pub fn emit(&self, record: &ReportRecord) -> Delivery {
        let text = record.to_string();
        let destination = self.destination();

        if destination.as_os_str().is_empty() {
            if !self.debug_output {
                return Delivery::Dropped;
            }
            debug_channel::write(&text);
            return Delivery::DebugOutput;
        }

        match append(&destination, &text) {
            Ok(()) => {
                debug!("Appended report for {} to {}", record.module_path(), destination.display());
                Delivery::Persisted
            }
            Err(e) => {
                let (module, destination) = (record.module_path(), destination.display());
                warn!("Dropping report for {module}: cannot append to {destination}: {e}");
                Delivery::Dropped
            }
        }
    }
}

/// Append UTF-8 text, creating the file if needed
fn append(path: &Path, text: &str) -> Result<(), ReportError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(text.as_bytes())?;
    Ok(())
}

#[cfg(windows)]
mod debug_channel {
    use widestring::U16CString;
    use windows_sys::Win32::System::Diagnostics::Debug::OutputDebugStringW;

    pub fn write(text: &str) {
        let wide = U16CString::from_str_truncate(text);
        // SAFETY: `wide` is NUL-terminated and outlives the call
        unsafe { OutputDebugStringW(wide.as_ptr()) };
    }
}

#[cfg(not(windows))]
mod debug_channel {
    use std::io::Write;

    pub fn write(text: &str) {
        // Best effort, like the debugger channel it stands in for
        let _ = std::io::stderr().lock().write_all(text.as_bytes());
    }
}
