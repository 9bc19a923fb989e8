//! The report record and its text rendering
//!
//! The rendering is the only persisted format and existing readers scrape
//! it, so it is reproduced exactly:
//!
//! ```text
//! **2024-03-01T12:34:56.789012Z**: Loaded 'C:\App\example.dll'.␠␠
//! > Dumping stack backtrace…
//! > ```
//! > C:\App\host.exe!00007FF6A1B2C3D4()
//! > !000001D2C0FFEE00()
//! > ```
//! ```
//!
//! The two trailing spaces on the first line are a Markdown line break; an
//! unresolved frame has an empty module segment before the `!`.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::domain::Backtrace;

/// UTC, microsecond precision, `Z` suffix
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// One captured load event, ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRecord {
    timestamp: DateTime<Utc>,
    module_path: String,
    backtrace: Backtrace,
}

impl ReportRecord {
    #[must_use]
    pub fn new(
        timestamp: DateTime<Utc>,
        module_path: impl Into<String>,
        backtrace: Backtrace,
    ) -> Self {
        Self { timestamp, module_path: module_path.into(), backtrace }
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Full path of the module whose load triggered the record
    #[must_use]
    pub fn module_path(&self) -> &str {
        &self.module_path
    }

    #[must_use]
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl fmt::Display for ReportRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "**{}**: Loaded '{}'.  ",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.module_path
        )?;
        writeln!(f, "> Dumping stack backtrace…")?;
        writeln!(f, "> ```")?;
        for frame in self.backtrace.frames() {
            match frame.module_path() {
                Some(path) => writeln!(f, "> {}!{}()", path.display(), frame.frame)?,
                None => writeln!(f, "> !{}()", frame.frame)?,
            }
        }
        writeln!(f, "> ```")
    }
}
