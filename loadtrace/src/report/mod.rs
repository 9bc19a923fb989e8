//! # Report Sink
//!
//! Turns a captured load event into a Markdown-flavoured text block and
//! delivers it: appended to the configured file, or (with no file) to the
//! debug channel when debug output is enabled.
//!
//! See [`record`] for the exact format.

pub mod record;
pub mod sink;

pub use record::ReportRecord;
pub use sink::{Delivery, ReportSink};
