//! # Module-Load Tracking
//!
//! Owns the set of watched module names and the loader hook, and runs the
//! notification pipeline when a watched module loads:
//!
//! ```text
//! loader ──► LoaderHook ──► Tracker (LoadListener)
//!                              │ suppress name   (before anything can load)
//!                              │ timestamp
//!                              │ StackSource::capture
//!                              │ AddressResolver::resolve_all
//!                              │ retire name     (Once)
//!                              │ ReportSink::emit
//!                              └ rearm name      (Every)
//! ```
//!
//! ## Hooks
//!
//! - **`ntdll`** (Windows): `LdrRegisterDllNotification`
//! - **`manual`**: [`ManualHook`], fed by the host
//! - [`UnavailableHook`] everywhere else; watching then fails softly

pub mod hook;
pub mod manual;
#[cfg(windows)]
pub mod ntdll;
pub mod tracker;
pub mod watch_set;

pub use hook::{platform_hook, LoadEvent, LoadListener, LoaderHook, Registration, UnavailableHook};
pub use manual::ManualHook;
pub use tracker::{Tracker, TrackerBuilder};
pub use watch_set::{WatchSet, WatchState};
