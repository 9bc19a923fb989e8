//! # loadtrace - Who Loaded This Module?
//!
//! loadtrace watches the process's module loader for a set of module names.
//! When one of them is mapped, it captures the call stack of the thread that
//! caused the load, attributes each return address to the module containing
//! it, and appends a Markdown record to a report file (or the debug channel).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                Embedding host / loadtrace binary                │
//! │        (C ABI in `ffi`, or a `Tracker` built directly)          │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ watch / set report path
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       tracking::Tracker                         │
//! │   WatchSet ── LoaderHook (ntdll / manual) ── notification       │
//! └───────┬────────────────────┬────────────────────┬───────────────┘
//!         │ capture            │ resolve            │ emit
//!         ▼                    ▼                    ▼
//! ┌──────────────┐   ┌───────────────────┐   ┌──────────────┐
//! │  unwinding   │   │  symbolization    │   │    report    │
//! │ (raw frames) │   │  native modules   │   │ (Markdown)   │
//! └──────────────┘   │  + bridge (JIT)   │   └──────────────┘
//!                    └───────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Core Pipeline Modules
//!
//! - [`tracking`]: the watch set, the loader hook and the notification pipeline
//! - [`unwinding`]: return addresses of the current thread
//! - [`symbolization`]: address → containing module, static first, then managed
//! - [`bridge`]: the managed runtime's debugging-data library, for JIT code
//! - [`report`]: report records and where they go
//!
//! ### Supporting Modules
//!
//! - [`domain`]: core types (`ModuleName`, `StackFrame`, `Backtrace`) and errors
//! - [`config`]: tracker settings and their environment overrides
//! - [`library`]: scoped handles on modules loaded through the platform loader
//! - [`preflight`]: capability probing
//! - [`isolation`]: manifest-based private binding of a dependency
//! - [`ffi`]: the C ABI (`LdrSetReportOnLoad` and friends)
//! - [`cli`]: command-line argument parsing
//!
//! ## Typical Usage
//!
//! ```no_run
//! use loadtrace::config::TrackerConfig;
//! use loadtrace::tracking::Tracker;
//!
//! let tracker = Tracker::new(TrackerConfig::default().with_report_path("loads.md"));
//! tracker.watch("example.dll", true);
//! ```
//!
//! ## Key Concepts
//!
//! - **Loader lock**: notifications run synchronously while the loader holds
//!   a process-wide lock, so the pipeline never blocks on anything a loading
//!   thread could hold
//! - **Suppression**: a name is disarmed before symbolization starts, because
//!   resolving addresses may itself load modules
//! - **Static vs. managed resolution**: code in a mapped image belongs to that
//!   image; JIT code is attributed through the runtime's own data

pub mod bridge;
pub mod cli;
pub mod config;
pub mod domain;
pub mod ffi;
pub mod isolation;
pub mod library;
pub mod preflight;
pub mod report;
pub mod symbolization;
pub mod tracking;
pub mod unwinding;
