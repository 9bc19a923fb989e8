//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

use crate::config::{ReportMode, TrackerConfig};

#[derive(Parser, Debug)]
#[command(
    name = "loadtrace",
    about = "Report the call stack that caused a module to load",
    after_help = "\
EXAMPLES:
    loadtrace --check
        Show what this platform supports
    loadtrace --watch foo.dll --report loads.md foo.dll
        Load foo.dll and record who loaded it
    loadtrace --watch bar.dll --every plugin.dll
        Report every load of bar.dll caused by plugin.dll"
)]
pub struct Args {
    /// Libraries to load through the platform loader, in order
    #[arg(value_name = "LIBRARY")]
    pub libraries: Vec<PathBuf>,

    /// Module base name to watch (repeatable, case-insensitive)
    #[arg(short, long, value_name = "NAME")]
    pub watch: Vec<String>,

    /// Append reports to this file (default: debug output only)
    #[arg(short, long, value_name = "FILE")]
    pub report: Option<PathBuf>,

    /// Keep watching a name after its load has been reported
    #[arg(long)]
    pub every: bool,

    /// Print platform capabilities and unwind metadata of the given libraries, then exit
    #[arg(long)]
    pub check: bool,
}

impl Args {
    /// Tracker settings selected by these arguments
    #[must_use]
    pub fn tracker_config(&self) -> TrackerConfig {
        let mut config = TrackerConfig::from_env().with_debug_output(true);
        if let Some(path) = &self.report {
            config = config.with_report_path(path);
        }
        if self.every {
            config = config.with_mode(ReportMode::Every);
        }
        config
    }
}
