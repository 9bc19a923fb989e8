//! Tracker configuration

use std::path::PathBuf;
use std::str::FromStr;

use loadtrace_common::MAX_STACK_DEPTH;

/// Report destination for the process-wide tracker
pub const ENV_REPORT: &str = "LOADTRACE_REPORT";
/// `once` or `every`
pub const ENV_MODE: &str = "LOADTRACE_MODE";

/// What happens to a watched name after its load has been reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportMode {
    /// Stop watching the name (a one-shot report)
    #[default]
    Once,
    /// Re-arm the name once the report has been written
    Every,
}

impl FromStr for ReportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(Self::Once),
            "every" => Ok(Self::Every),
            other => Err(format!("unknown report mode '{other}' (expected 'once' or 'every')")),
        }
    }
}

/// Settings for a [`Tracker`](crate::tracking::Tracker)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Initial report destination; `None` means debug output only
    pub report_path: Option<PathBuf>,
    pub mode: ReportMode,
    /// Frames hidden past the loader hook's dispatcher, for hosts that
    /// forward notifications through code of their own. The tracker's and
    /// the hook's frames are always hidden.
    pub frames_to_skip: usize,
    /// Clamped to [`MAX_STACK_DEPTH`]
    pub max_depth: usize,
    /// Send records with no destination to the debug channel
    pub debug_output: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            report_path: None,
            mode: ReportMode::Once,
            frames_to_skip: 0,
            max_depth: MAX_STACK_DEPTH,
            debug_output: cfg!(debug_assertions),
        }
    }
}

impl TrackerConfig {
    /// Defaults overlaid with `LOADTRACE_REPORT` and `LOADTRACE_MODE`
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup(ENV_REPORT).filter(|p| !p.is_empty()) {
            config.report_path = Some(PathBuf::from(path));
        }

        if let Some(mode) = lookup(ENV_MODE) {
            match mode.parse() {
                Ok(mode) => config.mode = mode,
                Err(e) => log::warn!("Ignoring {ENV_MODE}: {e}"),
            }
        }

        config
    }

    #[must_use]
    pub fn with_report_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: ReportMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_frames_to_skip(mut self, frames: usize) -> Self {
        self.frames_to_skip = frames;
        self
    }

    #[must_use]
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth.min(MAX_STACK_DEPTH);
        self
    }

    #[must_use]
    pub fn with_debug_output(mut self, enabled: bool) -> Self {
        self.debug_output = enabled;
        self
    }
}
