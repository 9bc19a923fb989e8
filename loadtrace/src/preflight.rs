//! Pre-flight checks for loadtrace
//!
//! Reports what the running platform can do before anything is watched, and
//! whether a module file carries the unwind metadata the stack walk needs.
//! Provides clear, actionable messages when something is missing.

use anyhow::{bail, Context, Result};
use object::{BinaryFormat, Object, ObjectSection};
use std::fmt;
use std::path::{Path, PathBuf};

/// What this process supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// A loader notification facility is available
    pub loader_notifications: bool,
    /// How stacks are walked
    pub unwinder: &'static str,
    /// Managed runtime module currently loaded, if any
    pub managed_runtime: Option<PathBuf>,
}

/// Detect what the running platform supports
#[must_use]
pub fn detect_capabilities() -> Capabilities {
    Capabilities {
        loader_notifications: loader_notifications_available(),
        unwinder: unwinder_name(),
        managed_runtime: crate::bridge::loaded_runtime(),
    }
}

#[cfg(windows)]
fn loader_notifications_available() -> bool {
    crate::tracking::ntdll::NtdllHook::resolve().is_available()
}

#[cfg(not(windows))]
fn loader_notifications_available() -> bool {
    false
}

fn unwinder_name() -> &'static str {
    if cfg!(all(windows, target_arch = "x86_64")) {
        "RtlVirtualUnwind (.pdata)"
    } else {
        "platform unwinder (.eh_frame)"
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let yes_no = |b: bool| if b { "yes" } else { "no" };
        writeln!(f, "loader notifications: {}", yes_no(self.loader_notifications))?;
        writeln!(f, "stack unwinder:       {}", self.unwinder)?;
        match &self.managed_runtime {
            Some(runtime) => writeln!(f, "managed runtime:      {}", runtime.display()),
            None => writeln!(f, "managed runtime:      none loaded"),
        }
    }
}

/// Fail with an explanation if loads cannot be watched here
///
/// # Errors
/// Returns an error when the platform has no loader notifications
pub fn check_loader_notifications(caps: &Capabilities) -> Result<()> {
    if !caps.loader_notifications {
        bail!(
            "Loader notifications are not available on this platform.\n\n\
             Watching needs LdrRegisterDllNotification (Windows Vista or newer).\n\
             Libraries can still be loaded, but no reports will be written."
        );
    }
    Ok(())
}

/// Unwind metadata found in a module file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnwindMetadata {
    /// The named section exists and is non-empty
    Present { section: &'static str, size: u64 },
    /// Recognized object file without unwind tables
    Missing,
    /// Not an object file this build can parse
    NotAnObject,
}

/// Check if a module file carries unwind tables (`.pdata` for PE, `.eh_frame` for ELF)
///
/// Frames inside a module without them end the stack walk early.
///
/// # Errors
/// Returns an error if the file does not exist or cannot be read
pub fn check_unwind_metadata(path: &Path) -> Result<UnwindMetadata> {
    check_module_exists(path)?;

    let file_data = std::fs::read(path)
        .with_context(|| format!("Failed to read module: {}", path.display()))?;

    let Ok(obj) = object::File::parse(&*file_data) else {
        return Ok(UnwindMetadata::NotAnObject);
    };

    let section = match obj.format() {
        BinaryFormat::Pe | BinaryFormat::Coff => ".pdata",
        _ => ".eh_frame",
    };

    Ok(match obj.section_by_name(section).map(|s| s.size()) {
        Some(size) if size > 0 => UnwindMetadata::Present { section, size },
        _ => UnwindMetadata::Missing,
    })
}

/// Check if a module file exists and is a regular file
///
/// # Errors
/// Returns an error if the path is missing or is not a file
pub fn check_module_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!(
            "Module not found: {}\n\n\
             Make sure the path is correct and the file exists.",
            path.display()
        );
    }
    if !path.is_file() {
        bail!("Not a file: {}\n\nExpected a module file, not a directory.", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_detected_capabilities_match_platform() {
        let caps = detect_capabilities();
        assert!(!caps.unwinder.is_empty());
        #[cfg(windows)]
        {
            assert!(caps.loader_notifications);
            assert!(check_loader_notifications(&caps).is_ok());
        }
        #[cfg(not(windows))]
        {
            assert!(!caps.loader_notifications);
            assert!(check_loader_notifications(&caps).is_err());
        }
    }

    #[test]
    fn test_capabilities_display() {
        let caps =
            Capabilities { loader_notifications: false, unwinder: "test", managed_runtime: None };
        let text = caps.to_string();
        assert!(text.contains("loader notifications: no"));
        assert!(text.contains("managed runtime:      none loaded"));
    }

    #[test]
    fn test_missing_module_is_an_error() {
        let err = check_unwind_metadata(Path::new("/nonexistent/module.so")).unwrap_err();
        assert!(err.to_string().contains("Module not found"));
    }

    #[test]
    fn test_directory_is_not_a_module() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_module_exists(dir.path()).is_err());
    }

    #[test]
    fn test_text_file_is_not_an_object() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not an object file").unwrap();
        assert_eq!(check_unwind_metadata(file.path()).unwrap(), UnwindMetadata::NotAnObject);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_own_binary_has_eh_frame() {
        let exe = std::env::current_exe().unwrap();
        match check_unwind_metadata(&exe).unwrap() {
            UnwindMetadata::Present { section, size } => {
                assert_eq!(section, ".eh_frame");
                assert!(size > 0);
            }
            other => panic!("expected unwind tables, got {other:?}"),
        }
    }
}
