//! C ABI for embedding hosts
//!
//! The exported functions drive one process-wide [`Tracker`], created on
//! first use from [`TrackerConfig::from_env`]. Strings are NUL-terminated
//! UTF-16; booleans are Win32 `BOOL` (`0` false, non-zero true).
//!
//! [`LdrIsolateOpenNurbs`] is unrelated to load tracking: it installs the
//! private manifest that makes one dependency bind side by side.

#![allow(unsafe_code)] // exported entry points take raw pointers
#![allow(non_snake_case)] // exported names follow the Win32 convention

use log::warn;
use parking_lot::Mutex;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use widestring::{U16CStr, U16CString};

use crate::config::TrackerConfig;
use crate::isolation::{Isolator, ManifestIsolation};
use crate::symbolization::{LoaderLookup, ModuleLookup};
use crate::tracking::Tracker;

type Bool = i32;

const FALSE: Bool = 0;
const TRUE: Bool = 1;

/// Shipped beside this library, installed beside the host executable
const ISOLATION_MANIFEST: &str = "opennurbs_private.manifest";

static TRACKER: OnceLock<Tracker> = OnceLock::new();

/// Buffer handed out by [`LdrGetStackTraceFilePath`]; replaced on every set
static PATH_BUFFER: Mutex<Option<U16CString>> = Mutex::new(None);

/// The process-wide tracker behind the exported functions
pub fn tracker() -> &'static Tracker {
    TRACKER.get_or_init(|| Tracker::new(TrackerConfig::from_env()))
}

fn to_bool(value: bool) -> Bool {
    if value {
        TRUE
    } else {
        FALSE
    }
}

fn to_wide(path: &Path) -> U16CString {
    U16CString::from_os_str_truncate(path.as_os_str())
}

/// Borrow a caller string; `None` for a null pointer
///
/// # Safety
/// A non-null `ptr` must point to a NUL-terminated UTF-16 string that stays
/// valid for `'a`.
unsafe fn caller_str<'a>(ptr: *const u16) -> Option<&'a U16CStr> {
    if ptr.is_null() {
        None
    } else {
        // SAFETY: guaranteed by the caller
        Some(unsafe { U16CStr::from_ptr_str(ptr) })
    }
}

/// Replace the report destination; null or empty means debug output only
///
/// # Safety
/// `path` must be null or a NUL-terminated UTF-16 string.
#[no_mangle]
pub unsafe extern "system" fn LdrSetStackTraceFilePath(path: *const u16) {
    // SAFETY: forwarded from the caller's contract
    let path =
        unsafe { caller_str(path) }.map(|s| PathBuf::from(s.to_os_string())).unwrap_or_default();

    let mut buffer = PATH_BUFFER.lock();
    tracker().set_report_path(&path);
    *buffer = Some(to_wide(&path));
}

/// The current report destination
///
/// The returned string is owned by the library and stays valid until the
/// next call to [`LdrSetStackTraceFilePath`].
#[no_mangle]
pub extern "system" fn LdrGetStackTraceFilePath() -> *const u16 {
    let mut buffer = PATH_BUFFER.lock();
    buffer.get_or_insert_with(|| to_wide(&tracker().report_path())).as_ptr()
}

/// Start or stop watching for loads of `module_name`
///
/// Returns true if the name was added (enable) or removed (disable); false
/// for a null name, an unchanged set, or when loads cannot be watched.
///
/// # Safety
/// `module_name` must be null or a NUL-terminated UTF-16 string.
#[no_mangle]
pub unsafe extern "system" fn LdrSetReportOnLoad(module_name: *const u16, enable: Bool) -> Bool {
    // SAFETY: forwarded from the caller's contract
    let Some(name) = (unsafe { caller_str(module_name) }) else {
        return FALSE;
    };

    to_bool(tracker().watch(&name.to_string_lossy(), enable != FALSE))
}

/// Whether a load of `module_name` would currently be reported
///
/// # Safety
/// `module_name` must be null or a NUL-terminated UTF-16 string.
#[no_mangle]
pub unsafe extern "system" fn LdrGetReportOnLoad(module_name: *const u16) -> Bool {
    // SAFETY: forwarded from the caller's contract
    let name = unsafe { caller_str(module_name) };
    to_bool(name.is_some_and(|name| tracker().is_watched(&name.to_string_lossy())))
}

/// Manifest isolation for `library` loaded into the executable `exe`
fn isolation_for(library: &Path, exe: &Path) -> Option<ManifestIsolation> {
    let source = library.parent()?.join(ISOLATION_MANIFEST);
    Some(ManifestIsolation::new(source, exe.parent()?, ISOLATION_MANIFEST))
}

#[cfg(windows)]
fn confirm_install(owner: usize, destination: &Path) -> bool {
    use windows_sys::Win32::UI::WindowsAndMessaging::{
        MessageBoxW, IDYES, MB_ICONQUESTION, MB_YESNO,
    };

    let text = U16CString::from_str_truncate(format!(
        "A private manifest is required at\n{}\n\nInstall it now?",
        destination.display()
    ));
    let caption = U16CString::from_str_truncate("loadtrace");
    // SAFETY: both strings are NUL-terminated; a null owner is permitted
    let answer = unsafe {
        MessageBoxW(
            owner as *mut c_void,
            text.as_ptr(),
            caption.as_ptr(),
            MB_YESNO | MB_ICONQUESTION,
        )
    };
    answer == IDYES
}

#[cfg(not(windows))]
fn confirm_install(_owner: usize, _destination: &Path) -> bool {
    true
}

/// Make sure the private manifest sits beside the host executable
///
/// Asks the user before copying it in, with `host_window` (may be null)
/// owning the prompt. Returns true if the manifest is in place afterwards.
///
/// # Safety
/// `host_window` must be null or a window handle valid for the call.
#[no_mangle]
pub unsafe extern "system" fn LdrIsolateOpenNurbs(host_window: *mut c_void) -> Bool {
    let library = LoaderLookup.module_path(LdrIsolateOpenNurbs as usize as u64);
    let paths = library.zip(std::env::current_exe().ok());
    let Some(isolation) = paths.and_then(|(library, exe)| isolation_for(&library, &exe)) else {
        warn!("Cannot locate the module or executable directory for manifest isolation");
        return FALSE;
    };

    let owner = host_window as usize;
    let isolation = isolation.with_confirm(move |destination| confirm_install(owner, destination));
    to_bool(isolation.ensure_isolated())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_name_is_rejected() {
        unsafe {
            assert_eq!(LdrSetReportOnLoad(std::ptr::null(), TRUE), FALSE);
            assert_eq!(LdrGetReportOnLoad(std::ptr::null()), FALSE);
        }
    }

    #[test]
    fn test_to_wide_truncates_at_nul() {
        let wide = to_wide(Path::new("a.md\0b"));
        assert_eq!(wide.to_string_lossy(), "a.md");
    }

    #[test]
    fn test_isolation_copies_manifest_beside_executable() {
        let dir = tempfile::tempdir().unwrap();
        let (lib_dir, bin_dir) = (dir.path().join("lib"), dir.path().join("bin"));
        std::fs::create_dir(&lib_dir).unwrap();
        std::fs::create_dir(&bin_dir).unwrap();
        std::fs::write(lib_dir.join(ISOLATION_MANIFEST), "<assembly/>").unwrap();

        let isolation =
            isolation_for(&lib_dir.join("loadtrace.dll"), &bin_dir.join("host.exe")).unwrap();
        assert_eq!(isolation.manifest_path(), bin_dir.join(ISOLATION_MANIFEST));
        assert!(isolation.ensure_isolated());
        let installed = std::fs::read_to_string(bin_dir.join(ISOLATION_MANIFEST)).unwrap();
        assert_eq!(installed, "<assembly/>");
    }

    #[test]
    fn test_isolation_needs_parent_directories() {
        assert!(isolation_for(Path::new("loadtrace.dll"), Path::new("/bin/host")).is_some());
        assert!(isolation_for(Path::new("/"), Path::new("/bin/host")).is_none());
        assert!(isolation_for(Path::new("/lib/loadtrace.dll"), Path::new("/")).is_none());
    }
}
