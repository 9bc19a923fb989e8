#![allow(unsafe_code)]

use loadtrace::ffi::{
    tracker, LdrGetReportOnLoad, LdrGetStackTraceFilePath, LdrSetReportOnLoad,
    LdrSetStackTraceFilePath,
};
use std::path::PathBuf;
use widestring::{U16CStr, U16CString};

fn current_path() -> String {
    let ptr = LdrGetStackTraceFilePath();
    assert!(!ptr.is_null());
    unsafe { U16CStr::from_ptr_str(ptr) }.to_string_lossy()
}

#[test]
fn test_null_pointers_are_rejected() {
    unsafe {
        assert_eq!(LdrSetReportOnLoad(std::ptr::null(), 1), 0);
        assert_eq!(LdrSetReportOnLoad(std::ptr::null(), 0), 0);
        assert_eq!(LdrGetReportOnLoad(std::ptr::null()), 0);
    }
}

#[test]
fn test_report_path_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("loads.md");
    let wide = U16CString::from_os_str(path.as_os_str()).unwrap();

    unsafe { LdrSetStackTraceFilePath(wide.as_ptr()) };
    assert_eq!(current_path(), path.to_string_lossy());
    assert_eq!(tracker().report_path(), path);

    unsafe { LdrSetStackTraceFilePath(std::ptr::null()) };
    assert_eq!(current_path(), "");
    assert_eq!(tracker().report_path(), PathBuf::new());
}

#[test]
fn test_unwatched_name_is_not_reported() {
    let name = U16CString::from_str("never-loaded-module.dll").unwrap();
    assert_eq!(unsafe { LdrGetReportOnLoad(name.as_ptr()) }, 0);
    assert_eq!(unsafe { LdrSetReportOnLoad(name.as_ptr(), 0) }, 0);
}

#[test]
#[cfg(not(windows))]
fn test_watch_fails_softly_without_loader_notifications() {
    let name = U16CString::from_str("libexample.so").unwrap();
    assert_eq!(unsafe { LdrSetReportOnLoad(name.as_ptr(), 1) }, 0);
    assert_eq!(unsafe { LdrGetReportOnLoad(name.as_ptr()) }, 0);
    assert!(!tracker().is_hook_installed());
}

#[test]
#[cfg(windows)]
fn test_watch_roundtrip_through_c_abi() {
    let name = U16CString::from_str("Example.DLL").unwrap();
    let folded = U16CString::from_str("example.dll").unwrap();
    unsafe {
        assert_eq!(LdrSetReportOnLoad(name.as_ptr(), 1), 1);
        assert_eq!(LdrGetReportOnLoad(folded.as_ptr()), 1);
        assert_eq!(LdrSetReportOnLoad(folded.as_ptr(), 0), 1);
        assert_eq!(LdrGetReportOnLoad(name.as_ptr()), 0);
    }
}

#[test]
#[cfg(not(windows))]
fn test_isolation_without_shipped_manifest_fails() {
    use loadtrace::ffi::LdrIsolateOpenNurbs;

    // Nothing ships a manifest beside the test binary
    let exe = std::env::current_exe().unwrap();
    let installed = exe.with_file_name("opennurbs_private.manifest");
    if installed.exists() {
        return;
    }

    assert_eq!(unsafe { LdrIsolateOpenNurbs(std::ptr::null_mut()) }, 0);
    assert!(!installed.exists());
}
