//! Scoped dynamic-library handles
//!
//! A [`Library`] owns one reference on a module loaded through the platform
//! loader (`LoadLibraryW` / `dlopen`) and gives it back on drop, so every exit
//! path that acquires a library also releases it.

#![allow(unsafe_code)] // platform loader calls are FFI

use std::ffi::{c_void, CStr};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use crate::domain::LibraryError;

/// An owned reference on a loaded module
#[derive(Debug)]
pub struct Library {
    handle: NonNull<c_void>,
    path: PathBuf,
}

// SAFETY: module handles are process-wide and may be used and released from any thread
unsafe impl Send for Library {}
unsafe impl Sync for Library {}

impl Library {
    /// Load (or add a reference to) the module at `path`
    ///
    /// # Errors
    /// Returns an error if the loader refuses the module.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LibraryError> {
        let path = path.as_ref();
        let handle = platform::open(path).map_err(|reason| LibraryError::Open {
            path: path.to_path_buf(),
            reason,
        })?;
        log::debug!("Loaded {}", path.display());
        Ok(Self { handle, path: path.to_path_buf() })
    }

    /// Path the library was opened with
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up an exported symbol
    #[must_use]
    pub fn symbol(&self, name: &CStr) -> Option<NonNull<c_void>> {
        platform::symbol(self.handle, name)
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        platform::close(self.handle);
        log::debug!("Released {}", self.path.display());
    }
}

#[cfg(windows)]
mod platform {
    use std::ffi::{c_void, CStr};
    use std::path::Path;
    use std::ptr::NonNull;
    use widestring::U16CString;
    use windows_sys::Win32::Foundation::GetLastError;
    use windows_sys::Win32::System::LibraryLoader::{FreeLibrary, GetProcAddress, LoadLibraryW};

    pub fn open(path: &Path) -> Result<NonNull<c_void>, String> {
        let wide = U16CString::from_os_str(path.as_os_str()).map_err(|e| e.to_string())?;
        // SAFETY: `wide` is NUL-terminated and outlives the call
        let handle = unsafe { LoadLibraryW(wide.as_ptr()) };
        NonNull::new(handle.cast::<c_void>())
            .ok_or_else(|| format!("LoadLibraryW failed (error {})", unsafe { GetLastError() }))
    }

    pub fn symbol(handle: NonNull<c_void>, name: &CStr) -> Option<NonNull<c_void>> {
        // SAFETY: handle is a live module handle and name is NUL-terminated
        let proc = unsafe { GetProcAddress(handle.as_ptr().cast(), name.as_ptr().cast()) };
        proc.and_then(|f| NonNull::new(f as *mut c_void))
    }

    pub fn close(handle: NonNull<c_void>) {
        // SAFETY: the handle came from LoadLibraryW and is released exactly once
        unsafe { FreeLibrary(handle.as_ptr().cast()) };
    }
}

#[cfg(unix)]
mod platform {
    use std::ffi::{c_void, CStr, CString};
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;
    use std::ptr::NonNull;

    pub fn open(path: &Path) -> Result<NonNull<c_void>, String> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| e.to_string())?;
        // SAFETY: c_path is NUL-terminated and outlives the call
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        NonNull::new(handle).ok_or_else(last_dl_error)
    }

    pub fn symbol(handle: NonNull<c_void>, name: &CStr) -> Option<NonNull<c_void>> {
        // SAFETY: handle came from dlopen and name is NUL-terminated
        NonNull::new(unsafe { libc::dlsym(handle.as_ptr(), name.as_ptr()) })
    }

    pub fn close(handle: NonNull<c_void>) {
        // SAFETY: the handle came from dlopen and is released exactly once
        unsafe { libc::dlclose(handle.as_ptr()) };
    }

    fn last_dl_error() -> String {
        // SAFETY: dlerror returns null or a NUL-terminated, thread-local message
        let msg = unsafe { libc::dlerror() };
        if msg.is_null() {
            "unknown dlopen error".to_string()
        } else {
            unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
        }
    }
}
