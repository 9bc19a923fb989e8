//! Static module lookup through the platform loader

#![allow(unsafe_code)] // loader queries are FFI

use std::path::PathBuf;

/// Finds the statically loaded module whose mapped image contains an address
pub trait ModuleLookup: Send + Sync {
    /// Path of the owning module, or `None` if no loaded image covers `address`
    fn module_path(&self, address: u64) -> Option<PathBuf>;
}

/// Asks the process's own loader (`GetModuleHandleExW` / `dladdr`)
#[derive(Debug, Clone, Copy, Default)]
pub struct LoaderLookup;

impl ModuleLookup for LoaderLookup {
    fn module_path(&self, address: u64) -> Option<PathBuf> {
        let address = usize::try_from(address).ok()?;
        platform::module_path(address)
    }
}

#[cfg(windows)]
mod platform {
    use std::path::PathBuf;
    use windows_sys::Win32::Foundation::HMODULE;
    use windows_sys::Win32::System::LibraryLoader::{
        GetModuleHandleExW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
        GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
    };

    pub fn module_path(address: usize) -> Option<PathBuf> {
        let mut module: HMODULE = std::ptr::null_mut();
        let flags =
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT;
        // SAFETY: with FROM_ADDRESS the "name" is only used as an address;
        // UNCHANGED_REFCOUNT leaves the module's reference count alone
        let found = unsafe { GetModuleHandleExW(flags, address as *const u16, &mut module) };
        if found == 0 {
            return None;
        }
        super::module_file_name(module)
    }
}

/// Full path of a loaded module, growing the buffer until it fits
#[cfg(windows)]
pub(crate) fn module_file_name(module: windows_sys::Win32::Foundation::HMODULE) -> Option<PathBuf> {
    use widestring::U16Str;
    use windows_sys::Win32::System::LibraryLoader::GetModuleFileNameW;

    let mut buffer = vec![0u16; 260];
    loop {
        let capacity = u32::try_from(buffer.len()).ok()?;
        // SAFETY: buffer holds `capacity` writable code units
        let len = unsafe { GetModuleFileNameW(module, buffer.as_mut_ptr(), capacity) };
        if len == 0 {
            return None;
        }
        if len < capacity {
            let len = usize::try_from(len).ok()?;
            return Some(PathBuf::from(U16Str::from_slice(&buffer[..len]).to_os_string()));
        }
        // Truncated: the loader filled the whole buffer
        buffer.resize(buffer.len() * 2, 0);
    }
}

#[cfg(unix)]
mod platform {
    use std::ffi::{c_void, CStr};
    use std::path::PathBuf;

    pub fn module_path(address: usize) -> Option<PathBuf> {
        // SAFETY: Dl_info is plain data; dladdr fills it in on success
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        // SAFETY: dladdr only inspects the loader's own tables
        if unsafe { libc::dladdr(address as *const c_void, &mut info) } == 0 {
            return None;
        }

        if info.dli_fname.is_null() {
            return std::env::current_exe().ok();
        }
        // SAFETY: dli_fname is a NUL-terminated string owned by the loader
        let name = unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy();
        if name.is_empty() {
            // The main program has no name in the loader's list
            std::env::current_exe().ok()
        } else {
            Some(PathBuf::from(name.into_owned()))
        }
    }
}

#[cfg(not(any(windows, unix)))]
mod platform {
    use std::path::PathBuf;

    pub fn module_path(_address: usize) -> Option<PathBuf> {
        None
    }
}
