//! Data target: the process-inspection capabilities handed to the
//! debugging-data service
//!
//! The service never touches the inspected process itself; every memory read
//! and image-base query goes through a [`DataTarget`]. The bridge always
//! inspects its own process, so [`SelfTarget`] reads same-process memory.

#![allow(unsafe_code)] // same-process memory reads are FFI

use loadtrace_common::HOST_MACHINE;

use crate::domain::BridgeError;

/// Capabilities the debugging-data service may ask of its target
///
/// Only the first four are required. Writing memory, thread contexts, TLS
/// and custom requests are never needed here and report
/// [`BridgeError::NotImplemented`] unless an implementation overrides them.
pub trait DataTarget: Send + Sync {
    /// Machine identifier of the inspected process (`IMAGE_FILE_MACHINE_*`)
    fn machine_type(&self) -> u32;

    /// Pointer width of the inspected process, in bytes
    fn pointer_size(&self) -> u32;

    /// In-memory base address of a loaded image, looked up by name
    ///
    /// # Errors
    /// [`BridgeError::ImageNotFound`] if no loaded image has that name
    fn image_base(&self, image_name: &str) -> Result<u64, BridgeError>;

    /// Read target memory into `buffer`, returning the number of bytes read
    ///
    /// # Errors
    /// [`BridgeError::ReadFailed`] if the range is not readable
    fn read_virtual(&self, address: u64, buffer: &mut [u8]) -> Result<usize, BridgeError>;

    /// # Errors
    /// Unsupported by default
    fn write_virtual(&self, _address: u64, _data: &[u8]) -> Result<usize, BridgeError> {
        Err(BridgeError::NotImplemented("WriteVirtual"))
    }

    /// # Errors
    /// Unsupported by default
    fn tls_value(&self, _thread_id: u32, _index: u32) -> Result<u64, BridgeError> {
        Err(BridgeError::NotImplemented("GetTLSValue"))
    }

    /// # Errors
    /// Unsupported by default
    fn set_tls_value(&self, _thread_id: u32, _index: u32, _value: u64) -> Result<(), BridgeError> {
        Err(BridgeError::NotImplemented("SetTLSValue"))
    }

    /// # Errors
    /// Unsupported by default
    fn current_thread_id(&self) -> Result<u32, BridgeError> {
        Err(BridgeError::NotImplemented("GetCurrentThreadID"))
    }

    /// # Errors
    /// Unsupported by default
    fn thread_context(
        &self,
        _thread_id: u32,
        _flags: u32,
        _context: &mut [u8],
    ) -> Result<(), BridgeError> {
        Err(BridgeError::NotImplemented("GetThreadContext"))
    }

    /// # Errors
    /// Unsupported by default
    fn set_thread_context(&self, _thread_id: u32, _context: &[u8]) -> Result<(), BridgeError> {
        Err(BridgeError::NotImplemented("SetThreadContext"))
    }

    /// # Errors
    /// Unsupported by default
    fn request(&self, _code: u32, _input: &[u8], _output: &mut [u8]) -> Result<(), BridgeError> {
        Err(BridgeError::NotImplemented("Request"))
    }
}

/// The current process, read directly
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfTarget;

impl SelfTarget {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl DataTarget for SelfTarget {
    fn machine_type(&self) -> u32 {
        HOST_MACHINE
    }

    fn pointer_size(&self) -> u32 {
        // usize is at most 8 bytes on every supported target
        std::mem::size_of::<usize>() as u32
    }

    fn image_base(&self, image_name: &str) -> Result<u64, BridgeError> {
        platform::image_base(image_name)
            .filter(|&base| base != 0)
            .ok_or_else(|| BridgeError::ImageNotFound { name: image_name.to_string() })
    }

    fn read_virtual(&self, address: u64, buffer: &mut [u8]) -> Result<usize, BridgeError> {
        if buffer.is_empty() {
            return Ok(0);
        }
        platform::read(address, buffer)
            .ok_or(BridgeError::ReadFailed { address, len: buffer.len() })
    }
}

#[cfg(windows)]
mod platform {
    use std::ffi::c_void;
    use widestring::U16CString;
    use windows_sys::Win32::System::Diagnostics::Debug::ReadProcessMemory;
    use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    pub fn image_base(image_name: &str) -> Option<u64> {
        let wide = U16CString::from_str(image_name).ok()?;
        // SAFETY: `wide` is NUL-terminated; the handle is not reference counted
        let module = unsafe { GetModuleHandleW(wide.as_ptr()) };
        Some(module as u64)
    }

    pub fn read(address: u64, buffer: &mut [u8]) -> Option<usize> {
        let mut read = 0usize;
        // SAFETY: buffer is writable for its whole length; ReadProcessMemory
        // validates the source range itself
        let ok = unsafe {
            ReadProcessMemory(
                GetCurrentProcess(),
                address as usize as *const c_void,
                buffer.as_mut_ptr().cast(),
                buffer.len(),
                &mut read,
            )
        };
        (ok != 0).then_some(read)
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use std::ffi::{c_int, c_void, CStr};
    use std::fs::File;
    use std::os::unix::fs::FileExt;
    use std::path::Path;

    struct ImageSearch<'a> {
        wanted: &'a str,
        exe_name: Option<String>,
        found: Option<u64>,
    }

    unsafe extern "C" fn visit_image(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        // SAFETY: dl_iterate_phdr passes back the ImageSearch we gave it and a
        // valid info record for the duration of the call
        let (search, info) = unsafe { (&mut *data.cast::<ImageSearch<'_>>(), &*info) };

        let name = if info.dlpi_name.is_null() {
            ""
        } else {
            // SAFETY: dlpi_name is a NUL-terminated string owned by the loader
            unsafe { CStr::from_ptr(info.dlpi_name) }.to_str().unwrap_or("")
        };

        let matches = if name.is_empty() {
            // The main program is listed without a name
            search.exe_name.as_deref() == Some(search.wanted)
        } else {
            name == search.wanted || Path::new(name).file_name().is_some_and(|f| f == search.wanted)
        };

        if matches {
            search.found = Some(info.dlpi_addr as u64);
            1
        } else {
            0
        }
    }

    pub fn image_base(image_name: &str) -> Option<u64> {
        let exe_name = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.file_name().map(|f| f.to_string_lossy().into_owned()));
        let mut search = ImageSearch { wanted: image_name, exe_name, found: None };
        // SAFETY: the callback only touches `search`, which outlives the walk
        unsafe { libc::dl_iterate_phdr(Some(visit_image), std::ptr::addr_of_mut!(search).cast()) };
        search.found
    }

    pub fn read(address: u64, buffer: &mut [u8]) -> Option<usize> {
        let local = libc::iovec { iov_base: buffer.as_mut_ptr().cast(), iov_len: buffer.len() };
        let remote =
            libc::iovec { iov_base: address as usize as *mut c_void, iov_len: buffer.len() };
        // SAFETY: both iovecs describe `buffer.len()` bytes; the kernel checks
        // the remote range and fails with EFAULT instead of faulting
        let read = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
        if let Ok(read) = usize::try_from(read) {
            return Some(read);
        }

        // process_vm_readv may be filtered (seccomp); /proc/self/mem needs no ptrace rights
        log::debug!("process_vm_readv failed: {}", std::io::Error::last_os_error());
        File::open("/proc/self/mem").ok()?.read_at(buffer, address).ok()
    }
}

#[cfg(not(any(windows, target_os = "linux")))]
mod platform {
    pub fn image_base(_image_name: &str) -> Option<u64> {
        None
    }

    pub fn read(_address: u64, _buffer: &mut [u8]) -> Option<usize> {
        None
    }
}
