//! # Shared Data Structures (OS loader ↔ tracker)
//!
//! Defines the structures and constants exchanged with the operating system's
//! module loader. All types use `#[repr(C)]` so they can be handed to (and
//! read back from) the loader's notification callback without translation.
//!
//! ## Key Types
//!
//! - [`LdrDllNotificationData`] - Payload delivered with every load/unload notification
//! - [`CountedUtf16`] - Counted (not NUL-terminated) UTF-16 string used by the loader
//! - [`NotificationReason`] - Typed view of the raw notification reason code
//! - [`LdrDllNotificationFn`] - Signature of the callback registered with the loader

#![cfg_attr(not(test), no_std)]

use core::ffi::c_void;

// ============================================================================
// Notification Reason Codes
// ============================================================================

/// A module has been mapped into the process.
///
/// Delivered while the loader lock is held, before the module's entry point runs.
pub const LDR_DLL_NOTIFICATION_REASON_LOADED: u32 = 1;

/// A module is about to be unmapped from the process.
pub const LDR_DLL_NOTIFICATION_REASON_UNLOADED: u32 = 2;

/// Maximum number of frames recorded for a single backtrace
pub const MAX_STACK_DEPTH: usize = 128;

// ============================================================================
// Machine Identifiers
// ============================================================================

/// x86-64 machine identifier (PE `IMAGE_FILE_MACHINE_AMD64`)
pub const IMAGE_FILE_MACHINE_AMD64: u32 = 0x8664;

/// x86 machine identifier (PE `IMAGE_FILE_MACHINE_I386`)
pub const IMAGE_FILE_MACHINE_I386: u32 = 0x014c;

/// AArch64 machine identifier (PE `IMAGE_FILE_MACHINE_ARM64`)
pub const IMAGE_FILE_MACHINE_ARM64: u32 = 0xaa64;

/// Machine identifier of the process this crate is compiled into.
///
/// The debugging-data service always inspects its own process, so the
/// answer is fixed at compile time.
#[cfg(target_arch = "x86_64")]
pub const HOST_MACHINE: u32 = IMAGE_FILE_MACHINE_AMD64;
#[cfg(target_arch = "x86")]
pub const HOST_MACHINE: u32 = IMAGE_FILE_MACHINE_I386;
#[cfg(target_arch = "aarch64")]
pub const HOST_MACHINE: u32 = IMAGE_FILE_MACHINE_ARM64;
#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
pub const HOST_MACHINE: u32 = 0;

// ============================================================================
// Loader Structures
// ============================================================================

/// Counted UTF-16 string as used by the native loader (`UNICODE_STRING`)
///
/// `length` is in **bytes** and excludes any terminator; the buffer is not
/// guaranteed to be NUL-terminated.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CountedUtf16 {
    /// Length of the string in bytes
    pub length: u16,

    /// Capacity of `buffer` in bytes
    pub maximum_length: u16,

    /// UTF-16 code units (may be null when `length` is 0)
    pub buffer: *const u16,
}

impl CountedUtf16 {
    /// View the string as a slice of UTF-16 code units.
    ///
    /// # Safety
    /// `buffer` must point to at least `length / 2` readable code units that
    /// stay valid for the returned lifetime.
    #[allow(unsafe_code)]
    #[must_use]
    pub unsafe fn as_units(&self) -> &[u16] {
        if self.buffer.is_null() || self.length == 0 {
            return &[];
        }
        // SAFETY: caller guarantees the buffer covers `length` bytes
        unsafe { core::slice::from_raw_parts(self.buffer, usize::from(self.length / 2)) }
    }
}

/// Payload of a load or unload notification
///
/// The loader passes the same layout for both reasons (`LDR_DLL_LOADED_NOTIFICATION_DATA`
/// and `LDR_DLL_UNLOADED_NOTIFICATION_DATA` are identical).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LdrDllNotificationData {
    /// Reserved, always zero
    pub flags: u32,

    /// Full path of the module, e.g. `C:\Program Files\App\example.dll`
    pub full_dll_name: *const CountedUtf16,

    /// File name of the module, e.g. `example.dll`
    pub base_dll_name: *const CountedUtf16,

    /// Base address of the mapped image
    pub dll_base: *mut c_void,

    /// Size of the mapped image in bytes
    pub size_of_image: u32,
}

/// Callback signature accepted by `LdrRegisterDllNotification`
pub type LdrDllNotificationFn = unsafe extern "system" fn(
    reason: u32,
    data: *const LdrDllNotificationData,
    context: *mut c_void,
);

/// `LdrRegisterDllNotification(flags, callback, context, cookie) -> NTSTATUS`
pub type LdrRegisterDllNotificationFn = unsafe extern "system" fn(
    flags: u32,
    callback: LdrDllNotificationFn,
    context: *mut c_void,
    cookie: *mut *mut c_void,
) -> i32;

/// `LdrUnregisterDllNotification(cookie) -> NTSTATUS`
pub type LdrUnregisterDllNotificationFn = unsafe extern "system" fn(cookie: *mut c_void) -> i32;

/// Typed notification reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationReason {
    Loaded,
    Unloaded,
}

impl NotificationReason {
    /// Map a raw reason code to a typed reason; unknown codes map to `None`
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            LDR_DLL_NOTIFICATION_REASON_LOADED => Some(Self::Loaded),
            LDR_DLL_NOTIFICATION_REASON_UNLOADED => Some(Self::Unloaded),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_from_raw() {
        assert_eq!(NotificationReason::from_raw(1), Some(NotificationReason::Loaded));
        assert_eq!(NotificationReason::from_raw(2), Some(NotificationReason::Unloaded));
        assert_eq!(NotificationReason::from_raw(7), None);
    }

    #[test]
    #[allow(unsafe_code)]
    fn test_counted_utf16_ignores_trailing_capacity() {
        // "ab" followed by garbage that must not be part of the view
        let units = [u16::from(b'a'), u16::from(b'b'), 0xffff];
        let s = CountedUtf16 { length: 4, maximum_length: 6, buffer: units.as_ptr() };
        assert_eq!(unsafe { s.as_units() }, &units[..2]);
    }

    #[test]
    #[allow(unsafe_code)]
    fn test_counted_utf16_null_buffer_is_empty() {
        let s = CountedUtf16 { length: 8, maximum_length: 8, buffer: core::ptr::null() };
        assert!(unsafe { s.as_units() }.is_empty());
    }
}
