//! `LdrRegisterDllNotification` hook
//!
//! The loader calls [`notification_callback`] synchronously, with its lock
//! held, for every module mapped into or unmapped from the process. The
//! registration primitives are undocumented `ntdll` exports, so they are
//! resolved at run time; their absence makes the hook unavailable rather
//! than failing to load.

#![allow(unsafe_code)] // loader registration and the notification callback are FFI

use std::ffi::c_void;
use std::sync::Weak;

use loadtrace_common::{
    CountedUtf16, LdrDllNotificationData, LdrRegisterDllNotificationFn,
    LdrUnregisterDllNotificationFn, NotificationReason,
};
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};

use super::hook::{LoadEvent, LoadListener, LoaderHook, Registration};
use crate::domain::TrackerError;

/// Run-time resolved loader registration entry points
#[derive(Clone, Copy)]
pub struct NtdllHook {
    register: Option<LdrRegisterDllNotificationFn>,
    unregister: Option<LdrUnregisterDllNotificationFn>,
}

impl NtdllHook {
    /// Look up the registration exports in the already-loaded `ntdll.dll`
    #[must_use]
    pub fn resolve() -> Self {
        let name: Vec<u16> = "ntdll.dll\0".encode_utf16().collect();
        // SAFETY: `name` is NUL-terminated; ntdll is mapped into every process
        let ntdll = unsafe { GetModuleHandleW(name.as_ptr()) };
        if ntdll.is_null() {
            return Self { register: None, unregister: None };
        }

        // SAFETY: the exports have the signatures declared in loadtrace-common
        unsafe {
            let register = GetProcAddress(ntdll, c"LdrRegisterDllNotification".as_ptr().cast())
                .map(|f| std::mem::transmute::<_, LdrRegisterDllNotificationFn>(f));
            let unregister = GetProcAddress(ntdll, c"LdrUnregisterDllNotification".as_ptr().cast())
                .map(|f| std::mem::transmute::<_, LdrUnregisterDllNotificationFn>(f));
            Self { register, unregister }
        }
    }

    /// Whether both registration exports were found
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.register.is_some() && self.unregister.is_some()
    }
}

/// Raw pointer moved into the release closure
struct SendPtr(*mut c_void);

// SAFETY: the cookie and context are only used to unregister, from any thread
unsafe impl Send for SendPtr {}

impl LoaderHook for NtdllHook {
    fn register(&self, listener: Weak<dyn LoadListener>) -> Result<Registration, TrackerError> {
        let (Some(register), Some(unregister)) = (self.register, self.unregister) else {
            return Err(TrackerError::HookUnavailable);
        };

        let context = Box::into_raw(Box::new(listener)).cast::<c_void>();
        let mut cookie: *mut c_void = std::ptr::null_mut();
        // SAFETY: the callback matches the loader's signature and `context`
        // stays alive until after unregistration
        let status = unsafe { register(0, notification_callback, context, &mut cookie) };
        if status < 0 {
            // SAFETY: the loader refused the registration and never saw `context`
            drop(unsafe { Box::from_raw(context.cast::<Weak<dyn LoadListener>>()) });
            return Err(TrackerError::HookRejected { status: status as u32 });
        }

        let (cookie, context) = (SendPtr(cookie), SendPtr(context));
        Ok(Registration::new(move || {
            // SAFETY: the cookie came from a successful registration; once
            // unregistered the loader no longer hands out `context`
            unsafe {
                unregister(cookie.0);
                drop(Box::from_raw(context.0.cast::<Weak<dyn LoadListener>>()));
            }
        }))
    }

    fn dispatch_entries(&self) -> Vec<u64> {
        vec![notification_callback as usize as u64]
    }
}

#[inline(never)]
unsafe extern "system" fn notification_callback(
    reason: u32,
    data: *const LdrDllNotificationData,
    context: *mut c_void,
) {
    if data.is_null() || context.is_null() {
        return;
    }
    let Some(reason) = NotificationReason::from_raw(reason) else {
        return;
    };

    // SAFETY: `context` is the boxed Weak installed by `register`, and the
    // loader guarantees `data` and its strings for the duration of the call
    let (listener, event) = unsafe {
        let Some(listener) = (*context.cast::<Weak<dyn LoadListener>>()).upgrade() else {
            return;
        };
        let data = &*data;
        let text = |s: &CountedUtf16| String::from_utf16_lossy(s.as_units());
        let full_path = data.full_dll_name.as_ref().map(text);
        let base_name = data.base_dll_name.as_ref().map(text);
        match (full_path, base_name) {
            (Some(full_path), Some(base_name)) => {
                (listener, LoadEvent::new(reason, full_path, base_name))
            }
            _ => return,
        }
    };

    listener.on_load(&event);
}
