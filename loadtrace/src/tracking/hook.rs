//! Loader hook abstraction
//!
//! A [`LoaderHook`] delivers [`LoadEvent`]s to a listener until the returned
//! [`Registration`] is dropped. Listeners are held weakly, so a registration
//! never keeps the tracker alive.

use std::fmt;
use std::sync::Weak;

use loadtrace_common::NotificationReason;

use crate::domain::TrackerError;

/// One module load or unload, as reported by the loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadEvent {
    pub reason: NotificationReason,
    /// Full path of the module
    pub full_path: String,
    /// File name of the module
    pub base_name: String,
}

impl LoadEvent {
    #[must_use]
    pub fn new(
        reason: NotificationReason,
        full_path: impl Into<String>,
        base_name: impl Into<String>,
    ) -> Self {
        Self { reason, full_path: full_path.into(), base_name: base_name.into() }
    }

    /// A load of `full_path`; the base name is its last path component
    #[must_use]
    pub fn loaded(full_path: impl Into<String>) -> Self {
        let full_path = full_path.into();
        let base_name = base_name_of(&full_path).to_string();
        Self { reason: NotificationReason::Loaded, full_path, base_name }
    }

    /// An unload of `full_path`
    #[must_use]
    pub fn unloaded(full_path: impl Into<String>) -> Self {
        Self { reason: NotificationReason::Unloaded, ..Self::loaded(full_path) }
    }
}

/// Last component of a `\`- or `/`-separated path
fn base_name_of(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

/// Receives notifications from a [`LoaderHook`]
///
/// Runs on whichever thread triggered the load, possibly with the platform
/// loader lock held. Must not panic across the hook boundary.
pub trait LoadListener: Send + Sync {
    fn on_load(&self, event: &LoadEvent);
}

/// Source of module-load notifications
pub trait LoaderHook: Send + Sync {
    /// Start delivering notifications to `listener`
    ///
    /// # Errors
    /// [`TrackerError::HookUnavailable`] if the platform has no such facility,
    /// [`TrackerError::HookRejected`] if it refused the registration
    fn register(&self, listener: Weak<dyn LoadListener>) -> Result<Registration, TrackerError>;

    /// Start addresses of the functions that call [`LoadListener::on_load`]
    ///
    /// Captured stacks are cut above the outermost of these, so a report
    /// starts at whatever caused the load.
    fn dispatch_entries(&self) -> Vec<u64> {
        Vec::new()
    }
}

/// A live hook registration; dropping it stops the notifications
pub struct Registration {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Registration {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self { release: Some(Box::new(release)) }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("live", &self.release.is_some()).finish()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Hook for platforms without loader notifications
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableHook;

impl LoaderHook for UnavailableHook {
    fn register(&self, _listener: Weak<dyn LoadListener>) -> Result<Registration, TrackerError> {
        Err(TrackerError::HookUnavailable)
    }
}

/// The loader hook of the running platform
#[must_use]
pub fn platform_hook() -> Box<dyn LoaderHook> {
    #[cfg(windows)]
    {
        Box::new(super::ntdll::NtdllHook::resolve())
    }
    #[cfg(not(windows))]
    {
        Box::new(UnavailableHook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_loaded_event_splits_base_name() {
        let event = LoadEvent::loaded(r"C:\Program Files\App\Example.dll");
        assert_eq!(event.base_name, "Example.dll");
        assert_eq!(event.reason, NotificationReason::Loaded);

        assert_eq!(LoadEvent::loaded("/usr/lib/libfoo.so").base_name, "libfoo.so");
        assert_eq!(LoadEvent::loaded("bare.dll").base_name, "bare.dll");
        assert_eq!(LoadEvent::unloaded("/x/y.so").reason, NotificationReason::Unloaded);
    }

    #[test]
    fn test_registration_releases_once_on_drop() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let registration = Registration::new(move || {
            assert!(!flag.swap(true, Ordering::SeqCst));
        });

        assert!(!released.load(Ordering::SeqCst));
        drop(registration);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unavailable_hook_refuses() {
        struct Nobody;
        impl LoadListener for Nobody {
            fn on_load(&self, _event: &LoadEvent) {}
        }

        let listener: Arc<dyn LoadListener> = Arc::new(Nobody);
        let err = UnavailableHook.register(Arc::downgrade(&listener)).unwrap_err();
        assert!(matches!(err, TrackerError::HookUnavailable));
        assert!(UnavailableHook.dispatch_entries().is_empty());
    }
}
