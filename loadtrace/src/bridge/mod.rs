//! # Debug-Data Bridge
//!
//! Code generated by a managed runtime's JIT lives in anonymous memory, so no
//! loaded module covers it. The runtime ships a debugging-data library
//! (`mscordacwks.dll` next to `clr.dll`, `mscordaccore.dll` next to
//! `coreclr.dll`) that answers "which method is at this address, and which
//! module defines it" by reading the runtime's data structures through a
//! caller-supplied [`DataTarget`].
//!
//! ## Lifetime
//!
//! ```text
//! DebugDataBridge::initialize()  ─► DebugDataProvider::load()  ─► Box<dyn DebugDataService>
//!        (idempotent)                  locate + load library        owns the library handle
//!
//! DebugDataBridge::finalize()    ─► drop(service)               ─► library released
//! ```
//!
//! The service owns the loaded library, so releasing the bridge is just
//! dropping it; dropping the bridge finalizes it too.

pub mod target;

#[cfg(windows)]
mod clrdata;

use log::{debug, info};
use std::path::PathBuf;

use crate::domain::BridgeError;
use crate::symbolization::ManagedLookup;

#[cfg(windows)]
pub use clrdata::{loaded_runtime, ClrDataProvider};
pub use target::{DataTarget, SelfTarget};

/// A loaded debugging-data library, ready to answer queries
pub trait DebugDataService: Send {
    /// Find the module that defines the method containing `address`
    ///
    /// # Errors
    /// Returns the first failing step of the method → type → module chain
    fn owning_module(&self, target: &dyn DataTarget, address: u64) -> Result<PathBuf, BridgeError>;
}

/// Locates and loads a debugging-data library
pub trait DebugDataProvider: Send + Sync {
    /// # Errors
    /// Returns an error if no runtime is loaded or its library cannot be used
    fn load(&self) -> Result<Box<dyn DebugDataService>, BridgeError>;
}

/// Provider for platforms without a supported managed runtime
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableProvider;

impl DebugDataProvider for UnavailableProvider {
    fn load(&self) -> Result<Box<dyn DebugDataService>, BridgeError> {
        Err(BridgeError::RuntimeNotFound)
    }
}

/// The debugging-data provider of the running platform
#[must_use]
pub fn platform_provider() -> Box<dyn DebugDataProvider> {
    #[cfg(windows)]
    {
        Box::new(ClrDataProvider)
    }
    #[cfg(not(windows))]
    {
        Box::new(UnavailableProvider)
    }
}

/// Path of the managed runtime module loaded in this process, if any
#[cfg(not(windows))]
#[must_use]
pub fn loaded_runtime() -> Option<PathBuf> {
    None
}

/// Lazily loaded handle on the debugging-data library
pub struct DebugDataBridge {
    provider: Box<dyn DebugDataProvider>,
    service: Option<Box<dyn DebugDataService>>,
}

impl DebugDataBridge {
    #[must_use]
    pub fn new(provider: Box<dyn DebugDataProvider>) -> Self {
        Self { provider, service: None }
    }

    /// Load the debugging-data library; a no-op returning `true` if loaded
    pub fn initialize(&mut self) -> bool {
        if self.service.is_some() {
            return true;
        }

        match self.provider.load() {
            Ok(service) => {
                info!("Debug-data bridge initialized");
                self.service = Some(service);
                true
            }
            Err(e) => {
                debug!("Debug-data bridge unavailable: {e}");
                false
            }
        }
    }

    /// Release the debugging-data library (if loaded)
    pub fn finalize(&mut self) {
        if self.service.take().is_some() {
            info!("Debug-data bridge released");
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.service.is_some()
    }

    /// The target the service inspects: always this process
    #[must_use]
    pub fn create_data_target(&self) -> Box<dyn DataTarget> {
        Box::new(SelfTarget::new())
    }
}

impl ManagedLookup for DebugDataBridge {
    fn owning_module(&self, address: u64) -> Result<PathBuf, BridgeError> {
        let service = self.service.as_ref().ok_or(BridgeError::RuntimeNotFound)?;
        let target = self.create_data_target();
        service.owning_module(target.as_ref(), address)
    }
}

impl Drop for DebugDataBridge {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts loads and live services
    #[derive(Default)]
    struct Counters {
        loads: AtomicUsize,
        live: AtomicUsize,
    }

    struct FakeProvider(Arc<Counters>);

    impl DebugDataProvider for FakeProvider {
        fn load(&self) -> Result<Box<dyn DebugDataService>, BridgeError> {
            self.0.loads.fetch_add(1, Ordering::SeqCst);
            self.0.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeService(Arc::clone(&self.0))))
        }
    }

    /// Reads one byte at the address through the target and names a module after it
    struct FakeService(Arc<Counters>);

    impl DebugDataService for FakeService {
        fn owning_module(
            &self,
            target: &dyn DataTarget,
            address: u64,
        ) -> Result<PathBuf, BridgeError> {
            let mut byte = [0u8; 1];
            target.read_virtual(address, &mut byte)?;
            Ok(PathBuf::from(format!("module-{:02x}.dll", byte[0])))
        }
    }

    impl Drop for FakeService {
        fn drop(&mut self) {
            self.0.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let counters = Arc::new(Counters::default());
        let mut bridge = DebugDataBridge::new(Box::new(FakeProvider(Arc::clone(&counters))));

        assert!(!bridge.is_initialized());
        assert!(bridge.initialize());
        assert!(bridge.initialize());
        assert!(bridge.is_initialized());
        assert_eq!(counters.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finalize_releases_and_allows_reload() {
        let counters = Arc::new(Counters::default());
        let mut bridge = DebugDataBridge::new(Box::new(FakeProvider(Arc::clone(&counters))));

        bridge.initialize();
        bridge.finalize();
        assert!(!bridge.is_initialized());
        assert_eq!(counters.live.load(Ordering::SeqCst), 0);

        bridge.finalize();
        bridge.initialize();
        assert_eq!(counters.loads.load(Ordering::SeqCst), 2);
        drop(bridge);
        assert_eq!(counters.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unavailable_provider_fails_softly() {
        let mut bridge = DebugDataBridge::new(Box::new(UnavailableProvider));
        assert!(!bridge.initialize());
        assert!(!bridge.is_initialized());
    }

    #[test]
    fn test_lookup_requires_initialization() {
        let bridge = DebugDataBridge::new(Box::new(UnavailableProvider));
        assert!(matches!(bridge.owning_module(0x1000), Err(BridgeError::RuntimeNotFound)));
    }

    #[test]
    #[cfg(any(windows, target_os = "linux"))]
    fn test_lookup_reads_through_data_target() {
        let counters = Arc::new(Counters::default());
        let mut bridge = DebugDataBridge::new(Box::new(FakeProvider(counters)));
        bridge.initialize();

        let code = [0xc3u8];
        let path = bridge.owning_module(code.as_ptr() as u64).unwrap();
        assert_eq!(path, PathBuf::from("module-c3.dll"));

        let err = bridge.owning_module(0).unwrap_err();
        assert!(matches!(err, BridgeError::ReadFailed { .. }));
    }
}
