//! Fixed-order address resolution: static module first, managed runtime second

use log::debug;
use std::path::PathBuf;

use super::ModuleLookup;
use crate::domain::{Backtrace, BridgeError, Resolution, ResolvedFrame, StackFrame};

/// Identifies the runtime module that owns generated code
pub trait ManagedLookup {
    /// Walk method instance → type definition → module for `address`
    ///
    /// # Errors
    /// Returns the first failing step of the chain
    fn owning_module(&self, address: u64) -> Result<PathBuf, BridgeError>;
}

/// Resolves captured frames to their owning modules
pub struct AddressResolver<'a> {
    modules: &'a dyn ModuleLookup,
    managed: Option<&'a dyn ManagedLookup>,
}

impl<'a> AddressResolver<'a> {
    #[must_use]
    pub fn new(modules: &'a dyn ModuleLookup, managed: Option<&'a dyn ManagedLookup>) -> Self {
        Self { modules, managed }
    }

    /// Resolve one address; never fails, an unknown address is `Unresolved`
    #[must_use]
    pub fn resolve(&self, address: u64) -> Resolution {
        if let Some(path) = self.modules.module_path(address) {
            return Resolution::Static(path);
        }

        let Some(managed) = self.managed else {
            return Resolution::Unresolved;
        };

        match managed.owning_module(address) {
            Ok(path) => Resolution::Managed(path),
            Err(e) => {
                debug!("0x{address:x} left unresolved: {e}");
                Resolution::Unresolved
            }
        }
    }

    /// Resolve a whole stack, keeping its order
    #[must_use]
    pub fn resolve_all(&self, frames: &[StackFrame]) -> Backtrace {
        frames
            .iter()
            .map(|&frame| ResolvedFrame { frame, resolution: self.resolve(frame.address()) })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolization::ModuleTable;
    use std::cell::Cell;

    /// Managed lookup that knows one code range and counts queries
    struct FakeRuntime {
        start: u64,
        end: u64,
        queries: Cell<usize>,
    }

    impl ManagedLookup for FakeRuntime {
        fn owning_module(&self, address: u64) -> Result<PathBuf, BridgeError> {
            self.queries.set(self.queries.get() + 1);
            if (self.start..self.end).contains(&address) {
                Ok(PathBuf::from("Managed.Assembly.dll"))
            } else {
                Err(BridgeError::Status { call: "EnumMethodInstanceByAddress", status: 1 })
            }
        }
    }

    fn table() -> ModuleTable {
        ModuleTable::new().with(0x1000, 0x2000, "/lib/native.so")
    }

    #[test]
    fn test_static_lookup_wins() {
        let modules = table();
        let runtime = FakeRuntime { start: 0x1000, end: 0x9000, queries: Cell::new(0) };
        let resolver = AddressResolver::new(&modules, Some(&runtime));

        assert_eq!(resolver.resolve(0x1800), Resolution::Static(PathBuf::from("/lib/native.so")));
        assert_eq!(runtime.queries.get(), 0);
    }

    #[test]
    fn test_falls_back_to_managed_lookup() {
        let modules = table();
        let runtime = FakeRuntime { start: 0x8000, end: 0x9000, queries: Cell::new(0) };
        let resolver = AddressResolver::new(&modules, Some(&runtime));

        let managed = Resolution::Managed(PathBuf::from("Managed.Assembly.dll"));
        assert_eq!(resolver.resolve(0x8800), managed);
        assert_eq!(resolver.resolve(0x5000), Resolution::Unresolved);
        assert_eq!(runtime.queries.get(), 2);
    }

    #[test]
    fn test_without_managed_lookup_unknown_is_unresolved() {
        let modules = table();
        let resolver = AddressResolver::new(&modules, None);
        assert_eq!(resolver.resolve(0x5000), Resolution::Unresolved);
    }

    #[test]
    fn test_resolve_all_keeps_order() {
        let modules = table();
        let resolver = AddressResolver::new(&modules, None);
        let frames = [StackFrame(0x1100), StackFrame(0x5000), StackFrame(0x1200)];
        let trace = resolver.resolve_all(&frames);

        let resolved: Vec<bool> =
            trace.frames().iter().map(|f| f.resolution.is_resolved()).collect();
        assert_eq!(resolved, vec![true, false, true]);
        assert_eq!(trace.frames()[1].frame, StackFrame(0x5000));
    }
}
