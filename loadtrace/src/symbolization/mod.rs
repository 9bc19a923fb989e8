//! # Address Resolution
//!
//! Converts a raw return address into the path of the module that owns it.
//! Unlike a full symbolizer this stops at the module level: no function
//! names, no source lines.
//!
//! ## Resolution Order
//!
//! ```text
//! address
//!    │
//!    ├─► ModuleLookup (static)      ─► mapped image covers it?   ─► Resolution::Static
//!    │      GetModuleHandleExW / dladdr, or a ModuleTable
//!    │
//!    ├─► ManagedLookup (bridge)     ─► method ─► type ─► module  ─► Resolution::Managed
//!    │      only when the debug-data bridge is loaded and free
//!    │
//!    └─► neither                                                 ─► Resolution::Unresolved
//! ```
//!
//! The static lookup never changes a module's reference count; looking an
//! address up is an observation, not a load.
//!
//! ## Module Structure
//!
//! - **`module_lookup`**: [`ModuleLookup`] and the platform loader's
//!   implementation ([`LoaderLookup`])
//! - **`memory_maps`**: [`ModuleTable`], built from explicit ranges or from
//!   `/proc/<pid>/maps`
//! - **`resolver`**: [`AddressResolver`], the fixed-order combination of both
//!   lookups

pub mod memory_maps;
pub mod module_lookup;
pub mod resolver;

pub use memory_maps::{MemoryRange, ModuleTable};
pub use module_lookup::{LoaderLookup, ModuleLookup};
pub use resolver::{AddressResolver, ManagedLookup};
