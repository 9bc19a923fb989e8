//! Core value types shared by the tracker pipeline

use std::fmt;
use std::path::{Path, PathBuf};

/// Case-folded module base name (e.g. `opennurbs.dll`)
///
/// Module names compare case-insensitively everywhere, so the folding
/// happens once at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleName(String);

impl ModuleName {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self(name.to_lowercase())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ModuleName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single return address captured by the unwinder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackFrame(pub u64);

impl StackFrame {
    #[must_use]
    pub const fn address(self) -> u64 {
        self.0
    }
}

/// Rendered as a zero-padded, pointer-width, upper-case hex number (`00007FF6A1B2C3D4`)
impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const WIDTH: usize = std::mem::size_of::<usize>() * 2;
        write!(f, "{:0width$X}", self.0, width = WIDTH)
    }
}

/// Outcome of resolving one address to its owning module
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Address lies inside a statically loaded module's mapped image
    Static(PathBuf),
    /// Address lies in generated code owned by a managed runtime module
    Managed(PathBuf),
    /// Neither lookup knew the address
    Unresolved,
}

impl Resolution {
    #[must_use]
    pub fn module_path(&self) -> Option<&Path> {
        match self {
            Self::Static(path) | Self::Managed(path) => Some(path),
            Self::Unresolved => None,
        }
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Unresolved)
    }
}

/// A captured frame together with its owning module (if any)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFrame {
    pub frame: StackFrame,
    pub resolution: Resolution,
}

impl ResolvedFrame {
    #[must_use]
    pub fn module_path(&self) -> Option<&Path> {
        self.resolution.module_path()
    }
}

/// Resolved call chain, innermost frame first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backtrace(Vec<ResolvedFrame>);

impl Backtrace {
    #[must_use]
    pub fn new(frames: Vec<ResolvedFrame>) -> Self {
        Self(frames)
    }

    #[must_use]
    pub fn frames(&self) -> &[ResolvedFrame] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<ResolvedFrame> for Backtrace {
    fn from_iter<I: IntoIterator<Item = ResolvedFrame>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
