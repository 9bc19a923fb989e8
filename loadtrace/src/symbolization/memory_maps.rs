//! Module address ranges from explicit tables or `/proc/<pid>/maps`
//!
//! A [`ModuleTable`] answers the same question as the platform loader, but
//! from a snapshot. Hosts use it to resolve stacks captured elsewhere; tests
//! use it to build synthetic address spaces.

use anyhow::{Context, Result};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

use super::ModuleLookup;

/// Memory range of a loaded module in a process's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Sorted, non-overlapping module mappings
#[derive(Debug, Clone, Default)]
pub struct ModuleTable {
    mappings: Vec<(MemoryRange, PathBuf)>,
}

impl ModuleTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one mapping; ranges may be added in any order
    pub fn insert(&mut self, range: MemoryRange, path: impl Into<PathBuf>) {
        let at = self.mappings.partition_point(|(r, _)| r.start < range.start);
        self.mappings.insert(at, (range, path.into()));
    }

    /// Builder-style [`insert`](Self::insert)
    #[must_use]
    pub fn with(mut self, start: u64, end: u64, path: impl Into<PathBuf>) -> Self {
        self.insert(MemoryRange { start, end }, path);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Snapshot the file-backed mappings of a live process
    ///
    /// # Errors
    /// Returns an error if `/proc/<pid>/maps` cannot be read or parsed
    pub fn from_proc(pid: u32) -> Result<Self> {
        let maps_path = format!("/proc/{pid}/maps");
        let maps = fs::read_to_string(&maps_path).context(format!("Failed to read {maps_path}"))?;
        let table = Self::parse(&maps)?;
        info!("Read {} file-backed mappings from {maps_path}", table.len());
        Ok(table)
    }

    /// Parse the text of a `maps` file
    ///
    /// Anonymous and pseudo mappings (`[heap]`, `[vdso]`, ...) are skipped;
    /// adjacent mappings of the same file are merged.
    ///
    /// # Errors
    /// Returns an error if an address range is malformed
    pub fn parse(maps: &str) -> Result<Self> {
        let mut table = Self::new();

        for line in maps.lines() {
            // "start-end perms offset dev inode pathname"
            let mut parts = line.splitn(6, char::is_whitespace);
            let Some(range) = parts.next() else {
                continue;
            };
            let Some(pathname) = parts.nth(4).map(str::trim) else {
                continue;
            };
            if !pathname.starts_with('/') {
                continue;
            }

            let (start, end) = range
                .split_once('-')
                .with_context(|| format!("Malformed range in maps line: {line}"))?;
            let start = u64::from_str_radix(start, 16).context("Failed to parse range start")?;
            let end = u64::from_str_radix(end, 16).context("Failed to parse range end")?;

            if let Some((last, path)) = table.mappings.last_mut() {
                if last.end == start && path.as_path() == Path::new(pathname) {
                    last.end = end;
                    continue;
                }
            }
            table.insert(MemoryRange { start, end }, pathname);
        }

        Ok(table)
    }
}

impl ModuleLookup for ModuleTable {
    fn module_path(&self, address: u64) -> Option<PathBuf> {
        let after = self.mappings.partition_point(|(r, _)| r.start <= address);
        let (range, path) = self.mappings.get(after.checked_sub(1)?)?;
        range.contains(address).then(|| path.clone())
    }
}
