//! Watched module names and their per-name state
//!
//! ```text
//!            insert                 suppress (match)
//!   absent ─────────► Armed ────────────────────────► Suppressed
//!      ▲                ▲                                  │
//!      │                └──────── rearm (Every) ───────────┤
//!      └────────────────────────── retire (Once) ──────────┘
//! ```
//!
//! Only `Armed` names count as watched: a name is suppressed before anything
//! that could load another module runs, so a nested load of the same module
//! does not match again.

use std::collections::HashMap;

use crate::domain::ModuleName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Armed,
    Suppressed,
}

#[derive(Debug, Default)]
pub struct WatchSet {
    entries: HashMap<ModuleName, WatchState>,
}

impl WatchSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the name is already present (in any state)
    pub fn insert(&mut self, name: ModuleName) -> bool {
        if self.entries.contains_key(&name) {
            return false;
        }
        self.entries.insert(name, WatchState::Armed);
        true
    }

    /// Returns whether an entry was removed
    pub fn remove(&mut self, name: &ModuleName) -> bool {
        self.entries.remove(name).is_some()
    }

    #[must_use]
    pub fn is_armed(&self, name: &ModuleName) -> bool {
        self.entries.get(name) == Some(&WatchState::Armed)
    }

    #[must_use]
    pub fn state(&self, name: &ModuleName) -> Option<WatchState> {
        self.entries.get(name).copied()
    }

    /// Armed → Suppressed; returns whether the name matched
    pub fn suppress(&mut self, name: &ModuleName) -> bool {
        match self.entries.get_mut(name) {
            Some(state @ WatchState::Armed) => {
                *state = WatchState::Suppressed;
                true
            }
            _ => false,
        }
    }

    /// Suppressed → Armed
    pub fn rearm(&mut self, name: &ModuleName) {
        if let Some(state @ WatchState::Suppressed) = self.entries.get_mut(name) {
            *state = WatchState::Armed;
        }
    }

    /// Drop a suppressed name; an entry re-armed meanwhile is kept
    pub fn retire(&mut self, name: &ModuleName) -> bool {
        if self.entries.get(name) == Some(&WatchState::Suppressed) {
            self.entries.remove(name);
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> ModuleName {
        ModuleName::new(s)
    }

    #[test]
    fn test_insert_is_unique_and_case_folded() {
        let mut set = WatchSet::new();
        assert!(set.insert(name("Foo.DLL")));
        assert!(!set.insert(name("foo.dll")));
        assert_eq!(set.len(), 1);
        assert!(set.is_armed(&name("FOO.dll")));
    }

    #[test]
    fn test_suppress_only_matches_once() {
        let mut set = WatchSet::new();
        set.insert(name("a.dll"));

        assert!(set.suppress(&name("a.dll")));
        assert!(!set.is_armed(&name("a.dll")));
        assert!(!set.suppress(&name("a.dll")));
        assert!(!set.suppress(&name("b.dll")));
        assert_eq!(set.state(&name("a.dll")), Some(WatchState::Suppressed));
    }

    #[test]
    fn test_rearm_restores_matching() {
        let mut set = WatchSet::new();
        set.insert(name("a.dll"));
        set.suppress(&name("a.dll"));
        set.rearm(&name("a.dll"));
        assert!(set.suppress(&name("a.dll")));
    }

    #[test]
    fn test_retire_removes_only_suppressed() {
        let mut set = WatchSet::new();
        set.insert(name("a.dll"));
        assert!(!set.retire(&name("a.dll")));

        set.suppress(&name("a.dll"));
        assert!(set.retire(&name("a.dll")));
        assert!(set.is_empty());
    }

    #[test]
    fn test_suppressed_name_is_still_present() {
        let mut set = WatchSet::new();
        set.insert(name("a.dll"));
        set.suppress(&name("a.dll"));
        assert!(!set.insert(name("a.dll")));
        assert!(set.remove(&name("a.dll")));
        assert!(!set.remove(&name("a.dll")));
    }
}
