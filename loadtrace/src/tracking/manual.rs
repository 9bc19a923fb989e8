//! A loader hook driven by the host
//!
//! Hosts that already observe module loads (and tests) feed events in with
//! [`ManualHook::fire`]. Clones share the same listener list.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use super::hook::{LoadEvent, LoadListener, LoaderHook, Registration};
use crate::domain::TrackerError;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Weak<dyn LoadListener>)>,
}

#[derive(Clone, Default)]
pub struct ManualHook {
    listeners: Arc<Mutex<Listeners>>,
}

impl ManualHook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every registered listener
    ///
    /// The listener list is not locked while listeners run, so a listener
    /// may drop its own registration or fire nested events.
    #[inline(never)]
    pub fn fire(&self, event: &LoadEvent) {
        let live: Vec<Arc<dyn LoadListener>> = {
            let listeners = self.listeners.lock();
            listeners.entries.iter().filter_map(|(_, l)| l.upgrade()).collect()
        };

        for listener in live {
            listener.on_load(event);
        }
    }

    /// Shorthand for firing [`LoadEvent::loaded`]
    #[inline(never)]
    pub fn load(&self, full_path: &str) {
        self.fire(&LoadEvent::loaded(full_path));
    }

    /// Number of live registrations
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }
}

impl LoaderHook for ManualHook {
    fn register(&self, listener: Weak<dyn LoadListener>) -> Result<Registration, TrackerError> {
        let id = {
            let mut listeners = self.listeners.lock();
            let id = listeners.next_id;
            listeners.next_id += 1;
            listeners.entries.push((id, listener));
            id
        };

        let listeners = Arc::clone(&self.listeners);
        Ok(Registration::new(move || {
            listeners.lock().entries.retain(|(entry, _)| *entry != id);
        }))
    }

    fn dispatch_entries(&self) -> Vec<u64> {
        vec![Self::fire as usize as u64, Self::load as usize as u64]
    }
}
