//! The load tracker: watch set, hook lifetime and the notification pipeline
//!
//! ## Locks
//!
//! - `state` (watch set + hook registration): held only for short,
//!   non-loading critical sections; never held while logging
//! - `bridge`: taken first by configuration calls, which may load or free the
//!   debugging-data library while holding it. The notification path only
//!   ever `try_lock`s it and falls back to static-only resolution.
//! - the sink's destination `RwLock`
//!
//! Order is always `bridge` → `state`. Hook registrations are dropped after
//! `state` is released, because unregistering synchronizes with the loader.
//!
//! ## Invariant
//!
//! Observed under `state`, a registration is live if and only if the watch
//! set is non-empty.

use chrono::Utc;
use log::{info, warn};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use loadtrace_common::NotificationReason;

use super::hook::{platform_hook, LoadEvent, LoadListener, LoaderHook, Registration};
use super::watch_set::WatchSet;
use crate::bridge::{platform_provider, DebugDataBridge, DebugDataProvider};
use crate::config::{ReportMode, TrackerConfig};
use crate::domain::{Backtrace, ModuleName, StackFrame};
use crate::report::{Delivery, ReportRecord, ReportSink};
use crate::symbolization::{AddressResolver, LoaderLookup, ManagedLookup, ModuleLookup};
use crate::unwinding::{FrameSkip, NativeUnwinder, StackSource};

#[derive(Default)]
struct WatchState {
    watched: WatchSet,
    registration: Option<Registration>,
}

impl WatchState {
    fn is_idle(&self) -> bool {
        self.watched.is_empty() && self.registration.is_none()
    }

    /// Take the registration if nothing is watched any more
    fn take_if_empty(&mut self) -> Option<Registration> {
        if self.watched.is_empty() {
            self.registration.take()
        } else {
            None
        }
    }
}

/// A name taken out of matching for the duration of one report
///
/// Dropping it settles the name for the mode, also when the pipeline
/// unwinds: `Once` retires it, `Every` re-arms it.
struct Suppression<'a> {
    shared: &'a Shared,
    name: ModuleName,
}

impl Drop for Suppression<'_> {
    fn drop(&mut self) {
        match self.shared.mode {
            ReportMode::Once => self.shared.retire(&self.name),
            ReportMode::Every => self.shared.state.lock().watched.rearm(&self.name),
        }
    }
}

/// Everything the notification handler needs; shared weakly with the hook
struct Shared {
    state: Mutex<WatchState>,
    bridge: Mutex<DebugDataBridge>,
    sink: ReportSink,
    stack: Box<dyn StackSource>,
    modules: Box<dyn ModuleLookup>,
    mode: ReportMode,
    /// Cuts the capture above the hook's dispatcher
    skip: FrameSkip,
}

/// Watches for module loads and reports the stack that caused them
///
/// Dropping the tracker unregisters any live hook and releases the
/// debug-data bridge.
pub struct Tracker {
    shared: Arc<Shared>,
    hook: Box<dyn LoaderHook>,
}

/// Builds a [`Tracker`] with platform defaults for anything not supplied
pub struct TrackerBuilder {
    config: TrackerConfig,
    hook: Option<Box<dyn LoaderHook>>,
    stack: Option<Box<dyn StackSource>>,
    modules: Option<Box<dyn ModuleLookup>>,
    provider: Option<Box<dyn DebugDataProvider>>,
}

impl TrackerBuilder {
    #[must_use]
    pub fn hook(mut self, hook: impl LoaderHook + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn stack_source(mut self, stack: impl StackSource + 'static) -> Self {
        self.stack = Some(Box::new(stack));
        self
    }

    #[must_use]
    pub fn module_lookup(mut self, modules: impl ModuleLookup + 'static) -> Self {
        self.modules = Some(Box::new(modules));
        self
    }

    #[must_use]
    pub fn bridge_provider(mut self, provider: impl DebugDataProvider + 'static) -> Self {
        self.provider = Some(Box::new(provider));
        self
    }

    #[must_use]
    pub fn build(self) -> Tracker {
        let config = self.config;
        let hook = self.hook.unwrap_or_else(platform_hook);

        let mut anchors = vec![<Shared as LoadListener>::on_load as usize as u64];
        anchors.extend(hook.dispatch_entries());

        let provider = self.provider.unwrap_or_else(platform_provider);
        let shared = Shared {
            state: Mutex::new(WatchState::default()),
            bridge: Mutex::new(DebugDataBridge::new(provider)),
            sink: ReportSink::new(config.report_path.unwrap_or_default(), config.debug_output),
            stack: self.stack.unwrap_or_else(|| Box::new(NativeUnwinder::new(config.max_depth))),
            modules: self.modules.unwrap_or_else(|| Box::new(LoaderLookup)),
            mode: config.mode,
            skip: FrameSkip::through(anchors, config.frames_to_skip),
        };

        Tracker { shared: Arc::new(shared), hook }
    }
}

impl Tracker {
    /// A tracker on the platform's loader hook, unwinder and resolvers
    #[must_use]
    pub fn new(config: TrackerConfig) -> Self {
        Self::builder(config).build()
    }

    #[must_use]
    pub fn builder(config: TrackerConfig) -> TrackerBuilder {
        TrackerBuilder { config, hook: None, stack: None, modules: None, provider: None }
    }

    /// Replace the report destination; an empty path means debug output only
    pub fn set_report_path(&self, path: impl Into<PathBuf>) {
        self.shared.sink.set_destination(path);
    }

    #[must_use]
    pub fn report_path(&self) -> PathBuf {
        self.shared.sink.destination()
    }

    /// Start (`enable`) or stop watching for loads of `module_name`
    ///
    /// Names compare case-insensitively. Enabling returns whether the name
    /// was newly added; disabling returns whether it was present. Enabling
    /// the first name loads the debug-data bridge and then installs the
    /// hook; removing the last name uninstalls the hook and then releases
    /// the bridge. If the hook cannot be installed nothing changes and
    /// `false` is returned.
    pub fn watch(&self, module_name: &str, enable: bool) -> bool {
        let name = ModuleName::new(module_name);
        let mut bridge = self.shared.bridge.lock();

        if enable {
            self.enable(name, &mut bridge)
        } else {
            self.disable(&name, &mut bridge)
        }
    }

    /// Whether a load of `module_name` would currently be reported
    #[must_use]
    pub fn is_watched(&self, module_name: &str) -> bool {
        self.shared.state.lock().watched.is_armed(&ModuleName::new(module_name))
    }

    #[must_use]
    pub fn is_hook_installed(&self) -> bool {
        self.shared.state.lock().registration.is_some()
    }

    /// Number of watched names (armed or mid-report)
    #[must_use]
    pub fn watched_count(&self) -> usize {
        self.shared.state.lock().watched.len()
    }

    #[must_use]
    pub fn mode(&self) -> ReportMode {
        self.shared.mode
    }

    fn enable(&self, name: ModuleName, bridge: &mut DebugDataBridge) -> bool {
        let first = self.shared.state.lock().registration.is_none();
        if first && !bridge.initialize() {
            warn!("Debug-data bridge unavailable; managed frames will be unresolved");
        }

        let outcome = {
            let mut state = self.shared.state.lock();
            let registered = if state.registration.is_some() {
                Ok(false)
            } else {
                self.hook.register(self.listener()).map(|registration| {
                    state.registration = Some(registration);
                    true
                })
            };
            registered.map(|installed| (installed, state.watched.insert(name.clone())))
        };

        match outcome {
            Ok((installed, inserted)) => {
                if installed {
                    info!("Load notifications installed");
                }
                if inserted {
                    info!("Watching for loads of {name}");
                }
                inserted
            }
            Err(e) => {
                warn!("Cannot watch {name}: {e}");
                if self.shared.state.lock().is_idle() {
                    bridge.finalize();
                }
                false
            }
        }
    }

    fn disable(&self, name: &ModuleName, bridge: &mut DebugDataBridge) -> bool {
        let (removed, registration) = {
            let mut state = self.shared.state.lock();
            let removed = state.watched.remove(name);
            (removed, state.take_if_empty())
        };

        if removed {
            info!("Stopped watching {name}");
        }
        if let Some(registration) = registration {
            drop(registration);
            info!("Load notifications removed");
        }
        if self.shared.state.lock().is_idle() {
            bridge.finalize();
        }
        removed
    }

    fn listener(&self) -> Weak<dyn LoadListener> {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        weak
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        let registration = self.shared.state.lock().registration.take();
        if registration.is_some() {
            drop(registration);
            info!("Load notifications removed");
        }
        self.shared.bridge.lock().finalize();
    }
}

impl LoadListener for Shared {
    // Its address bounds every captured stack
    #[inline(never)]
    fn on_load(&self, event: &LoadEvent) {
        if panic::catch_unwind(AssertUnwindSafe(|| self.handle(event))).is_err() {
            warn!("Report for {} aborted by a panic", event.full_path);
        }
    }
}

impl Shared {
    /// The notification pipeline
    ///
    /// 1. match and suppress the name (before anything that may load)
    /// 2. timestamp, capture and resolve
    /// 3. `Once`: retire the name (and the hook if it was the last one)
    /// 4. emit
    /// 5. `Every`: re-arm the name
    ///
    /// A panic anywhere past step 1 still settles the name as in 3 or 5.
    fn handle(&self, event: &LoadEvent) {
        if event.reason != NotificationReason::Loaded {
            return;
        }

        let name = ModuleName::new(&event.base_name);
        if !self.state.lock().watched.suppress(&name) {
            return;
        }
        let suppression = Suppression { shared: self, name: name.clone() };

        let timestamp = Utc::now();
        let frames = self.stack.capture(&self.skip);
        let record = ReportRecord::new(timestamp, event.full_path.as_str(), self.resolve(&frames));
        info!("{name} loaded; captured {} frames", record.backtrace().len());

        if self.mode == ReportMode::Once {
            drop(suppression);
        }

        if self.sink.emit(&record) == Delivery::Dropped {
            log::debug!("Report for {name} was not delivered");
        }
        // Every: `suppression` re-arms the name on return
    }

    fn resolve(&self, frames: &[StackFrame]) -> Backtrace {
        let bridge = self.bridge.try_lock();
        let managed =
            bridge.as_deref().filter(|b| b.is_initialized()).map(|b| b as &dyn ManagedLookup);
        AddressResolver::new(self.modules.as_ref(), managed).resolve_all(frames)
    }

    fn retire(&self, name: &ModuleName) {
        let registration = {
            let mut state = self.state.lock();
            state.watched.retire(name);
            state.take_if_empty()
        };

        let Some(registration) = registration else {
            return;
        };
        drop(registration);
        info!("Load notifications removed");

        // A configuration call holding the bridge will settle it instead
        if let Some(mut bridge) = self.bridge.try_lock() {
            if self.state.lock().is_idle() {
                bridge.finalize();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::UnavailableProvider;
    use crate::symbolization::ModuleTable;
    use crate::tracking::{ManualHook, UnavailableHook};
    use crate::unwinding::FixedStack;

    struct FaultyStack;

    impl StackSource for FaultyStack {
        fn capture(&self, _skip: &FrameSkip) -> Vec<StackFrame> {
            panic!("unwinder fault");
        }
    }

    fn faulty_tracker(hook: ManualHook, mode: ReportMode) -> Tracker {
        Tracker::builder(TrackerConfig::default().with_mode(mode).with_debug_output(false))
            .hook(hook)
            .stack_source(FaultyStack)
            .module_lookup(ModuleTable::new())
            .bridge_provider(UnavailableProvider)
            .build()
    }

    fn tracker(hook: ManualHook) -> Tracker {
        Tracker::builder(TrackerConfig::default().with_debug_output(false))
            .hook(hook)
            .stack_source(FixedStack(vec![StackFrame(0x1010)]))
            .module_lookup(ModuleTable::new().with(0x1000, 0x2000, "/lib/host.so"))
            .bridge_provider(UnavailableProvider)
            .build()
    }

    #[test]
    fn test_watch_roundtrip_ignores_case() {
        let tracker = tracker(ManualHook::new());

        assert!(tracker.watch("Foo.DLL", true));
        assert!(tracker.is_watched("foo.dll"));
        assert!(!tracker.watch("FOO.dll", true));
        assert_eq!(tracker.watched_count(), 1);

        assert!(tracker.watch("foo.dll", false));
        assert!(!tracker.is_watched("Foo.DLL"));
        assert!(!tracker.watch("foo.dll", false));
    }

    #[test]
    fn test_hook_follows_watch_set() {
        let hook = ManualHook::new();
        let tracker = tracker(hook.clone());
        assert!(!tracker.is_hook_installed());

        tracker.watch("a.dll", true);
        tracker.watch("b.dll", true);
        assert!(tracker.is_hook_installed());
        assert_eq!(hook.listener_count(), 1);

        tracker.watch("a.dll", false);
        assert!(tracker.is_hook_installed());

        tracker.watch("b.dll", false);
        assert!(!tracker.is_hook_installed());
        assert_eq!(hook.listener_count(), 0);
    }

    #[test]
    fn test_unavailable_hook_leaves_set_unchanged() {
        let tracker = Tracker::builder(TrackerConfig::default())
            .hook(UnavailableHook)
            .bridge_provider(UnavailableProvider)
            .build();

        assert!(!tracker.watch("a.dll", true));
        assert!(!tracker.is_watched("a.dll"));
        assert_eq!(tracker.watched_count(), 0);
        assert!(!tracker.is_hook_installed());
    }

    #[test]
    fn test_once_mode_retires_name_and_hook() {
        let hook = ManualHook::new();
        let tracker = tracker(hook.clone());
        tracker.watch("a.dll", true);

        hook.load("/opt/a.dll");
        assert!(!tracker.is_watched("a.dll"));
        assert_eq!(tracker.watched_count(), 0);
        assert!(!tracker.is_hook_installed());
        assert_eq!(hook.listener_count(), 0);
    }

    #[test]
    fn test_panic_in_every_mode_rearms_name() {
        let hook = ManualHook::new();
        let tracker = faulty_tracker(hook.clone(), ReportMode::Every);
        tracker.watch("a.dll", true);

        hook.load("/opt/a.dll");
        assert!(tracker.is_watched("a.dll"));
        assert!(tracker.is_hook_installed());

        hook.load("/opt/a.dll");
        assert!(tracker.is_watched("a.dll"));
    }

    #[test]
    fn test_panic_in_once_mode_retires_name_and_hook() {
        let hook = ManualHook::new();
        let tracker = faulty_tracker(hook.clone(), ReportMode::Once);
        tracker.watch("a.dll", true);
        tracker.watch("b.dll", true);

        hook.load("/opt/a.dll");
        assert!(!tracker.is_watched("a.dll"));
        assert_eq!(tracker.watched_count(), 1);

        hook.load("/opt/b.dll");
        assert_eq!(tracker.watched_count(), 0);
        assert!(!tracker.is_hook_installed());
        assert_eq!(hook.listener_count(), 0);
    }

    #[test]
    fn test_capture_is_cut_at_hook_dispatcher() {
        let tracker = tracker(ManualHook::new());
        let anchors = &tracker.shared.skip.anchors;
        assert!(anchors.contains(&(<Shared as LoadListener>::on_load as usize as u64)));
        assert!(anchors.contains(&(ManualHook::load as usize as u64)));
        assert_eq!(tracker.shared.skip.extra, TrackerConfig::default().frames_to_skip);
    }

    #[test]
    fn test_unload_and_other_names_are_ignored() {
        let hook = ManualHook::new();
        let tracker = tracker(hook.clone());
        tracker.watch("a.dll", true);

        hook.fire(&LoadEvent::unloaded("/opt/a.dll"));
        hook.load("/opt/b.dll");
        assert!(tracker.is_watched("a.dll"));
    }

    #[test]
    fn test_drop_removes_hook() {
        let hook = ManualHook::new();
        let tracker = tracker(hook.clone());
        tracker.watch("a.dll", true);
        drop(tracker);
        assert_eq!(hook.listener_count(), 0);
    }

    #[test]
    fn test_report_path_roundtrip() {
        let tracker = tracker(ManualHook::new());
        assert_eq!(tracker.report_path(), PathBuf::new());
        tracker.set_report_path("/tmp/loads.md");
        assert_eq!(tracker.report_path(), PathBuf::from("/tmp/loads.md"));
    }
}
