//! Process-wide ledger of descriptor-holding buffer wrappers.
//!
//! Every registered wrapper pins a handful of exported file descriptors.
//! The monitor keeps count of them so leaks show up in diagnostics (and in
//! tests) instead of as silently exhausted fd tables.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing::trace;

static INSTANCE: Lazy<ResourceMonitor> = Lazy::new(ResourceMonitor::new);

/// Ticket returned by [`ResourceMonitor::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorToken(u64);

#[derive(Debug)]
struct Entry {
    label: String,
    descriptors: usize,
}

/// Registry of live descriptor-holding resources.
#[derive(Debug)]
pub struct ResourceMonitor {
    entries: Mutex<HashMap<u64, Entry>>,
    next: AtomicU64,
}

impl ResourceMonitor {
    fn new() -> Self {
        ResourceMonitor {
            entries: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    /// The process-wide monitor.
    pub fn instance() -> &'static ResourceMonitor {
        &INSTANCE
    }

    /// Start tracking a resource holding `descriptors` file descriptors.
    pub fn register(&self, label: impl Into<String>, descriptors: usize) -> MonitorToken {
        let token = MonitorToken(self.next.fetch_add(1, Ordering::Relaxed));
        let label = label.into();
        trace!(token = token.0, %label, descriptors, "tracking resource");
        self.entries
            .lock()
            .unwrap()
            .insert(token.0, Entry { label, descriptors });
        token
    }

    /// Stop tracking the resource behind `token`.
    pub fn unregister(&self, token: MonitorToken) {
        if self.entries.lock().unwrap().remove(&token.0).is_none() {
            trace!(token = token.0, "unregister for unknown resource");
        }
    }

    /// Whether `token` is still registered.
    pub fn contains(&self, token: MonitorToken) -> bool {
        self.entries.lock().unwrap().contains_key(&token.0)
    }

    /// Number of tracked resources.
    pub fn tracked(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Total number of file descriptors pinned by tracked resources.
    pub fn descriptors(&self) -> usize {
        self.entries.lock().unwrap().values().map(|e| e.descriptors).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::ResourceMonitor;

    #[test]
    fn register_unregister_roundtrip() {
        let monitor = ResourceMonitor::new();
        let token = monitor.register("buffer", 2);
        assert!(monitor.contains(token));
        assert_eq!(monitor.tracked(), 1);
        assert_eq!(monitor.descriptors(), 2);

        monitor.unregister(token);
        assert!(!monitor.contains(token));
        assert_eq!(monitor.tracked(), 0);
        assert_eq!(monitor.descriptors(), 0);
    }

    #[test]
    fn double_unregister_is_harmless() {
        let monitor = ResourceMonitor::new();
        let token = monitor.register("buffer", 1);
        monitor.unregister(token);
        monitor.unregister(token);
        assert_eq!(monitor.tracked(), 0);
    }
}
