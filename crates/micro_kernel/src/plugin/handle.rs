//! Plugin Handle
//!
//! Registry entry for one plugin: the shared plugin instance plus its
//! lifecycle status. Only the kernel changes the status.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use super::{Domain, Plugin, PluginKey};

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Status
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a registered plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PluginStatus {
    /// Registered but not running
    Stopped = 0,
    /// Initialized and started, eligible for scheduling
    Running = 1,
    /// Init or start failed; evicted before scheduling
    Bad = 2,
}

impl PluginStatus {
    /// Convert from u8
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Stopped,
            1 => Self::Running,
            _ => Self::Bad,
        }
    }

    pub fn is_running(&self) -> bool {
        *self == PluginStatus::Running
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginStatus::Stopped => write!(f, "stopped"),
            PluginStatus::Running => write!(f, "running"),
            PluginStatus::Bad => write!(f, "bad"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Owning registry entry for a plugin instance
///
/// The status cell is shared with in-flight cycle tasks so a task can tell
/// whether its plugin was stopped after the task was queued.
pub struct PluginHandle<K> {
    key: PluginKey<K>,
    plugin: Arc<dyn Plugin<K>>,
    status: Arc<AtomicU8>,
}

impl<K: Domain> PluginHandle<K> {
    pub(crate) fn new(plugin: Arc<dyn Plugin<K>>) -> Self {
        Self {
            key: plugin.key().clone(),
            plugin,
            status: Arc::new(AtomicU8::new(PluginStatus::Stopped as u8)),
        }
    }

    /// Key the plugin was registered with
    pub fn key(&self) -> &PluginKey<K> {
        &self.key
    }

    pub fn plugin(&self) -> &Arc<dyn Plugin<K>> {
        &self.plugin
    }

    pub fn status(&self) -> PluginStatus {
        PluginStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub(crate) fn set_status(&self, status: PluginStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// Snapshot used to run the plugin's cycle on a worker thread
    pub(crate) fn cycle_ticket(&self) -> CycleTicket<K> {
        CycleTicket {
            key: self.key.clone(),
            plugin: Arc::clone(&self.plugin),
            status: Arc::clone(&self.status),
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for PluginHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("key", &self.key)
            .field(
                "status",
                &PluginStatus::from_u8(self.status.load(Ordering::SeqCst)),
            )
            .finish()
    }
}

/// What a queued cycle task needs from the registry entry
pub(crate) struct CycleTicket<K> {
    pub key: PluginKey<K>,
    pub plugin: Arc<dyn Plugin<K>>,
    status: Arc<AtomicU8>,
}

impl<K> CycleTicket<K> {
    /// Whether the plugin is still running at execution time
    pub fn is_running(&self) -> bool {
        PluginStatus::from_u8(self.status.load(Ordering::SeqCst)).is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingPlugin;

    #[test]
    fn test_status_round_trip_through_u8() {
        for status in [PluginStatus::Stopped, PluginStatus::Running, PluginStatus::Bad] {
            assert_eq!(PluginStatus::from_u8(status as u8), status);
        }
        assert_eq!(PluginStatus::Running.to_string(), "running");
    }

    #[test]
    fn test_ticket_sees_status_changes() {
        let handle = PluginHandle::new(RecordingPlugin::new(4).shared());
        assert_eq!(handle.status(), PluginStatus::Stopped);
        assert_eq!(handle.key().domain, 4);

        let ticket = handle.cycle_ticket();
        assert!(!ticket.is_running());

        handle.set_status(PluginStatus::Running);
        assert!(ticket.is_running());

        handle.set_status(PluginStatus::Stopped);
        assert!(!ticket.is_running());
    }
}
