//! Kernel Services
//!
//! The surface plugins use to reach the kernel. Every hook receives a
//! [`PluginContext`]; it holds a weak reference to the kernel, so a plugin that
//! outlives its kernel gets [`KernelError::KernelGone`] instead of touching
//! freed state.

use std::sync::{Arc, Weak};

use crate::error::{KernelError, KernelResult};
use crate::plugin::{PluginData, PluginKey, StreamEnd};

/// Services the kernel exposes to plugins
pub trait KernelServices<K>: Send + Sync {
    /// Kernel version string
    fn version(&self) -> &str;

    /// Number of registered plugins
    ///
    /// Lock-free; the one service that is safe to call from lifecycle hooks.
    fn plugin_count(&self) -> usize;

    /// Canonical key (with name and version) registered for `domain`
    fn lookup(&self, domain: &K) -> KernelResult<PluginKey<K>>;

    /// Deliver `request` to the plugin owning `to` and return its response
    ///
    /// The target's `message` hook runs synchronously under the registry lock.
    fn dispatch(&self, from: &PluginKey<K>, to: &K, request: PluginData)
    -> KernelResult<PluginData>;

    /// Route the acceptor end of a stream to its target plugin
    ///
    /// Returns as soon as the target's `stream` hook is queued on the pool.
    fn open_stream(&self, stream: StreamEnd<K>) -> KernelResult<()>;

    /// Emit a log line on behalf of a plugin
    fn log(&self, message: &str);
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Context
// ─────────────────────────────────────────────────────────────────────────────

/// Context passed to every plugin hook
pub struct PluginContext<K> {
    services: Weak<dyn KernelServices<K>>,
}

impl<K> Clone for PluginContext<K> {
    fn clone(&self) -> Self {
        Self {
            services: Weak::clone(&self.services),
        }
    }
}

impl<K: 'static> PluginContext<K> {
    /// Create a context backed by a kernel (or any other service provider)
    pub fn new(services: Weak<dyn KernelServices<K>>) -> Self {
        Self { services }
    }

    /// Context that is not attached to any kernel
    ///
    /// Useful when exercising a plugin's hooks on their own.
    pub fn detached() -> Self {
        let services: Weak<Detached> = Weak::new();
        Self { services }
    }

    /// Whether the kernel behind this context is still alive
    pub fn is_attached(&self) -> bool {
        self.services.strong_count() > 0
    }

    fn services(&self) -> KernelResult<Arc<dyn KernelServices<K>>> {
        self.services.upgrade().ok_or(KernelError::KernelGone)
    }

    pub fn version(&self) -> KernelResult<String> {
        Ok(self.services()?.version().to_string())
    }

    /// Number of registered plugins (0 once the kernel is gone)
    pub fn plugin_count(&self) -> usize {
        self.services().map(|s| s.plugin_count()).unwrap_or(0)
    }

    pub fn lookup(&self, domain: &K) -> KernelResult<PluginKey<K>> {
        self.services()?.lookup(domain)
    }

    pub fn dispatch(
        &self,
        from: &PluginKey<K>,
        to: &K,
        request: PluginData,
    ) -> KernelResult<PluginData> {
        self.services()?.dispatch(from, to, request)
    }

    pub fn open_stream(&self, stream: StreamEnd<K>) -> KernelResult<()> {
        self.services()?.open_stream(stream)
    }

    /// Log through the kernel; dropped silently if the kernel is gone
    pub fn log(&self, message: &str) {
        if let Ok(services) = self.services() {
            services.log(message);
        }
    }
}

impl<K> std::fmt::Debug for PluginContext<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("attached", &(self.services.strong_count() > 0))
            .finish()
    }
}

/// Placeholder provider behind a detached context; never upgraded
struct Detached;

impl<K> KernelServices<K> for Detached {
    fn version(&self) -> &str {
        ""
    }

    fn plugin_count(&self) -> usize {
        0
    }

    fn lookup(&self, _domain: &K) -> KernelResult<PluginKey<K>> {
        Err(KernelError::KernelGone)
    }

    fn dispatch(
        &self,
        _from: &PluginKey<K>,
        _to: &K,
        _request: PluginData,
    ) -> KernelResult<PluginData> {
        Err(KernelError::KernelGone)
    }

    fn open_stream(&self, _stream: StreamEnd<K>) -> KernelResult<()> {
        Err(KernelError::KernelGone)
    }

    fn log(&self, _message: &str) {}
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
