//! Plugin Contract
//!
//! Everything a plugin implements and everything it exchanges with the kernel.
//!
//! # Lifecycle
//!
//! The kernel drives each plugin through these hooks:
//! - `init` then `start` when the kernel runs (or at registration if it already
//!   runs); a failure in either marks the plugin `Bad` and evicts it
//! - `cycle` once per scheduling scan on a worker thread, while `cycle_enabled`
//!   returns true
//! - `stop` then `exit` on unregistration or kernel shutdown
//!
//! `message` and `notify` are delivered synchronously; `stream` runs on a
//! worker thread.
//!
//! # Locking
//!
//! Lifecycle hooks and `message` run while the kernel holds its registry lock.
//! They must return promptly and must not call `lookup`, `dispatch` or
//! `open_stream` on their context: those calls fail with
//! [`KernelError::Reentrant`](crate::KernelError::Reentrant). `cycle` and
//! `stream` run without the lock and may use every kernel service.

mod data;
mod handle;
mod key;
mod stream;

pub use data::*;
pub use handle::*;
pub use key::*;
pub use stream::*;

use crate::error::{PluginError, PluginResult};
use crate::kernel::PluginContext;

/// The capability set every plugin implements
///
/// Hooks take `&self`: the kernel may run `cycle` on a worker thread while a
/// `message` is being delivered on another, so mutable state belongs behind
/// the plugin's own synchronization.
pub trait Plugin<K>: Send + Sync + 'static {
    /// Identity of this plugin instance
    fn key(&self) -> &PluginKey<K>;

    /// Prepare resources; a failure evicts the plugin
    fn init(&self, ctx: &PluginContext<K>) -> PluginResult<()>;

    /// Begin operating; a failure evicts the plugin
    fn start(&self, ctx: &PluginContext<K>) -> PluginResult<()>;

    /// One unit of recurring work, run on a worker thread
    ///
    /// Must not loop indefinitely. Failures are logged and otherwise ignored.
    fn cycle(&self, ctx: &PluginContext<K>) -> PluginResult<()>;

    /// Whether the scheduler should queue `cycle` this scan
    ///
    /// Plugins that drive themselves from their own thread return false.
    fn cycle_enabled(&self) -> bool {
        true
    }

    fn stop(&self, ctx: &PluginContext<K>) -> PluginResult<()>;

    fn exit(&self, ctx: &PluginContext<K>) -> PluginResult<()>;

    /// Notification pushed by the host
    fn notify(&self, _ctx: &PluginContext<K>, _data: &PluginData) -> PluginResult<()> {
        Ok(())
    }

    /// Handle a request from another plugin and fill in `response.data`
    fn message(
        &self,
        ctx: &PluginContext<K>,
        request: &Message<K>,
        response: &mut Message<K>,
    ) -> PluginResult<()>;

    /// Serve a stream opened by another plugin
    ///
    /// Runs on a worker thread; the plugin may keep the end for as long as
    /// it needs, but should not block the worker for the stream's lifetime.
    fn stream(&self, _ctx: &PluginContext<K>, _stream: StreamEnd<K>) -> PluginResult<()> {
        Err(PluginError::Unsupported("stream"))
    }
}
