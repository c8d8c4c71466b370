//! Micro Kernel - in-process plugin host
//!
//! Plugins are registered under a caller-defined domain, brought up when the
//! kernel runs, and given recurring `cycle` work on a shared worker pool. They
//! talk to each other through synchronous request/response dispatch and
//! long-lived duplex streams routed by the kernel.
//!
//! ```ignore
//! let pool = Arc::new(WorkerPool::with_defaults()?);
//! let kernel = MicroKernel::new(200, pool)?;
//! kernel.register(Arc::new(MyPlugin::new()))?;
//! kernel.run()?; // blocks until shutdown() is called elsewhere
//! ```

pub mod config;
pub mod error;
pub mod kernel;
pub mod plugin;
pub mod pool;
pub mod queue;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{KernelConfig, MicroKernelConfig, PoolConfig};
pub use error::{
    KernelError, KernelResult, LifecycleStage, PluginError, PluginResult, RejectReason,
    StreamError,
};
pub use kernel::{KERNEL_VERSION, KernelServices, MicroKernel, PluginContext};
pub use plugin::{
    Domain, Message, Plugin, PluginData, PluginHandle, PluginKey, PluginStatus, StreamEnd,
    StreamRoute,
};
pub use pool::{Task, ThreadPool, WorkerPool};
