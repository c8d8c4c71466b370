//! Micro Kernel
//!
//! Owns the plugin registry, drives plugin lifecycles and schedules `cycle`
//! work onto a [`ThreadPool`].
//!
//! # Threads
//!
//! - The control thread calls [`MicroKernel::run`], which bootstraps every
//!   registered plugin and then blocks in the scheduling loop.
//! - Worker threads execute `cycle` and `stream` hooks.
//! - Any thread may register, unregister, look up and dispatch.
//!
//! All registry access goes through one lock. The scheduling loop snapshots
//! the eligible plugins under the lock and submits their cycle tasks after
//! releasing it, so a full task queue never blocks workers that need the lock
//! to dispatch.

mod services;

pub use services::{KernelServices, PluginContext};

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult, LifecycleStage, PluginError};
use crate::plugin::{
    CycleTicket, Domain, Message, Plugin, PluginData, PluginHandle, PluginKey, PluginStatus,
    StreamEnd,
};
use crate::pool::{Task, ThreadPool};
use crate::registry::Registry;

/// Version reported to plugins through [`PluginContext::version`]
pub const KERNEL_VERSION: &str = "1.0.0";

/// Shortest pause between scans once the worker pool has stopped
const POOL_LOST_PAUSE: Duration = Duration::from_millis(50);

thread_local! {
    /// Kernel whose registry lock the current thread holds, if any
    static HELD_LOCK: Cell<Option<Uuid>> = const { Cell::new(None) };
}

// ─────────────────────────────────────────────────────────────────────────────
// Kernel State
// ─────────────────────────────────────────────────────────────────────────────

struct KernelState<K> {
    registry: Registry<K>,
    /// True while a scheduling loop is executing
    loop_active: bool,
}

/// Registry lock guard that marks the owning thread
///
/// Lets kernel services called back from a hook detect that the lock is
/// already held instead of deadlocking on it.
struct StateGuard<'a, K> {
    guard: MutexGuard<'a, KernelState<K>>,
    previous: Option<Uuid>,
}

impl<K> Deref for StateGuard<'_, K> {
    type Target = KernelState<K>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<K> DerefMut for StateGuard<'_, K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<K> Drop for StateGuard<'_, K> {
    fn drop(&mut self) {
        HELD_LOCK.with(|held| held.set(self.previous));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Kernel Inner
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct KernelInner<K> {
    id: Uuid,
    plugin_limit: usize,
    cycle_interval: Duration,
    pool: Arc<dyn ThreadPool>,
    state: Mutex<KernelState<K>>,
    running: AtomicBool,
    /// Set once the pool has been seen refusing work; warns only once
    pool_lost: AtomicBool,
    /// Lock-free mirror of the registry size
    plugin_count: AtomicUsize,
    /// Wakes the scheduling loop out of its inter-scan pause
    wakeup: Condvar,
    /// Signalled when the scheduling loop returns
    loop_exited: Condvar,
    context: PluginContext<K>,
}

impl<K: Domain> KernelInner<K> {
    /// Acquire the registry lock, failing if this thread already holds it
    fn lock_checked(&self) -> KernelResult<StateGuard<'_, K>> {
        if HELD_LOCK.with(|held| held.get()) == Some(self.id) {
            return Err(KernelError::Reentrant);
        }
        Ok(self.lock())
    }

    fn lock(&self) -> StateGuard<'_, K> {
        let guard = self.state.lock();
        let previous = HELD_LOCK.with(|held| held.replace(Some(self.id)));
        StateGuard { guard, previous }
    }

    fn sync_count(&self, state: &KernelState<K>) {
        self.plugin_count
            .store(state.registry.len(), Ordering::SeqCst);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    fn run(&self) -> KernelResult<()> {
        {
            let mut state = self.lock_checked()?;
            if self.running.load(Ordering::SeqCst) || state.loop_active {
                debug!(kernel_id = %self.id, "Kernel already running");
                return Ok(());
            }

            self.bootstrap(&mut state);
            state.loop_active = true;
            self.running.store(true, Ordering::SeqCst);

            info!(
                kernel_id = %self.id,
                plugins = state.registry.len(),
                "Micro kernel running"
            );
        }

        self.schedule_loop();
        Ok(())
    }

    /// Init every plugin, evict failures, then start the rest and evict again
    fn bootstrap(&self, state: &mut KernelState<K>) {
        for handle in state.registry.iter() {
            if let Err(e) = handle.plugin().init(&self.context) {
                warn!(plugin = %handle.key(), error = %e, "Plugin init failed");
                handle.set_status(PluginStatus::Bad);
            }
        }
        self.evict_bad(state);

        for handle in state.registry.iter() {
            match handle.plugin().start(&self.context) {
                Ok(()) => handle.set_status(PluginStatus::Running),
                Err(e) => {
                    warn!(plugin = %handle.key(), error = %e, "Plugin start failed");
                    handle.set_status(PluginStatus::Bad);
                }
            }
        }
        self.evict_bad(state);
    }

    fn evict_bad(&self, state: &mut KernelState<K>) {
        for key in state.registry.evict_bad() {
            warn!(kernel_id = %self.id, plugin = %key, "Evicted plugin");
        }
        self.sync_count(state);
    }

    fn schedule_loop(&self) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            self.schedule_cycles();

            let mut state = self.lock();
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let pause = if self.pool_lost.load(Ordering::SeqCst) {
                self.cycle_interval.max(POOL_LOST_PAUSE)
            } else {
                self.cycle_interval
            };
            if !pause.is_zero() {
                self.wakeup.wait_for(&mut state.guard, pause);
            }
        }

        self.lock().loop_active = false;
        self.loop_exited.notify_all();
        info!(kernel_id = %self.id, "Scheduling loop stopped");
    }

    /// One scheduling scan: queue `cycle` for every running plugin that wants it
    fn schedule_cycles(&self) -> usize {
        if !self.pool.is_running() {
            self.note_pool_lost();
            return 0;
        }

        let tickets: Vec<CycleTicket<K>> = {
            let state = self.lock();
            if !self.running.load(Ordering::SeqCst) {
                return 0;
            }
            state
                .registry
                .iter()
                .filter(|h| h.status().is_running() && h.plugin().cycle_enabled())
                .map(|h| h.cycle_ticket())
                .collect()
        };

        let mut submitted = 0;
        for ticket in tickets {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let ctx = self.context.clone();
            let task: Task = Box::new(move || run_cycle(ticket, ctx));
            if !self.pool.submit(task) {
                self.note_pool_lost();
                break;
            }
            submitted += 1;
        }

        trace!(kernel_id = %self.id, submitted, "Scheduling scan complete");
        submitted
    }

    fn note_pool_lost(&self) {
        if !self.pool_lost.swap(true, Ordering::SeqCst) {
            warn!(kernel_id = %self.id, "Worker pool stopped, cycles are no longer scheduled");
        }
    }

    fn shutdown(&self) {
        let mut state = match self.lock_checked() {
            Ok(state) => state,
            Err(e) => {
                warn!(kernel_id = %self.id, error = %e, "Shutdown refused");
                return;
            }
        };

        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.wakeup.notify_all();

        while state.loop_active {
            self.loop_exited.wait(&mut state.guard);
        }

        for handle in state.registry.iter() {
            if handle.status().is_running() {
                self.teardown(handle);
            }
        }

        info!(
            kernel_id = %self.id,
            plugins = state.registry.len(),
            "Micro kernel shut down"
        );
    }

    /// Stop and exit a running plugin; failures are logged
    fn teardown(&self, handle: &PluginHandle<K>) {
        handle.set_status(PluginStatus::Stopped);
        if let Err(e) = handle.plugin().stop(&self.context) {
            warn!(plugin = %handle.key(), stage = %LifecycleStage::Stop, error = %e, "Plugin teardown failed");
        }
        if let Err(e) = handle.plugin().exit(&self.context) {
            warn!(plugin = %handle.key(), stage = %LifecycleStage::Exit, error = %e, "Plugin teardown failed");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registry
    // ─────────────────────────────────────────────────────────────────────────

    fn register(&self, plugin: Arc<dyn Plugin<K>>) -> KernelResult<()> {
        let mut state = self.lock_checked()?;
        let key = plugin.key().clone();

        if let Err(e) = state.registry.check_admission(&key.domain) {
            warn!(kernel_id = %self.id, plugin = %key, error = %e, "Registration rejected");
            return Err(e);
        }

        let handle = PluginHandle::new(plugin);
        if self.running.load(Ordering::SeqCst) {
            self.bring_up(&handle)?;
        }

        state.registry.insert(handle)?;
        self.sync_count(&state);

        info!(kernel_id = %self.id, plugin = %key, "Plugin registered");
        Ok(())
    }

    /// Init and start a plugin registered while the kernel runs
    fn bring_up(&self, handle: &PluginHandle<K>) -> KernelResult<()> {
        let failure = |stage: LifecycleStage, source: PluginError| {
            warn!(plugin = %handle.key(), %stage, error = %source, "Plugin bring-up failed");
            KernelError::LifecycleFailure {
                plugin: handle.key().to_string(),
                stage,
                source,
            }
        };

        handle
            .plugin()
            .init(&self.context)
            .map_err(|e| failure(LifecycleStage::Init, e))?;
        handle
            .plugin()
            .start(&self.context)
            .map_err(|e| failure(LifecycleStage::Start, e))?;

        handle.set_status(PluginStatus::Running);
        Ok(())
    }

    fn unregister(&self, domain: &K) -> KernelResult<PluginKey<K>> {
        let mut state = self.lock_checked()?;
        let handle = state
            .registry
            .remove(domain)
            .ok_or_else(|| KernelError::not_found(domain))?;
        self.sync_count(&state);

        // Status alone decides: shutdown may be waiting for the loop with
        // `running` already cleared and this plugin not yet torn down.
        if handle.status().is_running() {
            self.teardown(&handle);
        }
        handle.set_status(PluginStatus::Stopped);

        info!(kernel_id = %self.id, plugin = %handle.key(), "Plugin unregistered");
        Ok(handle.key().clone())
    }

    fn status(&self, domain: &K) -> KernelResult<PluginStatus> {
        let state = self.lock_checked()?;
        state
            .registry
            .get(domain)
            .map(|h| h.status())
            .ok_or_else(|| KernelError::not_found(domain))
    }

    fn notify(&self, domain: &K, data: &PluginData) -> KernelResult<()> {
        let state = self.lock_checked()?;
        let handle = state
            .registry
            .get(domain)
            .ok_or_else(|| KernelError::not_found(domain))?;

        handle
            .plugin()
            .notify(&self.context, data)
            .map_err(|source| KernelError::MessageRejected {
                domain: format!("{:?}", domain),
                source,
            })
    }
}

/// Body of a queued cycle task
fn run_cycle<K: Domain>(ticket: CycleTicket<K>, ctx: PluginContext<K>) {
    // Stopped or unregistered since the scan that queued us.
    if !ticket.is_running() {
        trace!(plugin = %ticket.key, "Skipping cycle of stopped plugin");
        return;
    }
    if let Err(e) = ticket.plugin.cycle(&ctx) {
        debug!(plugin = %ticket.key, error = %e, "Plugin cycle failed");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Kernel Services
// ─────────────────────────────────────────────────────────────────────────────

impl<K: Domain> KernelServices<K> for KernelInner<K> {
    fn version(&self) -> &str {
        KERNEL_VERSION
    }

    fn plugin_count(&self) -> usize {
        self.plugin_count.load(Ordering::SeqCst)
    }

    fn lookup(&self, domain: &K) -> KernelResult<PluginKey<K>> {
        let state = self.lock_checked()?;
        state
            .registry
            .key_of(domain)
            .ok_or_else(|| KernelError::not_found(domain))
    }

    fn dispatch(
        &self,
        from: &PluginKey<K>,
        to: &K,
        request: PluginData,
    ) -> KernelResult<PluginData> {
        let state = self.lock_checked()?;
        let handle = state
            .registry
            .get(to)
            .ok_or_else(|| KernelError::not_found(to))?;

        let target = handle.key().clone();
        let request = Message {
            from: from.clone(),
            to: target.clone(),
            data: request,
        };
        let mut response = Message {
            from: target,
            to: from.clone(),
            data: PluginData::default(),
        };

        handle
            .plugin()
            .message(&self.context, &request, &mut response)
            .map_err(|source| KernelError::MessageRejected {
                domain: format!("{:?}", to),
                source,
            })?;

        trace!(
            from = %request.from,
            to = %request.to,
            request_len = request.data.len(),
            response_len = response.data.len(),
            "Message dispatched"
        );
        Ok(response.data)
    }

    fn open_stream(&self, stream: StreamEnd<K>) -> KernelResult<()> {
        let plugin = {
            let state = self.lock_checked()?;
            let target = stream.to().domain;
            let handle = state
                .registry
                .get(&target)
                .ok_or_else(|| KernelError::not_found(&target))?;
            stream.set_target(handle.key().clone());
            Arc::clone(handle.plugin())
        };

        let route = stream.route();
        debug!(from = %route.from, to = %route.to, "Routing stream");

        let ctx = self.context.clone();
        let task: Task = Box::new(move || {
            if let Err(e) = plugin.stream(&ctx, stream) {
                warn!(from = %route.from, to = %route.to, error = %e, "Stream handler failed");
            }
        });

        if self.pool.submit(task) {
            Ok(())
        } else {
            Err(KernelError::PoolUnavailable)
        }
    }

    fn log(&self, message: &str) {
        info!(target: "micro_kernel::plugin", kernel_id = %self.id, "{}", message);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Micro Kernel
// ─────────────────────────────────────────────────────────────────────────────

/// Plugin host keyed by domain `K`
///
/// Dropping the kernel shuts it down. The worker pool is shared and stays
/// with whoever else holds it.
pub struct MicroKernel<K: Domain> {
    inner: Arc<KernelInner<K>>,
}

impl<K: Domain> MicroKernel<K> {
    /// Create a kernel accepting up to `plugin_limit` plugins
    pub fn new(plugin_limit: usize, pool: Arc<dyn ThreadPool>) -> KernelResult<Self> {
        let config = KernelConfig::default().with_plugin_limit(plugin_limit);
        Self::with_config(&config, pool)
    }

    /// Create a kernel from configuration
    pub fn with_config(config: &KernelConfig, pool: Arc<dyn ThreadPool>) -> KernelResult<Self> {
        config.validate()?;
        if !pool.is_running() {
            return Err(KernelError::Construction(
                "worker pool is not running".to_string(),
            ));
        }

        let id = Uuid::new_v4();
        let inner = Arc::new_cyclic(|weak: &Weak<KernelInner<K>>| {
            let services: Weak<dyn KernelServices<K>> = weak.clone();
            KernelInner {
                id,
                plugin_limit: config.plugin_limit,
                cycle_interval: config.cycle_interval(),
                pool,
                state: Mutex::new(KernelState {
                    registry: Registry::new(config.plugin_limit),
                    loop_active: false,
                }),
                running: AtomicBool::new(false),
                pool_lost: AtomicBool::new(false),
                plugin_count: AtomicUsize::new(0),
                wakeup: Condvar::new(),
                loop_exited: Condvar::new(),
                context: PluginContext::new(services),
            }
        });

        info!(
            kernel_id = %id,
            plugin_limit = config.plugin_limit,
            cycle_interval_ms = config.cycle_interval_ms,
            workers = inner.pool.worker_count(),
            "Micro kernel created"
        );

        Ok(Self { inner })
    }

    /// Unique id of this kernel instance, as it appears in logs
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn version(&self) -> &str {
        KERNEL_VERSION
    }

    /// Bootstrap registered plugins and run the scheduling loop
    ///
    /// Blocks until [`shutdown`](Self::shutdown) is called from another
    /// thread. Returns immediately if the kernel is already running.
    pub fn run(&self) -> KernelResult<()> {
        self.inner.run()
    }

    /// Stop the scheduling loop and tear down running plugins
    ///
    /// Waits for the loop to return, then calls `stop` and `exit` on every
    /// running plugin. Plugins stay registered and are brought up again by
    /// the next [`run`](Self::run). A no-op if the kernel is not running.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Add a plugin
    ///
    /// If the kernel is running the plugin is initialized and started first
    /// and is only registered if both succeed.
    pub fn register(&self, plugin: Arc<dyn Plugin<K>>) -> KernelResult<()> {
        self.inner.register(plugin)
    }

    /// Remove the plugin owning `domain`, stopping it if it runs
    ///
    /// The entry is removed even if its `stop` or `exit` hook fails.
    pub fn unregister(&self, domain: &K) -> KernelResult<PluginKey<K>> {
        self.inner.unregister(domain)
    }

    pub fn lookup(&self, domain: &K) -> KernelResult<PluginKey<K>> {
        self.inner.lookup(domain)
    }

    pub fn status(&self, domain: &K) -> KernelResult<PluginStatus> {
        self.inner.status(domain)
    }

    /// Push a notification to the plugin owning `domain`
    pub fn notify(&self, domain: &K, data: &PluginData) -> KernelResult<()> {
        self.inner.notify(domain, data)
    }

    /// Send a request to a plugin on behalf of `from`
    pub fn dispatch(
        &self,
        from: &PluginKey<K>,
        to: &K,
        request: PluginData,
    ) -> KernelResult<PluginData> {
        self.inner.dispatch(from, to, request)
    }

    /// Route a stream end to its target plugin
    pub fn open_stream(&self, stream: StreamEnd<K>) -> KernelResult<()> {
        self.inner.open_stream(stream)
    }

    pub fn plugin_count(&self) -> usize {
        self.inner.plugin_count.load(Ordering::SeqCst)
    }

    pub fn plugin_limit(&self) -> usize {
        self.inner.plugin_limit
    }

    /// Context handed to plugins, usable by host code as well
    pub fn context(&self) -> PluginContext<K> {
        self.inner.context.clone()
    }
}

impl<K: Domain> Drop for MicroKernel<K> {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl<K: Domain> std::fmt::Debug for MicroKernel<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicroKernel")
            .field("id", &self.inner.id)
            .field("running", &self.is_running())
            .field("plugins", &self.plugin_count())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::{self, JoinHandle};

    use crate::error::RejectReason;
    use crate::pool::WorkerPool;
    use crate::test_support::{Gate, RecordingPlugin, wait_until};

    const WAIT: Duration = Duration::from_secs(5);

    fn pool() -> Arc<dyn ThreadPool> {
        Arc::new(WorkerPool::new(100, 4).unwrap())
    }

    /// Kernel whose scans are far apart, so each run performs exactly one
    fn slow_kernel(limit: usize) -> Arc<MicroKernel<u32>> {
        let config = KernelConfig::default()
            .with_plugin_limit(limit)
            .with_cycle_interval(Duration::from_secs(3600));
        Arc::new(MicroKernel::with_config(&config, pool()).unwrap())
    }

    fn fast_kernel(limit: usize) -> Arc<MicroKernel<u32>> {
        let config = KernelConfig::default()
            .with_plugin_limit(limit)
            .with_cycle_interval(Duration::from_millis(1));
        Arc::new(MicroKernel::with_config(&config, pool()).unwrap())
    }

    fn spawn_run(kernel: &Arc<MicroKernel<u32>>) -> JoinHandle<KernelResult<()>> {
        let runner = Arc::clone(kernel);
        let handle = thread::spawn(move || runner.run());
        assert!(wait_until(WAIT, || kernel.is_running()));
        handle
    }

    #[test]
    fn test_construction_requires_live_pool() {
        let pool = pool();
        pool.stop();
        let result = MicroKernel::<u32>::new(10, pool);
        assert!(matches!(result, Err(KernelError::Construction(_))));

        let result = MicroKernel::<u32>::new(0, self::pool());
        assert!(matches!(result, Err(KernelError::Construction(_))));
    }

    #[test]
    fn test_register_respects_limit() {
        let kernel = slow_kernel(200);
        for domain in 0..200 {
            kernel.register(RecordingPlugin::new(domain).shared()).unwrap();
        }
        assert_eq!(kernel.plugin_count(), 200);

        let err = kernel
            .register(RecordingPlugin::new(200).shared())
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::RegistrationRejected {
                reason: RejectReason::CapacityExceeded { limit: 200 },
                ..
            }
        ));
        assert_eq!(kernel.plugin_count(), 200);
    }

    #[test]
    fn test_duplicate_domain_rejected() {
        let kernel = slow_kernel(10);
        kernel.register(RecordingPlugin::new(1).shared()).unwrap();
        let err = kernel.register(RecordingPlugin::new(1).shared()).unwrap_err();
        assert!(matches!(
            err,
            KernelError::RegistrationRejected {
                reason: RejectReason::DuplicateDomain,
                ..
            }
        ));
        assert_eq!(kernel.plugin_count(), 1);
    }

    #[test]
    fn test_register_then_unregister_while_idle() {
        let kernel = slow_kernel(10);
        let plugin = RecordingPlugin::new(3);
        let hooks = plugin.hooks();

        kernel.register(plugin.shared()).unwrap();
        assert_eq!(kernel.status(&3).unwrap(), PluginStatus::Stopped);

        let key = kernel.unregister(&3).unwrap();
        assert_eq!(key.domain, 3);
        assert_eq!(kernel.plugin_count(), 0);
        // Never ran, so no lifecycle hooks fire.
        assert!(hooks.events().is_empty());

        assert!(matches!(
            kernel.unregister(&3),
            Err(KernelError::TargetNotFound { .. })
        ));
    }

    #[test]
    fn test_every_cycle_enabled_plugin_cycles_once_per_scan() {
        let kernel = slow_kernel(200);

        let sender = RecordingPlugin::named("basic", "1.0.0", 0).dispatching_to(5);
        let sender_hooks = sender.hooks();
        kernel.register(sender.shared()).unwrap();

        let mut hook_logs = Vec::new();
        for domain in 1..100 {
            let plugin = if domain == 5 {
                RecordingPlugin::named("alarm", "1.0.0", domain).with_reply("hihi basic")
            } else {
                RecordingPlugin::new(domain)
            };
            hook_logs.push((domain, plugin.hooks()));
            kernel.register(plugin.shared()).unwrap();
        }

        let quiet = RecordingPlugin::new(150).cycle_disabled();
        let quiet_hooks = quiet.hooks();
        kernel.register(quiet.shared()).unwrap();

        let runner = spawn_run(&kernel);
        assert!(wait_until(WAIT, || {
            sender_hooks.last_response().is_some()
                && hook_logs.iter().all(|(_, p)| p.count().cycle == 1)
        }));

        kernel.shutdown();
        runner.join().unwrap().unwrap();

        assert_eq!(sender_hooks.count().cycle, 1);
        for (domain, hooks) in &hook_logs {
            let counts = hooks.count();
            assert_eq!(counts.cycle, 1, "domain {} cycled {} times", domain, counts.cycle);
            assert_eq!((counts.init, counts.start, counts.stop, counts.exit), (1, 1, 1, 1));
        }
        assert_eq!(quiet_hooks.count().cycle, 0);
        assert_eq!(quiet_hooks.count().start, 1);

        let alarm = &hook_logs.iter().find(|(d, _)| *d == 5).unwrap().1;
        let request = alarm.last_request().unwrap();
        assert_eq!(request.from.domain, 0);
        assert_eq!(request.from.name, "basic");

        let response = sender_hooks.last_response().unwrap().unwrap();
        assert_eq!(response.as_str(), Some("hihi basic"));
    }

    #[test]
    fn test_failed_init_is_evicted_without_start() {
        let kernel = slow_kernel(10);
        let good = RecordingPlugin::new(1);
        let bad = RecordingPlugin::new(2).failing_init();
        let good_hooks = good.hooks();
        let bad_hooks = bad.hooks();
        kernel.register(good.shared()).unwrap();
        kernel.register(bad.shared()).unwrap();

        let runner = spawn_run(&kernel);
        assert!(wait_until(WAIT, || good_hooks.count().cycle >= 1));

        assert_eq!(bad_hooks.events(), vec!["init"]);
        assert!(matches!(
            kernel.lookup(&2),
            Err(KernelError::TargetNotFound { .. })
        ));
        assert_eq!(kernel.plugin_count(), 1);
        assert_eq!(kernel.status(&1).unwrap(), PluginStatus::Running);

        kernel.shutdown();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_failed_start_is_evicted_and_never_cycles() {
        let kernel = slow_kernel(10);
        let bad = RecordingPlugin::new(4).failing_start();
        let bad_hooks = bad.hooks();
        kernel.register(bad.shared()).unwrap();

        let runner = spawn_run(&kernel);
        assert_eq!(kernel.plugin_count(), 0);

        kernel.shutdown();
        runner.join().unwrap().unwrap();

        assert_eq!(bad_hooks.events(), vec!["init", "start"]);
    }

    #[test]
    fn test_run_is_idempotent() {
        let kernel = slow_kernel(10);
        let plugin = RecordingPlugin::new(1);
        let hooks = plugin.hooks();
        kernel.register(plugin.shared()).unwrap();

        let runner = spawn_run(&kernel);
        // A second run returns at once and does not bootstrap again.
        kernel.run().unwrap();
        assert_eq!(hooks.count().init, 1);

        kernel.shutdown();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_register_while_running_brings_plugin_up() {
        let kernel = fast_kernel(10);
        let runner = spawn_run(&kernel);

        let late = RecordingPlugin::new(7);
        let hooks = late.hooks();
        kernel.register(late.shared()).unwrap();
        assert_eq!(kernel.status(&7).unwrap(), PluginStatus::Running);
        assert!(wait_until(WAIT, || hooks.count().cycle >= 1));
        assert_eq!(&hooks.events()[..2], &["init", "start"]);

        let err = kernel
            .register(RecordingPlugin::new(8).failing_start().shared())
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::LifecycleFailure {
                stage: LifecycleStage::Start,
                ..
            }
        ));
        assert!(kernel.lookup(&8).is_err());

        kernel.shutdown();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_unregister_while_running_stops_plugin() {
        let kernel = fast_kernel(10);
        let plugin = RecordingPlugin::new(2);
        let hooks = plugin.hooks();
        kernel.register(plugin.shared()).unwrap();

        let runner = spawn_run(&kernel);
        assert!(wait_until(WAIT, || hooks.count().cycle >= 2));

        kernel.unregister(&2).unwrap();
        let counts = hooks.count();
        assert_eq!((counts.stop, counts.exit), (1, 1));

        // Cycles queued before removal are skipped once they run.
        thread::sleep(Duration::from_millis(20));
        let settled = hooks.count().cycle;
        thread::sleep(Duration::from_millis(50));
        assert_eq!(hooks.count().cycle, settled);

        kernel.shutdown();
        runner.join().unwrap().unwrap();
        assert_eq!(hooks.count().stop, 1);
    }

    #[test]
    fn test_unregister_during_shutdown_still_tears_down() {
        // One worker and a one-slot queue: a held cycle keeps the loop stuck
        // in submit, so shutdown sits waiting for it with the lock released.
        let pool = Arc::new(WorkerPool::new(1, 1).unwrap());
        let config = KernelConfig::default()
            .with_plugin_limit(10)
            .with_cycle_interval(Duration::from_secs(3600));
        let kernel = Arc::new(
            MicroKernel::with_config(&config, Arc::clone(&pool) as Arc<dyn ThreadPool>).unwrap(),
        );

        let gate = Gate::new();
        let held = RecordingPlugin::new(0).blocking_cycle_on(Arc::clone(&gate));
        let held_hooks = held.hooks();
        let removed = RecordingPlugin::new(1);
        let removed_hooks = removed.hooks();
        let last = RecordingPlugin::new(2);
        let last_hooks = last.hooks();
        for plugin in [held, removed, last] {
            kernel.register(plugin.shared()).unwrap();
        }

        let runner = spawn_run(&kernel);
        assert!(wait_until(WAIT, || held_hooks.count().cycle == 1 && pool.pending() == 1));
        thread::sleep(Duration::from_millis(20));

        let stopper = {
            let kernel = Arc::clone(&kernel);
            thread::spawn(move || kernel.shutdown())
        };
        assert!(wait_until(WAIT, || !kernel.is_running()));
        thread::sleep(Duration::from_millis(20));
        assert!(!stopper.is_finished());
        assert_eq!(removed_hooks.count().stop, 0);

        kernel.unregister(&1).unwrap();
        let counts = removed_hooks.count();
        assert_eq!((counts.stop, counts.exit), (1, 1));

        gate.open();
        stopper.join().unwrap();
        runner.join().unwrap().unwrap();

        let counts = removed_hooks.count();
        assert_eq!((counts.cycle, counts.stop, counts.exit), (0, 1, 1));
        for hooks in [&held_hooks, &last_hooks] {
            let counts = hooks.count();
            assert_eq!((counts.stop, counts.exit), (1, 1));
        }
        assert_eq!(kernel.plugin_count(), 2);
    }

    #[test]
    fn test_stopped_pool_warns_once_and_shutdown_completes() {
        let pool = Arc::new(WorkerPool::new(100, 2).unwrap());
        let config = KernelConfig::default()
            .with_plugin_limit(10)
            .with_cycle_interval(Duration::ZERO);
        let kernel = Arc::new(
            MicroKernel::with_config(&config, Arc::clone(&pool) as Arc<dyn ThreadPool>).unwrap(),
        );
        let plugin = RecordingPlugin::new(1);
        let hooks = plugin.hooks();
        kernel.register(plugin.shared()).unwrap();

        let runner = spawn_run(&kernel);
        assert!(wait_until(WAIT, || hooks.count().cycle >= 1));

        pool.stop();
        assert!(wait_until(WAIT, || kernel.inner.pool_lost.load(Ordering::SeqCst)));

        // No worker is left, so the count stays where the pool stopped it.
        let settled = hooks.count().cycle;
        thread::sleep(Duration::from_millis(60));
        assert_eq!(hooks.count().cycle, settled);
        assert_eq!(kernel.inner.schedule_cycles(), 0);

        kernel.shutdown();
        runner.join().unwrap().unwrap();
        let counts = hooks.count();
        assert_eq!((counts.stop, counts.exit), (1, 1));
    }

    #[test]
    fn test_shutdown_tears_down_and_stops_cycles() {
        let kernel = fast_kernel(10);
        let plugin = RecordingPlugin::new(1);
        let hooks = plugin.hooks();
        kernel.register(plugin.shared()).unwrap();

        let runner = spawn_run(&kernel);
        assert!(wait_until(WAIT, || hooks.count().cycle >= 3));

        kernel.shutdown();
        runner.join().unwrap().unwrap();
        assert!(!kernel.is_running());

        let counts = hooks.count();
        assert_eq!((counts.stop, counts.exit), (1, 1));
        assert_eq!(kernel.status(&1).unwrap(), PluginStatus::Stopped);

        thread::sleep(Duration::from_millis(20));
        let settled = hooks.count().cycle;
        thread::sleep(Duration::from_millis(50));
        assert_eq!(hooks.count().cycle, settled);

        let events = hooks.events();
        let stop_at = events.iter().position(|e| *e == "stop").unwrap();
        let exit_at = events.iter().position(|e| *e == "exit").unwrap();
        assert!(stop_at < exit_at);

        // Shutting down twice is harmless.
        kernel.shutdown();
        assert_eq!(hooks.count().stop, 1);
    }

    #[test]
    fn test_kernel_can_run_again_after_shutdown() {
        let kernel = slow_kernel(10);
        let plugin = RecordingPlugin::new(1);
        let hooks = plugin.hooks();
        kernel.register(plugin.shared()).unwrap();

        for round in 1..=2 {
            let runner = spawn_run(&kernel);
            assert!(wait_until(WAIT, || hooks.count().cycle == round));
            kernel.shutdown();
            runner.join().unwrap().unwrap();
        }

        let counts = hooks.count();
        assert_eq!((counts.init, counts.start, counts.stop, counts.exit), (2, 2, 2, 2));
    }

    #[test]
    fn test_lookup_from_lifecycle_hook_is_reentrant() {
        let kernel = slow_kernel(10);
        let plugin = RecordingPlugin::new(1).looking_up_in_init();
        let hooks = plugin.hooks();
        kernel.register(plugin.shared()).unwrap();

        let runner = spawn_run(&kernel);
        assert_eq!(hooks.init_lookup(), Some(Err("reentrant".to_string())));

        kernel.shutdown();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_plugin_count_readable_while_lock_is_held() {
        let kernel = slow_kernel(10);
        let ctx = kernel.context();
        kernel.register(RecordingPlugin::new(1).shared()).unwrap();

        let _state = kernel.inner.lock();
        assert_eq!(kernel.plugin_count(), 1);
        assert_eq!(ctx.plugin_count(), 1);
        assert!(matches!(ctx.lookup(&1), Err(KernelError::Reentrant)));
    }

    #[test]
    fn test_dropping_idle_kernel_runs_no_hooks() {
        let kernel = slow_kernel(10);
        let plugin = RecordingPlugin::new(1);
        let hooks = plugin.hooks();
        kernel.register(plugin.shared()).unwrap();

        drop(kernel);
        assert!(hooks.events().is_empty());
    }
}
