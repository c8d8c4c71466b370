//! Test helpers shared by the in-module test suites

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::error::{KernelError, PluginError, PluginResult, StreamError};
use crate::kernel::PluginContext;
use crate::plugin::{Message, Plugin, PluginData, PluginKey, StreamEnd};

/// Poll `cond` every few milliseconds until it holds or `timeout` expires
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// One-shot latch a test opens to release blocked hooks
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }

    /// Block until opened; gives up after `timeout`
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut open = self.open.lock();
        while !*open {
            if self.opened.wait_until(&mut open, deadline).timed_out() {
                break;
            }
        }
        *open
    }
}

/// Snapshot of how often each hook ran
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub init: usize,
    pub start: usize,
    pub cycle: usize,
    pub stop: usize,
    pub exit: usize,
    pub message: usize,
    pub notify: usize,
    pub stream: usize,
}

/// Observations recorded by a [`RecordingPlugin`], shared with the test
#[derive(Default)]
pub struct HookLog {
    init: AtomicUsize,
    start: AtomicUsize,
    cycle: AtomicUsize,
    stop: AtomicUsize,
    exit: AtomicUsize,
    message: AtomicUsize,
    notify: AtomicUsize,
    stream: AtomicUsize,
    streams_finished: AtomicUsize,
    events: Mutex<Vec<&'static str>>,
    last_request: Mutex<Option<Message<u32>>>,
    last_response: Mutex<Option<Result<PluginData, String>>>,
    init_lookup: Mutex<Option<Result<PluginKey<u32>, String>>>,
}

impl HookLog {
    fn hit(&self, counter: &AtomicUsize, event: &'static str) {
        counter.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(event);
    }

    pub fn count(&self) -> Counts {
        Counts {
            init: self.init.load(Ordering::SeqCst),
            start: self.start.load(Ordering::SeqCst),
            cycle: self.cycle.load(Ordering::SeqCst),
            stop: self.stop.load(Ordering::SeqCst),
            exit: self.exit.load(Ordering::SeqCst),
            message: self.message.load(Ordering::SeqCst),
            notify: self.notify.load(Ordering::SeqCst),
            stream: self.stream.load(Ordering::SeqCst),
        }
    }

    pub fn streams_finished(&self) -> usize {
        self.streams_finished.load(Ordering::SeqCst)
    }

    /// Hook names in the order they ran
    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }

    pub fn last_request(&self) -> Option<Message<u32>> {
        self.last_request.lock().clone()
    }

    /// Outcome of the dispatch performed by the last cycle
    pub fn last_response(&self) -> Option<Result<PluginData, String>> {
        self.last_response.lock().clone()
    }

    /// Outcome of the lookup attempted from `init`
    pub fn init_lookup(&self) -> Option<Result<PluginKey<u32>, String>> {
        self.init_lookup.lock().clone()
    }
}

/// Configurable plugin that records every hook invocation
pub struct RecordingPlugin {
    key: PluginKey<u32>,
    hooks: Arc<HookLog>,
    fail_init: bool,
    fail_start: bool,
    fail_message: bool,
    cycle_enabled: bool,
    lookup_in_init: bool,
    echo_streams: bool,
    reply: Option<Bytes>,
    dispatch_on_cycle: Option<u32>,
    cycle_gate: Option<Arc<Gate>>,
}

impl RecordingPlugin {
    pub fn new(domain: u32) -> Self {
        Self::named("recorder", "1.0.0", domain)
    }

    pub fn named(name: &str, version: &str, domain: u32) -> Self {
        Self {
            key: PluginKey::new(name, version, domain),
            hooks: Arc::new(HookLog::default()),
            fail_init: false,
            fail_start: false,
            fail_message: false,
            cycle_enabled: true,
            lookup_in_init: false,
            echo_streams: false,
            reply: None,
            dispatch_on_cycle: None,
            cycle_gate: None,
        }
    }

    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn failing_message(mut self) -> Self {
        self.fail_message = true;
        self
    }

    pub fn cycle_disabled(mut self) -> Self {
        self.cycle_enabled = false;
        self
    }

    /// Call `lookup` on the context from inside `init`
    pub fn looking_up_in_init(mut self) -> Self {
        self.lookup_in_init = true;
        self
    }

    /// Echo every item received on a stream until it closes
    pub fn echoing_streams(mut self) -> Self {
        self.echo_streams = true;
        self
    }

    /// Answer every message with `reply`
    pub fn with_reply(mut self, reply: &'static str) -> Self {
        self.reply = Some(Bytes::from_static(reply.as_bytes()));
        self
    }

    /// Dispatch a request to `target` on every cycle
    pub fn dispatching_to(mut self, target: u32) -> Self {
        self.dispatch_on_cycle = Some(target);
        self
    }

    /// Hold every cycle until `gate` opens
    pub fn blocking_cycle_on(mut self, gate: Arc<Gate>) -> Self {
        self.cycle_gate = Some(gate);
        self
    }

    pub fn hooks(&self) -> Arc<HookLog> {
        Arc::clone(&self.hooks)
    }

    pub fn shared(self) -> Arc<dyn Plugin<u32>> {
        Arc::new(self)
    }
}

impl Plugin<u32> for RecordingPlugin {
    fn key(&self) -> &PluginKey<u32> {
        &self.key
    }

    fn init(&self, ctx: &PluginContext<u32>) -> PluginResult<()> {
        self.hooks.hit(&self.hooks.init, "init");
        if self.lookup_in_init {
            let outcome = ctx.lookup(&self.key.domain).map_err(|e| match e {
                KernelError::Reentrant => "reentrant".to_string(),
                other => other.to_string(),
            });
            *self.hooks.init_lookup.lock() = Some(outcome);
        }
        if self.fail_init {
            return Err(PluginError::failed("init refused"));
        }
        Ok(())
    }

    fn start(&self, _ctx: &PluginContext<u32>) -> PluginResult<()> {
        self.hooks.hit(&self.hooks.start, "start");
        if self.fail_start {
            return Err(PluginError::failed("start refused"));
        }
        Ok(())
    }

    fn cycle(&self, ctx: &PluginContext<u32>) -> PluginResult<()> {
        self.hooks.hit(&self.hooks.cycle, "cycle");
        if let Some(gate) = &self.cycle_gate {
            gate.wait(Duration::from_secs(10));
        }
        if let Some(target) = self.dispatch_on_cycle {
            let outcome = ctx
                .dispatch(&self.key, &target, PluginData::new(1, "hello"))
                .map_err(|e| e.to_string());
            *self.hooks.last_response.lock() = Some(outcome);
        }
        Ok(())
    }

    fn cycle_enabled(&self) -> bool {
        self.cycle_enabled
    }

    fn stop(&self, _ctx: &PluginContext<u32>) -> PluginResult<()> {
        self.hooks.hit(&self.hooks.stop, "stop");
        Ok(())
    }

    fn exit(&self, _ctx: &PluginContext<u32>) -> PluginResult<()> {
        self.hooks.hit(&self.hooks.exit, "exit");
        Ok(())
    }

    fn notify(&self, _ctx: &PluginContext<u32>, _data: &PluginData) -> PluginResult<()> {
        self.hooks.hit(&self.hooks.notify, "notify");
        Ok(())
    }

    fn message(
        &self,
        _ctx: &PluginContext<u32>,
        request: &Message<u32>,
        response: &mut Message<u32>,
    ) -> PluginResult<()> {
        self.hooks.hit(&self.hooks.message, "message");
        *self.hooks.last_request.lock() = Some(request.clone());
        if self.fail_message {
            return Err(PluginError::failed("message refused"));
        }
        if let Some(reply) = &self.reply {
            response.data = PluginData::new(request.data.kind, reply.clone());
        }
        Ok(())
    }

    fn stream(&self, _ctx: &PluginContext<u32>, stream: StreamEnd<u32>) -> PluginResult<()> {
        self.hooks.hit(&self.hooks.stream, "stream");
        if self.echo_streams {
            loop {
                match stream.recv(Some(Duration::from_secs(5))) {
                    Ok(data) => stream.send(data)?,
                    Err(StreamError::Closed) => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        self.hooks.streams_finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
