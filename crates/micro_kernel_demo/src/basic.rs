//! Basic plugin
//!
//! Every cycle it greets the first alarm plugin and pushes one chunk through a
//! stream it keeps open to that plugin.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use micro_kernel::{
    Message, Plugin, PluginContext, PluginData, PluginKey, PluginResult, StreamEnd, StreamError,
};

use crate::{ALARM_DOMAIN, BASIC_DOMAIN};

const GREETING: &[u8] = b"hello alarm";

pub struct BasicPlugin {
    key: PluginKey<u32>,
    stream: Mutex<Option<StreamEnd<u32>>>,
    stopped: AtomicBool,
    exchanges: AtomicU64,
    echoes: AtomicU64,
}

impl BasicPlugin {
    pub fn new() -> Self {
        Self {
            key: PluginKey::new("basic", "1.0.0", BASIC_DOMAIN),
            stream: Mutex::new(None),
            stopped: AtomicBool::new(false),
            exchanges: AtomicU64::new(0),
            echoes: AtomicU64::new(0),
        }
    }

    /// Completed request/response round trips
    pub fn exchanges(&self) -> u64 {
        self.exchanges.load(Ordering::Relaxed)
    }

    /// Chunks that came back over the stream
    pub fn echoes(&self) -> u64 {
        self.echoes.load(Ordering::Relaxed)
    }

    fn greet(&self, ctx: &PluginContext<u32>) -> PluginResult<()> {
        let request = PluginData::new(0, Bytes::from_static(GREETING));
        let reply = ctx.dispatch(&self.key, &ALARM_DOMAIN, request)?;
        self.exchanges.fetch_add(1, Ordering::Relaxed);
        debug!(reply = reply.as_str().unwrap_or("<binary>"), "message back");
        Ok(())
    }

    /// Push one chunk down the stream and collect whatever came back
    ///
    /// The stream slot is never held across a kernel call: `stop` runs under
    /// the kernel lock and takes the slot too.
    fn pump(&self, ctx: &PluginContext<u32>) -> PluginResult<()> {
        let current = self.stream.lock().take();
        let stream = match current {
            Some(stream) => stream,
            None => {
                let (local, remote) = StreamEnd::pair(self.key.clone(), ALARM_DOMAIN);
                ctx.open_stream(remote)?;
                info!(to = %local.to(), "Stream opened");
                local
            }
        };

        let seq = self.exchanges();
        stream.send(PluginData::new(1, format!("chunk-{}", seq)))?;

        loop {
            match stream.recv(Some(Duration::ZERO)) {
                Ok(data) => {
                    self.echoes.fetch_add(1, Ordering::Relaxed);
                    debug!(echo = data.as_str().unwrap_or("<binary>"), "stream echo");
                }
                Err(StreamError::Timeout) => break,
                // The alarm side went away; reopen next cycle.
                Err(StreamError::Closed) => return Ok(()),
            }
        }

        let mut slot = self.stream.lock();
        if self.stopped.load(Ordering::SeqCst) {
            stream.close();
        } else {
            *slot = Some(stream);
        }
        Ok(())
    }
}

impl Default for BasicPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin<u32> for BasicPlugin {
    fn key(&self) -> &PluginKey<u32> {
        &self.key
    }

    fn init(&self, _ctx: &PluginContext<u32>) -> PluginResult<()> {
        debug!(plugin = %self.key, "basic init");
        Ok(())
    }

    fn start(&self, _ctx: &PluginContext<u32>) -> PluginResult<()> {
        self.stopped.store(false, Ordering::SeqCst);
        debug!(plugin = %self.key, "basic start");
        Ok(())
    }

    fn cycle(&self, ctx: &PluginContext<u32>) -> PluginResult<()> {
        self.greet(ctx)?;
        self.pump(ctx)
    }

    fn stop(&self, _ctx: &PluginContext<u32>) -> PluginResult<()> {
        {
            let mut slot = self.stream.lock();
            self.stopped.store(true, Ordering::SeqCst);
            if let Some(stream) = slot.take() {
                stream.close();
            }
        }
        info!(
            plugin = %self.key,
            exchanges = self.exchanges(),
            echoes = self.echoes(),
            "basic stop"
        );
        Ok(())
    }

    fn exit(&self, _ctx: &PluginContext<u32>) -> PluginResult<()> {
        debug!(plugin = %self.key, "basic exit");
        Ok(())
    }

    fn notify(&self, _ctx: &PluginContext<u32>, data: &PluginData) -> PluginResult<()> {
        info!(plugin = %self.key, kind = data.kind, "basic notice");
        Ok(())
    }

    fn message(
        &self,
        _ctx: &PluginContext<u32>,
        request: &Message<u32>,
        _response: &mut Message<u32>,
    ) -> PluginResult<()> {
        debug!(from = %request.from, "basic message");
        Ok(())
    }
}
