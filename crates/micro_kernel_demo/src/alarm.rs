//! Alarm plugin
//!
//! Answers every request with "hihi basic" and echoes stream traffic back to
//! the sender from a dedicated thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use micro_kernel::{
    Message, Plugin, PluginContext, PluginData, PluginError, PluginKey, PluginResult, StreamEnd,
    StreamError,
};

/// Reply sent for every message
pub const ALARM_REPLY: &str = "hihi basic";

/// How often an echo thread checks whether the plugin is stopping
const ECHO_POLL: Duration = Duration::from_millis(100);

pub struct AlarmPlugin {
    key: PluginKey<u32>,
    cycles: AtomicU64,
    stopping: Arc<AtomicBool>,
    echo_threads: Mutex<Vec<JoinHandle<u64>>>,
}

impl AlarmPlugin {
    pub fn new(domain: u32) -> Self {
        Self {
            key: PluginKey::new("alarm", "1.0.0", domain),
            cycles: AtomicU64::new(0),
            stopping: Arc::new(AtomicBool::new(false)),
            echo_threads: Mutex::new(Vec::new()),
        }
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }
}

/// Echo until the stream closes or the plugin stops; returns the chunk count
fn echo(stream: StreamEnd<u32>, stopping: Arc<AtomicBool>) -> u64 {
    let mut echoed = 0;
    loop {
        match stream.recv(Some(ECHO_POLL)) {
            Ok(data) => {
                if stream.send(data).is_err() {
                    break;
                }
                echoed += 1;
            }
            Err(StreamError::Timeout) if !stopping.load(Ordering::SeqCst) => {}
            Err(_) => break,
        }
    }
    stream.close();
    echoed
}

impl Plugin<u32> for AlarmPlugin {
    fn key(&self) -> &PluginKey<u32> {
        &self.key
    }

    fn init(&self, _ctx: &PluginContext<u32>) -> PluginResult<()> {
        debug!(plugin = %self.key, "alarm init");
        Ok(())
    }

    fn start(&self, _ctx: &PluginContext<u32>) -> PluginResult<()> {
        self.stopping.store(false, Ordering::SeqCst);
        debug!(plugin = %self.key, "alarm start");
        Ok(())
    }

    fn cycle(&self, _ctx: &PluginContext<u32>) -> PluginResult<()> {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        debug!(domain = self.key.domain, "alarm invoked");
        Ok(())
    }

    fn stop(&self, _ctx: &PluginContext<u32>) -> PluginResult<()> {
        self.stopping.store(true, Ordering::SeqCst);
        debug!(plugin = %self.key, cycles = self.cycles(), "alarm stop");
        Ok(())
    }

    fn exit(&self, _ctx: &PluginContext<u32>) -> PluginResult<()> {
        let threads = std::mem::take(&mut *self.echo_threads.lock());
        for handle in threads {
            match handle.join() {
                Ok(echoed) => info!(plugin = %self.key, echoed, "Stream session finished"),
                Err(_) => warn!(plugin = %self.key, "Echo thread panicked"),
            }
        }
        Ok(())
    }

    fn notify(&self, _ctx: &PluginContext<u32>, data: &PluginData) -> PluginResult<()> {
        info!(plugin = %self.key, kind = data.kind, len = data.len(), "alarm notice");
        Ok(())
    }

    fn message(
        &self,
        _ctx: &PluginContext<u32>,
        request: &Message<u32>,
        response: &mut Message<u32>,
    ) -> PluginResult<()> {
        debug!(
            from = %request.from,
            msg = request.data.as_str().unwrap_or("<binary>"),
            "alarm message"
        );
        response.data = PluginData::new(request.data.kind, ALARM_REPLY);
        Ok(())
    }

    fn stream(&self, _ctx: &PluginContext<u32>, stream: StreamEnd<u32>) -> PluginResult<()> {
        let route = stream.route();
        info!(from = %route.from, to = %route.to, "alarm accepted stream");

        let stopping = Arc::clone(&self.stopping);
        let handle = thread::Builder::new()
            .name(format!("alarm-{}-echo", self.key.domain))
            .spawn(move || echo(stream, stopping))
            .map_err(|e| PluginError::failed(format!("failed to spawn echo thread: {}", e)))?;

        self.echo_threads.lock().push(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic_key() -> PluginKey<u32> {
        PluginKey::new("basic", "1.0.0", 0)
    }

    #[test]
    fn test_message_replies_with_greeting() {
        let alarm = AlarmPlugin::new(1);
        let ctx = PluginContext::detached();
        let request = Message {
            from: basic_key(),
            to: alarm.key().clone(),
            data: PluginData::new(2, "hello alarm"),
        };
        let mut response = Message {
            from: alarm.key().clone(),
            to: basic_key(),
            data: PluginData::default(),
        };

        alarm.message(&ctx, &request, &mut response).unwrap();
        assert_eq!(response.data.as_str(), Some(ALARM_REPLY));
        assert_eq!(response.data.len(), ALARM_REPLY.len());
        assert_eq!(response.data.kind, 2);
    }

    #[test]
    fn test_stream_echo_until_closed() {
        let alarm = AlarmPlugin::new(1);
        let ctx = PluginContext::detached();
        let (local, remote) = StreamEnd::pair(basic_key(), 1);

        alarm.stream(&ctx, remote).unwrap();
        for chunk in ["one", "two"] {
            local.send(PluginData::from_bytes(chunk)).unwrap();
            let back = local.recv(Some(Duration::from_secs(5))).unwrap();
            assert_eq!(back.as_str(), Some(chunk));
        }

        local.close();
        alarm.exit(&ctx).unwrap();
        assert!(alarm.echo_threads.lock().is_empty());
    }

    #[test]
    fn test_stop_ends_idle_echo_thread() {
        let alarm = AlarmPlugin::new(3);
        let ctx = PluginContext::detached();
        let (local, remote) = StreamEnd::pair(basic_key(), 3);

        alarm.start(&ctx).unwrap();
        alarm.stream(&ctx, remote).unwrap();
        alarm.stop(&ctx).unwrap();
        alarm.exit(&ctx).unwrap();

        assert!(local.is_closed());
    }
}
