//! Plugin Streams
//!
//! A stream is a long-lived duplex channel between two plugins. The creating
//! plugin keeps one end and hands the other to the kernel, which routes it to
//! the target plugin on a worker thread. Both ends share one reference-counted
//! channel; neither end points back at the kernel.
//!
//! Payload traffic is not bounded: `send` never blocks. `recv` waits for data,
//! optionally with a timeout. Closing either end (or dropping it) closes the
//! stream for both sides; data already sent can still be received afterwards.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{Domain, PluginData, PluginKey};
use crate::error::StreamError;

/// Source and target of a stream
#[derive(Debug, Clone)]
pub struct StreamRoute<K> {
    pub from: PluginKey<K>,
    pub to: PluginKey<K>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Initiator,
    Acceptor,
}

#[derive(Default)]
struct Lanes {
    to_initiator: VecDeque<PluginData>,
    to_acceptor: VecDeque<PluginData>,
    closed: bool,
}

impl Lanes {
    fn inbox(&mut self, side: Side) -> &mut VecDeque<PluginData> {
        match side {
            Side::Initiator => &mut self.to_initiator,
            Side::Acceptor => &mut self.to_acceptor,
        }
    }

    fn outbox(&mut self, side: Side) -> &mut VecDeque<PluginData> {
        match side {
            Side::Initiator => &mut self.to_acceptor,
            Side::Acceptor => &mut self.to_initiator,
        }
    }
}

struct Channel<K> {
    route: Mutex<StreamRoute<K>>,
    lanes: Mutex<Lanes>,
    readable: Condvar,
}

/// One end of a plugin stream
pub struct StreamEnd<K> {
    channel: Arc<Channel<K>>,
    side: Side,
}

impl<K: Domain> StreamEnd<K> {
    /// Create a stream from `from` to the plugin owning domain `to`
    ///
    /// Returns `(initiator, acceptor)`. The initiator stays with the caller;
    /// the acceptor is passed to the kernel's `open_stream`. The target's name
    /// and version are filled in by the kernel when it routes the stream.
    pub fn pair(from: PluginKey<K>, to: K) -> (Self, Self) {
        let channel = Arc::new(Channel {
            route: Mutex::new(StreamRoute {
                from,
                to: PluginKey::for_domain(to),
            }),
            lanes: Mutex::new(Lanes::default()),
            readable: Condvar::new(),
        });

        (
            Self {
                channel: Arc::clone(&channel),
                side: Side::Initiator,
            },
            Self {
                channel,
                side: Side::Acceptor,
            },
        )
    }

    /// Current source and target of the stream
    pub fn route(&self) -> StreamRoute<K> {
        self.channel.route.lock().clone()
    }

    pub fn from(&self) -> PluginKey<K> {
        self.channel.route.lock().from.clone()
    }

    pub fn to(&self) -> PluginKey<K> {
        self.channel.route.lock().to.clone()
    }

    /// Replace the target key with its canonical registry entry
    pub(crate) fn set_target(&self, target: PluginKey<K>) {
        self.channel.route.lock().to = target;
    }

    /// Whether this end belongs to the plugin that opened the stream
    pub fn is_initiator(&self) -> bool {
        self.side == Side::Initiator
    }

    /// Queue data for the other end
    pub fn send(&self, data: PluginData) -> Result<(), StreamError> {
        {
            let mut lanes = self.channel.lanes.lock();
            if lanes.closed {
                return Err(StreamError::Closed);
            }
            lanes.outbox(self.side).push_back(data);
        }
        self.channel.readable.notify_all();
        Ok(())
    }

    /// Receive the next item sent by the other end
    ///
    /// `None` waits indefinitely. Returns [`StreamError::Closed`] once the
    /// stream is closed and nothing is left to read.
    pub fn recv(&self, timeout: Option<Duration>) -> Result<PluginData, StreamError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut lanes = self.channel.lanes.lock();

        loop {
            if let Some(data) = lanes.inbox(self.side).pop_front() {
                return Ok(data);
            }
            if lanes.closed {
                return Err(StreamError::Closed);
            }

            match deadline {
                None => self.channel.readable.wait(&mut lanes),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(StreamError::Timeout);
                    }
                    self.channel.readable.wait_until(&mut lanes, deadline);
                }
            }
        }
    }

    /// Close the stream for both ends
    pub fn close(&self) {
        {
            let mut lanes = self.channel.lanes.lock();
            if lanes.closed {
                return;
            }
            lanes.closed = true;
        }
        self.channel.readable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.channel.lanes.lock().closed
    }
}

impl<K> Drop for StreamEnd<K> {
    fn drop(&mut self) {
        let mut lanes = self.channel.lanes.lock();
        if !lanes.closed {
            lanes.closed = true;
            drop(lanes);
            self.channel.readable.notify_all();
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for StreamEnd<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let route = self.channel.route.lock();
        f.debug_struct("StreamEnd")
            .field("side", &self.side)
            .field("from", &route.from.domain)
            .field("to", &route.to.domain)
            .field("closed", &self.channel.lanes.lock().closed)
            .finish()
    }
}
