//! Message payloads
//!
//! The kernel passes payloads through untouched; `kind` and the byte layout
//! are agreed between the plugins that exchange them.

use bytes::Bytes;

use super::PluginKey;

/// Opaque, length-tagged payload exchanged between plugins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginData {
    /// Plugin-defined payload type
    pub kind: i32,
    /// Payload bytes
    pub payload: Bytes,
}

impl PluginData {
    pub fn new(kind: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Payload with kind 0
    pub fn from_bytes(payload: impl Into<Bytes>) -> Self {
        Self::new(0, payload)
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Payload as UTF-8 text, if it is valid
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// A request or response travelling between two plugins
///
/// Built by the kernel for every dispatch and dropped afterwards.
#[derive(Debug, Clone)]
pub struct Message<K> {
    pub from: PluginKey<K>,
    pub to: PluginKey<K>,
    pub data: PluginData,
}
