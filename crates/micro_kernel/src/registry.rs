//! Plugin Registry
//!
//! Domain-keyed table of plugin handles. The registry itself is not
//! synchronized: the kernel keeps it behind its one registry lock, so
//! registration, scheduling scans and dispatch see one consistent table.

use std::collections::BTreeMap;

use crate::error::{KernelError, KernelResult, RejectReason};
use crate::plugin::{Domain, PluginHandle, PluginKey, PluginStatus};

/// Table of registered plugins, at most one per domain
pub struct Registry<K> {
    plugins: BTreeMap<K, PluginHandle<K>>,
    limit: usize,
}

impl<K: Domain> Registry<K> {
    /// Create an empty registry accepting up to `limit` plugins
    pub fn new(limit: usize) -> Self {
        Self {
            plugins: BTreeMap::new(),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Check whether a plugin for `domain` could be inserted right now
    pub fn check_admission(&self, domain: &K) -> KernelResult<()> {
        if self.plugins.len() >= self.limit {
            return Err(KernelError::rejected(
                domain,
                RejectReason::CapacityExceeded { limit: self.limit },
            ));
        }
        if self.plugins.contains_key(domain) {
            return Err(KernelError::rejected(domain, RejectReason::DuplicateDomain));
        }
        Ok(())
    }

    /// Insert a handle after checking capacity and uniqueness
    pub fn insert(&mut self, handle: PluginHandle<K>) -> KernelResult<()> {
        let domain = handle.key().domain.clone();
        self.check_admission(&domain)?;
        self.plugins.insert(domain, handle);
        Ok(())
    }

    pub fn remove(&mut self, domain: &K) -> Option<PluginHandle<K>> {
        self.plugins.remove(domain)
    }

    pub fn get(&self, domain: &K) -> Option<&PluginHandle<K>> {
        self.plugins.get(domain)
    }

    pub fn contains(&self, domain: &K) -> bool {
        self.plugins.contains_key(domain)
    }

    /// Canonical key (with name and version) registered for `domain`
    pub fn key_of(&self, domain: &K) -> Option<PluginKey<K>> {
        self.plugins.get(domain).map(|h| h.key().clone())
    }

    /// Handles in domain order
    pub fn iter(&self) -> impl Iterator<Item = &PluginHandle<K>> {
        self.plugins.values()
    }

    /// Remove every plugin marked `Bad`, returning their keys
    pub fn evict_bad(&mut self) -> Vec<PluginKey<K>> {
        let bad: Vec<K> = self
            .plugins
            .iter()
            .filter(|(_, h)| h.status() == PluginStatus::Bad)
            .map(|(domain, _)| domain.clone())
            .collect();

        bad.iter()
            .filter_map(|domain| self.plugins.remove(domain))
            .map(|h| h.key().clone())
            .collect()
    }
}

impl<K: std::fmt::Debug> std::fmt::Debug for Registry<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .field("limit", &self.limit)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
