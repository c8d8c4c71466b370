//! Plugin identity

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Types usable as a plugin domain
///
/// A domain is the caller-defined identity of a plugin: an enum, an integer id,
/// a string. Anything ordered, cloneable and shareable across threads works.
pub trait Domain: Ord + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Domain for T where T: Ord + Clone + fmt::Debug + Send + Sync + 'static {}

/// Identity of a plugin instance
///
/// Equality, ordering and hashing look at `domain` only; `name` and `version`
/// are descriptive metadata filled in by the plugin author.
#[derive(Debug, Clone)]
pub struct PluginKey<K> {
    pub name: String,
    pub version: String,
    pub domain: K,
}

impl<K: Domain> PluginKey<K> {
    pub fn new(name: impl Into<String>, version: impl Into<String>, domain: K) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            domain,
        }
    }

    /// Key carrying only a domain, as used when addressing a plugin whose
    /// name and version are not known yet
    pub fn for_domain(domain: K) -> Self {
        Self {
            name: String::new(),
            version: String::new(),
            domain,
        }
    }

    /// Copy of this key for another domain, keeping name and version
    pub fn with_domain(&self, domain: K) -> Self {
        Self {
            name: self.name.clone(),
            version: self.version.clone(),
            domain,
        }
    }
}

impl<K: PartialEq> PartialEq for PluginKey<K> {
    fn eq(&self, other: &Self) -> bool {
        self.domain == other.domain
    }
}

impl<K: Eq> Eq for PluginKey<K> {}

impl<K: PartialOrd> PartialOrd for PluginKey<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.domain.partial_cmp(&other.domain)
    }
}

impl<K: Ord> Ord for PluginKey<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.domain.cmp(&other.domain)
    }
}

impl<K: Hash> Hash for PluginKey<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.domain.hash(state);
    }
}

impl<K: fmt::Debug> fmt::Display for PluginKey<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}[{:?}]", self.name, self.version, self.domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_identity_is_domain_only() {
        let a = PluginKey::new("alarm", "1.0.0", 3u32);
        let b = PluginKey::new("other", "2.1.0", 3u32);
        let c = PluginKey::new("alarm", "1.0.0", 4u32);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a < c);

        let set: BTreeSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_display_and_builders() {
        let key = PluginKey::new("basic", "1.0.0", 0u32);
        assert_eq!(key.to_string(), "basic@1.0.0[0]");

        let moved = key.with_domain(9);
        assert_eq!(moved.name, "basic");
        assert_eq!(moved.domain, 9);

        let bare = PluginKey::for_domain(9u32);
        assert!(bare.name.is_empty());
        assert_eq!(bare, moved);
    }
}
