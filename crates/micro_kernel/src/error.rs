//! Kernel and plugin errors

use std::fmt;

// ─────────────────────────────────────────────────────────────────────────────
// Kernel Error
// ─────────────────────────────────────────────────────────────────────────────

/// Why a registration was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The registry already holds `limit` plugins
    CapacityExceeded { limit: usize },
    /// Another plugin is registered under the same domain
    DuplicateDomain,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::CapacityExceeded { limit } => {
                write!(f, "plugin limit of {} reached", limit)
            }
            RejectReason::DuplicateDomain => write!(f, "domain already registered"),
        }
    }
}

/// Lifecycle hook that produced a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStage {
    Init,
    Start,
    Stop,
    Exit,
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleStage::Init => write!(f, "init"),
            LifecycleStage::Start => write!(f, "start"),
            LifecycleStage::Stop => write!(f, "stop"),
            LifecycleStage::Exit => write!(f, "exit"),
        }
    }
}

/// Errors returned by kernel operations
///
/// Domains are carried pre-formatted so the error type does not depend on the
/// caller's domain type.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("Registration of domain {domain} rejected: {reason}")]
    RegistrationRejected { domain: String, reason: RejectReason },

    #[error("Plugin {plugin} failed during {stage}: {source}")]
    LifecycleFailure {
        plugin: String,
        stage: LifecycleStage,
        #[source]
        source: PluginError,
    },

    #[error("No plugin registered for domain {domain}")]
    TargetNotFound { domain: String },

    #[error("Plugin for domain {domain} rejected the message: {source}")]
    MessageRejected {
        domain: String,
        #[source]
        source: PluginError,
    },

    #[error("Kernel construction failed: {0}")]
    Construction(String),

    #[error("Kernel service called while the registry lock is held by this thread")]
    Reentrant,

    #[error("Kernel is no longer alive")]
    KernelGone,

    #[error("Worker pool is not accepting tasks")]
    PoolUnavailable,

    #[error("Failed to parse configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KernelError {
    pub(crate) fn not_found(domain: &impl fmt::Debug) -> Self {
        KernelError::TargetNotFound {
            domain: format!("{:?}", domain),
        }
    }

    pub(crate) fn rejected(domain: &impl fmt::Debug, reason: RejectReason) -> Self {
        KernelError::RegistrationRejected {
            domain: format!("{:?}", domain),
            reason,
        }
    }
}

/// Result type for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors returned by plugin hooks
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("{0}")]
    Failed(String),

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Kernel error: {0}")]
    Kernel(#[from] Box<KernelError>),
}

impl PluginError {
    /// Create a generic failure from any message
    pub fn failed(msg: impl Into<String>) -> Self {
        PluginError::Failed(msg.into())
    }
}

impl From<KernelError> for PluginError {
    fn from(err: KernelError) -> Self {
        PluginError::Kernel(Box::new(err))
    }
}

/// Result type for plugin hooks
pub type PluginResult<T> = Result<T, PluginError>;

// ─────────────────────────────────────────────────────────────────────────────
// Stream Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors returned by stream endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("Stream closed")]
    Closed,

    #[error("Stream operation timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = KernelError::rejected(&7u32, RejectReason::CapacityExceeded { limit: 3 });
        assert_eq!(
            err.to_string(),
            "Registration of domain 7 rejected: plugin limit of 3 reached"
        );

        let err = KernelError::LifecycleFailure {
            plugin: "alarm@1.0.0[1]".to_string(),
            stage: LifecycleStage::Start,
            source: PluginError::failed("port busy"),
        };
        assert_eq!(
            err.to_string(),
            "Plugin alarm@1.0.0[1] failed during start: port busy"
        );
    }

    #[test]
    fn test_kernel_error_converts_into_plugin_error() {
        let err: PluginError = KernelError::Reentrant.into();
        assert!(matches!(err, PluginError::Kernel(inner) if matches!(*inner, KernelError::Reentrant)));
    }
}
