//! Kernel Configuration
//!
//! Settings for the kernel and its worker pool, loadable from TOML:
//!
//! ```toml
//! [kernel]
//! plugin_limit = 200
//! cycle_interval_ms = 10
//!
//! [pool]
//! worker_threads = 4
//! task_queue_capacity = 100
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

/// Default number of plugins a kernel accepts
pub const DEFAULT_PLUGIN_LIMIT: usize = 200;

/// Default capacity of the worker pool task queue
pub const DEFAULT_TASK_QUEUE_CAPACITY: usize = 100;

/// Default pause between two scheduling scans
pub const DEFAULT_CYCLE_INTERVAL_MS: u64 = 10;

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicroKernelConfig {
    #[serde(default)]
    pub kernel: KernelConfig,

    #[serde(default)]
    pub pool: PoolConfig,
}

impl MicroKernelConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> KernelResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file from disk
    pub fn load(path: impl AsRef<Path>) -> KernelResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "Loaded kernel configuration");
        Self::from_toml_str(&content)
    }

    /// Check both sections for values the kernel cannot run with
    pub fn validate(&self) -> KernelResult<()> {
        self.kernel.validate()?;
        self.pool.validate()
    }
}

/// Scheduling and registry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Maximum number of registered plugins
    #[serde(default = "default_plugin_limit")]
    pub plugin_limit: usize,

    /// Pause between scheduling scans in milliseconds (0 = scan back to back)
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,
}

fn default_plugin_limit() -> usize {
    DEFAULT_PLUGIN_LIMIT
}

fn default_cycle_interval_ms() -> u64 {
    DEFAULT_CYCLE_INTERVAL_MS
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            plugin_limit: DEFAULT_PLUGIN_LIMIT,
            cycle_interval_ms: DEFAULT_CYCLE_INTERVAL_MS,
        }
    }
}

impl KernelConfig {
    /// Set the plugin limit
    pub fn with_plugin_limit(mut self, limit: usize) -> Self {
        self.plugin_limit = limit;
        self
    }

    /// Set the pause between scheduling scans
    pub fn with_cycle_interval(mut self, interval: Duration) -> Self {
        self.cycle_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Pause between scheduling scans
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn validate(&self) -> KernelResult<()> {
        if self.plugin_limit == 0 {
            return Err(KernelError::Construction(
                "plugin_limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Worker pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker threads (defaults to the host's hardware concurrency)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_threads: Option<usize>,

    /// Capacity of the task queue
    #[serde(default = "default_task_queue_capacity")]
    pub task_queue_capacity: usize,
}

fn default_task_queue_capacity() -> usize {
    DEFAULT_TASK_QUEUE_CAPACITY
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            task_queue_capacity: DEFAULT_TASK_QUEUE_CAPACITY,
        }
    }
}

impl PoolConfig {
    /// Set the number of worker threads
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    /// Set the task queue capacity
    pub fn with_task_queue_capacity(mut self, capacity: usize) -> Self {
        self.task_queue_capacity = capacity;
        self
    }

    /// Worker count after applying the hardware-concurrency default
    pub fn resolved_worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn validate(&self) -> KernelResult<()> {
        if self.task_queue_capacity == 0 {
            return Err(KernelError::Construction(
                "task_queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.worker_threads == Some(0) {
            return Err(KernelError::Construction(
                "worker_threads must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = MicroKernelConfig::from_toml_str("").unwrap();
        assert_eq!(config.kernel.plugin_limit, DEFAULT_PLUGIN_LIMIT);
        assert_eq!(config.kernel.cycle_interval(), Duration::from_millis(10));
        assert_eq!(config.pool.task_queue_capacity, DEFAULT_TASK_QUEUE_CAPACITY);
        assert!(config.pool.worker_threads.is_none());
        assert!(config.pool.resolved_worker_threads() >= 1);
    }

    #[test]
    fn test_parse_full_config() {
        let config = MicroKernelConfig::from_toml_str(
            r#"
            [kernel]
            plugin_limit = 8
            cycle_interval_ms = 0

            [pool]
            worker_threads = 3
            task_queue_capacity = 16
            "#,
        )
        .unwrap();

        assert_eq!(config.kernel.plugin_limit, 8);
        assert_eq!(config.kernel.cycle_interval(), Duration::ZERO);
        assert_eq!(config.pool.resolved_worker_threads(), 3);
        assert_eq!(config.pool.task_queue_capacity, 16);
    }

    #[test]
    fn test_zero_values_are_rejected() {
        let result = MicroKernelConfig::from_toml_str("[pool]\ntask_queue_capacity = 0\n");
        assert!(matches!(result, Err(KernelError::Construction(_))));

        let result = MicroKernelConfig::from_toml_str("[pool]\nworker_threads = 0\n");
        assert!(matches!(result, Err(KernelError::Construction(_))));

        let result = MicroKernelConfig::from_toml_str("[kernel]\nplugin_limit = 0\n");
        assert!(matches!(result, Err(KernelError::Construction(_))));
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let result = MicroKernelConfig::from_toml_str("[kernel\nplugin_limit = 1");
        assert!(matches!(result, Err(KernelError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[kernel]\nplugin_limit = 42").unwrap();

        let config = MicroKernelConfig::load(file.path()).unwrap();
        assert_eq!(config.kernel.plugin_limit, 42);
        assert_eq!(config.pool, PoolConfig::default());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = MicroKernelConfig::load("/nonexistent/micro_kernel.toml");
        assert!(matches!(result, Err(KernelError::Io(_))));
    }
}
