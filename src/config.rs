//! Simulated device configuration
//!
//! Loaded from TOML; every field has a default so a partial file is valid:
//!
//! ```toml
//! threads = 128
//! cluster_size = 2
//! ```

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    #[diagnostic(code(config::io))]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("malformed configuration: {0}")]
    #[diagnostic(code(config::parse))]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    #[diagnostic(code(config::invalid), help("see `nvgpu info` for the defaults"))]
    Invalid(String),
}

/// Parameters of the simulated thread block and its device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Threads in the block; every thread runs the whole program
    pub threads: usize,

    /// Threads per warp
    pub warp_size: usize,

    /// CTAs in the cluster (multicast targets)
    pub cluster_size: usize,

    /// Rank of the simulated CTA inside its cluster
    pub cta_rank: usize,

    /// Shared memory available to the block
    pub shared_memory_bytes: usize,

    /// Polls one `try_wait.parity` tick budget unit stands for
    pub try_wait_ticks: u64,

    /// Retry rounds before a blocking wait is reported as stuck
    pub wait_watchdog_rounds: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            warp_size: 32,
            cluster_size: 1,
            cta_rank: 0,
            shared_memory_bytes: 232448, // 227 KB, sm_90
            try_wait_ticks: 1,
            wait_watchdog_rounds: 1_000_000,
        }
    }
}

impl SimConfig {
    pub fn new(threads: usize) -> Self {
        Self {
            threads,
            ..Self::default()
        }
    }

    pub fn with_cluster(mut self, cluster_size: usize, cta_rank: usize) -> Self {
        self.cluster_size = cluster_size;
        self.cta_rank = cta_rank;
        self
    }

    pub fn with_shared_memory(mut self, bytes: usize) -> Self {
        self.shared_memory_bytes = bytes;
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Number of warps, counting a trailing partial warp
    pub fn warps(&self) -> usize {
        self.threads.div_ceil(self.warp_size)
    }

    /// Validate against structural limits
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 || self.threads > 1024 {
            return Err(ConfigError::Invalid(format!(
                "threads must be between 1 and 1024, found {}",
                self.threads
            )));
        }
        if self.warp_size == 0 {
            return Err(ConfigError::Invalid("warp_size must be positive".into()));
        }
        if self.cluster_size == 0 || self.cluster_size > 16 {
            return Err(ConfigError::Invalid(format!(
                "cluster_size must be between 1 and 16, found {}",
                self.cluster_size
            )));
        }
        if self.cta_rank >= self.cluster_size {
            return Err(ConfigError::Invalid(format!(
                "cta_rank {} is outside a cluster of {}",
                self.cta_rank, self.cluster_size
            )));
        }
        if self.wait_watchdog_rounds == 0 {
            return Err(ConfigError::Invalid(
                "wait_watchdog_rounds must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml() {
        let config = SimConfig::from_toml_str("threads = 64\ncluster_size = 2").unwrap();
        assert_eq!(config.threads, 64);
        assert_eq!(config.cluster_size, 2);
        assert_eq!(config.warp_size, 32);
        assert_eq!(config.warps(), 2);
    }

    #[test]
    fn test_invalid_rank() {
        let err = SimConfig::from_toml_str("cta_rank = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            SimConfig::from_toml_str("threads = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_builder() {
        let config = SimConfig::new(33).with_cluster(4, 1).with_shared_memory(1024);
        assert_eq!(config.warps(), 2);
        assert!(config.validate().is_ok());
    }
}
