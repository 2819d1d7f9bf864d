//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.

pub mod cli;
pub mod toml;
pub mod validator;

use crate::engine::{EngineConfig, EngineType};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete broker configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub wait: WaitConfig,
}

/// Request pool sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of request slots (1-65536)
    pub max_requests: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_requests: 1024 }
    }
}

/// Transfer layer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// IO engine backing the broker
    pub engine: EngineType,
    /// Maximum outstanding transfers (1-4096)
    pub queue_depth: usize,
    /// Run a background thread that reaps engine completions
    pub completion_thread: bool,
    /// Completion thread poll interval in microseconds
    pub poll_interval_us: u64,
    /// Upper bound on a single transfer, in bytes
    pub max_transfer_bytes: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            engine: EngineType::default(),
            queue_depth: 128,
            completion_thread: true,
            poll_interval_us: 1000,
            max_transfer_bytes: 1024 * 1024,
        }
    }
}

impl TransportConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            queue_depth: self.queue_depth,
        }
    }
}

/// How devices are opened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Use direct IO (O_DIRECT)
    pub direct: bool,
    /// Logical block size to use instead of the probed one
    pub block_size_override: Option<u64>,
    /// Accept regular files as disk images
    pub allow_regular_files: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            direct: false,
            block_size_override: None,
            allow_regular_files: true,
        }
    }
}

/// Wait engine behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    /// Reject wait keys that do not name a live request instead of
    /// treating them as already satisfied
    pub strict_keys: bool,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self { strict_keys: true }
    }
}
