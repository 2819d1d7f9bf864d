//! diskbroker - shared asynchronous disk I/O broker
//!
//! diskbroker lets many threads of a database process share raw block devices
//! through one broker: devices are opened once and reference counted, transfers
//! are submitted without blocking and reaped later by key, by wait set, or in
//! multiplexed submit/wait/drain calls.
//!
//! # Architecture
//!
//! - **Broker**: disk registry, request pool, submission and completion paths
//! - **IO engines**: sync (pread/pwrite), libaio, mock
//! - **Targets**: block devices and regular-file disk images, plus on-disk labels
//! - **Stats**: lock-free counters and an HDR latency histogram

pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod exercise;
pub mod stats;
pub mod target;
pub mod util;

// Re-export commonly used types
pub use broker::{Broker, ClientContext, ContextGuard, IoDescriptor, RequestKey, Timeout};
pub use config::BrokerConfig;
pub use engine::IOEngine;
pub use error::{BrokerError, BrokerResult};

/// Result type used throughout diskbroker
pub type Result<T> = anyhow::Result<T>;
