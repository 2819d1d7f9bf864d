//! CLI argument parsing using clap

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// diskbroker - asynchronous disk I/O broker
#[derive(Parser, Debug)]
#[command(name = "diskbroker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by every subcommand
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// TOML configuration file
    #[arg(long, global = true, env = "DISKBROKER_CONFIG")]
    pub config: Option<PathBuf>,

    /// IO engine backing the broker
    #[arg(long, global = true, value_enum)]
    pub engine: Option<EngineType>,

    /// Maximum outstanding transfers (1-4096)
    #[arg(short = 'q', long, global = true)]
    pub queue_depth: Option<usize>,

    /// Largest single transfer (e.g., 128k, 1M)
    #[arg(long, global = true)]
    pub max_transfer: Option<String>,

    /// Open devices with O_DIRECT
    #[arg(long, global = true)]
    pub direct: bool,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Print command output as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write a label to a device
    Label {
        /// Device path
        device: PathBuf,
        /// Label name (up to 24 of A-Z, 0-9, _)
        name: String,
        /// Replace an existing, different label
        #[arg(long)]
        force: bool,
    },

    /// Show a device's label
    Query {
        /// Device path
        device: PathBuf,
    },

    /// Mark a device as cleared
    Clear {
        /// Device path
        device: PathBuf,
    },

    /// Open a device through the broker and print its geometry
    Probe {
        /// Device path
        device: PathBuf,
    },

    /// Write a pattern through the broker, read it back and verify it
    Exercise {
        /// Device path
        device: PathBuf,

        /// Number of single-transfer writes
        #[arg(short = 'n', long, default_value = "64")]
        writes: u64,

        /// Blocks (512 bytes) per transfer
        #[arg(long, default_value = "8")]
        blocks: u64,

        /// First block to write at
        #[arg(long, default_value = "0")]
        start_block: u64,

        /// Pattern seed (random if omitted)
        #[arg(long)]
        seed: Option<u64>,
    },
}

/// IO engine type
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineType {
    /// Deferred pread/pwrite (portable)
    Sync,
    /// Linux native AIO
    Libaio,
    /// In-process mock, no device access
    Mock,
}

impl From<EngineType> for crate::engine::EngineType {
    fn from(engine: EngineType) -> Self {
        match engine {
            EngineType::Sync => crate::engine::EngineType::Sync,
            EngineType::Libaio => crate::engine::EngineType::Libaio,
            EngineType::Mock => crate::engine::EngineType::Mock,
        }
    }
}
