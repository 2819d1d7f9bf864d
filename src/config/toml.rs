//! TOML configuration file parsing

use super::*;
use crate::config::cli::GlobalArgs;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<BrokerConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<BrokerConfig> {
    let config: BrokerConfig = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &GlobalArgs, mut config: BrokerConfig) -> Result<BrokerConfig> {
    if let Some(engine) = cli.engine {
        config.transport.engine = engine.into();
    }
    if let Some(queue_depth) = cli.queue_depth {
        config.transport.queue_depth = queue_depth;
    }
    if let Some(max_transfer) = &cli.max_transfer {
        config.transport.max_transfer_bytes = parse_size(max_transfer)?;
    }
    if cli.direct {
        config.device.direct = true;
    }

    Ok(config)
}

/// Load the configuration named by the CLI (or defaults) and apply CLI overrides
pub fn load_config(cli: &GlobalArgs) -> Result<BrokerConfig> {
    let config = match &cli.config {
        Some(path) => parse_toml_file(path)?,
        None => BrokerConfig::default(),
    };
    merge_cli_with_config(cli, config)
}

/// Parse size string (e.g., "1M", "128k", "512") to bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();
    if s.is_empty() {
        anyhow::bail!("Empty size string");
    }

    let (num_str, multiplier) = if s.ends_with('K') {
        (&s[..s.len() - 1], 1024u64)
    } else if s.ends_with('M') {
        (&s[..s.len() - 1], 1024 * 1024)
    } else if s.ends_with('G') {
        (&s[..s.len() - 1], 1024 * 1024 * 1024)
    } else {
        (s.as_str(), 1)
    };

    let num: u64 = num_str.parse()
        .with_context(|| format!("Invalid number in size: {}", num_str))?;

    num.checked_mul(multiplier)
        .with_context(|| format!("Size overflows: {}", s))
}
