//! Configuration validation

use super::*;
use crate::target::SECTOR_SIZE;
use anyhow::Result;

/// Validate complete configuration
pub fn validate_config(config: &BrokerConfig) -> Result<()> {
    validate_pool(&config.pool)?;
    validate_transport(&config.transport)?;
    validate_device(&config.device)?;

    Ok(())
}

/// Validate request pool configuration
pub fn validate_pool(pool: &PoolConfig) -> Result<()> {
    if pool.max_requests == 0 || pool.max_requests > 65536 {
        anyhow::bail!(
            "pool.max_requests must be between 1 and 65536, got {}",
            pool.max_requests
        );
    }
    Ok(())
}

/// Validate transport configuration
pub fn validate_transport(transport: &TransportConfig) -> Result<()> {
    if transport.queue_depth == 0 || transport.queue_depth > 4096 {
        anyhow::bail!(
            "transport.queue_depth must be between 1 and 4096, got {}",
            transport.queue_depth
        );
    }

    if transport.poll_interval_us == 0 || transport.poll_interval_us > 1_000_000 {
        anyhow::bail!(
            "transport.poll_interval_us must be between 1 and 1000000, got {}",
            transport.poll_interval_us
        );
    }

    if transport.max_transfer_bytes == 0 || transport.max_transfer_bytes % SECTOR_SIZE != 0 {
        anyhow::bail!(
            "transport.max_transfer_bytes must be a non-zero multiple of {}, got {}",
            SECTOR_SIZE,
            transport.max_transfer_bytes
        );
    }

    #[cfg(not(target_os = "linux"))]
    if transport.engine == EngineType::Libaio {
        anyhow::bail!("transport.engine = libaio requires Linux");
    }

    Ok(())
}

/// Validate device configuration
pub fn validate_device(device: &DeviceConfig) -> Result<()> {
    if let Some(block_size) = device.block_size_override {
        if block_size < SECTOR_SIZE || !block_size.is_power_of_two() {
            anyhow::bail!(
                "device.block_size_override must be a power of two >= {}, got {}",
                SECTOR_SIZE,
                block_size
            );
        }
    }
    Ok(())
}
