//! Broker error types
//!
//! Every failure the broker reports carries a signed error code. Negative codes
//! mark software defects (bad handle, bad key, malformed argument) that a caller
//! must never retry. Positive codes mark environmental failures (missing device,
//! I/O error, permissions, exhausted resources) that are surfaced to the caller's
//! request as-is. Zero means no error.

use std::io;
use thiserror::Error;

/// Result type for broker operations
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Errors reported by broker operations
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Disk handle does not resolve in the calling context
    #[error("invalid disk handle")]
    InvalidHandle,

    /// Correlation key does not name a live request owned by the calling context
    #[error("invalid request key")]
    InvalidKey,

    /// Malformed argument (alignment, range, unknown operation, priority)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Missing or undersized transfer buffer
    #[error("invalid transfer buffer")]
    InvalidBuffer,

    /// Device does not exist or is no longer live
    #[error("no such device: {0}")]
    NoDevice(String),

    /// Device exists but cannot be opened by this process
    #[error("permission denied: {0}")]
    Permission(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Request pool exhausted
    #[error("request pool exhausted")]
    OutOfMemory,

    /// Transport cannot accept more outstanding transfers
    #[error("transport queue full")]
    QueueFull,

    /// Broker is shutting down
    #[error("broker is shut down")]
    Shutdown,
}

impl BrokerError {
    /// Signed error code for this error
    ///
    /// Negative values are software defects, positive values environmental failures.
    pub fn code(&self) -> i32 {
        match self {
            BrokerError::InvalidHandle => -libc::EBADF,
            BrokerError::InvalidKey => -libc::ENOENT,
            BrokerError::InvalidArgument(_) => -libc::EINVAL,
            BrokerError::InvalidBuffer => -libc::EFAULT,
            BrokerError::NoDevice(_) => libc::ENODEV,
            BrokerError::Permission(_) => libc::EACCES,
            BrokerError::Io(err) => err.raw_os_error().filter(|c| *c > 0).unwrap_or(libc::EIO),
            BrokerError::OutOfMemory => libc::ENOMEM,
            BrokerError::QueueFull => libc::EAGAIN,
            BrokerError::Shutdown => libc::ESHUTDOWN,
        }
    }

    /// Map an OS-level failure from opening or probing a device
    pub fn from_device_error(device: &str, err: &anyhow::Error) -> Self {
        let os = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<io::Error>())
            .and_then(|io_err| io_err.raw_os_error());

        match os {
            Some(libc::ENOENT) | Some(libc::ENXIO) | Some(libc::ENODEV) => {
                BrokerError::NoDevice(device.to_string())
            }
            Some(libc::EACCES) | Some(libc::EPERM) | Some(libc::EROFS) => {
                BrokerError::Permission(device.to_string())
            }
            Some(code) => BrokerError::Io(io::Error::from_raw_os_error(code)),
            None => BrokerError::NoDevice(format!("{}: {:#}", device, err)),
        }
    }
}

/// Which family a signed error code belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// No error recorded
    None,
    /// Caller or broker defect; never retried
    Software,
    /// Device, transport or resource failure
    Environment,
}

impl ErrorClass {
    /// Classify a signed error code
    pub fn of(code: i32) -> Self {
        match code {
            0 => ErrorClass::None,
            c if c < 0 => ErrorClass::Software,
            _ => ErrorClass::Environment,
        }
    }
}
