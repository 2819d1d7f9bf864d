//! Shared utilities: aligned transfer buffers and timing helpers

pub mod buffer;
pub mod time;
