//! Aligned transfer buffers
//!
//! Raw block-device transfers (especially with O_DIRECT) need memory aligned to
//! the device's logical block size. Callers hand an [`AlignedBuffer`] to the broker
//! inside an `IoDescriptor`; the broker owns it while the transfer is in flight
//! and hands it back in the reaped `Completion`.

use crate::Result;
use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;

/// Default alignment for transfer buffers (covers 512e and 4Kn devices)
pub const DEFAULT_ALIGNMENT: usize = 4096;

/// Fill pattern for buffer initialization and verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillPattern {
    /// All zeros
    Zeros,
    /// All ones (0xFF)
    Ones,
    /// Random data with a specific seed
    Random(u64),
    /// Sequential bytes (0x00, 0x01, 0x02, ..., 0xFF, 0x00, ...)
    Sequential,
}

/// Memory-aligned, zero-initialized buffer suitable for raw device transfers
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    size: usize,
    alignment: usize,
    layout: Layout,
}

impl AlignedBuffer {
    /// Allocate a zeroed buffer of `size` bytes aligned to `alignment`
    ///
    /// # Errors
    /// Fails if `size` is zero, `alignment` is not a power of two, or the
    /// allocation itself fails.
    pub fn new(size: usize, alignment: usize) -> Result<Self> {
        if !alignment.is_power_of_two() {
            anyhow::bail!("buffer alignment must be a power of 2, got {}", alignment);
        }
        if size == 0 {
            anyhow::bail!("buffer size must be greater than 0");
        }

        let layout = Layout::from_size_align(size, alignment)
            .map_err(|e| anyhow::anyhow!("invalid buffer layout ({} bytes, align {}): {}", size, alignment, e))?;

        // SAFETY: layout has non-zero size (checked above)
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| anyhow::anyhow!("failed to allocate {} byte aligned buffer", size))?;

        Ok(AlignedBuffer {
            ptr,
            size,
            alignment,
            layout,
        })
    }

    /// Get a raw pointer to the buffer
    #[inline(always)]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Get a mutable raw pointer to the buffer
    #[inline(always)]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Get the buffer as a slice
    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is a live allocation of `size` initialized bytes
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// Get the buffer as a mutable slice
    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is a live allocation of `size` initialized bytes, uniquely borrowed
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    /// Size of the buffer in bytes
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Always false; zero-sized buffers cannot be constructed
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Alignment of the buffer
    #[inline(always)]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Fill the buffer with a specific pattern
    pub fn fill(&mut self, pattern: FillPattern) {
        fill_slice(self.as_mut_slice(), pattern);
    }

    /// Verify that the buffer contains the expected pattern
    ///
    /// Returns `Err(offset)` with the first mismatched byte offset on failure.
    pub fn verify(&self, pattern: FillPattern) -> std::result::Result<(), usize> {
        let mut expected = vec![0u8; self.size];
        fill_slice(&mut expected, pattern);
        match self.as_slice().iter().zip(&expected).position(|(a, b)| a != b) {
            Some(offset) => Err(offset),
            None => Ok(()),
        }
    }
}

fn fill_slice(slice: &mut [u8], pattern: FillPattern) {
    match pattern {
        FillPattern::Zeros => slice.fill(0),
        FillPattern::Ones => slice.fill(0xFF),
        FillPattern::Random(seed) => Xoshiro256PlusPlus::seed_from_u64(seed).fill_bytes(slice),
        FillPattern::Sequential => {
            for (i, byte) in slice.iter_mut().enumerate() {
                *byte = (i % 256) as u8;
            }
        }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with exactly this layout
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("size", &self.size)
            .field("alignment", &self.alignment)
            .finish()
    }
}

// AlignedBuffer owns its memory exclusively
unsafe impl Send for AlignedBuffer {}
