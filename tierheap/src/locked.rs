//! Serialized Allocator Wrapper
//!
//! The core allocator performs no synchronization. Callers that share one
//! allocator across threads wrap it here; every operation takes the spin
//! lock for its full duration.

use spin::Mutex;

use crate::dispatch::{Allocator, AllocatorStats, DispatchConfig};
use crate::error::AllocError;

/// An [`Allocator`] behind a spin lock.
pub struct LockedAllocator {
    inner: Mutex<Allocator>,
}

impl LockedAllocator {
    /// Wrap a fresh allocator with the standard geometry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Allocator::new()),
        }
    }

    /// Wrap a fresh allocator with a custom geometry.
    pub fn with_config(config: DispatchConfig) -> Self {
        Self {
            inner: Mutex::new(Allocator::with_config(config)),
        }
    }

    pub fn init(&self) -> Result<(), AllocError> {
        self.inner.lock().init()
    }

    pub fn alloc(&self, size: usize) -> *mut u8 {
        self.inner.lock().alloc(size)
    }

    pub fn alloc_zeroed(&self, size: usize) -> *mut u8 {
        self.inner.lock().alloc_zeroed(size)
    }

    pub fn free(&self, p: *mut u8) {
        self.inner.lock().free(p)
    }

    pub fn destroy(&self) -> Result<(), AllocError> {
        self.inner.lock().destroy()
    }

    pub fn stats(&self) -> AllocatorStats {
        self.inner.lock().stats()
    }
}

impl Default for LockedAllocator {
    fn default() -> Self {
        Self::new()
    }
}
