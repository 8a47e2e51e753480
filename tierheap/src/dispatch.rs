//! Allocation Dispatcher
//!
//! The `Allocator` facade owns one fixed pool per size class, the
//! coalescing heap and the direct-allocation table, and routes every
//! request to the right tier:
//!
//! - `alloc(n)` goes by size: zero is refused, requests above the direct
//!   threshold bypass everything, small requests try the smallest fitting
//!   size class and fall through to the heap when that pool is exhausted,
//!   everything else goes to the heap. A heap miss is a null return; there
//!   is no spill to the page source.
//! - `free(p)` goes by ownership: the direct table is checked first, then
//!   each pool's address range, and whatever remains is handed to the
//!   heap, which validates it structurally.
//!
//! The ordering is unambiguous because the tiers allocate from disjoint
//! backing regions.

use core::ptr;

use crate::direct::{DirectList, DirectStats};
use crate::error::AllocError;
use crate::heap::{Heap, HeapStats};
use crate::pool::{FixedPool, PoolStats};
use crate::{align_up, ALIGN};

/// Block sizes served by the fixed pools.
pub const SIZE_CLASSES: [usize; 6] = [16, 32, 64, 128, 256, 512];

/// Number of fixed pools.
pub const NUM_SIZE_CLASSES: usize = SIZE_CLASSES.len();

/// Blocks carried by each pool.
pub const BLOCKS_PER_CLASS: usize = 1024;

/// Arena size handed to the heap on `init`.
pub const HEAP_INITIAL_SIZE: usize = 4 * 1024 * 1024;

/// Requests larger than this go straight to the page source.
pub const DIRECT_THRESHOLD: usize = 10 * 1024 * 1024;

/// Cap on `dump_blocks` output.
const DUMP_BLOCK_LIMIT: usize = 1000;

/// Tier geometry. `Default` is the standard configuration.
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// Pool block sizes, ascending multiples of [`ALIGN`].
    pub size_classes: [usize; NUM_SIZE_CLASSES],
    /// Blocks per pool.
    pub blocks_per_class: usize,
    /// Heap arena size.
    pub heap_size: usize,
    /// Smallest request routed directly to the page source.
    pub direct_threshold: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            size_classes: SIZE_CLASSES,
            blocks_per_class: BLOCKS_PER_CLASS,
            heap_size: HEAP_INITIAL_SIZE,
            direct_threshold: DIRECT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Initialized,
    Destroyed,
}

/// The three-tier allocator facade.
pub struct Allocator {
    pools: [FixedPool; NUM_SIZE_CLASSES],
    heap: Heap,
    direct: DirectList,
    config: DispatchConfig,
    state: State,
}

impl Allocator {
    /// Allocator with the standard tier geometry, not yet initialized.
    pub fn new() -> Self {
        Self::with_config(DispatchConfig::default())
    }

    /// Allocator with a custom tier geometry, not yet initialized.
    pub fn with_config(config: DispatchConfig) -> Self {
        debug_assert!(config.size_classes.windows(2).all(|w| w[0] < w[1]));
        debug_assert!(config.size_classes.iter().all(|&c| c % ALIGN == 0));
        debug_assert!(config.blocks_per_class > 0);
        debug_assert!(config.direct_threshold >= config.size_classes[NUM_SIZE_CLASSES - 1]);

        Self {
            pools: core::array::from_fn(|i| {
                FixedPool::new(config.size_classes[i], config.blocks_per_class)
            }),
            heap: Heap::new(),
            direct: DirectList::new(),
            config,
            state: State::Fresh,
        }
    }

    /// Bring every tier up. Valid exactly once, on a fresh allocator.
    pub fn init(&mut self) -> Result<(), AllocError> {
        match self.state {
            State::Initialized => return Err(AllocError::AlreadyInitialized),
            State::Destroyed => return Err(AllocError::Destroyed),
            State::Fresh => {}
        }

        for pool in &mut self.pools {
            pool.init()?;
        }
        self.heap.init(self.config.heap_size)?;

        self.state = State::Initialized;
        log::debug!(
            "allocator init: {} pools, {} byte heap, direct above {} bytes",
            NUM_SIZE_CLASSES,
            self.config.heap_size,
            self.config.direct_threshold
        );
        Ok(())
    }

    /// Allocate `size` bytes, 8-byte aligned.
    ///
    /// Returns null for a zero-size request and when the selected tier
    /// cannot satisfy the request.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        debug_assert!(self.state == State::Initialized, "alloc on a dormant allocator");
        if self.state != State::Initialized || size == 0 {
            return ptr::null_mut();
        }

        let rounded = align_up(size, ALIGN);
        if rounded > self.config.direct_threshold {
            return self.direct.alloc(rounded);
        }

        for (class, &block_size) in self.config.size_classes.iter().enumerate() {
            if block_size >= rounded {
                let p = self.pools[class].alloc();
                if !p.is_null() {
                    return p;
                }
                log::trace!("size class {block_size} exhausted, falling through to the heap");
                break;
            }
        }

        self.heap.alloc(rounded)
    }

    /// Allocate `size` zeroed bytes.
    pub fn alloc_zeroed(&mut self, size: usize) -> *mut u8 {
        let p = self.alloc(size);
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, size) };
        }
        p
    }

    /// Return `p` to the tier that owns it. Null is a no-op; a pointer no
    /// tier recognizes is ignored.
    pub fn free(&mut self, p: *mut u8) {
        debug_assert!(self.state == State::Initialized, "free on a dormant allocator");
        if p.is_null() || self.state != State::Initialized {
            return;
        }

        if self.direct.owns(p) {
            self.direct.free(p);
            return;
        }
        for pool in &mut self.pools {
            if pool.contains(p) {
                pool.free(p);
                return;
            }
        }
        self.heap.free(p);
    }

    /// Tear every tier down, reclaiming outstanding direct regions.
    /// Terminal: the allocator cannot be reused afterwards.
    pub fn destroy(&mut self) -> Result<(), AllocError> {
        match self.state {
            State::Fresh => return Err(AllocError::NotInitialized),
            State::Destroyed => return Err(AllocError::Destroyed),
            State::Initialized => {}
        }
        self.release();
        self.state = State::Destroyed;
        log::debug!("allocator destroyed");
        Ok(())
    }

    fn release(&mut self) {
        self.direct.release_all();
        self.heap.destroy();
        for pool in &mut self.pools {
            pool.destroy();
        }
    }

    /// Structural check of the heap arena.
    pub fn validate(&self) -> bool {
        self.heap.validate()
    }

    /// Snapshot of every tier's counters.
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            pools: core::array::from_fn(|i| self.pools[i].stats()),
            heap: self.heap.stats(),
            direct: self.direct.stats(),
        }
    }

    /// Emit per-tier statistics through `log`.
    pub fn dump_stats(&self) {
        let stats = self.stats();
        log::info!("allocator statistics:");
        for pool in &stats.pools {
            log::info!(
                "  pool {:>4}B: {:>5}/{} blocks used ({} bytes)",
                pool.block_size,
                pool.used_blocks,
                pool.total_blocks,
                pool.used_bytes
            );
        }
        log::info!(
            "  heap: {} used / {} free blocks, {} of {} bytes free, largest free {}",
            stats.heap.used_blocks,
            stats.heap.free_blocks,
            stats.heap.free_bytes,
            stats.heap.arena_size,
            stats.heap.largest_free
        );
        log::info!(
            "  direct: {} outstanding regions, {} bytes",
            stats.direct.outstanding,
            stats.direct.bytes
        );
    }

    /// Emit the heap block sequence through `log`.
    pub fn dump_blocks(&self) {
        self.heap.dump_blocks(DUMP_BLOCK_LIMIT);
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        if self.state == State::Initialized {
            self.release();
        }
    }
}

/// Aggregated tier counters.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorStats {
    pub pools: [PoolStats; NUM_SIZE_CLASSES],
    pub heap: HeapStats,
    pub direct: DirectStats,
}
