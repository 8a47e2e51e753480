//! Coalescing Heap
//!
//! Variable-size allocation inside a single arena. The arena is tiled at
//! all times by contiguous blocks, each framed by boundary tags:
//!
//! ```text
//! +--------+-----------------------------+--------+
//! | header |          user data          | footer |
//! +--------+-----------------------------+--------+
//! ^ size, flags                            ^ size (mirror)
//! ```
//!
//! `size` counts the whole block, tags included. The footer mirror lets a
//! free walk backwards to the preceding block in O(1), which is what makes
//! coalescing bidirectional. Free blocks additionally carry doubly linked
//! list pointers in their user area; allocation is first-fit over that
//! list, release reinserts at the head.
//!
//! # Key Structures
//!
//! - `BlockHeader`: persistent prefix of every block
//! - `FreeBlock`: header plus list links, valid only while free
//! - `BlockFooter`: the boundary tag
//! - `Heap`: arena control structure

use core::mem;
use core::ptr;

use crate::error::AllocError;
use crate::{align_up, page, ALIGN};

bitflags::bitflags! {
    /// Block state bits kept in the header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u8 {
        /// Block is on the free list.
        const FREE = 0x01;
    }
}

/// Persistent prefix of every block. User data begins at `HDR_OFF`.
#[repr(C)]
struct BlockHeader {
    /// Whole-block size in bytes, tags included.
    size: usize,
    flags: BlockFlags,
}

/// View of a free block: the header plus the list links that live in the
/// first two words of the user area. The links are dead the moment the
/// block is handed out.
#[repr(C)]
struct FreeBlock {
    header: BlockHeader,
    next: *mut FreeBlock,
    prev: *mut FreeBlock,
}

/// Boundary tag closing every block.
#[repr(C)]
struct BlockFooter {
    size: usize,
}

/// Offset of the user data area within a block.
pub const HDR_OFF: usize = mem::size_of::<BlockHeader>();

/// Smallest legal block: the free-list overlay plus a footer that must
/// not overlap it.
pub const MIN_BLOCK: usize = mem::size_of::<FreeBlock>() + mem::size_of::<BlockFooter>();

const FOOTER_SIZE: usize = mem::size_of::<BlockFooter>();

const _: () = assert!(HDR_OFF % ALIGN == 0);
const _: () = assert!(FOOTER_SIZE % ALIGN == 0);
const _: () = assert!(MIN_BLOCK % ALIGN == 0);
const _: () = assert!(MIN_BLOCK >= HDR_OFF + ALIGN + FOOTER_SIZE);

/// Coalescing arena allocator.
pub struct Heap {
    /// Arena start, null until `init`.
    base: *mut u8,
    /// Arena size in bytes.
    size: usize,
    /// Head of the explicit free list, null when nothing is free.
    free_head: *mut FreeBlock,
    alloc_count: u64,
    free_count: u64,
}

// Raw pointers refer only to the arena this heap owns exclusively.
unsafe impl Send for Heap {}

impl Heap {
    /// Create a heap with no arena.
    pub fn new() -> Self {
        Self {
            base: ptr::null_mut(),
            size: 0,
            free_head: ptr::null_mut(),
            alloc_count: 0,
            free_count: 0,
        }
    }

    /// Acquire the arena and install one free block spanning it. No-op on
    /// an initialized heap.
    ///
    /// The arena ends up at least [`MIN_BLOCK`] bytes, rounded to
    /// [`ALIGN`].
    pub fn init(&mut self, requested_size: usize) -> Result<(), AllocError> {
        if !self.base.is_null() {
            return Ok(());
        }

        let size = align_up(requested_size.max(MIN_BLOCK), ALIGN);
        let base = page::page_alloc(size);
        if base.is_null() {
            return Err(AllocError::PageSourceExhausted);
        }

        self.base = base;
        self.size = size;
        unsafe {
            let block = base as *mut FreeBlock;
            (*block).header.size = size;
            (*block).header.flags = BlockFlags::FREE;
            (*block).next = ptr::null_mut();
            (*block).prev = ptr::null_mut();
            self.write_footer(block as *mut BlockHeader);
        }
        self.free_head = base as *mut FreeBlock;

        log::debug!("heap init: {size} byte arena");
        Ok(())
    }

    /// Release the arena. No-op on an uninitialized heap.
    pub fn destroy(&mut self) {
        if self.base.is_null() {
            return;
        }
        unsafe { page::page_free(self.base, self.size) };
        self.base = ptr::null_mut();
        self.size = 0;
        self.free_head = ptr::null_mut();
        log::debug!("heap destroy");
    }

    /// First-fit allocation of `size` user bytes.
    ///
    /// Returns null when no free block can hold the request.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if self.base.is_null() || size == 0 {
            return ptr::null_mut();
        }

        let data_size = align_up(size, ALIGN);
        let occupied = align_up(HDR_OFF + data_size + FOOTER_SIZE, ALIGN).max(MIN_BLOCK);

        unsafe {
            let mut block = self.free_head;
            while !block.is_null() && (*block).header.size < occupied {
                block = (*block).next;
            }
            if block.is_null() {
                log::trace!("heap exhausted for {size} byte request");
                return ptr::null_mut();
            }
            self.list_remove(block);

            let header = block as *mut BlockHeader;
            let remaining = (*header).size - occupied;
            if remaining >= MIN_BLOCK {
                // Keep the tail as a free block of its own.
                (*header).size = occupied;
                self.write_footer(header);

                let rest = (header as *mut u8).add(occupied) as *mut BlockHeader;
                (*rest).size = remaining;
                (*rest).flags = BlockFlags::FREE;
                self.write_footer(rest);
                self.list_push(rest as *mut FreeBlock);
            }

            (*header).flags = BlockFlags::empty();
            self.alloc_count += 1;
            (header as *mut u8).add(HDR_OFF)
        }
    }

    /// Release the block behind user pointer `p`, merging it with free
    /// neighbors on both sides before reinserting at the list head.
    ///
    /// Pointers that do not name a block of this arena are ignored. A
    /// double free panics in debug builds and is logged and ignored
    /// otherwise.
    pub fn free(&mut self, p: *mut u8) {
        if p.is_null() || self.base.is_null() {
            return;
        }
        let addr = p as usize;
        if addr < self.base as usize + HDR_OFF {
            log::warn!("heap free: foreign pointer {p:p}");
            return;
        }

        unsafe {
            let header = p.sub(HDR_OFF) as *mut BlockHeader;
            if !self.is_plausible_block(header) {
                log::warn!("heap free: invalid pointer {p:p}");
                return;
            }
            if (*header).flags.contains(BlockFlags::FREE) {
                debug_assert!(false, "double free of heap block at {p:p}");
                log::warn!("heap free: double free at {p:p}");
                return;
            }

            let mut block = header;

            // Merge with the preceding block. Its footer sits directly
            // before our header.
            if (block as usize) > self.base as usize {
                let prev_footer = (block as *mut u8).sub(FOOTER_SIZE) as *const BlockFooter;
                let prev_size = (*prev_footer).size;
                if prev_size >= MIN_BLOCK && prev_size <= (block as usize) - (self.base as usize) {
                    let prev = (block as *mut u8).sub(prev_size) as *mut BlockHeader;
                    if self.is_plausible_block(prev)
                        && self.next_block(prev) == block
                        && (*prev).flags.contains(BlockFlags::FREE)
                    {
                        self.list_remove(prev as *mut FreeBlock);
                        (*prev).size += (*block).size;
                        self.write_footer(prev);
                        block = prev;
                    }
                }
            }

            // Merge with the following block.
            let next = self.next_block(block);
            if (next as usize) < self.arena_end()
                && self.is_plausible_block(next)
                && (*next).flags.contains(BlockFlags::FREE)
            {
                self.list_remove(next as *mut FreeBlock);
                (*block).size += (*next).size;
                self.write_footer(block);
            }

            (*block).flags = BlockFlags::FREE;
            self.list_push(block as *mut FreeBlock);
            self.free_count += 1;
        }
    }

    /// Whether `p` points into the arena.
    pub fn contains(&self, p: *const u8) -> bool {
        if p.is_null() || self.base.is_null() {
            return false;
        }
        let addr = p as usize;
        addr >= self.base as usize && addr < self.arena_end()
    }

    /// Arena size in bytes, zero before `init`.
    pub fn arena_size(&self) -> usize {
        self.size
    }

    /// Counters and free-space figures, computed by a block walk.
    ///
    /// A corrupt block terminates the walk early rather than wandering
    /// outside the arena.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            arena_size: self.size,
            alloc_count: self.alloc_count,
            free_count: self.free_count,
            ..HeapStats::default()
        };
        if self.base.is_null() {
            return stats;
        }

        unsafe {
            let end = self.arena_end();
            let mut cursor = self.base as *const BlockHeader;
            while (cursor as usize) < end {
                let size = (*cursor).size;
                if size == 0 || size > self.size || (cursor as usize) + size > end {
                    break;
                }
                if (*cursor).flags.contains(BlockFlags::FREE) {
                    stats.free_blocks += 1;
                    stats.free_bytes += size;
                    stats.largest_free = stats.largest_free.max(size);
                } else {
                    stats.used_blocks += 1;
                }
                cursor = (cursor as *const u8).add(size) as *const BlockHeader;
            }
        }
        stats
    }

    /// Full structural check of the arena.
    ///
    /// Verifies the block tiling, tag agreement, minimum sizes, that no
    /// two adjacent blocks are free, and that the free list enumerates
    /// exactly the free blocks. Logs the first violation found.
    pub fn validate(&self) -> bool {
        if self.base.is_null() {
            return true;
        }

        unsafe {
            let end = self.arena_end();
            let mut cursor = self.base as *const BlockHeader;
            let mut previous_free = false;
            let mut free_blocks = 0usize;

            while (cursor as usize) < end {
                let size = (*cursor).size;
                if size < MIN_BLOCK
                    || size % ALIGN != 0
                    || size > self.size
                    || (cursor as usize) + size > end
                {
                    log::warn!("heap validate: bad block size {size} at {cursor:p}");
                    return false;
                }
                let footer = ((cursor as usize) + size - FOOTER_SIZE) as *const BlockFooter;
                if (*footer).size != size {
                    log::warn!(
                        "heap validate: tag mismatch at {cursor:p} ({size} vs {})",
                        (*footer).size
                    );
                    return false;
                }
                let is_free = (*cursor).flags.contains(BlockFlags::FREE);
                if is_free && previous_free {
                    log::warn!("heap validate: adjacent free blocks at {cursor:p}");
                    return false;
                }
                if is_free {
                    free_blocks += 1;
                }
                previous_free = is_free;
                cursor = (cursor as *const u8).add(size) as *const BlockHeader;
            }
            if cursor as usize != end {
                log::warn!("heap validate: tiling does not end at the arena end");
                return false;
            }

            // The free list must enumerate exactly the free blocks.
            let mut listed = 0usize;
            let mut entry = self.free_head as *const FreeBlock;
            while !entry.is_null() {
                if !(*entry).header.flags.contains(BlockFlags::FREE) {
                    log::warn!("heap validate: used block on the free list at {entry:p}");
                    return false;
                }
                listed += 1;
                if listed > free_blocks {
                    log::warn!("heap validate: free list longer than the free block count");
                    return false;
                }
                entry = (*entry).next;
            }
            if listed != free_blocks {
                log::warn!("heap validate: {listed} listed vs {free_blocks} free blocks");
                return false;
            }
        }
        true
    }

    /// Emit the block sequence through `log`, at most `limit` entries.
    pub fn dump_blocks(&self, limit: usize) {
        if self.base.is_null() {
            log::info!("heap: not initialized");
            return;
        }

        log::info!("heap blocks ({} byte arena):", self.size);
        unsafe {
            let end = self.arena_end();
            let mut cursor = self.base as *const BlockHeader;
            let mut index = 0usize;
            while (cursor as usize) < end {
                let size = (*cursor).size;
                if size == 0 || size > self.size || (cursor as usize) + size > end {
                    log::warn!("heap dump: corrupt block at {cursor:p}, stopping");
                    return;
                }
                if index >= limit {
                    log::info!("  ... dump capped at {limit} blocks");
                    return;
                }
                let state = if (*cursor).flags.contains(BlockFlags::FREE) {
                    "free"
                } else {
                    "used"
                };
                log::info!(
                    "  block {index:>4}: offset {:#08x} size {size:>8} {state}",
                    (cursor as usize) - (self.base as usize)
                );
                index += 1;
                cursor = (cursor as *const u8).add(size) as *const BlockHeader;
            }
        }
    }

    fn arena_end(&self) -> usize {
        self.base as usize + self.size
    }

    /// Structural screen for a header candidate: inside the arena,
    /// aligned, with a size that keeps the block inside the arena.
    unsafe fn is_plausible_block(&self, header: *const BlockHeader) -> bool {
        let addr = header as usize;
        let base = self.base as usize;
        if addr < base || addr >= self.arena_end() || (addr - base) % ALIGN != 0 {
            return false;
        }
        let size = (*header).size;
        size >= MIN_BLOCK && size % ALIGN == 0 && size <= self.size && addr + size <= self.arena_end()
    }

    unsafe fn next_block(&self, header: *mut BlockHeader) -> *mut BlockHeader {
        (header as *mut u8).add((*header).size) as *mut BlockHeader
    }

    unsafe fn write_footer(&self, header: *mut BlockHeader) {
        let footer = ((header as usize) + (*header).size - FOOTER_SIZE) as *mut BlockFooter;
        (*footer).size = (*header).size;
    }

    unsafe fn list_push(&mut self, block: *mut FreeBlock) {
        (*block).prev = ptr::null_mut();
        (*block).next = self.free_head;
        if !self.free_head.is_null() {
            (*self.free_head).prev = block;
        }
        self.free_head = block;
    }

    unsafe fn list_remove(&mut self, block: *mut FreeBlock) {
        let prev = (*block).prev;
        let next = (*block).next;
        if prev.is_null() {
            self.free_head = next;
        } else {
            (*prev).next = next;
        }
        if !next.is_null() {
            (*next).prev = prev;
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Heap counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub arena_size: usize,
    pub free_bytes: usize,
    pub free_blocks: usize,
    pub used_blocks: usize,
    pub largest_free: usize,
    pub alloc_count: u64,
    pub free_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARENA: usize = 64 * 1024;

    fn heap() -> Heap {
        let mut heap = Heap::new();
        heap.init(ARENA).expect("init failed");
        heap
    }

    #[test]
    fn fresh_heap_is_one_free_block() {
        let heap = heap();
        let stats = heap.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, ARENA);
        assert_eq!(stats.used_blocks, 0);
        assert!(heap.validate());
    }

    #[test]
    fn alloc_is_aligned_and_inside_the_arena() {
        let mut heap = heap();
        let p = heap.alloc(600);
        assert!(!p.is_null());
        assert_eq!(p as usize % ALIGN, 0);
        assert!(heap.contains(p));
        assert!(heap.validate());
    }

    #[test]
    fn allocations_do_not_overlap() {
        let mut heap = heap();
        let a = heap.alloc(100);
        let b = heap.alloc(100);
        let c = heap.alloc(100);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());

        unsafe {
            ptr::write_bytes(a, 0xAA, 100);
            ptr::write_bytes(b, 0xBB, 100);
            ptr::write_bytes(c, 0xCC, 100);
            assert!(core::slice::from_raw_parts(a, 100).iter().all(|&x| x == 0xAA));
            assert!(core::slice::from_raw_parts(b, 100).iter().all(|&x| x == 0xBB));
            assert!(core::slice::from_raw_parts(c, 100).iter().all(|&x| x == 0xCC));
        }
        assert!(heap.validate());
    }

    #[test]
    fn split_keeps_the_remainder_free() {
        let mut heap = heap();
        let _a = heap.alloc(1000);
        let stats = heap.stats();
        assert_eq!(stats.used_blocks, 1);
        assert_eq!(stats.free_blocks, 1);
        assert!(stats.free_bytes < ARENA);
        assert!(heap.validate());
    }

    #[test]
    fn free_merges_forward() {
        let mut heap = heap();
        let a = heap.alloc(1000);
        // a sits at the arena start with the remainder behind it; freeing
        // it must swallow the remainder again.
        heap.free(a);
        let stats = heap.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, ARENA);
        assert!(heap.validate());
    }

    #[test]
    fn free_merges_backward() {
        let mut heap = heap();
        let a = heap.alloc(1000);
        let b = heap.alloc(1000);
        let _c = heap.alloc(1000);

        heap.free(a);
        assert_eq!(heap.stats().free_blocks, 2);

        // b's predecessor is free, so freeing b must extend it.
        heap.free(b);
        assert_eq!(heap.stats().free_blocks, 2);
        assert!(heap.validate());
    }

    #[test]
    fn free_merges_both_sides() {
        let mut heap = heap();
        let a = heap.alloc(1000);
        let b = heap.alloc(1000);
        let c = heap.alloc(1000);

        heap.free(a);
        heap.free(c);
        assert_eq!(heap.stats().free_blocks, 2);

        heap.free(b);
        let stats = heap.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, ARENA);
        assert!(heap.validate());
    }

    #[test]
    fn any_free_order_restores_one_block() {
        let orders: [[usize; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [1, 3, 0, 2], [2, 0, 3, 1]];
        for order in orders {
            let mut heap = heap();
            let blocks = [
                heap.alloc(200),
                heap.alloc(48),
                heap.alloc(3000),
                heap.alloc(664),
            ];
            for p in blocks {
                assert!(!p.is_null());
            }
            for i in order {
                heap.free(blocks[i]);
                assert!(heap.validate());
            }
            let stats = heap.stats();
            assert_eq!(stats.free_blocks, 1);
            assert_eq!(stats.free_bytes, ARENA);
        }
    }

    #[test]
    fn tight_remainder_is_not_split() {
        let mut heap = Heap::new();
        heap.init(MIN_BLOCK).expect("init failed");
        assert_eq!(heap.arena_size(), MIN_BLOCK);

        // The whole arena is one minimum block; the request fits but
        // leaves no room for a remainder block.
        let p = heap.alloc(8);
        assert!(!p.is_null());
        let stats = heap.stats();
        assert_eq!(stats.used_blocks, 1);
        assert_eq!(stats.free_blocks, 0);

        heap.free(p);
        assert_eq!(heap.stats().free_bytes, MIN_BLOCK);
        assert!(heap.validate());
    }

    #[test]
    fn exhaustion_returns_null() {
        let mut heap = Heap::new();
        heap.init(1024).expect("init failed");
        assert!(heap.alloc(2048).is_null());
        assert!(!heap.alloc(512).is_null());
        assert!(heap.alloc(1024).is_null());
    }

    #[test]
    fn foreign_pointers_are_ignored() {
        let mut heap = heap();
        let p = heap.alloc(100);
        unsafe { ptr::write_bytes(p, 0xFF, 100) };

        let mut outside = [0u8; 64];
        heap.free(outside.as_mut_ptr());
        // Interior pointer; the implied header lands in user data, which
        // cannot pass the structural screen.
        heap.free(unsafe { p.add(16) });

        let stats = heap.stats();
        assert_eq!(stats.used_blocks, 1);
        assert!(heap.validate());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "double free")]
    fn double_free_panics_in_debug() {
        let mut heap = heap();
        let p = heap.alloc(100);
        heap.free(p);
        heap.free(p);
    }

    #[test]
    fn init_is_idempotent() {
        let mut heap = heap();
        let p = heap.alloc(100);
        heap.init(ARENA * 2).expect("second init failed");
        assert_eq!(heap.arena_size(), ARENA);
        assert_eq!(heap.stats().used_blocks, 1);
        heap.free(p);
        assert_eq!(heap.stats().free_bytes, ARENA);
    }

    #[test]
    fn layout_constants() {
        assert_eq!(HDR_OFF, 16);
        assert_eq!(MIN_BLOCK, 40);
        assert_eq!(mem::size_of::<FreeBlock>(), HDR_OFF + 2 * mem::size_of::<usize>());
    }
}
