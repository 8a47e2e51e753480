//! Page Source
//!
//! Every tier obtains its backing memory here and returns it here. The
//! functions wrap the process allocator and keep global counters so the
//! balance of obtained vs returned regions is observable.

use core::alloc::Layout;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::ALIGN;

static REGIONS_ALLOCATED: AtomicUsize = AtomicUsize::new(0);
static REGIONS_FREED: AtomicUsize = AtomicUsize::new(0);
static BYTES_OUTSTANDING: AtomicUsize = AtomicUsize::new(0);

/// Obtain `size` contiguous bytes aligned to at least [`ALIGN`].
///
/// Returns null when `size` is zero or the process allocator refuses the
/// request.
pub fn page_alloc(size: usize) -> *mut u8 {
    if size == 0 {
        return ptr::null_mut();
    }
    let layout = match Layout::from_size_align(size, ALIGN) {
        Ok(layout) => layout,
        Err(_) => return ptr::null_mut(),
    };

    let region = unsafe { std::alloc::alloc(layout) };
    if region.is_null() {
        log::warn!("page source refused {size} bytes");
        return ptr::null_mut();
    }

    REGIONS_ALLOCATED.fetch_add(1, Ordering::Relaxed);
    BYTES_OUTSTANDING.fetch_add(size, Ordering::Relaxed);
    region
}

/// Return a region previously obtained from [`page_alloc`].
///
/// # Safety
///
/// `region` must have been returned by `page_alloc(size)` with exactly this
/// `size`, and must not be used afterwards. Null is a no-op.
pub unsafe fn page_free(region: *mut u8, size: usize) {
    if region.is_null() {
        return;
    }
    let layout = Layout::from_size_align_unchecked(size, ALIGN);
    std::alloc::dealloc(region, layout);

    REGIONS_FREED.fetch_add(1, Ordering::Relaxed);
    BYTES_OUTSTANDING.fetch_sub(size, Ordering::Relaxed);
}

/// Page source counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageStats {
    /// Regions handed out since process start.
    pub regions_allocated: usize,
    /// Regions returned since process start.
    pub regions_freed: usize,
    /// Bytes currently held by allocators.
    pub bytes_outstanding: usize,
}

/// Snapshot of the page source counters.
pub fn page_stats() -> PageStats {
    PageStats {
        regions_allocated: REGIONS_ALLOCATED.load(Ordering::Relaxed),
        regions_freed: REGIONS_FREED.load(Ordering::Relaxed),
        bytes_outstanding: BYTES_OUTSTANDING.load(Ordering::Relaxed),
    }
}
