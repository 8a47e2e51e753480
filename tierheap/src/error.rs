//! Allocator error type.
//!
//! Allocation itself never returns an error: exhaustion and page-source
//! failures surface as a null pointer. `AllocError` covers the checked
//! lifecycle operations (`init`, `destroy`) and tier setup.

use thiserror::Error;

/// Errors reported by the checked allocator operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// `init` called on an allocator that is already initialized.
    #[error("allocator is already initialized")]
    AlreadyInitialized,

    /// `destroy` called on an allocator that was never initialized.
    #[error("allocator is not initialized")]
    NotInitialized,

    /// Operation on an allocator that has been destroyed.
    #[error("allocator has been destroyed")]
    Destroyed,

    /// The page source could not provide backing memory.
    #[error("page source exhausted")]
    PageSourceExhausted,
}
