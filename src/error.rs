//! # Kernel Errors
//!
//! Every primitive reports its own outcome directly to its caller. There is
//! no unwinding and no global error slot.

use thiserror::Error;

/// Failure reported by a kernel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// A caller-supplied parameter was malformed, or a handle is stale.
    #[error("invalid argument")]
    InvalidArgument,
    /// The resource's lifecycle or ownership state forbids the operation.
    #[error("resource is in the wrong state for this operation")]
    InvalidState,
    /// The operation is not permitted from the calling context
    /// (typically: blocking from an interrupt handler).
    #[error("operation not permitted in the calling context")]
    InvalidOperation,
    /// A best-effort operation did not complete in time.
    #[error("operation timed out")]
    Timeout,
    /// The fixed-capacity thread table is full.
    #[error("thread table is full")]
    NoMemory,
    /// The primitive could not re-establish its own invariants.
    #[error("internal kernel error")]
    Internal,
}

/// Result alias used throughout the kernel.
pub type Result<T> = core::result::Result<T, KernelError>;
