/*!
 * Error Types
 * Centralized error handling with thiserror, miette, and serde support
 */

use crate::core::data_structures::InlineString;
use crate::core::types::DeviceSize;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used by every fallible allocator operation
pub type AllocResult<T> = Result<T, AllocError>;

/// Errors reported by a backing-region provider
///
/// The engine never interprets these beyond wrapping them into
/// [`AllocError::ProviderFailure`].
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum ProviderError {
    #[error("Provider out of memory: requested {requested} bytes, {available} bytes available")]
    #[diagnostic(
        code(provider::out_of_memory),
        help("The backing memory source is exhausted. Free regions or lower block sizes.")
    )]
    OutOfMemory {
        requested: DeviceSize,
        available: DeviceSize,
    },

    #[error("Provider rejected the request: {0}")]
    #[diagnostic(code(provider::rejected))]
    Rejected(InlineString),

    #[error("Provider does not support this operation: {0}")]
    #[diagnostic(code(provider::unsupported))]
    Unsupported(InlineString),
}

/// Allocator errors with serialization support
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum AllocError {
    #[error("Out of memory: requested {requested} bytes ({reason})")]
    #[diagnostic(
        code(alloc::out_of_memory),
        help("No block has a fitting free range and the pool may not grow. Free allocations, raise the pool's block limit or defragment.")
    )]
    OutOfMemory {
        requested: DeviceSize,
        reason: InlineString,
    },

    #[error("Invalid argument: {0}")]
    #[diagnostic(
        code(alloc::invalid_argument),
        help("Check sizes, alignments, flags and pool parameters.")
    )]
    InvalidArgument(InlineString),

    #[error("Defragmentation already in progress")]
    #[diagnostic(
        code(alloc::already_in_progress),
        help("Drop the existing defragmentation context before starting another one on the same pool.")
    )]
    AlreadyInProgress,

    #[error("Backing region provider failed: {0}")]
    #[diagnostic(transparent)]
    ProviderFailure(#[from] ProviderError),
}

impl AllocError {
    /// Shorthand for an [`AllocError::InvalidArgument`]
    #[inline]
    pub fn invalid(message: impl Into<InlineString>) -> Self {
        AllocError::InvalidArgument(message.into())
    }

    /// Shorthand for an [`AllocError::OutOfMemory`]
    #[inline]
    pub fn out_of_memory(requested: DeviceSize, reason: impl Into<InlineString>) -> Self {
        AllocError::OutOfMemory {
            requested,
            reason: reason.into(),
        }
    }

    /// True for the out-of-memory family, including provider exhaustion
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            AllocError::OutOfMemory { .. }
                | AllocError::ProviderFailure(ProviderError::OutOfMemory { .. })
        )
    }
}
