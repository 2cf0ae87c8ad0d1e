// Callgate Error Handling
// Central location for the invocation bridge's error types and codes

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

// Re-export common error handling tools for convenience
pub use anyhow;
pub use thiserror;

mod traits;

pub use traits::Retryable;

/// Error code structure for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

/// Invocation error codes
pub mod codes {
    use crate::ErrorCode;

    // Invocation error codes start with 6000
    pub const UNCLASSIFIABLE: ErrorCode = ErrorCode(6001);
    pub const UNSUPPORTED_SHAPE: ErrorCode = ErrorCode(6002);
    pub const OFFLOAD_EXHAUSTED: ErrorCode = ErrorCode(6003);
    pub const CALLABLE_FAILED: ErrorCode = ErrorCode(6004);
    pub const RELEASE_FAILED: ErrorCode = ErrorCode(6005);
    pub const CANCELLED: ErrorCode = ErrorCode(6006);
}

/// Failure raised by user-supplied code (a callable body, an enter step or
/// an exit step).
pub type CallableError = anyhow::Error;

/// Errors surfaced by the invocation bridge.
///
/// User failures are held behind an `Arc` so that the same error object can
/// be shown to an exit step running on a worker thread and afterwards be
/// re-raised to the caller unchanged.
#[derive(Error, Debug, Clone)]
pub enum InvokeError {
    /// The callable matched none of the known shapes. This is a logic error
    /// in the caller, never a user input error.
    #[error("Unclassifiable callable `{name}`: {reason}")]
    Unclassifiable { name: String, reason: String },

    /// The callable has a valid shape, but not one the requested entry point
    /// can drive (e.g. a resource factory invoked without a scope).
    #[error("Callable `{name}` has shape {shape} which cannot be driven {context}")]
    UnsupportedShape {
        name: String,
        shape: String,
        context: &'static str,
    },

    /// The worker pool segment is saturated and has no room to queue.
    #[error("Offload segment `{segment}` exhausted: {workers} workers busy, {queued} waiting")]
    OffloadExhausted {
        segment: &'static str,
        workers: usize,
        queued: usize,
    },

    /// A failure raised by user code, propagated unchanged.
    #[error("{0}")]
    Callable(Arc<CallableError>),

    /// A new failure raised by an exit step. Supersedes whatever error the
    /// protected region produced.
    #[error("Release step failed: {0}")]
    Release(Arc<CallableError>),

    /// The enclosing scope went away before the operation finished.
    #[error("Operation cancelled")]
    Cancelled,
}

impl InvokeError {
    /// Wrap a user failure
    pub fn callable(err: impl Into<CallableError>) -> Self {
        InvokeError::Callable(Arc::new(err.into()))
    }

    /// Wrap a failure raised by an exit step
    pub fn release(err: impl Into<CallableError>) -> Self {
        InvokeError::Release(Arc::new(err.into()))
    }

    /// Create an unclassifiable-callable error
    pub fn unclassifiable(name: impl Into<String>, reason: impl Into<String>) -> Self {
        InvokeError::Unclassifiable {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Numeric code for this error
    pub fn code(&self) -> ErrorCode {
        use codes::*;
        match self {
            InvokeError::Unclassifiable { .. } => UNCLASSIFIABLE,
            InvokeError::UnsupportedShape { .. } => UNSUPPORTED_SHAPE,
            InvokeError::OffloadExhausted { .. } => OFFLOAD_EXHAUSTED,
            InvokeError::Callable(_) => CALLABLE_FAILED,
            InvokeError::Release(_) => RELEASE_FAILED,
            InvokeError::Cancelled => CANCELLED,
        }
    }

    /// Returns a unique static string code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            InvokeError::Unclassifiable { .. } => "INVOKE_UNCLASSIFIABLE",
            InvokeError::UnsupportedShape { .. } => "INVOKE_UNSUPPORTED_SHAPE",
            InvokeError::OffloadExhausted { .. } => "INVOKE_OFFLOAD_EXHAUSTED",
            InvokeError::Callable(_) => "INVOKE_CALLABLE_FAILED",
            InvokeError::Release(_) => "INVOKE_RELEASE_FAILED",
            InvokeError::Cancelled => "INVOKE_CANCELLED",
        }
    }

    /// Whether this error signals a broken caller contract rather than a
    /// runtime condition.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            InvokeError::Unclassifiable { .. } | InvokeError::UnsupportedShape { .. }
        )
    }

    /// The user failure carried by this error, if any
    pub fn user_error(&self) -> Option<&CallableError> {
        match self {
            InvokeError::Callable(err) | InvokeError::Release(err) => Some(err.as_ref()),
            _ => None,
        }
    }

    /// Downcast the carried user failure to a concrete type
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.user_error().and_then(|err| err.downcast_ref::<E>())
    }

    /// True when both errors carry the very same user failure object
    pub fn same_failure(&self, other: &InvokeError) -> bool {
        match (self, other) {
            (InvokeError::Callable(a), InvokeError::Callable(b))
            | (InvokeError::Release(a), InvokeError::Release(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<CallableError> for InvokeError {
    fn from(err: CallableError) -> Self {
        InvokeError::callable(err)
    }
}

/// Convenient Result type for invocation operations
pub type InvokeResult<T> = Result<T, InvokeError>;
