// Error handling traits

use crate::InvokeError;

/// Trait for error types that support retries
///
/// The bridge itself never retries; callers use this to decide whether
/// backpressure or a retry policy applies.
pub trait Retryable {
    /// Check if the error is retryable
    fn is_retryable(&self) -> bool;

    /// Get the recommended retry delay (if any)
    fn retry_after(&self) -> Option<std::time::Duration>;
}

impl Retryable for InvokeError {
    fn is_retryable(&self) -> bool {
        matches!(self, InvokeError::OffloadExhausted { .. })
    }

    fn retry_after(&self) -> Option<std::time::Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_exhaustion_is_retryable() {
        let exhausted = InvokeError::OffloadExhausted {
            segment: "general",
            workers: 1,
            queued: 0,
        };
        assert!(exhausted.is_retryable());
        assert!(!InvokeError::Cancelled.is_retryable());
        assert!(!InvokeError::callable(anyhow::anyhow!("boom")).is_retryable());
        assert_eq!(exhausted.retry_after(), None);
    }
}
