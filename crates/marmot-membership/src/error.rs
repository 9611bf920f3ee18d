use thiserror::Error;

/// Returned by the non-blocking enqueue API; per spec.md 4.F, a saturated
/// queue is not fatal — the caller (typically the reconciler) sleeps and
/// resumes where it left off.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("membership work queue is full")]
    QueueFull,
    #[error("membership service has shut down")]
    Closed,
}
