use thiserror::Error;

/// Errors surfaced by [`RateGate`](crate::RateGate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The gate was constructed with a zero execution limit.
    #[error("limit must be at least 1")]
    InvalidConfiguration,

    /// A pending acquisition's cancellation token fired before it was granted.
    #[error("acquisition cancelled while waiting for admission")]
    Cancelled,
}
