use thiserror::Error;

/// Configuration faults raised synchronously by constructors and setters.
/// The prior policy is always left untouched when a setter returns one.
#[derive(Debug, Error)]
pub enum ShieldError {
    #[error("unknown algorithm kind: {0:?}")]
    UnknownKind(String),

    #[error("limit must be at least 1")]
    InvalidLimit,

    #[error("window must be at least 1 second")]
    InvalidWindow,

    #[error("metrics retention ({retention}s) must be at least the monitor interval ({interval}s)")]
    RetentionTooShort { retention: u64, interval: u64 },

    #[error("config error: {0}")]
    Config(String),
}

/// Carried by [`crate::shield::Shield::admit_or_reject`] when a request is
/// rejected. `retry_after` is `min(window, 60)` seconds from the resolved
/// policy, the value HTTP adapters put in `Retry-After`.
#[derive(Debug, Error)]
#[error(
    "rate limit exceeded for client {client} on route {route}",
    client = .client_id,
    route = .route.as_deref().unwrap_or("-")
)]
pub struct RateLimitExceeded {
    pub client_id: String,
    pub route: Option<String>,
    pub retry_after: u64,
}
