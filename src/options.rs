use crate::RetryPolicy;

/// Configures timeouts, concurrency, caching and retry behavior.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Per-attempt request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum number of requests in flight at once.
    pub max_concurrent: usize,
    /// Lifetime of cached ping responses in milliseconds.
    pub ping_cache_ttl_ms: u64,
    /// Backoff schedule for retryable failures.
    pub retry: RetryPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_concurrent: 10,
            ping_cache_ttl_ms: 30_000,
            retry: RetryPolicy::default(),
        }
    }
}
