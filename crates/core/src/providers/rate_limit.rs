use crate::error::Result;
use crate::types::RateLimitResult;
use async_trait::async_trait;

/// Sliding-window request limiting per (identifier, action) pair.
///
/// `track` is atomic: the window prune, the limit check and the
/// consumption happen under one per-identifier critical section. On
/// internal error implementations fail open, returning allowed with a
/// metadata flag, so a limiter fault never locks users out.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Current status without consuming a request.
    async fn check(&self, identifier: &str, action: &str) -> Result<RateLimitResult>;

    /// Atomically consume a request if the limit allows and return the
    /// post-update status.
    async fn track(&self, identifier: &str, action: &str) -> Result<RateLimitResult>;

    /// Clear counters for an identifier, or only one action's counters
    /// when given.
    async fn reset(&self, identifier: &str, action: Option<&str>) -> Result<()>;
}
