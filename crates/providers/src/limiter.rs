use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use warden_core::error::Result;
use warden_core::providers::rate_limit::RateLimiter;
use warden_core::types::RateLimitResult;

/// Configuration for the sliding-window rate limiter.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Per-action limits in `N/window` form, e.g. `{"login": "5/min"}`
    pub default_limits: HashMap<String, String>,
    /// Limit applied to actions with no configured entry
    pub fallback_limit: String,
    /// Cap on distinct identifiers; past it, unseen identifiers are
    /// served fail-open
    pub max_tracked_identifiers: usize,
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default_limits: HashMap::new(),
            fallback_limit: "100/hour".to_string(),
            max_tracked_identifiers: 10_000,
            cleanup_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LimitSpec {
    limit: u32,
    window: Duration,
}

type ActionWindows = HashMap<String, VecDeque<DateTime<Utc>>>;

/// In-memory sliding-window rate limiter.
///
/// Each identifier owns a mutex over its per-action timestamp deques, so
/// check-and-consume is atomic per identifier while distinct identifiers
/// proceed in parallel. The limiter fails open: internal faults and the
/// identifier cap both yield an allowed result with a metadata flag
/// rather than locking callers out.
pub struct SlidingWindowRateLimiter {
    windows: DashMap<String, Arc<Mutex<ActionWindows>>>,
    config: RateLimiterConfig,
}

impl SlidingWindowRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            windows: DashMap::new(),
            config,
        }
    }

    pub fn from_config(value: &serde_json::Value) -> Result<Self> {
        let config: RateLimiterConfig = serde_json::from_value(value.clone())?;
        Ok(Self::new(config))
    }

    /// Parse `N/window`; window is sec|second|min|minute|hour|day,
    /// case-insensitive. Malformed limits fall back to 100/hour.
    fn parse_limit(raw: &str) -> Option<LimitSpec> {
        let (count, window) = raw.split_once('/')?;
        let limit: u32 = count.trim().parse().ok().filter(|n| *n > 0)?;
        let window = match window.trim().to_lowercase().as_str() {
            "sec" | "second" => Duration::seconds(1),
            "min" | "minute" => Duration::minutes(1),
            "hour" => Duration::hours(1),
            "day" => Duration::days(1),
            _ => return None,
        };
        Some(LimitSpec { limit, window })
    }

    fn spec_for(&self, action: &str) -> LimitSpec {
        let raw = self
            .config
            .default_limits
            .get(action)
            .unwrap_or(&self.config.fallback_limit);
        Self::parse_limit(raw).unwrap_or_else(|| {
            warn!(action = %action, limit = %raw, "Malformed rate limit; using 100/hour");
            LimitSpec {
                limit: 100,
                window: Duration::hours(1),
            }
        })
    }

    fn fail_open(&self, spec: LimitSpec, now: DateTime<Utc>, reason: &str) -> RateLimitResult {
        RateLimitResult {
            allowed: true,
            limit: spec.limit,
            remaining: spec.limit.saturating_sub(1),
            reset_time: now + spec.window,
            retry_after: None,
            metadata: HashMap::from([
                ("fallback".to_string(), serde_json::json!(true)),
                ("reason".to_string(), serde_json::json!(reason)),
            ]),
        }
    }

    /// The pop/len/push core, shared by `check` and `track`. `now` is
    /// injected so the window math is directly testable.
    async fn status_at(
        &self,
        identifier: &str,
        action: &str,
        consume: bool,
        now: DateTime<Utc>,
    ) -> RateLimitResult {
        let spec = self.spec_for(action);

        // Memory protection: past the cap, unseen identifiers are served
        // fail-open instead of allocating tracking state.
        if self.windows.len() >= self.config.max_tracked_identifiers
            && !self.windows.contains_key(identifier)
        {
            warn!(
                identifier = %identifier,
                tracked = self.windows.len(),
                "Rate limiter at identifier capacity; serving fail-open"
            );
            return self.fail_open(spec, now, "identifier_capacity");
        }

        let entry = self
            .windows
            .entry(identifier.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())))
            .clone();
        let mut actions = entry.lock().await;
        let timestamps = actions.entry(action.to_string()).or_default();

        let window_start = now - spec.window;
        while timestamps.front().is_some_and(|t| *t < window_start) {
            timestamps.pop_front();
        }

        let count = timestamps.len() as u32;
        let allowed = count < spec.limit;
        let consumed = if consume && allowed {
            timestamps.push_back(now);
            1
        } else {
            0
        };

        let reset_time = timestamps
            .front()
            .map(|front| *front + spec.window)
            .unwrap_or(now + spec.window);
        let retry_after = if allowed {
            None
        } else {
            timestamps.front().map(|front| {
                let millis = (*front + spec.window - now).num_milliseconds();
                (millis as f64 / 1000.0).ceil().max(1.0) as u64
            })
        };

        debug!(
            identifier = %identifier,
            action = %action,
            count = count,
            limit = spec.limit,
            allowed = allowed,
            "Rate limit decision"
        );

        RateLimitResult {
            allowed,
            limit: spec.limit,
            remaining: spec.limit.saturating_sub(count + consumed),
            reset_time,
            retry_after,
            metadata: HashMap::from([
                ("algorithm".to_string(), serde_json::json!("sliding_window")),
                ("current_count".to_string(), serde_json::json!(count + consumed)),
            ]),
        }
    }

    /// Drop empty deques and identifier entries.
    pub async fn cleanup(&self) -> u64 {
        let now = Utc::now();
        let identifiers: Vec<String> = self.windows.iter().map(|e| e.key().clone()).collect();
        let mut dropped = 0;

        for identifier in identifiers {
            let Some(entry) = self.windows.get(&identifier).map(|e| e.clone()) else {
                continue;
            };
            let mut actions = entry.lock().await;
            actions.retain(|action, timestamps| {
                let spec = self.spec_for(action);
                let window_start = now - spec.window;
                while timestamps.front().is_some_and(|t| *t < window_start) {
                    timestamps.pop_front();
                }
                !timestamps.is_empty()
            });
            let empty = actions.is_empty();
            drop(actions);
            if empty {
                self.windows.remove(&identifier);
                dropped += 1;
            }
        }
        dropped
    }

    /// Background cleanup at the configured cadence.
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = std::time::Duration::from_secs(limiter.config.cleanup_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let dropped = limiter.cleanup().await;
                if dropped > 0 {
                    debug!(dropped_identifiers = dropped, "Rate limiter cleanup completed");
                }
            }
        })
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowRateLimiter {
    async fn check(&self, identifier: &str, action: &str) -> Result<RateLimitResult> {
        Ok(self.status_at(identifier, action, false, Utc::now()).await)
    }

    async fn track(&self, identifier: &str, action: &str) -> Result<RateLimitResult> {
        Ok(self.status_at(identifier, action, true, Utc::now()).await)
    }

    async fn reset(&self, identifier: &str, action: Option<&str>) -> Result<()> {
        match action {
            Some(action) => {
                if let Some(entry) = self.windows.get(identifier).map(|e| e.clone()) {
                    entry.lock().await.remove(action);
                }
            }
            None => {
                self.windows.remove(identifier);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with(action: &str, limit: &str) -> SlidingWindowRateLimiter {
        SlidingWindowRateLimiter::new(RateLimiterConfig {
            default_limits: HashMap::from([(action.to_string(), limit.to_string())]),
            ..Default::default()
        })
    }

    #[test]
    fn test_parse_limit_grammar() {
        let spec = SlidingWindowRateLimiter::parse_limit("5/min").unwrap();
        assert_eq!(spec.limit, 5);
        assert_eq!(spec.window, Duration::minutes(1));

        let spec = SlidingWindowRateLimiter::parse_limit("100/HOUR").unwrap();
        assert_eq!(spec.window, Duration::hours(1));
        assert!(SlidingWindowRateLimiter::parse_limit("10/fortnight").is_none());
        assert!(SlidingWindowRateLimiter::parse_limit("0/min").is_none());
        assert!(SlidingWindowRateLimiter::parse_limit("ten/min").is_none());
        assert!(SlidingWindowRateLimiter::parse_limit("5").is_none());
    }

    #[tokio::test]
    async fn test_sliding_window_consumption() {
        let limiter = limiter_with("login", "3/min");
        let t0 = Utc::now();

        // Three tracked requests at t=0,1,2 are allowed with remaining 2,1,0
        for (offset, expected_remaining) in [(0, 2), (1, 1), (2, 0)] {
            let status = limiter
                .status_at("alice", "login", true, t0 + Duration::seconds(offset))
                .await;
            assert!(status.allowed, "request at t={} should pass", offset);
            assert_eq!(status.remaining, expected_remaining);
        }

        // The fourth at t=3 is denied with retry_after about 57 seconds
        let status = limiter
            .status_at("alice", "login", true, t0 + Duration::seconds(3))
            .await;
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);
        let retry_after = status.retry_after.unwrap();
        assert!((56..=58).contains(&retry_after), "retry_after = {}", retry_after);

        // At t=61 the t=0 timestamp has slid out
        let status = limiter
            .status_at("alice", "login", true, t0 + Duration::seconds(61))
            .await;
        assert!(status.allowed);
    }

    #[tokio::test]
    async fn test_exactly_n_allowed_within_window() {
        let limiter = limiter_with("login", "3/min");
        let t0 = Utc::now();
        for _ in 0..3 {
            assert!(limiter.status_at("alice", "login", true, t0).await.allowed);
        }
        assert!(!limiter.status_at("alice", "login", true, t0).await.allowed);
    }

    #[tokio::test]
    async fn test_check_does_not_consume() {
        let limiter = limiter_with("login", "2/min");
        let t0 = Utc::now();

        for _ in 0..5 {
            let status = limiter.status_at("alice", "login", false, t0).await;
            assert!(status.allowed);
            assert_eq!(status.remaining, 2);
        }
        // Consumption still has the full budget
        assert!(limiter.status_at("alice", "login", true, t0).await.allowed);
        assert!(limiter.status_at("alice", "login", true, t0).await.allowed);
        assert!(!limiter.status_at("alice", "login", true, t0).await.allowed);
    }

    #[tokio::test]
    async fn test_identifiers_are_independent() {
        let limiter = limiter_with("login", "1/min");
        let t0 = Utc::now();
        assert!(limiter.status_at("alice", "login", true, t0).await.allowed);
        assert!(!limiter.status_at("alice", "login", true, t0).await.allowed);
        assert!(limiter.status_at("bob", "login", true, t0).await.allowed);
    }

    #[tokio::test]
    async fn test_actions_are_independent() {
        let limiter = SlidingWindowRateLimiter::new(RateLimiterConfig {
            default_limits: HashMap::from([
                ("login".to_string(), "1/min".to_string()),
                ("reset".to_string(), "1/min".to_string()),
            ]),
            ..Default::default()
        });
        let t0 = Utc::now();
        assert!(limiter.status_at("alice", "login", true, t0).await.allowed);
        assert!(limiter.status_at("alice", "reset", true, t0).await.allowed);
        assert!(!limiter.status_at("alice", "login", true, t0).await.allowed);
    }

    #[tokio::test]
    async fn test_reset_clears_counters() {
        let limiter = limiter_with("login", "1/min");
        let t0 = Utc::now();
        assert!(limiter.status_at("alice", "login", true, t0).await.allowed);
        assert!(!limiter.status_at("alice", "login", true, t0).await.allowed);

        limiter.reset("alice", Some("login")).await.unwrap();
        assert!(limiter.status_at("alice", "login", true, t0).await.allowed);
    }

    #[tokio::test]
    async fn test_identifier_cap_fails_open() {
        let limiter = SlidingWindowRateLimiter::new(RateLimiterConfig {
            default_limits: HashMap::from([("login".to_string(), "1/min".to_string())]),
            max_tracked_identifiers: 2,
            ..Default::default()
        });
        let t0 = Utc::now();
        limiter.status_at("a", "login", true, t0).await;
        limiter.status_at("b", "login", true, t0).await;

        // A third identifier is allowed but flagged, and never tracked
        for _ in 0..5 {
            let status = limiter.status_at("c", "login", true, t0).await;
            assert!(status.allowed);
            assert_eq!(status.metadata.get("fallback"), Some(&serde_json::json!(true)));
        }
        // Known identifiers still enforce
        assert!(!limiter.status_at("a", "login", true, t0).await.allowed);
    }

    #[tokio::test]
    async fn test_malformed_limit_uses_safe_default() {
        let limiter = limiter_with("login", "not-a-limit");
        let t0 = Utc::now();
        let status = limiter.status_at("alice", "login", true, t0).await;
        assert!(status.allowed);
        assert_eq!(status.limit, 100);
    }

    #[tokio::test]
    async fn test_cleanup_drops_empty_entries() {
        let limiter = limiter_with("login", "3/sec");
        let past = Utc::now() - Duration::hours(1);
        limiter.status_at("alice", "login", true, past).await;
        assert_eq!(limiter.windows.len(), 1);

        assert_eq!(limiter.cleanup().await, 1);
        assert_eq!(limiter.windows.len(), 0);
    }

    #[tokio::test]
    async fn test_reset_time_tracks_oldest_timestamp() {
        let limiter = limiter_with("login", "2/min");
        let t0 = Utc::now();
        limiter.status_at("alice", "login", true, t0).await;
        let status = limiter
            .status_at("alice", "login", true, t0 + Duration::seconds(30))
            .await;
        assert_eq!(status.reset_time, t0 + Duration::minutes(1));
    }
}
