use std::sync::Arc;
use std::time::Duration;

use crate::kv::{KvError, KvStore};

#[derive(Clone, Debug)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_secs: u64,
}

/// Fixed-window counter keyed per agent. The counter key carries the window
/// as its TTL, so the window resets by expiry rather than by bookkeeping.
#[derive(Clone)]
pub struct KvRateLimiter {
    kv: Arc<dyn KvStore>,
}

impl KvRateLimiter {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn check(
        &self,
        agent_id: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<RateDecision, KvError> {
        let key = format!("ratelimit:{agent_id}");
        let count = self.kv.incr(&key, window).await?;
        if count <= max_requests as i64 {
            return Ok(RateDecision {
                allowed: true,
                remaining: max_requests.saturating_sub(count as u32),
                retry_after_secs: 0,
            });
        }
        let retry_after = self
            .kv
            .ttl(&key)
            .await?
            .map(|ttl| ttl.as_secs())
            .unwrap_or_else(|| window.as_secs());
        Ok(RateDecision {
            allowed: false,
            remaining: 0,
            retry_after_secs: retry_after.max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;

    #[tokio::test]
    async fn window_admits_up_to_max() {
        let limiter = KvRateLimiter::new(InMemoryKv::shared());
        let window = Duration::from_secs(60);
        for expected_remaining in (0..3).rev() {
            let decision = limiter.check("a1", 3, window).await.expect("check");
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }
        let decision = limiter.check("a1", 3, window).await.expect("check");
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.retry_after_secs >= 1);
    }

    #[tokio::test]
    async fn agents_have_independent_windows() {
        let limiter = KvRateLimiter::new(InMemoryKv::shared());
        let window = Duration::from_secs(60);
        assert!(limiter.check("a1", 1, window).await.expect("check").allowed);
        assert!(!limiter.check("a1", 1, window).await.expect("check").allowed);
        assert!(limiter.check("a2", 1, window).await.expect("check").allowed);
    }
}
