use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use control_plane::{KvStore, ReputationBucket};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::AnalysisResult;

pub const ANALYSIS_TTL: Duration = Duration::from_secs(30 * 60);
const KEY_PREFIX: &str = "analysis:";

#[derive(Clone, Copy, Debug, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub hit_rate: f64,
}

/// Memoizes analysis verdicts keyed by method, normalized path, body hash,
/// and the agent's reputation bucket. The bucket in the key keeps a verdict
/// cached for a trusted agent from ever answering for an untrusted one.
#[derive(Clone)]
pub struct AnalysisCache {
    kv: Arc<dyn KvStore>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    sets: Arc<AtomicU64>,
    uuid_segments: Arc<Regex>,
    numeric_segments: Arc<Regex>,
}

impl AnalysisCache {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            sets: Arc::new(AtomicU64::new(0)),
            uuid_segments: Arc::new(
                Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
                    .expect("uuid regex"),
            ),
            numeric_segments: Arc::new(Regex::new(r"/\d+").expect("numeric segment regex")),
        }
    }

    pub async fn get(
        &self,
        method: &str,
        path: &str,
        body: &Value,
        bucket: ReputationBucket,
    ) -> Option<AnalysisResult> {
        let key = self.cache_key(method, path, body, bucket);
        match self.kv.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(result) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Some(result)
                }
                Err(_) => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn put(
        &self,
        method: &str,
        path: &str,
        body: &Value,
        bucket: ReputationBucket,
        result: &AnalysisResult,
    ) {
        let key = self.cache_key(method, path, body, bucket);
        if let Ok(payload) = serde_json::to_string(result) {
            if self.kv.set(&key, &payload, Some(ANALYSIS_TTL)).await.is_ok() {
                self.sets.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Deletes every cached verdict. Iterates with a cursor scan; a blocking
    /// full-keyspace listing is never issued.
    pub async fn invalidate_all(&self) -> usize {
        let Ok(keys) = self.kv.scan_prefix(KEY_PREFIX).await else {
            return 0;
        };
        let mut removed = 0;
        for key in keys {
            if self.kv.delete(&key).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    /// UUID segments collapse before numeric segments; UUIDs contain digits,
    /// so the other order would mangle them.
    pub fn normalize_path(&self, path: &str) -> String {
        let pass = self.uuid_segments.replace_all(path, ":uuid");
        self.numeric_segments.replace_all(&pass, "/:id").to_string()
    }

    fn cache_key(
        &self,
        method: &str,
        path: &str,
        body: &Value,
        bucket: ReputationBucket,
    ) -> String {
        let body_canonical = serde_json::to_string(body).unwrap_or_default();
        let body_hash = hex::encode(Sha256::digest(body_canonical.as_bytes()));
        let mut hasher = Sha256::new();
        hasher.update(method.as_bytes());
        hasher.update(self.normalize_path(path).as_bytes());
        hasher.update(body_hash.as_bytes());
        hasher.update(bucket.as_str().as_bytes());
        format!("{KEY_PREFIX}{}", hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SuggestedAction, ThreatType};
    use control_plane::InMemoryKv;
    use serde_json::json;

    fn sample_result(risk: f64) -> AnalysisResult {
        AnalysisResult {
            is_malicious: false,
            confidence: 0.9,
            threat_type: ThreatType::None,
            explanation: "clean".to_string(),
            suggested_action: SuggestedAction::Allow,
            risk_score: risk,
        }
    }

    #[test]
    fn uuid_segments_normalize_before_numeric() {
        let cache = AnalysisCache::new(InMemoryKv::shared());
        assert_eq!(
            cache.normalize_path("/api/users/550e8400-e29b-41d4-a716-446655440000/orders/42"),
            "/api/users/:uuid/orders/:id"
        );
        assert_eq!(cache.normalize_path("/api/users/123"), "/api/users/:id");
        assert_eq!(cache.normalize_path("/api/health"), "/api/health");
    }

    #[tokio::test]
    async fn equivalent_requests_hit() {
        let cache = AnalysisCache::new(InMemoryKv::shared());
        let body = json!({"q": "hello"});
        cache
            .put(
                "GET",
                "/api/users/123",
                &body,
                ReputationBucket::Medium,
                &sample_result(5.0),
            )
            .await;
        let hit = cache
            .get("GET", "/api/users/456", &body, ReputationBucket::Medium)
            .await
            .expect("hit via normalized path");
        assert_eq!(hit.risk_score, 5.0);
    }

    #[tokio::test]
    async fn buckets_partition_the_cache() {
        let cache = AnalysisCache::new(InMemoryKv::shared());
        let body = json!({"q": "hello"});
        cache
            .put(
                "GET",
                "/api/users",
                &body,
                ReputationBucket::Trusted,
                &sample_result(5.0),
            )
            .await;
        assert!(cache
            .get("GET", "/api/users", &body, ReputationBucket::Untrusted)
            .await
            .is_none());
        assert!(cache
            .get("GET", "/api/users", &body, ReputationBucket::Trusted)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn body_changes_miss() {
        let cache = AnalysisCache::new(InMemoryKv::shared());
        cache
            .put(
                "POST",
                "/api/assistant",
                &json!({"q": "a"}),
                ReputationBucket::Medium,
                &sample_result(5.0),
            )
            .await;
        assert!(cache
            .get(
                "POST",
                "/api/assistant",
                &json!({"q": "b"}),
                ReputationBucket::Medium
            )
            .await
            .is_none());
    }

    #[tokio::test]
    async fn stats_track_hits_misses_sets() {
        let cache = AnalysisCache::new(InMemoryKv::shared());
        let body = json!({});
        assert!(cache
            .get("GET", "/a", &body, ReputationBucket::Medium)
            .await
            .is_none());
        cache
            .put("GET", "/a", &body, ReputationBucket::Medium, &sample_result(1.0))
            .await;
        assert!(cache
            .get("GET", "/a", &body, ReputationBucket::Medium)
            .await
            .is_some());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn invalidate_all_clears_only_analysis_keys() {
        let kv = InMemoryKv::shared();
        let cache = AnalysisCache::new(kv.clone());
        let body = json!({});
        cache
            .put("GET", "/a", &body, ReputationBucket::Medium, &sample_result(1.0))
            .await;
        cache
            .put("GET", "/b", &body, ReputationBucket::Medium, &sample_result(2.0))
            .await;
        kv.set("profile:agent_1", "{}", None).await.expect("set");
        let removed = cache.invalidate_all().await;
        assert_eq!(removed, 2);
        assert!(kv.get("profile:agent_1").await.expect("get").is_some());
        assert!(cache
            .get("GET", "/a", &body, ReputationBucket::Medium)
            .await
            .is_none());
    }
}
