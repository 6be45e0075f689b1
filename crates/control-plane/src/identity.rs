use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::kv::{KvError, KvStore};

pub const IDENTITY_TTL: Duration = Duration::from_secs(365 * 24 * 3600);
pub const REPUTATION_LOG_CAP: usize = 100;
const CAS_ATTEMPTS: usize = 5;

pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPermissions {
    pub allowed_endpoints: Vec<String>,
    pub denied_endpoints: Vec<String>,
    pub max_requests_per_minute: u32,
    pub max_payload_size: usize,
    pub allowed_methods: Vec<String>,
    pub sensitive_data_access: bool,
}

impl Default for AgentPermissions {
    fn default() -> Self {
        Self {
            allowed_endpoints: vec!["*".to_string()],
            denied_endpoints: Vec::new(),
            max_requests_per_minute: 60,
            max_payload_size: 1024 * 1024,
            allowed_methods: vec!["GET".to_string(), "POST".to_string()],
            sensitive_data_access: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSettings {
    pub window_ms: u64,
    pub max_requests: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 60,
        }
    }
}

/// A registered principal. The fingerprint (SHA-256 of the public-key bytes)
/// is the primary lookup key; reputation stays within [0, 100].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    pub id: String,
    pub public_key: String,
    pub fingerprint: String,
    pub registered_at: u64,
    pub last_seen: u64,
    pub reputation: f64,
    pub permissions: AgentPermissions,
    pub rate_limit: RateLimitSettings,
}

pub const INITIAL_REPUTATION: f64 = 50.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReputationBucket {
    Untrusted,
    Low,
    Medium,
    High,
    Trusted,
}

impl ReputationBucket {
    pub fn of(reputation: f64) -> Self {
        if reputation >= 90.0 {
            Self::Trusted
        } else if reputation >= 70.0 {
            Self::High
        } else if reputation >= 50.0 {
            Self::Medium
        } else if reputation >= 30.0 {
            Self::Low
        } else {
            Self::Untrusted
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Untrusted => "untrusted",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Trusted => "trusted",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationChange {
    pub ts: u64,
    pub old: f64,
    pub new: f64,
    pub delta: f64,
    pub reason: String,
}

fn identity_key(fingerprint: &str) -> String {
    format!("agent:identity:{fingerprint}")
}

fn reputation_log_key(fingerprint: &str) -> String {
    format!("agent:reputation_log:{fingerprint}")
}

fn clamp_reputation(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

/// Persists `AgentIdentity` records in the KV store. Reputation updates go
/// through a compare-and-swap loop so concurrent requests never lose a delta;
/// each applied change lands in a capped audit list.
#[derive(Clone)]
pub struct KvIdentityStore {
    kv: Arc<dyn KvStore>,
}

impl KvIdentityStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn put(&self, identity: &AgentIdentity) -> Result<(), KvError> {
        let payload = serde_json::to_string(identity)
            .map_err(|err| KvError::Command(err.to_string()))?;
        self.kv
            .set(&identity_key(&identity.fingerprint), &payload, Some(IDENTITY_TTL))
            .await
    }

    pub async fn get(&self, fingerprint: &str) -> Result<Option<AgentIdentity>, KvError> {
        let Some(raw) = self.kv.get(&identity_key(fingerprint)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| KvError::Command(err.to_string()))
    }

    pub async fn remove(&self, fingerprint: &str) -> Result<(), KvError> {
        self.kv.delete(&identity_key(fingerprint)).await?;
        self.kv.delete(&reputation_log_key(fingerprint)).await
    }

    /// Applies `delta` to the agent's reputation, clamped to [0, 100], and
    /// refreshes `last_seen`. Returns the new reputation, or `None` when no
    /// identity exists under the fingerprint.
    pub async fn adjust_reputation(
        &self,
        fingerprint: &str,
        delta: f64,
        reason: &str,
    ) -> Result<Option<f64>, KvError> {
        let key = identity_key(fingerprint);
        for _ in 0..CAS_ATTEMPTS {
            let Some(raw) = self.kv.get(&key).await? else {
                return Ok(None);
            };
            let mut identity: AgentIdentity = serde_json::from_str(&raw)
                .map_err(|err| KvError::Command(err.to_string()))?;
            let old = identity.reputation;
            let new = clamp_reputation(old + delta);
            identity.reputation = new;
            identity.last_seen = epoch_ms();
            let updated = serde_json::to_string(&identity)
                .map_err(|err| KvError::Command(err.to_string()))?;
            if self
                .kv
                .compare_and_swap(&key, Some(&raw), &updated, Some(IDENTITY_TTL))
                .await?
            {
                let change = ReputationChange {
                    ts: identity.last_seen,
                    old,
                    new,
                    delta,
                    reason: reason.to_string(),
                };
                let entry = serde_json::to_string(&change)
                    .map_err(|err| KvError::Command(err.to_string()))?;
                self.kv
                    .lpush_trim(
                        &reputation_log_key(fingerprint),
                        &entry,
                        REPUTATION_LOG_CAP,
                        Some(IDENTITY_TTL),
                    )
                    .await?;
                return Ok(Some(new));
            }
        }
        Err(KvError::Command(format!(
            "reputation update contention on {fingerprint}"
        )))
    }

    pub async fn reputation_log(
        &self,
        fingerprint: &str,
    ) -> Result<Vec<ReputationChange>, KvError> {
        let entries = self
            .kv
            .lrange(&reputation_log_key(fingerprint), 0, -1)
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| serde_json::from_str(&entry).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;

    fn sample_identity(fingerprint: &str) -> AgentIdentity {
        AgentIdentity {
            id: "agent_0001".to_string(),
            public_key: "pk".to_string(),
            fingerprint: fingerprint.to_string(),
            registered_at: epoch_ms(),
            last_seen: epoch_ms(),
            reputation: INITIAL_REPUTATION,
            permissions: AgentPermissions::default(),
            rate_limit: RateLimitSettings::default(),
        }
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let store = KvIdentityStore::new(InMemoryKv::shared());
        let identity = sample_identity("fp1");
        store.put(&identity).await.expect("put");
        let loaded = store.get("fp1").await.expect("get").expect("identity");
        assert_eq!(loaded, identity);
    }

    #[tokio::test]
    async fn reputation_clamps_at_bounds() {
        let store = KvIdentityStore::new(InMemoryKv::shared());
        store.put(&sample_identity("fp1")).await.expect("put");
        let new = store
            .adjust_reputation("fp1", 400.0, "test")
            .await
            .expect("adjust")
            .expect("present");
        assert_eq!(new, 100.0);
        let new = store
            .adjust_reputation("fp1", -500.0, "test")
            .await
            .expect("adjust")
            .expect("present");
        assert_eq!(new, 0.0);
    }

    #[tokio::test]
    async fn reputation_update_for_missing_agent_is_none() {
        let store = KvIdentityStore::new(InMemoryKv::shared());
        let result = store
            .adjust_reputation("nope", 1.0, "test")
            .await
            .expect("adjust");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn reputation_log_is_capped() {
        let store = KvIdentityStore::new(InMemoryKv::shared());
        store.put(&sample_identity("fp1")).await.expect("put");
        for _ in 0..(REPUTATION_LOG_CAP + 20) {
            store
                .adjust_reputation("fp1", 0.1, "drift")
                .await
                .expect("adjust");
        }
        let log = store.reputation_log("fp1").await.expect("log");
        assert_eq!(log.len(), REPUTATION_LOG_CAP);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_preserve_every_delta() {
        let store = KvIdentityStore::new(InMemoryKv::shared());
        store.put(&sample_identity("fp1")).await.expect("put");
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    loop {
                        match store.adjust_reputation("fp1", 0.1, "drift").await {
                            Ok(_) => break,
                            Err(KvError::Command(_)) => continue,
                            Err(err) => panic!("unexpected error: {err}"),
                        }
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }
        let identity = store.get("fp1").await.expect("get").expect("identity");
        assert!((identity.reputation - 70.0).abs() < 1e-6);
    }

    #[test]
    fn bucket_thresholds() {
        assert_eq!(ReputationBucket::of(95.0), ReputationBucket::Trusted);
        assert_eq!(ReputationBucket::of(90.0), ReputationBucket::Trusted);
        assert_eq!(ReputationBucket::of(89.9), ReputationBucket::High);
        assert_eq!(ReputationBucket::of(70.0), ReputationBucket::High);
        assert_eq!(ReputationBucket::of(50.0), ReputationBucket::Medium);
        assert_eq!(ReputationBucket::of(30.0), ReputationBucket::Low);
        assert_eq!(ReputationBucket::of(29.9), ReputationBucket::Untrusted);
    }
}
