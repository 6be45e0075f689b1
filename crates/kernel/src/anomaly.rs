use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use control_plane::{epoch_ms, KvError, KvStore};
use serde::{Deserialize, Serialize};

use crate::types::SignedRequest;

pub const PROFILE_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
pub const HISTORY_CAP: usize = 100;
const RECENT_WINDOW_MS: u64 = 5 * 60 * 1000;

/// Behavioral baseline for one agent. Payload-size spread is tracked with
/// Welford's online algorithm (`m2` is the running sum of squared deviations).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub typical_active_hours: BTreeSet<u8>,
    pub common_paths: HashMap<String, u64>,
    pub request_methods: HashMap<String, u64>,
    pub avg_payload_size: f64,
    pub m2_payload_size: f64,
    pub payload_samples: u64,
    pub avg_requests_per_hour: f64,
    pub avg_time_between_requests: f64,
    pub last_updated: u64,
}

impl AgentProfile {
    pub fn std_payload_size(&self) -> f64 {
        if self.payload_samples < 2 {
            0.0
        } else {
            (self.m2_payload_size / self.payload_samples as f64).sqrt()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub ts: u64,
    pub method: String,
    pub path: String,
}

#[derive(Clone, Debug)]
pub struct AnomalyReport {
    pub is_anomalous: bool,
    pub score: f64,
    pub reasons: Vec<String>,
}

fn profile_key(agent_id: &str) -> String {
    format!("profile:{agent_id}")
}

fn history_key(agent_id: &str) -> String {
    format!("agent:{agent_id}:history")
}

fn hour_of(timestamp_ms: u64) -> u8 {
    ((timestamp_ms / 3_600_000) % 24) as u8
}

/// Maintains per-agent profiles and scores each request against the baseline
/// built from earlier traffic. The pipeline scores first, then folds the
/// request into the profile, so a request is never compared against itself.
#[derive(Clone)]
pub struct AnomalyDetector {
    kv: Arc<dyn KvStore>,
}

impl AnomalyDetector {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn profile(&self, agent_id: &str) -> Result<Option<AgentProfile>, KvError> {
        let Some(raw) = self.kv.get(&profile_key(agent_id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| KvError::Command(err.to_string()))
    }

    pub async fn history(&self, agent_id: &str) -> Result<Vec<HistoryEntry>, KvError> {
        let entries = self.kv.lrange(&history_key(agent_id), 0, -1).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| serde_json::from_str(&entry).ok())
            .collect())
    }

    /// Folds one observed request into the profile. Every forwarded request
    /// passes through here exactly once.
    pub async fn update_profile(
        &self,
        agent_id: &str,
        signed: &SignedRequest,
        payload_size: usize,
    ) -> Result<(), KvError> {
        let entry = HistoryEntry {
            ts: signed.timestamp,
            method: signed.method.clone(),
            path: signed.path.clone(),
        };
        let payload =
            serde_json::to_string(&entry).map_err(|err| KvError::Command(err.to_string()))?;
        self.kv
            .lpush_trim(&history_key(agent_id), &payload, HISTORY_CAP, Some(PROFILE_TTL))
            .await?;

        let mut profile = self.profile(agent_id).await?.unwrap_or_default();
        profile
            .typical_active_hours
            .insert(hour_of(signed.timestamp));
        *profile
            .common_paths
            .entry(signed.path.clone())
            .or_insert(0) += 1;
        *profile
            .request_methods
            .entry(signed.method.clone())
            .or_insert(0) += 1;

        let size = payload_size as f64;
        profile.payload_samples += 1;
        let delta = size - profile.avg_payload_size;
        profile.avg_payload_size += delta / profile.payload_samples as f64;
        profile.m2_payload_size += delta * (size - profile.avg_payload_size);

        let history = self.history(agent_id).await?;
        if history.len() >= 2 {
            let newest = history.first().map(|entry| entry.ts).unwrap_or(0);
            let oldest = history.last().map(|entry| entry.ts).unwrap_or(0);
            let span_ms = newest.saturating_sub(oldest);
            if span_ms > 0 {
                profile.avg_requests_per_hour =
                    history.len() as f64 / (span_ms as f64 / 3_600_000.0);
                profile.avg_time_between_requests =
                    span_ms as f64 / (history.len() as f64 - 1.0);
            }
        }
        profile.last_updated = epoch_ms();

        let payload =
            serde_json::to_string(&profile).map_err(|err| KvError::Command(err.to_string()))?;
        self.kv
            .set(&profile_key(agent_id), &payload, Some(PROFILE_TTL))
            .await
    }

    pub async fn detect(
        &self,
        agent_id: &str,
        signed: &SignedRequest,
        payload_size: usize,
    ) -> Result<AnomalyReport, KvError> {
        let Some(profile) = self.profile(agent_id).await? else {
            return Ok(AnomalyReport {
                is_anomalous: false,
                score: 0.0,
                reasons: vec!["no baseline".to_string()],
            });
        };

        let mut score = 0.0;
        let mut reasons = Vec::new();

        let hour = hour_of(signed.timestamp);
        if !profile.typical_active_hours.contains(&hour) {
            score += 0.3;
            reasons.push(format!("unusual hour {hour:02}:00"));
        }

        let total_paths: u64 = profile.common_paths.values().sum();
        if total_paths > 0 {
            let count = profile.common_paths.get(&signed.path).copied().unwrap_or(0);
            if (count as f64) / (total_paths as f64) < 0.05 {
                score += 0.4;
                reasons.push(format!("rare path {}", signed.path));
            }
        }

        if profile.payload_samples >= 2 {
            let std = profile.std_payload_size().max(1.0);
            let z = (payload_size as f64 - profile.avg_payload_size).abs() / std;
            if z > 3.0 {
                score += (z / 10.0).min(0.5);
                reasons.push(format!("payload size outlier (z={z:.1})"));
            }
        }

        if profile.avg_requests_per_hour > 0.0 {
            let cutoff = signed.timestamp.saturating_sub(RECENT_WINDOW_MS);
            let recent = self
                .history(agent_id)
                .await?
                .iter()
                .filter(|entry| entry.ts >= cutoff)
                .count();
            if recent as f64 > 3.0 * profile.avg_requests_per_hour {
                score += 0.6;
                reasons.push(format!("request rate spike ({recent} in 5m)"));
            }
        }

        let total_methods: u64 = profile.request_methods.values().sum();
        if total_methods > 0 {
            let count = profile
                .request_methods
                .get(&signed.method)
                .copied()
                .unwrap_or(0);
            if count > 0 && (count as f64) / (total_methods as f64) < 0.1 {
                score += 0.25;
                reasons.push(format!("rare method {}", signed.method));
            }
        }

        let score = score.min(1.0_f64);
        Ok(AnomalyReport {
            is_anomalous: score > 0.5,
            score,
            reasons,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use control_plane::InMemoryKv;
    use serde_json::json;

    fn request(method: &str, path: &str, timestamp: u64) -> SignedRequest {
        SignedRequest {
            method: method.to_string(),
            path: path.to_string(),
            body: json!({}),
            timestamp,
            nonce: "n".to_string(),
        }
    }

    // Midday baseline: GET /api/users every minute.
    async fn build_baseline(detector: &AnomalyDetector, agent_id: &str, count: u64) {
        let noon = 1_700_000_000_000u64 - (1_700_000_000_000u64 % 86_400_000) + 12 * 3_600_000;
        for index in 0..count {
            let request = request("GET", "/api/users", noon + index * 60_000);
            detector
                .update_profile(agent_id, &request, 200)
                .await
                .expect("update");
        }
    }

    #[tokio::test]
    async fn no_baseline_is_never_anomalous() {
        let detector = AnomalyDetector::new(InMemoryKv::shared());
        let report = detector
            .detect("agent_1", &request("GET", "/api/users", epoch_ms()), 100)
            .await
            .expect("detect");
        assert!(!report.is_anomalous);
        assert_eq!(report.score, 0.0);
        assert_eq!(report.reasons, vec!["no baseline"]);
    }

    #[tokio::test]
    async fn baseline_traffic_scores_low() {
        let detector = AnomalyDetector::new(InMemoryKv::shared());
        build_baseline(&detector, "agent_1", 20).await;
        let noon = 1_700_000_000_000u64 - (1_700_000_000_000u64 % 86_400_000) + 12 * 3_600_000;
        let report = detector
            .detect("agent_1", &request("GET", "/api/users", noon + 3_600_000), 200)
            .await
            .expect("detect");
        assert!(!report.is_anomalous, "reasons: {:?}", report.reasons);
    }

    #[tokio::test]
    async fn night_admin_delete_is_anomalous() {
        let detector = AnomalyDetector::new(InMemoryKv::shared());
        build_baseline(&detector, "agent_1", 20).await;
        let midnight = 1_700_000_000_000u64 - (1_700_000_000_000u64 % 86_400_000);
        let attack = request("DELETE", "/api/admin/export", midnight + 3 * 3_600_000);
        let report = detector
            .detect("agent_1", &attack, 200)
            .await
            .expect("detect");
        assert!(report.is_anomalous, "reasons: {:?}", report.reasons);
        assert!(report.score > 0.5);
        // Unusual hour fires together with the never-seen path.
        assert!(report.reasons.iter().any(|reason| reason.contains("hour")));
        assert!(report.reasons.iter().any(|reason| reason.contains("path")));
    }

    #[tokio::test]
    async fn payload_outlier_fires_on_large_deviation() {
        let detector = AnomalyDetector::new(InMemoryKv::shared());
        let noon = 1_700_000_000_000u64 - (1_700_000_000_000u64 % 86_400_000) + 12 * 3_600_000;
        for index in 0..30u64 {
            let mut request = request("POST", "/api/ingest", noon + index * 60_000);
            request.body = json!({"i": index});
            let size = if index % 2 == 0 { 190 } else { 210 };
            detector
                .update_profile("agent_1", &request, size)
                .await
                .expect("update");
        }
        let probe = request("POST", "/api/ingest", noon + 31 * 60_000);
        let report = detector
            .detect("agent_1", &probe, 100_000)
            .await
            .expect("detect");
        assert!(report
            .reasons
            .iter()
            .any(|reason| reason.contains("payload size outlier")));
        // The outlier contribution alone is capped at 0.5.
        assert!(report.score <= 1.0);
    }

    #[tokio::test]
    async fn rate_spike_fires_against_slow_baseline() {
        let detector = AnomalyDetector::new(InMemoryKv::shared());
        let noon = 1_700_000_000_000u64 - (1_700_000_000_000u64 % 86_400_000) + 12 * 3_600_000;
        // One request an hour for ten hours.
        for index in 0..10u64 {
            detector
                .update_profile("agent_1", &request("GET", "/api/users", noon + index * 3_600_000), 200)
                .await
                .expect("update");
        }
        let burst_start = noon + 10 * 3_600_000;
        for index in 0..10u64 {
            detector
                .update_profile("agent_1", &request("GET", "/api/users", burst_start + index * 1_000), 200)
                .await
                .expect("update");
        }
        let probe = request("GET", "/api/users", burst_start + 11_000);
        let report = detector
            .detect("agent_1", &probe, 200)
            .await
            .expect("detect");
        assert!(report
            .reasons
            .iter()
            .any(|reason| reason.contains("rate spike")));
    }

    #[tokio::test]
    async fn rare_method_fires_only_when_seen_before() {
        let detector = AnomalyDetector::new(InMemoryKv::shared());
        build_baseline(&detector, "agent_1", 20).await;
        let noon = 1_700_000_000_000u64 - (1_700_000_000_000u64 % 86_400_000) + 12 * 3_600_000;
        // One DELETE among twenty GETs, then another DELETE.
        detector
            .update_profile("agent_1", &request("DELETE", "/api/users", noon + 21 * 60_000), 200)
            .await
            .expect("update");
        let probe = request("DELETE", "/api/users", noon + 22 * 60_000);
        let report = detector
            .detect("agent_1", &probe, 200)
            .await
            .expect("detect");
        assert!(report
            .reasons
            .iter()
            .any(|reason| reason.contains("rare method")));
    }

    #[tokio::test]
    async fn welford_tracks_mean_and_spread() {
        let detector = AnomalyDetector::new(InMemoryKv::shared());
        let noon = 1_700_000_000_000u64 - (1_700_000_000_000u64 % 86_400_000) + 12 * 3_600_000;
        for (index, size) in [100usize, 200, 300].into_iter().enumerate() {
            detector
                .update_profile("agent_1", &request("GET", "/a", noon + index as u64 * 1_000), size)
                .await
                .expect("update");
        }
        let profile = detector
            .profile("agent_1")
            .await
            .expect("get")
            .expect("profile");
        assert!((profile.avg_payload_size - 200.0).abs() < 1e-9);
        // Population variance of {100,200,300} is 6666.7.
        assert!((profile.std_payload_size() - 6_666.666_666_f64.sqrt()).abs() < 1e-6);
    }
}
