use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::identity::epoch_ms;
use crate::kv::{KvError, KvStore};

pub const SECURITY_EVENTS_KEY: &str = "gazorpazorp:security_events";
pub const THREAT_CHANNEL: &str = "gazorpazorp:threats";
pub const SECURITY_EVENTS_CAP: usize = 1000;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub ts: u64,
    pub kind: String,
    pub agent_id: Option<String>,
    pub fingerprint: Option<String>,
    pub method: String,
    pub path: String,
    pub risk_score: f64,
    pub threat_type: Option<String>,
    pub detail: String,
}

impl SecurityEvent {
    pub fn new(kind: &str, method: &str, path: &str) -> Self {
        Self {
            ts: epoch_ms(),
            kind: kind.to_string(),
            agent_id: None,
            fingerprint: None,
            method: method.to_string(),
            path: path.to_string(),
            risk_score: 0.0,
            threat_type: None,
            detail: String::new(),
        }
    }
}

/// Append-and-trim event list plus pub/sub fan-out feeding the dashboard's
/// threat stream.
#[derive(Clone)]
pub struct SecurityEventLog {
    kv: Arc<dyn KvStore>,
}

impl SecurityEventLog {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn record(&self, event: &SecurityEvent) -> Result<(), KvError> {
        let payload =
            serde_json::to_string(event).map_err(|err| KvError::Command(err.to_string()))?;
        self.kv
            .lpush_trim(SECURITY_EVENTS_KEY, &payload, SECURITY_EVENTS_CAP, None)
            .await?;
        self.kv.publish(THREAT_CHANNEL, &payload).await
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<SecurityEvent>, KvError> {
        let entries = self
            .kv
            .lrange(SECURITY_EVENTS_KEY, 0, limit.max(1) as isize - 1)
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| serde_json::from_str(&entry).ok())
            .collect())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.kv.subscribe(THREAT_CHANNEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;

    #[tokio::test]
    async fn record_appends_and_publishes() {
        let log = SecurityEventLog::new(InMemoryKv::shared());
        let mut receiver = log.subscribe();
        let mut event = SecurityEvent::new("deny", "POST", "/api/assistant");
        event.risk_score = 92.0;
        event.threat_type = Some("prompt_injection".to_string());
        log.record(&event).await.expect("record");

        let recent = log.recent(10).await.expect("recent");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, "deny");
        assert_eq!(recent[0].risk_score, 92.0);

        let published = receiver.try_recv().expect("published");
        assert!(published.contains("prompt_injection"));
    }

    #[tokio::test]
    async fn recent_returns_newest_first() {
        let log = SecurityEventLog::new(InMemoryKv::shared());
        for path in ["/a", "/b", "/c"] {
            log.record(&SecurityEvent::new("deny", "GET", path))
                .await
                .expect("record");
        }
        let recent = log.recent(2).await.expect("recent");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].path, "/c");
        assert_eq!(recent[1].path, "/b");
    }
}
