use std::sync::Arc;
use std::time::Duration;

use control_plane::{epoch_ms, KvError, KvStore};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CHALLENGE_TTL: Duration = Duration::from_secs(300);
pub const COMPLETED_RETENTION: Duration = Duration::from_secs(60);
pub const PENDING_CAP: i64 = 5;
const PENDING_COUNTER_TTL: Duration = Duration::from_secs(3600);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeType {
    ProofOfWork,
    SignatureRefresh,
    RateDelay,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub id: String,
    pub agent_id: String,
    #[serde(rename = "type")]
    pub challenge_type: ChallengeType,
    pub created_at: u64,
    pub expires_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub completed: bool,
}

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("too many pending challenges")]
    TooManyPending,
    #[error("challenge not found")]
    NotFound,
    #[error("challenge failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Kv(#[from] KvError),
}

fn challenge_key(id: &str) -> String {
    format!("challenge:{id}")
}

fn pending_key(agent_id: &str) -> String {
    format!("challenges:count:{agent_id}")
}

fn random_hex(bytes: usize) -> String {
    let mut buffer = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buffer);
    hex::encode(buffer)
}

/// Issues and verifies the escalation work items the policy engine can demand
/// instead of an outright deny.
#[derive(Clone)]
pub struct ChallengeService {
    kv: Arc<dyn KvStore>,
}

impl ChallengeService {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn issue(&self, agent_id: &str, risk: f64) -> Result<Challenge, ChallengeError> {
        let pending = self
            .kv
            .incr(&pending_key(agent_id), PENDING_COUNTER_TTL)
            .await?;
        if pending > PENDING_CAP {
            let _ = self.kv.decr(&pending_key(agent_id)).await;
            return Err(ChallengeError::TooManyPending);
        }

        let challenge_type = select_type(risk);
        let now = epoch_ms();
        let challenge = Challenge {
            id: random_hex(16),
            agent_id: agent_id.to_string(),
            challenge_type,
            created_at: now,
            expires_at: now + CHALLENGE_TTL.as_millis() as u64,
            difficulty: match challenge_type {
                ChallengeType::ProofOfWork => Some(difficulty_for(risk)),
                _ => None,
            },
            nonce: match challenge_type {
                ChallengeType::SignatureRefresh => Some(random_hex(16)),
                _ => None,
            },
            completed: false,
        };
        self.store(&challenge, CHALLENGE_TTL).await?;
        Ok(challenge)
    }

    pub async fn verify(
        &self,
        challenge_id: &str,
        solution: &str,
    ) -> Result<Challenge, ChallengeError> {
        let Some(raw) = self.kv.get(&challenge_key(challenge_id)).await? else {
            return Err(ChallengeError::NotFound);
        };
        let mut challenge: Challenge =
            serde_json::from_str(&raw).map_err(|err| KvError::Command(err.to_string()))?;
        if challenge.completed {
            return Ok(challenge);
        }

        let solved = match challenge.challenge_type {
            ChallengeType::ProofOfWork => {
                let difficulty = challenge.difficulty.unwrap_or(2) as usize;
                let digest = Sha256::digest(format!("{}{solution}", challenge.id).as_bytes());
                hex::encode(digest).starts_with(&"0".repeat(difficulty))
            }
            // The full flow re-signs the nonce and re-enters cryptographic
            // verification; the accepted proof here is nonce possession.
            ChallengeType::SignatureRefresh => challenge
                .nonce
                .as_deref()
                .map(|nonce| solution.contains(nonce))
                .unwrap_or(false),
            ChallengeType::RateDelay => solution == challenge.id,
        };
        if !solved {
            return Err(ChallengeError::Failed(format!(
                "{:?} solution rejected",
                challenge.challenge_type
            )));
        }

        challenge.completed = true;
        self.store(&challenge, COMPLETED_RETENTION).await?;
        let _ = self.kv.decr(&pending_key(&challenge.agent_id)).await;
        Ok(challenge)
    }

    /// Looks up a challenge that has already been completed; the pipeline
    /// uses this for the `X-Challenge-Id` short-circuit.
    pub async fn completed(
        &self,
        challenge_id: &str,
    ) -> Result<Option<Challenge>, ChallengeError> {
        let Some(raw) = self.kv.get(&challenge_key(challenge_id)).await? else {
            return Ok(None);
        };
        let challenge: Challenge =
            serde_json::from_str(&raw).map_err(|err| KvError::Command(err.to_string()))?;
        Ok(challenge.completed.then_some(challenge))
    }

    async fn store(&self, challenge: &Challenge, ttl: Duration) -> Result<(), KvError> {
        let payload =
            serde_json::to_string(challenge).map_err(|err| KvError::Command(err.to_string()))?;
        self.kv
            .set(&challenge_key(&challenge.id), &payload, Some(ttl))
            .await
    }
}

fn select_type(risk: f64) -> ChallengeType {
    if risk >= 80.0 {
        ChallengeType::ProofOfWork
    } else if risk >= 60.0 {
        ChallengeType::SignatureRefresh
    } else {
        ChallengeType::RateDelay
    }
}

/// Leading zero hex chars required of the PoW digest, two to five.
fn difficulty_for(risk: f64) -> u32 {
    ((risk / 20.0).floor() as u32).clamp(2, 5)
}

/// Brute-forces a proof-of-work solution. Lives here for tests and client
/// tooling; the gateway itself only verifies.
pub fn solve_proof_of_work(challenge_id: &str, difficulty: u32) -> String {
    let prefix = "0".repeat(difficulty as usize);
    let mut counter: u64 = 0;
    loop {
        let candidate = counter.to_string();
        let digest = Sha256::digest(format!("{challenge_id}{candidate}").as_bytes());
        if hex::encode(digest).starts_with(&prefix) {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use control_plane::InMemoryKv;

    fn service() -> ChallengeService {
        ChallengeService::new(InMemoryKv::shared())
    }

    #[test]
    fn type_selection_follows_risk() {
        assert_eq!(select_type(85.0), ChallengeType::ProofOfWork);
        assert_eq!(select_type(80.0), ChallengeType::ProofOfWork);
        assert_eq!(select_type(70.0), ChallengeType::SignatureRefresh);
        assert_eq!(select_type(60.0), ChallengeType::SignatureRefresh);
        assert_eq!(select_type(55.0), ChallengeType::RateDelay);
    }

    #[test]
    fn difficulty_is_clamped() {
        assert_eq!(difficulty_for(10.0), 2);
        assert_eq!(difficulty_for(60.0), 3);
        assert_eq!(difficulty_for(70.0), 3);
        assert_eq!(difficulty_for(80.0), 4);
        assert_eq!(difficulty_for(100.0), 5);
    }

    #[tokio::test]
    async fn proof_of_work_roundtrip() {
        let service = service();
        let challenge = service.issue("agent_1", 85.0).await.expect("issue");
        assert_eq!(challenge.challenge_type, ChallengeType::ProofOfWork);
        let difficulty = challenge.difficulty.expect("difficulty");

        let err = service
            .verify(&challenge.id, "definitely-wrong")
            .await
            .expect_err("bad solution");
        assert!(matches!(err, ChallengeError::Failed(_)));

        let solution = solve_proof_of_work(&challenge.id, difficulty);
        let verified = service
            .verify(&challenge.id, &solution)
            .await
            .expect("verify");
        assert!(verified.completed);
        assert!(service
            .completed(&challenge.id)
            .await
            .expect("lookup")
            .is_some());
    }

    #[tokio::test]
    async fn signature_refresh_requires_nonce() {
        let service = service();
        let challenge = service.issue("agent_1", 65.0).await.expect("issue");
        assert_eq!(challenge.challenge_type, ChallengeType::SignatureRefresh);
        let nonce = challenge.nonce.clone().expect("nonce");

        assert!(service.verify(&challenge.id, "unrelated").await.is_err());
        let verified = service
            .verify(&challenge.id, &format!("signed:{nonce}"))
            .await
            .expect("verify");
        assert!(verified.completed);
    }

    #[tokio::test]
    async fn rate_delay_echoes_the_id() {
        let service = service();
        let challenge = service.issue("agent_1", 55.0).await.expect("issue");
        assert_eq!(challenge.challenge_type, ChallengeType::RateDelay);

        assert!(service.verify(&challenge.id, "other").await.is_err());
        let verified = service
            .verify(&challenge.id, &challenge.id)
            .await
            .expect("verify");
        assert!(verified.completed);
    }

    #[tokio::test]
    async fn pending_cap_is_enforced_per_agent() {
        let service = service();
        for _ in 0..PENDING_CAP {
            service.issue("agent_1", 55.0).await.expect("issue");
        }
        let err = service.issue("agent_1", 55.0).await.expect_err("over cap");
        assert!(matches!(err, ChallengeError::TooManyPending));
        // Other agents are unaffected.
        assert!(service.issue("agent_2", 55.0).await.is_ok());
    }

    #[tokio::test]
    async fn completing_a_challenge_frees_a_pending_slot() {
        let service = service();
        let mut last = None;
        for _ in 0..PENDING_CAP {
            last = Some(service.issue("agent_1", 55.0).await.expect("issue"));
        }
        let challenge = last.expect("challenge");
        service
            .verify(&challenge.id, &challenge.id)
            .await
            .expect("verify");
        assert!(service.issue("agent_1", 55.0).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_challenge_is_not_found() {
        let err = service()
            .verify("missing", "whatever")
            .await
            .expect_err("not found");
        assert!(matches!(err, ChallengeError::NotFound));
    }

    #[tokio::test]
    async fn incomplete_challenge_is_not_returned_as_completed() {
        let service = service();
        let challenge = service.issue("agent_1", 55.0).await.expect("issue");
        assert!(service
            .completed(&challenge.id)
            .await
            .expect("lookup")
            .is_none());
    }
}
