use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use control_plane::{
    epoch_ms, AgentIdentity, AgentPermissions, KvError, KvIdentityStore, KvStore,
    RateLimitSettings, INITIAL_REPUTATION,
};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::types::SignedRequest;

pub const TIMESTAMP_SKEW_MS: u64 = 30_000;
pub const NONCE_TTL: Duration = Duration::from_secs(60);
const BAD_SIGNATURE_PENALTY: f64 = -5.0;
const TRUST_DRIFT: f64 = 0.1;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("expired")]
    Expired,
    #[error("replay")]
    Replay,
    #[error("unknown_agent")]
    UnknownAgent,
    #[error("invalid_signature")]
    InvalidSignature,
    #[error("malformed: {0}")]
    Malformed(String),
    #[error(transparent)]
    Kv(#[from] KvError),
}

impl VerifyError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Replay => "replay",
            Self::UnknownAgent => "unknown_agent",
            Self::InvalidSignature => "invalid_signature",
            Self::Malformed(_) => "malformed",
            Self::Kv(_) => "kv",
        }
    }
}

/// First pipeline stage: timestamp freshness, nonce replay guard, agent
/// lookup, Ed25519 verification. The nonce is reserved before the signature
/// check; a replayed payload is rejected regardless of signature validity.
#[derive(Clone)]
pub struct CryptoVerifier {
    identities: KvIdentityStore,
    kv: Arc<dyn KvStore>,
}

impl CryptoVerifier {
    pub fn new(identities: KvIdentityStore, kv: Arc<dyn KvStore>) -> Self {
        Self { identities, kv }
    }

    /// SHA-256 hex of the decoded public-key bytes; the primary identity key.
    pub fn fingerprint(public_key: &str) -> Result<String, VerifyError> {
        let key_bytes = BASE64
            .decode(public_key)
            .map_err(|err| VerifyError::Malformed(format!("public key base64: {err}")))?;
        Ok(hex::encode(Sha256::digest(&key_bytes)))
    }

    pub async fn verify(
        &self,
        payload_bytes: &[u8],
        signed: &SignedRequest,
        signature_hex: &str,
        public_key: &str,
    ) -> Result<AgentIdentity, VerifyError> {
        let now = epoch_ms();
        if now.abs_diff(signed.timestamp) > TIMESTAMP_SKEW_MS {
            return Err(VerifyError::Expired);
        }

        let fingerprint = Self::fingerprint(public_key)?;

        let nonce_key = format!("nonce:{fingerprint}:{}", signed.nonce);
        if !self.kv.set_nx(&nonce_key, "used", NONCE_TTL).await? {
            return Err(VerifyError::Replay);
        }

        let Some(agent) = self.identities.get(&fingerprint).await? else {
            return Err(VerifyError::UnknownAgent);
        };

        let verifying_key = decode_verifying_key(public_key)?;
        let signature = decode_signature(signature_hex)?;
        if verifying_key.verify(payload_bytes, &signature).is_err() {
            self.identities
                .adjust_reputation(&fingerprint, BAD_SIGNATURE_PENALTY, "invalid_signature")
                .await?;
            return Err(VerifyError::InvalidSignature);
        }

        let reputation = self
            .identities
            .adjust_reputation(&fingerprint, TRUST_DRIFT, "verified_request")
            .await?
            .unwrap_or(agent.reputation);
        debug!(agent_id = %agent.id, reputation, "signature verified");

        // Return the post-update snapshot so later stages see the fresh
        // reputation and last_seen.
        Ok(self.identities.get(&fingerprint).await?.unwrap_or(agent))
    }

    pub async fn register_agent(
        &self,
        public_key: &str,
        permissions: Option<AgentPermissions>,
    ) -> Result<AgentIdentity, VerifyError> {
        decode_verifying_key(public_key)?;
        let fingerprint = Self::fingerprint(public_key)?;
        let mut id_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        let now = epoch_ms();
        let identity = AgentIdentity {
            id: format!("agent_{}", hex::encode(id_bytes)),
            public_key: public_key.to_string(),
            fingerprint,
            registered_at: now,
            last_seen: now,
            reputation: INITIAL_REPUTATION,
            permissions: permissions.unwrap_or_default(),
            rate_limit: RateLimitSettings::default(),
        };
        self.identities.put(&identity).await?;
        Ok(identity)
    }

    pub fn identities(&self) -> &KvIdentityStore {
        &self.identities
    }
}

fn decode_verifying_key(public_key: &str) -> Result<VerifyingKey, VerifyError> {
    let key_bytes = BASE64
        .decode(public_key)
        .map_err(|err| VerifyError::Malformed(format!("public key base64: {err}")))?;
    let key_array: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| VerifyError::Malformed("public key length".to_string()))?;
    VerifyingKey::from_bytes(&key_array)
        .map_err(|err| VerifyError::Malformed(format!("public key: {err}")))
}

fn decode_signature(signature_hex: &str) -> Result<Signature, VerifyError> {
    let sig_bytes = hex::decode(signature_hex)
        .map_err(|err| VerifyError::Malformed(format!("signature hex: {err}")))?;
    let sig_array: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| VerifyError::Malformed("signature length".to_string()))?;
    Ok(Signature::from_bytes(&sig_array))
}
