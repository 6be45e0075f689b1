//! Keypair and signing helpers shared by unit and integration tests. These
//! mirror what a client-side signing library produces: canonical JSON of the
//! signed payload, an Ed25519 signature in hex, and the public key in base64.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;

use crate::types::SignedRequest;

pub fn test_keypair() -> (SigningKey, String) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let public_key = BASE64.encode(signing_key.verifying_key().as_bytes());
    (signing_key, public_key)
}

/// Serializes the payload the way a signer would and signs those exact bytes.
/// Returns `(payload_bytes, signature_hex)`.
pub fn sign_payload(signing_key: &SigningKey, signed: &SignedRequest) -> (Vec<u8>, String) {
    let payload = serde_json::to_vec(signed).expect("serialize signed payload");
    let signature = signing_key.sign(&payload);
    (payload, hex::encode(signature.to_bytes()))
}

/// Assembles the three authentication headers for a signed request.
pub fn auth_headers(
    signing_key: &SigningKey,
    public_key: &str,
    signed: &SignedRequest,
) -> std::collections::HashMap<String, String> {
    let (payload, signature) = sign_payload(signing_key, signed);
    std::collections::HashMap::from([
        ("x-agent-signature".to_string(), signature),
        ("x-agent-pubkey".to_string(), public_key.to_string()),
        ("x-signed-payload".to_string(), BASE64.encode(payload)),
    ])
}
