//! Enterprise challenge-response support for Verified Access.
//!
//! A VA server proves a challenge came from it by signing the challenge
//! payload; the device answers with a signed envelope carrying the
//! requested key information encrypted to the VA service. Enrollment
//! identifiers are keyed derivations from the enterprise seed and the
//! TPM endorsement key, stable across reboots by construction.

use hmac::{Hmac, Mac};
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::ca::GoogleKeys;
use crate::crypto::{CryptoUtility, EncryptedData};
use crate::error::{AttestationError, Result};
use crate::tpm::TpmUtility;
use crate::types::VaType;

type HmacSha256 = Hmac<Sha256>;

/// Expected prefix inside every enterprise challenge.
pub const CHALLENGE_PREFIX: &str = "EnterpriseKeyChallenge";

/// How long a challenge stays answerable (milliseconds).
pub const CHALLENGE_VALIDITY_MS: u64 = 300_000;

/// Allowed clock skew when checking challenge freshness (milliseconds).
const CHALLENGE_SKEW_MS: u64 = 5_000;

const CHALLENGE_RESPONSE_NONCE_SIZE: usize = 32;

/// A payload plus a detached signature over it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedData {
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Challenge payload issued by a VA server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub prefix: String,
    pub nonce: Vec<u8>,
    /// Unix epoch milliseconds.
    pub timestamp: u64,
}

/// Device answer to an enterprise challenge: the original challenge, a
/// fresh nonce, and the key information encrypted for the VA service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub challenge: SignedData,
    pub nonce: Vec<u8>,
    pub encrypted_key_info: EncryptedData,
}

/// Which kind of enterprise key is being attested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnterpriseKeyType {
    Machine,
    User,
}

/// Key information disclosed to the VA service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyInfo {
    pub key_type: EnterpriseKeyType,
    pub domain: String,
    pub device_id: Vec<u8>,
    /// Leaf certificate of the attested key, DER-encoded.
    pub certificate: Vec<u8>,
    /// Signed public key and challenge, populated for user keys on request.
    #[serde(default)]
    pub spkac: Vec<u8>,
    #[serde(default)]
    pub customer_id: String,
}

/// Verify an incoming challenge: VA signature, payload prefix, and
/// freshness. Returns the decoded challenge payload.
pub fn validate_enterprise_challenge(
    keys: &GoogleKeys,
    va_type: VaType,
    signed: &SignedData,
) -> Result<Challenge> {
    let key_der = keys.va_signing_key(va_type).ok_or_else(|| {
        AttestationError::InvalidState(format!("no VA signing key for {:?}", va_type))
    })?;
    let verifying_key = VerifyingKey::from_public_key_der(key_der)
        .map_err(|_| AttestationError::Crypto("bad VA signing key".to_string()))?;
    let signature = Signature::from_der(&signed.signature)
        .map_err(|_| AttestationError::Crypto("bad challenge signature encoding".to_string()))?;
    verifying_key
        .verify(&signed.data, &signature)
        .map_err(|_| AttestationError::Crypto("challenge signature invalid".to_string()))?;

    let challenge: Challenge = serde_json::from_slice(&signed.data)?;
    if challenge.prefix != CHALLENGE_PREFIX {
        return Err(AttestationError::InvalidState(
            "challenge prefix mismatch".to_string(),
        ));
    }
    if challenge.nonce.is_empty() {
        return Err(AttestationError::InvalidState(
            "challenge carries no nonce".to_string(),
        ));
    }
    if !is_timestamp_fresh(challenge.timestamp, current_timestamp()) {
        return Err(AttestationError::InvalidState(
            "challenge timestamp stale".to_string(),
        ));
    }
    Ok(challenge)
}

/// Assemble and sign the response envelope. Every step must succeed; a
/// failure aborts with no partial output.
pub fn build_challenge_response(
    crypto: &dyn CryptoUtility,
    tpm: &dyn TpmUtility,
    key_blob: &[u8],
    challenge: SignedData,
    key_info: &KeyInfo,
    va_encryption_key_der: &[u8],
) -> Result<SignedData> {
    let encrypted_key_info =
        crypto.encrypt_for_recipient(&serde_json::to_vec(key_info)?, va_encryption_key_der)?;
    let nonce = crypto.get_random(CHALLENGE_RESPONSE_NONCE_SIZE)?;
    let response = ChallengeResponse {
        challenge,
        nonce,
        encrypted_key_info,
    };
    let data = serde_json::to_vec(&response)?;
    let signature = tpm.sign(key_blob, &data)?;
    Ok(SignedData { data, signature })
}

/// Derive the enrollment nonce from the enterprise seed. `None` when the
/// device has no seed provisioned.
pub fn compute_enterprise_enrollment_nonce(abe_data: &[u8]) -> Option<Vec<u8>> {
    if abe_data.is_empty() {
        return None;
    }
    Some(hmac_sha256(abe_data, b"enrollment_id"))
}

/// Derive the stable enterprise enrollment ID from the seed and the EK
/// public key. Deterministic for a given (TPM, seed) pair.
pub fn compute_enterprise_enrollment_id(
    abe_data: &[u8],
    ek_public_key_der: &[u8],
) -> Option<Vec<u8>> {
    if ek_public_key_der.is_empty() {
        return None;
    }
    let nonce = compute_enterprise_enrollment_nonce(abe_data)?;
    Some(hmac_sha256(&nonce, ek_public_key_der))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn is_timestamp_fresh(timestamp: u64, now: u64) -> bool {
    if timestamp > now + CHALLENGE_SKEW_MS {
        return false;
    }
    if timestamp > now {
        return true;
    }
    now - timestamp <= CHALLENGE_VALIDITY_MS
}

/// Current time in Unix epoch milliseconds.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
