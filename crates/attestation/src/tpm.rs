//! TPM utility seam.
//! Enforces hardware-rooted identity without exposing command encoding to
//! the engine; [`SoftwareTpm`] stands in for the secure element with
//! P-256 keys held in process.

use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::EncodePublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::crypto::{open_identity_credential, open_with_key, EncryptedData, EncryptedIdentityCredential};
use crate::error::{AttestationError, Result};
use crate::types::{KeyType, KeyUsage};

/// A TPM-signed statement over some quoted data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub quoted_data: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Attestation identity key material. The private half never leaves the TPM;
/// `key_blob` is the opaque handle the engine passes back for signing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeyMaterial {
    pub public_key_der: Vec<u8>,
    pub key_blob: Vec<u8>,
}

/// A freshly created certified key plus the TPM certify statement binding it
/// to the identity key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertifiedKeyMaterial {
    pub public_key_der: Vec<u8>,
    pub key_blob: Vec<u8>,
    pub certify_info: Vec<u8>,
    pub certify_info_signature: Vec<u8>,
}

/// The manufacturer-issued endorsement credential body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndorsementCredential {
    pub subject: String,
    pub public_key_der: Vec<u8>,
}

/// Content of a TPM certify statement, serialized as `certify_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertifyInfo {
    pub public_key_digest: Vec<u8>,
    pub external_data_digest: Vec<u8>,
}

/// Capability interface for the TPM operations the engine needs.
///
/// Only ever used from the worker context.
pub trait TpmUtility: Send {
    /// Whether the TPM is owned and ready for attestation work.
    fn is_ready(&self) -> bool;

    /// Endorsement public key, DER-encoded.
    fn endorsement_public_key(&self) -> Result<Vec<u8>>;

    /// Manufacturer-issued endorsement credential.
    fn endorsement_credential(&self) -> Result<Vec<u8>>;

    /// Create a new attestation identity key. Returns the key material and
    /// the identity binding proving the key is TPM-resident.
    fn create_identity(&mut self) -> Result<(IdentityKeyMaterial, Vec<u8>)>;

    /// Recover the identity credential issued by the CA during enrollment.
    fn activate_identity(
        &mut self,
        identity_key_blob: &[u8],
        encrypted: &EncryptedIdentityCredential,
    ) -> Result<Vec<u8>>;

    /// Create a key certified against the given identity key.
    fn create_certified_key(
        &mut self,
        key_type: KeyType,
        key_usage: KeyUsage,
        identity_key_blob: &[u8],
        external_data: &[u8],
    ) -> Result<CertifiedKeyMaterial>;

    /// Sign `data` with a TPM-resident key.
    fn sign(&self, key_blob: &[u8], data: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt data bound to a TPM-resident decryption key.
    fn unbind(&self, key_blob: &[u8], data: &[u8]) -> Result<Vec<u8>>;

    /// Quote a PCR value.
    fn quote_pcr(&self, pcr_index: u32, challenge: &[u8]) -> Result<Quote>;

    /// Quote the content of an NVRAM index.
    fn quote_nvram(&self, nv_index: u32, challenge: &[u8]) -> Result<Quote>;
}

/// In-process TPM stand-in. Keys are P-256; quotes are plain signatures
/// over a structured blob.
pub struct SoftwareTpm {
    ready: bool,
    ek_key: SigningKey,
    keys: HashMap<Vec<u8>, SigningKey>,
    nvram: HashMap<u32, Vec<u8>>,
}

impl SoftwareTpm {
    pub fn new() -> Self {
        Self {
            ready: true,
            ek_key: SigningKey::random(&mut rand::thread_rng()),
            keys: HashMap::new(),
            nvram: HashMap::new(),
        }
    }

    /// Mark the TPM not ready; attestation operations will fail until reset.
    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    /// Define the content of an NVRAM index.
    pub fn define_nvram(&mut self, nv_index: u32, data: Vec<u8>) {
        self.nvram.insert(nv_index, data);
    }

    fn ek_public_key_der(&self) -> Result<Vec<u8>> {
        public_key_der(&self.ek_key)
    }

    fn generate_key(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let key = SigningKey::random(&mut rand::thread_rng());
        let public_der = public_key_der(&key)?;
        let blob = Sha256::digest(&public_der).to_vec();
        self.keys.insert(blob.clone(), key);
        Ok((public_der, blob))
    }

    fn key_for_blob(&self, key_blob: &[u8]) -> Result<&SigningKey> {
        self.keys
            .get(key_blob)
            .ok_or_else(|| AttestationError::Tpm("unknown key blob".to_string()))
    }

    fn check_ready(&self) -> Result<()> {
        if self.ready {
            Ok(())
        } else {
            Err(AttestationError::Tpm("TPM not ready".to_string()))
        }
    }
}

impl Default for SoftwareTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl TpmUtility for SoftwareTpm {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn endorsement_public_key(&self) -> Result<Vec<u8>> {
        self.check_ready()?;
        self.ek_public_key_der()
    }

    fn endorsement_credential(&self) -> Result<Vec<u8>> {
        self.check_ready()?;
        let credential = EndorsementCredential {
            subject: "Certus Software TPM".to_string(),
            public_key_der: self.ek_public_key_der()?,
        };
        Ok(serde_json::to_vec(&credential)?)
    }

    fn create_identity(&mut self) -> Result<(IdentityKeyMaterial, Vec<u8>)> {
        self.check_ready()?;
        let (public_key_der, key_blob) = self.generate_key()?;
        // The binding is the EK's signature over the identity public key.
        let binding: Signature = self.ek_key.sign(&public_key_der);
        Ok((
            IdentityKeyMaterial {
                public_key_der,
                key_blob,
            },
            binding.to_der().as_bytes().to_vec(),
        ))
    }

    fn activate_identity(
        &mut self,
        identity_key_blob: &[u8],
        encrypted: &EncryptedIdentityCredential,
    ) -> Result<Vec<u8>> {
        self.check_ready()?;
        let aik_public = public_key_der(self.key_for_blob(identity_key_blob)?)?;
        let ek_public = self.ek_public_key_der()?;
        open_identity_credential(encrypted, &ek_public, &aik_public)
    }

    fn create_certified_key(
        &mut self,
        _key_type: KeyType,
        _key_usage: KeyUsage,
        identity_key_blob: &[u8],
        external_data: &[u8],
    ) -> Result<CertifiedKeyMaterial> {
        self.check_ready()?;
        if !self.keys.contains_key(identity_key_blob) {
            return Err(AttestationError::Tpm("unknown identity key".to_string()));
        }
        let (public_key_der, key_blob) = self.generate_key()?;
        let certify_info = serde_json::to_vec(&CertifyInfo {
            public_key_digest: Sha256::digest(&public_key_der).to_vec(),
            external_data_digest: Sha256::digest(external_data).to_vec(),
        })?;
        let identity_key = self.key_for_blob(identity_key_blob)?;
        let signature: Signature = identity_key.sign(&certify_info);
        Ok(CertifiedKeyMaterial {
            public_key_der,
            key_blob,
            certify_info,
            certify_info_signature: signature.to_der().as_bytes().to_vec(),
        })
    }

    fn sign(&self, key_blob: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        self.check_ready()?;
        let key = self.key_for_blob(key_blob)?;
        let signature: Signature = key.sign(data);
        Ok(signature.to_der().as_bytes().to_vec())
    }

    fn unbind(&self, key_blob: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        self.check_ready()?;
        let key = self.key_for_blob(key_blob)?;
        let blob: EncryptedData = serde_json::from_slice(data)?;
        let bind_key = binding_key(&public_key_der(key)?);
        open_with_key(&blob, &bind_key)
    }

    fn quote_pcr(&self, pcr_index: u32, challenge: &[u8]) -> Result<Quote> {
        self.check_ready()?;
        let mut quoted_data = b"PCR".to_vec();
        quoted_data.extend_from_slice(&pcr_index.to_be_bytes());
        quoted_data.extend_from_slice(&[0xFFu8; 32]);
        quoted_data.extend_from_slice(challenge);
        let signature: Signature = self.ek_key.sign(&quoted_data);
        Ok(Quote {
            quoted_data,
            signature: signature.to_der().as_bytes().to_vec(),
        })
    }

    fn quote_nvram(&self, nv_index: u32, challenge: &[u8]) -> Result<Quote> {
        self.check_ready()?;
        let data = self
            .nvram
            .get(&nv_index)
            .ok_or_else(|| AttestationError::Tpm(format!("NV index {:#x} not defined", nv_index)))?;
        let mut quoted_data = b"NV".to_vec();
        quoted_data.extend_from_slice(&nv_index.to_be_bytes());
        quoted_data.extend_from_slice(data);
        quoted_data.extend_from_slice(challenge);
        let signature: Signature = self.ek_key.sign(&quoted_data);
        Ok(Quote {
            quoted_data,
            signature: signature.to_der().as_bytes().to_vec(),
        })
    }
}

/// Check a certify statement: the identity key must have signed it, and it
/// must describe the expected public key.
pub fn verify_certify_statement(
    identity_public_key_der: &[u8],
    certify_info: &[u8],
    certify_info_signature: &[u8],
    expected_public_key_der: &[u8],
) -> bool {
    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::VerifyingKey;
    use p256::pkcs8::DecodePublicKey;

    let identity_key = match VerifyingKey::from_public_key_der(identity_public_key_der) {
        Ok(key) => key,
        Err(_) => return false,
    };
    let signature = match Signature::from_der(certify_info_signature) {
        Ok(signature) => signature,
        Err(_) => return false,
    };
    if identity_key.verify(certify_info, &signature).is_err() {
        return false;
    }
    let info: CertifyInfo = match serde_json::from_slice(certify_info) {
        Ok(info) => info,
        Err(_) => return false,
    };
    info.public_key_digest == Sha256::digest(expected_public_key_der).as_slice()
}

/// Encrypt data so that only the holder of the named key can unbind it.
pub fn bind_to_public_key(data: &[u8], public_key_der: &[u8]) -> Result<Vec<u8>> {
    let blob = crate::crypto::seal_with_key(data, &binding_key(public_key_der))?;
    Ok(serde_json::to_vec(&blob)?)
}

fn binding_key(public_key_der: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"bind");
    hasher.update(public_key_der);
    hasher.finalize().to_vec()
}

fn public_key_der(key: &SigningKey) -> Result<Vec<u8>> {
    key.verifying_key()
        .to_public_key_der()
        .map(|der| der.as_bytes().to_vec())
        .map_err(|e| AttestationError::Tpm(format!("public key encoding failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoUtility, SoftwareCryptoUtility};
    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::VerifyingKey;
    use p256::pkcs8::DecodePublicKey;

    #[test]
    fn test_not_ready_fails_operations() {
        let mut tpm = SoftwareTpm::new();
        tpm.set_ready(false);
        assert!(!tpm.is_ready());
        assert!(tpm.endorsement_public_key().is_err());
        assert!(tpm.create_identity().is_err());
    }

    #[test]
    fn test_identity_binding_verifies_against_ek() {
        let mut tpm = SoftwareTpm::new();
        let (identity, binding) = tpm.create_identity().unwrap();
        let ek = VerifyingKey::from_public_key_der(&tpm.endorsement_public_key().unwrap()).unwrap();
        let signature = Signature::from_der(&binding).unwrap();
        assert!(ek.verify(&identity.public_key_der, &signature).is_ok());
    }

    #[test]
    fn test_activate_identity_round_trip() {
        let mut tpm = SoftwareTpm::new();
        let crypto = SoftwareCryptoUtility::new();
        let (identity, _) = tpm.create_identity().unwrap();
        let encrypted = crypto
            .encrypt_identity_credential(
                b"issued credential",
                &tpm.endorsement_public_key().unwrap(),
                &identity.public_key_der,
            )
            .unwrap();
        let credential = tpm.activate_identity(&identity.key_blob, &encrypted).unwrap();
        assert_eq!(credential, b"issued credential");
    }

    #[test]
    fn test_certified_key_proof_verifies() {
        let mut tpm = SoftwareTpm::new();
        let (identity, _) = tpm.create_identity().unwrap();
        let material = tpm
            .create_certified_key(KeyType::Ecc, KeyUsage::Sign, &identity.key_blob, b"external")
            .unwrap();

        let info: CertifyInfo = serde_json::from_slice(&material.certify_info).unwrap();
        assert_eq!(
            info.external_data_digest,
            Sha256::digest(b"external").to_vec()
        );

        let aik = VerifyingKey::from_public_key_der(&identity.public_key_der).unwrap();
        let signature = Signature::from_der(&material.certify_info_signature).unwrap();
        assert!(aik.verify(&material.certify_info, &signature).is_ok());
    }

    #[test]
    fn test_certify_against_unknown_identity_fails() {
        let mut tpm = SoftwareTpm::new();
        let result =
            tpm.create_certified_key(KeyType::Ecc, KeyUsage::Sign, b"no-such-blob", b"x");
        assert!(result.is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let mut tpm = SoftwareTpm::new();
        let (identity, _) = tpm.create_identity().unwrap();
        let material = tpm
            .create_certified_key(KeyType::Ecc, KeyUsage::Sign, &identity.key_blob, b"ext")
            .unwrap();
        let signature = tpm.sign(&material.key_blob, b"challenge").unwrap();
        let key = VerifyingKey::from_public_key_der(&material.public_key_der).unwrap();
        let signature = Signature::from_der(&signature).unwrap();
        assert!(key.verify(b"challenge", &signature).is_ok());
        assert!(key.verify(b"tampered", &signature).is_err());
    }

    #[test]
    fn test_certify_statement_verification() {
        let mut tpm = SoftwareTpm::new();
        let (identity, _) = tpm.create_identity().unwrap();
        let material = tpm
            .create_certified_key(KeyType::Ecc, KeyUsage::Sign, &identity.key_blob, b"ext")
            .unwrap();

        assert!(verify_certify_statement(
            &identity.public_key_der,
            &material.certify_info,
            &material.certify_info_signature,
            &material.public_key_der,
        ));
        // A different key does not match the statement.
        assert!(!verify_certify_statement(
            &identity.public_key_der,
            &material.certify_info,
            &material.certify_info_signature,
            &identity.public_key_der,
        ));
        // A different identity did not sign it.
        let (other_identity, _) = tpm.create_identity().unwrap();
        assert!(!verify_certify_statement(
            &other_identity.public_key_der,
            &material.certify_info,
            &material.certify_info_signature,
            &material.public_key_der,
        ));
    }

    #[test]
    fn test_bind_and_unbind() {
        let mut tpm = SoftwareTpm::new();
        let (identity, _) = tpm.create_identity().unwrap();
        let material = tpm
            .create_certified_key(KeyType::Ecc, KeyUsage::Decrypt, &identity.key_blob, b"ext")
            .unwrap();
        let bound = bind_to_public_key(b"wrapped secret", &material.public_key_der).unwrap();
        let opened = tpm.unbind(&material.key_blob, &bound).unwrap();
        assert_eq!(opened, b"wrapped secret");
    }

    #[test]
    fn test_nvram_quote_requires_defined_index() {
        let mut tpm = SoftwareTpm::new();
        assert!(tpm.quote_nvram(0x3f_ff00, b"c").is_err());
        tpm.define_nvram(0x3f_ff00, b"board-id".to_vec());
        let quote = tpm.quote_nvram(0x3f_ff00, b"c").unwrap();
        assert!(!quote.quoted_data.is_empty());
        assert!(!quote.signature.is_empty());
    }

    #[test]
    fn test_pcr_quote_covers_challenge() {
        let tpm = SoftwareTpm::new();
        let quote = tpm.quote_pcr(0, b"nonce-value").unwrap();
        assert!(quote
            .quoted_data
            .windows(b"nonce-value".len())
            .any(|w| w == b"nonce-value"));
    }
}
