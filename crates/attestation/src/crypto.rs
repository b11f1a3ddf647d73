//! Cryptographic utility seam for the attestation engine.
//!
//! The engine never touches cipher primitives directly; it consumes the
//! [`CryptoUtility`] trait and treats every failure as a request failure.
//! [`SoftwareCryptoUtility`] is the in-process default used by the daemon
//! and the tests. The sealing scheme here is deliberately simple: secrets
//! are bound with ChaCha20-Poly1305 under keys derived from SHA-256 of the
//! participating public material plus a fresh salt, so both endpoints of a
//! credential exchange can derive the same key without a key-exchange
//! round trip.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{AttestationError, Result};

/// Symmetric key size in bytes.
pub const KEY_SIZE: usize = 32;

/// AEAD nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

/// Ciphertext plus the material needed to rebuild its key.
///
/// `wrapping` carries whatever the scheme needs on the other side: a salt
/// for recipient-bound blobs, a sealed key blob for device-sealed ones, or
/// nothing for raw key encryption.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    pub wrapping: Vec<u8>,
    pub nonce: Vec<u8>,
    pub data: Vec<u8>,
}

/// Identity credential encrypted so that only the TPM holding both the
/// endorsement key and the new identity key can recover it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedIdentityCredential {
    pub credential: EncryptedData,
}

/// Capability interface for the crypto operations the engine needs.
pub trait CryptoUtility: Send {
    /// Generate `size` random bytes.
    fn get_random(&self, size: usize) -> Result<Vec<u8>>;

    /// Create a fresh symmetric key together with its sealed (at-rest) form.
    fn create_sealed_key(&self) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>)>;

    /// Recover a key previously produced by [`Self::create_sealed_key`].
    fn unseal_key(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>>;

    /// Encrypt `data` under a raw symmetric key.
    fn encrypt(&self, data: &[u8], key: &[u8]) -> Result<EncryptedData>;

    /// Decrypt a blob produced by [`Self::encrypt`].
    fn decrypt(&self, encrypted: &EncryptedData, key: &[u8]) -> Result<Vec<u8>>;

    /// Encrypt `data` so the holder of `recipient_public_key_der` can open it.
    fn encrypt_for_recipient(
        &self,
        data: &[u8],
        recipient_public_key_der: &[u8],
    ) -> Result<EncryptedData>;

    /// Encrypt an identity credential against the endorsement key and the
    /// attestation identity key of the enrolling device.
    fn encrypt_identity_credential(
        &self,
        credential: &[u8],
        ek_public_key_der: &[u8],
        aik_public_key_der: &[u8],
    ) -> Result<EncryptedIdentityCredential>;
}

/// Production-default software implementation backed by OS randomness and
/// ChaCha20-Poly1305.
pub struct SoftwareCryptoUtility {
    root_key: Zeroizing<Vec<u8>>,
}

impl SoftwareCryptoUtility {
    pub fn new() -> Self {
        let mut root = vec![0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut root);
        Self {
            root_key: Zeroizing::new(root),
        }
    }

    /// Build an instance with a caller-provided sealing root, for tests and
    /// for daemons that persist the root across restarts.
    pub fn with_root_key(root_key: Vec<u8>) -> Self {
        Self {
            root_key: Zeroizing::new(root_key),
        }
    }
}

impl Default for SoftwareCryptoUtility {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoUtility for SoftwareCryptoUtility {
    fn get_random(&self, size: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; size];
        OsRng.fill_bytes(&mut bytes);
        Ok(bytes)
    }

    fn create_sealed_key(&self) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>)> {
        let key = Zeroizing::new(self.get_random(KEY_SIZE)?);
        let sealed_blob = seal_with_key(&key, &self.root_key)?;
        let sealed = serde_json::to_vec(&sealed_blob)?;
        Ok((key, sealed))
    }

    fn unseal_key(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let blob: EncryptedData = serde_json::from_slice(sealed)?;
        Ok(Zeroizing::new(open_with_key(&blob, &self.root_key)?))
    }

    fn encrypt(&self, data: &[u8], key: &[u8]) -> Result<EncryptedData> {
        seal_with_key(data, key)
    }

    fn decrypt(&self, encrypted: &EncryptedData, key: &[u8]) -> Result<Vec<u8>> {
        open_with_key(encrypted, key)
    }

    fn encrypt_for_recipient(
        &self,
        data: &[u8],
        recipient_public_key_der: &[u8],
    ) -> Result<EncryptedData> {
        let salt = self.get_random(KEY_SIZE)?;
        let key = recipient_key(recipient_public_key_der, &salt);
        let mut blob = seal_with_key(data, &key)?;
        blob.wrapping = salt;
        Ok(blob)
    }

    fn encrypt_identity_credential(
        &self,
        credential: &[u8],
        ek_public_key_der: &[u8],
        aik_public_key_der: &[u8],
    ) -> Result<EncryptedIdentityCredential> {
        let salt = self.get_random(KEY_SIZE)?;
        let key = identity_credential_key(ek_public_key_der, aik_public_key_der, &salt);
        let mut blob = seal_with_key(credential, &key)?;
        blob.wrapping = salt;
        Ok(EncryptedIdentityCredential { credential: blob })
    }
}

/// Seal `data` under a raw 32-byte key with a fresh nonce.
pub fn seal_with_key(data: &[u8], key: &[u8]) -> Result<EncryptedData> {
    if key.len() != KEY_SIZE {
        return Err(AttestationError::Crypto(format!(
            "sealing key must be {} bytes, got {}",
            KEY_SIZE,
            key.len()
        )));
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let data = cipher
        .encrypt(Nonce::from_slice(&nonce), data)
        .map_err(|_| AttestationError::Crypto("AEAD encryption failed".to_string()))?;
    Ok(EncryptedData {
        wrapping: Vec::new(),
        nonce: nonce.to_vec(),
        data,
    })
}

/// Open a blob sealed with [`seal_with_key`].
pub fn open_with_key(encrypted: &EncryptedData, key: &[u8]) -> Result<Vec<u8>> {
    if key.len() != KEY_SIZE {
        return Err(AttestationError::Crypto(format!(
            "sealing key must be {} bytes, got {}",
            KEY_SIZE,
            key.len()
        )));
    }
    if encrypted.nonce.len() != NONCE_SIZE {
        return Err(AttestationError::Crypto("bad AEAD nonce length".to_string()));
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(&encrypted.nonce), encrypted.data.as_slice())
        .map_err(|_| AttestationError::Crypto("AEAD decryption failed".to_string()))
}

/// Derive the key binding a blob to a recipient's public key.
pub fn recipient_key(recipient_public_key_der: &[u8], salt: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(recipient_public_key_der);
    hasher.update(salt);
    hasher.finalize().to_vec()
}

/// Open a blob produced by `encrypt_for_recipient`. Used by the holder of
/// the recipient key (the in-process CA and the Verified Access test peer).
pub fn open_for_recipient(
    encrypted: &EncryptedData,
    recipient_public_key_der: &[u8],
) -> Result<Vec<u8>> {
    let key = recipient_key(recipient_public_key_der, &encrypted.wrapping);
    open_with_key(encrypted, &key)
}

/// Derive the activation key binding an identity credential to a TPM.
pub fn identity_credential_key(
    ek_public_key_der: &[u8],
    aik_public_key_der: &[u8],
    salt: &[u8],
) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(ek_public_key_der);
    hasher.update(aik_public_key_der);
    hasher.update(salt);
    hasher.finalize().to_vec()
}

/// Recover an identity credential during identity activation.
pub fn open_identity_credential(
    encrypted: &EncryptedIdentityCredential,
    ek_public_key_der: &[u8],
    aik_public_key_der: &[u8],
) -> Result<Vec<u8>> {
    let key = identity_credential_key(
        ek_public_key_der,
        aik_public_key_der,
        &encrypted.credential.wrapping,
    );
    open_with_key(&encrypted.credential, &key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_lengths() {
        let crypto = SoftwareCryptoUtility::new();
        assert_eq!(crypto.get_random(0).unwrap().len(), 0);
        assert_eq!(crypto.get_random(32).unwrap().len(), 32);
        let a = crypto.get_random(32).unwrap();
        let b = crypto.get_random(32).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_seal_and_open_round_trip() {
        let crypto = SoftwareCryptoUtility::new();
        let key = crypto.get_random(KEY_SIZE).unwrap();
        let blob = crypto.encrypt(b"endorsement credential", &key).unwrap();
        assert_ne!(blob.data, b"endorsement credential");
        let opened = crypto.decrypt(&blob, &key).unwrap();
        assert_eq!(opened, b"endorsement credential");
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let crypto = SoftwareCryptoUtility::new();
        let key = crypto.get_random(KEY_SIZE).unwrap();
        let other = crypto.get_random(KEY_SIZE).unwrap();
        let blob = crypto.encrypt(b"secret", &key).unwrap();
        assert!(crypto.decrypt(&blob, &other).is_err());
    }

    #[test]
    fn test_bad_key_size_rejected() {
        let crypto = SoftwareCryptoUtility::new();
        assert!(crypto.encrypt(b"data", &[0u8; 16]).is_err());
    }

    #[test]
    fn test_sealed_key_round_trip() {
        let crypto = SoftwareCryptoUtility::new();
        let (key, sealed) = crypto.create_sealed_key().unwrap();
        let unsealed = crypto.unseal_key(&sealed).unwrap();
        assert_eq!(*key, *unsealed);
    }

    #[test]
    fn test_sealed_key_bound_to_root() {
        let crypto = SoftwareCryptoUtility::new();
        let (_, sealed) = crypto.create_sealed_key().unwrap();
        let other = SoftwareCryptoUtility::new();
        assert!(other.unseal_key(&sealed).is_err());
    }

    #[test]
    fn test_recipient_round_trip() {
        let crypto = SoftwareCryptoUtility::new();
        let recipient = b"recipient-public-key-der";
        let blob = crypto.encrypt_for_recipient(b"for the CA", recipient).unwrap();
        assert!(!blob.wrapping.is_empty());
        let opened = open_for_recipient(&blob, recipient).unwrap();
        assert_eq!(opened, b"for the CA");
        assert!(open_for_recipient(&blob, b"someone else").is_err());
    }

    #[test]
    fn test_identity_credential_round_trip() {
        let crypto = SoftwareCryptoUtility::new();
        let ek = b"ek-public-der";
        let aik = b"aik-public-der";
        let encrypted = crypto
            .encrypt_identity_credential(b"identity credential", ek, aik)
            .unwrap();
        let opened = open_identity_credential(&encrypted, ek, aik).unwrap();
        assert_eq!(opened, b"identity credential");
        assert!(open_identity_credential(&encrypted, ek, b"other-aik").is_err());
    }
}
