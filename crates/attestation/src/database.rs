//! Persisted attestation state and the database seam.
//!
//! The engine owns a single mutable root document; every field is
//! defaulted so partially written or legacy images still load. The
//! concrete encoding of the image on disk is not part of the engine's
//! contract; [`JsonFileDatabase`] is the production default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::crypto::EncryptedData;
use crate::error::{AttestationError, Result};
use crate::tpm::Quote;
use crate::types::{AcaType, KeyType, KeyUsage};

/// Endorsement material and CA-bound credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub endorsement_public_key: Vec<u8>,
    #[serde(default)]
    pub endorsement_credential: Vec<u8>,
    /// Endorsement credential sealed to the device, pre-encrypted for
    /// faster enrollment preparation.
    #[serde(default)]
    pub default_encrypted_endorsement_credential: Option<EncryptedData>,
    /// Endorsement credential encrypted to each CA's public key.
    #[serde(default)]
    pub encrypted_endorsement_credentials: Vec<EncryptedCredentialRecord>,
}

/// Endorsement credential encrypted for one CA flavor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedCredentialRecord {
    pub aca_type: AcaType,
    pub credential: EncryptedData,
}

/// Attestation identity key record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeyRecord {
    #[serde(default)]
    pub public_key_der: Vec<u8>,
    #[serde(default)]
    pub key_blob: Vec<u8>,
}

/// Feature flags attached to an identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityFeatures {
    /// Whether this identity may be used to derive the enterprise
    /// enrollment ID.
    #[serde(default)]
    pub enrollment_id: bool,
}

/// NVRAM quote attached to an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvramQuoteRecord {
    pub quote_type: crate::nvram::NvramQuoteType,
    pub quote: Quote,
}

/// One attestation identity. Identities are append-only; the index in
/// [`AttestationDatabaseData::identities`] is the identity's number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub features: IdentityFeatures,
    #[serde(default)]
    pub identity_key: Option<IdentityKeyRecord>,
    #[serde(default)]
    pub identity_binding: Option<Vec<u8>>,
    #[serde(default)]
    pub pcr0_quote: Option<Quote>,
    #[serde(default)]
    pub pcr1_quote: Option<Quote>,
    #[serde(default)]
    pub nvram_quotes: Vec<NvramQuoteRecord>,
}

/// The identity credential issued by one CA for one identity.
/// At most one record exists per (identity, ACA) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityCertificateRecord {
    pub identity_index: usize,
    pub aca_type: AcaType,
    #[serde(default)]
    pub identity_credential: Vec<u8>,
}

/// An application key certified by the TPM, with its CA-issued chain once
/// certification completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertifiedKey {
    pub key_name: String,
    #[serde(default)]
    pub key_type: KeyType,
    #[serde(default)]
    pub key_usage: KeyUsage,
    #[serde(default)]
    pub public_key_der: Vec<u8>,
    #[serde(default)]
    pub key_blob: Vec<u8>,
    #[serde(default)]
    pub certify_info: Vec<u8>,
    #[serde(default)]
    pub certify_info_signature: Vec<u8>,
    /// Leaf certificate issued by the CA, DER-encoded.
    #[serde(default)]
    pub certificate: Vec<u8>,
    #[serde(default)]
    pub intermediate_certificates: Vec<Vec<u8>>,
    /// Opaque caller-managed payload.
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// Temporal index bookkeeping for certificate decorrelation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalIndexRecord {
    pub origin_hash: Vec<u8>,
    pub user_hash: Vec<u8>,
    pub temporal_index: u32,
}

/// Root of the persisted attestation state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttestationDatabaseData {
    #[serde(default)]
    pub credentials: Credentials,

    // Legacy single-identity layout, folded into `identities[0]` by the
    // one-time migration.
    #[serde(default)]
    pub legacy_identity_key: Option<IdentityKeyRecord>,
    #[serde(default)]
    pub legacy_identity_binding: Option<Vec<u8>>,
    #[serde(default)]
    pub legacy_pcr0_quote: Option<Quote>,
    #[serde(default)]
    pub legacy_pcr1_quote: Option<Quote>,

    #[serde(default)]
    pub identities: Vec<Identity>,
    #[serde(default)]
    pub identity_certificates: Vec<IdentityCertificateRecord>,
    /// Device-wide certified keys; per-user keys live in the key store.
    #[serde(default)]
    pub device_keys: Vec<CertifiedKey>,
    #[serde(default)]
    pub temporal_index_records: Vec<TemporalIndexRecord>,
}

impl AttestationDatabaseData {
    pub fn find_identity_certificate(
        &self,
        identity_index: usize,
        aca_type: AcaType,
    ) -> Option<(usize, &IdentityCertificateRecord)> {
        self.identity_certificates
            .iter()
            .enumerate()
            .find(|(_, record)| {
                record.identity_index == identity_index && record.aca_type == aca_type
            })
    }

    pub fn find_device_key(&self, key_name: &str) -> Option<&CertifiedKey> {
        self.device_keys.iter().find(|key| key.key_name == key_name)
    }
}

/// Mutable access to the persisted root plus an explicit durability point.
pub trait Database: Send {
    fn data(&self) -> &AttestationDatabaseData;
    fn data_mut(&mut self) -> &mut AttestationDatabaseData;
    fn save_changes(&mut self) -> Result<()>;
}

/// Volatile database for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    data: AttestationDatabaseData,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: AttestationDatabaseData) -> Self {
        Self { data }
    }
}

impl Database for InMemoryDatabase {
    fn data(&self) -> &AttestationDatabaseData {
        &self.data
    }

    fn data_mut(&mut self) -> &mut AttestationDatabaseData {
        &mut self.data
    }

    fn save_changes(&mut self) -> Result<()> {
        Ok(())
    }
}

/// File-backed database storing the root as a JSON document.
#[derive(Debug)]
pub struct JsonFileDatabase {
    path: PathBuf,
    data: AttestationDatabaseData,
}

impl JsonFileDatabase {
    /// Open the database at `path`, creating an empty root if the file does
    /// not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| AttestationError::Database(format!("corrupt database image: {}", e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                AttestationDatabaseData::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, data })
    }
}

impl Database for JsonFileDatabase {
    fn data(&self) -> &AttestationDatabaseData {
        &self.data
    }

    fn data_mut(&mut self) -> &mut AttestationDatabaseData {
        &mut self.data
    }

    fn save_changes(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_vec_pretty(&self.data)?;
        std::fs::write(&self.path, raw)
            .map_err(|e| AttestationError::Database(format!("write failed: {}", e)))
    }
}
