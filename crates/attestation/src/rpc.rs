//! Request and reply types for the public operation surface.
//!
//! Every operation is a request → reply pair carrying an
//! [`AttestationStatus`]. Replies never relay internal error text; the only
//! pass-through string is the CA's own rejection detail in `server_error`.

use serde::{Deserialize, Serialize};

use crate::crypto::EncryptedIdentityCredential;
use crate::enterprise::SignedData;
use crate::nvram::NvramQuoteType;
use crate::tpm::Quote;
use crate::types::{
    AcaType, AttestationStatus, CertificateProfile, EnrollmentStatus, KeyType, KeyUsage, VaType,
};

/// Explicit enrollment with a CA flavor.
#[derive(Debug, Clone)]
pub struct EnrollRequest {
    pub aca_type: AcaType,
    /// Re-enroll even if already enrolled.
    pub forced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollReply {
    pub status: AttestationStatus,
    pub server_error: String,
}

impl EnrollReply {
    pub fn failure(status: AttestationStatus) -> Self {
        Self {
            status,
            server_error: String::new(),
        }
    }
}

/// Enroll-if-needed plus certificate issuance for one key.
#[derive(Debug, Clone)]
pub struct GetCertificateRequest {
    pub aca_type: AcaType,
    pub profile: CertificateProfile,
    pub username: String,
    pub key_label: String,
    pub origin: String,
    pub key_type: KeyType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetCertificateReply {
    pub status: AttestationStatus,
    pub server_error: String,
    /// PEM chain, leaf first, then intermediates in CA-reported order.
    pub certificate_chain: String,
    pub public_key_der: Vec<u8>,
}

impl GetCertificateReply {
    pub fn failure(status: AttestationStatus) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateCertifiableKeyRequest {
    pub username: String,
    pub key_label: String,
    pub key_type: KeyType,
    pub key_usage: KeyUsage,
}

/// Reply describing one certified key. On failure every material field is
/// empty.
#[derive(Debug, Clone, Default)]
pub struct KeyInfoReply {
    pub status: AttestationStatus,
    pub key_type: KeyType,
    pub key_usage: KeyUsage,
    pub public_key_der: Vec<u8>,
    pub certify_info: Vec<u8>,
    pub certify_info_signature: Vec<u8>,
    pub certificate_chain: String,
    pub payload: Vec<u8>,
}

impl KeyInfoReply {
    pub fn failure(status: AttestationStatus) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }
}

/// Reply carrying opaque output bytes (decrypt, sign, challenge replies).
#[derive(Debug, Clone, Default)]
pub struct DataReply {
    pub status: AttestationStatus,
    pub data: Vec<u8>,
}

impl DataReply {
    pub fn failure(status: AttestationStatus) -> Self {
        Self {
            status,
            data: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EndorsementInfoReply {
    pub status: AttestationStatus,
    pub ek_public_key: Vec<u8>,
    pub ek_certificate: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct AttestationKeyInfoReply {
    pub status: AttestationStatus,
    pub public_key_der: Vec<u8>,
    pub identity_binding: Vec<u8>,
    pub pcr0_quote: Option<Quote>,
    pub pcr1_quote: Option<Quote>,
    /// Identity credential issued at enrollment, when enrolled.
    pub identity_credential: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ActivateAttestationKeyRequest {
    pub aca_type: AcaType,
    pub encrypted_credential: EncryptedIdentityCredential,
    /// Persist the recovered credential onto the identity.
    pub save_credential: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ActivateAttestationKeyReply {
    pub status: AttestationStatus,
    pub credential: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMatchBehavior {
    Exact,
    Prefix,
}

#[derive(Debug, Clone)]
pub struct DeleteKeysRequest {
    pub username: String,
    pub key_label_match: String,
    pub match_behavior: KeyMatchBehavior,
}

#[derive(Debug, Clone, Default)]
pub struct StatusReply {
    pub status: AttestationStatus,
    /// Whether the endorsement material needed for enrollment is present.
    pub prepared_for_enrollment: bool,
    pub enrollment_statuses: Vec<(AcaType, EnrollmentStatus)>,
    pub verified_boot: bool,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyReply {
    pub status: AttestationStatus,
    pub verified: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GetEnrollmentPreparationsReply {
    pub status: AttestationStatus,
    pub prepared: Vec<(AcaType, bool)>,
}

/// Reply to the manual enroll-request builder; `pca_request` is the body
/// a CA proxy should POST to `/enroll`.
#[derive(Debug, Clone, Default)]
pub struct CreateEnrollRequestReply {
    pub status: AttestationStatus,
    pub pca_request: Vec<u8>,
}

/// Reply to the manual certificate-request builder; `pca_request` is the
/// body a CA proxy should POST to `/sign`.
#[derive(Debug, Clone, Default)]
pub struct CreateCertificateRequestReply {
    pub status: AttestationStatus,
    pub pca_request: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CreateCertificateRequestParams {
    pub aca_type: AcaType,
    pub username: String,
    pub key_label: String,
    pub profile: CertificateProfile,
    pub origin: String,
    pub key_type: KeyType,
}

#[derive(Debug, Clone, Default)]
pub struct FinishCertificateRequestReply {
    pub status: AttestationStatus,
    pub server_error: String,
    pub certificate_chain: String,
    pub key_label: String,
}

impl FinishCertificateRequestReply {
    pub fn failure(status: AttestationStatus) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignEnterpriseChallengeRequest {
    pub va_type: VaType,
    pub username: String,
    pub key_label: String,
    pub domain: String,
    pub device_id: Vec<u8>,
    /// Attach a signed public key (SPKAC) to the key info.
    pub include_signed_public_key: bool,
    pub challenge: SignedData,
}

#[derive(Debug, Clone)]
pub struct SignSimpleChallengeRequest {
    pub username: String,
    pub key_label: String,
    pub challenge: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SetKeyPayloadRequest {
    pub username: String,
    pub key_label: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ResetIdentityReply {
    pub status: AttestationStatus,
    /// Index of the corrective identity that was appended.
    pub identity_index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct GetEnrollmentIdReply {
    pub status: AttestationStatus,
    pub enrollment_id: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct GetCertifiedNvIndexRequest {
    pub quote_type: NvramQuoteType,
}

#[derive(Debug, Clone, Default)]
pub struct GetCertifiedNvIndexReply {
    pub status: AttestationStatus,
    pub quoted_data: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Simple status-only reply used by mutating operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusOnlyReply {
    pub status: AttestationStatus,
}

impl StatusOnlyReply {
    pub fn new(status: AttestationStatus) -> Self {
        Self { status }
    }

    pub fn success() -> Self {
        Self::new(AttestationStatus::Success)
    }
}

// Serialization is only needed where replies embed wire payloads; keep the
// derive list in one place for those.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPublicKey {
    pub public_key_der: Vec<u8>,
    pub challenge_nonce: Vec<u8>,
    pub signature: Vec<u8>,
}
