//! Attestation CA wire messages, the transport seam, and an in-process CA.
//!
//! The engine only ever sees serialized request/response bodies moving
//! through [`AcaClient`]; the actual HTTP transport lives outside this
//! crate. [`SoftwareCa`] implements the CA side of the protocol in process
//! and is used by the daemon's loopback mode and the integration tests.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use p256::ecdsa::SigningKey;
use p256::pkcs8::EncodePublicKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::crypto::{
    open_for_recipient, CryptoUtility, EncryptedData, EncryptedIdentityCredential,
    SoftwareCryptoUtility,
};
use crate::error::{AttestationError, Result};
use crate::tpm::{EndorsementCredential, Quote};
use crate::types::{AcaType, CertificateProfile, VaType};

/// Wire-level status reported by the CA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaResponseStatus {
    Ok,
    ServerError,
}

/// Enrollment request body sent to `/enroll`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollCaRequest {
    /// Endorsement credential encrypted to the CA's public key.
    pub encrypted_endorsement_credential: EncryptedData,
    /// Attestation identity public key, DER-encoded.
    pub identity_public_key: Vec<u8>,
    /// Proof that the identity key is TPM-resident.
    pub identity_binding: Vec<u8>,
    pub pcr0_quote: Quote,
    pub pcr1_quote: Quote,
    /// Present when the device participates in enterprise enrollment-ID
    /// tracking.
    pub enterprise_enrollment_nonce: Option<Vec<u8>>,
}

/// Enrollment response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollCaResponse {
    pub status: CaResponseStatus,
    /// Human-readable detail, set on `ServerError`.
    #[serde(default)]
    pub detail: String,
    pub encrypted_identity_credential: Option<EncryptedIdentityCredential>,
}

/// Certificate request body sent to `/sign`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateCaRequest {
    /// Round-trip token guarding against misrouted replies.
    pub message_id: Vec<u8>,
    /// Identity credential issued at enrollment.
    pub identity_credential: Vec<u8>,
    pub certified_public_key: Vec<u8>,
    pub certify_info: Vec<u8>,
    pub certify_info_signature: Vec<u8>,
    pub profile: CertificateProfile,
    pub origin: String,
    pub temporal_index: u32,
}

/// Certificate response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateCaResponse {
    pub status: CaResponseStatus,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub message_id: Vec<u8>,
    /// Leaf certificate, DER-encoded.
    #[serde(default)]
    pub certified_key_credential: Vec<u8>,
    #[serde(default)]
    pub intermediate_ca_cert: Vec<u8>,
    #[serde(default)]
    pub additional_intermediate_ca_certs: Vec<Vec<u8>>,
}

/// Transport seam to the Attestation CA. Implementations resolve the
/// endpoint from the CA flavor; errors are transport-level only. A CA
/// that answers with `ServerError` is a successful transport round trip.
#[async_trait]
pub trait AcaClient: Send + Sync {
    async fn enroll(&self, aca_type: AcaType, request: Vec<u8>) -> Result<Vec<u8>>;
    async fn get_certificate(&self, aca_type: AcaType, request: Vec<u8>) -> Result<Vec<u8>>;
}

/// Table of well-known service public keys, selected by CA / VA flavor.
#[derive(Debug, Clone, Default)]
pub struct GoogleKeys {
    ca_encryption_keys: HashMap<AcaType, Vec<u8>>,
    va_signing_keys: HashMap<VaType, Vec<u8>>,
    va_encryption_keys: HashMap<VaType, Vec<u8>>,
}

impl GoogleKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ca_encryption_key(&mut self, aca: AcaType, public_key_der: Vec<u8>) {
        self.ca_encryption_keys.insert(aca, public_key_der);
    }

    pub fn set_va_signing_key(&mut self, va: VaType, public_key_der: Vec<u8>) {
        self.va_signing_keys.insert(va, public_key_der);
    }

    pub fn set_va_encryption_key(&mut self, va: VaType, public_key_der: Vec<u8>) {
        self.va_encryption_keys.insert(va, public_key_der);
    }

    pub fn ca_encryption_key(&self, aca: AcaType) -> Option<&[u8]> {
        self.ca_encryption_keys.get(&aca).map(|k| k.as_slice())
    }

    pub fn va_signing_key(&self, va: VaType) -> Option<&[u8]> {
        self.va_signing_keys.get(&va).map(|k| k.as_slice())
    }

    pub fn va_encryption_key(&self, va: VaType) -> Option<&[u8]> {
        self.va_encryption_keys.get(&va).map(|k| k.as_slice())
    }
}

/// Leaf certificate body issued by [`SoftwareCa`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedCertificate {
    pub serial: u64,
    pub issuer: String,
    pub subject_public_key_der: Vec<u8>,
    pub profile: CertificateProfile,
    pub origin: String,
}

/// Identity credential body issued by [`SoftwareCa`] at enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedIdentityCredential {
    pub serial: u64,
    pub issuer: String,
}

const SOFTWARE_CA_ISSUER: &str = "Certus Software CA";

/// In-process Attestation CA. Performs the CA side of the enrollment and
/// certification protocol against the same software crypto scheme the
/// device uses.
pub struct SoftwareCa {
    crypto: SoftwareCryptoUtility,
    signing_key: SigningKey,
    encryption_public_key: Vec<u8>,
    next_serial: AtomicU64,
}

impl SoftwareCa {
    pub fn new() -> Self {
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        let encryption_public_key = signing_key
            .verifying_key()
            .to_public_key_der()
            .expect("P-256 public key encodes")
            .as_bytes()
            .to_vec();
        Self {
            crypto: SoftwareCryptoUtility::new(),
            signing_key,
            encryption_public_key,
            next_serial: AtomicU64::new(1),
        }
    }

    /// Public key devices encrypt their endorsement credential to.
    pub fn encryption_public_key_der(&self) -> Vec<u8> {
        self.encryption_public_key.clone()
    }

    /// The CA's own certificate, reported as the intermediate of every
    /// issued chain.
    pub fn ca_certificate_der(&self) -> Vec<u8> {
        let cert = IssuedCertificate {
            serial: 0,
            issuer: SOFTWARE_CA_ISSUER.to_string(),
            subject_public_key_der: self.encryption_public_key.clone(),
            profile: CertificateProfile::EnterpriseMachineCertificate,
            origin: String::new(),
        };
        serde_json::to_vec(&cert).expect("certificate body serializes")
    }

    /// Process a serialized [`EnrollCaRequest`].
    pub fn handle_enroll(&self, body: &[u8]) -> Result<Vec<u8>> {
        let request: EnrollCaRequest = serde_json::from_slice(body)?;
        let response = match self.issue_identity_credential(&request) {
            Ok(credential) => EnrollCaResponse {
                status: CaResponseStatus::Ok,
                detail: String::new(),
                encrypted_identity_credential: Some(credential),
            },
            Err(e) => EnrollCaResponse {
                status: CaResponseStatus::ServerError,
                detail: e.to_string(),
                encrypted_identity_credential: None,
            },
        };
        Ok(serde_json::to_vec(&response)?)
    }

    /// Process a serialized [`CertificateCaRequest`].
    pub fn handle_certificate(&self, body: &[u8]) -> Result<Vec<u8>> {
        let request: CertificateCaRequest = serde_json::from_slice(body)?;
        let response = match self.issue_certificate(&request) {
            Ok(leaf) => CertificateCaResponse {
                status: CaResponseStatus::Ok,
                detail: String::new(),
                message_id: request.message_id,
                certified_key_credential: leaf,
                intermediate_ca_cert: self.ca_certificate_der(),
                additional_intermediate_ca_certs: Vec::new(),
            },
            Err(e) => CertificateCaResponse {
                status: CaResponseStatus::ServerError,
                detail: e.to_string(),
                message_id: request.message_id,
                certified_key_credential: Vec::new(),
                intermediate_ca_cert: Vec::new(),
                additional_intermediate_ca_certs: Vec::new(),
            },
        };
        Ok(serde_json::to_vec(&response)?)
    }

    fn issue_identity_credential(
        &self,
        request: &EnrollCaRequest,
    ) -> Result<EncryptedIdentityCredential> {
        if request.identity_public_key.is_empty() {
            return Err(AttestationError::InvalidState(
                "missing identity public key".to_string(),
            ));
        }
        if request.pcr0_quote.signature.is_empty() || request.pcr1_quote.signature.is_empty() {
            return Err(AttestationError::InvalidState(
                "missing boot state quotes".to_string(),
            ));
        }

        let credential_bytes = open_for_recipient(
            &request.encrypted_endorsement_credential,
            &self.encryption_public_key,
        )?;
        let endorsement: EndorsementCredential = serde_json::from_slice(&credential_bytes)?;
        if endorsement.public_key_der.is_empty() {
            return Err(AttestationError::InvalidState(
                "endorsement credential carries no key".to_string(),
            ));
        }

        let issued = IssuedIdentityCredential {
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
            issuer: SOFTWARE_CA_ISSUER.to_string(),
        };
        self.crypto.encrypt_identity_credential(
            &serde_json::to_vec(&issued)?,
            &endorsement.public_key_der,
            &request.identity_public_key,
        )
    }

    fn issue_certificate(&self, request: &CertificateCaRequest) -> Result<Vec<u8>> {
        if request.identity_credential.is_empty() {
            return Err(AttestationError::InvalidState(
                "missing identity credential".to_string(),
            ));
        }
        if request.certified_public_key.is_empty() || request.certify_info_signature.is_empty() {
            return Err(AttestationError::InvalidState(
                "missing certified key material".to_string(),
            ));
        }
        let cert = IssuedCertificate {
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
            issuer: SOFTWARE_CA_ISSUER.to_string(),
            subject_public_key_der: request.certified_public_key.clone(),
            profile: request.profile,
            origin: request.origin.clone(),
        };
        Ok(serde_json::to_vec(&cert)?)
    }
}

impl Default for SoftwareCa {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AcaClient for SoftwareCa {
    async fn enroll(&self, _aca_type: AcaType, request: Vec<u8>) -> Result<Vec<u8>> {
        self.handle_enroll(&request)
    }

    async fn get_certificate(&self, _aca_type: AcaType, request: Vec<u8>) -> Result<Vec<u8>> {
        self.handle_certificate(&request)
    }
}

/// Render one DER certificate as a PEM block with 64-column body lines.
pub fn pem_encode_certificate(der: &[u8]) -> String {
    let encoded = BASE64.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(chunk).expect("base64 output is ASCII"));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

/// Render a full chain, leaf first, then intermediates in reported order.
pub fn pem_encode_certificate_chain<'a, I>(certificates: I) -> String
where
    I: IntoIterator<Item = &'a [u8]>,
{
    certificates
        .into_iter()
        .filter(|der| !der.is_empty())
        .map(pem_encode_certificate)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoUtility;
    use crate::tpm::{SoftwareTpm, TpmUtility};
    use crate::types::KeyUsage;

    fn enroll_request(ca: &SoftwareCa, tpm: &mut SoftwareTpm) -> (EnrollCaRequest, Vec<u8>) {
        let crypto = SoftwareCryptoUtility::new();
        let (identity, binding) = tpm.create_identity().unwrap();
        let credential = tpm.endorsement_credential().unwrap();
        let encrypted = crypto
            .encrypt_for_recipient(&credential, &ca.encryption_public_key_der())
            .unwrap();
        let request = EnrollCaRequest {
            encrypted_endorsement_credential: encrypted,
            identity_public_key: identity.public_key_der.clone(),
            identity_binding: binding,
            pcr0_quote: tpm.quote_pcr(0, b"n0").unwrap(),
            pcr1_quote: tpm.quote_pcr(1, b"n1").unwrap(),
            enterprise_enrollment_nonce: None,
        };
        (request, identity.key_blob)
    }

    #[test]
    fn test_enroll_issues_activatable_credential() {
        let ca = SoftwareCa::new();
        let mut tpm = SoftwareTpm::new();
        let (request, identity_blob) = enroll_request(&ca, &mut tpm);

        let raw = ca.handle_enroll(&serde_json::to_vec(&request).unwrap()).unwrap();
        let response: EnrollCaResponse = serde_json::from_slice(&raw).unwrap();
        assert_eq!(response.status, CaResponseStatus::Ok);
        assert!(response.detail.is_empty());

        let credential = tpm
            .activate_identity(&identity_blob, &response.encrypted_identity_credential.unwrap())
            .unwrap();
        let issued: IssuedIdentityCredential = serde_json::from_slice(&credential).unwrap();
        assert_eq!(issued.issuer, SOFTWARE_CA_ISSUER);
    }

    #[test]
    fn test_enroll_rejects_missing_quotes() {
        let ca = SoftwareCa::new();
        let mut tpm = SoftwareTpm::new();
        let (mut request, _) = enroll_request(&ca, &mut tpm);
        request.pcr0_quote = Quote::default();

        let raw = ca.handle_enroll(&serde_json::to_vec(&request).unwrap()).unwrap();
        let response: EnrollCaResponse = serde_json::from_slice(&raw).unwrap();
        assert_eq!(response.status, CaResponseStatus::ServerError);
        assert!(!response.detail.is_empty());
        assert!(response.encrypted_identity_credential.is_none());
    }

    #[test]
    fn test_certificate_echoes_message_id() {
        let ca = SoftwareCa::new();
        let mut tpm = SoftwareTpm::new();
        let (identity, _) = tpm.create_identity().unwrap();
        let material = tpm
            .create_certified_key(
                crate::types::KeyType::Ecc,
                KeyUsage::Sign,
                &identity.key_blob,
                b"external",
            )
            .unwrap();

        let request = CertificateCaRequest {
            message_id: vec![9, 9, 9],
            identity_credential: b"credential".to_vec(),
            certified_public_key: material.public_key_der,
            certify_info: material.certify_info,
            certify_info_signature: material.certify_info_signature,
            profile: CertificateProfile::EnterpriseUserCertificate,
            origin: "origin".to_string(),
            temporal_index: 0,
        };
        let raw = ca
            .handle_certificate(&serde_json::to_vec(&request).unwrap())
            .unwrap();
        let response: CertificateCaResponse = serde_json::from_slice(&raw).unwrap();

        assert_eq!(response.status, CaResponseStatus::Ok);
        assert_eq!(response.message_id, vec![9, 9, 9]);
        assert!(!response.certified_key_credential.is_empty());
        assert!(!response.intermediate_ca_cert.is_empty());

        let leaf: IssuedCertificate =
            serde_json::from_slice(&response.certified_key_credential).unwrap();
        assert_eq!(leaf.origin, "origin");
        assert_eq!(leaf.profile, CertificateProfile::EnterpriseUserCertificate);
    }

    #[test]
    fn test_pem_block_shape() {
        let pem = pem_encode_certificate(&[0u8; 100]);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));
        for line in pem.lines() {
            assert!(line.len() <= 64 || line.starts_with("-----"));
        }
    }

    #[test]
    fn test_pem_chain_order_and_empty_filtering() {
        let leaf = vec![1u8; 10];
        let intermediate = vec![2u8; 10];
        let chain = pem_encode_certificate_chain([leaf.as_slice(), &[], intermediate.as_slice()]);
        let expected =
            format!("{}{}", pem_encode_certificate(&leaf), pem_encode_certificate(&intermediate));
        assert_eq!(chain, expected);
    }
}
