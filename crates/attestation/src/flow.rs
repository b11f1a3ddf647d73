//! Per-request flow context for the enrollment and certification state
//! machines.
//!
//! Every CA-bound request carries one [`AttestationFlow`] through the
//! worker. The next step is an explicit [`FlowAction`] processed by the
//! engine's driver loop, which makes the enroll-then-certify chaining a
//! visible state instead of nested callbacks.
//!
//! # State Transitions
//!
//! ```text
//! StartEnroll
//!     ↓ (transport round trip)
//! FinishEnroll ──────────────┐
//!     ↓ (enroll-only)        ↓ (enroll-and-certify)
//! Complete             StartCertificate
//!                            ↓ (transport round trip)
//!                      FinishCertificate
//!                            ↓
//!                        Complete
//! ```
//!
//! Any step may short-circuit to `Complete` with a failure status.

use crate::queues::CertRequestKey;
use crate::tpm::CertifiedKeyMaterial;
use crate::types::{AcaType, AttestationStatus, CertificateProfile, KeyType, KeyUsage};

/// Next step for a flow, executed by the worker's driver loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAction {
    StartEnroll,
    FinishEnroll,
    StartCertificate,
    FinishCertificate,
    Complete,
}

/// Parameters of the certificate half of a flow.
#[derive(Debug, Clone)]
pub struct CertificationData {
    pub username: String,
    pub key_label: String,
    pub profile: CertificateProfile,
    pub origin: String,
    pub key_type: KeyType,
    pub key_usage: KeyUsage,
    /// Key material created for this request, carried until the chain
    /// arrives and the key can be persisted in one step.
    pub key_material: Option<CertifiedKeyMaterial>,
}

impl CertificationData {
    pub fn request_key(&self, aca_type: AcaType) -> CertRequestKey {
        CertRequestKey {
            aca_type,
            username: self.username.clone(),
            key_label: self.key_label.clone(),
            profile: self.profile,
            origin: self.origin.clone(),
        }
    }
}

/// Mutable context threaded through one enrollment / certification flow.
#[derive(Debug)]
pub struct AttestationFlow {
    pub aca_type: AcaType,
    pub action: FlowAction,
    /// `None` for enroll-only flows.
    pub certification: Option<CertificationData>,
    /// Whether this flow owns the in-flight enrollment slot for its ACA.
    pub owns_enrollment: bool,
    /// Re-enroll even when already enrolled.
    pub forced_enroll: bool,
    /// Serialized outbound CA request.
    pub request: Vec<u8>,
    /// Raw CA reply, set by the transport task.
    pub reply: Vec<u8>,
    /// Round-trip token for certificate requests.
    pub message_id: Vec<u8>,
    pub status: AttestationStatus,
    /// CA-provided detail string, only set on `RequestDeniedByCa`.
    pub server_error: String,
    /// PEM chain assembled on certification success.
    pub certificate_chain: String,
    /// Public key of the certified key, for the reply.
    pub public_key_der: Vec<u8>,
}

impl AttestationFlow {
    pub fn for_enrollment(aca_type: AcaType, forced: bool) -> Self {
        Self {
            aca_type,
            action: FlowAction::StartEnroll,
            certification: None,
            owns_enrollment: false,
            forced_enroll: forced,
            request: Vec::new(),
            reply: Vec::new(),
            message_id: Vec::new(),
            status: AttestationStatus::Success,
            server_error: String::new(),
            certificate_chain: String::new(),
            public_key_der: Vec::new(),
        }
    }

    pub fn for_certification(aca_type: AcaType, certification: CertificationData) -> Self {
        let mut flow = Self::for_enrollment(aca_type, false);
        flow.action = FlowAction::StartCertificate;
        flow.certification = Some(certification);
        flow
    }

    /// Terminate the flow with a failure status.
    pub fn fail(&mut self, status: AttestationStatus) {
        self.status = status;
        self.action = FlowAction::Complete;
    }

    /// Terminate with the CA's rejection detail.
    pub fn fail_with_ca_detail(&mut self, detail: String) {
        self.server_error = detail;
        self.fail(AttestationStatus::RequestDeniedByCa);
    }

    pub fn is_certification(&self) -> bool {
        self.certification.is_some()
    }
}
