//! Shared enums and status codes for the attestation engine.
//!
//! Everything here crosses at least one seam: the public operation surface,
//! the persisted database image, or the CA wire messages.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// Attestation CA flavors the service can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AcaType {
    /// Production Attestation CA
    Default,
    /// Test Attestation CA
    Test,
}

impl AcaType {
    /// Number of CA flavors; sizes the per-ACA status table.
    pub const COUNT: usize = 2;

    pub fn index(self) -> usize {
        match self {
            AcaType::Default => 0,
            AcaType::Test => 1,
        }
    }

    pub fn all() -> [AcaType; Self::COUNT] {
        [AcaType::Default, AcaType::Test]
    }
}

/// Verified Access server flavors for enterprise challenges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VaType {
    Default,
    Test,
}

/// Certified key algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    #[default]
    Rsa,
    Ecc,
}

/// What a certified key is allowed to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyUsage {
    #[default]
    Sign,
    Decrypt,
}

/// Certificate profiles understood by the Attestation CA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CertificateProfile {
    EnterpriseMachineCertificate,
    EnterpriseUserCertificate,
    EnterpriseEnrollmentCertificate,
    ContentProtectionCertificate,
}

/// Status code carried on every reply. Internal failures collapse into
/// `UnexpectedDeviceError`; only the CA-provided detail string is ever
/// relayed beyond these codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttestationStatus {
    Success,
    /// Generic internal failure (TPM, RNG, database, key store).
    UnexpectedDeviceError,
    /// The request cannot be served right now (queue full, feature absent).
    NotAvailable,
    /// The TPM is not ready for attestation work.
    NotReady,
    InvalidParameter,
    /// The CA rejected the request; the reply carries the CA detail string.
    RequestDeniedByCa,
    /// The CA could not be reached at the transport level.
    CaNotAvailable,
}

impl AttestationStatus {
    pub fn is_success(self) -> bool {
        self == AttestationStatus::Success
    }
}

/// Replies default to the generic failure so a half-built reply can never
/// read as success.
impl Default for AttestationStatus {
    fn default() -> Self {
        AttestationStatus::UnexpectedDeviceError
    }
}

/// Who owns a certified key. The empty username maps to the device-wide
/// key list; anything else is a per-user key held in the key store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyOwner {
    Device,
    User(String),
}

impl KeyOwner {
    pub fn from_username(username: &str) -> Self {
        if username.is_empty() {
            KeyOwner::Device
        } else {
            KeyOwner::User(username.to_string())
        }
    }

    pub fn username(&self) -> &str {
        match self {
            KeyOwner::Device => "",
            KeyOwner::User(name) => name,
        }
    }

    pub fn is_device(&self) -> bool {
        matches!(self, KeyOwner::Device)
    }
}

/// Per-ACA enrollment progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EnrollmentStatus {
    Unknown = 0,
    NotEnrolled = 1,
    InProgress = 2,
    Enrolled = 3,
}

impl EnrollmentStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EnrollmentStatus::NotEnrolled,
            2 => EnrollmentStatus::InProgress,
            3 => EnrollmentStatus::Enrolled,
            _ => EnrollmentStatus::Unknown,
        }
    }
}

/// Lock-free per-ACA enrollment status slots.
///
/// All other engine state is confined to the worker context; these slots are
/// also read from calling contexts for fast status checks, so they use
/// acquire/release atomics.
#[derive(Debug, Default)]
pub struct EnrollmentStatusTable {
    slots: [AtomicU8; AcaType::COUNT],
}

impl EnrollmentStatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, aca: AcaType) -> EnrollmentStatus {
        EnrollmentStatus::from_u8(self.slots[aca.index()].load(Ordering::Acquire))
    }

    pub fn set(&self, aca: AcaType, status: EnrollmentStatus) {
        self.slots[aca.index()].store(status as u8, Ordering::Release);
    }

    pub fn is_enrolled(&self, aca: AcaType) -> bool {
        self.get(aca) == EnrollmentStatus::Enrolled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_owner_dispatch() {
        assert_eq!(KeyOwner::from_username(""), KeyOwner::Device);
        assert_eq!(
            KeyOwner::from_username("user@example.com"),
            KeyOwner::User("user@example.com".to_string())
        );
        assert_eq!(KeyOwner::from_username("u").username(), "u");
        assert!(KeyOwner::from_username("").is_device());
    }

    #[test]
    fn test_status_table_defaults_to_unknown() {
        let table = EnrollmentStatusTable::new();
        for aca in AcaType::all() {
            assert_eq!(table.get(aca), EnrollmentStatus::Unknown);
            assert!(!table.is_enrolled(aca));
        }
    }

    #[test]
    fn test_status_table_slots_are_independent() {
        let table = EnrollmentStatusTable::new();
        table.set(AcaType::Default, EnrollmentStatus::Enrolled);
        assert!(table.is_enrolled(AcaType::Default));
        assert_eq!(table.get(AcaType::Test), EnrollmentStatus::Unknown);

        table.set(AcaType::Test, EnrollmentStatus::InProgress);
        assert_eq!(table.get(AcaType::Test), EnrollmentStatus::InProgress);
        assert!(table.is_enrolled(AcaType::Default));
    }

    #[test]
    fn test_enrollment_status_round_trip() {
        for status in [
            EnrollmentStatus::Unknown,
            EnrollmentStatus::NotEnrolled,
            EnrollmentStatus::InProgress,
            EnrollmentStatus::Enrolled,
        ] {
            assert_eq!(EnrollmentStatus::from_u8(status as u8), status);
        }
    }

    #[test]
    fn test_aca_indices_cover_table() {
        let mut seen = [false; AcaType::COUNT];
        for aca in AcaType::all() {
            seen[aca.index()] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }
}
