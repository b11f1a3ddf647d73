//! One-time fold of the legacy single-identity database layout into the
//! multi-identity layout.
//!
//! The migration runs inside the worker context (or before the worker
//! starts) and never concurrently with itself. A failure leaves the legacy
//! fields in place; an already-migrated image reports `NotNeeded` and is
//! not touched.

use tracing::{info, warn};

use crate::database::{AttestationDatabaseData, Identity, IdentityFeatures};

/// Result of a migration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Legacy fields were folded into `identities[0]`.
    Migrated,
    /// The image was already in the multi-identity layout.
    NotNeeded,
}

/// Fold legacy single-identity fields into `identities[0]`.
///
/// Each legacy sub-field is folded independently; a missing quote or
/// binding does not abort the migration of the rest. Running the migration
/// on an already-migrated image is a no-op.
pub fn migrate_attestation_database(data: &mut AttestationDatabaseData) -> MigrationOutcome {
    let has_legacy = data.legacy_identity_key.is_some()
        || data.legacy_identity_binding.is_some()
        || data.legacy_pcr0_quote.is_some()
        || data.legacy_pcr1_quote.is_some();

    if !has_legacy {
        return MigrationOutcome::NotNeeded;
    }

    // A legacy identity predates enrollment-ID support.
    if data.identities.is_empty() {
        data.identities.push(Identity {
            features: IdentityFeatures {
                enrollment_id: false,
            },
            ..Default::default()
        });
    }
    let identity = &mut data.identities[0];

    if let Some(key) = data.legacy_identity_key.take() {
        if identity.identity_key.is_none() {
            identity.identity_key = Some(key);
        }
    } else {
        warn!("legacy image has no identity key; migrating remaining fields");
    }
    if let Some(binding) = data.legacy_identity_binding.take() {
        if identity.identity_binding.is_none() {
            identity.identity_binding = Some(binding);
        }
    }
    if let Some(quote) = data.legacy_pcr0_quote.take() {
        if identity.pcr0_quote.is_none() {
            identity.pcr0_quote = Some(quote);
        }
    }
    if let Some(quote) = data.legacy_pcr1_quote.take() {
        if identity.pcr1_quote.is_none() {
            identity.pcr1_quote = Some(quote);
        }
    }

    info!("migrated legacy attestation database to multi-identity layout");
    MigrationOutcome::Migrated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::IdentityKeyRecord;
    use crate::tpm::Quote;

    fn legacy_image() -> AttestationDatabaseData {
        AttestationDatabaseData {
            legacy_identity_key: Some(IdentityKeyRecord {
                public_key_der: vec![1, 2, 3],
                key_blob: vec![4, 5, 6],
            }),
            legacy_identity_binding: Some(vec![7, 8]),
            legacy_pcr0_quote: Some(Quote {
                quoted_data: vec![9],
                signature: vec![10],
            }),
            legacy_pcr1_quote: Some(Quote {
                quoted_data: vec![11],
                signature: vec![12],
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_migrates_legacy_fields_into_first_identity() {
        let mut data = legacy_image();
        assert_eq!(migrate_attestation_database(&mut data), MigrationOutcome::Migrated);

        assert_eq!(data.identities.len(), 1);
        let identity = &data.identities[0];
        assert_eq!(
            identity.identity_key.as_ref().unwrap().public_key_der,
            vec![1, 2, 3]
        );
        assert_eq!(identity.identity_binding, Some(vec![7, 8]));
        assert!(identity.pcr0_quote.is_some());
        assert!(identity.pcr1_quote.is_some());
        assert!(!identity.features.enrollment_id);

        // Legacy fields are cleared.
        assert!(data.legacy_identity_key.is_none());
        assert!(data.legacy_identity_binding.is_none());
        assert!(data.legacy_pcr0_quote.is_none());
        assert!(data.legacy_pcr1_quote.is_none());
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let mut data = legacy_image();
        assert_eq!(migrate_attestation_database(&mut data), MigrationOutcome::Migrated);
        let snapshot = data.clone();

        assert_eq!(migrate_attestation_database(&mut data), MigrationOutcome::NotNeeded);
        assert_eq!(data, snapshot);
    }

    #[test]
    fn test_fresh_image_needs_no_migration() {
        let mut data = AttestationDatabaseData::default();
        assert_eq!(migrate_attestation_database(&mut data), MigrationOutcome::NotNeeded);
        assert!(data.identities.is_empty());
    }

    #[test]
    fn test_missing_sub_fields_are_tolerated() {
        let mut data = AttestationDatabaseData {
            legacy_identity_binding: Some(vec![1]),
            ..Default::default()
        };
        assert_eq!(migrate_attestation_database(&mut data), MigrationOutcome::Migrated);

        let identity = &data.identities[0];
        assert!(identity.identity_key.is_none());
        assert_eq!(identity.identity_binding, Some(vec![1]));
        assert!(identity.pcr0_quote.is_none());
    }

    #[test]
    fn test_partial_prior_run_fills_gaps_without_overwriting() {
        // Simulates a crash after identities[0] was created with the key but
        // before the binding was folded.
        let mut data = legacy_image();
        data.identities.push(Identity {
            identity_key: Some(IdentityKeyRecord {
                public_key_der: vec![0xAA],
                key_blob: vec![0xBB],
            }),
            ..Default::default()
        });

        assert_eq!(migrate_attestation_database(&mut data), MigrationOutcome::Migrated);

        let identity = &data.identities[0];
        // The existing key is preserved, not overwritten by the legacy one.
        assert_eq!(identity.identity_key.as_ref().unwrap().public_key_der, vec![0xAA]);
        // Missing fields are filled from the legacy image.
        assert_eq!(identity.identity_binding, Some(vec![7, 8]));
    }
}
