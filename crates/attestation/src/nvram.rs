//! Quoting of well-known NVRAM indices.
//!
//! A fixed, small set of platform data lives at known NV indices; quotes
//! over those indices are attached to identities so the CA can consume
//! them during certification. Some platform data is optional: callers that
//! can proceed without it pass `must_be_present = false`.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::database::{Identity, NvramQuoteRecord};
use crate::error::Result;
use crate::tpm::{Quote, TpmUtility};

/// The NVRAM data the engine knows how to quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NvramQuoteType {
    BoardId,
    SnBits,
    RsuDeviceId,
}

impl NvramQuoteType {
    pub fn all() -> [NvramQuoteType; 3] {
        [
            NvramQuoteType::BoardId,
            NvramQuoteType::SnBits,
            NvramQuoteType::RsuDeviceId,
        ]
    }
}

/// Location and expected size of one well-known NVRAM datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvramIndexData {
    pub nv_index: u32,
    pub nv_size: usize,
}

/// Map a quote type to its well-known NV index metadata.
pub fn index_data_for(quote_type: NvramQuoteType) -> NvramIndexData {
    match quote_type {
        NvramQuoteType::BoardId => NvramIndexData {
            nv_index: 0x003f_ff00,
            nv_size: 12,
        },
        NvramQuoteType::SnBits => NvramIndexData {
            nv_index: 0x003f_ff01,
            nv_size: 16,
        },
        NvramQuoteType::RsuDeviceId => NvramIndexData {
            nv_index: 0x003f_ff02,
            nv_size: 32,
        },
    }
}

/// Quote one NVRAM index.
///
/// With `must_be_present = false` a missing or unreadable index yields
/// `Ok(None)` and the caller proceeds without the quote; with `true` the
/// failure propagates and fails the whole operation.
pub fn quote_nvram_data(
    tpm: &dyn TpmUtility,
    quote_type: NvramQuoteType,
    challenge: &[u8],
    must_be_present: bool,
) -> Result<Option<Quote>> {
    let index_data = index_data_for(quote_type);
    match tpm.quote_nvram(index_data.nv_index, challenge) {
        Ok(quote) => Ok(Some(quote)),
        Err(e) if must_be_present => Err(e),
        Err(e) => {
            warn!(
                nv_index = format!("{:#x}", index_data.nv_index),
                "skipping optional NVRAM quote: {}", e
            );
            Ok(None)
        }
    }
}

/// Attach a quote to an identity, replacing any previous quote of the same
/// type.
pub fn insert_certified_nvram_data(
    identity: &mut Identity,
    quote_type: NvramQuoteType,
    quote: Quote,
) {
    identity
        .nvram_quotes
        .retain(|record| record.quote_type != quote_type);
    identity.nvram_quotes.push(NvramQuoteRecord { quote_type, quote });
}

/// Look up a stored quote on an identity.
pub fn find_certified_nvram_data(
    identity: &Identity,
    quote_type: NvramQuoteType,
) -> Option<&Quote> {
    identity
        .nvram_quotes
        .iter()
        .find(|record| record.quote_type == quote_type)
        .map(|record| &record.quote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::SoftwareTpm;

    #[test]
    fn test_index_map_is_stable() {
        assert_eq!(index_data_for(NvramQuoteType::BoardId).nv_index, 0x003f_ff00);
        assert_eq!(index_data_for(NvramQuoteType::SnBits).nv_index, 0x003f_ff01);
        assert_eq!(
            index_data_for(NvramQuoteType::RsuDeviceId).nv_index,
            0x003f_ff02
        );
    }

    #[test]
    fn test_missing_index_fails_when_required() {
        let tpm = SoftwareTpm::new();
        let result = quote_nvram_data(&tpm, NvramQuoteType::BoardId, b"c", true);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_index_skipped_when_optional() {
        let tpm = SoftwareTpm::new();
        let result = quote_nvram_data(&tpm, NvramQuoteType::RsuDeviceId, b"c", false).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_present_index_is_quoted() {
        let mut tpm = SoftwareTpm::new();
        tpm.define_nvram(index_data_for(NvramQuoteType::BoardId).nv_index, vec![1; 12]);
        let quote = quote_nvram_data(&tpm, NvramQuoteType::BoardId, b"c", true)
            .unwrap()
            .unwrap();
        assert!(!quote.signature.is_empty());
    }

    #[test]
    fn test_insert_replaces_previous_quote() {
        let mut identity = Identity::default();
        insert_certified_nvram_data(
            &mut identity,
            NvramQuoteType::SnBits,
            Quote {
                quoted_data: vec![1],
                signature: vec![2],
            },
        );
        insert_certified_nvram_data(
            &mut identity,
            NvramQuoteType::SnBits,
            Quote {
                quoted_data: vec![3],
                signature: vec![4],
            },
        );

        assert_eq!(identity.nvram_quotes.len(), 1);
        let stored = find_certified_nvram_data(&identity, NvramQuoteType::SnBits).unwrap();
        assert_eq!(stored.quoted_data, vec![3]);
        assert!(find_certified_nvram_data(&identity, NvramQuoteType::BoardId).is_none());
    }
}
