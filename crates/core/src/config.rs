//! Configuration management for the Certus daemon.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CoreError, Result};

/// Top-level service configuration, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub database: DatabaseConfig,
    pub aca: AcaConfig,
    #[serde(default)]
    pub enterprise: EnterpriseConfig,
    /// Emit JSON logs instead of human-readable output.
    #[serde(default)]
    pub log_json: bool,
}

/// Where the attestation database image lives on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// Attestation CA endpoints, one per CA flavor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcaConfig {
    pub default_url: String,
    pub test_url: String,
}

/// Enterprise policy inputs consumed by challenge signing and the
/// enrollment-ID derivation. Both fields are optional; unmanaged devices
/// leave them unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnterpriseConfig {
    pub customer_id: Option<String>,
    /// Enterprise seed (abe_data), hex-encoded.
    pub abe_data: Option<String>,
}

impl ServiceConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config =
            toml::from_str(&content).map_err(|e| CoreError::Config(e.to_string()))?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "/var/lib/certus/attestation.db".to_string(),
            },
            aca: AcaConfig {
                default_url: "https://ca.certus.example/enroll".to_string(),
                test_url: "https://ca-test.certus.example/enroll".to_string(),
            },
            enterprise: EnterpriseConfig::default(),
            log_json: false,
        }
    }
}
