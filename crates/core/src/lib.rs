//! Core functionality shared across the Certus attestation service.
//!
//! This crate provides the error type, structured logging bootstrap, and
//! service configuration used by the attestation engine and the daemon.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{AcaConfig, DatabaseConfig, EnterpriseConfig, ServiceConfig};
pub use error::{CoreError, Result};
