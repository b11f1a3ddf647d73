//! Certus attestation daemon.
//!
//! Composition root: loads the service configuration, wires the production
//! collaborators into the attestation engine, and keeps the worker running
//! until the process is asked to stop. IPC dispatch is not part of this
//! binary; platform services embed the engine handle directly.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use certus_attestation::engine::{AttestationService, DevicePolicy, EngineDeps};
use certus_attestation::{
    AcaType, GoogleKeys, InMemoryKeyStore, JsonFileDatabase, SoftwareCa, SoftwareCryptoUtility,
    SoftwareTpm,
};
use certus_core::{logging, ServiceConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version") {
        println!("certusd {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = match parse_config_path(&args)? {
        Some(path) => ServiceConfig::from_file(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ServiceConfig::default_config(),
    };

    if config.log_json {
        logging::init_json();
    } else {
        logging::init();
    }

    let abe_data = match &config.enterprise.abe_data {
        Some(raw) => hex::decode(raw).context("enterprise.abe_data is not valid hex")?,
        None => Vec::new(),
    };

    // Loopback deployment: the CA runs in process. A networked deployment
    // substitutes its own AcaClient and key table here.
    let ca = Arc::new(SoftwareCa::new());
    let mut google_keys = GoogleKeys::new();
    for aca in AcaType::all() {
        google_keys.set_ca_encryption_key(aca, ca.encryption_public_key_der());
    }

    let database = JsonFileDatabase::open(&config.database.path)
        .with_context(|| format!("opening database at {}", config.database.path))?;

    let service = AttestationService::start(EngineDeps {
        database: Box::new(database),
        key_store: Box::new(InMemoryKeyStore::new()),
        tpm: Box::new(SoftwareTpm::new()),
        crypto: Box::new(SoftwareCryptoUtility::new()),
        aca: ca,
        google_keys,
        policy: DevicePolicy {
            customer_id: config.enterprise.customer_id.clone(),
            abe_data,
        },
    });

    let preparations = service.get_enrollment_preparations().await?;
    for (aca, prepared) in &preparations.prepared {
        if *prepared {
            info!(?aca, "enrollment prepared");
        } else {
            warn!(?aca, "enrollment not prepared");
        }
    }

    info!("certusd running");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    service.shutdown();
    Ok(())
}

fn parse_config_path(args: &[String]) -> anyhow::Result<Option<PathBuf>> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            return match args_iter.next() {
                Some(path) => Ok(Some(PathBuf::from(path))),
                None => Err(anyhow::anyhow!("--config was provided without a path")),
            };
        }
    }
    Ok(None)
}
