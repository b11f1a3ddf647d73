//! The attestation engine: public operation surface plus the single worker
//! task that owns all mutable state.
//!
//! Every public call enqueues a command and returns a future for the reply;
//! the worker executes commands in submission order. CA round trips run in
//! spawned transport tasks that post a continuation command back to the
//! worker, which is what lets concurrent identical requests coalesce while
//! one round trip is in flight.
//!
//! # Security Properties
//!
//! - All identity, key, and queue state is confined to the worker task
//! - Per-ACA enrollment status is the only cross-thread state (atomics)
//! - After shutdown begins, no completion handle is ever resolved
//! - CA rejection details pass through verbatim; internal errors do not

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::ca::{
    pem_encode_certificate_chain, AcaClient, CaResponseStatus, CertificateCaRequest,
    CertificateCaResponse, EnrollCaRequest, EnrollCaResponse, GoogleKeys,
};
use crate::crypto::{CryptoUtility, EncryptedData};
use crate::database::{
    CertifiedKey, Database, EncryptedCredentialRecord, Identity, IdentityCertificateRecord,
    IdentityFeatures, IdentityKeyRecord, TemporalIndexRecord,
};
use crate::enterprise::{
    build_challenge_response, compute_enterprise_enrollment_id,
    compute_enterprise_enrollment_nonce, validate_enterprise_challenge, EnterpriseKeyType, KeyInfo,
    SignedData,
};
use crate::error::{AttestationError, Result};
use crate::flow::{AttestationFlow, CertificationData, FlowAction};
use crate::keystore::KeyStore;
use crate::migration::{migrate_attestation_database, MigrationOutcome};
use crate::nvram::{find_certified_nvram_data, insert_certified_nvram_data, quote_nvram_data};
use crate::queues::{Admission, CertificateQueue, EnrollmentQueue};
use crate::rpc::*;
use crate::tpm::{verify_certify_statement, CertifiedKeyMaterial, TpmUtility};
use crate::types::{
    AcaType, AttestationStatus, EnrollmentStatus, EnrollmentStatusTable, KeyOwner, KeyUsage,
};

/// Identities are append-only; the first one is the device's default.
const FIRST_IDENTITY: usize = 0;

const EXTERNAL_DATA_SIZE: usize = 32;
const MESSAGE_ID_SIZE: usize = 16;
const SIMPLE_CHALLENGE_NONCE_SIZE: usize = 20;

/// Enterprise policy inputs the engine consumes.
#[derive(Debug, Clone, Default)]
pub struct DevicePolicy {
    pub customer_id: Option<String>,
    /// Enterprise seed (abe_data); empty on unmanaged devices.
    pub abe_data: Vec<u8>,
}

/// Constructor-injected collaborators. They cannot be swapped once the
/// worker is running.
pub struct EngineDeps {
    pub database: Box<dyn Database>,
    pub key_store: Box<dyn KeyStore>,
    pub tpm: Box<dyn TpmUtility>,
    pub crypto: Box<dyn CryptoUtility>,
    pub aca: Arc<dyn AcaClient>,
    pub google_keys: GoogleKeys,
    pub policy: DevicePolicy,
}

enum Command {
    Enroll(EnrollRequest, oneshot::Sender<EnrollReply>),
    GetCertificate(GetCertificateRequest, oneshot::Sender<GetCertificateReply>),
    ContinueFlow(Box<AttestationFlow>),
    CreateCertifiableKey(CreateCertifiableKeyRequest, oneshot::Sender<KeyInfoReply>),
    GetKeyInfo {
        username: String,
        key_label: String,
        reply: oneshot::Sender<KeyInfoReply>,
    },
    GetEndorsementInfo(oneshot::Sender<EndorsementInfoReply>),
    GetAttestationKeyInfo(AcaType, oneshot::Sender<AttestationKeyInfoReply>),
    ActivateAttestationKey(
        ActivateAttestationKeyRequest,
        oneshot::Sender<ActivateAttestationKeyReply>,
    ),
    Decrypt {
        username: String,
        key_label: String,
        data: Vec<u8>,
        reply: oneshot::Sender<DataReply>,
    },
    Sign {
        username: String,
        key_label: String,
        data: Vec<u8>,
        reply: oneshot::Sender<DataReply>,
    },
    RegisterKeyWithChapsToken {
        username: String,
        key_label: String,
        reply: oneshot::Sender<StatusOnlyReply>,
    },
    GetStatus(oneshot::Sender<StatusReply>),
    VerifyAttestation {
        username: String,
        key_label: String,
        reply: oneshot::Sender<VerifyReply>,
    },
    CreateEnrollRequest(AcaType, oneshot::Sender<CreateEnrollRequestReply>),
    FinishEnrollRequest {
        aca_type: AcaType,
        pca_response: Vec<u8>,
        reply: oneshot::Sender<EnrollReply>,
    },
    CreateCertificateRequest(
        CreateCertificateRequestParams,
        oneshot::Sender<CreateCertificateRequestReply>,
    ),
    FinishCertificateRequest {
        pca_response: Vec<u8>,
        reply: oneshot::Sender<FinishCertificateRequestReply>,
    },
    SignEnterpriseChallenge(SignEnterpriseChallengeRequest, oneshot::Sender<DataReply>),
    SignSimpleChallenge(SignSimpleChallengeRequest, oneshot::Sender<DataReply>),
    SetKeyPayload(SetKeyPayloadRequest, oneshot::Sender<StatusOnlyReply>),
    DeleteKeys(DeleteKeysRequest, oneshot::Sender<StatusOnlyReply>),
    ResetIdentity(oneshot::Sender<ResetIdentityReply>),
    GetEnrollmentId {
        ignore_cache: bool,
        reply: oneshot::Sender<GetEnrollmentIdReply>,
    },
    GetCertifiedNvIndex(
        GetCertifiedNvIndexRequest,
        oneshot::Sender<GetCertifiedNvIndexReply>,
    ),
    GetEnrollmentPreparations(oneshot::Sender<GetEnrollmentPreparationsReply>),
    Shutdown,
}

/// Handle to the attestation engine. All methods are non-blocking from the
/// caller's perspective: they enqueue a command and await the reply.
pub struct AttestationService {
    commands: mpsc::UnboundedSender<Command>,
    statuses: Arc<EnrollmentStatusTable>,
    shutting_down: Arc<AtomicBool>,
}

impl AttestationService {
    /// Start the engine with the given collaborators.
    pub fn start(deps: EngineDeps) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let statuses = Arc::new(EnrollmentStatusTable::new());
        let shutting_down = Arc::new(AtomicBool::new(false));

        let mut worker = Worker {
            db: deps.database,
            key_store: deps.key_store,
            tpm: deps.tpm,
            crypto: deps.crypto,
            aca: deps.aca,
            google_keys: deps.google_keys,
            policy: deps.policy,
            statuses: statuses.clone(),
            enrollment_queue: EnrollmentQueue::new(),
            certificate_queue: CertificateQueue::new(),
            flows_awaiting_enrollment: Vec::new(),
            pending_certificate_requests: HashMap::new(),
            enrollment_id_cache: None,
            commands_tx: commands_tx.clone(),
            shutting_down: shutting_down.clone(),
        };

        tokio::spawn(async move {
            worker.initialize();
            worker.run(commands_rx).await;
        });

        Self {
            commands: commands_tx,
            statuses,
            shutting_down,
        }
    }

    /// Fast enrollment check, readable from any thread without a round trip
    /// through the worker.
    pub fn is_enrolled_with(&self, aca: AcaType) -> bool {
        self.statuses.is_enrolled(aca)
    }

    pub fn enrollment_status(&self, aca: AcaType) -> EnrollmentStatus {
        self.statuses.get(aca)
    }

    /// Begin teardown. Pending and in-flight requests are abandoned: their
    /// completion handles are never resolved once this returns.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let _ = self.commands.send(Command::Shutdown);
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| AttestationError::ServiceStopped)?;
        rx.await.map_err(|_| AttestationError::ServiceStopped)
    }

    pub async fn enroll(&self, request: EnrollRequest) -> Result<EnrollReply> {
        self.call(|tx| Command::Enroll(request, tx)).await
    }

    pub async fn get_certificate(
        &self,
        request: GetCertificateRequest,
    ) -> Result<GetCertificateReply> {
        self.call(|tx| Command::GetCertificate(request, tx)).await
    }

    pub async fn create_certifiable_key(
        &self,
        request: CreateCertifiableKeyRequest,
    ) -> Result<KeyInfoReply> {
        self.call(|tx| Command::CreateCertifiableKey(request, tx)).await
    }

    pub async fn get_key_info(&self, username: &str, key_label: &str) -> Result<KeyInfoReply> {
        let (username, key_label) = (username.to_string(), key_label.to_string());
        self.call(|reply| Command::GetKeyInfo {
            username,
            key_label,
            reply,
        })
        .await
    }

    pub async fn get_endorsement_info(&self) -> Result<EndorsementInfoReply> {
        self.call(Command::GetEndorsementInfo).await
    }

    pub async fn get_attestation_key_info(
        &self,
        aca_type: AcaType,
    ) -> Result<AttestationKeyInfoReply> {
        self.call(|tx| Command::GetAttestationKeyInfo(aca_type, tx)).await
    }

    pub async fn activate_attestation_key(
        &self,
        request: ActivateAttestationKeyRequest,
    ) -> Result<ActivateAttestationKeyReply> {
        self.call(|tx| Command::ActivateAttestationKey(request, tx)).await
    }

    pub async fn decrypt(
        &self,
        username: &str,
        key_label: &str,
        data: Vec<u8>,
    ) -> Result<DataReply> {
        let (username, key_label) = (username.to_string(), key_label.to_string());
        self.call(|reply| Command::Decrypt {
            username,
            key_label,
            data,
            reply,
        })
        .await
    }

    pub async fn sign(&self, username: &str, key_label: &str, data: Vec<u8>) -> Result<DataReply> {
        let (username, key_label) = (username.to_string(), key_label.to_string());
        self.call(|reply| Command::Sign {
            username,
            key_label,
            data,
            reply,
        })
        .await
    }

    pub async fn register_key_with_chaps_token(
        &self,
        username: &str,
        key_label: &str,
    ) -> Result<StatusOnlyReply> {
        let (username, key_label) = (username.to_string(), key_label.to_string());
        self.call(|reply| Command::RegisterKeyWithChapsToken {
            username,
            key_label,
            reply,
        })
        .await
    }

    pub async fn get_status(&self) -> Result<StatusReply> {
        self.call(Command::GetStatus).await
    }

    pub async fn verify_attestation(
        &self,
        username: &str,
        key_label: &str,
    ) -> Result<VerifyReply> {
        let (username, key_label) = (username.to_string(), key_label.to_string());
        self.call(|reply| Command::VerifyAttestation {
            username,
            key_label,
            reply,
        })
        .await
    }

    pub async fn create_enroll_request(
        &self,
        aca_type: AcaType,
    ) -> Result<CreateEnrollRequestReply> {
        self.call(|tx| Command::CreateEnrollRequest(aca_type, tx)).await
    }

    pub async fn finish_enroll_request(
        &self,
        aca_type: AcaType,
        pca_response: Vec<u8>,
    ) -> Result<EnrollReply> {
        self.call(|reply| Command::FinishEnrollRequest {
            aca_type,
            pca_response,
            reply,
        })
        .await
    }

    pub async fn create_certificate_request(
        &self,
        params: CreateCertificateRequestParams,
    ) -> Result<CreateCertificateRequestReply> {
        self.call(|tx| Command::CreateCertificateRequest(params, tx)).await
    }

    pub async fn finish_certificate_request(
        &self,
        pca_response: Vec<u8>,
    ) -> Result<FinishCertificateRequestReply> {
        self.call(|reply| Command::FinishCertificateRequest {
            pca_response,
            reply,
        })
        .await
    }

    pub async fn sign_enterprise_challenge(
        &self,
        request: SignEnterpriseChallengeRequest,
    ) -> Result<DataReply> {
        self.call(|tx| Command::SignEnterpriseChallenge(request, tx)).await
    }

    pub async fn sign_simple_challenge(
        &self,
        request: SignSimpleChallengeRequest,
    ) -> Result<DataReply> {
        self.call(|tx| Command::SignSimpleChallenge(request, tx)).await
    }

    pub async fn set_key_payload(&self, request: SetKeyPayloadRequest) -> Result<StatusOnlyReply> {
        self.call(|tx| Command::SetKeyPayload(request, tx)).await
    }

    pub async fn delete_keys(&self, request: DeleteKeysRequest) -> Result<StatusOnlyReply> {
        self.call(|tx| Command::DeleteKeys(request, tx)).await
    }

    pub async fn reset_identity(&self) -> Result<ResetIdentityReply> {
        self.call(Command::ResetIdentity).await
    }

    pub async fn get_enrollment_id(&self, ignore_cache: bool) -> Result<GetEnrollmentIdReply> {
        self.call(|reply| Command::GetEnrollmentId {
            ignore_cache,
            reply,
        })
        .await
    }

    pub async fn get_certified_nv_index(
        &self,
        request: GetCertifiedNvIndexRequest,
    ) -> Result<GetCertifiedNvIndexReply> {
        self.call(|tx| Command::GetCertifiedNvIndex(request, tx)).await
    }

    pub async fn get_enrollment_preparations(&self) -> Result<GetEnrollmentPreparationsReply> {
        self.call(Command::GetEnrollmentPreparations).await
    }
}

impl Drop for AttestationService {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::Release);
        let _ = self.commands.send(Command::Shutdown);
    }
}

struct Worker {
    db: Box<dyn Database>,
    key_store: Box<dyn KeyStore>,
    tpm: Box<dyn TpmUtility>,
    crypto: Box<dyn CryptoUtility>,
    aca: Arc<dyn AcaClient>,
    google_keys: GoogleKeys,
    policy: DevicePolicy,
    statuses: Arc<EnrollmentStatusTable>,
    enrollment_queue: EnrollmentQueue<EnrollReply>,
    certificate_queue: CertificateQueue<GetCertificateReply>,
    /// Certificate flows parked until an in-flight enrollment resolves.
    flows_awaiting_enrollment: Vec<AttestationFlow>,
    /// Manual certificate requests awaiting their CA response, by message ID.
    pending_certificate_requests: HashMap<Vec<u8>, PendingCertificateRequest>,
    enrollment_id_cache: Option<Vec<u8>>,
    commands_tx: mpsc::UnboundedSender<Command>,
    shutting_down: Arc<AtomicBool>,
}

struct PendingCertificateRequest {
    username: String,
    key_label: String,
    material: CertifiedKeyMaterial,
    key_type: crate::types::KeyType,
    key_usage: KeyUsage,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            if self.shutting_down.load(Ordering::Acquire) {
                break;
            }
            if matches!(command, Command::Shutdown) {
                break;
            }
            self.handle(command);
        }
        debug!("attestation worker stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enroll(request, reply) => self.handle_enroll(request, reply),
            Command::GetCertificate(request, reply) => self.handle_get_certificate(request, reply),
            Command::ContinueFlow(flow) => self.drive(*flow),
            Command::CreateCertifiableKey(request, reply) => {
                let value = self.handle_create_certifiable_key(request);
                self.deliver(reply, value);
            }
            Command::GetKeyInfo {
                username,
                key_label,
                reply,
            } => {
                let value = self.handle_get_key_info(&username, &key_label);
                self.deliver(reply, value);
            }
            Command::GetEndorsementInfo(reply) => {
                let value = self.handle_get_endorsement_info();
                self.deliver(reply, value);
            }
            Command::GetAttestationKeyInfo(aca_type, reply) => {
                let value = self.handle_get_attestation_key_info(aca_type);
                self.deliver(reply, value);
            }
            Command::ActivateAttestationKey(request, reply) => {
                let value = self.handle_activate_attestation_key(request);
                self.deliver(reply, value);
            }
            Command::Decrypt {
                username,
                key_label,
                data,
                reply,
            } => {
                let value = self.handle_decrypt(&username, &key_label, &data);
                self.deliver(reply, value);
            }
            Command::Sign {
                username,
                key_label,
                data,
                reply,
            } => {
                let value = self.handle_sign(&username, &key_label, &data);
                self.deliver(reply, value);
            }
            Command::RegisterKeyWithChapsToken {
                username,
                key_label,
                reply,
            } => {
                let value = self.handle_register_key(&username, &key_label);
                self.deliver(reply, value);
            }
            Command::GetStatus(reply) => {
                let value = self.handle_get_status();
                self.deliver(reply, value);
            }
            Command::VerifyAttestation {
                username,
                key_label,
                reply,
            } => {
                let value = self.handle_verify_attestation(&username, &key_label);
                self.deliver(reply, value);
            }
            Command::CreateEnrollRequest(aca_type, reply) => {
                let value = self.handle_create_enroll_request(aca_type);
                self.deliver(reply, value);
            }
            Command::FinishEnrollRequest {
                aca_type,
                pca_response,
                reply,
            } => {
                let (status, server_error) = self.process_enroll_response(aca_type, &pca_response);
                self.deliver(reply, EnrollReply {
                    status,
                    server_error,
                });
            }
            Command::CreateCertificateRequest(params, reply) => {
                let value = self.handle_create_certificate_request(params);
                self.deliver(reply, value);
            }
            Command::FinishCertificateRequest {
                pca_response,
                reply,
            } => {
                let value = self.handle_finish_certificate_request(&pca_response);
                self.deliver(reply, value);
            }
            Command::SignEnterpriseChallenge(request, reply) => {
                let value = self.handle_sign_enterprise_challenge(request);
                self.deliver(reply, value);
            }
            Command::SignSimpleChallenge(request, reply) => {
                let value = self.handle_sign_simple_challenge(request);
                self.deliver(reply, value);
            }
            Command::SetKeyPayload(request, reply) => {
                let value = self.handle_set_key_payload(request);
                self.deliver(reply, value);
            }
            Command::DeleteKeys(request, reply) => {
                let value = self.handle_delete_keys(request);
                self.deliver(reply, value);
            }
            Command::ResetIdentity(reply) => {
                let value = self.handle_reset_identity();
                self.deliver(reply, value);
            }
            Command::GetEnrollmentId {
                ignore_cache,
                reply,
            } => {
                let value = self.handle_get_enrollment_id(ignore_cache);
                self.deliver(reply, value);
            }
            Command::GetCertifiedNvIndex(request, reply) => {
                let value = self.handle_get_certified_nv_index(request);
                self.deliver(reply, value);
            }
            Command::GetEnrollmentPreparations(reply) => {
                let value = self.handle_get_enrollment_preparations();
                self.deliver(reply, value);
            }
            Command::Shutdown => {}
        }
    }

    /// Resolve a completion handle unless teardown has begun.
    fn deliver<T>(&self, handle: oneshot::Sender<T>, value: T) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let _ = handle.send(value);
    }

    // ---- Initialization ----

    fn initialize(&mut self) {
        match migrate_attestation_database(self.db.data_mut()) {
            MigrationOutcome::Migrated => {
                if let Err(e) = self.db.save_changes() {
                    warn!("failed to persist migrated database: {}", e);
                }
            }
            MigrationOutcome::NotNeeded => {}
        }

        if !self.tpm.is_ready() {
            warn!("TPM not ready; attestation preparation deferred");
        } else {
            self.prepare_endorsement_material();
            if self.db.data().identities.is_empty() {
                if let Err(e) = self.create_identity_internal() {
                    warn!("failed to create default identity: {}", e);
                }
            }
        }

        for aca in AcaType::all() {
            let enrolled = self
                .db
                .data()
                .find_identity_certificate(FIRST_IDENTITY, aca)
                .map(|(_, record)| !record.identity_credential.is_empty())
                .unwrap_or(false);
            self.statuses.set(
                aca,
                if enrolled {
                    EnrollmentStatus::Enrolled
                } else {
                    EnrollmentStatus::NotEnrolled
                },
            );
        }
        info!("attestation engine initialized");
    }

    fn prepare_endorsement_material(&mut self) {
        let mut dirty = false;
        if self.db.data().credentials.endorsement_public_key.is_empty() {
            match self.tpm.endorsement_public_key() {
                Ok(key) => {
                    self.db.data_mut().credentials.endorsement_public_key = key;
                    dirty = true;
                }
                Err(e) => warn!("endorsement public key unavailable: {}", e),
            }
        }
        if self.db.data().credentials.endorsement_credential.is_empty() {
            match self.tpm.endorsement_credential() {
                Ok(credential) => {
                    self.db.data_mut().credentials.endorsement_credential = credential;
                    dirty = true;
                }
                Err(e) => warn!("endorsement credential unavailable: {}", e),
            }
        }
        if dirty {
            if let Err(e) = self.db.save_changes() {
                warn!("failed to persist endorsement material: {}", e);
            }
        }
    }

    fn create_identity_internal(&mut self) -> Result<usize> {
        let (material, binding) = self.tpm.create_identity()?;
        let challenge = self.crypto.get_random(EXTERNAL_DATA_SIZE)?;
        let pcr0_quote = self.tpm.quote_pcr(0, &challenge)?;
        let pcr1_quote = self.tpm.quote_pcr(1, &challenge)?;

        let mut identity = Identity {
            features: IdentityFeatures {
                enrollment_id: true,
            },
            identity_key: Some(IdentityKeyRecord {
                public_key_der: material.public_key_der,
                key_blob: material.key_blob,
            }),
            identity_binding: Some(binding),
            pcr0_quote: Some(pcr0_quote),
            pcr1_quote: Some(pcr1_quote),
            nvram_quotes: Vec::new(),
        };
        for quote_type in crate::nvram::NvramQuoteType::all() {
            if let Some(quote) =
                quote_nvram_data(self.tpm.as_ref(), quote_type, &challenge, false)?
            {
                insert_certified_nvram_data(&mut identity, quote_type, quote);
            }
        }

        let data = self.db.data_mut();
        data.identities.push(identity);
        let index = data.identities.len() - 1;
        self.db.save_changes()?;
        info!(identity = index, "created attestation identity");
        Ok(index)
    }

    // ---- Flow driver ----

    fn drive(&mut self, mut flow: AttestationFlow) {
        loop {
            flow = match flow.action {
                FlowAction::StartEnroll => match self.start_enroll(flow) {
                    Some(flow) => flow,
                    None => return,
                },
                FlowAction::FinishEnroll => self.finish_enroll(flow),
                FlowAction::StartCertificate => match self.start_certificate(flow) {
                    Some(flow) => flow,
                    None => return,
                },
                FlowAction::FinishCertificate => self.finish_certificate(flow),
                FlowAction::Complete => {
                    self.complete_flow(flow);
                    return;
                }
            };
        }
    }

    /// Hand the flow's request to a transport task; the task posts the flow
    /// back through the command channel when the round trip resolves.
    fn dispatch_transport(&self, mut flow: AttestationFlow) {
        let aca = flow.aca_type;
        let body = std::mem::take(&mut flow.request);
        let kind = flow.action;
        let client = self.aca.clone();
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let result = match kind {
                FlowAction::StartEnroll => client.enroll(aca, body).await,
                _ => client.get_certificate(aca, body).await,
            };
            match result {
                Ok(reply) => {
                    flow.reply = reply;
                    flow.action = match kind {
                        FlowAction::StartEnroll => FlowAction::FinishEnroll,
                        _ => FlowAction::FinishCertificate,
                    };
                }
                Err(e) => {
                    warn!("CA transport failed: {}", e);
                    flow.fail(AttestationStatus::CaNotAvailable);
                }
            }
            let _ = commands.send(Command::ContinueFlow(Box::new(flow)));
        });
    }

    // ---- Enrollment state machine ----

    fn handle_enroll(&mut self, request: EnrollRequest, reply: oneshot::Sender<EnrollReply>) {
        match self.enrollment_queue.admit(request.aca_type, reply) {
            Admission::Rejected(handle) => {
                self.deliver(handle, EnrollReply::failure(AttestationStatus::NotAvailable));
            }
            Admission::Joined => {}
            Admission::StartFlight => {
                let mut flow = AttestationFlow::for_enrollment(request.aca_type, request.forced);
                flow.owns_enrollment = true;
                self.drive(flow);
            }
        }
    }

    fn start_enroll(&mut self, mut flow: AttestationFlow) -> Option<AttestationFlow> {
        let aca = flow.aca_type;
        if self.statuses.is_enrolled(aca) && !flow.forced_enroll {
            flow.status = AttestationStatus::Success;
            flow.action = FlowAction::Complete;
            return Some(flow);
        }

        match self.build_enroll_request(aca) {
            Ok(request) => {
                flow.request = request;
                self.statuses.set(aca, EnrollmentStatus::InProgress);
                self.dispatch_transport(flow);
                None
            }
            Err(status) => {
                flow.fail(status);
                Some(flow)
            }
        }
    }

    /// Build the serialized `/enroll` body. Any precondition failure maps to
    /// a status and never reaches the network.
    fn build_enroll_request(
        &mut self,
        aca: AcaType,
    ) -> std::result::Result<Vec<u8>, AttestationStatus> {
        if !self.tpm.is_ready() {
            return Err(AttestationStatus::NotReady);
        }
        if self.db.data().identities.is_empty() {
            self.create_identity_internal()
                .map_err(|_| AttestationStatus::UnexpectedDeviceError)?;
        }

        let encrypted_endorsement_credential = self.encrypted_endorsement_credential(aca)?;

        let identity = &self.db.data().identities[FIRST_IDENTITY];
        let identity_key = identity
            .identity_key
            .as_ref()
            .ok_or(AttestationStatus::UnexpectedDeviceError)?;
        let pcr0_quote = identity
            .pcr0_quote
            .clone()
            .ok_or(AttestationStatus::UnexpectedDeviceError)?;
        let pcr1_quote = identity
            .pcr1_quote
            .clone()
            .ok_or(AttestationStatus::UnexpectedDeviceError)?;

        let enterprise_enrollment_nonce = if identity.features.enrollment_id {
            compute_enterprise_enrollment_nonce(&self.policy.abe_data)
        } else {
            None
        };

        let request = EnrollCaRequest {
            encrypted_endorsement_credential,
            identity_public_key: identity_key.public_key_der.clone(),
            identity_binding: identity.identity_binding.clone().unwrap_or_default(),
            pcr0_quote,
            pcr1_quote,
            enterprise_enrollment_nonce,
        };
        serde_json::to_vec(&request).map_err(|_| AttestationStatus::UnexpectedDeviceError)
    }

    fn endorsement_credential(&mut self) -> Result<Vec<u8>> {
        let stored = &self.db.data().credentials.endorsement_credential;
        if !stored.is_empty() {
            return Ok(stored.clone());
        }
        let credential = self.tpm.endorsement_credential()?;
        self.db.data_mut().credentials.endorsement_credential = credential.clone();
        if let Err(e) = self.db.save_changes() {
            warn!("failed to cache endorsement credential: {}", e);
        }
        Ok(credential)
    }

    /// Endorsement credential encrypted to one CA's public key, computed
    /// once per ACA and cached in the database.
    fn encrypted_endorsement_credential(
        &mut self,
        aca: AcaType,
    ) -> std::result::Result<EncryptedData, AttestationStatus> {
        if let Some(record) = self
            .db
            .data()
            .credentials
            .encrypted_endorsement_credentials
            .iter()
            .find(|record| record.aca_type == aca)
        {
            return Ok(record.credential.clone());
        }

        let credential = self
            .endorsement_credential()
            .map_err(|_| AttestationStatus::NotAvailable)?;
        let ca_key = self
            .google_keys
            .ca_encryption_key(aca)
            .ok_or(AttestationStatus::NotAvailable)?
            .to_vec();
        let encrypted = self
            .crypto
            .encrypt_for_recipient(&credential, &ca_key)
            .map_err(|_| AttestationStatus::UnexpectedDeviceError)?;

        let credentials = &mut self.db.data_mut().credentials;
        credentials
            .encrypted_endorsement_credentials
            .push(EncryptedCredentialRecord {
                aca_type: aca,
                credential: encrypted.clone(),
            });
        if aca == AcaType::Default {
            credentials.default_encrypted_endorsement_credential = Some(encrypted.clone());
        }
        if let Err(e) = self.db.save_changes() {
            warn!("failed to cache encrypted endorsement credential: {}", e);
        }
        Ok(encrypted)
    }

    fn finish_enroll(&mut self, mut flow: AttestationFlow) -> AttestationFlow {
        let reply = std::mem::take(&mut flow.reply);
        let (status, server_error) = self.process_enroll_response(flow.aca_type, &reply);
        if status.is_success() {
            self.settle_enrollment(flow.aca_type, AttestationStatus::Success, String::new());
            flow.owns_enrollment = false;
            flow.status = AttestationStatus::Success;
            flow.action = if flow.is_certification() {
                FlowAction::StartCertificate
            } else {
                FlowAction::Complete
            };
        } else {
            flow.status = status;
            flow.server_error = server_error;
            flow.action = FlowAction::Complete;
        }
        flow
    }

    /// Decode and apply a CA enrollment response. Shared by the internal
    /// state machine and the manual finish-enroll operation.
    fn process_enroll_response(
        &mut self,
        aca: AcaType,
        pca_response: &[u8],
    ) -> (AttestationStatus, String) {
        let response: EnrollCaResponse = match serde_json::from_slice(pca_response) {
            Ok(response) => response,
            Err(e) => {
                warn!("unparsable enrollment response: {}", e);
                return (AttestationStatus::UnexpectedDeviceError, String::new());
            }
        };
        if response.status == CaResponseStatus::ServerError {
            info!(detail = %response.detail, "CA rejected enrollment");
            return (AttestationStatus::RequestDeniedByCa, response.detail);
        }
        let encrypted = match response.encrypted_identity_credential {
            Some(encrypted) => encrypted,
            None => return (AttestationStatus::UnexpectedDeviceError, String::new()),
        };
        let key_blob = match self
            .db
            .data()
            .identities
            .get(FIRST_IDENTITY)
            .and_then(|identity| identity.identity_key.as_ref())
        {
            Some(key) => key.key_blob.clone(),
            None => return (AttestationStatus::UnexpectedDeviceError, String::new()),
        };
        let credential = match self.tpm.activate_identity(&key_blob, &encrypted) {
            Ok(credential) => credential,
            Err(e) => {
                warn!("identity activation failed: {}", e);
                return (AttestationStatus::UnexpectedDeviceError, String::new());
            }
        };

        let record_index = match self.find_or_create_identity_certificate(FIRST_IDENTITY, aca) {
            Some(index) => index,
            None => return (AttestationStatus::UnexpectedDeviceError, String::new()),
        };
        self.db.data_mut().identity_certificates[record_index].identity_credential = credential;
        if let Err(e) = self.db.save_changes() {
            warn!("failed to persist identity credential: {}", e);
            return (AttestationStatus::UnexpectedDeviceError, String::new());
        }

        self.statuses.set(aca, EnrollmentStatus::Enrolled);
        info!(?aca, "enrolled with attestation CA");
        (AttestationStatus::Success, String::new())
    }

    /// Resolve the in-flight enrollment attempt for `aca`: answer every
    /// queued handle and resume every parked certificate flow.
    fn settle_enrollment(&mut self, aca: AcaType, status: AttestationStatus, server_error: String) {
        let enrolled = status.is_success();
        self.statuses.set(
            aca,
            if enrolled {
                EnrollmentStatus::Enrolled
            } else {
                EnrollmentStatus::NotEnrolled
            },
        );

        let reply = EnrollReply {
            status,
            server_error: server_error.clone(),
        };
        for waiter in self.enrollment_queue.settle(aca) {
            self.deliver(waiter, reply.clone());
        }

        let mut parked = Vec::new();
        let mut index = 0;
        while index < self.flows_awaiting_enrollment.len() {
            if self.flows_awaiting_enrollment[index].aca_type == aca {
                parked.push(self.flows_awaiting_enrollment.remove(index));
            } else {
                index += 1;
            }
        }
        for mut flow in parked {
            if enrolled {
                flow.action = FlowAction::StartCertificate;
            } else {
                // A failed enrollment fails the certificate request with the
                // same underlying status.
                flow.status = status;
                flow.server_error = server_error.clone();
                flow.action = FlowAction::Complete;
            }
            self.drive(flow);
        }
    }

    // ---- Certificate state machine ----

    fn handle_get_certificate(
        &mut self,
        request: GetCertificateRequest,
        reply: oneshot::Sender<GetCertificateReply>,
    ) {
        if request.key_label.is_empty() {
            self.deliver(
                reply,
                GetCertificateReply::failure(AttestationStatus::InvalidParameter),
            );
            return;
        }

        let certification = CertificationData {
            username: request.username,
            key_label: request.key_label,
            profile: request.profile,
            origin: request.origin,
            key_type: request.key_type,
            key_usage: KeyUsage::Sign,
            key_material: None,
        };
        let request_key = certification.request_key(request.aca_type);

        match self.certificate_queue.admit(&request_key, reply) {
            Admission::Rejected(handle) => {
                self.deliver(
                    handle,
                    GetCertificateReply::failure(AttestationStatus::NotAvailable),
                );
            }
            Admission::Joined => {}
            Admission::StartFlight => {
                let flow = AttestationFlow::for_certification(request.aca_type, certification);
                self.drive(flow);
            }
        }
    }

    fn start_certificate(&mut self, mut flow: AttestationFlow) -> Option<AttestationFlow> {
        let aca = flow.aca_type;
        if !self.statuses.is_enrolled(aca) {
            if self.enrollment_queue.is_in_flight(aca) {
                // Someone else is enrolling; park until that resolves.
                self.flows_awaiting_enrollment.push(flow);
                return None;
            }
            self.enrollment_queue.mark_in_flight(aca);
            flow.owns_enrollment = true;
            flow.action = FlowAction::StartEnroll;
            return Some(flow);
        }

        match self.build_certificate_request(&mut flow) {
            Ok(()) => {
                self.dispatch_transport(flow);
                None
            }
            Err(status) => {
                flow.fail(status);
                Some(flow)
            }
        }
    }

    fn build_certificate_request(
        &mut self,
        flow: &mut AttestationFlow,
    ) -> std::result::Result<(), AttestationStatus> {
        let aca = flow.aca_type;
        let identity_credential = self
            .db
            .data()
            .find_identity_certificate(FIRST_IDENTITY, aca)
            .map(|(_, record)| record.identity_credential.clone())
            .filter(|credential| !credential.is_empty())
            .ok_or(AttestationStatus::UnexpectedDeviceError)?;

        let certification = flow
            .certification
            .as_mut()
            .ok_or(AttestationStatus::UnexpectedDeviceError)?;

        let temporal_index =
            choose_temporal_index(self.db.data_mut(), &certification.username, &certification.origin);

        let material = prepare_key_material(
            self.db.as_ref(),
            self.key_store.as_ref(),
            self.tpm.as_mut(),
            self.crypto.as_ref(),
            certification,
        )?;

        let message_id = self
            .crypto
            .get_random(MESSAGE_ID_SIZE)
            .map_err(|_| AttestationStatus::UnexpectedDeviceError)?;

        let request = CertificateCaRequest {
            message_id: message_id.clone(),
            identity_credential,
            certified_public_key: material.public_key_der.clone(),
            certify_info: material.certify_info.clone(),
            certify_info_signature: material.certify_info_signature.clone(),
            profile: certification.profile,
            origin: certification.origin.clone(),
            temporal_index,
        };
        certification.key_material = Some(material);
        flow.message_id = message_id;
        flow.request = serde_json::to_vec(&request)
            .map_err(|_| AttestationStatus::UnexpectedDeviceError)?;
        Ok(())
    }

    fn finish_certificate(&mut self, mut flow: AttestationFlow) -> AttestationFlow {
        let reply = std::mem::take(&mut flow.reply);
        let response: CertificateCaResponse = match serde_json::from_slice(&reply) {
            Ok(response) => response,
            Err(e) => {
                warn!("unparsable certificate response: {}", e);
                flow.fail(AttestationStatus::UnexpectedDeviceError);
                return flow;
            }
        };
        if response.status == CaResponseStatus::ServerError {
            info!(detail = %response.detail, "CA rejected certificate request");
            flow.fail_with_ca_detail(response.detail);
            return flow;
        }
        // A mismatched message ID means this reply does not belong to our
        // request; treat it as a failure even though the wire status is OK.
        if response.message_id != flow.message_id {
            warn!("certificate response message ID mismatch");
            flow.fail(AttestationStatus::UnexpectedDeviceError);
            return flow;
        }

        let certification = match flow.certification.as_ref() {
            Some(certification) => certification,
            None => {
                flow.fail(AttestationStatus::UnexpectedDeviceError);
                return flow;
            }
        };
        let material = match certification.key_material.as_ref() {
            Some(material) => material.clone(),
            None => {
                flow.fail(AttestationStatus::UnexpectedDeviceError);
                return flow;
            }
        };

        match self.store_issued_certificate(
            &certification.username.clone(),
            &certification.key_label.clone(),
            certification.key_type,
            certification.key_usage,
            &material,
            &response,
        ) {
            Ok(chain) => {
                flow.certificate_chain = chain;
                flow.public_key_der = material.public_key_der;
                flow.status = AttestationStatus::Success;
                flow.action = FlowAction::Complete;
            }
            Err(status) => flow.fail(status),
        }
        flow
    }

    /// Persist the certified key with its new chain and return the PEM
    /// encoding. Nothing is persisted on failure, so a half-written key is
    /// never discoverable.
    fn store_issued_certificate(
        &mut self,
        username: &str,
        key_label: &str,
        key_type: crate::types::KeyType,
        key_usage: KeyUsage,
        material: &CertifiedKeyMaterial,
        response: &CertificateCaResponse,
    ) -> std::result::Result<String, AttestationStatus> {
        let owner = KeyOwner::from_username(username);
        let payload = self
            .find_key(&owner, key_label)
            .ok()
            .flatten()
            .map(|key| key.payload)
            .unwrap_or_default();

        let mut intermediates: Vec<Vec<u8>> = Vec::new();
        if !response.intermediate_ca_cert.is_empty() {
            intermediates.push(response.intermediate_ca_cert.clone());
        }
        intermediates.extend(
            response
                .additional_intermediate_ca_certs
                .iter()
                .filter(|cert| !cert.is_empty())
                .cloned(),
        );

        let key = CertifiedKey {
            key_name: key_label.to_string(),
            key_type,
            key_usage,
            public_key_der: material.public_key_der.clone(),
            key_blob: material.key_blob.clone(),
            certify_info: material.certify_info.clone(),
            certify_info_signature: material.certify_info_signature.clone(),
            certificate: response.certified_key_credential.clone(),
            intermediate_certificates: intermediates.clone(),
            payload,
        };
        self.save_key(&owner, key)
            .map_err(|_| AttestationStatus::UnexpectedDeviceError)?;

        let mut chain: Vec<&[u8]> = vec![response.certified_key_credential.as_slice()];
        chain.extend(intermediates.iter().map(|cert| cert.as_slice()));
        Ok(pem_encode_certificate_chain(chain))
    }

    fn complete_flow(&mut self, flow: AttestationFlow) {
        if flow.owns_enrollment {
            self.settle_enrollment(flow.aca_type, flow.status, flow.server_error.clone());
        }
        if let Some(certification) = &flow.certification {
            let request_key = certification.request_key(flow.aca_type);
            let reply = GetCertificateReply {
                status: flow.status,
                server_error: flow.server_error.clone(),
                certificate_chain: flow.certificate_chain.clone(),
                public_key_der: flow.public_key_der.clone(),
            };
            for alias in self.certificate_queue.settle(&request_key) {
                self.deliver(alias, reply.clone());
            }
        }
    }

    // ---- Key management ----

    fn find_key(&self, owner: &KeyOwner, key_label: &str) -> Result<Option<CertifiedKey>> {
        match owner {
            KeyOwner::Device => Ok(self.db.data().find_device_key(key_label).cloned()),
            KeyOwner::User(username) => match self.key_store.read(username, key_label)? {
                Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
                None => Ok(None),
            },
        }
    }

    fn save_key(&mut self, owner: &KeyOwner, key: CertifiedKey) -> Result<()> {
        match owner {
            KeyOwner::Device => {
                let data = self.db.data_mut();
                let previous = match data
                    .device_keys
                    .iter()
                    .position(|existing| existing.key_name == key.key_name)
                {
                    Some(position) => {
                        Some(std::mem::replace(&mut data.device_keys[position], key))
                    }
                    None => {
                        data.device_keys.push(key);
                        None
                    }
                };
                if let Err(e) = self.db.save_changes() {
                    // Roll the in-memory list back so the failed write never
                    // leaves a half-written key discoverable.
                    let data = self.db.data_mut();
                    match previous {
                        Some(previous) => {
                            if let Some(position) = data
                                .device_keys
                                .iter()
                                .position(|existing| existing.key_name == previous.key_name)
                            {
                                data.device_keys[position] = previous;
                            }
                        }
                        None => {
                            data.device_keys.pop();
                        }
                    }
                    return Err(e);
                }
                Ok(())
            }
            KeyOwner::User(username) => {
                let raw = serde_json::to_vec(&key)?;
                self.key_store.write(username, &key.key_name, &raw)
            }
        }
    }

    fn handle_create_certifiable_key(&mut self, request: CreateCertifiableKeyRequest) -> KeyInfoReply {
        if request.key_label.is_empty() {
            return KeyInfoReply::failure(AttestationStatus::InvalidParameter);
        }
        let identity_key_blob = match self.identity_key_blob() {
            Some(blob) => blob,
            None => return KeyInfoReply::failure(AttestationStatus::NotReady),
        };
        let external_data = match self.crypto.get_random(EXTERNAL_DATA_SIZE) {
            Ok(data) => data,
            Err(e) => {
                warn!("random generation failed: {}", e);
                return KeyInfoReply::failure(AttestationStatus::UnexpectedDeviceError);
            }
        };
        let material = match self.tpm.create_certified_key(
            request.key_type,
            request.key_usage,
            &identity_key_blob,
            &external_data,
        ) {
            Ok(material) => material,
            Err(e) => {
                warn!("certified key creation failed: {}", e);
                return KeyInfoReply::failure(AttestationStatus::UnexpectedDeviceError);
            }
        };

        let owner = KeyOwner::from_username(&request.username);
        let key = CertifiedKey {
            key_name: request.key_label.clone(),
            key_type: request.key_type,
            key_usage: request.key_usage,
            public_key_der: material.public_key_der.clone(),
            key_blob: material.key_blob,
            certify_info: material.certify_info.clone(),
            certify_info_signature: material.certify_info_signature.clone(),
            certificate: Vec::new(),
            intermediate_certificates: Vec::new(),
            payload: Vec::new(),
        };
        if let Err(e) = self.save_key(&owner, key) {
            warn!("certified key persistence failed: {}", e);
            return KeyInfoReply::failure(AttestationStatus::UnexpectedDeviceError);
        }

        KeyInfoReply {
            status: AttestationStatus::Success,
            key_type: request.key_type,
            key_usage: request.key_usage,
            public_key_der: material.public_key_der,
            certify_info: material.certify_info,
            certify_info_signature: material.certify_info_signature,
            certificate_chain: String::new(),
            payload: Vec::new(),
        }
    }

    fn handle_get_key_info(&self, username: &str, key_label: &str) -> KeyInfoReply {
        let owner = KeyOwner::from_username(username);
        let key = match self.find_key(&owner, key_label) {
            Ok(Some(key)) => key,
            Ok(None) => return KeyInfoReply::failure(AttestationStatus::InvalidParameter),
            Err(_) => return KeyInfoReply::failure(AttestationStatus::UnexpectedDeviceError),
        };
        KeyInfoReply {
            status: AttestationStatus::Success,
            key_type: key.key_type,
            key_usage: key.key_usage,
            public_key_der: key.public_key_der,
            certify_info: key.certify_info,
            certify_info_signature: key.certify_info_signature,
            certificate_chain: certificate_chain_pem(&key.certificate, &key.intermediate_certificates),
            payload: key.payload,
        }
    }

    fn handle_decrypt(&self, username: &str, key_label: &str, data: &[u8]) -> DataReply {
        let owner = KeyOwner::from_username(username);
        let key = match self.find_key(&owner, key_label) {
            Ok(Some(key)) => key,
            Ok(None) => return DataReply::failure(AttestationStatus::InvalidParameter),
            Err(_) => return DataReply::failure(AttestationStatus::UnexpectedDeviceError),
        };
        if key.key_usage != KeyUsage::Decrypt {
            return DataReply::failure(AttestationStatus::InvalidParameter);
        }
        match self.tpm.unbind(&key.key_blob, data) {
            Ok(decrypted) => DataReply {
                status: AttestationStatus::Success,
                data: decrypted,
            },
            Err(e) => {
                warn!("unbind failed: {}", e);
                DataReply::failure(AttestationStatus::UnexpectedDeviceError)
            }
        }
    }

    fn handle_sign(&self, username: &str, key_label: &str, data: &[u8]) -> DataReply {
        let owner = KeyOwner::from_username(username);
        let key = match self.find_key(&owner, key_label) {
            Ok(Some(key)) => key,
            Ok(None) => return DataReply::failure(AttestationStatus::InvalidParameter),
            Err(_) => return DataReply::failure(AttestationStatus::UnexpectedDeviceError),
        };
        if key.key_usage != KeyUsage::Sign {
            return DataReply::failure(AttestationStatus::InvalidParameter);
        }
        match self.tpm.sign(&key.key_blob, data) {
            Ok(signature) => DataReply {
                status: AttestationStatus::Success,
                data: signature,
            },
            Err(e) => {
                warn!("sign failed: {}", e);
                DataReply::failure(AttestationStatus::UnexpectedDeviceError)
            }
        }
    }

    fn handle_register_key(&mut self, username: &str, key_label: &str) -> StatusOnlyReply {
        let owner = KeyOwner::from_username(username);
        let key = match self.find_key(&owner, key_label) {
            Ok(Some(key)) => key,
            Ok(None) => return StatusOnlyReply::new(AttestationStatus::InvalidParameter),
            Err(_) => return StatusOnlyReply::new(AttestationStatus::UnexpectedDeviceError),
        };
        let raw = match serde_json::to_vec(&key) {
            Ok(raw) => raw,
            Err(_) => return StatusOnlyReply::new(AttestationStatus::UnexpectedDeviceError),
        };
        if self
            .key_store
            .register(owner.username(), key_label, &raw)
            .is_err()
        {
            return StatusOnlyReply::new(AttestationStatus::UnexpectedDeviceError);
        }
        // The key now lives in the token; drop the engine's copy.
        let removed = match &owner {
            KeyOwner::Device => {
                let data = self.db.data_mut();
                data.device_keys.retain(|existing| existing.key_name != key_label);
                self.db.save_changes()
            }
            KeyOwner::User(user) => self.key_store.delete(user, key_label),
        };
        if removed.is_err() {
            return StatusOnlyReply::new(AttestationStatus::UnexpectedDeviceError);
        }
        StatusOnlyReply::success()
    }

    fn handle_get_status(&self) -> StatusReply {
        let data = self.db.data();
        StatusReply {
            status: AttestationStatus::Success,
            prepared_for_enrollment: !data.credentials.endorsement_credential.is_empty(),
            enrollment_statuses: AcaType::all()
                .iter()
                .map(|aca| (*aca, self.statuses.get(*aca)))
                .collect(),
            verified_boot: data
                .identities
                .get(FIRST_IDENTITY)
                .map(|identity| identity.pcr0_quote.is_some())
                .unwrap_or(false),
        }
    }

    fn handle_verify_attestation(&self, username: &str, key_label: &str) -> VerifyReply {
        let owner = KeyOwner::from_username(username);
        let key = match self.find_key(&owner, key_label) {
            Ok(Some(key)) => key,
            Ok(None) => return VerifyReply {
                status: AttestationStatus::InvalidParameter,
                verified: false,
            },
            Err(_) => return VerifyReply {
                status: AttestationStatus::UnexpectedDeviceError,
                verified: false,
            },
        };
        let identity_public_key = match self
            .db
            .data()
            .identities
            .get(FIRST_IDENTITY)
            .and_then(|identity| identity.identity_key.as_ref())
        {
            Some(identity_key) => identity_key.public_key_der.clone(),
            None => return VerifyReply {
                status: AttestationStatus::NotReady,
                verified: false,
            },
        };
        let verified = verify_certify_statement(
            &identity_public_key,
            &key.certify_info,
            &key.certify_info_signature,
            &key.public_key_der,
        );
        VerifyReply {
            status: AttestationStatus::Success,
            verified,
        }
    }

    // ---- Manual enroll / certificate request operations ----

    fn handle_create_enroll_request(&mut self, aca: AcaType) -> CreateEnrollRequestReply {
        match self.build_enroll_request(aca) {
            Ok(pca_request) => CreateEnrollRequestReply {
                status: AttestationStatus::Success,
                pca_request,
            },
            Err(status) => CreateEnrollRequestReply {
                status,
                pca_request: Vec::new(),
            },
        }
    }

    fn handle_create_certificate_request(
        &mut self,
        params: CreateCertificateRequestParams,
    ) -> CreateCertificateRequestReply {
        if params.key_label.is_empty() {
            return CreateCertificateRequestReply {
                status: AttestationStatus::InvalidParameter,
                pca_request: Vec::new(),
            };
        }
        let identity_credential = match self
            .db
            .data()
            .find_identity_certificate(FIRST_IDENTITY, params.aca_type)
            .map(|(_, record)| record.identity_credential.clone())
            .filter(|credential| !credential.is_empty())
        {
            Some(credential) => credential,
            None => {
                return CreateCertificateRequestReply {
                    status: AttestationStatus::NotAvailable,
                    pca_request: Vec::new(),
                }
            }
        };

        let certification = CertificationData {
            username: params.username.clone(),
            key_label: params.key_label.clone(),
            profile: params.profile,
            origin: params.origin.clone(),
            key_type: params.key_type,
            key_usage: KeyUsage::Sign,
            key_material: None,
        };
        let material = match prepare_key_material(
            self.db.as_ref(),
            self.key_store.as_ref(),
            self.tpm.as_mut(),
            self.crypto.as_ref(),
            &certification,
        ) {
            Ok(material) => material,
            Err(status) => {
                return CreateCertificateRequestReply {
                    status,
                    pca_request: Vec::new(),
                }
            }
        };
        let message_id = match self.crypto.get_random(MESSAGE_ID_SIZE) {
            Ok(message_id) => message_id,
            Err(_) => {
                return CreateCertificateRequestReply {
                    status: AttestationStatus::UnexpectedDeviceError,
                    pca_request: Vec::new(),
                }
            }
        };
        let temporal_index =
            choose_temporal_index(self.db.data_mut(), &params.username, &params.origin);

        let request = CertificateCaRequest {
            message_id: message_id.clone(),
            identity_credential,
            certified_public_key: material.public_key_der.clone(),
            certify_info: material.certify_info.clone(),
            certify_info_signature: material.certify_info_signature.clone(),
            profile: params.profile,
            origin: params.origin,
            temporal_index,
        };
        let pca_request = match serde_json::to_vec(&request) {
            Ok(pca_request) => pca_request,
            Err(_) => {
                return CreateCertificateRequestReply {
                    status: AttestationStatus::UnexpectedDeviceError,
                    pca_request: Vec::new(),
                }
            }
        };

        self.pending_certificate_requests.insert(
            message_id,
            PendingCertificateRequest {
                username: params.username,
                key_label: params.key_label,
                material,
                key_type: params.key_type,
                key_usage: KeyUsage::Sign,
            },
        );
        CreateCertificateRequestReply {
            status: AttestationStatus::Success,
            pca_request,
        }
    }

    fn handle_finish_certificate_request(
        &mut self,
        pca_response: &[u8],
    ) -> FinishCertificateRequestReply {
        let response: CertificateCaResponse = match serde_json::from_slice(pca_response) {
            Ok(response) => response,
            Err(_) => {
                return FinishCertificateRequestReply::failure(
                    AttestationStatus::UnexpectedDeviceError,
                )
            }
        };
        // Unknown message IDs cover both misrouted replies and replays.
        let pending = match self.pending_certificate_requests.remove(&response.message_id) {
            Some(pending) => pending,
            None => {
                warn!("certificate response does not match a pending request");
                return FinishCertificateRequestReply::failure(
                    AttestationStatus::UnexpectedDeviceError,
                );
            }
        };
        if response.status == CaResponseStatus::ServerError {
            return FinishCertificateRequestReply {
                status: AttestationStatus::RequestDeniedByCa,
                server_error: response.detail,
                certificate_chain: String::new(),
                key_label: pending.key_label,
            };
        }
        match self.store_issued_certificate(
            &pending.username,
            &pending.key_label,
            pending.key_type,
            pending.key_usage,
            &pending.material,
            &response,
        ) {
            Ok(chain) => FinishCertificateRequestReply {
                status: AttestationStatus::Success,
                server_error: String::new(),
                certificate_chain: chain,
                key_label: pending.key_label,
            },
            Err(status) => FinishCertificateRequestReply::failure(status),
        }
    }

    // ---- Endorsement / identity queries ----

    fn handle_get_endorsement_info(&mut self) -> EndorsementInfoReply {
        let ek_public_key = match self.tpm.endorsement_public_key() {
            Ok(key) => key,
            Err(_) => return EndorsementInfoReply {
                status: AttestationStatus::NotAvailable,
                ..Default::default()
            },
        };
        let ek_certificate = self.endorsement_credential().unwrap_or_default();
        EndorsementInfoReply {
            status: AttestationStatus::Success,
            ek_public_key,
            ek_certificate,
        }
    }

    fn handle_get_attestation_key_info(&self, aca: AcaType) -> AttestationKeyInfoReply {
        let identity = match self.db.data().identities.get(FIRST_IDENTITY) {
            Some(identity) => identity,
            None => {
                return AttestationKeyInfoReply {
                    status: AttestationStatus::NotAvailable,
                    ..Default::default()
                }
            }
        };
        AttestationKeyInfoReply {
            status: AttestationStatus::Success,
            public_key_der: identity
                .identity_key
                .as_ref()
                .map(|key| key.public_key_der.clone())
                .unwrap_or_default(),
            identity_binding: identity.identity_binding.clone().unwrap_or_default(),
            pcr0_quote: identity.pcr0_quote.clone(),
            pcr1_quote: identity.pcr1_quote.clone(),
            identity_credential: self
                .db
                .data()
                .find_identity_certificate(FIRST_IDENTITY, aca)
                .map(|(_, record)| record.identity_credential.clone())
                .unwrap_or_default(),
        }
    }

    fn handle_activate_attestation_key(
        &mut self,
        request: ActivateAttestationKeyRequest,
    ) -> ActivateAttestationKeyReply {
        let key_blob = match self.identity_key_blob() {
            Some(blob) => blob,
            None => {
                return ActivateAttestationKeyReply {
                    status: AttestationStatus::NotReady,
                    credential: Vec::new(),
                }
            }
        };
        let credential = match self
            .tpm
            .activate_identity(&key_blob, &request.encrypted_credential)
        {
            Ok(credential) => credential,
            Err(e) => {
                warn!("identity activation failed: {}", e);
                return ActivateAttestationKeyReply {
                    status: AttestationStatus::UnexpectedDeviceError,
                    credential: Vec::new(),
                };
            }
        };
        if request.save_credential {
            let record_index =
                match self.find_or_create_identity_certificate(FIRST_IDENTITY, request.aca_type) {
                    Some(index) => index,
                    None => {
                        return ActivateAttestationKeyReply {
                            status: AttestationStatus::UnexpectedDeviceError,
                            credential: Vec::new(),
                        }
                    }
                };
            self.db.data_mut().identity_certificates[record_index].identity_credential =
                credential.clone();
            if self.db.save_changes().is_err() {
                return ActivateAttestationKeyReply {
                    status: AttestationStatus::UnexpectedDeviceError,
                    credential: Vec::new(),
                };
            }
            self.statuses
                .set(request.aca_type, EnrollmentStatus::Enrolled);
        }
        ActivateAttestationKeyReply {
            status: AttestationStatus::Success,
            credential,
        }
    }

    // ---- Enterprise challenges ----

    fn handle_sign_enterprise_challenge(
        &mut self,
        request: SignEnterpriseChallengeRequest,
    ) -> DataReply {
        let owner = KeyOwner::from_username(&request.username);
        let key = match self.find_key(&owner, &request.key_label) {
            Ok(Some(key)) => key,
            Ok(None) => return DataReply::failure(AttestationStatus::InvalidParameter),
            Err(_) => return DataReply::failure(AttestationStatus::UnexpectedDeviceError),
        };

        let challenge =
            match validate_enterprise_challenge(&self.google_keys, request.va_type, &request.challenge)
            {
                Ok(challenge) => challenge,
                Err(e) => {
                    warn!("enterprise challenge rejected: {}", e);
                    return DataReply::failure(AttestationStatus::InvalidParameter);
                }
            };

        let spkac = if request.include_signed_public_key {
            match self.tpm.sign(&key.key_blob, &key.public_key_der) {
                Ok(signature) => {
                    let signed = SignedPublicKey {
                        public_key_der: key.public_key_der.clone(),
                        challenge_nonce: challenge.nonce.clone(),
                        signature,
                    };
                    match serde_json::to_vec(&signed) {
                        Ok(raw) => raw,
                        Err(_) => {
                            return DataReply::failure(AttestationStatus::UnexpectedDeviceError)
                        }
                    }
                }
                Err(_) => return DataReply::failure(AttestationStatus::UnexpectedDeviceError),
            }
        } else {
            Vec::new()
        };

        let key_info = KeyInfo {
            key_type: if owner.is_device() {
                EnterpriseKeyType::Machine
            } else {
                EnterpriseKeyType::User
            },
            domain: request.domain,
            device_id: request.device_id,
            certificate: key.certificate.clone(),
            spkac,
            customer_id: self.policy.customer_id.clone().unwrap_or_default(),
        };
        let va_encryption_key = match self.google_keys.va_encryption_key(request.va_type) {
            Some(key) => key.to_vec(),
            None => return DataReply::failure(AttestationStatus::NotAvailable),
        };

        match build_challenge_response(
            self.crypto.as_ref(),
            self.tpm.as_ref(),
            &key.key_blob,
            request.challenge,
            &key_info,
            &va_encryption_key,
        ) {
            Ok(signed) => match serde_json::to_vec(&signed) {
                Ok(raw) => DataReply {
                    status: AttestationStatus::Success,
                    data: raw,
                },
                Err(_) => DataReply::failure(AttestationStatus::UnexpectedDeviceError),
            },
            Err(e) => {
                warn!("enterprise challenge signing failed: {}", e);
                DataReply::failure(AttestationStatus::UnexpectedDeviceError)
            }
        }
    }

    fn handle_sign_simple_challenge(&mut self, request: SignSimpleChallengeRequest) -> DataReply {
        let owner = KeyOwner::from_username(&request.username);
        let key = match self.find_key(&owner, &request.key_label) {
            Ok(Some(key)) => key,
            Ok(None) => return DataReply::failure(AttestationStatus::InvalidParameter),
            Err(_) => return DataReply::failure(AttestationStatus::UnexpectedDeviceError),
        };
        let nonce = match self.crypto.get_random(SIMPLE_CHALLENGE_NONCE_SIZE) {
            Ok(nonce) => nonce,
            Err(_) => return DataReply::failure(AttestationStatus::UnexpectedDeviceError),
        };
        let mut data = request.challenge;
        data.extend_from_slice(&nonce);
        let signature = match self.tpm.sign(&key.key_blob, &data) {
            Ok(signature) => signature,
            Err(_) => return DataReply::failure(AttestationStatus::UnexpectedDeviceError),
        };
        let signed = SignedData { data, signature };
        match serde_json::to_vec(&signed) {
            Ok(raw) => DataReply {
                status: AttestationStatus::Success,
                data: raw,
            },
            Err(_) => DataReply::failure(AttestationStatus::UnexpectedDeviceError),
        }
    }

    // ---- Misc key/identity operations ----

    fn handle_set_key_payload(&mut self, request: SetKeyPayloadRequest) -> StatusOnlyReply {
        let owner = KeyOwner::from_username(&request.username);
        let mut key = match self.find_key(&owner, &request.key_label) {
            Ok(Some(key)) => key,
            Ok(None) => return StatusOnlyReply::new(AttestationStatus::InvalidParameter),
            Err(_) => return StatusOnlyReply::new(AttestationStatus::UnexpectedDeviceError),
        };
        key.payload = request.payload;
        match self.save_key(&owner, key) {
            Ok(()) => StatusOnlyReply::success(),
            Err(_) => StatusOnlyReply::new(AttestationStatus::UnexpectedDeviceError),
        }
    }

    fn handle_delete_keys(&mut self, request: DeleteKeysRequest) -> StatusOnlyReply {
        let owner = KeyOwner::from_username(&request.username);
        let result = match (&owner, request.match_behavior) {
            (KeyOwner::Device, KeyMatchBehavior::Exact) => {
                let data = self.db.data_mut();
                data.device_keys
                    .retain(|key| key.key_name != request.key_label_match);
                self.db.save_changes()
            }
            (KeyOwner::Device, KeyMatchBehavior::Prefix) => {
                let data = self.db.data_mut();
                data.device_keys
                    .retain(|key| !key.key_name.starts_with(&request.key_label_match));
                self.db.save_changes()
            }
            (KeyOwner::User(username), KeyMatchBehavior::Exact) => {
                self.key_store.delete(username, &request.key_label_match)
            }
            (KeyOwner::User(username), KeyMatchBehavior::Prefix) => self
                .key_store
                .delete_by_prefix(username, &request.key_label_match),
        };
        match result {
            Ok(()) => StatusOnlyReply::success(),
            Err(e) => {
                warn!("key deletion failed: {}", e);
                StatusOnlyReply::new(AttestationStatus::UnexpectedDeviceError)
            }
        }
    }

    fn handle_reset_identity(&mut self) -> ResetIdentityReply {
        match self.create_identity_internal() {
            Ok(identity_index) => ResetIdentityReply {
                status: AttestationStatus::Success,
                identity_index,
            },
            Err(e) => {
                warn!("identity reset failed: {}", e);
                ResetIdentityReply {
                    status: AttestationStatus::UnexpectedDeviceError,
                    identity_index: 0,
                }
            }
        }
    }

    fn handle_get_enrollment_id(&mut self, ignore_cache: bool) -> GetEnrollmentIdReply {
        if !ignore_cache {
            if let Some(enrollment_id) = &self.enrollment_id_cache {
                return GetEnrollmentIdReply {
                    status: AttestationStatus::Success,
                    enrollment_id: enrollment_id.clone(),
                };
            }
        }
        let ek_public_key = if self.db.data().credentials.endorsement_public_key.is_empty() {
            self.tpm.endorsement_public_key().unwrap_or_default()
        } else {
            self.db.data().credentials.endorsement_public_key.clone()
        };
        match compute_enterprise_enrollment_id(&self.policy.abe_data, &ek_public_key) {
            Some(enrollment_id) => {
                self.enrollment_id_cache = Some(enrollment_id.clone());
                GetEnrollmentIdReply {
                    status: AttestationStatus::Success,
                    enrollment_id,
                }
            }
            None => GetEnrollmentIdReply {
                status: AttestationStatus::NotAvailable,
                enrollment_id: Vec::new(),
            },
        }
    }

    fn handle_get_certified_nv_index(
        &mut self,
        request: GetCertifiedNvIndexRequest,
    ) -> GetCertifiedNvIndexReply {
        if let Some(quote) = self
            .db
            .data()
            .identities
            .get(FIRST_IDENTITY)
            .and_then(|identity| find_certified_nvram_data(identity, request.quote_type))
        {
            return GetCertifiedNvIndexReply {
                status: AttestationStatus::Success,
                quoted_data: quote.quoted_data.clone(),
                signature: quote.signature.clone(),
            };
        }

        let challenge = match self.crypto.get_random(EXTERNAL_DATA_SIZE) {
            Ok(challenge) => challenge,
            Err(_) => {
                return GetCertifiedNvIndexReply {
                    status: AttestationStatus::UnexpectedDeviceError,
                    ..Default::default()
                }
            }
        };
        match quote_nvram_data(self.tpm.as_ref(), request.quote_type, &challenge, true) {
            Ok(Some(quote)) => {
                if let Some(identity) = self.db.data_mut().identities.get_mut(FIRST_IDENTITY) {
                    insert_certified_nvram_data(identity, request.quote_type, quote.clone());
                    if let Err(e) = self.db.save_changes() {
                        warn!("failed to persist NVRAM quote: {}", e);
                    }
                }
                GetCertifiedNvIndexReply {
                    status: AttestationStatus::Success,
                    quoted_data: quote.quoted_data,
                    signature: quote.signature,
                }
            }
            _ => GetCertifiedNvIndexReply {
                status: AttestationStatus::NotAvailable,
                ..Default::default()
            },
        }
    }

    fn handle_get_enrollment_preparations(&mut self) -> GetEnrollmentPreparationsReply {
        let prepared = self.endorsement_credential().is_ok();
        GetEnrollmentPreparationsReply {
            status: AttestationStatus::Success,
            prepared: AcaType::all()
                .iter()
                .map(|aca| {
                    (
                        *aca,
                        prepared && self.google_keys.ca_encryption_key(*aca).is_some(),
                    )
                })
                .collect(),
        }
    }

    /// Index of the certificate record for (identity, ACA), creating an
    /// empty record when none exists. `None` when the identity index is out
    /// of range.
    fn find_or_create_identity_certificate(
        &mut self,
        identity_index: usize,
        aca: AcaType,
    ) -> Option<usize> {
        if identity_index >= self.db.data().identities.len() {
            return None;
        }
        if let Some((index, _)) = self.db.data().find_identity_certificate(identity_index, aca) {
            return Some(index);
        }
        let data = self.db.data_mut();
        data.identity_certificates.push(IdentityCertificateRecord {
            identity_index,
            aca_type: aca,
            identity_credential: Vec::new(),
        });
        Some(data.identity_certificates.len() - 1)
    }

    fn identity_key_blob(&self) -> Option<Vec<u8>> {
        self.db
            .data()
            .identities
            .get(FIRST_IDENTITY)
            .and_then(|identity| identity.identity_key.as_ref())
            .map(|key| key.key_blob.clone())
    }
}

/// Reuse the existing key under this label, or create a fresh certified key.
///
/// Free function so the worker can split borrows between the database, the
/// TPM, and the certification context.
fn prepare_key_material(
    db: &dyn Database,
    key_store: &dyn KeyStore,
    tpm: &mut dyn TpmUtility,
    crypto: &dyn CryptoUtility,
    certification: &CertificationData,
) -> std::result::Result<CertifiedKeyMaterial, AttestationStatus> {
    let owner = KeyOwner::from_username(&certification.username);
    let existing = match &owner {
        KeyOwner::Device => db.data().find_device_key(&certification.key_label).cloned(),
        KeyOwner::User(username) => match key_store.read(username, &certification.key_label) {
            Ok(Some(raw)) => serde_json::from_slice(&raw).ok(),
            Ok(None) => None,
            Err(_) => return Err(AttestationStatus::UnexpectedDeviceError),
        },
    };
    if let Some(key) = existing {
        if !key.key_blob.is_empty() && !key.certify_info.is_empty() {
            return Ok(CertifiedKeyMaterial {
                public_key_der: key.public_key_der,
                key_blob: key.key_blob,
                certify_info: key.certify_info,
                certify_info_signature: key.certify_info_signature,
            });
        }
    }

    let identity_key_blob = db
        .data()
        .identities
        .get(FIRST_IDENTITY)
        .and_then(|identity| identity.identity_key.as_ref())
        .map(|key| key.key_blob.clone())
        .ok_or(AttestationStatus::NotReady)?;
    let external_data = crypto
        .get_random(EXTERNAL_DATA_SIZE)
        .map_err(|_| AttestationStatus::UnexpectedDeviceError)?;
    tpm.create_certified_key(
        certification.key_type,
        certification.key_usage,
        &identity_key_blob,
        &external_data,
    )
    .map_err(|_| AttestationStatus::UnexpectedDeviceError)
}

/// Pick the temporal index for a (user, origin) pair: reuse this user's
/// previous index for the origin, otherwise the lowest index no other user
/// holds for it.
fn choose_temporal_index(
    data: &mut crate::database::AttestationDatabaseData,
    username: &str,
    origin: &str,
) -> u32 {
    let origin_hash = blake3::hash(origin.as_bytes()).as_bytes().to_vec();
    let user_hash = blake3::hash(username.as_bytes()).as_bytes().to_vec();

    let mut used = Vec::new();
    for record in data
        .temporal_index_records
        .iter()
        .filter(|record| record.origin_hash == origin_hash)
    {
        if record.user_hash == user_hash {
            return record.temporal_index;
        }
        used.push(record.temporal_index);
    }

    let mut index = 0u32;
    while used.contains(&index) {
        index += 1;
    }
    data.temporal_index_records.push(TemporalIndexRecord {
        origin_hash,
        user_hash,
        temporal_index: index,
    });
    index
}

fn certificate_chain_pem(leaf: &[u8], intermediates: &[Vec<u8>]) -> String {
    if leaf.is_empty() {
        return String::new();
    }
    let mut chain: Vec<&[u8]> = vec![leaf];
    chain.extend(intermediates.iter().map(|cert| cert.as_slice()));
    pem_encode_certificate_chain(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::AttestationDatabaseData;

    #[test]
    fn test_temporal_index_reused_for_same_user() {
        let mut data = AttestationDatabaseData::default();
        let first = choose_temporal_index(&mut data, "alice", "origin-a");
        let second = choose_temporal_index(&mut data, "alice", "origin-a");
        assert_eq!(first, second);
        assert_eq!(data.temporal_index_records.len(), 1);
    }

    #[test]
    fn test_temporal_index_differs_between_users() {
        let mut data = AttestationDatabaseData::default();
        let alice = choose_temporal_index(&mut data, "alice", "origin-a");
        let bob = choose_temporal_index(&mut data, "bob", "origin-a");
        assert_ne!(alice, bob);
    }

    #[test]
    fn test_temporal_index_ties_break_lowest_unused() {
        let mut data = AttestationDatabaseData::default();
        assert_eq!(choose_temporal_index(&mut data, "alice", "origin-a"), 0);
        assert_eq!(choose_temporal_index(&mut data, "bob", "origin-a"), 1);
        assert_eq!(choose_temporal_index(&mut data, "carol", "origin-a"), 2);
        // A different origin starts from zero again.
        assert_eq!(choose_temporal_index(&mut data, "bob", "origin-b"), 0);
    }

    #[test]
    fn test_chain_pem_empty_without_leaf() {
        assert!(certificate_chain_pem(&[], &[vec![1, 2, 3]]).is_empty());
        assert!(!certificate_chain_pem(&[1], &[]).is_empty());
    }
}
