//! The isolated attestation context and the background's client for it.
//!
//! The background never talks to the attestor directly. It asks the
//! offscreen context for a per-session signing key and for proofs over the
//! runtime bus; the offscreen context owns the attestor connection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::browser::BrowserApi;
use crate::claim::Claim;
use crate::config::TimeoutPolicy;
use crate::error::{AttestationError, RpcError};
use crate::messages::{
    Envelope, GenerateProofRequest, GenerateProofResponse, MessageBody, MessageContext,
    PrivateKeyRequest, PrivateKeyResponse,
};
use crate::proof::AttestorProof;
use crate::rpc::PendingReplies;

/// The background's view of the attestation context.
#[async_trait]
pub trait OffscreenClient: Send + Sync {
    async fn get_private_key(&self, session_id: &str) -> Result<String, RpcError>;

    async fn generate_proof(
        &self,
        claim: Claim,
        public_data: Option<String>,
    ) -> Result<AttestorProof, RpcError>;
}

/// External attestor reachable over its session-scoped WebSocket.
#[async_trait]
pub trait Attestor: Send + Sync {
    async fn create_claim(
        &self,
        claim: &Claim,
        public_data: Option<&str>,
    ) -> Result<AttestorProof, AttestationError>;
}

/// Talks to the offscreen context over runtime broadcasts. Replies come back
/// through the background router, which resolves them on the shared
/// `PendingReplies`.
pub struct RuntimeOffscreenClient {
    browser: Arc<dyn BrowserApi>,
    pending: PendingReplies,
    timeouts: TimeoutPolicy,
}

impl RuntimeOffscreenClient {
    pub fn new(browser: Arc<dyn BrowserApi>, pending: PendingReplies, timeouts: TimeoutPolicy) -> Self {
        Self {
            browser,
            pending,
            timeouts,
        }
    }

    async fn send(
        browser: Arc<dyn BrowserApi>,
        label: &'static str,
        body: MessageBody,
    ) -> Result<(), RpcError> {
        browser
            .broadcast(Envelope::to_offscreen(body))
            .await
            .map_err(|err| RpcError::Send {
                label,
                reason: err.to_string(),
            })
    }
}

#[async_trait]
impl OffscreenClient for RuntimeOffscreenClient {
    async fn get_private_key(&self, session_id: &str) -> Result<String, RpcError> {
        const LABEL: &str = "GET_PRIVATE_KEY";
        let browser = self.browser.clone();
        let session_id = session_id.to_string();

        let reply: PrivateKeyResponse = self
            .pending
            .call(LABEL, self.timeouts.private_key, |request_id| {
                Self::send(
                    browser,
                    LABEL,
                    MessageBody::GetPrivateKey(PrivateKeyRequest {
                        request_id,
                        session_id,
                    }),
                )
            })
            .await?;

        match reply.private_key {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(RpcError::Remote {
                label: LABEL,
                reason: reply
                    .error
                    .unwrap_or_else(|| "no private key returned".to_string()),
            }),
        }
    }

    async fn generate_proof(
        &self,
        claim: Claim,
        public_data: Option<String>,
    ) -> Result<AttestorProof, RpcError> {
        const LABEL: &str = "GENERATE_PROOF";
        let browser = self.browser.clone();

        let reply: GenerateProofResponse = self
            .pending
            .call(LABEL, self.timeouts.attestation, |request_id| {
                Self::send(
                    browser,
                    LABEL,
                    MessageBody::GenerateProof(GenerateProofRequest {
                        request_id,
                        claim_data: claim,
                        public_data,
                    }),
                )
            })
            .await?;

        match (reply.success, reply.proof) {
            (true, Some(proof)) => Ok(proof),
            _ => Err(RpcError::Remote {
                label: LABEL,
                reason: reply
                    .error
                    .unwrap_or_else(|| "proof generation failed".to_string()),
            }),
        }
    }
}

/// The offscreen context itself: answers key and proof requests.
pub struct AttestationWorker {
    attestor: Arc<dyn Attestor>,
    /// Key of the most recent session; a new session replaces it.
    current_key: Mutex<Option<(String, String)>>,
    attestation_timeout: Duration,
}

impl AttestationWorker {
    pub fn new(attestor: Arc<dyn Attestor>, attestation_timeout: Duration) -> Self {
        Self {
            attestor,
            current_key: Mutex::new(None),
            attestation_timeout,
        }
    }

    /// Sent once when the context has loaded.
    pub fn ready_announcement() -> Envelope {
        Envelope::from_offscreen(MessageBody::OffscreenDocumentReady)
    }

    /// The signing key for `session_id`, generated on first use. Only the
    /// latest session's key is retained.
    pub fn private_key_for(&self, session_id: &str) -> String {
        let mut current = match self.current_key.lock() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((owner, key)) = current.as_ref() {
            if owner == session_id {
                return key.clone();
            }
        }
        let bytes: [u8; 32] = rand::thread_rng().gen();
        let key = format!("0x{}", hex::encode(bytes));
        debug!(session_id, "generated session signing key");
        *current = Some((session_id.to_string(), key.clone()));
        key
    }

    pub fn retained_keys(&self) -> usize {
        match self.current_key.lock() {
            Ok(current) => usize::from(current.is_some()),
            Err(poisoned) => usize::from(poisoned.into_inner().is_some()),
        }
    }

    /// Handles one runtime message addressed to this context and returns the
    /// reply to send back, if any.
    pub async fn handle(&self, envelope: Envelope) -> Option<Envelope> {
        if envelope.target != MessageContext::Offscreen {
            return None;
        }
        match envelope.body {
            MessageBody::GetPrivateKey(request) => {
                let key = self.private_key_for(&request.session_id);
                Some(Envelope::from_offscreen(MessageBody::GetPrivateKeyResponse(
                    PrivateKeyResponse {
                        request_id: request.request_id,
                        private_key: Some(key),
                        error: None,
                    },
                )))
            }
            MessageBody::GenerateProof(request) => {
                let request_id = request.request_id;
                let reply = match self.generate(request).await {
                    Ok(proof) => GenerateProofResponse {
                        request_id,
                        success: true,
                        proof: Some(proof),
                        error: None,
                    },
                    Err(err) => {
                        warn!(request_id, error = %err, "proof generation failed");
                        GenerateProofResponse {
                            request_id,
                            success: false,
                            proof: None,
                            error: Some(err.to_string()),
                        }
                    }
                };
                Some(Envelope::from_offscreen(MessageBody::GenerateProofResponse(reply)))
            }
            other => {
                debug!(action = other.action(), "offscreen ignoring message");
                None
            }
        }
    }

    async fn generate(&self, request: GenerateProofRequest) -> Result<AttestorProof, AttestationError> {
        let claim = request.claim_data;
        if claim.owner_private_key.is_empty() {
            return Err(AttestationError::MissingKey);
        }

        let attempt = self
            .attestor
            .create_claim(&claim, request.public_data.as_deref());
        match tokio::time::timeout(self.attestation_timeout, attempt).await {
            Ok(Ok(proof)) => {
                info!(session_id = %claim.session_id, identifier = %proof.claim.identifier, "proof generated");
                Ok(proof)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(AttestationError::TimedOut(self.attestation_timeout)),
        }
    }
}
