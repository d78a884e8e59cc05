//! Page-facing SDK: initialises a verification session with the backend and
//! drives it through the extension bridge.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use serde_json::json;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::backend::{BackendApi, InitSessionRequest};
use crate::bridge::{PageEnvelope, PageMessage, VerificationCompleted, VerificationFailed};
use crate::config::DEFAULT_BACKEND_URL;
use crate::content::epoch_millis;
use crate::error::SdkError;
use crate::proof::Proof;
use crate::provider::TemplateData;

lazy_static! {
    /// Only one verification runs at a time per page, across requests.
    static ref SESSION_QUEUE: Mutex<()> = Mutex::new(());
}

/// `window.postMessage` as seen from the page.
#[async_trait]
pub trait ExtensionBridge: Send + Sync {
    async fn post(&self, envelope: PageEnvelope) -> Result<(), SdkError>;

    /// Messages the extension posts back to the page.
    fn subscribe(&self) -> broadcast::Receiver<PageEnvelope>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofRequestOptions {
    pub extension_id: String,
    pub provider_version: Option<String>,
    pub backend_url: String,
}

impl Default for ProofRequestOptions {
    fn default() -> Self {
        Self {
            extension_id: String::new(),
            provider_version: None,
            backend_url: DEFAULT_BACKEND_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerificationEvent {
    Started { session_id: String },
    Completed(Vec<Proof>),
    Error(String),
}

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256_hex(key: &[u8], message: &[u8]) -> Result<String, SdkError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|err| SdkError::Signing(err.to_string()))?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Hex HMAC-SHA256, keyed by the app secret, over the canonical
/// `{providerId, timestamp}` document.
pub fn sign_session_request(app_secret: &str, provider_id: &str, timestamp: &str) -> Result<String, SdkError> {
    let canonical = json!({ "providerId": provider_id, "timestamp": timestamp }).to_string();
    hmac_sha256_hex(app_secret.as_bytes(), canonical.as_bytes())
}

pub struct ExtensionProofRequest {
    application_id: String,
    provider_id: String,
    session_id: String,
    signature: String,
    timestamp: String,
    resolved_provider_version: Option<String>,
    options: ProofRequestOptions,
    callback_url: Option<String>,
    redirect_url: Option<String>,
    context: Option<String>,
    parameters: BTreeMap<String, String>,
    bridge: Arc<dyn ExtensionBridge>,
    events: broadcast::Sender<VerificationEvent>,
}

fn require(value: &str, what: &'static str) -> Result<(), SdkError> {
    if value.trim().is_empty() {
        return Err(SdkError::InvalidInput(what));
    }
    Ok(())
}

fn require_url(value: &str, what: &'static str) -> Result<String, SdkError> {
    require(value, what)?;
    Url::parse(value).map_err(|_| SdkError::InvalidInput(what))?;
    Ok(value.to_string())
}

impl ExtensionProofRequest {
    pub async fn init(
        application_id: &str,
        app_secret: &str,
        provider_id: &str,
        options: ProofRequestOptions,
        backend: Arc<dyn BackendApi>,
        bridge: Arc<dyn ExtensionBridge>,
    ) -> Result<Self, SdkError> {
        require(application_id, "applicationId is required")?;
        require(app_secret, "appSecret is required")?;
        require(provider_id, "providerId is required")?;

        let timestamp = epoch_millis().to_string();
        let signature = sign_session_request(app_secret, provider_id, &timestamp)?;
        let response = backend
            .init_session(&InitSessionRequest {
                provider_id: provider_id.to_string(),
                app_id: application_id.to_string(),
                timestamp: timestamp.clone(),
                signature: signature.clone(),
                version_number: options.provider_version.clone().unwrap_or_default(),
            })
            .await?;
        info!(
            session_id = %response.session_id,
            provider_id,
            "verification session initialised"
        );

        let (events, _) = broadcast::channel(16);
        Ok(Self {
            application_id: application_id.to_string(),
            provider_id: provider_id.to_string(),
            session_id: response.session_id,
            signature,
            timestamp,
            resolved_provider_version: response.resolved_provider_version,
            options,
            callback_url: None,
            redirect_url: None,
            context: None,
            parameters: BTreeMap::new(),
            bridge,
            events,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn set_app_callback_url(&mut self, url: &str) -> Result<(), SdkError> {
        self.callback_url = Some(require_url(url, "callback url must be a valid url")?);
        Ok(())
    }

    pub fn set_redirect_url(&mut self, url: &str) -> Result<(), SdkError> {
        self.redirect_url = Some(require_url(url, "redirect url must be a valid url")?);
        Ok(())
    }

    pub fn add_context(&mut self, address: &str, message: &str) {
        self.context = Some(
            json!({ "contextAddress": address, "contextMessage": message }).to_string(),
        );
    }

    pub fn set_params(&mut self, parameters: BTreeMap<String, String>) {
        self.parameters = parameters;
    }

    /// Subscribes to verification events. Dropping the receiver
    /// unsubscribes.
    pub fn on(&self) -> broadcast::Receiver<VerificationEvent> {
        self.events.subscribe()
    }

    pub fn get_status_url(&self) -> String {
        format!(
            "{}/api/sdk/session/{}",
            self.options.backend_url.trim_end_matches('/'),
            self.session_id
        )
    }

    pub fn template_data(&self) -> TemplateData {
        TemplateData {
            session_id: self.session_id.clone(),
            provider_id: self.provider_id.clone(),
            application_id: self.application_id.clone(),
            signature: self.signature.clone(),
            timestamp: self.timestamp.clone(),
            callback_url: self.callback_url.clone(),
            redirect_url: self.redirect_url.clone(),
            context: self.context.clone(),
            parameters: self.parameters.clone(),
            provider_version: self.options.provider_version.clone(),
            resolved_provider_version: self.resolved_provider_version.clone(),
        }
    }

    /// Asks the extension whether it is installed under the configured id.
    pub async fn check_extension_installed(&self, timeout: Duration) -> bool {
        let mut replies = self.bridge.subscribe();
        let check = PageEnvelope::to_extension(self.options.extension_id.clone(), PageMessage::ExtensionCheck);
        if self.bridge.post(check).await.is_err() {
            return false;
        }
        let wait = async {
            loop {
                match replies.recv().await {
                    Ok(envelope) => {
                        if let PageMessage::ExtensionCheckResponse(reply) = envelope.message {
                            return reply.installed;
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return false,
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    /// Starts verification in the extension and resolves with the proofs.
    /// Concurrent calls, from this or any other request, run one at a time.
    pub async fn start_verification(&self) -> Result<Vec<Proof>, SdkError> {
        let _turn = SESSION_QUEUE.lock().await;
        debug!(session_id = %self.session_id, "verification turn acquired");

        let mut replies = self.bridge.subscribe();
        self.bridge
            .post(PageEnvelope::to_extension(
                self.options.extension_id.clone(),
                PageMessage::StartVerification(self.template_data()),
            ))
            .await?;

        let mut started = false;
        loop {
            let envelope = match replies.recv().await {
                Ok(envelope) => envelope,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "bridge replies lagged");
                    continue;
                }
                Err(RecvError::Closed) => {
                    self.emit(VerificationEvent::Error(SdkError::BridgeClosed.to_string()));
                    return Err(SdkError::BridgeClosed);
                }
            };
            match envelope.message {
                PageMessage::VerificationStarted(ack) if ack.session_id == self.session_id => {
                    started = true;
                    self.emit(VerificationEvent::Started {
                        session_id: ack.session_id,
                    });
                }
                PageMessage::VerificationCompleted(VerificationCompleted { proofs, session_id })
                    if self.owns_result(session_id.as_deref(), started) =>
                {
                    info!(session_id = %self.session_id, proofs = proofs.len(), "verification completed");
                    self.emit(VerificationEvent::Completed(proofs.clone()));
                    return Ok(proofs);
                }
                PageMessage::VerificationFailed(VerificationFailed { error, session_id })
                    if self.owns_result(session_id.as_deref(), started) =>
                {
                    warn!(session_id = %self.session_id, reason = %error, "verification failed");
                    self.emit(VerificationEvent::Error(error.clone()));
                    return Err(SdkError::Verification(error));
                }
                PageMessage::VerificationCompleted(_) | PageMessage::VerificationFailed(_) => {
                    debug!(session_id = %self.session_id, "result for another session ignored");
                }
                _ => {}
            }
        }
    }

    /// A tagged result must name this session. An untagged one is only
    /// trusted once the extension acknowledged this session's start.
    fn owns_result(&self, session_id: Option<&str>, started: bool) -> bool {
        match session_id {
            Some(id) => id == self.session_id,
            None => started,
        }
    }

    /// Asks the extension to cancel. Returns whether the cancellation was
    /// confirmed within `timeout`.
    pub async fn cancel(&self, timeout: Duration) -> Result<bool, SdkError> {
        let mut replies = self.bridge.subscribe();
        self.bridge
            .post(PageEnvelope::to_extension(
                self.options.extension_id.clone(),
                PageMessage::CancelVerification,
            ))
            .await?;

        let confirmed = async {
            loop {
                match replies.recv().await {
                    Ok(envelope) => {
                        if matches!(envelope.message, PageMessage::VerificationFailed(_)) {
                            return true;
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return false,
                }
            }
        };
        Ok(tokio::time::timeout(timeout, confirmed).await.unwrap_or(false))
    }

    fn emit(&self, event: VerificationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
