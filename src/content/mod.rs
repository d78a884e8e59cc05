//! Per-tab content script.
//!
//! Every tab runs one. It relays the page bridge to the background in all
//! tabs; in tabs the background manages it also runs the network filter
//! and mirrors session progress into the on-page widget.

pub mod observer;
pub mod page;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::bridge::{
    ExtensionCheckReply, PageEnvelope, PageMessage, ParametersUpdate, VerificationCompleted,
    VerificationFailed, VerificationStarted,
};
use crate::config::FilterPolicy;
use crate::error::ContentError;
use crate::messages::{ActionResult, Envelope, MessageBody, ProviderDataReady};

pub use observer::{FilterStatus, NetworkObserver, ScanOutcome};
pub use page::{PageGate, PageRequest};

/// The content script's runtime connection to the background.
#[async_trait]
pub trait BackgroundPort: Send + Sync {
    async fn send(&self, body: MessageBody) -> Result<ActionResult, ContentError>;
}

/// `window.postMessage` towards the page.
#[async_trait]
pub trait PagePort: Send + Sync {
    async fn post(&self, envelope: PageEnvelope) -> Result<(), ContentError>;
}

/// What the on-page verification widget shows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WidgetState {
    #[default]
    Hidden,
    LoggingIn {
        provider_name: String,
        description: String,
    },
    CreatingClaim {
        request_hash: String,
    },
    GeneratingProof {
        request_hash: String,
    },
    ProofGenerated {
        generated: usize,
    },
    Completed,
    Failed {
        error: String,
    },
}

pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

enum ContentEvent {
    Background(Envelope),
    Page(PageEnvelope),
    Widget(oneshot::Sender<WidgetState>),
    Managed(oneshot::Sender<bool>),
    Shutdown,
}

#[derive(Clone)]
pub struct ContentHandle {
    events: mpsc::UnboundedSender<ContentEvent>,
}

impl ContentHandle {
    /// A runtime message addressed to this tab.
    pub fn on_background_message(&self, envelope: Envelope) {
        if self.events.send(ContentEvent::Background(envelope)).is_err() {
            debug!("content script gone, background message dropped");
        }
    }

    pub fn on_page_message(&self, envelope: PageEnvelope) {
        if self.events.send(ContentEvent::Page(envelope)).is_err() {
            debug!("content script gone, page message dropped");
        }
    }

    pub async fn widget(&self) -> Option<WidgetState> {
        let (tx, rx) = oneshot::channel();
        self.events.send(ContentEvent::Widget(tx)).ok()?;
        rx.await.ok()
    }

    pub async fn is_managed(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.events.send(ContentEvent::Managed(tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn shutdown(&self) {
        let _ = self.events.send(ContentEvent::Shutdown);
    }
}

pub struct ContentScript {
    policy: FilterPolicy,
    background: Arc<dyn BackgroundPort>,
    page: Arc<dyn PagePort>,
    gate: PageGate,
    observer: NetworkObserver,
    managed: bool,
    widget: WidgetState,
    generated: usize,
}

impl ContentScript {
    pub fn spawn(
        policy: FilterPolicy,
        extension_id: impl Into<String>,
        background: Arc<dyn BackgroundPort>,
        page: Arc<dyn PagePort>,
    ) -> ContentHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let script = Self {
            policy,
            background,
            page,
            gate: PageGate::new(extension_id),
            observer: NetworkObserver::new(policy),
            managed: false,
            widget: WidgetState::Hidden,
            generated: 0,
        };
        tokio::spawn(script.run(rx));
        ContentHandle { events: tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ContentEvent>) {
        self.announce().await;

        let mut ticker = tokio::time::interval(self.policy.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(ContentEvent::Background(envelope)) => self.on_background(envelope).await,
                    Some(ContentEvent::Page(envelope)) => self.on_page(envelope).await,
                    Some(ContentEvent::Widget(tx)) => {
                        let _ = tx.send(self.widget.clone());
                    }
                    Some(ContentEvent::Managed(tx)) => {
                        let _ = tx.send(self.managed);
                    }
                    Some(ContentEvent::Shutdown) | None => break,
                },
                _ = ticker.tick() => self.on_tick(),
            }
        }
        self.observer.stop();
        debug!("content script stopped");
    }

    async fn announce(&mut self) {
        if let Err(err) = self.background.send(MessageBody::ContentScriptLoaded).await {
            warn!(error = %err, "content script load announcement failed");
        }
        match self.background.send(MessageBody::CheckIfManagedTab).await {
            Ok(result) => {
                let managed = result
                    .data
                    .as_ref()
                    .and_then(|data| data.get("isManaged"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.managed = self.managed || managed;
                debug!(managed = self.managed, "managed tab check");
            }
            Err(err) => warn!(error = %err, "managed tab check failed"),
        }
        if self.managed {
            self.fetch_provider_data().await;
        }
    }

    /// Pulls the session's provider data. A reloaded verification tab has no
    /// staged messages left, so this is how it resumes filtering.
    async fn fetch_provider_data(&mut self) {
        let result = match self.background.send(MessageBody::RequestProviderData).await {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "provider data request failed");
                return;
            }
        };
        if !result.success {
            debug!(error = ?result.error, "no provider data for this tab");
            return;
        }
        match result.data.map(serde_json::from_value::<ProviderDataReady>) {
            Some(Ok(ready)) => self.on_provider_data(ready),
            Some(Err(err)) => warn!(error = %err, "malformed provider data reply"),
            None => debug!("provider data reply carried no payload"),
        }
    }

    fn on_tick(&mut self) {
        if !self.observer.is_filtering() {
            return;
        }
        let outcome = self.observer.scan(epoch_millis());
        for request in outcome.found {
            let background = self.background.clone();
            let request_hash = request.criteria.request_hash.clone();
            tokio::spawn(async move {
                match background.send(MessageBody::FilteredRequestFound(request)).await {
                    Ok(result) if result.success => {
                        debug!(request_hash = %request_hash, "filtered request accepted");
                    }
                    Ok(result) => {
                        warn!(request_hash = %request_hash, error = ?result.error, "filtered request rejected");
                    }
                    Err(err) => {
                        warn!(request_hash = %request_hash, error = %err, "filtered request not delivered");
                    }
                }
            });
        }
        if outcome.status == FilterStatus::TimedOut {
            info!("network filter gave up waiting for matching requests");
        }
    }

    async fn on_background(&mut self, envelope: Envelope) {
        match envelope.body {
            MessageBody::ShowProviderVerificationPopup(popup) => {
                self.widget = WidgetState::LoggingIn {
                    provider_name: popup.provider_name,
                    description: popup.description,
                };
            }
            MessageBody::ProviderDataReady(ready) => self.on_provider_data(ready),
            MessageBody::ClaimCreationRequested(progress) => {
                self.widget = WidgetState::CreatingClaim {
                    request_hash: progress.request_hash,
                };
            }
            MessageBody::ClaimCreationSuccess(progress) => {
                debug!(request_hash = %progress.request_hash, "claim created");
            }
            MessageBody::ClaimCreationFailed(notice) | MessageBody::ProofSubmissionFailed(notice) => {
                self.widget = WidgetState::Failed { error: notice.error };
            }
            MessageBody::ProofGenerationStarted(progress) => {
                self.widget = WidgetState::GeneratingProof {
                    request_hash: progress.request_hash,
                };
            }
            MessageBody::ProofGenerationSuccess(_) => {
                self.generated += 1;
                self.widget = WidgetState::ProofGenerated {
                    generated: self.generated,
                };
            }
            MessageBody::ProofGenerationFailed(notice) => {
                self.observer.stop();
                self.widget = WidgetState::Failed {
                    error: notice.error.clone(),
                };
                self.post_to_page(PageMessage::VerificationFailed(VerificationFailed {
                    error: notice.error,
                    session_id: notice.session_id,
                }))
                .await;
            }
            MessageBody::ProofSubmitted(submitted) => {
                self.observer.stop();
                self.widget = WidgetState::Completed;
                self.post_to_page(PageMessage::VerificationCompleted(VerificationCompleted {
                    proofs: submitted.proofs,
                    session_id: submitted.session_id,
                }))
                .await;
            }
            other => debug!(action = other.action(), "content script ignored message"),
        }
    }

    fn on_provider_data(&mut self, ready: ProviderDataReady) {
        self.managed = true;
        if self.observer.session_id() == Some(ready.session_id.as_str()) {
            debug!(session_id = %ready.session_id, "filter already running for session");
            return;
        }
        self.generated = 0;
        let provider = ready.provider_data;
        if self.widget == WidgetState::Hidden {
            let provider_name = provider.name.clone().unwrap_or_default();
            self.widget = WidgetState::LoggingIn {
                description: format!("Log in to {provider_name} to generate your proof"),
                provider_name,
            };
        }
        if !provider.observes_network() || provider.request_data.is_empty() {
            debug!(session_id = %ready.session_id, "provider needs no network filtering");
            return;
        }
        self.observer.start(
            provider.request_data,
            ready.parameters,
            ready.session_id,
            provider.login_url,
            epoch_millis(),
        );
    }

    async fn on_page(&mut self, envelope: PageEnvelope) {
        let action = envelope.action();
        match self.gate.admit(envelope) {
            PageRequest::Ignore => {}
            PageRequest::ExtensionCheck { installed } => {
                self.post_to_page(PageMessage::ExtensionCheckResponse(ExtensionCheckReply {
                    installed,
                }))
                .await;
            }
            PageRequest::Capture(entry) => {
                if self.managed {
                    self.observer.ingest(entry);
                }
            }
            PageRequest::Forward(body) => self.forward(action, body),
        }
    }

    /// Sends a page request to the background without blocking the script;
    /// replies the page waits for are posted back from the spawned task.
    fn forward(&self, action: &'static str, body: MessageBody) {
        let background = self.background.clone();
        let page = self.page.clone();
        let start_session = match &body {
            MessageBody::StartVerification(template) => Some(template.session_id.clone()),
            _ => None,
        };
        let wants_parameters = matches!(body, MessageBody::GetParameters);

        tokio::spawn(async move {
            let result = match background.send(body).await {
                Ok(result) => result,
                Err(err) => ActionResult::failed(err.to_string()),
            };

            let reply = if let Some(session_id) = start_session {
                Some(if result.success {
                    PageMessage::VerificationStarted(VerificationStarted { session_id })
                } else {
                    PageMessage::VerificationFailed(VerificationFailed {
                        error: result.error.clone().unwrap_or_default(),
                        session_id: Some(session_id),
                    })
                })
            } else if wants_parameters && result.success {
                let parameters = result
                    .data
                    .clone()
                    .and_then(|data| serde_json::from_value(data).ok())
                    .unwrap_or_default();
                Some(PageMessage::ParametersUpdate(ParametersUpdate { parameters }))
            } else {
                None
            };

            if !result.success {
                warn!(action, error = ?result.error, "background rejected page request");
            }
            if let Some(reply) = reply {
                if let Err(err) = page.post(PageEnvelope::anonymous(reply)).await {
                    warn!(action, error = %err, "page reply not delivered");
                }
            }
        });
    }

    async fn post_to_page(&self, message: PageMessage) {
        let action = message.action();
        if let Err(err) = self.page.post(PageEnvelope::anonymous(message)).await {
            warn!(action, error = %err, "page notification failed");
        }
    }
}
