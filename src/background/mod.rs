//! Background orchestrator.
//!
//! One actor task owns the session state, the proof queue and the watchdog.
//! Everything that touches them arrives as an [`Event`] on the actor's
//! channel: runtime messages, tab removals, and the results of work the
//! actor spawned (provider fetches, claim builds, attestations, callback
//! deliveries). Spawned work carries the session id it was started for and
//! is discarded on return if that session is no longer current.

mod claims;
mod verification;

use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::backend::BackendApi;
use crate::browser::{BrowserApi, MessageSender, TabId};
use crate::claim::{Claim, ClaimBuilder};
use crate::config::OrchestratorConfig;
use crate::cookies::CookieStore;
use crate::error::{ClaimError, OrchestratorError, RpcError};
use crate::messages::{
    ActionResult, Envelope, FilteredRequest, MessageBody, ProviderDataReady, SessionStatus,
};
use crate::offscreen::OffscreenClient;
use crate::proof::{AttestorProof, Proof};
use crate::provider::{ProviderData, RequestTemplate, TemplateData};
use crate::queue::ProofQueue;
use crate::rpc::PendingReplies;
use crate::session::{SessionSnapshot, SessionState};
use crate::timer::SessionTimer;

pub use claims::{adhoc_request_hash, adhoc_template};

/// Collaborators the orchestrator talks to.
#[derive(Clone)]
pub struct Dependencies {
    pub browser: Arc<dyn BrowserApi>,
    pub backend: Arc<dyn BackendApi>,
    pub cookies: Arc<dyn CookieStore>,
    pub offscreen: Arc<dyn OffscreenClient>,
    /// Shared with the offscreen client; `*_RESPONSE` messages resolve it.
    pub pending: PendingReplies,
}

enum Event {
    Dispatch {
        envelope: Envelope,
        sender: MessageSender,
        reply: oneshot::Sender<ActionResult>,
    },
    TabRemoved(TabId),
    Fail {
        message: String,
        request_hash: Option<String>,
        done: oneshot::Sender<()>,
    },
    Submit {
        done: oneshot::Sender<()>,
    },
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown,
    ProviderFetched {
        session_id: String,
        result: Result<ProviderData, String>,
    },
    ClaimPrepared {
        session_id: String,
        notify_tab: Option<TabId>,
        criteria: RequestTemplate,
        result: Result<Claim, ClaimError>,
        reply: Option<oneshot::Sender<ActionResult>>,
    },
    ProofFinished {
        session_id: String,
        request_hash: String,
        result: Result<AttestorProof, RpcError>,
    },
    WatchdogExpired {
        generation: u64,
    },
    SubmitRequested {
        session_id: String,
    },
    SubmissionFinished {
        session_id: String,
        proofs: Vec<Proof>,
        result: Result<(), String>,
    },
}

/// Cloneable front door to the orchestrator actor.
#[derive(Clone)]
pub struct OrchestratorHandle {
    events: mpsc::UnboundedSender<Event>,
}

impl OrchestratorHandle {
    /// Routes one runtime message and waits for its result.
    pub async fn dispatch(&self, envelope: Envelope, sender: MessageSender) -> ActionResult {
        let (reply, rx) = oneshot::channel();
        if self
            .events
            .send(Event::Dispatch {
                envelope,
                sender,
                reply,
            })
            .is_err()
        {
            return ActionResult::failed(OrchestratorError::Stopped.to_string());
        }
        rx.await
            .unwrap_or_else(|_| ActionResult::failed(OrchestratorError::Stopped.to_string()))
    }

    pub fn tab_removed(&self, tab: TabId) {
        if self.events.send(Event::TabRemoved(tab)).is_err() {
            debug!(tab_id = %tab, "tab removal after shutdown ignored");
        }
    }

    pub async fn start_verification(&self, template: TemplateData, sender: MessageSender) -> ActionResult {
        self.dispatch(
            Envelope::to_background(MessageBody::StartVerification(template)),
            sender,
        )
        .await
    }

    pub async fn cancel_session(&self) -> ActionResult {
        self.dispatch(
            Envelope::to_background(MessageBody::CancelVerification),
            MessageSender::extension(),
        )
        .await
    }

    pub async fn process_filtered_request(
        &self,
        request: FilteredRequest,
        sender: MessageSender,
    ) -> ActionResult {
        self.dispatch(
            Envelope::to_background(MessageBody::FilteredRequestFound(request)),
            sender,
        )
        .await
    }

    pub async fn fail_session(&self, message: impl Into<String>, request_hash: Option<String>) {
        let (done, rx) = oneshot::channel();
        let event = Event::Fail {
            message: message.into(),
            request_hash,
            done,
        };
        if self.events.send(event).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn submit_proofs(&self) {
        let (done, rx) = oneshot::channel();
        if self.events.send(Event::Submit { done }).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(Event::Snapshot(tx))
            .map_err(|_| OrchestratorError::Stopped)?;
        rx.await.map_err(|_| OrchestratorError::Stopped)
    }

    pub fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown);
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    deps: Dependencies,
    claims: ClaimBuilder,
    state: SessionState,
    queue: ProofQueue,
    timer: SessionTimer,
    events: mpsc::WeakUnboundedSender<Event>,
}

impl Orchestrator {
    pub fn spawn(config: OrchestratorConfig, deps: Dependencies) -> OrchestratorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let weak = tx.downgrade();

        let watchdog = weak.clone();
        let timer = SessionTimer::new(
            config.timeouts.session,
            Arc::new(move |generation| {
                if let Some(tx) = watchdog.upgrade() {
                    let _ = tx.send(Event::WatchdogExpired { generation });
                }
            }),
        );
        let claims = ClaimBuilder::new(
            deps.offscreen.clone(),
            deps.backend.clone(),
            config.backend.attestor_url.clone(),
        );

        let orchestrator = Self {
            config,
            deps,
            claims,
            state: SessionState::default(),
            queue: ProofQueue::new(),
            timer,
            events: weak,
        };
        tokio::spawn(orchestrator.run(rx));

        OrchestratorHandle { events: tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        info!("orchestrator started");
        while let Some(event) = rx.recv().await {
            match event {
                Event::Dispatch {
                    envelope,
                    sender,
                    reply,
                } => self.route(envelope, sender, reply).await,
                Event::TabRemoved(tab) => self.on_tab_removed(tab).await,
                Event::Fail {
                    message,
                    request_hash,
                    done,
                } => {
                    self.fail_session(&message, request_hash).await;
                    let _ = done.send(());
                }
                Event::Submit { done } => {
                    self.submit_proofs().await;
                    let _ = done.send(());
                }
                Event::Snapshot(tx) => {
                    let _ = tx.send(self.state.snapshot(&self.queue));
                }
                Event::Shutdown => break,
                Event::ProviderFetched { session_id, result } => {
                    self.on_provider_fetched(&session_id, result).await
                }
                Event::ClaimPrepared {
                    session_id,
                    notify_tab,
                    criteria,
                    result,
                    reply,
                } => {
                    self.on_claim_prepared(&session_id, notify_tab, criteria, result, reply)
                        .await
                }
                Event::ProofFinished {
                    session_id,
                    request_hash,
                    result,
                } => self.on_proof_finished(&session_id, request_hash, result).await,
                Event::WatchdogExpired { generation } => self.on_watchdog(generation).await,
                Event::SubmitRequested { session_id } => {
                    if self.state.is_current(&session_id) {
                        self.submit_proofs().await;
                    }
                }
                Event::SubmissionFinished {
                    session_id,
                    proofs,
                    result,
                } => self.on_submission_finished(&session_id, proofs, result).await,
            }
        }
        self.timer.clear_all();
        info!("orchestrator stopped");
    }

    async fn route(
        &mut self,
        envelope: Envelope,
        sender: MessageSender,
        reply: oneshot::Sender<ActionResult>,
    ) {
        let action = envelope.action();
        debug!(action, tab_id = ?sender.tab_id, "background received message");

        let result = match envelope.body {
            MessageBody::ContentScriptLoaded => self.on_content_script_loaded(&sender).await,
            MessageBody::ShouldInitialize => {
                let managed = sender.tab_id.is_some_and(|tab| self.state.is_managed(tab));
                ActionResult::ok_with(json!({ "shouldInitialize": managed }))
            }
            MessageBody::CheckIfManagedTab => {
                let managed = sender.tab_id.is_some_and(|tab| self.state.is_managed(tab));
                ActionResult::ok_with(json!({ "isManaged": managed }))
            }
            MessageBody::RequestProviderData => self.provider_data_for(&sender),
            MessageBody::StartVerification(template) => {
                self.start_verification(template, &sender).await
            }
            MessageBody::CancelVerification => {
                self.cancel_session().await;
                ActionResult::ok()
            }
            MessageBody::FilteredRequestFound(request) => {
                self.process_filtered_request(request, sender.tab_id, Some(reply))
                    .await;
                return;
            }
            MessageBody::RequestClaim(manual) => {
                self.request_manual_claim(manual, &sender, reply).await;
                return;
            }
            MessageBody::GetPrivateKeyResponse(response) => {
                let id = response.request_id;
                self.resolve_reply(id, serde_json::to_value(response))
            }
            MessageBody::GenerateProofResponse(response) => {
                let id = response.request_id;
                self.resolve_reply(id, serde_json::to_value(response))
            }
            MessageBody::OffscreenDocumentReady => {
                info!("offscreen document ready");
                ActionResult::ok()
            }
            MessageBody::UpdatePublicData(update) => {
                self.state.public_data = update.public_data;
                ActionResult::ok()
            }
            MessageBody::UpdateExpectManyClaims(update) => {
                self.set_expect_many_claims(update.expect_many).await;
                ActionResult::ok()
            }
            MessageBody::GetParameters => ActionResult::ok_with(json!(self.state.parameters)),
            MessageBody::ReportProviderError(report) => {
                self.fail_session(&report.error, None).await;
                ActionResult::ok()
            }
            MessageBody::ProviderDataReady(_)
            | MessageBody::ShowProviderVerificationPopup(_)
            | MessageBody::ClaimCreationRequested(_)
            | MessageBody::ClaimCreationSuccess(_)
            | MessageBody::ClaimCreationFailed(_)
            | MessageBody::ProofGenerationStarted(_)
            | MessageBody::ProofGenerationSuccess(_)
            | MessageBody::ProofGenerationFailed(_)
            | MessageBody::ProofSubmitted(_)
            | MessageBody::ProofSubmissionFailed(_)
            | MessageBody::GetPrivateKey(_)
            | MessageBody::GenerateProof(_) => {
                debug!(action, "not handled by background");
                ActionResult::failed(format!("{action} is not handled by the background"))
            }
        };
        let _ = reply.send(result);
    }

    fn resolve_reply(&self, id: u64, value: Result<serde_json::Value, serde_json::Error>) -> ActionResult {
        match value {
            Ok(value) => {
                if self.deps.pending.resolve(id, value) {
                    ActionResult::ok()
                } else {
                    ActionResult::failed(format!("no pending request {id}"))
                }
            }
            Err(err) => ActionResult::failed(err.to_string()),
        }
    }

    fn provider_data_for(&self, sender: &MessageSender) -> ActionResult {
        let managed = sender.tab_id.is_some_and(|tab| self.state.is_managed(tab));
        match (&self.state.provider_data, &self.state.session_id) {
            (Some(provider), Some(session_id)) if managed => {
                let payload = ProviderDataReady {
                    provider_data: provider.clone(),
                    session_id: session_id.clone(),
                    parameters: self.state.parameters.clone(),
                    callback_url: self.state.callback_url.clone(),
                };
                match serde_json::to_value(payload) {
                    Ok(value) => ActionResult::ok_with(value),
                    Err(err) => ActionResult::failed(err.to_string()),
                }
            }
            _ => ActionResult::failed("no provider data for this tab"),
        }
    }

    async fn set_expect_many_claims(&mut self, expect_many: bool) {
        let was = self.state.expect_many_claims;
        self.state.expect_many_claims = expect_many;
        debug!(expect_many, "expectManyClaims updated");
        if was && !expect_many && !self.queue.generated().is_empty() {
            self.submit_proofs().await;
        }
    }

    async fn on_watchdog(&mut self, generation: u64) {
        if !self.timer.accept_fire(generation) {
            debug!(generation, "stale watchdog fire ignored");
            return;
        }
        let secs = self.config.timeouts.session.as_secs();
        self.fail_session(&format!("Session timed out after {secs}s without progress"), None)
            .await;
    }

    /// Posts an event back to this actor.
    fn post(&self, event: Event) {
        if let Some(tx) = self.events.upgrade() {
            let _ = tx.send(event);
        }
    }

    /// A sender for spawned work to report back on.
    fn poster(&self) -> Option<mpsc::UnboundedSender<Event>> {
        self.events.upgrade()
    }

    async fn notify_tab(&self, tab: Option<TabId>, body: MessageBody) {
        let Some(tab) = tab else {
            return;
        };
        let action = body.action();
        if let Err(err) = self
            .deps
            .browser
            .send_to_tab(tab, Envelope::to_content(body))
            .await
        {
            warn!(tab_id = %tab, action, error = %err, "tab notification failed");
        }
    }

    /// Active tab, original tab and runtime listeners.
    async fn notify_all(&self, body: MessageBody) {
        let active = self.state.active_tab_id;
        let original = self.state.original_tab_id.filter(|tab| Some(*tab) != active);
        self.notify_tab(active, body.clone()).await;
        self.notify_tab(original, body.clone()).await;
        let action = body.action();
        if let Err(err) = self.deps.browser.broadcast(Envelope::to_content(body)).await {
            warn!(action, error = %err, "runtime broadcast failed");
        }
    }

    /// Best-effort remote status update; failures are logged.
    fn report_status(&self, status: SessionStatus) {
        let Some(session_id) = self.state.session_id.clone() else {
            return;
        };
        let backend = self.deps.backend.clone();
        tokio::spawn(async move {
            if let Err(err) = backend.update_session_status(&session_id, status).await {
                warn!(session_id = %session_id, ?status, error = %err, "session status update failed");
            }
        });
    }
}
