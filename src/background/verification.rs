//! Session lifecycle: start, provider data, tab tracking, failure,
//! cancellation and proof submission.

use tracing::{debug, error, info, warn};

use super::{Event, Orchestrator};
use crate::browser::{MessageSender, TabId};
use crate::error::OrchestratorError;
use crate::messages::{
    ActionResult, Envelope, FailureNotice, MessageBody, ProofsSubmitted, ProviderDataReady, SessionStatus,
    VerificationPopup,
};
use crate::proof::{format_proof, order_proofs, Proof};
use crate::provider::{ProviderData, TemplateData};
use crate::session::SessionPhase;

const CANCELLED_BY_USER: &str = "Cancelled by user";
const TAB_CLOSED_BY_USER: &str = "Verification tab was closed by user";

impl Orchestrator {
    /// Validates and claims the concurrency guard, then fetches provider data
    /// in the background. The reply is only an acknowledgement.
    pub(super) async fn start_verification(
        &mut self,
        template: TemplateData,
        sender: &MessageSender,
    ) -> ActionResult {
        if template.provider_id.is_empty() {
            return ActionResult::failed(OrchestratorError::MissingProviderId.to_string());
        }
        if template.session_id.is_empty() {
            return ActionResult::failed(OrchestratorError::MissingSessionId.to_string());
        }

        if let Some(active) = self.state.active_session_id.clone() {
            if active != template.session_id && !self.state.managed_tabs.is_empty() {
                warn!(
                    session_id = %template.session_id,
                    active_session_id = %active,
                    "rejecting concurrent verification"
                );
                return ActionResult::failed(OrchestratorError::VerificationInProgress.to_string());
            }
            debug!(stale_session_id = %active, "clearing stale session guard");
        }

        self.timer.clear_all();
        self.queue.reset();
        self.state.begin(&template, sender.tab_id);
        info!(
            session_id = %template.session_id,
            provider_id = %template.provider_id,
            "verification started"
        );
        self.report_status(SessionStatus::UserStartedVerification);

        let Some(events) = self.poster() else {
            return ActionResult::failed(OrchestratorError::Stopped.to_string());
        };
        let backend = self.deps.backend.clone();
        let session_id = template.session_id.clone();
        let provider_id = template.provider_id.clone();
        let version = template.provider_version.clone();
        tokio::spawn(async move {
            let result = backend
                .fetch_provider_data(&provider_id, version.as_deref())
                .await
                .map_err(|err| err.to_string());
            let _ = events.send(Event::ProviderFetched { session_id, result });
        });

        ActionResult::ok()
    }

    /// Opens the login tab and stages the popup and provider data for its
    /// content script.
    pub(super) async fn on_provider_fetched(
        &mut self,
        session_id: &str,
        result: Result<ProviderData, String>,
    ) {
        if !self.state.is_current(session_id) || self.state.aborted {
            debug!(session_id, "provider data for stale session dropped");
            return;
        }
        let provider = match result {
            Ok(provider) => provider,
            Err(err) => {
                let message = OrchestratorError::ProviderData(err).to_string();
                self.fail_session(&message, None).await;
                return;
            }
        };

        let tab = match self.deps.browser.create_tab(&provider.login_url).await {
            Ok(tab) => tab,
            Err(err) => {
                let message = OrchestratorError::TabOpen(err.to_string()).to_string();
                self.fail_session(&message, None).await;
                return;
            }
        };
        if !self.state.is_current(session_id) || self.state.aborted {
            return;
        }

        self.state.managed_tabs.insert(tab);
        self.state.active_tab_id = Some(tab);
        self.state.phase = SessionPhase::Filtering;

        let provider_name = provider
            .name
            .clone()
            .or_else(|| self.state.provider_id.clone())
            .unwrap_or_default();
        let popup = VerificationPopup {
            provider_name: provider_name.clone(),
            session_id: session_id.to_string(),
            description: format!("Log in to {provider_name} to generate your proof"),
        };
        let ready = ProviderDataReady {
            provider_data: provider.clone(),
            session_id: session_id.to_string(),
            parameters: self.state.parameters.clone(),
            callback_url: self.state.callback_url.clone(),
        };
        self.state.provider_data = Some(provider);
        self.state.stage_for_tab(
            tab,
            Envelope::to_content(MessageBody::ShowProviderVerificationPopup(popup)),
        );
        self.state.stage_for_tab(
            tab,
            Envelope::to_content(MessageBody::ProviderDataReady(ready)),
        );
        info!(session_id, tab_id = %tab, "verification tab opened");
    }

    /// Flushes messages staged for a tab whose content script just loaded.
    pub(super) async fn on_content_script_loaded(&mut self, sender: &MessageSender) -> ActionResult {
        let Some(tab) = sender.tab_id else {
            return ActionResult::ok();
        };
        if !self.state.is_managed(tab) {
            return ActionResult::ok();
        }
        for message in self.state.take_staged(tab) {
            let action = message.action();
            if let Err(err) = self.deps.browser.send_to_tab(tab, message).await {
                warn!(tab_id = %tab, action, error = %err, "staged message delivery failed");
            }
        }
        ActionResult::ok()
    }

    /// Terminal failure. Safe to call repeatedly; only the first call for a
    /// session has any effect.
    pub(super) async fn fail_session(&mut self, message: &str, request_hash: Option<String>) {
        if self.state.session_id.is_none() || self.state.aborted {
            debug!(reason = message, "failSession ignored, no live session");
            return;
        }

        self.timer.clear_all();
        self.state.aborted = true;
        self.state.phase = SessionPhase::Failed;
        error!(
            session_id = ?self.state.session_id,
            request_hash = ?request_hash,
            reason = message,
            "verification failed"
        );

        self.report_status(SessionStatus::ProofGenerationFailed);
        self.notify_all(MessageBody::ProofGenerationFailed(FailureNotice {
            error: message.to_string(),
            request_hash,
            session_id: self.state.session_id.clone(),
        }))
        .await;

        self.queue.clear();
        self.state.release_guard();
    }

    pub(super) async fn cancel_session(&mut self) {
        let tabs: Vec<TabId> = self.state.managed_tabs.iter().copied().collect();
        self.fail_session(CANCELLED_BY_USER, None).await;

        let browser = self.deps.browser.clone();
        let delay = self.config.tabs.close_after_cancel;
        if !tabs.is_empty() {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                for tab in tabs {
                    if let Err(err) = browser.remove_tab(tab).await {
                        debug!(tab_id = %tab, error = %err, "verification tab already gone");
                    }
                }
            });
        }

        self.queue.reset();
        self.state.reset();
        self.state.phase = SessionPhase::Failed;
    }

    pub(super) async fn on_tab_removed(&mut self, tab: TabId) {
        if !self.state.managed_tabs.remove(&tab) {
            return;
        }
        self.state.pending_tab_messages.remove(&tab);
        let was_active = self.state.active_tab_id == Some(tab);
        if was_active {
            self.state.active_tab_id = None;
        }
        debug!(tab_id = %tab, was_active, "managed tab removed");

        if (was_active || self.state.managed_tabs.is_empty()) && self.state.is_active() {
            self.fail_session(TAB_CLOSED_BY_USER, None).await;
        }
    }

    /// Submits once every required proof exists. No-op while
    /// `expectManyClaims` is set, when nothing was generated, or while a
    /// submission is already underway.
    pub(super) async fn submit_proofs(&mut self) {
        let Some(session_id) = self.state.session_id.clone() else {
            return;
        };
        if self.state.aborted || self.state.phase.is_terminal() || self.state.phase == SessionPhase::Completing {
            return;
        }
        if self.state.expect_many_claims {
            debug!(session_id = %session_id, "submission deferred, expecting more claims");
            return;
        }
        if self.queue.generated().is_empty() {
            return;
        }
        let required = self.state.required_hashes();
        let required: Vec<&str> = required.iter().map(String::as_str).collect();
        if !required.is_empty() && !self.queue.all_required_satisfied(&required) {
            debug!(
                session_id = %session_id,
                generated = self.queue.generated().len(),
                required = required.len(),
                "not all required proofs generated yet"
            );
            return;
        }

        self.state.phase = SessionPhase::Completing;
        self.timer.clear_all();

        let public_data = self.state.public_data.as_deref();
        let proofs: Vec<Proof> = order_proofs(&required, self.queue.generated())
            .into_iter()
            .map(|raw| format_proof(raw, &self.config.backend.attestor_url, public_data))
            .collect();

        match self.state.callback_url.clone() {
            Some(callback_url) => {
                let Some(events) = self.poster() else {
                    return;
                };
                let backend = self.deps.backend.clone();
                tokio::spawn(async move {
                    let result = backend
                        .submit_callback(&callback_url, &proofs)
                        .await
                        .map_err(|err| err.to_string());
                    let _ = events.send(Event::SubmissionFinished {
                        session_id,
                        proofs,
                        result,
                    });
                });
            }
            None => {
                self.report_status(SessionStatus::ProofSubmitted);
                self.finish_submission(proofs).await;
            }
        }
    }

    pub(super) async fn on_submission_finished(
        &mut self,
        session_id: &str,
        proofs: Vec<Proof>,
        result: Result<(), String>,
    ) {
        if !self.state.is_current(session_id) || self.state.aborted {
            debug!(session_id, "submission result for stale session dropped");
            return;
        }
        match result {
            Ok(()) => {
                self.report_status(SessionStatus::ProofSubmitted);
                self.finish_submission(proofs).await;
            }
            Err(err) => {
                let message = format!("Failed to submit proofs to callback: {err}");
                self.report_status(SessionStatus::ProofSubmissionFailed);
                let notice = FailureNotice {
                    error: message.clone(),
                    request_hash: None,
                    session_id: Some(session_id.to_string()),
                };
                self.notify_tab(self.state.active_tab_id, MessageBody::ProofSubmissionFailed(notice.clone()))
                    .await;
                self.notify_tab(
                    self.state.original_tab_id.filter(|tab| Some(*tab) != self.state.active_tab_id),
                    MessageBody::ProofSubmissionFailed(notice),
                )
                .await;
                self.fail_session(&message, None).await;
            }
        }
    }

    /// Shared success path: deliver, schedule tab cleanup, release the
    /// session.
    async fn finish_submission(&mut self, proofs: Vec<Proof>) {
        info!(
            session_id = ?self.state.session_id,
            proofs = proofs.len(),
            "proofs submitted"
        );
        let session_id = self.state.session_id.clone();
        self.notify_all(MessageBody::ProofSubmitted(ProofsSubmitted { proofs, session_id }))
            .await;

        let browser = self.deps.browser.clone();
        let delay = self.config.tabs.close_after_submit;
        let original = self.state.original_tab_id;
        let verification = self.state.active_tab_id;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(original) = original {
                if let Err(err) = browser.focus_tab(original).await {
                    debug!(tab_id = %original, error = %err, "original tab not refocused");
                }
            }
            if let Some(tab) = verification {
                if let Err(err) = browser.remove_tab(tab).await {
                    debug!(tab_id = %tab, error = %err, "verification tab already gone");
                }
            }
        });

        self.timer.clear_all();
        self.queue.reset();
        self.state.reset();
        self.state.phase = SessionPhase::Submitted;
    }

    pub(super) fn schedule_submit(&self) {
        if let Some(session_id) = self.state.session_id.clone() {
            self.post(Event::SubmitRequested { session_id });
        }
    }
}
