//! Verification session state owned by the background orchestrator.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::browser::TabId;
use crate::messages::Envelope;
use crate::provider::{ProviderData, RequestTemplate, TemplateData};
use crate::queue::ProofQueue;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    #[default]
    Idle,
    AwaitingProviderData,
    Filtering,
    ClaimsQueued,
    Completing,
    Submitted,
    Failed,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Submitted | SessionPhase::Failed)
    }
}

#[derive(Debug, Default)]
pub struct SessionState {
    pub session_id: Option<String>,
    pub provider_id: Option<String>,
    pub application_id: Option<String>,
    pub callback_url: Option<String>,
    pub redirect_url: Option<String>,
    pub context: Option<String>,
    pub parameters: BTreeMap<String, String>,
    pub public_data: Option<String>,
    pub expect_many_claims: bool,
    pub aborted: bool,
    /// Concurrency guard: set while a session holds the orchestrator.
    pub active_session_id: Option<String>,
    pub phase: SessionPhase,
    pub provider_data: Option<ProviderData>,
    pub managed_tabs: BTreeSet<TabId>,
    pub active_tab_id: Option<TabId>,
    pub original_tab_id: Option<TabId>,
    pub provider_requests_by_hash: BTreeMap<String, RequestTemplate>,
    pub first_request_received: bool,
    /// Messages waiting for a tab's content script to announce itself.
    pub pending_tab_messages: BTreeMap<TabId, Vec<Envelope>>,
}

impl SessionState {
    /// Starts a fresh session from a START payload. Managed tabs from a
    /// previous session are dropped.
    pub fn begin(&mut self, template: &TemplateData, original_tab: Option<TabId>) {
        *self = Self {
            session_id: Some(template.session_id.clone()),
            provider_id: Some(template.provider_id.clone()),
            application_id: Some(template.application_id.clone()).filter(|id| !id.is_empty()),
            callback_url: template.callback_url.clone().filter(|url| !url.is_empty()),
            redirect_url: template.redirect_url.clone().filter(|url| !url.is_empty()),
            context: template.context.clone(),
            parameters: template.parameters.clone(),
            active_session_id: Some(template.session_id.clone()),
            phase: SessionPhase::AwaitingProviderData,
            original_tab_id: original_tab,
            ..Self::default()
        };
    }

    /// Clears every session field.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_current(&self, session_id: &str) -> bool {
        self.session_id.as_deref() == Some(session_id)
    }

    /// A session holds the guard and has not been aborted.
    pub fn is_active(&self) -> bool {
        self.active_session_id.is_some() && !self.aborted
    }

    pub fn release_guard(&mut self) {
        self.active_session_id = None;
    }

    pub fn is_managed(&self, tab: TabId) -> bool {
        self.managed_tabs.contains(&tab)
    }

    /// Required template hashes in provider order; empty in manual mode or
    /// before provider data arrives.
    pub fn required_hashes(&self) -> Vec<String> {
        self.provider_data
            .as_ref()
            .map(|provider| {
                provider
                    .required_hashes()
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn stage_for_tab(&mut self, tab: TabId, message: Envelope) {
        self.pending_tab_messages.entry(tab).or_default().push(message);
    }

    pub fn take_staged(&mut self, tab: TabId) -> Vec<Envelope> {
        self.pending_tab_messages.remove(&tab).unwrap_or_default()
    }

    pub fn snapshot(&self, queue: &ProofQueue) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            provider_id: self.provider_id.clone(),
            phase: self.phase,
            aborted: self.aborted,
            guard_held: self.active_session_id.is_some(),
            expect_many_claims: self.expect_many_claims,
            public_data: self.public_data.clone(),
            managed_tabs: self.managed_tabs.iter().copied().collect(),
            active_tab_id: self.active_tab_id,
            original_tab_id: self.original_tab_id,
            required_hashes: self.required_hashes(),
            generated_hashes: queue.generated().hashes().map(str::to_string).collect(),
            queued: queue.len(),
            in_flight: queue.in_flight().map(str::to_string),
        }
    }
}

/// Read-only view of the orchestrator for callers and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub provider_id: Option<String>,
    pub phase: SessionPhase,
    pub aborted: bool,
    pub guard_held: bool,
    pub expect_many_claims: bool,
    pub public_data: Option<String>,
    pub managed_tabs: Vec<TabId>,
    pub active_tab_id: Option<TabId>,
    pub original_tab_id: Option<TabId>,
    pub required_hashes: Vec<String>,
    pub generated_hashes: Vec<String>,
    pub queued: usize,
    pub in_flight: Option<String>,
}
