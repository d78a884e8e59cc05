//! Recording fakes for the collaborator traits.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::background::OrchestratorHandle;
use crate::backend::{BackendApi, InitSessionRequest, InitSessionResponse};
use crate::bridge::{PageEnvelope, PageMessage};
use crate::browser::{BrowserApi, MessageSender, TabId};
use crate::claim::Claim;
use crate::content::{BackgroundPort, ContentHandle, PagePort};
use crate::cookies::{BrowserCookie, CookieQuery, CookieStore};
use crate::error::{BackendError, BrowserError, ContentError, CookieError, RpcError, SdkError};
use crate::messages::{ActionResult, Envelope, FilteredRequest, MessageBody, SessionStatus};
use crate::offscreen::OffscreenClient;
use crate::proof::{sample_proof, AttestorProof, Proof};
use crate::provider::ProviderData;
use crate::sdk::ExtensionBridge;

#[derive(Default)]
struct BrowserLog {
    next_tab: u32,
    created: Vec<(TabId, String)>,
    removed: Vec<TabId>,
    focused: Vec<TabId>,
    sent: Vec<(TabId, Envelope)>,
    broadcasts: Vec<Envelope>,
}

/// Browser host that records every call. Tabs are numbered from 100.
/// Messages to a tab with an attached content script are delivered to it.
#[derive(Default)]
pub struct RecordingBrowser {
    log: Mutex<BrowserLog>,
    fail_tab_creation: Mutex<bool>,
    routes: Mutex<HashMap<TabId, ContentHandle>>,
}

impl RecordingBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, tab: TabId, content: ContentHandle) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(tab, content);
        }
    }

    pub fn fail_tab_creation(&self) {
        if let Ok(mut flag) = self.fail_tab_creation.lock() {
            *flag = true;
        }
    }

    pub fn created(&self) -> Vec<(TabId, String)> {
        self.log.lock().map(|log| log.created.clone()).unwrap_or_default()
    }

    pub fn removed(&self) -> Vec<TabId> {
        self.log.lock().map(|log| log.removed.clone()).unwrap_or_default()
    }

    pub fn focused(&self) -> Vec<TabId> {
        self.log.lock().map(|log| log.focused.clone()).unwrap_or_default()
    }

    pub fn sent_to(&self, tab: TabId) -> Vec<MessageBody> {
        self.log
            .lock()
            .map(|log| {
                log.sent
                    .iter()
                    .filter(|(to, _)| *to == tab)
                    .map(|(_, envelope)| envelope.body.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn actions_to(&self, tab: TabId) -> Vec<&'static str> {
        self.sent_to(tab).iter().map(MessageBody::action).collect()
    }

    pub fn broadcasts(&self) -> Vec<MessageBody> {
        self.log
            .lock()
            .map(|log| log.broadcasts.iter().map(|e| e.body.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BrowserApi for RecordingBrowser {
    async fn create_tab(&self, url: &str) -> Result<TabId, BrowserError> {
        if self.fail_tab_creation.lock().map(|flag| *flag).unwrap_or(false) {
            return Err(BrowserError::TabCreation {
                url: url.to_string(),
                reason: "blocked".into(),
            });
        }
        let mut log = self
            .log
            .lock()
            .map_err(|_| BrowserError::Delivery("log poisoned".into()))?;
        let tab = TabId(100 + log.next_tab);
        log.next_tab += 1;
        log.created.push((tab, url.to_string()));
        Ok(tab)
    }

    async fn remove_tab(&self, tab: TabId) -> Result<(), BrowserError> {
        if let Ok(mut log) = self.log.lock() {
            log.removed.push(tab);
        }
        Ok(())
    }

    async fn focus_tab(&self, tab: TabId) -> Result<(), BrowserError> {
        if let Ok(mut log) = self.log.lock() {
            log.focused.push(tab);
        }
        Ok(())
    }

    async fn send_to_tab(&self, tab: TabId, message: Envelope) -> Result<(), BrowserError> {
        let route = self.routes.lock().ok().and_then(|routes| routes.get(&tab).cloned());
        if let Some(content) = route {
            content.on_background_message(message.clone());
        }
        if let Ok(mut log) = self.log.lock() {
            log.sent.push((tab, message));
        }
        Ok(())
    }

    async fn broadcast(&self, message: Envelope) -> Result<(), BrowserError> {
        if let Ok(mut log) = self.log.lock() {
            log.broadcasts.push(message);
        }
        Ok(())
    }
}

#[derive(Default)]
struct BackendLog {
    statuses: Vec<(String, SessionStatus)>,
    callbacks: Vec<(String, Vec<Proof>)>,
    inits: Vec<InitSessionRequest>,
    provider_fetches: Vec<String>,
}

/// Backend returning a fixed provider descriptor.
pub struct RecordingBackend {
    provider: Mutex<Option<ProviderData>>,
    fail_callback: Mutex<bool>,
    provider_delay: Mutex<Duration>,
    callback_delay: Mutex<Duration>,
    geo: String,
    log: Mutex<BackendLog>,
}

impl RecordingBackend {
    pub fn new(provider: Option<ProviderData>) -> Self {
        Self {
            provider: Mutex::new(provider),
            fail_callback: Mutex::new(false),
            provider_delay: Mutex::new(Duration::ZERO),
            callback_delay: Mutex::new(Duration::ZERO),
            geo: "US".to_string(),
            log: Mutex::new(BackendLog::default()),
        }
    }

    pub fn fail_callback(&self) {
        if let Ok(mut flag) = self.fail_callback.lock() {
            *flag = true;
        }
    }

    /// Holds every provider fetch for `delay` before answering.
    pub fn delay_provider(&self, delay: Duration) {
        if let Ok(mut slot) = self.provider_delay.lock() {
            *slot = delay;
        }
    }

    /// Holds every callback submission for `delay` before answering.
    pub fn delay_callback(&self, delay: Duration) {
        if let Ok(mut slot) = self.callback_delay.lock() {
            *slot = delay;
        }
    }

    pub fn statuses(&self) -> Vec<SessionStatus> {
        self.log
            .lock()
            .map(|log| log.statuses.iter().map(|(_, s)| *s).collect())
            .unwrap_or_default()
    }

    pub fn status_count(&self, status: SessionStatus) -> usize {
        self.statuses().into_iter().filter(|s| *s == status).count()
    }

    pub fn callbacks(&self) -> Vec<(String, Vec<Proof>)> {
        self.log.lock().map(|log| log.callbacks.clone()).unwrap_or_default()
    }

    pub fn inits(&self) -> Vec<InitSessionRequest> {
        self.log.lock().map(|log| log.inits.clone()).unwrap_or_default()
    }

    pub fn provider_fetches(&self) -> Vec<String> {
        self.log
            .lock()
            .map(|log| log.provider_fetches.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BackendApi for RecordingBackend {
    async fn fetch_provider_data(
        &self,
        provider_id: &str,
        _version: Option<&str>,
    ) -> Result<ProviderData, BackendError> {
        if let Ok(mut log) = self.log.lock() {
            log.provider_fetches.push(provider_id.to_string());
        }
        let delay = self.provider_delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.provider
            .lock()
            .ok()
            .and_then(|provider| provider.clone())
            .ok_or_else(|| BackendError::EmptyProvider(provider_id.to_string()))
    }

    async fn init_session(
        &self,
        request: &InitSessionRequest,
    ) -> Result<InitSessionResponse, BackendError> {
        if let Ok(mut log) = self.log.lock() {
            log.inits.push(request.clone());
        }
        Ok(InitSessionResponse {
            session_id: "session-1".into(),
            resolved_provider_version: Some("1.0.0".into()),
        })
    }

    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), BackendError> {
        if let Ok(mut log) = self.log.lock() {
            log.statuses.push((session_id.to_string(), status));
        }
        Ok(())
    }

    async fn submit_callback(&self, callback_url: &str, proofs: &[Proof]) -> Result<(), BackendError> {
        let delay = self.callback_delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_callback.lock().map(|flag| *flag).unwrap_or(false) {
            return Err(BackendError::Status {
                endpoint: callback_url.to_string(),
                status: 500,
            });
        }
        if let Ok(mut log) = self.log.lock() {
            log.callbacks.push((callback_url.to_string(), proofs.to_vec()));
        }
        Ok(())
    }

    async fn lookup_geo_location(&self) -> Result<String, BackendError> {
        Ok(self.geo.clone())
    }
}

#[derive(Default)]
pub struct StaticCookies {
    pub cookies: Vec<BrowserCookie>,
}

#[async_trait]
impl CookieStore for StaticCookies {
    async fn get_all(&self, query: CookieQuery) -> Result<Vec<BrowserCookie>, CookieError> {
        if query.url.is_some() {
            return Ok(self.cookies.clone());
        }
        Ok(Vec::new())
    }
}

/// One attestation call as observed by [`FakeOffscreen`].
#[derive(Debug, Clone)]
pub struct AttestationCall {
    pub url: String,
    pub public_data: Option<String>,
    pub started: Instant,
    pub finished: Instant,
}

/// Attestation context that takes `latency` per proof and fails for urls
/// registered with [`FakeOffscreen::fail_url`].
pub struct FakeOffscreen {
    latency: Duration,
    failing_urls: Mutex<HashSet<String>>,
    calls: Mutex<Vec<AttestationCall>>,
    key_requests: Mutex<Vec<String>>,
}

impl FakeOffscreen {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            failing_urls: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            key_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_url(&self, url: &str) {
        if let Ok(mut urls) = self.failing_urls.lock() {
            urls.insert(url.to_string());
        }
    }

    pub fn calls(&self) -> Vec<AttestationCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn key_requests(&self) -> Vec<String> {
        self.key_requests.lock().map(|k| k.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl OffscreenClient for FakeOffscreen {
    async fn get_private_key(&self, session_id: &str) -> Result<String, RpcError> {
        if let Ok(mut requests) = self.key_requests.lock() {
            requests.push(session_id.to_string());
        }
        Ok(format!("0x{}", "ab".repeat(32)))
    }

    async fn generate_proof(
        &self,
        claim: Claim,
        public_data: Option<String>,
    ) -> Result<AttestorProof, RpcError> {
        let started = Instant::now();
        tokio::time::sleep(self.latency).await;
        let url = claim.params.url.clone();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(AttestationCall {
                url: url.clone(),
                public_data,
                started,
                finished: Instant::now(),
            });
        }
        let failing = self
            .failing_urls
            .lock()
            .map(|urls| urls.contains(&url))
            .unwrap_or(false);
        if failing {
            return Err(RpcError::Remote {
                label: "generate proof",
                reason: "attestor rejected claim".into(),
            });
        }
        Ok(sample_proof(&format!("proof:{url}")))
    }
}

/// Background as seen from a content script.
pub struct RecordingBackgroundPort {
    managed: bool,
    received: Mutex<Vec<MessageBody>>,
}

impl RecordingBackgroundPort {
    pub fn new(managed: bool) -> Self {
        Self {
            managed,
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn actions(&self) -> Vec<&'static str> {
        self.received
            .lock()
            .map(|received| received.iter().map(MessageBody::action).collect())
            .unwrap_or_default()
    }

    pub fn filtered_requests(&self) -> Vec<FilteredRequest> {
        self.received
            .lock()
            .map(|received| {
                received
                    .iter()
                    .filter_map(|body| match body {
                        MessageBody::FilteredRequestFound(request) => Some(request.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl BackgroundPort for RecordingBackgroundPort {
    async fn send(&self, body: MessageBody) -> Result<ActionResult, ContentError> {
        let result = match &body {
            MessageBody::CheckIfManagedTab => ActionResult::ok_with(json!({ "isManaged": self.managed })),
            MessageBody::GetParameters => ActionResult::ok_with(json!({ "user": "alice" })),
            _ => ActionResult::ok(),
        };
        if let Ok(mut received) = self.received.lock() {
            received.push(body);
        }
        Ok(result)
    }
}

/// A content script's runtime port wired straight to the orchestrator.
pub struct TabPort {
    handle: OrchestratorHandle,
    tab: TabId,
}

impl TabPort {
    pub fn new(handle: OrchestratorHandle, tab: TabId) -> Arc<Self> {
        Arc::new(Self { handle, tab })
    }
}

#[async_trait]
impl BackgroundPort for TabPort {
    async fn send(&self, body: MessageBody) -> Result<ActionResult, ContentError> {
        Ok(self
            .handle
            .dispatch(Envelope::to_background(body), MessageSender::tab(self.tab))
            .await)
    }
}

#[derive(Default)]
pub struct RecordingPage {
    posted: Mutex<Vec<PageEnvelope>>,
}

impl RecordingPage {
    pub fn messages(&self) -> Vec<PageMessage> {
        self.posted
            .lock()
            .map(|posted| posted.iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PagePort for RecordingPage {
    async fn post(&self, envelope: PageEnvelope) -> Result<(), ContentError> {
        if let Ok(mut posted) = self.posted.lock() {
            posted.push(envelope);
        }
        Ok(())
    }
}

type Responder = Box<dyn Fn(&PageEnvelope) -> Vec<PageMessage> + Send + Sync>;

/// Page-side bridge whose extension replies are computed by a closure.
pub struct ScriptedBridge {
    posted: Mutex<Vec<PageEnvelope>>,
    replies: broadcast::Sender<PageEnvelope>,
    responder: Responder,
}

impl ScriptedBridge {
    pub fn new(responder: impl Fn(&PageEnvelope) -> Vec<PageMessage> + Send + Sync + 'static) -> Arc<Self> {
        let (replies, _) = broadcast::channel(64);
        Arc::new(Self {
            posted: Mutex::new(Vec::new()),
            replies,
            responder: Box::new(responder),
        })
    }

    pub fn posted(&self) -> Vec<PageEnvelope> {
        self.posted.lock().map(|posted| posted.clone()).unwrap_or_default()
    }

    /// Delivers an unsolicited extension message to every subscriber.
    pub fn emit(&self, message: PageMessage) {
        let _ = self.replies.send(PageEnvelope::anonymous(message));
    }
}

#[async_trait]
impl ExtensionBridge for ScriptedBridge {
    async fn post(&self, envelope: PageEnvelope) -> Result<(), SdkError> {
        let replies = (self.responder)(&envelope);
        if let Ok(mut posted) = self.posted.lock() {
            posted.push(envelope);
        }
        for reply in replies {
            let _ = self.replies.send(PageEnvelope::anonymous(reply));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PageEnvelope> {
        self.replies.subscribe()
    }
}

/// Provider with one exact-url template per entry of `urls`, hashed `h1`,
/// `h2`, ...
pub fn provider_with(urls: &[&str]) -> ProviderData {
    let request_data: Vec<_> = urls
        .iter()
        .enumerate()
        .map(|(i, url)| {
            json!({
                "url": url,
                "method": "GET",
                "urlType": "EXACT",
                "requestHash": format!("h{}", i + 1)
            })
        })
        .collect();
    let mut provider: ProviderData = serde_json::from_value(json!({
        "name": "Example",
        "loginUrl": "https://example.com/login",
        "requestData": request_data
    }))
    .expect("provider fixture");
    provider.http_provider_id = Some("p1".into());
    provider
}

pub fn parameters(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
