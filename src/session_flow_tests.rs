//! Session-level behaviour of the background orchestrator, driven through
//! its handle with recording collaborators and a paused clock.

use std::sync::Arc;
use std::time::Duration;

use crate::background::{Dependencies, Orchestrator, OrchestratorHandle};
use crate::bridge::{PageEnvelope, PageMessage, VerificationCompleted, VerificationStarted};
use crate::browser::{MessageSender, TabId};
use crate::config::{FilterPolicy, OrchestratorConfig};
use crate::content::{epoch_millis, ContentScript};
use crate::messages::{
    Envelope, ExpectManyClaimsUpdate, FailureNotice, FilteredRequest, ManualClaimRequest, MessageBody,
    PrivateKeyResponse, PublicDataUpdate, SessionStatus,
};
use crate::provider::{
    CapturedRequest, CapturedResponse, InterceptedRequestResponse, ProviderData, TemplateData,
};
use crate::rpc::PendingReplies;
use crate::session::SessionPhase;
use crate::test_support::{
    provider_with, FakeOffscreen, RecordingBackend, RecordingBrowser, RecordingPage, StaticCookies,
    TabPort,
};

const ORIGINAL_TAB: TabId = TabId(1);
const VERIFICATION_TAB: TabId = TabId(100);
const CALLBACK: &str = "https://dev.example/callback";

struct Harness {
    handle: OrchestratorHandle,
    browser: Arc<RecordingBrowser>,
    backend: Arc<RecordingBackend>,
    offscreen: Arc<FakeOffscreen>,
    pending: PendingReplies,
    provider: Option<ProviderData>,
}

fn harness(provider: Option<ProviderData>, latency: Duration) -> Harness {
    let browser = Arc::new(RecordingBrowser::new());
    let backend = Arc::new(RecordingBackend::new(provider.clone()));
    let offscreen = Arc::new(FakeOffscreen::new(latency));
    let pending = PendingReplies::new();
    let handle = Orchestrator::spawn(
        OrchestratorConfig::default(),
        Dependencies {
            browser: browser.clone(),
            backend: backend.clone(),
            cookies: Arc::new(StaticCookies::default()),
            offscreen: offscreen.clone(),
            pending: pending.clone(),
        },
    );
    Harness {
        handle,
        browser,
        backend,
        offscreen,
        pending,
        provider,
    }
}

fn start_payload(session_id: &str, callback: Option<&str>) -> TemplateData {
    TemplateData {
        session_id: session_id.into(),
        provider_id: "p1".into(),
        application_id: "app".into(),
        callback_url: callback.map(str::to_string),
        ..Default::default()
    }
}

impl Harness {
    async fn start(&self, session_id: &str, callback: Option<&str>) {
        let result = self
            .handle
            .start_verification(start_payload(session_id, callback), MessageSender::tab(ORIGINAL_TAB))
            .await;
        assert!(result.success, "start failed: {:?}", result.error);
        settle().await;
    }

    fn matched(&self, index: usize, session_id: &str) -> FilteredRequest {
        let provider = self.provider.as_ref().expect("harness has a provider");
        let criteria = provider.request_data[index].clone();
        FilteredRequest {
            request: CapturedRequest {
                url: criteria.url.clone(),
                method: "GET".into(),
                ..Default::default()
            },
            response: Some(CapturedResponse {
                status: 200,
                body: "{}".into(),
                ..Default::default()
            }),
            criteria,
            session_id: session_id.into(),
            login_url: provider.login_url.clone(),
        }
    }

    async fn process(&self, index: usize) {
        let result = self
            .handle
            .process_filtered_request(self.matched(index, "s1"), MessageSender::tab(VERIFICATION_TAB))
            .await;
        assert!(result.success, "claim failed: {:?}", result.error);
    }

    async fn send(&self, body: MessageBody) {
        let result = self
            .handle
            .dispatch(Envelope::to_background(body), MessageSender::tab(VERIFICATION_TAB))
            .await;
        assert!(result.success, "dispatch failed: {:?}", result.error);
    }

    fn failures_to(&self, tab: TabId) -> Vec<FailureNotice> {
        self.browser
            .sent_to(tab)
            .into_iter()
            .filter_map(|body| match body {
                MessageBody::ProofGenerationFailed(notice) => Some(notice),
                _ => None,
            })
            .collect()
    }
}

/// Lets spawned work run and the paused clock creep forward.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn wait(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_verification_reaches_the_page() {
    let h = harness(
        Some(provider_with(&["https://example.com/api/me"])),
        Duration::from_secs(2),
    );
    let original_page = Arc::new(RecordingPage::default());
    let original = ContentScript::spawn(
        FilterPolicy::default(),
        "ext-live",
        TabPort::new(h.handle.clone(), ORIGINAL_TAB),
        original_page.clone(),
    );
    h.browser.attach(ORIGINAL_TAB, original.clone());

    original.on_page_message(PageEnvelope::to_extension(
        "ext-live",
        PageMessage::StartVerification(start_payload("s1", Some(CALLBACK))),
    ));
    settle().await;

    assert_eq!(
        h.browser.created(),
        vec![(VERIFICATION_TAB, "https://example.com/login".to_string())]
    );
    assert!(original_page
        .messages()
        .contains(&PageMessage::VerificationStarted(VerificationStarted {
            session_id: "s1".into()
        })));

    let provider_page = Arc::new(RecordingPage::default());
    let verification = ContentScript::spawn(
        FilterPolicy::default(),
        "ext-live",
        TabPort::new(h.handle.clone(), VERIFICATION_TAB),
        provider_page.clone(),
    );
    h.browser.attach(VERIFICATION_TAB, verification.clone());
    verification.on_page_message(PageEnvelope::to_extension(
        "ext-live",
        PageMessage::SetPublicData(PublicDataUpdate {
            public_data: Some("pd".into()),
        }),
    ));
    verification.on_page_message(PageEnvelope::anonymous(PageMessage::InterceptedNetworkData(
        InterceptedRequestResponse {
            request: CapturedRequest {
                url: "https://example.com/api/me".into(),
                method: "GET".into(),
                ..Default::default()
            },
            response: CapturedResponse {
                status: 200,
                body: r#"{"user":"alice"}"#.into(),
                ..Default::default()
            },
            timestamp: epoch_millis(),
        },
    )));

    wait(10).await;

    let callbacks = h.backend.callbacks();
    assert_eq!(callbacks.len(), 1);
    assert_eq!(callbacks[0].0, CALLBACK);
    assert_eq!(callbacks[0].1.len(), 1);
    assert_eq!(callbacks[0].1[0].public_data.as_deref(), Some("pd"));

    let completed: Vec<_> = original_page
        .messages()
        .into_iter()
        .filter_map(|message| match message {
            PageMessage::VerificationCompleted(VerificationCompleted { proofs, session_id }) => {
                assert_eq!(session_id.as_deref(), Some("s1"));
                Some(proofs)
            }
            _ => None,
        })
        .collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0][0].public_data.as_deref(), Some("pd"));
    assert!(provider_page
        .messages()
        .iter()
        .any(|message| matches!(message, PageMessage::VerificationCompleted(_))));

    assert_eq!(h.offscreen.calls()[0].public_data.as_deref(), Some("pd"));
    assert_eq!(h.browser.focused(), vec![ORIGINAL_TAB]);
    assert_eq!(h.browser.removed(), vec![VERIFICATION_TAB]);
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, SessionPhase::Submitted);
    assert!(!snapshot.guard_held);
}

#[tokio::test(start_paused = true)]
async fn test_second_session_rejected_while_first_has_tabs() {
    let h = harness(Some(provider_with(&["https://example.com/a"])), Duration::ZERO);
    h.start("s1", None).await;

    let result = h
        .handle
        .start_verification(start_payload("s2", None), MessageSender::tab(ORIGINAL_TAB))
        .await;

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Another verification is in progress"));
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.session_id.as_deref(), Some("s1"));
    assert_eq!(snapshot.managed_tabs, vec![VERIFICATION_TAB]);
}

#[tokio::test(start_paused = true)]
async fn test_stale_guard_without_tabs_is_replaced() {
    let h = harness(Some(provider_with(&["https://example.com/a"])), Duration::ZERO);
    h.backend.delay_provider(Duration::from_secs(1));

    let first = h
        .handle
        .start_verification(start_payload("s1", None), MessageSender::tab(ORIGINAL_TAB))
        .await;
    settle().await;
    let snapshot = h.handle.snapshot().await.unwrap();
    assert!(snapshot.guard_held);
    assert!(snapshot.managed_tabs.is_empty());

    let second = h
        .handle
        .start_verification(start_payload("s2", None), MessageSender::tab(ORIGINAL_TAB))
        .await;
    wait(3).await;

    assert!(first.success);
    assert!(second.success, "replacement failed: {:?}", second.error);
    assert_eq!(h.backend.provider_fetches().len(), 2);
    assert_eq!(h.browser.created().len(), 1);
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.session_id.as_deref(), Some("s2"));
    assert_eq!(snapshot.managed_tabs, vec![VERIFICATION_TAB]);
    assert_eq!(snapshot.phase, SessionPhase::Filtering);
}

#[tokio::test(start_paused = true)]
async fn test_start_requires_provider_and_session_ids() {
    let h = harness(None, Duration::ZERO);

    let mut payload = start_payload("s1", None);
    payload.provider_id.clear();
    let result = h
        .handle
        .start_verification(payload, MessageSender::tab(ORIGINAL_TAB))
        .await;
    assert_eq!(result.error.as_deref(), Some("Provider ID is required"));

    let result = h
        .handle
        .start_verification(start_payload("", None), MessageSender::tab(ORIGINAL_TAB))
        .await;
    assert_eq!(result.error.as_deref(), Some("Session ID is required"));
    assert!(h.backend.provider_fetches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_attestation_calls_never_overlap() {
    let h = harness(
        Some(provider_with(&[
            "https://example.com/a",
            "https://example.com/b",
            "https://example.com/c",
        ])),
        Duration::from_secs(3),
    );
    h.start("s1", None).await;

    tokio::join!(h.process(0), h.process(1), h.process(2));
    wait(15).await;

    let mut calls = h.offscreen.calls();
    assert_eq!(calls.len(), 3);
    calls.sort_by_key(|call| call.started);
    for pair in calls.windows(2) {
        assert!(pair[1].started >= pair[0].finished, "attestations overlapped");
    }
    assert_eq!(h.backend.status_count(SessionStatus::ProofGenerationStarted), 3);
    assert_eq!(h.backend.status_count(SessionStatus::ProofSubmitted), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fail_session_twice_has_one_set_of_effects() {
    let h = harness(Some(provider_with(&["https://example.com/a"])), Duration::ZERO);
    h.start("s1", None).await;

    h.handle.fail_session("boom", Some("h1".into())).await;
    h.handle.fail_session("boom again", None).await;
    settle().await;

    assert_eq!(h.backend.status_count(SessionStatus::ProofGenerationFailed), 1);
    let failures = h.failures_to(VERIFICATION_TAB);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].error, "boom");
    assert_eq!(failures[0].request_hash.as_deref(), Some("h1"));
    assert_eq!(h.failures_to(ORIGINAL_TAB).len(), 1);
    let broadcast_failures = h
        .browser
        .broadcasts()
        .into_iter()
        .filter(|body| matches!(body, MessageBody::ProofGenerationFailed(_)))
        .count();
    assert_eq!(broadcast_failures, 1);

    let snapshot = h.handle.snapshot().await.unwrap();
    assert!(snapshot.aborted);
    assert!(!snapshot.guard_held);
    assert_eq!(snapshot.phase, SessionPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_submission_waits_for_every_required_proof() {
    let h = harness(
        Some(provider_with(&[
            "https://example.com/a",
            "https://example.com/b",
            "https://example.com/c",
        ])),
        Duration::from_secs(1),
    );
    h.start("s1", Some(CALLBACK)).await;

    h.process(2).await;
    h.process(0).await;
    wait(3).await;
    h.handle.submit_proofs().await;
    settle().await;

    assert!(h.backend.callbacks().is_empty());
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.generated_hashes.len(), 2);
    assert_eq!(snapshot.phase, SessionPhase::Filtering);

    h.process(1).await;
    wait(3).await;

    let callbacks = h.backend.callbacks();
    assert_eq!(callbacks.len(), 1);
    let order: Vec<_> = callbacks[0]
        .1
        .iter()
        .map(|proof| proof.identifier.as_str())
        .collect();
    assert_eq!(
        order,
        vec![
            "proof:https://example.com/a",
            "proof:https://example.com/b",
            "proof:https://example.com/c"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_expect_many_claims_holds_submission_until_released() {
    let h = harness(
        Some(provider_with(&["https://example.com/a"])),
        Duration::from_secs(1),
    );
    h.start("s1", Some(CALLBACK)).await;
    h.send(MessageBody::UpdateExpectManyClaims(ExpectManyClaimsUpdate { expect_many: true }))
        .await;

    h.process(0).await;
    wait(5).await;

    assert!(h.backend.callbacks().is_empty());
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.generated_hashes, vec!["h1".to_string()]);
    assert!(snapshot.expect_many_claims);

    h.send(MessageBody::UpdateExpectManyClaims(ExpectManyClaimsUpdate { expect_many: false }))
        .await;
    settle().await;

    assert_eq!(h.backend.callbacks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_queue_stops_dequeuing() {
    let h = harness(
        Some(provider_with(&[
            "https://example.com/a",
            "https://example.com/b",
            "https://example.com/c",
        ])),
        Duration::from_secs(5),
    );
    h.start("s1", Some(CALLBACK)).await;
    tokio::join!(h.process(0), h.process(1), h.process(2));
    wait(1).await;

    let result = h.handle.cancel_session().await;
    assert!(result.success);
    wait(20).await;

    assert_eq!(h.offscreen.calls().len(), 1);
    assert!(h.backend.callbacks().is_empty());

    let active = h.failures_to(VERIFICATION_TAB);
    let original = h.failures_to(ORIGINAL_TAB);
    assert_eq!(active.len(), 1);
    assert_eq!(original.len(), 1);
    assert_eq!(active[0].error, "Cancelled by user");
    assert_eq!(original[0].error, "Cancelled by user");
    assert_eq!(h.browser.removed(), vec![VERIFICATION_TAB]);

    let snapshot = h.handle.snapshot().await.unwrap();
    assert!(snapshot.session_id.is_none());
    assert!(snapshot.generated_hashes.is_empty());
    assert_eq!(snapshot.phase, SessionPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_fails_idle_session() {
    let h = harness(
        Some(provider_with(&["https://example.com/a", "https://example.com/b"])),
        Duration::from_secs(1),
    );
    h.start("s1", None).await;
    h.process(0).await;

    wait(20).await;
    assert!(h.failures_to(VERIFICATION_TAB).is_empty());

    wait(15).await;
    let failures = h.failures_to(VERIFICATION_TAB);
    assert_eq!(failures.len(), 1);
    assert!(failures[0].error.contains("timed out"));
    assert_eq!(h.backend.status_count(SessionStatus::ProofGenerationFailed), 1);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_does_not_fire_during_slow_attestation() {
    let h = harness(
        Some(provider_with(&["https://example.com/a"])),
        Duration::from_secs(45),
    );
    h.start("s1", None).await;
    h.process(0).await;

    wait(50).await;

    assert!(h.failures_to(VERIFICATION_TAB).is_empty());
    assert_eq!(h.backend.status_count(SessionStatus::ProofSubmitted), 1);
}

#[tokio::test(start_paused = true)]
async fn test_closing_verification_tab_fails_session() {
    let h = harness(Some(provider_with(&["https://example.com/a"])), Duration::ZERO);
    h.start("s1", None).await;

    h.handle.tab_removed(TabId(555));
    settle().await;
    assert!(h.failures_to(ORIGINAL_TAB).is_empty());

    h.handle.tab_removed(VERIFICATION_TAB);
    settle().await;

    let failures = h.failures_to(ORIGINAL_TAB);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].error, "Verification tab was closed by user");
    let snapshot = h.handle.snapshot().await.unwrap();
    assert!(snapshot.managed_tabs.is_empty());
    assert!(snapshot.aborted);
}

#[tokio::test(start_paused = true)]
async fn test_attestation_failure_halts_the_queue() {
    let h = harness(
        Some(provider_with(&["https://example.com/a", "https://example.com/b"])),
        Duration::from_secs(1),
    );
    h.offscreen.fail_url("https://example.com/a");
    h.start("s1", None).await;

    h.process(0).await;
    h.process(1).await;
    wait(5).await;

    assert_eq!(h.offscreen.calls().len(), 1);
    let failures = h.failures_to(VERIFICATION_TAB);
    assert_eq!(failures.len(), 1);
    assert!(failures[0].error.starts_with("Proof generation failed"));
    assert_eq!(failures[0].request_hash.as_deref(), Some("h1"));
}

#[tokio::test(start_paused = true)]
async fn test_request_for_another_session_is_rejected() {
    let h = harness(Some(provider_with(&["https://example.com/a"])), Duration::ZERO);
    h.start("s1", None).await;

    let result = h
        .handle
        .process_filtered_request(h.matched(0, "other"), MessageSender::tab(VERIFICATION_TAB))
        .await;

    assert!(!result.success);
    assert!(result.error.unwrap_or_default().contains("other"));
    assert!(h.offscreen.key_requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_callback_failure_is_terminal() {
    let h = harness(
        Some(provider_with(&["https://example.com/a"])),
        Duration::from_secs(1),
    );
    h.backend.fail_callback();
    h.start("s1", Some(CALLBACK)).await;

    h.process(0).await;
    wait(3).await;

    assert!(h
        .browser
        .actions_to(VERIFICATION_TAB)
        .contains(&"PROOF_SUBMISSION_FAILED"));
    assert_eq!(h.backend.status_count(SessionStatus::ProofSubmissionFailed), 1);
    assert_eq!(h.backend.status_count(SessionStatus::ProofGenerationFailed), 1);
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, SessionPhase::Failed);
    assert!(!snapshot.guard_held);
}

#[tokio::test(start_paused = true)]
async fn test_manual_claim_without_templates_submits() {
    let h = harness(Some(provider_with(&[])), Duration::from_secs(1));
    h.start("s1", None).await;
    let request = CapturedRequest {
        url: "https://example.com/anything".into(),
        method: "get".into(),
        ..Default::default()
    };

    h.send(MessageBody::RequestClaim(ManualClaimRequest {
        request,
        response: None,
        criteria: None,
    }))
    .await;
    wait(3).await;

    let submitted: Vec<_> = h
        .browser
        .broadcasts()
        .into_iter()
        .filter(|body| matches!(body, MessageBody::ProofSubmitted(_)))
        .collect();
    assert_eq!(submitted.len(), 1);
    assert_eq!(h.backend.status_count(SessionStatus::ProofSubmitted), 1);
    assert_eq!(h.offscreen.calls()[0].url, "https://example.com/anything");
}

#[tokio::test(start_paused = true)]
async fn test_provider_fetch_failure_fails_session() {
    let h = harness(None, Duration::ZERO);

    let result = h
        .handle
        .start_verification(start_payload("s1", None), MessageSender::tab(ORIGINAL_TAB))
        .await;
    assert!(result.success);
    settle().await;

    let failures = h.failures_to(ORIGINAL_TAB);
    assert_eq!(failures.len(), 1);
    assert!(failures[0].error.starts_with("failed to fetch provider data"));
    assert!(h.browser.created().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_staged_messages_and_tab_queries() {
    let h = harness(Some(provider_with(&["https://example.com/a"])), Duration::ZERO);
    h.start("s1", None).await;
    assert!(h.browser.actions_to(VERIFICATION_TAB).is_empty());

    h.send(MessageBody::ContentScriptLoaded).await;
    assert_eq!(
        h.browser.actions_to(VERIFICATION_TAB),
        vec!["SHOW_PROVIDER_VERIFICATION_POPUP", "PROVIDER_DATA_READY"]
    );

    let managed = h
        .handle
        .dispatch(
            Envelope::to_background(MessageBody::CheckIfManagedTab),
            MessageSender::tab(ORIGINAL_TAB),
        )
        .await;
    assert_eq!(managed.data.unwrap()["isManaged"], false);

    let provider = h
        .handle
        .dispatch(
            Envelope::to_background(MessageBody::RequestProviderData),
            MessageSender::tab(VERIFICATION_TAB),
        )
        .await;
    assert_eq!(provider.data.unwrap()["sessionId"], "s1");
}

#[tokio::test(start_paused = true)]
async fn test_reloaded_verification_tab_still_produces_a_proof() {
    let h = harness(
        Some(provider_with(&["https://example.com/api/me"])),
        Duration::from_secs(1),
    );
    h.start("s1", None).await;

    let first_page = Arc::new(RecordingPage::default());
    let first = ContentScript::spawn(
        FilterPolicy::default(),
        "ext-live",
        TabPort::new(h.handle.clone(), VERIFICATION_TAB),
        first_page,
    );
    h.browser.attach(VERIFICATION_TAB, first.clone());
    settle().await;
    first.shutdown();
    settle().await;

    let reloaded_page = Arc::new(RecordingPage::default());
    let reloaded = ContentScript::spawn(
        FilterPolicy::default(),
        "ext-live",
        TabPort::new(h.handle.clone(), VERIFICATION_TAB),
        reloaded_page.clone(),
    );
    h.browser.attach(VERIFICATION_TAB, reloaded.clone());
    settle().await;
    reloaded.on_page_message(PageEnvelope::anonymous(PageMessage::InterceptedNetworkData(
        InterceptedRequestResponse {
            request: CapturedRequest {
                url: "https://example.com/api/me".into(),
                method: "GET".into(),
                ..Default::default()
            },
            response: CapturedResponse {
                status: 200,
                body: r#"{"user":"alice"}"#.into(),
                ..Default::default()
            },
            timestamp: epoch_millis(),
        },
    )));
    wait(5).await;

    assert_eq!(h.offscreen.calls().len(), 1);
    assert_eq!(h.backend.status_count(SessionStatus::ProofSubmitted), 1);
    assert!(reloaded_page
        .messages()
        .iter()
        .any(|message| matches!(message, PageMessage::VerificationCompleted(_))));
}

#[tokio::test(start_paused = true)]
async fn test_offscreen_reply_resolves_pending_request_once() {
    let h = harness(None, Duration::ZERO);
    let (id, rx) = h.pending.register().expect("listener registered");
    let reply = MessageBody::GetPrivateKeyResponse(PrivateKeyResponse {
        request_id: id,
        private_key: Some("0xabc".into()),
        error: None,
    });

    let first = h
        .handle
        .dispatch(Envelope::from_offscreen(reply.clone()), MessageSender::extension())
        .await;
    assert!(first.success, "reply rejected: {:?}", first.error);
    let value = rx.await.expect("reply delivered");
    assert_eq!(value["privateKey"], "0xabc");

    let again = h
        .handle
        .dispatch(Envelope::from_offscreen(reply), MessageSender::extension())
        .await;
    assert!(!again.success);
    assert_eq!(again.error, Some(format!("no pending request {id}")));
}

#[tokio::test(start_paused = true)]
async fn test_claims_rejected_while_submitting() {
    let h = harness(
        Some(provider_with(&["https://example.com/a"])),
        Duration::from_secs(1),
    );
    h.backend.delay_callback(Duration::from_secs(10));
    h.start("s1", Some(CALLBACK)).await;

    h.process(0).await;
    wait(3).await;
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, SessionPhase::Completing);

    let late = h
        .handle
        .process_filtered_request(h.matched(0, "s1"), MessageSender::tab(VERIFICATION_TAB))
        .await;
    assert!(!late.success);
    assert!(late.error.unwrap_or_default().contains("already being submitted"));

    wait(15).await;
    assert_eq!(h.offscreen.calls().len(), 1);
    let callbacks = h.backend.callbacks();
    assert_eq!(callbacks.len(), 1);
    assert_eq!(callbacks[0].1.len(), 1);
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, SessionPhase::Submitted);
}
