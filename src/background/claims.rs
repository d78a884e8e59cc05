//! Matched requests to claims, and the single-flight proof queue drain.

use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{Event, Orchestrator};
use crate::browser::{MessageSender, TabId};
use crate::claim::{Claim, ClaimInput};
use crate::cookies::collect_cookie_header;
use crate::error::{ClaimError, OrchestratorError, RpcError};
use crate::messages::{
    ActionResult, ClaimProgress, FailureNotice, FilteredRequest, ManualClaimRequest, MessageBody,
    SessionStatus,
};
use crate::proof::AttestorProof;
use crate::provider::{BodySniff, CapturedRequest, RequestTemplate, UrlType};
use crate::session::SessionPhase;

/// Correlation hash for a claim that has no provider template:
/// `0x` + sha256 of `"METHOD url"`.
pub fn adhoc_request_hash(method: &str, url: &str) -> String {
    let digest = Sha256::digest(format!("{} {}", method.to_ascii_uppercase(), url).as_bytes());
    format!("0x{}", hex::encode(digest))
}

/// Exact-match criteria describing a manually submitted request.
pub fn adhoc_template(request: &CapturedRequest) -> RequestTemplate {
    RequestTemplate {
        url: request.url.clone(),
        method: request.method.to_ascii_uppercase(),
        url_type: UrlType::Exact,
        response_matches: Vec::new(),
        response_redactions: Vec::new(),
        body_sniff: BodySniff::default(),
        request_hash: adhoc_request_hash(&request.method, &request.url),
    }
}

fn respond(reply: Option<oneshot::Sender<ActionResult>>, result: ActionResult) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

impl Orchestrator {
    /// Starts claim creation for one matched request. The reply, if any, is
    /// sent once the claim is built or has failed.
    pub(super) async fn process_filtered_request(
        &mut self,
        request: FilteredRequest,
        sender_tab: Option<TabId>,
        reply: Option<oneshot::Sender<ActionResult>>,
    ) {
        let Some(current) = self.state.session_id.clone().filter(|_| self.state.is_active()) else {
            respond(reply, ActionResult::failed(OrchestratorError::NoActiveSession.to_string()));
            return;
        };
        if request.session_id != current {
            let err = OrchestratorError::SessionMismatch {
                expected: current,
                got: request.session_id,
            };
            respond(reply, ActionResult::failed(err.to_string()));
            return;
        }
        if self.accepting_claims_closed() {
            debug!(session_id = %current, phase = ?self.state.phase, "claim after submission rejected");
            let err = OrchestratorError::SubmissionInProgress(current);
            respond(reply, ActionResult::failed(err.to_string()));
            return;
        }

        if !self.state.first_request_received {
            self.state.first_request_received = true;
            self.timer.start();
        }

        let request_hash = request.criteria.request_hash.clone();
        let notify_tab = sender_tab.or(self.state.active_tab_id);
        debug!(session_id = %current, request_hash = %request_hash, "claim creation requested");
        self.notify_tab(
            notify_tab,
            MessageBody::ClaimCreationRequested(ClaimProgress {
                request_hash: request_hash.clone(),
            }),
        )
        .await;

        let Some(events) = self.poster() else {
            respond(reply, ActionResult::failed(OrchestratorError::Stopped.to_string()));
            return;
        };
        let cookies = self.deps.cookies.clone();
        let builder = self.claims.clone();
        let geo_location = self
            .state
            .provider_data
            .as_ref()
            .and_then(|provider| provider.geo_location.clone());
        let parameters = self.state.parameters.clone();

        tokio::spawn(async move {
            let FilteredRequest {
                mut request,
                response,
                criteria,
                session_id,
                login_url,
            } = request;
            if let Some(cookie) = collect_cookie_header(cookies.as_ref(), &request.url).await {
                request.cookie_str = Some(cookie);
            }
            let result = builder
                .build(ClaimInput {
                    session_id: session_id.clone(),
                    request,
                    response,
                    criteria: criteria.clone(),
                    login_url,
                    geo_location,
                    parameters,
                })
                .await;
            let _ = events.send(Event::ClaimPrepared {
                session_id,
                notify_tab,
                criteria,
                result,
                reply,
            });
        });
    }

    /// `REQUEST_CLAIM`: a request handed over directly rather than found by
    /// the network filter.
    pub(super) async fn request_manual_claim(
        &mut self,
        manual: ManualClaimRequest,
        sender: &MessageSender,
        reply: oneshot::Sender<ActionResult>,
    ) {
        let Some(session_id) = self.state.session_id.clone().filter(|_| self.state.is_active()) else {
            respond(
                Some(reply),
                ActionResult::failed(OrchestratorError::NoActiveSession.to_string()),
            );
            return;
        };
        let criteria = manual
            .criteria
            .unwrap_or_else(|| adhoc_template(&manual.request));
        let login_url = self
            .state
            .provider_data
            .as_ref()
            .map(|provider| provider.login_url.clone())
            .or_else(|| sender.url.clone())
            .unwrap_or_default();

        let request = FilteredRequest {
            request: manual.request,
            response: manual.response,
            criteria,
            session_id,
            login_url,
        };
        self.process_filtered_request(request, sender.tab_id, Some(reply))
            .await;
    }

    pub(super) async fn on_claim_prepared(
        &mut self,
        session_id: &str,
        notify_tab: Option<TabId>,
        criteria: RequestTemplate,
        result: Result<Claim, ClaimError>,
        reply: Option<oneshot::Sender<ActionResult>>,
    ) {
        if !self.state.is_current(session_id) || self.state.aborted {
            debug!(session_id, "claim for inactive session dropped");
            respond(reply, ActionResult::failed(OrchestratorError::NoActiveSession.to_string()));
            return;
        }

        if self.accepting_claims_closed() {
            debug!(session_id, phase = ?self.state.phase, "claim prepared after submission dropped");
            let err = OrchestratorError::SubmissionInProgress(session_id.to_string());
            respond(reply, ActionResult::failed(err.to_string()));
            return;
        }

        let request_hash = criteria.request_hash.clone();
        match result {
            Err(err) => {
                let message = OrchestratorError::Claim(err.to_string()).to_string();
                self.notify_tab(
                    notify_tab,
                    MessageBody::ClaimCreationFailed(FailureNotice {
                        error: message.clone(),
                        request_hash: Some(request_hash.clone()),
                        session_id: Some(session_id.to_string()),
                    }),
                )
                .await;
                self.fail_session(&message, Some(request_hash)).await;
                respond(reply, ActionResult::failed(message));
            }
            Ok(claim) => {
                self.notify_tab(
                    notify_tab,
                    MessageBody::ClaimCreationSuccess(ClaimProgress {
                        request_hash: request_hash.clone(),
                    }),
                )
                .await;
                self.state
                    .provider_requests_by_hash
                    .insert(request_hash.clone(), criteria);
                respond(reply, ActionResult::ok());
                self.enqueue_claim(request_hash, claim).await;
            }
        }
    }

    /// Once proofs are being submitted the proof set is frozen.
    fn accepting_claims_closed(&self) -> bool {
        self.state.phase == SessionPhase::Completing || self.state.phase.is_terminal()
    }

    async fn enqueue_claim(&mut self, request_hash: String, claim: Claim) {
        let idle = self.queue.enqueue(request_hash.clone(), claim);
        self.state.phase = SessionPhase::ClaimsQueued;
        debug!(request_hash = %request_hash, queued = self.queue.len(), idle, "claim queued");
        if idle {
            self.timer.pause();
            self.drain_next().await;
        }
    }

    /// Sends the next queued claim for attestation unless one is in flight.
    async fn drain_next(&mut self) {
        if self.state.aborted {
            debug!("queue drain stopped, session aborted");
            return;
        }
        let Some(session_id) = self.state.session_id.clone() else {
            return;
        };
        let Some(item) = self.queue.begin_next() else {
            return;
        };
        self.timer.pause();

        self.notify_tab(
            self.state.active_tab_id,
            MessageBody::ProofGenerationStarted(ClaimProgress {
                request_hash: item.request_hash.clone(),
            }),
        )
        .await;
        self.report_status(SessionStatus::ProofGenerationStarted);

        let Some(events) = self.poster() else {
            return;
        };
        let offscreen = self.deps.offscreen.clone();
        let public_data = self.state.public_data.clone();
        tokio::spawn(async move {
            let result = offscreen.generate_proof(item.claim, public_data).await;
            let _ = events.send(Event::ProofFinished {
                session_id,
                request_hash: item.request_hash,
                result,
            });
        });
    }

    pub(super) async fn on_proof_finished(
        &mut self,
        session_id: &str,
        request_hash: String,
        result: Result<AttestorProof, RpcError>,
    ) {
        if !self.state.is_current(session_id) {
            debug!(session_id, request_hash = %request_hash, "proof for stale session dropped");
            return;
        }
        self.queue.finish();
        if self.state.aborted {
            debug!(session_id, request_hash = %request_hash, "proof for aborted session dropped");
            return;
        }

        match result {
            Ok(proof) => {
                if self.queue.record_proof(&request_hash, proof) {
                    info!(session_id, request_hash = %request_hash, "proof generated");
                    self.notify_tab(
                        self.state.active_tab_id,
                        MessageBody::ProofGenerationSuccess(ClaimProgress {
                            request_hash: request_hash.clone(),
                        }),
                    )
                    .await;
                    self.report_status(SessionStatus::ProofGenerationSuccess);
                    self.timer.reset();
                } else {
                    warn!(session_id, request_hash = %request_hash, "duplicate proof discarded");
                }
            }
            Err(err) => {
                let message = format!("Proof generation failed: {err}");
                self.fail_session(&message, Some(request_hash)).await;
                return;
            }
        }

        if self.queue.is_empty() {
            self.on_queue_empty();
        } else {
            self.drain_next().await;
        }
    }

    fn on_queue_empty(&mut self) {
        let required = self.state.required_hashes();
        if required.is_empty() {
            debug!("no template list, attempting submission");
            self.schedule_submit();
            return;
        }

        let required: Vec<&str> = required.iter().map(String::as_str).collect();
        if self.queue.all_required_satisfied(&required) {
            self.timer.clear_all();
            if self.state.expect_many_claims {
                debug!("all required proofs generated, waiting for expectManyClaims release");
            } else {
                self.schedule_submit();
            }
        } else {
            self.timer.resume();
            self.state.phase = SessionPhase::Filtering;
        }
    }
}
