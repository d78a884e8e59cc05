//! Inter-context message protocol.
//!
//! Every message on the extension runtime has the shape
//! `{action, source, target, data}`. `MessageBody` is the closed set of
//! actions; the `action`/`data` pair is its adjacently tagged encoding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::claim::Claim;
use crate::proof::{AttestorProof, Proof};
use crate::provider::{CapturedRequest, CapturedResponse, ProviderData, RequestTemplate, TemplateData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageContext {
    ContentScript,
    Background,
    Offscreen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: MessageContext,
    pub target: MessageContext,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Envelope {
    pub fn new(source: MessageContext, target: MessageContext, body: MessageBody) -> Self {
        Self {
            source,
            target,
            body,
        }
    }

    pub fn to_content(body: MessageBody) -> Self {
        Self::new(MessageContext::Background, MessageContext::ContentScript, body)
    }

    pub fn to_background(body: MessageBody) -> Self {
        Self::new(MessageContext::ContentScript, MessageContext::Background, body)
    }

    pub fn to_offscreen(body: MessageBody) -> Self {
        Self::new(MessageContext::Background, MessageContext::Offscreen, body)
    }

    pub fn from_offscreen(body: MessageBody) -> Self {
        Self::new(MessageContext::Offscreen, MessageContext::Background, body)
    }

    pub fn action(&self) -> &'static str {
        self.body.action()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageBody {
    ContentScriptLoaded,
    ShouldInitialize,
    CheckIfManagedTab,
    RequestProviderData,
    ProviderDataReady(ProviderDataReady),
    ShowProviderVerificationPopup(VerificationPopup),
    StartVerification(TemplateData),
    CancelVerification,
    FilteredRequestFound(FilteredRequest),
    RequestClaim(ManualClaimRequest),
    ClaimCreationRequested(ClaimProgress),
    ClaimCreationSuccess(ClaimProgress),
    ClaimCreationFailed(FailureNotice),
    ProofGenerationStarted(ClaimProgress),
    ProofGenerationSuccess(ClaimProgress),
    ProofGenerationFailed(FailureNotice),
    ProofSubmitted(ProofsSubmitted),
    ProofSubmissionFailed(FailureNotice),
    GetPrivateKey(PrivateKeyRequest),
    GetPrivateKeyResponse(PrivateKeyResponse),
    GenerateProof(GenerateProofRequest),
    GenerateProofResponse(GenerateProofResponse),
    OffscreenDocumentReady,
    UpdatePublicData(PublicDataUpdate),
    UpdateExpectManyClaims(ExpectManyClaimsUpdate),
    GetParameters,
    ReportProviderError(ProviderErrorReport),
}

impl MessageBody {
    pub fn action(&self) -> &'static str {
        match self {
            MessageBody::ContentScriptLoaded => "CONTENT_SCRIPT_LOADED",
            MessageBody::ShouldInitialize => "SHOULD_INITIALIZE",
            MessageBody::CheckIfManagedTab => "CHECK_IF_MANAGED_TAB",
            MessageBody::RequestProviderData => "REQUEST_PROVIDER_DATA",
            MessageBody::ProviderDataReady(_) => "PROVIDER_DATA_READY",
            MessageBody::ShowProviderVerificationPopup(_) => "SHOW_PROVIDER_VERIFICATION_POPUP",
            MessageBody::StartVerification(_) => "START_VERIFICATION",
            MessageBody::CancelVerification => "CANCEL_VERIFICATION",
            MessageBody::FilteredRequestFound(_) => "FILTERED_REQUEST_FOUND",
            MessageBody::RequestClaim(_) => "REQUEST_CLAIM",
            MessageBody::ClaimCreationRequested(_) => "CLAIM_CREATION_REQUESTED",
            MessageBody::ClaimCreationSuccess(_) => "CLAIM_CREATION_SUCCESS",
            MessageBody::ClaimCreationFailed(_) => "CLAIM_CREATION_FAILED",
            MessageBody::ProofGenerationStarted(_) => "PROOF_GENERATION_STARTED",
            MessageBody::ProofGenerationSuccess(_) => "PROOF_GENERATION_SUCCESS",
            MessageBody::ProofGenerationFailed(_) => "PROOF_GENERATION_FAILED",
            MessageBody::ProofSubmitted(_) => "PROOF_SUBMITTED",
            MessageBody::ProofSubmissionFailed(_) => "PROOF_SUBMISSION_FAILED",
            MessageBody::GetPrivateKey(_) => "GET_PRIVATE_KEY",
            MessageBody::GetPrivateKeyResponse(_) => "GET_PRIVATE_KEY_RESPONSE",
            MessageBody::GenerateProof(_) => "GENERATE_PROOF",
            MessageBody::GenerateProofResponse(_) => "GENERATE_PROOF_RESPONSE",
            MessageBody::OffscreenDocumentReady => "OFFSCREEN_DOCUMENT_READY",
            MessageBody::UpdatePublicData(_) => "UPDATE_PUBLIC_DATA",
            MessageBody::UpdateExpectManyClaims(_) => "UPDATE_EXPECT_MANY_CLAIMS",
            MessageBody::GetParameters => "GET_PARAMETERS",
            MessageBody::ReportProviderError(_) => "REPORT_PROVIDER_ERROR",
        }
    }
}

/// Reply shape for every cross-context call; callers branch on `success`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ActionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn ok_with(data: Value) -> Self {
        Self {
            success: true,
            error: None,
            data: Some(data),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDataReady {
    pub provider_data: ProviderData,
    pub session_id: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationPopup {
    pub provider_name: String,
    pub session_id: String,
    #[serde(default)]
    pub description: String,
}

/// A captured request that satisfied one template, forwarded for claim
/// creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilteredRequest {
    pub request: CapturedRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<CapturedResponse>,
    pub criteria: RequestTemplate,
    pub session_id: String,
    pub login_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualClaimRequest {
    pub request: CapturedRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<CapturedResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<RequestTemplate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimProgress {
    pub request_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureNotice {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofsSubmitted {
    pub proofs: Vec<Proof>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateKeyRequest {
    pub request_id: u64,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateKeyResponse {
    pub request_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateProofRequest {
    pub request_id: u64,
    pub claim_data: Claim,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateProofResponse {
    pub request_id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<AttestorProof>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicDataUpdate {
    pub public_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectManyClaimsUpdate {
    pub expect_many: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderErrorReport {
    pub error: String,
}

/// Remote session status reported through `POST /api/sdk/update/session/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    SessionInit,
    SessionStarted,
    UserInitVerification,
    UserStartedVerification,
    ProofGenerationStarted,
    ProofGenerationSuccess,
    ProofGenerationFailed,
    ProofSubmitted,
    ProofSubmissionFailed,
    ProofManualVerificationSubmited,
}
