//! Page ↔ extension bridge.
//!
//! The verified page and the content script talk over `window.postMessage`
//! with `{action, extensionID, data}` messages. Actions the page sends that
//! make the extension do something are privileged and must carry the
//! extension's runtime id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::messages::{
    ExpectManyClaimsUpdate, ManualClaimRequest, ProviderErrorReport, PublicDataUpdate,
};
use crate::proof::Proof;
use crate::provider::{InterceptedRequestResponse, TemplateData};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageEnvelope {
    #[serde(rename = "extensionID", default, skip_serializing_if = "Option::is_none")]
    pub extension_id: Option<String>,
    #[serde(flatten)]
    pub message: PageMessage,
}

impl PageEnvelope {
    /// A message from the page addressed to one extension.
    pub fn to_extension(extension_id: impl Into<String>, message: PageMessage) -> Self {
        Self {
            extension_id: Some(extension_id.into()),
            message,
        }
    }

    /// A message from the extension (or the interceptor) with no id.
    pub fn anonymous(message: PageMessage) -> Self {
        Self {
            extension_id: None,
            message,
        }
    }

    pub fn action(&self) -> &'static str {
        self.message.action()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data")]
pub enum PageMessage {
    #[serde(rename = "RECLAIM_EXTENSION_CHECK")]
    ExtensionCheck,
    #[serde(rename = "RECLAIM_EXTENSION_CHECK_RESPONSE")]
    ExtensionCheckResponse(ExtensionCheckReply),
    #[serde(rename = "RECLAIM_START_VERIFICATION")]
    StartVerification(TemplateData),
    #[serde(rename = "RECLAIM_VERIFICATION_STARTED")]
    VerificationStarted(VerificationStarted),
    #[serde(rename = "RECLAIM_VERIFICATION_COMPLETED")]
    VerificationCompleted(VerificationCompleted),
    #[serde(rename = "RECLAIM_VERIFICATION_FAILED")]
    VerificationFailed(VerificationFailed),
    #[serde(rename = "RECLAIM_CANCEL_VERIFICATION")]
    CancelVerification,
    #[serde(rename = "RECLAIM_SET_PUBLIC_DATA")]
    SetPublicData(PublicDataUpdate),
    #[serde(rename = "RECLAIM_SET_EXPECT_MANY_CLAIMS")]
    SetExpectManyClaims(ExpectManyClaimsUpdate),
    #[serde(rename = "RECLAIM_PARAMETERS_GET")]
    ParametersGet,
    #[serde(rename = "RECLAIM_PARAMETERS_UPDATE")]
    ParametersUpdate(ParametersUpdate),
    #[serde(rename = "RECLAIM_REPORT_PROVIDER_ERROR")]
    ReportProviderError(ProviderErrorReport),
    #[serde(rename = "RECLAIM_REQUEST_CLAIM")]
    RequestClaim(ManualClaimRequest),
    /// Emitted by the page-level network interceptor for every completed
    /// request.
    #[serde(rename = "RECLAIM_INTERCEPTED_NETWORK_DATA")]
    InterceptedNetworkData(InterceptedRequestResponse),
}

impl PageMessage {
    pub fn action(&self) -> &'static str {
        match self {
            PageMessage::ExtensionCheck => "RECLAIM_EXTENSION_CHECK",
            PageMessage::ExtensionCheckResponse(_) => "RECLAIM_EXTENSION_CHECK_RESPONSE",
            PageMessage::StartVerification(_) => "RECLAIM_START_VERIFICATION",
            PageMessage::VerificationStarted(_) => "RECLAIM_VERIFICATION_STARTED",
            PageMessage::VerificationCompleted(_) => "RECLAIM_VERIFICATION_COMPLETED",
            PageMessage::VerificationFailed(_) => "RECLAIM_VERIFICATION_FAILED",
            PageMessage::CancelVerification => "RECLAIM_CANCEL_VERIFICATION",
            PageMessage::SetPublicData(_) => "RECLAIM_SET_PUBLIC_DATA",
            PageMessage::SetExpectManyClaims(_) => "RECLAIM_SET_EXPECT_MANY_CLAIMS",
            PageMessage::ParametersGet => "RECLAIM_PARAMETERS_GET",
            PageMessage::ParametersUpdate(_) => "RECLAIM_PARAMETERS_UPDATE",
            PageMessage::ReportProviderError(_) => "RECLAIM_REPORT_PROVIDER_ERROR",
            PageMessage::RequestClaim(_) => "RECLAIM_REQUEST_CLAIM",
            PageMessage::InterceptedNetworkData(_) => "RECLAIM_INTERCEPTED_NETWORK_DATA",
        }
    }

    /// Page requests that act on the extension and need a valid
    /// `extensionID`.
    pub fn is_privileged(&self) -> bool {
        matches!(
            self,
            PageMessage::StartVerification(_)
                | PageMessage::CancelVerification
                | PageMessage::SetPublicData(_)
                | PageMessage::SetExpectManyClaims(_)
                | PageMessage::ParametersGet
                | PageMessage::ReportProviderError(_)
                | PageMessage::RequestClaim(_)
        )
    }

    /// Messages only the extension side emits; a page posting one is ignored.
    pub fn is_extension_reply(&self) -> bool {
        matches!(
            self,
            PageMessage::ExtensionCheckResponse(_)
                | PageMessage::VerificationStarted(_)
                | PageMessage::VerificationCompleted(_)
                | PageMessage::VerificationFailed(_)
                | PageMessage::ParametersUpdate(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionCheckReply {
    pub installed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationStarted {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationCompleted {
    pub proofs: Vec<Proof>,
    /// Absent when the extension could not tell which session finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationFailed {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParametersUpdate {
    pub parameters: BTreeMap<String, String>,
}
