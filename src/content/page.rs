//! Admission of page-originated bridge messages and their translation onto
//! the runtime bus.

use tracing::warn;

use crate::bridge::{PageEnvelope, PageMessage};
use crate::messages::MessageBody;
use crate::provider::InterceptedRequestResponse;

/// What the content script should do with one page message.
#[derive(Debug, Clone, PartialEq)]
pub enum PageRequest {
    /// Answer `RECLAIM_EXTENSION_CHECK` directly.
    ExtensionCheck { installed: bool },
    /// Feed the network observer.
    Capture(InterceptedRequestResponse),
    /// Forward to the background and relay the outcome.
    Forward(MessageBody),
    Ignore,
}

/// Decides whether page messages may reach the extension.
#[derive(Debug, Clone)]
pub struct PageGate {
    extension_id: String,
}

impl PageGate {
    pub fn new(extension_id: impl Into<String>) -> Self {
        Self {
            extension_id: extension_id.into(),
        }
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    fn id_matches(&self, envelope: &PageEnvelope) -> bool {
        envelope.extension_id.as_deref() == Some(self.extension_id.as_str())
    }

    pub fn admit(&self, envelope: PageEnvelope) -> PageRequest {
        if envelope.message.is_privileged() && !self.id_matches(&envelope) {
            warn!(
                action = envelope.action(),
                extension_id = ?envelope.extension_id,
                "page message with wrong extensionID ignored"
            );
            return PageRequest::Ignore;
        }
        let installed = self.id_matches(&envelope);

        match envelope.message {
            PageMessage::ExtensionCheck => PageRequest::ExtensionCheck { installed },
            PageMessage::InterceptedNetworkData(entry) => PageRequest::Capture(entry),
            PageMessage::StartVerification(template) => {
                PageRequest::Forward(MessageBody::StartVerification(template))
            }
            PageMessage::CancelVerification => PageRequest::Forward(MessageBody::CancelVerification),
            PageMessage::SetPublicData(update) => PageRequest::Forward(MessageBody::UpdatePublicData(update)),
            PageMessage::SetExpectManyClaims(update) => {
                PageRequest::Forward(MessageBody::UpdateExpectManyClaims(update))
            }
            PageMessage::ParametersGet => PageRequest::Forward(MessageBody::GetParameters),
            PageMessage::ReportProviderError(report) => {
                PageRequest::Forward(MessageBody::ReportProviderError(report))
            }
            PageMessage::RequestClaim(manual) => PageRequest::Forward(MessageBody::RequestClaim(manual)),
            PageMessage::ExtensionCheckResponse(_)
            | PageMessage::VerificationStarted(_)
            | PageMessage::VerificationCompleted(_)
            | PageMessage::VerificationFailed(_)
            | PageMessage::ParametersUpdate(_) => PageRequest::Ignore,
        }
    }
}
