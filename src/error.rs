use std::time::Duration;

use thiserror::Error;

use crate::browser::TabId;

/// Configuration could not be loaded or contained a malformed value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Failures talking to the backend HTTP API or a developer callback URL.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },

    #[error("no provider data returned for provider {0}")]
    EmptyProvider(String),

    #[error("malformed response from {endpoint}: {reason}")]
    Malformed { endpoint: String, reason: String },
}

/// Failures of the browser host (tabs, messaging).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrowserError {
    #[error("tab {0} does not exist")]
    NoSuchTab(TabId),

    #[error("could not create tab for {url}: {reason}")]
    TabCreation { url: String, reason: String },

    #[error("message delivery failed: {0}")]
    Delivery(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CookieError {
    #[error("invalid cookie url {0:?}")]
    InvalidUrl(String),

    #[error("cookie store query failed: {0}")]
    Store(String),
}

/// Failures of a correlated request/response round-trip between contexts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("{label} timed out after {after:?}")]
    Timeout { label: &'static str, after: Duration },

    #[error("{label} listener dropped before a reply arrived")]
    Disconnected { label: &'static str },

    #[error("{label} could not be sent: {reason}")]
    Send { label: &'static str, reason: String },

    #[error("{label} reply was malformed: {reason}")]
    Decode { label: &'static str, reason: String },

    #[error("{label} failed: {reason}")]
    Remote { label: &'static str, reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid json path {0:?}")]
    InvalidJsonPath(String),

    #[error("invalid xpath {0:?}")]
    InvalidXPath(String),
}

/// Claim creation failures. Any of these fails the session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClaimError {
    #[error("failed to obtain signing key: {0}")]
    PrivateKey(RpcError),

    #[error("failed to resolve geo location: {0}")]
    GeoLocation(String),

    #[error("request does not match its criteria: {0}")]
    Match(#[from] MatchError),

    #[error("request is missing {0}")]
    MissingField(&'static str),
}

/// Errors surfaced by the background orchestrator to its immediate caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Provider ID is required")]
    MissingProviderId,

    #[error("Session ID is required")]
    MissingSessionId,

    #[error("Another verification is in progress")]
    VerificationInProgress,

    #[error("no active verification session")]
    NoActiveSession,

    #[error("proofs for session {0} are already being submitted")]
    SubmissionInProgress(String),

    #[error("request belongs to session {got}, active session is {expected}")]
    SessionMismatch { expected: String, got: String },

    #[error("failed to fetch provider data: {0}")]
    ProviderData(String),

    #[error("failed to open verification tab: {0}")]
    TabOpen(String),

    #[error("claim creation failed: {0}")]
    Claim(String),

    #[error("orchestrator has shut down")]
    Stopped,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContentError {
    #[error("background did not accept {action}: {reason}")]
    Rejected { action: &'static str, reason: String },

    #[error("port to {0} is closed")]
    PortClosed(&'static str),
}

/// Errors returned by the page-facing SDK facade.
#[derive(Debug, Error)]
pub enum SdkError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("session initialisation failed: {0}")]
    Init(#[from] BackendError),

    #[error("could not sign session request: {0}")]
    Signing(String),

    #[error("extension bridge closed")]
    BridgeClosed,

    #[error("verification failed: {0}")]
    Verification(String),
}

/// Failures inside the isolated attestation context.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AttestationError {
    #[error("attestor rejected the claim: {0}")]
    Attestor(String),

    #[error("attestation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("claim is missing its owner key")]
    MissingKey,
}
