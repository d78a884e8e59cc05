use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Descriptor returned by `GET /api/providers/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderData {
    #[serde(default)]
    pub http_provider_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub login_url: String,
    #[serde(default)]
    pub request_data: Vec<RequestTemplate>,
    #[serde(default)]
    pub geo_location: Option<String>,
    #[serde(default)]
    pub custom_injection: Option<String>,
    #[serde(default)]
    pub injection_type: InjectionType,
}

impl ProviderData {
    /// Hashes of every claim slot the provider requires, in template order.
    pub fn required_hashes(&self) -> Vec<&str> {
        self.request_data
            .iter()
            .map(|template| template.request_hash.as_str())
            .collect()
    }

    pub fn template(&self, request_hash: &str) -> Option<&RequestTemplate> {
        self.request_data
            .iter()
            .find(|template| template.request_hash == request_hash)
    }

    pub fn observes_network(&self) -> bool {
        self.injection_type != InjectionType::None
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InjectionType {
    #[default]
    Mswjs,
    Xhook,
    None,
    Unknown,
}

impl<'de> Deserialize<'de> for InjectionType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "MSWJS" => InjectionType::Mswjs,
            "XHOOK" => InjectionType::Xhook,
            "NONE" => InjectionType::None,
            _ => InjectionType::Unknown,
        })
    }
}

/// Matching criteria for one required claim slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTemplate {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub url_type: UrlType,
    #[serde(default)]
    pub response_matches: Vec<ResponseMatch>,
    #[serde(default)]
    pub response_redactions: Vec<ResponseRedaction>,
    #[serde(default)]
    pub body_sniff: BodySniff,
    pub request_hash: String,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UrlType {
    Exact,
    Regex,
    #[default]
    Template,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodySniff {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub template: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    #[default]
    Contains,
    Regex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMatch {
    #[serde(rename = "type", default)]
    pub kind: MatchKind,
    pub value: String,
    #[serde(default)]
    pub invert: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRedaction {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub json_path: String,
    #[serde(default, rename = "xPath", skip_serializing_if = "String::is_empty")]
    pub x_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub regex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Value>,
}

/// A request as seen by the page-level interceptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRequest {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_str: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedResponse {
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptedRequestResponse {
    pub request: CapturedRequest,
    pub response: CapturedResponse,
    /// Capture time, unix epoch milliseconds.
    pub timestamp: u64,
}

impl InterceptedRequestResponse {
    pub fn buffer_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.request.method.to_ascii_uppercase(),
            self.request.url,
            self.timestamp
        )
    }
}

/// Payload of `START_VERIFICATION`, produced by the SDK facade.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateData {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub provider_id: String,
    #[serde(default)]
    pub application_id: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_provider_version: Option<String>,
}
