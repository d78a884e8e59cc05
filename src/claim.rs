//! Claim construction from a matched request.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::BackendApi;
use crate::error::ClaimError;
use crate::matching::{convert_template_to_regex, extract_parameters, separate_parameters};
use crate::offscreen::OffscreenClient;
use crate::provider::{
    CapturedRequest, CapturedResponse, RequestTemplate, ResponseMatch, ResponseRedaction, UrlType,
};

/// Provider geo value that asks for the caller's own country.
pub const DYNAMIC_GEO: &str = "{{DYNAMIC_GEO}}";

/// Input to attestation. `params` is disclosed in the proof; `secret_params`
/// is only seen by the attestor.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub name: String,
    pub session_id: String,
    pub params: ClaimParams,
    pub secret_params: SecretParams,
    pub owner_private_key: String,
    pub client: AttestorClientInfo,
}

impl fmt::Debug for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claim")
            .field("name", &self.name)
            .field("session_id", &self.session_id)
            .field("params", &self.params)
            .field("secret_params", &self.secret_params)
            .field("owner_private_key", &"<redacted>")
            .field("client", &self.client)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimParams {
    pub url: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub param_values: BTreeMap<String, String>,
    #[serde(default)]
    pub response_matches: Vec<ResponseMatch>,
    #[serde(default)]
    pub response_redactions: Vec<ResponseRedaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_location: Option<String>,
}

#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_str: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub param_values: BTreeMap<String, String>,
}

impl fmt::Debug for SecretParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretParams")
            .field("cookie_str", &self.cookie_str.as_ref().map(|_| "<redacted>"))
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("param_values", &self.param_values.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestorClientInfo {
    pub url: String,
}

/// Everything a claim is built from.
#[derive(Debug, Clone)]
pub struct ClaimInput {
    pub session_id: String,
    pub request: CapturedRequest,
    pub response: Option<CapturedResponse>,
    pub criteria: RequestTemplate,
    pub login_url: String,
    /// Provider geo policy; `DYNAMIC_GEO` resolves via IP lookup.
    pub geo_location: Option<String>,
    pub parameters: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct ClaimBuilder {
    offscreen: Arc<dyn OffscreenClient>,
    backend: Arc<dyn BackendApi>,
    attestor_url: String,
}

impl ClaimBuilder {
    pub fn new(
        offscreen: Arc<dyn OffscreenClient>,
        backend: Arc<dyn BackendApi>,
        attestor_url: impl Into<String>,
    ) -> Self {
        Self {
            offscreen,
            backend,
            attestor_url: attestor_url.into(),
        }
    }

    pub async fn build(&self, input: ClaimInput) -> Result<Claim, ClaimError> {
        let ClaimInput {
            session_id,
            request,
            response,
            criteria,
            login_url,
            geo_location,
            parameters,
        } = input;

        if request.url.is_empty() {
            return Err(ClaimError::MissingField("url"));
        }
        if request.method.is_empty() {
            return Err(ClaimError::MissingField("method"));
        }

        let values = extract_parameters(&criteria, &request, response.as_ref(), &parameters);
        let separated = separate_parameters(&values);

        let (url, body) = if criteria.url_type == UrlType::Template {
            convert_template_to_regex(&criteria.url, &BTreeMap::new())?;
            let body = if criteria.body_sniff.enabled && !criteria.body_sniff.template.is_empty() {
                Some(criteria.body_sniff.template.clone())
            } else {
                request.body.clone()
            };
            (criteria.url.clone(), body)
        } else {
            (request.url.clone(), request.body.clone())
        };

        let (public_headers, mut secret_headers) = split_headers(&request.headers);
        let referer = request
            .referrer
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| login_url.clone());
        if !referer.is_empty() {
            secret_headers.insert("Referer".to_string(), referer);
        }
        let cookie_str = request.cookie_str.clone().filter(|c| !c.is_empty()).or_else(|| {
            request
                .headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("cookie"))
                .map(|(_, value)| value.clone())
        });

        let geo_location = self.resolve_geo(geo_location.as_deref(), &parameters).await?;

        let owner_private_key = self
            .offscreen
            .get_private_key(&session_id)
            .await
            .map_err(ClaimError::PrivateKey)?;

        info!(
            session_id = %session_id,
            request_hash = %criteria.request_hash,
            public_params = separated.public.len(),
            secret_params = separated.secret.len(),
            "claim built"
        );

        Ok(Claim {
            name: "http".to_string(),
            session_id,
            params: ClaimParams {
                url,
                method: request.method.to_ascii_uppercase(),
                body,
                headers: public_headers,
                param_values: separated.public,
                response_matches: sanitize_matches(&criteria.response_matches),
                response_redactions: sanitize_redactions(&criteria.response_redactions),
                geo_location,
            },
            secret_params: SecretParams {
                cookie_str,
                headers: secret_headers,
                param_values: separated.secret,
            },
            owner_private_key,
            client: AttestorClientInfo {
                url: self.attestor_url.clone(),
            },
        })
    }

    async fn resolve_geo(
        &self,
        policy: Option<&str>,
        parameters: &BTreeMap<String, String>,
    ) -> Result<Option<String>, ClaimError> {
        let Some(policy) = policy.map(str::trim).filter(|p| !p.is_empty()) else {
            return Ok(None);
        };
        if policy == DYNAMIC_GEO {
            let country = self
                .backend
                .lookup_geo_location()
                .await
                .map_err(|err| ClaimError::GeoLocation(err.to_string()))?;
            debug!(country = %country, "resolved dynamic geo location");
            return Ok(Some(country));
        }
        let resolved = crate::matching::template::substitute_known(policy, parameters);
        Ok(Some(resolved).filter(|geo| !geo.is_empty()))
    }
}

pub fn is_public_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name == "user-agent"
        || name.starts_with("accept")
        || name.starts_with("sec-fetch-")
        || name.starts_with("sec-ch-ua")
        || name == "origin"
        || name == "x-requested-with"
        || name == "content-type"
}

/// Public allow-listed headers and everything else; cookies and the referer
/// are carried separately.
fn split_headers(
    headers: &BTreeMap<String, String>,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut public = BTreeMap::new();
    let mut secret = BTreeMap::new();
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if lower == "cookie" || lower == "referer" {
            continue;
        }
        if is_public_header(&lower) {
            public.insert(name.clone(), value.clone());
        } else {
            secret.insert(name.clone(), value.clone());
        }
    }
    (public, secret)
}

fn sanitize_matches(matches: &[ResponseMatch]) -> Vec<ResponseMatch> {
    matches
        .iter()
        .map(|rule| ResponseMatch {
            hash: None,
            ..rule.clone()
        })
        .collect()
}

fn sanitize_redactions(redactions: &[ResponseRedaction]) -> Vec<ResponseRedaction> {
    redactions
        .iter()
        .map(|redaction| ResponseRedaction {
            hash: None,
            ..redaction.clone()
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn sample_claim(url: &str) -> Claim {
    Claim {
        name: "http".to_string(),
        session_id: "s1".to_string(),
        params: ClaimParams {
            url: url.to_string(),
            method: "GET".to_string(),
            ..Default::default()
        },
        secret_params: SecretParams::default(),
        owner_private_key: format!("0x{}", "11".repeat(32)),
        client: AttestorClientInfo {
            url: crate::config::DEFAULT_ATTESTOR_URL.to_string(),
        },
    }
}
