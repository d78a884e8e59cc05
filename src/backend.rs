//! Backend HTTP API and developer callback delivery.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::messages::SessionStatus;
use crate::proof::Proof;
use crate::provider::ProviderData;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitSessionRequest {
    pub provider_id: String,
    pub app_id: String,
    pub timestamp: String,
    pub signature: String,
    pub version_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitSessionResponse {
    pub session_id: String,
    #[serde(default)]
    pub resolved_provider_version: Option<String>,
}

#[derive(Deserialize)]
struct ProviderEnvelope {
    providers: Option<ProviderData>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusUpdate<'a> {
    session_id: &'a str,
    status: SessionStatus,
}

#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn fetch_provider_data(
        &self,
        provider_id: &str,
        version: Option<&str>,
    ) -> Result<ProviderData, BackendError>;

    async fn init_session(
        &self,
        request: &InitSessionRequest,
    ) -> Result<InitSessionResponse, BackendError>;

    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), BackendError>;

    /// POSTs the proofs to a developer callback as URL-encoded JSON with a
    /// `text/plain` content type.
    async fn submit_callback(&self, callback_url: &str, proofs: &[Proof]) -> Result<(), BackendError>;

    /// Two-letter country code of the caller's public IP.
    async fn lookup_geo_location(&self) -> Result<String, BackendError>;
}

pub struct HttpBackend {
    client: reqwest::Client,
    config: BackendConfig,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn send(
        &self,
        endpoint: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, BackendError> {
        let response = request
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|source| BackendError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(BackendError::Status {
                endpoint: endpoint.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn fetch_provider_data(
        &self,
        provider_id: &str,
        version: Option<&str>,
    ) -> Result<ProviderData, BackendError> {
        let endpoint = self.endpoint(&format!("/api/providers/{provider_id}"));
        let mut request = self.client.get(&endpoint);
        if let Some(version) = version.filter(|v| !v.is_empty()) {
            request = request.query(&[("versionNumber", version)]);
        }

        let envelope: ProviderEnvelope = self
            .send(&endpoint, request)
            .await?
            .json()
            .await
            .map_err(|err| BackendError::Malformed {
                endpoint: endpoint.clone(),
                reason: err.to_string(),
            })?;

        let provider = envelope
            .providers
            .ok_or_else(|| BackendError::EmptyProvider(provider_id.to_string()))?;
        debug!(provider_id, templates = provider.request_data.len(), "provider data fetched");
        Ok(provider)
    }

    async fn init_session(
        &self,
        request: &InitSessionRequest,
    ) -> Result<InitSessionResponse, BackendError> {
        let endpoint = self.endpoint("/api/sdk/init/session/");
        let response: InitSessionResponse = self
            .send(&endpoint, self.client.post(&endpoint).json(request))
            .await?
            .json()
            .await
            .map_err(|err| BackendError::Malformed {
                endpoint: endpoint.clone(),
                reason: err.to_string(),
            })?;
        info!(session_id = %response.session_id, provider_id = %request.provider_id, "session initialised");
        Ok(response)
    }

    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), BackendError> {
        let endpoint = self.endpoint("/api/sdk/update/session/");
        let body = StatusUpdate { session_id, status };
        self.send(&endpoint, self.client.post(&endpoint).json(&body))
            .await?;
        debug!(session_id, ?status, "session status updated");
        Ok(())
    }

    async fn submit_callback(&self, callback_url: &str, proofs: &[Proof]) -> Result<(), BackendError> {
        let body = encode_callback_body(proofs).map_err(|err| BackendError::Malformed {
            endpoint: callback_url.to_string(),
            reason: err.to_string(),
        })?;
        let request = self
            .client
            .post(callback_url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body);
        self.send(callback_url, request).await?;
        info!(callback_url, proofs = proofs.len(), "proofs delivered to callback");
        Ok(())
    }

    async fn lookup_geo_location(&self) -> Result<String, BackendError> {
        let endpoint = self.config.geo_lookup_url.clone();
        let text = self
            .send(&endpoint, self.client.get(&endpoint))
            .await?
            .text()
            .await
            .map_err(|source| BackendError::Transport {
                endpoint: endpoint.clone(),
                source,
            })?;
        let country = text.trim().to_string();
        if country.is_empty() {
            return Err(BackendError::Malformed {
                endpoint,
                reason: "empty country code".to_string(),
            });
        }
        Ok(country)
    }
}

pub fn encode_callback_body(proofs: &[Proof]) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(proofs)?;
    Ok(url::form_urlencoded::byte_serialize(json.as_bytes()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::{format_proof, sample_proof};

    #[test]
    fn test_callback_body_is_urlencoded_json_array() {
        let proofs = vec![format_proof(&sample_proof("id1"), "wss://a/ws", None)];

        let body = encode_callback_body(&proofs).unwrap();

        assert!(body.starts_with("%5B%7B"));
        let decoded: String = url::form_urlencoded::parse(format!("p={body}").as_bytes())
            .map(|(_, value)| value.into_owned())
            .collect();
        let round: Vec<Proof> = serde_json::from_str(&decoded).unwrap();
        assert_eq!(round, proofs);
    }

    #[test]
    fn test_status_update_wire_shape() {
        let body = StatusUpdate {
            session_id: "s1",
            status: SessionStatus::ProofSubmitted,
        };

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"sessionId": "s1", "status": "PROOF_SUBMITTED"})
        );
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        let backend = HttpBackend::new(BackendConfig {
            base_url: "http://localhost:9000/".to_string(),
            ..Default::default()
        });

        assert_eq!(
            backend.endpoint("/api/providers/p1"),
            "http://localhost:9000/api/providers/p1"
        );
    }
}
