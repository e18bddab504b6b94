use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ValidationClient, ValidationVerdict};
use crate::config::ValidationEndpointConfig;
use crate::error::ValidationError;

#[derive(Serialize)]
struct ValidateRequest<'a> {
    code: &'a str,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(alias = "error")]
    message: Option<String>,
}

/// Validates codes against the ticket service's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpValidationClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpValidationClient {
    pub fn new(config: &ValidationEndpointConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build HTTP client with timeout: {}", e);
                reqwest::Client::new()
            });

        Self {
            base_url: config.api_url.clone(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn validate_url(&self) -> String {
        format!("{}/tickets/validate", self.base_url)
    }
}

#[async_trait]
impl ValidationClient for HttpValidationClient {
    async fn submit_code(&self, code: &str) -> Result<ValidationVerdict, ValidationError> {
        let url = self.validate_url();
        tracing::debug!("Validating code against {}", url);

        let resp = self
            .client
            .post(&url)
            .json(&ValidateRequest { code })
            .send()
            .await
            .map_err(|e| ValidationError::Transport {
                message: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .ok()
                .and_then(|e| e.message)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| {
                    status
                        .canonical_reason()
                        .unwrap_or("request failed")
                        .to_string()
                });
            tracing::warn!("Validation request rejected with {}: {}", status, message);
            return Err(ValidationError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        resp.json::<ValidationVerdict>()
            .await
            .map_err(|e| ValidationError::Malformed {
                message: e.to_string(),
            })
    }
}
