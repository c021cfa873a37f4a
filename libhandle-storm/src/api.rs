use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::types::UpstreamConfig;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Request timed out")]
    Timeout,
    #[error("Request failed: {0}")]
    Transport(String),
    #[error("Malformed response body: {0}")]
    MalformedBody(String),
}

/// What the upstream said about one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    /// The API's own result code, present on parsed 200 responses.
    pub code: Option<i64>,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ValidateBody {
    code: i64,
    #[serde(default)]
    message: Option<String>,
}

/// The network call behind a check. Only the HTTP implementation talks to the wire.
#[async_trait]
pub trait NameApi: Send + Sync {
    async fn validate(&self, url: &str, credential: Option<&str>) -> Result<ApiResponse, ApiError>;
}

pub struct HttpApi {
    client: Client,
    credential_header: String,
    credential_format: String,
    timeout: Duration,
}

impl HttpApi {
    pub fn new(client: Client, upstream: &UpstreamConfig, timeout: Duration) -> Self {
        Self {
            client,
            credential_header: upstream.credential_header.clone(),
            credential_format: upstream.credential_format.clone(),
            timeout,
        }
    }
}

#[async_trait]
impl NameApi for HttpApi {
    async fn validate(&self, url: &str, credential: Option<&str>) -> Result<ApiResponse, ApiError> {
        let mut request = self.client.get(url);
        if let Some(token) = credential {
            request = request.header(
                self.credential_header.as_str(),
                self.credential_format.replace("{token}", token),
            );
        }

        let response = match tokio::time::timeout(self.timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => return Err(ApiError::Timeout),
            Ok(Err(e)) => return Err(ApiError::Transport(e.to_string())),
            Err(_) => return Err(ApiError::Timeout),
        };

        let status = response.status();
        if status != StatusCode::OK {
            return Ok(ApiResponse {
                status: status.as_u16(),
                code: None,
                message: None,
            });
        }

        let body = match tokio::time::timeout(self.timeout, response.text()).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => return Err(ApiError::Transport(e.to_string())),
            Err(_) => return Err(ApiError::Timeout),
        };
        let parsed: ValidateBody =
            serde_json::from_str(&body).map_err(|e| ApiError::MalformedBody(e.to_string()))?;

        Ok(ApiResponse {
            status: status.as_u16(),
            code: Some(parsed.code),
            message: parsed.message,
        })
    }
}
