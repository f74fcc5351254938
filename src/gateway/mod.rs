//! Fetch gateway -- the client's REST boundary.
//!
//! [`AnomalyApi`] is the seam the mutation coordinator and the dashboard talk
//! through; [`HttpGateway`] is the reqwest-backed implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use tracing::debug;

use crate::error::{ClientError, ValidationError};
use crate::model::{Anomaly, CaptureResult, Envelope};

/// Default deadline for a single REST call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote operations on the anomaly collection.
#[async_trait]
pub trait AnomalyApi: Send + Sync {
    /// `GET /api/anomalies`, validated.
    async fn fetch_all(&self) -> Result<Vec<Anomaly>, ClientError>;

    /// `POST /api/anomalies/{id}/capture`. A `{ success: false }` body is
    /// surfaced as [`ClientError::Domain`].
    async fn capture(&self, anomaly_id: &str) -> Result<Anomaly, ClientError>;
}

/// HTTP implementation of [`AnomalyApi`].
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ClientError::transport(format!("invalid base url '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::transport(format!(
                "base url '{}' cannot carry a path",
                base_url
            )));
        }
        let client = Client::builder()
            .build()
            .map_err(|e| ClientError::transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    /// Build `<base>/api/anomalies[/<extra>...]`, percent-encoding each segment.
    pub(crate) fn endpoint(&self, extra: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["api", "anomalies"]).extend(extra);
        }
        url
    }

    fn map_send_error(&self, url: &Url, e: reqwest::Error) -> ClientError {
        if e.is_timeout() {
            ClientError::Timeout {
                url: url.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            ClientError::Transport {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            }
        }
    }

    /// Send a request and turn the body into an envelope. Non-2xx responses
    /// with a parseable `{ success: false, error }` body become domain errors.
    async fn exchange(&self, request: reqwest::RequestBuilder, url: &Url) -> Result<Envelope, ClientError> {
        let response = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(url, e))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_send_error(url, e))?;
        debug!(%url, status = status.as_u16(), bytes = body.len(), "response received");

        let envelope = serde_json::from_slice::<Value>(&body)
            .map_err(|e| ValidationError::new("response body", e.to_string()))
            .and_then(Envelope::from_value);

        match envelope {
            Ok(env) if !env.success => Err(ClientError::Domain {
                status: status.as_u16(),
                message: env.error_message().unwrap_or("Unknown error").to_string(),
            }),
            Ok(env) if status.is_success() => Ok(env),
            Ok(_) => Err(status_error(status)),
            Err(e) if status.is_success() => Err(e.into()),
            Err(_) => Err(status_error(status)),
        }
    }
}

fn status_error(status: StatusCode) -> ClientError {
    ClientError::Transport {
        status: Some(status.as_u16()),
        message: format!("HTTP error! status: {}", status.as_u16()),
    }
}

#[async_trait]
impl AnomalyApi for HttpGateway {
    async fn fetch_all(&self) -> Result<Vec<Anomaly>, ClientError> {
        let url = self.endpoint(&[]);
        let envelope = self.exchange(self.client.get(url.clone()), &url).await?;
        Ok(envelope.into_anomalies()?)
    }

    async fn capture(&self, anomaly_id: &str) -> Result<Anomaly, ClientError> {
        let url = self.endpoint(&[anomaly_id, "capture"]);
        let envelope = self.exchange(self.client.post(url.clone()), &url).await?;
        match envelope.into_capture_result()? {
            CaptureResult::Captured(anomaly) => Ok(anomaly),
            // `exchange` already turns failed envelopes into domain errors.
            CaptureResult::Failed(message) => Err(ClientError::Domain { status: 200, message }),
        }
    }
}
