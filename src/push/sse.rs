//! Server-sent events transport over reqwest.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, Url};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::debug;

use super::frame::SseCodec;
use super::{PushStream, PushTransport};
use crate::error::ClientError;

/// Opens `GET <base>/api/anomalies/stream` and yields the `data` of every
/// default-type event.
#[derive(Debug, Clone)]
pub struct SseTransport {
    client: Client,
    url: Url,
    connect_timeout: Duration,
}

impl SseTransport {
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self, ClientError> {
        let mut url = Url::parse(base_url)
            .map_err(|e| ClientError::transport(format!("invalid base url '{}': {}", base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::transport(format!("base url '{}' cannot carry a path", base_url)))?
            .pop_if_empty()
            .extend(["api", "anomalies", "stream"]);

        // No overall request timeout: the response body is open-ended.
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ClientError::transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url,
            connect_timeout,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl PushTransport for SseTransport {
    async fn open(&self) -> Result<PushStream, ClientError> {
        let request = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send();

        let response = tokio::time::timeout(self.connect_timeout, request)
            .await
            .map_err(|_| ClientError::Timeout {
                url: self.url.to_string(),
                timeout_ms: self.connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| ClientError::Transport {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Transport {
                status: Some(status.as_u16()),
                message: format!("event stream rejected with status {}", status.as_u16()),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with("text/event-stream") {
            return Err(ClientError::transport(format!(
                "unexpected content type '{}' for event stream",
                content_type
            )));
        }
        debug!(url = %self.url, "event stream opened");

        let bytes = response.bytes_stream().map(|chunk| chunk.map_err(std::io::Error::other));
        let frames = FramedRead::new(StreamReader::new(bytes), SseCodec::new()).filter_map(|frame| {
            let item = match frame {
                Ok(event) if event.is_message() => Some(Ok(event.data)),
                Ok(_) => None,
                Err(e) => Some(Err(ClientError::transport(format!("event stream broken: {}", e)))),
            };
            futures::future::ready(item)
        });

        Ok(Box::pin(frames))
    }
}
