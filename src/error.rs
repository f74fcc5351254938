//! Client-side error taxonomy shared by the fetch, capture and push paths.

use thiserror::Error;

/// A payload did not match the expected wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {what}: {reason}")]
pub struct ValidationError {
    /// What was being validated, e.g. `"anomaly"` or `"threat_level_change event"`.
    pub what: &'static str,
    /// Human-readable reason, usually the serde error text.
    pub reason: String,
}

impl ValidationError {
    pub fn new(what: &'static str, reason: impl Into<String>) -> Self {
        Self {
            what,
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by remote calls made on behalf of the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Network failure, or a non-2xx response without a parseable error body.
    #[error("transport failure: {message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },

    /// The call exceeded its deadline.
    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    /// Structured `{ success: false, error }` body returned by the server.
    #[error("{message} (HTTP {status})")]
    Domain { status: u16, message: String },
}

impl ClientError {
    pub fn transport(message: impl Into<String>) -> Self {
        ClientError::Transport {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Transport { status, .. } => *status,
            ClientError::Domain { status, .. } => Some(*status),
            ClientError::Validation(_) | ClientError::Timeout { .. } => None,
        }
    }

    /// The message shown to the user in an error toast.
    ///
    /// Domain errors are forwarded verbatim; everything else gets a generic
    /// message that still tells a timeout apart from other failures.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Domain { message, .. } => message.clone(),
            ClientError::Timeout { .. } => "Request timed out. Please try again.".to_string(),
            ClientError::Transport {
                status: Some(code), ..
            } => format!("Request failed with status {}", code),
            ClientError::Transport { status: None, .. } => {
                "Request failed. Check your connection.".to_string()
            }
            ClientError::Validation(_) => "Received an invalid response from the server".to_string(),
        }
    }
}
