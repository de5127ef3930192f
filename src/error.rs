// Error handling module
// Defines the typed errors surfaced to callers of the session layer

use std::fmt;
use thiserror::Error;

/// Response body, parsed as JSON when possible
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(serde_json::Value),
    Text(String),
    Empty,
}

impl ResponseBody {
    /// Parse raw bytes: JSON if it parses, otherwise text
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() {
            return ResponseBody::Empty;
        }
        match serde_json::from_str(raw) {
            Ok(value) => ResponseBody::Json(value),
            Err(_) => ResponseBody::Text(raw.to_string()),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ResponseBody::Empty)
    }
}

impl fmt::Display for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Json(value) => write!(f, "{}", value),
            ResponseBody::Text(text) => f.write_str(text),
            ResponseBody::Empty => Ok(()),
        }
    }
}

/// Errors surfaced by the session layer
#[derive(Error, Debug)]
pub enum SessionError {
    /// Non-success HTTP response
    #[error("HTTP error: {status} - {body}")]
    Http { status: u16, body: ResponseBody },

    /// Transport-level failure
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Target could not be resolved to a URL
    #[error("Invalid request target: {0}")]
    InvalidTarget(String),

    /// Caller-supplied header could not be used
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Token pair missing a required field
    #[error("Incomplete token pair: missing {0}")]
    IncompleteTokens(&'static str),

    /// Response body did not match the expected shape
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SessionError {
    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            SessionError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Parsed response body carried by the error, if any
    pub fn body(&self) -> Option<&ResponseBody> {
        match self {
            SessionError::Http { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
