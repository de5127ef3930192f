// Authentication types

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Storage key holding the persisted token pair
pub const TOKENS_KEY: &str = "auth_tokens";

/// Storage key holding the scope preference
pub const SCOPE_KEY: &str = "auth_storage_scope";

/// Lifetime of the storage a token pair is persisted in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StorageScope {
    /// Survives process restarts
    #[default]
    Durable,

    /// Cleared when the process ends
    Ephemeral,
}

impl StorageScope {
    /// Persisted name of the scope
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageScope::Durable => "local",
            StorageScope::Ephemeral => "session",
        }
    }
}

impl fmt::Display for StorageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" | "durable" => Ok(StorageScope::Durable),
            "session" | "ephemeral" => Ok(StorageScope::Ephemeral),
            other => Err(format!("unknown storage scope: {}", other)),
        }
    }
}

/// Tokens as handed out by a login or renewal response
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime of the access token in seconds
    pub expires_in: i64,
}

impl IssuedTokens {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_in: i64,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_in,
        }
    }

    /// Name of the first missing field, if any
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.access_token.is_empty() {
            Some("access_token")
        } else if self.refresh_token.is_empty() {
            Some("refresh_token")
        } else if self.expires_in == 0 {
            Some("expires_in")
        } else {
            None
        }
    }

    /// Stamp the tokens with an absolute expiry computed from now
    pub fn into_pair(self) -> TokenPair {
        let expires_at = Utc::now().timestamp_millis() + self.expires_in.saturating_mul(1000);
        TokenPair {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
        }
    }
}

/// Persisted token pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    /// Absolute expiry in epoch milliseconds
    #[serde(default)]
    pub expires_at: i64,
}

impl TokenPair {
    /// A record counts only when every field is populated
    pub fn is_complete(&self) -> bool {
        !self.access_token.is_empty() && !self.refresh_token.is_empty() && self.expires_at != 0
    }

    /// Whole seconds until expiry, negative once expired
    pub fn seconds_remaining(&self) -> i64 {
        (self.expires_at - Utc::now().timestamp_millis()) / 1000
    }
}

/// Renewal endpoint request
#[derive(Serialize)]
pub struct RenewalRequest<'a> {
    pub refresh_token: &'a str,
}

/// Renewal endpoint response
#[derive(Debug, Deserialize)]
pub struct RenewalResponse {
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
}

impl RenewalResponse {
    /// Convert into issued tokens when every field is present and non-empty
    pub fn into_tokens(self) -> Option<IssuedTokens> {
        let tokens = IssuedTokens {
            access_token: self.token?,
            refresh_token: self.refresh_token?,
            expires_in: self.expires_in?,
        };
        match tokens.missing_field() {
            Some(_) => None,
            None => Some(tokens),
        }
    }
}

/// Result of a renewal attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    Renewed,
    Failed,
}

impl RenewalOutcome {
    pub fn is_renewed(&self) -> bool {
        matches!(self, RenewalOutcome::Renewed)
    }
}
