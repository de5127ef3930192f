// Credential persistence across storage scopes

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;

use super::storage::{MemoryBackend, NamedBackend, SqliteBackend, StorageError};
use super::types::{IssuedTokens, StorageScope, TokenPair, SCOPE_KEY, TOKENS_KEY};
use crate::error::{self, SessionError};

/// Token pair persistence over a priority list of named backends.
///
/// At most one backend holds a token pair at a time. Reads try the preferred
/// scope first and fall back to the remaining backends in list order. Backend
/// failures are logged and read as "no token"; they never reach the caller.
pub struct CredentialStore {
    /// Priority list; the first entry also stores the scope preference
    backends: Vec<NamedBackend>,
}

impl CredentialStore {
    /// Create a store over the given backends
    pub fn new(backends: Vec<NamedBackend>) -> Self {
        Self { backends }
    }

    /// SQLite-backed durable scope plus an in-memory ephemeral scope
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        tracing::info!("Opening credential store: {}", path.display());
        let durable = SqliteBackend::open(path)?;
        Ok(Self::new(vec![
            NamedBackend::new(StorageScope::Durable, Arc::new(durable)),
            NamedBackend::new(StorageScope::Ephemeral, Arc::new(MemoryBackend::new())),
        ]))
    }

    /// Both scopes in memory
    pub fn in_memory() -> Self {
        Self::new(vec![
            NamedBackend::new(StorageScope::Durable, Arc::new(MemoryBackend::new())),
            NamedBackend::new(StorageScope::Ephemeral, Arc::new(MemoryBackend::new())),
        ])
    }

    /// Persist a freshly issued token pair.
    ///
    /// Writes to `scope`, or the stored preference when `None`, then clears
    /// every other backend and remembers the scope.
    pub fn save(
        &self,
        tokens: IssuedTokens,
        scope: Option<StorageScope>,
    ) -> error::Result<TokenPair> {
        if let Some(field) = tokens.missing_field() {
            return Err(SessionError::IncompleteTokens(field));
        }

        let scope = scope.unwrap_or_else(|| self.preferred_scope());
        let pair = tokens.into_pair();
        self.write_pair(&pair, scope)?;

        tracing::debug!(scope = %scope, expires_at = pair.expires_at, "Saved token pair");
        Ok(pair)
    }

    /// Move the current record to another scope without touching its expiry
    pub fn migrate(&self, scope: StorageScope) -> error::Result<()> {
        match self.current() {
            Some(pair) => {
                tracing::info!(scope = %scope, "Migrating token pair");
                self.write_pair(&pair, scope)
            }
            None => {
                self.set_preference(scope);
                Ok(())
            }
        }
    }

    fn write_pair(&self, pair: &TokenPair, scope: StorageScope) -> error::Result<()> {
        let json = serde_json::to_string(pair)
            .map_err(|e| SessionError::Internal(anyhow::anyhow!("Failed to encode token pair: {}", e)))?;

        for named in &self.backends {
            let result = if named.scope == scope {
                named.backend.set(TOKENS_KEY, &json)
            } else {
                named.backend.remove(TOKENS_KEY)
            };
            if let Err(e) = result {
                tracing::warn!(scope = %named.scope, error = %e, "Credential storage write failed");
            }
        }

        self.set_preference(scope);
        Ok(())
    }

    /// Remove the token pair from every backend
    pub fn clear(&self) {
        for named in &self.backends {
            if let Err(e) = named.backend.remove(TOKENS_KEY) {
                tracing::warn!(scope = %named.scope, error = %e, "Failed to clear credentials");
            }
        }
        tracing::debug!("Cleared token pair from all scopes");
    }

    /// Scope recorded by the last save, durable when none was recorded
    pub fn preferred_scope(&self) -> StorageScope {
        let Some(first) = self.backends.first() else {
            return StorageScope::default();
        };

        match first.backend.get(SCOPE_KEY) {
            Ok(Some(value)) => value.parse().unwrap_or_else(|e| {
                tracing::warn!("Ignoring stored scope preference: {}", e);
                StorageScope::default()
            }),
            Ok(None) => StorageScope::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read scope preference");
                StorageScope::default()
            }
        }
    }

    fn set_preference(&self, scope: StorageScope) {
        if let Some(first) = self.backends.first() {
            if let Err(e) = first.backend.set(SCOPE_KEY, scope.as_str()) {
                tracing::warn!(error = %e, "Failed to store scope preference");
            }
        }
    }

    /// Backends in read order: preferred scope first, then the rest
    fn read_order(&self) -> impl Iterator<Item = &NamedBackend> {
        let preferred = self.preferred_scope();
        self.backends
            .iter()
            .filter(move |named| named.scope == preferred)
            .chain(self.backends.iter().filter(move |named| named.scope != preferred))
    }

    fn read_from(named: &NamedBackend) -> Option<TokenPair> {
        let raw = match named.backend.get(TOKENS_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(scope = %named.scope, error = %e, "Credential storage read failed");
                return None;
            }
        };

        match serde_json::from_str::<TokenPair>(&raw) {
            Ok(pair) if pair.is_complete() => Some(pair),
            Ok(_) => {
                tracing::warn!(scope = %named.scope, "Ignoring incomplete token record");
                None
            }
            Err(e) => {
                tracing::warn!(scope = %named.scope, error = %e, "Ignoring malformed token record");
                None
            }
        }
    }

    /// The current valid token pair, if any backend holds one
    pub fn current(&self) -> Option<TokenPair> {
        self.read_order().find_map(Self::read_from)
    }

    /// Scope of the backend currently holding a valid record
    pub fn active_scope(&self) -> Option<StorageScope> {
        self.read_order()
            .find(|named| Self::read_from(named).is_some())
            .map(|named| named.scope)
    }

    pub fn access_token(&self) -> Option<String> {
        self.current().map(|pair| pair.access_token)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.current().map(|pair| pair.refresh_token)
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.current().map(|pair| pair.expires_at)
    }

    /// Whether the access token is expired, or expires within `buffer_seconds`.
    /// No record counts as expired.
    pub fn is_expired(&self, buffer_seconds: i64) -> bool {
        match self.expires_at() {
            Some(expires_at) => {
                Utc::now().timestamp_millis() >= expires_at - buffer_seconds.saturating_mul(1000)
            }
            None => true,
        }
    }
}
