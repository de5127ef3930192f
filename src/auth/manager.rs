use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Client, Url};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use super::refresh;
use super::scheduler::RenewalScheduler;
use super::store::CredentialStore;
use super::types::{IssuedTokens, RenewalOutcome, StorageScope, TokenPair};
use crate::error::Result;

/// Callback run when the session can no longer be renewed
pub type UnauthorizedHandler = Arc<dyn Fn() + Send + Sync>;

type InFlightRenewal = Shared<BoxFuture<'static, RenewalOutcome>>;

/// Session manager
/// Owns the credential store and renewal timer, and coordinates renewal
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    /// Persisted token pair
    store: CredentialStore,

    /// Proactive renewal timer
    scheduler: RenewalScheduler,

    /// HTTP client for renewal requests
    client: Client,

    /// Renewal endpoint
    renewal_url: Url,

    /// Registered unauthorized handler (last registration wins)
    unauthorized: RwLock<Option<UnauthorizedHandler>>,

    /// Renewal shared by every caller until it resolves
    in_flight: Mutex<Option<InFlightRenewal>>,
}

impl SessionManager {
    /// Create a new SessionManager
    pub fn new(store: CredentialStore, client: Client, renewal_url: Url) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                scheduler: RenewalScheduler::new(),
                client,
                renewal_url,
                unauthorized: RwLock::new(None),
                in_flight: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    pub fn scheduler(&self) -> &RenewalScheduler {
        &self.inner.scheduler
    }

    /// Replace the unauthorized handler; `None` removes it
    pub fn set_unauthorized_handler(&self, handler: Option<UnauthorizedHandler>) {
        let mut slot = self
            .inner
            .unauthorized
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = handler;
    }

    /// Persist tokens from a successful login and schedule their renewal
    pub fn start_session(
        &self,
        tokens: IssuedTokens,
        scope: Option<StorageScope>,
    ) -> Result<TokenPair> {
        let expires_in = tokens.expires_in;
        let pair = self.inner.store.save(tokens, scope)?;
        Inner::arm_renewal(&self.inner, expires_in);
        tracing::info!("Session started");
        Ok(pair)
    }

    /// Re-arm proactive renewal for a previously stored session.
    /// Returns false when no session is stored.
    pub fn resume(&self) -> bool {
        match self.inner.store.current() {
            Some(pair) => {
                let remaining = pair.seconds_remaining();
                tracing::info!(remaining_secs = remaining, "Resuming stored session");
                Inner::arm_renewal(&self.inner, remaining);
                true
            }
            None => {
                tracing::debug!("No stored session to resume");
                false
            }
        }
    }

    /// Drop the session without notifying the unauthorized handler
    pub fn logout(&self) {
        self.inner.store.clear();
        self.inner.scheduler.cancel();
        tracing::info!("Logged out");
    }

    /// Renew the token pair.
    ///
    /// Concurrent callers share a single renewal call and observe the same
    /// outcome. Never fails: a failed renewal tears the session down and
    /// notifies the unauthorized handler once.
    pub async fn renew(&self) -> RenewalOutcome {
        Inner::renewal(&self.inner).await
    }
}

impl Inner {
    /// Join the in-flight renewal, or start one
    fn renewal(this: &Arc<Inner>) -> InFlightRenewal {
        let mut slot = this.in_flight.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(pending) = slot.as_ref() {
            tracing::debug!("Joining in-flight token renewal");
            return pending.clone();
        }

        let renewal = Self::renew_once(Arc::downgrade(this)).boxed().shared();
        *slot = Some(renewal.clone());
        renewal
    }

    /// Run one renewal and release the in-flight slot.
    /// Holds only a weak reference to the manager while the request is out.
    async fn renew_once(weak: Weak<Inner>) -> RenewalOutcome {
        let outcome = Self::attempt_renewal(&weak).await;
        if let Some(inner) = weak.upgrade() {
            inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
        outcome
    }

    async fn attempt_renewal(weak: &Weak<Inner>) -> RenewalOutcome {
        let (client, renewal_url, refresh_token) = {
            let Some(inner) = weak.upgrade() else {
                return RenewalOutcome::Failed;
            };
            let Some(refresh_token) = inner.store.refresh_token() else {
                tracing::warn!("No refresh token available, skipping renewal");
                return RenewalOutcome::Failed;
            };
            (inner.client.clone(), inner.renewal_url.clone(), refresh_token)
        };

        let result = refresh::request_renewal(&client, &renewal_url, &refresh_token).await;

        let Some(inner) = weak.upgrade() else {
            tracing::debug!("Session manager dropped during renewal");
            return RenewalOutcome::Failed;
        };

        let tokens = match result {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::error!("Token renewal failed: {:#}", e);
                inner.end_session();
                return RenewalOutcome::Failed;
            }
        };

        let expires_in = tokens.expires_in;
        if let Err(e) = inner.store.save(tokens, None) {
            tracing::error!("Failed to store renewed tokens: {}", e);
            inner.end_session();
            return RenewalOutcome::Failed;
        }

        Self::arm_renewal(&inner, expires_in);
        RenewalOutcome::Renewed
    }

    /// Tear down after a terminal renewal failure
    fn end_session(&self) {
        self.store.clear();
        self.scheduler.cancel();

        let handler = self
            .unauthorized
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => {
                tracing::warn!("Session is no longer valid, notifying unauthorized handler");
                handler();
            }
            None => tracing::warn!("Session is no longer valid"),
        }
    }

    fn arm_renewal(this: &Arc<Inner>, expires_in: i64) {
        let weak: Weak<Inner> = Arc::downgrade(this);
        this.scheduler.arm(expires_in, async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let renewal = Inner::renewal(&inner);
            drop(inner);
            renewal.await;
        });
    }
}
