use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Client, Url};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::credentials::CredentialCache;
use super::refresh;
use super::store::SessionStore;
use super::terminator::{SessionTerminator, TeardownReason};
use super::types::PersistedSession;
use crate::error::RefreshFailure;

/// Result every waiter of one refresh exchange receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The store now holds a fresh access credential
    Refreshed,
    /// No usable session; teardown has already been triggered if needed
    Failed(RefreshFailure),
}

type SharedOutcome = Shared<BoxFuture<'static, RefreshOutcome>>;

/// The in-flight exchange. At most one exists at a time.
struct PendingRefresh {
    generation: u64,
    outcome: SharedOutcome,
}

struct CoordinatorInner {
    client: Client,
    base_url: Url,
    store: Arc<SessionStore>,
    cache: Arc<dyn CredentialCache>,
    terminator: Arc<SessionTerminator>,
    timeout: Duration,
    pending: Mutex<Option<PendingRefresh>>,
    generation: AtomicU64,
}

/// Refresh coordinator
/// Single-flight credential refresh: the first caller to observe an expiry
/// starts the exchange, everyone arriving while it runs awaits the same one.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RefreshCoordinator {
    pub fn new(
        client: Client,
        base_url: Url,
        store: Arc<SessionStore>,
        cache: Arc<dyn CredentialCache>,
        terminator: Arc<SessionTerminator>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                client,
                base_url,
                store,
                cache,
                terminator,
                timeout,
                pending: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// True while an exchange is in flight
    pub fn is_refreshing(&self) -> bool {
        self.inner.lock_pending().is_some()
    }

    /// Number of refresh episodes started since creation
    pub fn exchange_count(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Refresh after the server rejected `presented`.
    ///
    /// Joins the pending exchange if there is one. Otherwise, if another
    /// caller already replaced that credential, returns `Refreshed` at once
    /// without a new exchange.
    pub async fn refresh_after(&self, presented: Option<&str>) -> RefreshOutcome {
        // Start-or-attach is decided entirely under the lock, with no await
        let outcome = {
            let mut pending = self.inner.lock_pending();

            if let Some(existing) = pending.as_ref() {
                // Stale callers attach too: the current credential is the
                // one being replaced, so retrying with it would only 401 again
                tracing::debug!(
                    generation = existing.generation,
                    "Attaching to in-flight refresh"
                );
                existing.outcome.clone()
            } else if self.inner.is_superseded(presented) {
                tracing::debug!("Credential already refreshed, skipping exchange");
                return RefreshOutcome::Refreshed;
            } else {
                let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let outcome = self.spawn_exchange(generation);
                *pending = Some(PendingRefresh {
                    generation,
                    outcome: outcome.clone(),
                });
                outcome
            }
        };

        outcome.await
    }

    /// Run the exchange in its own task so dropped waiters cannot cancel it
    fn spawn_exchange(&self, generation: u64) -> SharedOutcome {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let outcome = inner.run_exchange(generation).await;
            inner.finish(generation);
            outcome
        });

        async move {
            handle.await.unwrap_or_else(|e| {
                tracing::error!("Refresh task failed: {}", e);
                RefreshOutcome::Failed(RefreshFailure::Transport(format!(
                    "refresh task failed: {}",
                    e
                )))
            })
        }
        .boxed()
        .shared()
    }
}

impl CoordinatorInner {
    fn lock_pending(&self) -> MutexGuard<'_, Option<PendingRefresh>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True when the store already holds a different credential than the
    /// one the server rejected
    fn is_superseded(&self, presented: Option<&str>) -> bool {
        self.store
            .access_credential()
            .is_some_and(|current| presented != Some(current.as_str()))
    }

    /// Back to idle, unless a newer exchange already took the slot
    fn finish(&self, generation: u64) {
        let mut pending = self.lock_pending();
        if pending.as_ref().map(|p| p.generation) == Some(generation) {
            *pending = None;
        }
    }

    /// Refresh credential from the store, or from the persistent cache when
    /// the store is empty. A cache hit rehydrates the store.
    fn refresh_credential(&self) -> Option<String> {
        if let Some(refresh) = self.store.refresh_credential() {
            return Some(refresh);
        }

        let session = self.cache.load().and_then(PersistedSession::into_session)?;
        tracing::info!("Session store empty, rehydrating from credential cache for refresh");
        let refresh = session.refresh_credential.clone();
        self.store.set(session);
        Some(refresh)
    }

    async fn run_exchange(&self, generation: u64) -> RefreshOutcome {
        tracing::debug!(generation, "Starting refresh exchange");

        let refresh_credential = self.refresh_credential();
        let epoch = self.store.epoch();

        let result = match refresh_credential {
            Some(ref refresh) => {
                refresh::refresh_session(&self.client, &self.base_url, refresh, self.timeout)
                    .await
            }
            None => Err(RefreshFailure::NoRefreshCredential),
        };

        match result {
            Ok(token_data) => {
                let persisted = PersistedSession {
                    access_credential: Some(token_data.access_credential.clone()),
                    refresh_credential: token_data.refresh_credential.clone(),
                    lifetime_seconds: Some(token_data.lifetime_seconds),
                    ..Default::default()
                };

                let updated = self.store.update_credentials_at(
                    epoch,
                    token_data.access_credential,
                    token_data.refresh_credential,
                    token_data.lifetime_seconds,
                );

                if !updated {
                    tracing::warn!(generation, "Session changed during refresh, discarding result");
                    return RefreshOutcome::Failed(RefreshFailure::SessionCleared);
                }

                let issued_at = self.store.get().map(|s| s.issued_at);
                self.cache.save(&PersistedSession {
                    issued_at,
                    ..persisted
                });

                tracing::info!(generation, "Refresh exchange succeeded");
                RefreshOutcome::Refreshed
            }
            Err(failure) => {
                tracing::error!(generation, error = %failure, "Refresh exchange failed");

                if self.store.epoch() != epoch {
                    tracing::warn!(generation, "Session changed during refresh, skipping teardown");
                    return RefreshOutcome::Failed(RefreshFailure::SessionCleared);
                }

                self.terminator.terminate(TeardownReason::SessionExpired);
                RefreshOutcome::Failed(failure)
            }
        }
    }
}
