// In-memory session store

use chrono::Utc;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::types::{Identity, Session};

#[derive(Default)]
struct StoreState {
    session: Option<Session>,
    epoch: u64,
}

/// Session store
/// Owns the single live session. Never held across an await point, so a
/// reader either sees the session before a write or after it, never halfway.
#[derive(Default)]
pub struct SessionStore {
    state: RwLock<StoreState>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the whole session (login, rehydration)
    pub fn set(&self, session: Session) {
        let mut state = self.write();
        state.session = Some(session);
        state.epoch += 1;
        tracing::debug!(epoch = state.epoch, "Session stored");
    }

    /// Snapshot of the current session
    pub fn get(&self) -> Option<Session> {
        self.read().session.clone()
    }

    /// Remove the session. Clearing an empty store is a no-op.
    pub fn clear(&self) {
        let mut state = self.write();
        if state.session.take().is_some() {
            state.epoch += 1;
            tracing::debug!(epoch = state.epoch, "Session cleared");
        }
    }

    /// Swap in refreshed credentials, keeping the identity.
    /// A `None` refresh credential keeps the current one (no rotation).
    /// Returns false if there is no session to update.
    pub fn update_credentials(
        &self,
        access_credential: String,
        refresh_credential: Option<String>,
        lifetime_seconds: u64,
    ) -> bool {
        self.update(None, access_credential, refresh_credential, lifetime_seconds)
    }

    /// Like `update_credentials`, but only if the store is still at `epoch`.
    /// Keeps a slow refresh from overwriting a session that replaced the one
    /// it started from.
    pub fn update_credentials_at(
        &self,
        epoch: u64,
        access_credential: String,
        refresh_credential: Option<String>,
        lifetime_seconds: u64,
    ) -> bool {
        self.update(Some(epoch), access_credential, refresh_credential, lifetime_seconds)
    }

    fn update(
        &self,
        expected_epoch: Option<u64>,
        access_credential: String,
        refresh_credential: Option<String>,
        lifetime_seconds: u64,
    ) -> bool {
        let mut state = self.write();
        if expected_epoch.is_some_and(|epoch| epoch != state.epoch) {
            return false;
        }
        match state.session.as_mut() {
            Some(session) => {
                session.access_credential = access_credential;
                if let Some(refresh) = refresh_credential {
                    session.refresh_credential = refresh;
                }
                session.lifetime_seconds = lifetime_seconds;
                session.issued_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn access_credential(&self) -> Option<String> {
        self.read()
            .session
            .as_ref()
            .map(|s| s.access_credential.clone())
            .filter(|c| !c.is_empty())
    }

    pub fn refresh_credential(&self) -> Option<String> {
        self.read()
            .session
            .as_ref()
            .map(|s| s.refresh_credential.clone())
            .filter(|c| !c.is_empty())
    }

    pub fn identity(&self) -> Option<Identity> {
        self.read().session.as_ref().and_then(|s| s.identity.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.read().session.is_some()
    }

    /// Counter bumped on every set and effective clear
    pub fn epoch(&self) -> u64 {
        self.read().epoch
    }

    /// Run `f` against the session while holding the read lock.
    /// Used for header attachment so a concurrent clear cannot interleave.
    pub fn with_session<R>(&self, f: impl FnOnce(Option<&Session>) -> R) -> R {
        let state = self.read();
        f(state.session.as_ref())
    }
}
