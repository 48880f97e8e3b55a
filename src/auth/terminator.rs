// Session teardown
// Clears every trace of the session and hands control back to the login screen

use std::sync::{Arc, Mutex, PoisonError};

use super::credentials::CredentialCache;
use super::store::SessionStore;

/// Why the session is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// Credentials could not be refreshed
    SessionExpired,
    /// The user signed out
    LoggedOut,
    /// No usable session at startup
    SignInRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Warning,
}

/// User-facing message pushed to the notification layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

impl Notification {
    /// Message shown for a teardown, if any
    pub fn for_reason(reason: TeardownReason) -> Option<Self> {
        match reason {
            TeardownReason::SessionExpired => Some(Self {
                level: NotificationLevel::Warning,
                message: "Your session has expired. Please sign in again.".to_string(),
            }),
            TeardownReason::LoggedOut => Some(Self {
                level: NotificationLevel::Info,
                message: "You have been signed out.".to_string(),
            }),
            TeardownReason::SignInRequired => None,
        }
    }
}

/// Presentation layer for user-facing messages. Fire-and-forget.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Sink used when no notification layer is wired in
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn notify(&self, notification: Notification) {
        tracing::debug!(message = %notification.message, "Notification dropped (no sink)");
    }
}

/// Route to the login entry point
pub trait Navigator: Send + Sync {
    fn to_login(&self);
}

impl<F> Navigator for F
where
    F: Fn() + Send + Sync,
{
    fn to_login(&self) {
        self()
    }
}

/// Idempotent session teardown.
///
/// Remembers the store epoch it last tore down: any number of calls against
/// the same session, concurrent or not, notify and navigate once. A new
/// login bumps the epoch and re-arms it.
pub struct SessionTerminator {
    store: Arc<SessionStore>,
    cache: Arc<dyn CredentialCache>,
    sink: Arc<dyn NotificationSink>,
    navigator: Arc<dyn Navigator>,
    torn_down_epoch: Mutex<Option<u64>>,
}

impl SessionTerminator {
    pub fn new(
        store: Arc<SessionStore>,
        cache: Arc<dyn CredentialCache>,
        sink: Arc<dyn NotificationSink>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            store,
            cache,
            sink,
            navigator,
            torn_down_epoch: Mutex::new(None),
        }
    }

    /// Tear down the session. Returns true if this call did the work.
    pub fn terminate(&self, reason: TeardownReason) -> bool {
        {
            let mut torn_down = self
                .torn_down_epoch
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            let epoch = self.store.epoch();
            if *torn_down == Some(epoch) {
                tracing::debug!(epoch, ?reason, "Session already torn down");
                return false;
            }

            self.cache.wipe();
            self.store.clear();
            *torn_down = Some(self.store.epoch());
        }

        match reason {
            TeardownReason::SessionExpired => tracing::warn!("Session expired, signing out"),
            TeardownReason::LoggedOut => tracing::info!("Signed out"),
            TeardownReason::SignInRequired => tracing::info!("No session, routing to sign-in"),
        }

        if let Some(notification) = Notification::for_reason(reason) {
            self.sink.notify(notification);
        }
        self.navigator.to_login();
        true
    }
}
