// Authentication module
// Session state, credential persistence, refresh and teardown

mod coordinator;
mod credentials;
mod refresh;
mod store;
mod terminator;
mod types;

pub use coordinator::{RefreshCoordinator, RefreshOutcome};
pub use credentials::{CredentialCache, MemoryCredentialCache, SqliteCredentialCache};
pub use refresh::{login, logout, refresh_session};
pub use store::SessionStore;
pub use terminator::{
    Navigator, NoopSink, Notification, NotificationLevel, NotificationSink, SessionTerminator,
    TeardownReason,
};
pub use types::{Identity, PersistedSession, Role, Session, TokenData, DEFAULT_LIFETIME_SECONDS};
