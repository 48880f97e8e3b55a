// Authentication types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default access credential lifetime when the server omits one
pub const DEFAULT_LIFETIME_SECONDS: u64 = 3600;

/// Role of the authenticated user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    #[serde(other)]
    Standard,
}

/// Authenticated user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub role: Role,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Live session held by the session store.
///
/// Both credentials always travel together: a store either holds a whole
/// `Session` or nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub access_credential: String,
    pub refresh_credential: String,
    pub issued_at: DateTime<Utc>,
    pub lifetime_seconds: u64,
    pub identity: Option<Identity>,
}

impl Session {
    pub fn new(
        access_credential: String,
        refresh_credential: String,
        lifetime_seconds: u64,
        identity: Option<Identity>,
    ) -> Self {
        Self {
            access_credential,
            refresh_credential,
            issued_at: Utc::now(),
            lifetime_seconds,
            identity,
        }
    }

    /// Estimated expiry. Advisory only; the server's 401 is authoritative.
    /// A lifetime past the representable range never expires.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.checked_expires_at().unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn checked_expires_at(&self) -> Option<DateTime<Utc>> {
        self.issued_at.checked_add_signed(seconds(self.lifetime_seconds)?)
    }

    /// Check if the access credential expires within `threshold_secs`
    pub fn is_expiring_soon(&self, threshold_secs: u64) -> bool {
        let Some(expires_at) = self.checked_expires_at() else {
            return false;
        };

        match seconds(threshold_secs).and_then(|t| Utc::now().checked_add_signed(t)) {
            Some(horizon) => expires_at <= horizon,
            None => true,
        }
    }

    /// Partial form of this session for the persistent cache
    pub fn to_persisted(&self) -> PersistedSession {
        PersistedSession {
            access_credential: Some(self.access_credential.clone()),
            refresh_credential: Some(self.refresh_credential.clone()),
            issued_at: Some(self.issued_at),
            lifetime_seconds: Some(self.lifetime_seconds),
            identity: self.identity.clone(),
        }
    }
}

/// `Duration` from unsigned seconds, `None` when out of range
fn seconds(secs: u64) -> Option<Duration> {
    i64::try_from(secs).ok().and_then(Duration::try_seconds)
}

/// Partial session as mirrored into the persistent cache
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedSession {
    pub access_credential: Option<String>,
    pub refresh_credential: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    pub lifetime_seconds: Option<u64>,
    pub identity: Option<Identity>,
}

impl PersistedSession {
    /// Promote to a live session. Requires both credentials.
    pub fn into_session(self) -> Option<Session> {
        match (self.access_credential, self.refresh_credential) {
            (Some(access), Some(refresh)) if !access.is_empty() && !refresh.is_empty() => {
                Some(Session {
                    access_credential: access,
                    refresh_credential: refresh,
                    issued_at: self.issued_at.unwrap_or_else(Utc::now),
                    lifetime_seconds: self.lifetime_seconds.unwrap_or(DEFAULT_LIFETIME_SECONDS),
                    identity: self.identity,
                })
            }
            _ => None,
        }
    }
}

/// Token data from a successful refresh exchange
#[derive(Debug, Clone)]
pub struct TokenData {
    pub access_credential: String,
    /// `None` when the server does not rotate refresh credentials
    pub refresh_credential: Option<String>,
    pub lifetime_seconds: u64,
}

/// `POST /auth/refresh` and `POST /auth/logout` body
#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_credential: &'a str,
}

/// `POST /auth/refresh` response
#[derive(Deserialize)]
pub struct RefreshResponse {
    pub access_credential: String,
    pub refresh_credential: Option<String>,
    pub lifetime_seconds: Option<u64>,
}

/// `POST /auth/login` body
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// `POST /auth/login` response
#[derive(Deserialize)]
pub struct LoginResponse {
    pub access_credential: String,
    pub refresh_credential: String,
    pub lifetime_seconds: Option<u64>,
    pub user: Identity,
}
