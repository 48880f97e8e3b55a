// Persistent credential cache
// Mirrors the session into a key/value table so a restart can rehydrate it

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use super::types::{Identity, PersistedSession};

const KEY_ACCESS: &str = "session:access_credential";
const KEY_REFRESH: &str = "session:refresh_credential";
const KEY_ISSUED_AT: &str = "session:issued_at";
const KEY_LIFETIME: &str = "session:lifetime_seconds";
const KEY_IDENTITY: &str = "session:identity";

const ALL_KEYS: [&str; 5] = [KEY_ACCESS, KEY_REFRESH, KEY_ISSUED_AT, KEY_LIFETIME, KEY_IDENTITY];

/// Durable storage for session fields.
///
/// Implementations never fail outward: storage errors are logged and a
/// failed `load` is reported as a miss, which forces a fresh login.
pub trait CredentialCache: Send + Sync {
    /// Write the fields that are present; absent fields are left untouched
    fn save(&self, session: &PersistedSession);

    /// Read a complete session, or `None` on miss or unreadable data
    fn load(&self) -> Option<PersistedSession>;

    /// Remove every cached field
    fn wipe(&self);
}

/// Encode the present fields of a partial session as key/value pairs
fn encode(session: &PersistedSession) -> Result<Vec<(&'static str, String)>> {
    let mut entries = Vec::new();

    if let Some(ref access) = session.access_credential {
        entries.push((KEY_ACCESS, access.clone()));
    }
    if let Some(ref refresh) = session.refresh_credential {
        entries.push((KEY_REFRESH, refresh.clone()));
    }
    if let Some(issued_at) = session.issued_at {
        entries.push((KEY_ISSUED_AT, issued_at.to_rfc3339()));
    }
    if let Some(lifetime) = session.lifetime_seconds {
        entries.push((KEY_LIFETIME, lifetime.to_string()));
    }
    if let Some(ref identity) = session.identity {
        let json = serde_json::to_string(identity).context("Failed to serialize identity")?;
        entries.push((KEY_IDENTITY, json));
    }

    Ok(entries)
}

/// Decode cached key/value pairs. Any present-but-unparsable field is an error.
fn decode(values: &HashMap<String, String>) -> Result<PersistedSession> {
    let issued_at = values
        .get(KEY_ISSUED_AT)
        .map(|s| parse_datetime(s))
        .transpose()?;

    let lifetime_seconds = values
        .get(KEY_LIFETIME)
        .map(|s| {
            s.parse::<u64>()
                .with_context(|| format!("Failed to parse lifetime: {}", s))
        })
        .transpose()?;

    let identity = values
        .get(KEY_IDENTITY)
        .map(|s| serde_json::from_str::<Identity>(s).context("Failed to parse cached identity"))
        .transpose()?;

    Ok(PersistedSession {
        access_credential: values.get(KEY_ACCESS).cloned(),
        refresh_credential: values.get(KEY_REFRESH).cloned(),
        issued_at,
        lifetime_seconds,
        identity,
    })
}

/// Turn decoded values into a complete session or a miss
fn complete(values: &HashMap<String, String>) -> Option<PersistedSession> {
    if values.is_empty() {
        return None;
    }

    match decode(values) {
        Ok(session) => {
            if session.clone().into_session().is_some() {
                Some(session)
            } else {
                tracing::warn!("Cached session is missing a credential, ignoring it");
                None
            }
        }
        Err(e) => {
            tracing::warn!("Cached session is unreadable, ignoring it: {:#}", e);
            None
        }
    }
}

/// Parse datetime from RFC 3339, accepting a Z suffix
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    let normalized = if s.ends_with('Z') {
        s.replace('Z', "+00:00")
    } else {
        s.to_string()
    };

    DateTime::parse_from_rfc3339(&normalized)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse datetime: {}", s))
}

/// SQLite-backed cache using an `auth_kv` table
pub struct SqliteCredentialCache {
    /// `None` when the database could not be opened; every load is then a miss
    conn: Mutex<Option<Connection>>,
}

impl SqliteCredentialCache {
    /// Open (or create) the cache database. Never fails: an unusable
    /// database yields a cache that always misses.
    pub fn open(path: &Path) -> Self {
        let conn = match Self::open_connection(path) {
            Ok(conn) => {
                tracing::debug!("Credential cache opened: {}", path.display());
                Some(conn)
            }
            Err(e) => {
                tracing::warn!(
                    "Credential cache unavailable at {}, sessions will not survive restarts: {:#}",
                    path.display(),
                    e
                );
                None
            }
        };

        Self {
            conn: Mutex::new(conn),
        }
    }

    fn open_connection(path: &Path) -> Result<Connection> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create cache directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(conn)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<Option<T>> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(conn) => f(conn).map(Some),
            None => Ok(None),
        }
    }

    fn try_save(&self, session: &PersistedSession) -> Result<()> {
        let entries = encode(session)?;
        self.with_conn(|conn| {
            let tx = conn.transaction().context("Failed to begin transaction")?;
            for (key, value) in &entries {
                tx.execute(
                    "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )
                .with_context(|| format!("Failed to write {}", key))?;
            }
            tx.commit().context("Failed to commit credential cache")
        })?;
        Ok(())
    }

    fn try_load(&self) -> Result<HashMap<String, String>> {
        let values = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT key, value FROM auth_kv WHERE key LIKE 'session:%'")
                .context("Failed to query credential cache")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
                .context("Failed to read credential cache")?;

            let mut values = HashMap::new();
            for row in rows {
                let (key, value) = row.context("Failed to read credential cache row")?;
                values.insert(key, value);
            }
            Ok(values)
        })?;
        Ok(values.unwrap_or_default())
    }

    fn try_wipe(&self) -> Result<()> {
        self.with_conn(|conn| {
            for key in ALL_KEYS {
                conn.execute("DELETE FROM auth_kv WHERE key = ?1", [key])
                    .with_context(|| format!("Failed to delete {}", key))?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

impl CredentialCache for SqliteCredentialCache {
    fn save(&self, session: &PersistedSession) {
        if let Err(e) = self.try_save(session) {
            tracing::warn!("Failed to persist session: {:#}", e);
        }
    }

    fn load(&self) -> Option<PersistedSession> {
        match self.try_load() {
            Ok(values) => complete(&values),
            Err(e) => {
                tracing::warn!("Failed to load cached session: {:#}", e);
                None
            }
        }
    }

    fn wipe(&self) {
        if let Err(e) = self.try_wipe() {
            tracing::warn!("Failed to wipe cached session: {:#}", e);
        }
    }
}

/// In-process cache with the same encoding as the SQLite one.
/// Useful for embedding without a filesystem and for tests.
#[derive(Default)]
pub struct MemoryCredentialCache {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw value under a cache key, bypassing encoding
    pub fn insert_raw(&self, key: &str, value: &str) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    /// Raw value stored under a cache key
    pub fn get_raw(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

impl CredentialCache for MemoryCredentialCache {
    fn save(&self, session: &PersistedSession) {
        match encode(session) {
            Ok(entries) => {
                let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
                for (key, value) in entries {
                    values.insert(key.to_string(), value);
                }
            }
            Err(e) => tracing::warn!("Failed to persist session: {:#}", e),
        }
    }

    fn load(&self) -> Option<PersistedSession> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        complete(&values)
    }

    fn wipe(&self) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
