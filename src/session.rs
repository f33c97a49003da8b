//! Authenticated sync sessions and the stores that hold them.
//!
//! A session is created at `hostKey` time and looked up by its host key
//! (collection sub-protocol) or its short session key (media
//! sub-protocol). The per-sync handler state hangs off the session so it
//! survives across the HTTP requests of one sync.

use crate::error::{Result, SyncError};
use crate::sync::SyncState;
use crate::utils::{checksum, int_time};
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

#[derive(Clone)]
pub struct Session {
    pub hkey: String,
    pub skey: String,
    pub username: String,
    /// The user's directory under the data root.
    pub path: PathBuf,
    pub version: Option<i64>,
    pub client_version: Option<String>,
    pub created: i64,
    /// Shared across clones so the sync survives across requests.
    pub sync_state: Arc<Mutex<Option<SyncState>>>,
}

impl Session {
    /// Builds a fresh session and makes sure the user directory exists.
    pub fn new(hkey: String, username: &str, path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path)?;
        Ok(Self {
            hkey,
            skey: generate_session_key(),
            username: username.to_string(),
            path,
            version: None,
            client_version: None,
            created: int_time(1),
            sync_state: Arc::new(Mutex::new(None)),
        })
    }

    pub fn collection_path(&self) -> PathBuf {
        self.path.join("collection.anki2")
    }
}

/// Host key identifying a session: `md5(username ":" unix-seconds ":"
/// 8-random-alphanumeric)`.
pub fn generate_host_key(username: &str) -> String {
    let salt: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let val = format!("{}:{}:{}", username, int_time(1), salt);
    format!("{:x}", md5::compute(val.as_bytes()))
}

/// Short random token for the media sub-protocol: the first 8 hex digits
/// of `sha1` over a random float's decimal form.
pub fn generate_session_key() -> String {
    checksum(thread_rng().r#gen::<f64>().to_string())[..8].to_string()
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, hkey: &str) -> Result<Option<Session>>;
    async fn load_from_skey(&self, skey: &str) -> Result<Option<Session>>;
    async fn save(&self, hkey: &str, session: &Session) -> Result<()>;
    async fn delete(&self, hkey: &str) -> Result<()>;
}

/// Pure in-memory store; sessions die with the process.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, hkey: &str) -> Result<Option<Session>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| SyncError::internal("session store lock poisoned"))?;
        Ok(sessions.get(hkey).cloned())
    }

    async fn load_from_skey(&self, skey: &str) -> Result<Option<Session>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| SyncError::internal("session store lock poisoned"))?;
        Ok(sessions.values().find(|s| s.skey == skey).cloned())
    }

    async fn save(&self, hkey: &str, session: &Session) -> Result<()> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| SyncError::internal("session store lock poisoned"))?;
        sessions.insert(hkey.to_string(), session.clone());
        Ok(())
    }

    async fn delete(&self, hkey: &str) -> Result<()> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| SyncError::internal("session store lock poisoned"))?;
        sessions.remove(hkey);
        Ok(())
    }
}

/// Persists sessions to SQLite so they survive a restart, with a live
/// cache in front: the cached session carries the in-flight sync state, a
/// reconstructed one starts clean.
pub struct SqliteSessionStore {
    cache: RwLock<HashMap<String, Session>>,
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let conn = Connection::open(path.into())?;
        conn.execute_batch(
            "create table if not exists session (
                hkey     text primary key,
                skey     text not null,
                username text not null,
                path     text not null
            );",
        )?;
        Ok(Self {
            cache: RwLock::new(HashMap::new()),
            conn: Mutex::new(conn),
        })
    }

    fn restore(&self, row: (String, String, String, String)) -> Result<Session> {
        let (hkey, skey, username, path) = row;
        let mut session = Session::new(hkey, &username, PathBuf::from(path))?;
        session.skey = skey;
        Ok(session)
    }

    fn cache_get(&self, hkey: &str) -> Result<Option<Session>> {
        let cache = self
            .cache
            .read()
            .map_err(|_| SyncError::internal("session cache lock poisoned"))?;
        Ok(cache.get(hkey).cloned())
    }

    fn cache_put(&self, session: &Session) -> Result<()> {
        let mut cache = self
            .cache
            .write()
            .map_err(|_| SyncError::internal("session cache lock poisoned"))?;
        cache.insert(session.hkey.clone(), session.clone());
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, hkey: &str) -> Result<Option<Session>> {
        if let Some(session) = self.cache_get(hkey)? {
            return Ok(Some(session));
        }
        let row = {
            let conn = self
                .conn
                .lock()
                .map_err(|_| SyncError::internal("session db lock poisoned"))?;
            conn.query_row(
                "select hkey, skey, username, path from session where hkey = ?1",
                params![hkey],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?
        };
        match row {
            Some(row) => {
                let session = self.restore(row)?;
                self.cache_put(&session)?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn load_from_skey(&self, skey: &str) -> Result<Option<Session>> {
        {
            let cache = self
                .cache
                .read()
                .map_err(|_| SyncError::internal("session cache lock poisoned"))?;
            if let Some(session) = cache.values().find(|s| s.skey == skey) {
                return Ok(Some(session.clone()));
            }
        }
        let row = {
            let conn = self
                .conn
                .lock()
                .map_err(|_| SyncError::internal("session db lock poisoned"))?;
            conn.query_row(
                "select hkey, skey, username, path from session where skey = ?1",
                params![skey],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?
        };
        match row {
            Some(row) => {
                let session = self.restore(row)?;
                self.cache_put(&session)?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, hkey: &str, session: &Session) -> Result<()> {
        {
            let conn = self
                .conn
                .lock()
                .map_err(|_| SyncError::internal("session db lock poisoned"))?;
            conn.execute(
                "insert or replace into session (hkey, skey, username, path) values (?1, ?2, ?3, ?4)",
                params![
                    hkey,
                    session.skey,
                    session.username,
                    session.path.to_string_lossy()
                ],
            )?;
        }
        self.cache_put(session)
    }

    async fn delete(&self, hkey: &str) -> Result<()> {
        {
            let conn = self
                .conn
                .lock()
                .map_err(|_| SyncError::internal("session db lock poisoned"))?;
            conn.execute("delete from session where hkey = ?1", params![hkey])?;
        }
        let mut cache = self
            .cache
            .write()
            .map_err(|_| SyncError::internal("session cache lock poisoned"))?;
        cache.remove(hkey);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_keys_are_unique_md5_hex() {
        let a = generate_host_key("alice");
        let b = generate_host_key("alice");
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn session_keys_are_short_hex() {
        let key = generate_session_key();
        assert_eq!(key.len(), 8);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
