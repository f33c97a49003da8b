//! User authentication. The server only needs two answers: are these
//! credentials valid, and which directory under the data root belongs to
//! this user.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};
use tracing::info;

#[async_trait]
pub trait UserManager: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> Result<bool>;
    /// The on-disk directory name for `username`, or `None` when unknown.
    async fn userdir(&self, username: &str) -> Result<Option<String>>;
}

/// Accounts in a small SQLite database with bcrypt password hashes.
pub struct SqliteUserManager {
    conn: Mutex<Connection>,
}

impl SqliteUserManager {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let conn = Connection::open(path.into())?;
        conn.execute_batch(
            "create table if not exists auth (
                username text primary key,
                hash     text not null
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn add_user(&self, username: &str, password: &str) -> Result<()> {
        let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| SyncError::internal(format!("password hashing failed: {e}")))?;
        self.conn()?.execute(
            "insert or replace into auth (username, hash) values (?1, ?2)",
            params![username, hash],
        )?;
        Ok(())
    }

    pub fn del_user(&self, username: &str) -> Result<bool> {
        let removed = self
            .conn()?
            .execute("delete from auth where username = ?1", params![username])?;
        Ok(removed > 0)
    }

    pub fn set_password(&self, username: &str, password: &str) -> Result<bool> {
        let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| SyncError::internal(format!("password hashing failed: {e}")))?;
        let updated = self.conn()?.execute(
            "update auth set hash = ?1 where username = ?2",
            params![hash, username],
        )?;
        Ok(updated > 0)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::internal("auth db lock poisoned"))
    }

    fn hash_for(&self, username: &str) -> Result<Option<String>> {
        let hash = self
            .conn()?
            .query_row(
                "select hash from auth where username = ?1",
                params![username],
                |r| r.get(0),
            )
            .optional()?;
        Ok(hash)
    }
}

#[async_trait]
impl UserManager for SqliteUserManager {
    async fn authenticate(&self, username: &str, password: &str) -> Result<bool> {
        let Some(hash) = self.hash_for(username)? else {
            info!(username, "authentication failed: unknown user");
            return Ok(false);
        };
        let ok = bcrypt::verify(password, &hash)
            .map_err(|e| SyncError::internal(format!("password verification failed: {e}")))?;
        if !ok {
            info!(username, "authentication failed: wrong password");
        }
        Ok(ok)
    }

    async fn userdir(&self, username: &str) -> Result<Option<String>> {
        Ok(self.hash_for(username)?.map(|_| username.to_string()))
    }
}

/// In-memory accounts for tests and throwaway setups; passwords are kept
/// as plain text.
#[derive(Default)]
pub struct MemoryUserManager {
    users: RwLock<HashMap<String, String>>,
}

impl MemoryUserManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(username: &str, password: &str) -> Self {
        let manager = Self::new();
        manager.add_user(username, password);
        manager
    }

    pub fn add_user(&self, username: &str, password: &str) {
        self.users
            .write()
            .expect("user map lock")
            .insert(username.to_string(), password.to_string());
    }
}

#[async_trait]
impl UserManager for MemoryUserManager {
    async fn authenticate(&self, username: &str, password: &str) -> Result<bool> {
        let users = self
            .users
            .read()
            .map_err(|_| SyncError::internal("user map lock poisoned"))?;
        Ok(users.get(username).map(String::as_str) == Some(password))
    }

    async fn userdir(&self, username: &str) -> Result<Option<String>> {
        let users = self
            .users
            .read()
            .map_err(|_| SyncError::internal("user map lock poisoned"))?;
        Ok(users.contains_key(username).then(|| username.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn sqlite_round_trip() {
        let dir = TempDir::new().unwrap();
        let users = SqliteUserManager::open(dir.path().join("auth.db")).unwrap();
        users.add_user("alice", "secret").unwrap();

        assert!(users.authenticate("alice", "secret").await.unwrap());
        assert!(!users.authenticate("alice", "wrong").await.unwrap());
        assert!(!users.authenticate("bob", "secret").await.unwrap());
        assert_eq!(
            users.userdir("alice").await.unwrap(),
            Some("alice".to_string())
        );
        assert_eq!(users.userdir("bob").await.unwrap(), None);

        assert!(users.set_password("alice", "rotated").unwrap());
        assert!(users.authenticate("alice", "rotated").await.unwrap());
        assert!(users.del_user("alice").unwrap());
        assert!(!users.authenticate("alice", "rotated").await.unwrap());
    }
}
