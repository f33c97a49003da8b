use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

/// Which session store backs the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBackend {
    Memory,
    Sqlite,
}

impl SessionBackend {
    fn from_env(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            _ => Err(anyhow::anyhow!(
                "ANKISYNCD_SESSION_MANAGER must be one of: memory, sqlite"
            )),
        }
    }
}

/// Which user manager backs authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserBackend {
    Sqlite,
}

impl UserBackend {
    fn from_env(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            _ => Err(anyhow::anyhow!("ANKISYNCD_USER_MANAGER must be: sqlite")),
        }
    }
}

/// Which full-sync manager performs collection replacement. A single
/// implementation ships today; the selector exists so deployments that
/// pin it by name keep working.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullSyncBackend {
    Default,
}

impl FullSyncBackend {
    fn from_env(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            _ => Err(anyhow::anyhow!(
                "ANKISYNCD_FULL_SYNC_MANAGER must be: default"
            )),
        }
    }
}

/// Flat key/value server configuration. Every key can be overridden through
/// the environment with the `ANKISYNCD_` prefix, e.g.
/// `ANKISYNCD_SESSION_MANAGER=sqlite`. A `.env` file in the working
/// directory is honored.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub host: String,
    pub port: u16,
    pub base_url: String,
    pub base_media_url: String,
    pub data_root: PathBuf,
    pub session_manager: SessionBackend,
    pub user_manager: UserBackend,
    pub full_sync_manager: FullSyncBackend,
    pub auth_db_path: PathBuf,
    pub session_db_path: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let host = var("HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port = var("PORT")
            .unwrap_or_else(|| "27701".to_string())
            .parse::<u16>()
            .context("ANKISYNCD_PORT must be a valid u16")?;

        let base_url = with_trailing_slash(var("BASE_URL").unwrap_or_else(|| "/sync/".to_string()));
        let base_media_url =
            with_trailing_slash(var("BASE_MEDIA_URL").unwrap_or_else(|| "/msync/".to_string()));

        let data_root = PathBuf::from(var("DATA_ROOT").unwrap_or_else(|| "collections".to_string()));

        let session_manager =
            SessionBackend::from_env(&var("SESSION_MANAGER").unwrap_or_else(|| "memory".to_string()))?;
        let user_manager =
            UserBackend::from_env(&var("USER_MANAGER").unwrap_or_else(|| "sqlite".to_string()))?;
        let full_sync_manager = FullSyncBackend::from_env(
            &var("FULL_SYNC_MANAGER").unwrap_or_else(|| "default".to_string()),
        )?;

        let auth_db_path = PathBuf::from(var("AUTH_DB_PATH").unwrap_or_else(|| "auth.db".to_string()));
        let session_db_path =
            PathBuf::from(var("SESSION_DB_PATH").unwrap_or_else(|| "session.db".to_string()));

        Ok(Self {
            host,
            port,
            base_url,
            base_media_url,
            data_root,
            session_manager,
            user_manager,
            full_sync_manager,
            auth_db_path,
            session_db_path,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 27701,
            base_url: "/sync/".to_string(),
            base_media_url: "/msync/".to_string(),
            data_root: PathBuf::from("collections"),
            session_manager: SessionBackend::Memory,
            user_manager: UserBackend::Sqlite,
            full_sync_manager: FullSyncBackend::Default,
            auth_db_path: PathBuf::from("auth.db"),
            session_db_path: PathBuf::from("session.db"),
        }
    }
}

fn var(key: &str) -> Option<String> {
    env::var(format!("ANKISYNCD_{key}")).ok()
}

fn with_trailing_slash(mut url: String) -> String {
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_urls_get_a_trailing_slash() {
        assert_eq!(with_trailing_slash("/sync".to_string()), "/sync/");
        assert_eq!(with_trailing_slash("/sync/".to_string()), "/sync/");
    }

    #[test]
    fn backend_selectors_are_an_enumerated_set() {
        assert_eq!(
            SessionBackend::from_env("Memory").unwrap(),
            SessionBackend::Memory
        );
        assert_eq!(
            SessionBackend::from_env("sqlite").unwrap(),
            SessionBackend::Sqlite
        );
        assert!(SessionBackend::from_env("redis").is_err());
        assert!(UserBackend::from_env("ldap").is_err());
        assert_eq!(
            FullSyncBackend::from_env("default").unwrap(),
            FullSyncBackend::Default
        );
        assert!(FullSyncBackend::from_env("rsync").is_err());
    }
}
