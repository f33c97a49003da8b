// ============================================================================
// ankisyncd Library
// ============================================================================

pub mod collection;
pub mod config;
pub mod error;
pub mod server;
pub mod session;
pub mod sync;
pub mod users;
pub mod utils;
pub mod worker;

// Re-export main types for convenience
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use server::{SyncApp, router};
pub use session::{MemorySessionStore, Session, SessionStore, SqliteSessionStore};
pub use users::{MemoryUserManager, SqliteUserManager, UserManager};
pub use worker::WorkerPool;
