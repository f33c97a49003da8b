//! Full-collection replacement: upload swaps the live database file after
//! an integrity check, download streams it back. Both run on the
//! collection's worker, whose serialization is what keeps the swap safe
//! against concurrent sync steps.

use crate::error::{Result, SyncError};
use crate::session::Session;
use crate::sync::SyncOutput;
use crate::worker::WorkerContext;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Clone, Default)]
pub struct FullSyncManager;

impl FullSyncManager {
    /// Replaces the collection with the uploaded database. The payload is
    /// verified in a temp file first; the live file is only touched after
    /// it passes, and the temp file never survives either way.
    pub fn upload(
        &self,
        ctx: &mut WorkerContext,
        data: &[u8],
        session: &Session,
    ) -> Result<SyncOutput> {
        let col_path = session.collection_path();
        let temp_path = temp_upload_path(&col_path);

        if let Err(err) = std::fs::write(&temp_path, data) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(err.into());
        }
        if !integrity_ok(&temp_path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(SyncError::bad_request(
                "uploaded collection failed the integrity check",
            ));
        }

        // Release our handle before the swap; the worker reopens the new
        // file lazily on the next request.
        ctx.close_collection()?;
        if let Err(err) = std::fs::rename(&temp_path, &col_path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(err.into());
        }
        info!(username = %session.username, "collection replaced by full upload");
        Ok(SyncOutput::Text("OK".to_string()))
    }

    /// The raw bytes of the collection database. Running on the worker
    /// guarantees no writer is mid-transaction.
    pub fn download(&self, ctx: &mut WorkerContext, session: &Session) -> Result<SyncOutput> {
        // Make sure the collection exists and its cached state is flushed.
        ctx.collection()?.save()?;
        let data = std::fs::read(session.collection_path())?;
        info!(username = %session.username, bytes = data.len(), "collection downloaded");
        Ok(SyncOutput::Bytes(data))
    }
}

fn temp_upload_path(col_path: &Path) -> PathBuf {
    let mut name = col_path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn integrity_ok(path: &Path) -> bool {
    let Ok(db) = Connection::open(path) else {
        return false;
    };
    db.pragma_query_value(None, "integrity_check", |row| row.get::<_, String>(0))
        .map(|verdict| verdict == "ok")
        .unwrap_or(false)
}
