//! Media index for one collection: a small SQLite database mapping
//! filenames to USNs and checksums, next to the media directory itself.
//! A row with a NULL checksum is a tombstone.

use crate::error::Result;
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};

pub struct MediaManager {
    dir: PathBuf,
    db_path: PathBuf,
    db: Option<Connection>,
}

const MEDIA_SCHEMA: &str = r#"
create table if not exists media (
    fname text not null primary key,
    usn   int not null,
    csum  text
);
"#;

impl MediaManager {
    /// Derives the media paths for the collection at `col_path`; the
    /// database is opened on demand.
    pub fn new(col_path: &Path) -> Self {
        let parent = col_path.parent().unwrap_or_else(|| Path::new("."));
        Self {
            dir: parent.join("collection.media"),
            db_path: parent.join("collection.media.db2"),
            db: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.db.is_some()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full path of a media file inside the media directory.
    pub fn media_path(&self, fname: &str) -> PathBuf {
        self.dir.join(fname)
    }

    /// Opens the media database, creating it and the media directory if
    /// needed. Idempotent.
    pub fn connect(&mut self) -> Result<()> {
        if self.db.is_none() {
            std::fs::create_dir_all(&self.dir)?;
            let db = Connection::open(&self.db_path)?;
            db.execute_batch(MEDIA_SCHEMA)?;
            self.db = Some(db);
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.db = None;
    }

    fn conn(&mut self) -> Result<&Connection> {
        self.connect()?;
        Ok(self.db.as_ref().expect("media db open after connect"))
    }

    /// Highest USN the media index has handed out.
    pub fn last_usn(&mut self) -> Result<i64> {
        let usn = self
            .conn()?
            .query_row("select coalesce(max(usn), 0) from media", [], |r| r.get(0))?;
        Ok(usn)
    }

    /// Number of live (non-tombstone) files.
    pub fn media_count(&mut self) -> Result<i64> {
        let count = self.conn()?.query_row(
            "select count(*) from media where csum is not null",
            [],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Marks `fname` as deleted and removes it from the media directory if
    /// present. Always advances the USN, whether or not the file was known.
    pub fn sync_delete(&mut self, fname: &str) -> Result<()> {
        let path = self.media_path(fname);
        if path.exists() {
            if let Err(err) = std::fs::remove_file(&path) {
                tracing::error!(file = fname, error = %err, "could not remove media file");
            }
        }
        let next = self.last_usn()? + 1;
        self.conn()?.execute(
            "insert or replace into media (fname, usn, csum) values (?1, ?2, NULL)",
            params![fname, next],
        )?;
        Ok(())
    }

    /// Records a batch of received files in one transaction.
    pub fn add_media(&mut self, rows: &[(String, i64, String)]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        conn.execute_batch("begin")?;
        let result = (|| -> Result<()> {
            let mut stmt =
                conn.prepare("insert or replace into media (fname, usn, csum) values (?1, ?2, ?3)")?;
            for (fname, usn, csum) in rows {
                stmt.execute(params![fname, usn, csum])?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                conn.execute_batch("commit")?;
                Ok(())
            }
            Err(err) => {
                let _ = conn.execute_batch("rollback");
                Err(err)
            }
        }
    }

    /// The newest `server_last_usn - client_last_usn` rows in ascending USN
    /// order. The query runs descending and is reversed, so the final row
    /// always carries the server's `last_usn`.
    pub fn changes_since(&mut self, client_usn: i64) -> Result<Vec<(String, i64, Option<String>)>> {
        let server_usn = self.last_usn()?;
        let mut rows = Vec::new();
        if client_usn < server_usn || client_usn == 0 {
            let conn = self.conn()?;
            let mut stmt =
                conn.prepare("select fname, usn, csum from media order by usn desc limit ?1")?;
            let fetched = stmt.query_map(params![server_usn - client_usn], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, Option<String>>(2)?,
                ))
            })?;
            for row in fetched {
                rows.push(row?);
            }
        }
        rows.reverse();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (TempDir, MediaManager) {
        let dir = TempDir::new().unwrap();
        let mgr = MediaManager::new(&dir.path().join("collection.anki2"));
        (dir, mgr)
    }

    #[test]
    fn usn_accounting_counts_every_change() {
        let (_dir, mut mgr) = manager();
        assert_eq!(mgr.last_usn().unwrap(), 0);

        mgr.add_media(&[
            ("a.jpg".to_string(), 1, "c1".to_string()),
            ("b.png".to_string(), 2, "c2".to_string()),
        ])
        .unwrap();
        assert_eq!(mgr.last_usn().unwrap(), 2);
        assert_eq!(mgr.media_count().unwrap(), 2);

        // A deletion advances the usn even for an unknown file.
        mgr.sync_delete("ghost.gif").unwrap();
        assert_eq!(mgr.last_usn().unwrap(), 3);
        assert_eq!(mgr.media_count().unwrap(), 2);

        mgr.sync_delete("a.jpg").unwrap();
        assert_eq!(mgr.last_usn().unwrap(), 4);
        assert_eq!(mgr.media_count().unwrap(), 1);
    }

    #[test]
    fn changes_are_ascending_and_end_at_last_usn() {
        let (_dir, mut mgr) = manager();
        mgr.add_media(&[
            ("a.jpg".to_string(), 1, "c1".to_string()),
            ("b.png".to_string(), 2, "c2".to_string()),
        ])
        .unwrap();
        mgr.sync_delete("a.jpg").unwrap();

        // Zero means full history.
        let all = mgr.changes_since(0).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].1, 1);
        assert_eq!(all.last().unwrap().1, mgr.last_usn().unwrap());
        assert_eq!(all.last().unwrap().2, None);

        // A caught-up client gets nothing.
        assert!(mgr.changes_since(3).unwrap().is_empty());

        let tail = mgr.changes_since(2).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].0, "a.jpg");
    }

    #[test]
    fn delete_removes_the_file_from_disk() {
        let (_dir, mut mgr) = manager();
        mgr.connect().unwrap();
        let path = mgr.media_path("x.jpg");
        std::fs::write(&path, b"img").unwrap();
        mgr.sync_delete("x.jpg").unwrap();
        assert!(!path.exists());
    }
}
