//! Minimal model of a client study collection, backed by SQLite.
//!
//! The sync protocol only needs a narrow slice of the client database: the
//! `col` row (timestamps, USN, JSON entity maps), the `notes`/`cards`/
//! `revlog` tables it streams in chunks, and the `graves` tombstone table.
//! Entity maps (models, decks, deck configs, tags, conf) are kept in memory
//! after open and flushed by `save()`, the way the client library caches
//! them.

pub mod media;

use crate::error::{Result, SyncError};
use crate::utils::{checksum, int_time};
use media::MediaManager;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};

/// Tombstone entity classes.
pub const REM_CARD: i64 = 0;
pub const REM_NOTE: i64 = 1;
pub const REM_DECK: i64 = 2;

/// Collection schema version written into fresh databases.
const SCHEMA_VERSION: i64 = 11;

const SCHEMA_SQL: &str = r#"
create table if not exists col (
    id     integer primary key,
    crt    integer not null,
    mod    integer not null,
    scm    integer not null,
    ver    integer not null,
    dty    integer not null,
    usn    integer not null,
    ls     integer not null,
    conf   text not null,
    models text not null,
    decks  text not null,
    dconf  text not null,
    tags   text not null
);
create table if not exists notes (
    id    integer primary key,
    guid  text not null,
    mid   integer not null,
    mod   integer not null,
    usn   integer not null,
    tags  text not null,
    flds  text not null,
    sfld  text not null,
    csum  integer not null,
    flags integer not null,
    data  text not null
);
create table if not exists cards (
    id     integer primary key,
    nid    integer not null,
    did    integer not null,
    ord    integer not null,
    mod    integer not null,
    usn    integer not null,
    type   integer not null,
    queue  integer not null,
    due    integer not null,
    ivl    integer not null,
    factor integer not null,
    reps   integer not null,
    lapses integer not null,
    left   integer not null,
    odue   integer not null,
    odid   integer not null,
    flags  integer not null,
    data   text not null
);
create table if not exists revlog (
    id      integer primary key,
    cid     integer not null,
    usn     integer not null,
    ease    integer not null,
    ivl     integer not null,
    lastIvl integer not null,
    factor  integer not null,
    time    integer not null,
    type    integer not null
);
create table if not exists graves (
    usn  integer not null,
    oid  integer not null,
    type integer not null
);
create unique index if not exists ix_graves_identity on graves (oid, type);
create index if not exists ix_notes_usn on notes (usn);
create index if not exists ix_cards_usn on cards (usn);
create index if not exists ix_revlog_usn on revlog (usn);
"#;

/// Tombstone sets exchanged during sync, keyed by entity class.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Graves {
    #[serde(default)]
    pub cards: Vec<i64>,
    #[serde(default)]
    pub notes: Vec<i64>,
    #[serde(default)]
    pub decks: Vec<i64>,
}

impl Graves {
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty() && self.notes.is_empty() && self.decks.is_empty()
    }
}

/// Tables streamed by the incremental protocol, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkTable {
    Revlog,
    Cards,
    Notes,
}

impl ChunkTable {
    pub const ORDER: [ChunkTable; 3] = [ChunkTable::Revlog, ChunkTable::Cards, ChunkTable::Notes];

    pub fn name(self) -> &'static str {
        match self {
            ChunkTable::Revlog => "revlog",
            ChunkTable::Cards => "cards",
            ChunkTable::Notes => "notes",
        }
    }

    /// Column list for outgoing rows. The `usn` column is replaced by the
    /// sync's `max_usn` as rows are handed to the client; notes omit the
    /// derived sort-field/checksum columns, which the receiving side
    /// recomputes.
    fn select_columns(self, max_usn: i64) -> String {
        match self {
            ChunkTable::Revlog => format!(
                "id, cid, {max_usn}, ease, ivl, lastIvl, factor, time, type"
            ),
            ChunkTable::Cards => format!(
                "id, nid, did, ord, mod, {max_usn}, type, queue, due, ivl, factor, \
                 reps, lapses, left, odue, odid, flags, data"
            ),
            ChunkTable::Notes => {
                format!("id, guid, mid, mod, {max_usn}, tags, flds, '', '', flags, data")
            }
        }
    }
}

/// An open collection database plus its media index.
pub struct Collection {
    db: Connection,
    path: PathBuf,
    pub crt: i64,
    pub modified: i64,
    pub scm: i64,
    pub usn: i64,
    pub ls: i64,
    conf: Map<String, Value>,
    models: Map<String, Value>,
    decks: Map<String, Value>,
    dconf: Map<String, Value>,
    tags: Map<String, Value>,
    pub media: MediaManager,
}

impl Collection {
    /// Opens the collection at `path`, creating an empty one (and its
    /// parent directory) if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Connection::open(&path)?;
        db.execute_batch(SCHEMA_SQL)?;

        let existing = db.query_row("select count(*) from col", [], |r| r.get::<_, i64>(0))?;
        if existing == 0 {
            let now_ms = int_time(1000);
            db.execute(
                "insert into col (id, crt, mod, scm, ver, dty, usn, ls, conf, models, decks, dconf, tags)
                 values (1, ?1, ?2, ?2, ?3, 0, 0, 0, ?4, '{}', '{}', '{}', '{}')",
                params![int_time(1), now_ms, SCHEMA_VERSION, default_conf().to_string()],
            )?;
        }

        let media = MediaManager::new(&path);
        let mut col = Self {
            db,
            path,
            crt: 0,
            modified: 0,
            scm: 0,
            usn: 0,
            ls: 0,
            conf: Map::new(),
            models: Map::new(),
            decks: Map::new(),
            dconf: Map::new(),
            tags: Map::new(),
            media,
        };
        col.load()?;
        Ok(col)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&mut self) -> Result<()> {
        let (crt, modified, scm, usn, ls, conf, models, decks, dconf, tags) =
            self.db.query_row(
                "select crt, mod, scm, usn, ls, conf, models, decks, dconf, tags from col where id = 1",
                [],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, i64>(1)?,
                        r.get::<_, i64>(2)?,
                        r.get::<_, i64>(3)?,
                        r.get::<_, i64>(4)?,
                        r.get::<_, String>(5)?,
                        r.get::<_, String>(6)?,
                        r.get::<_, String>(7)?,
                        r.get::<_, String>(8)?,
                        r.get::<_, String>(9)?,
                    ))
                },
            )?;
        self.crt = crt;
        self.modified = modified;
        self.scm = scm;
        self.usn = usn;
        self.ls = ls;
        self.conf = parse_map(&conf)?;
        self.models = parse_map(&models)?;
        self.decks = parse_map(&decks)?;
        self.dconf = parse_map(&dconf)?;
        self.tags = parse_map(&tags)?;
        Ok(())
    }

    /// Flushes the cached `col` row back to the database. Called by the
    /// worker after every scheduled job.
    pub fn save(&mut self) -> Result<()> {
        self.db.execute(
            "update col set crt = ?1, mod = ?2, scm = ?3, usn = ?4, ls = ?5,
             conf = ?6, models = ?7, decks = ?8, dconf = ?9, tags = ?10 where id = 1",
            params![
                self.crt,
                self.modified,
                self.scm,
                self.usn,
                self.ls,
                Value::Object(self.conf.clone()).to_string(),
                Value::Object(self.models.clone()).to_string(),
                Value::Object(self.decks.clone()).to_string(),
                Value::Object(self.dconf.clone()).to_string(),
                Value::Object(self.tags.clone()).to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.save()?;
        self.media.close();
        Ok(())
    }

    pub fn sched_ver(&self) -> i64 {
        self.conf.get("schedVer").and_then(Value::as_i64).unwrap_or(1)
    }

    // ------------------------------------------------------------------
    // Entity maps
    // ------------------------------------------------------------------

    pub fn models_all(&self) -> Vec<Value> {
        self.models.values().cloned().collect()
    }

    pub fn model_get(&self, id: &str) -> Option<&Value> {
        self.models.get(id)
    }

    pub fn model_update(&mut self, model: Value) {
        if let Some(id) = model.get("id").map(id_key) {
            self.models.insert(id, model);
        }
    }

    pub fn decks_all(&self) -> Vec<Value> {
        self.decks.values().cloned().collect()
    }

    pub fn deck_get(&self, id: &str) -> Option<&Value> {
        self.decks.get(id)
    }

    pub fn deck_update(&mut self, deck: Value) {
        if let Some(id) = deck.get("id").map(id_key) {
            self.decks.insert(id, deck);
        }
    }

    pub fn deck_confs_all(&self) -> Vec<Value> {
        self.dconf.values().cloned().collect()
    }

    pub fn deck_conf_get(&self, id: &str) -> Option<&Value> {
        self.dconf.get(id)
    }

    pub fn deck_conf_update(&mut self, conf: Value) {
        if let Some(id) = conf.get("id").map(id_key) {
            self.dconf.insert(id, conf);
        }
    }

    pub fn tags_items(&self) -> Vec<(String, i64)> {
        self.tags
            .iter()
            .map(|(name, usn)| (name.clone(), usn.as_i64().unwrap_or(-1)))
            .collect()
    }

    pub fn tags_register(&mut self, names: impl IntoIterator<Item = String>, usn: i64) {
        for name in names {
            self.tags.insert(name, json!(usn));
        }
    }

    pub fn conf(&self) -> Value {
        Value::Object(self.conf.clone())
    }

    pub fn replace_conf(&mut self, conf: Value) {
        if let Value::Object(map) = conf {
            self.conf = map;
        }
    }

    // ------------------------------------------------------------------
    // Graves
    // ------------------------------------------------------------------

    /// Tombstones other clients have produced since `min_usn`.
    pub fn pending_graves(&self, min_usn: i64) -> Result<Graves> {
        let mut graves = Graves::default();
        let mut stmt = self
            .db
            .prepare("select oid, type from graves where usn >= ?1")?;
        let rows = stmt.query_map(params![min_usn], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (oid, kind) = row?;
            match kind {
                REM_CARD => graves.cards.push(oid),
                REM_NOTE => graves.notes.push(oid),
                _ => graves.decks.push(oid),
            }
        }
        Ok(graves)
    }

    /// Deletes the named entities and stamps their tombstones at `usn`.
    /// Safe to repeat: deletes are no-ops the second time and tombstones
    /// are keyed by identity.
    pub fn apply_graves(&mut self, graves: &Graves, usn: i64) -> Result<()> {
        if !graves.cards.is_empty() {
            self.db.execute(
                &format!("delete from cards where id in ({})", ids_list(&graves.cards)),
                [],
            )?;
            self.stamp_graves(&graves.cards, REM_CARD, usn)?;
        }
        if !graves.notes.is_empty() {
            self.db.execute(
                &format!("delete from notes where id in ({})", ids_list(&graves.notes)),
                [],
            )?;
            self.stamp_graves(&graves.notes, REM_NOTE, usn)?;
        }
        for did in &graves.decks {
            self.decks.remove(&did.to_string());
        }
        if !graves.decks.is_empty() {
            self.stamp_graves(&graves.decks, REM_DECK, usn)?;
        }
        Ok(())
    }

    fn stamp_graves(&self, oids: &[i64], kind: i64, usn: i64) -> Result<()> {
        let mut stmt = self
            .db
            .prepare("insert or replace into graves (usn, oid, type) values (?1, ?2, ?3)")?;
        for oid in oids {
            stmt.execute(params![usn, oid, kind])?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Chunk streaming
    // ------------------------------------------------------------------

    /// Fetches up to `limit` rows of `table` still carrying `usn >=
    /// min_usn`, with the usn column rewritten to `max_usn` in the result.
    /// `offset` pages through a table across successive calls of one sync;
    /// rows are only restamped in the database once the table drains
    /// (`mark_chunk_sent`), so the pagination stays stable.
    pub fn chunk_rows(
        &self,
        table: ChunkTable,
        min_usn: i64,
        max_usn: i64,
        limit: usize,
        offset: u64,
    ) -> Result<Vec<Value>> {
        let sql = format!(
            "select {} from {} where usn >= ?1 order by id limit ?2 offset ?3",
            table.select_columns(max_usn),
            table.name()
        );
        let mut stmt = self.db.prepare(&sql)?;
        let ncols = stmt.column_count();
        let rows = stmt.query_map(params![min_usn, limit as i64, offset as i64], |r| {
            row_to_json(r, ncols)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Marks every dirty row of `table` as sent by restamping its usn.
    pub fn mark_chunk_sent(&self, table: ChunkTable, min_usn: i64, max_usn: i64) -> Result<()> {
        self.db.execute(
            &format!("update {} set usn = ?1 where usn >= ?2", table.name()),
            params![max_usn, min_usn],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Chunk merging
    // ------------------------------------------------------------------

    pub fn merge_revlog(&self, rows: &[Value]) -> Result<()> {
        let mut stmt = self
            .db
            .prepare("insert or ignore into revlog values (?1,?2,?3,?4,?5,?6,?7,?8,?9)")?;
        for row in rows {
            stmt.execute(rusqlite::params_from_iter(row_params(row, 9)?))?;
        }
        Ok(())
    }

    pub fn merge_cards(&self, rows: &[Value], min_usn: i64) -> Result<()> {
        let keep = self.newer_rows(rows, "cards", 4, min_usn)?;
        let mut stmt = self.db.prepare(
            "insert or replace into cards values (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
        )?;
        for row in &keep {
            stmt.execute(rusqlite::params_from_iter(row_params(row, 18)?))?;
        }
        Ok(())
    }

    pub fn merge_notes(&self, rows: &[Value], min_usn: i64) -> Result<()> {
        let keep = self.newer_rows(rows, "notes", 3, min_usn)?;
        let mut stmt = self.db.prepare(
            "insert or replace into notes values (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
        )?;
        let mut merged = Vec::with_capacity(keep.len());
        for row in &keep {
            stmt.execute(rusqlite::params_from_iter(row_params(row, 11)?))?;
            if let Some(id) = row.get(0).and_then(Value::as_i64) {
                merged.push(id);
            }
        }
        drop(stmt);
        self.update_field_cache(&merged)?;
        Ok(())
    }

    /// Of the incoming rows, keeps those with no local counterpart in the
    /// dirty window, or whose `mod` is newer than the local one.
    fn newer_rows(
        &self,
        rows: &[Value],
        table: &str,
        mod_idx: usize,
        min_usn: i64,
    ) -> Result<Vec<Value>> {
        let mut local_mods = std::collections::HashMap::new();
        let mut stmt = self
            .db
            .prepare(&format!("select id, mod from {table} where usn >= ?1"))?;
        let local = stmt.query_map(params![min_usn], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
        })?;
        for row in local {
            let (id, modified) = row?;
            local_mods.insert(id, modified);
        }

        Ok(rows
            .iter()
            .filter(|row| {
                let id = row.get(0).and_then(Value::as_i64).unwrap_or(0);
                let modified = row.get(mod_idx).and_then(Value::as_i64).unwrap_or(0);
                match local_mods.get(&id) {
                    Some(local_mod) => *local_mod < modified,
                    None => true,
                }
            })
            .cloned()
            .collect())
    }

    /// Recomputes the derived sort field and field checksum for the given
    /// notes (the columns left blank by chunk transfer).
    fn update_field_cache(&self, note_ids: &[i64]) -> Result<()> {
        if note_ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "select id, flds from notes where id in ({})",
            ids_list(note_ids)
        );
        let mut fetched = Vec::new();
        {
            let mut stmt = self.db.prepare(&sql)?;
            let rows = stmt.query_map([], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?))
            })?;
            for row in rows {
                fetched.push(row?);
            }
        }
        let mut update = self
            .db
            .prepare("update notes set sfld = ?1, csum = ?2 where id = ?3")?;
        for (id, fields) in fetched {
            let first = fields.split('\u{1f}').next().unwrap_or("");
            update.execute(params![first, field_checksum(first), id])?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sanity
    // ------------------------------------------------------------------

    /// `true` if any row is still carrying the client-side dirty marker,
    /// which must never survive on the server.
    pub fn has_pending_usn(&self) -> Result<bool> {
        for table in ["cards", "notes", "revlog", "graves"] {
            let n: i64 = self.db.query_row(
                &format!("select count(*) from {table} where usn = -1"),
                [],
                |r| r.get(0),
            )?;
            if n > 0 {
                return Ok(true);
            }
        }
        let dirty_entity = |map: &Map<String, Value>| {
            map.values()
                .any(|v| v.get("usn").and_then(Value::as_i64) == Some(-1))
        };
        Ok(dirty_entity(&self.models) || dirty_entity(&self.decks) || dirty_entity(&self.dconf))
    }

    /// Structural tally compared between client and server after a sync:
    /// `[cards, notes, revlog, graves, models, decks, deck_configs,
    /// selected_deck_ok]`.
    pub fn sanity_check(&self) -> Result<Vec<Value>> {
        let count = |table: &str| -> Result<i64> {
            Ok(self
                .db
                .query_row(&format!("select count(*) from {table}"), [], |r| r.get(0))?)
        };
        let cur_deck = self.conf.get("curDeck").and_then(Value::as_i64).unwrap_or(1);
        let selected_ok = cur_deck == 1 || self.decks.contains_key(&cur_deck.to_string());
        Ok(vec![
            json!(count("cards")?),
            json!(count("notes")?),
            json!(count("revlog")?),
            json!(count("graves")?),
            json!(self.models.len()),
            json!(self.decks.len()),
            json!(self.dconf.len()),
            json!(if selected_ok { 1 } else { 0 }),
        ])
    }
}

fn default_conf() -> Value {
    json!({
        "curDeck": 1,
        "activeDecks": [1],
        "newSpread": 0,
        "collapseTime": 1200,
        "timeLim": 0,
        "estTimes": true,
        "dueCounts": true,
        "nextPos": 1,
        "sortType": "noteFld",
        "sortBackwards": false,
        "addToCur": true,
        "schedVer": 1
    })
}

fn parse_map(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        _ => Err(SyncError::internal("collection entity column is not a JSON object")),
    }
}

/// Entity ids arrive as numbers or strings depending on the client; the
/// maps are keyed by the canonical string form.
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 32-bit checksum of a note's first field, stored in the `csum` column.
pub fn field_checksum(text: &str) -> i64 {
    i64::from_str_radix(&checksum(text)[..8], 16).unwrap_or(0)
}

fn ids_list(ids: &[i64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn row_to_json(row: &rusqlite::Row<'_>, ncols: usize) -> rusqlite::Result<Value> {
    let mut out = Vec::with_capacity(ncols);
    for i in 0..ncols {
        let value = match row.get_ref(i)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(n) => json!(n),
            ValueRef::Real(f) => json!(f),
            ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
        };
        out.push(value);
    }
    Ok(Value::Array(out))
}

fn row_params(row: &Value, expected: usize) -> Result<Vec<rusqlite::types::Value>> {
    let cells = row
        .as_array()
        .ok_or_else(|| SyncError::bad_request("chunk row is not an array"))?;
    if cells.len() != expected {
        return Err(SyncError::bad_request(format!(
            "chunk row has {} columns, expected {expected}",
            cells.len()
        )));
    }
    Ok(cells.iter().map(json_to_sql).collect())
}

fn json_to_sql(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Sql::Integer(i),
            None => Sql::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(other.to_string()),
    }
}
