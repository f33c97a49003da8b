//! The incremental collection sync protocol: a linear state machine the
//! client drives through `meta`, `start`, `applyGraves`, `applyChanges`,
//! `chunk`/`applyChunk`, `sanityCheck2` and `finish`. All steps run on the
//! collection's worker, which is the ordering guarantee the protocol
//! relies on.

use crate::collection::{Collection, Graves, id_key};
use crate::error::{Result, SyncError};
use crate::sync::{CHUNK_ROWS, ChunkCursor, SyncOutput, SyncState};
use crate::utils::int_time;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value, json};

pub const OPERATIONS: &[&str] = &[
    "meta",
    "applyChanges",
    "start",
    "applyGraves",
    "chunk",
    "applyChunk",
    "sanityCheck2",
    "finish",
];

/// Runs one protocol operation against the collection. `state` is the
/// per-session sync state; `start` (re)creates it and `finish` clears it.
pub fn dispatch(
    col: &mut Collection,
    state: &mut Option<SyncState>,
    op: &str,
    data: Value,
) -> Result<SyncOutput> {
    match op {
        "meta" => meta(col, &data),
        "start" => start(col, state, &data),
        "applyGraves" => apply_graves(col, state, &data),
        "applyChanges" => apply_changes(col, state, &data),
        "chunk" => chunk(col, state),
        "applyChunk" => apply_chunk(col, state, &data),
        "sanityCheck2" => sanity_check2(col, &data),
        "finish" => finish(col, state),
        other => Err(SyncError::NotFound(other.to_string())),
    }
}

// ----------------------------------------------------------------------
// meta
// ----------------------------------------------------------------------

fn meta(col: &mut Collection, data: &Value) -> Result<SyncOutput> {
    let version = data.get("v").and_then(Value::as_i64).unwrap_or(0);
    let client_version = data.get("cv").and_then(Value::as_str);

    if is_old_client(client_version) {
        return Err(SyncError::ClientUpgradeRequired);
    }
    if version < 9 && col.sched_ver() >= 2 {
        return Ok(SyncOutput::Json(json!({
            "cont": false,
            "msg": format!("Your client doesn't support the v{} scheduler.", col.sched_ver()),
        })));
    }
    col.media.connect()?;
    Ok(SyncOutput::Json(json!({
        "scm": col.scm,
        "ts": int_time(1),
        "mod": col.modified,
        "usn": col.usn,
        "musn": col.media.last_usn()?,
        "msg": "",
        "cont": true,
        "hostNum": 0,
    })))
}

lazy_static! {
    /// Strips anything after the numeric `N.N.N` core of a version string.
    static ref VERSION_SUFFIX: Regex = Regex::new(r"[^0-9.].*$").expect("static regex");
}

/// Parses a `client,version,platform` string and decides whether the
/// client is too old to sync. Unknown clients are assumed current.
fn is_old_client(cv: Option<&str>) -> bool {
    let Some(cv) = cv else { return false };
    let mut parts = cv.split(',');
    let (Some(client), Some(raw_version)) = (parts.next(), parts.next()) else {
        return false;
    };

    // Split a pre-release tag off the version, keeping its counter; e.g.
    // "2.13.1alpha10" carries version 2.13.1 with an alpha counter of 10.
    let mut version = raw_version.to_string();
    let mut alpha = 0i64;
    for tag in ["alpha", "beta", "rc"] {
        if let Some(pos) = version.find(tag) {
            let counter = version[pos + tag.len()..].trim().to_string();
            version.truncate(pos);
            if tag == "alpha" {
                alpha = counter.parse().unwrap_or(0);
            }
        }
    }
    let core = VERSION_SUFFIX.replace(&version, "").into_owned();
    let nums: Vec<i64> = core.split('.').filter_map(|p| p.parse().ok()).collect();

    match client {
        "ankidesktop" => nums < vec![2, 0, 27],
        "ankidroid" => {
            if nums == [2, 3] || nums == [2, 3, 0] {
                // The 2.3 alpha line gained protocol support at alpha 4.
                if alpha > 0 { alpha < 4 } else { false }
            } else {
                nums < vec![2, 2, 3]
            }
        }
        _ => false,
    }
}

// ----------------------------------------------------------------------
// start / graves
// ----------------------------------------------------------------------

fn start(col: &mut Collection, state: &mut Option<SyncState>, data: &Value) -> Result<SyncOutput> {
    let min_usn = data.get("minUsn").and_then(Value::as_i64).unwrap_or(0);
    let client_lnewer = data.get("lnewer").and_then(Value::as_bool).unwrap_or(false);
    let graves = parse_graves(data.get("graves"))?;

    let max_usn = col.usn;
    *state = Some(SyncState::new(min_usn, max_usn, client_lnewer));

    // Collect what other clients deleted before applying this client's
    // tombstones, which are stamped at the new snapshot usn.
    let server_graves = col.pending_graves(min_usn)?;
    col.apply_graves(&graves, max_usn)?;
    Ok(SyncOutput::Json(serde_json::to_value(server_graves)?))
}

fn apply_graves(
    col: &mut Collection,
    state: &Option<SyncState>,
    data: &Value,
) -> Result<SyncOutput> {
    let graves = parse_graves(data.get("chunk"))?;
    let usn = state.as_ref().map(|s| s.max_usn).unwrap_or(col.usn);
    col.apply_graves(&graves, usn)?;
    Ok(SyncOutput::Json(Value::Null))
}

fn parse_graves(value: Option<&Value>) -> Result<Graves> {
    match value {
        None | Some(Value::Null) => Ok(Graves::default()),
        Some(v) => Ok(serde_json::from_value(v.clone())?),
    }
}

// ----------------------------------------------------------------------
// applyChanges
// ----------------------------------------------------------------------

fn apply_changes(
    col: &mut Collection,
    state: &mut Option<SyncState>,
    data: &Value,
) -> Result<SyncOutput> {
    let st = started(state)?;
    let rchg = data.get("changes").cloned().unwrap_or_else(|| json!({}));

    let lchg = local_changes(col, st);
    merge_changes(col, st, &rchg);
    st.chunk = Some(ChunkCursor::new());
    Ok(SyncOutput::Json(lchg))
}

/// The server-side counterpart of the client's change set: every entity
/// mutated since the client last synced, plus the global config when this
/// side wins.
fn local_changes(col: &Collection, st: &SyncState) -> Value {
    let mut out = Map::new();
    out.insert("models".into(), Value::Array(get_models(col, st.min_usn)));
    out.insert("decks".into(), get_decks(col, st.min_usn));
    out.insert("tags".into(), json!(get_tags(col, st.min_usn)));
    if st.lnewer {
        out.insert("conf".into(), col.conf());
        out.insert("crt".into(), json!(col.crt));
    }
    Value::Object(out)
}

fn merge_changes(col: &mut Collection, st: &SyncState, rchg: &Value) {
    if let Some(models) = rchg.get("models").and_then(Value::as_array) {
        for model in models {
            let Some(id) = model.get("id").map(id_key) else { continue };
            if newer_than(model, col.model_get(&id)) {
                col.model_update(model.clone());
            }
        }
    }
    if let Some(decks) = rchg.get("decks").and_then(Value::as_array) {
        if let Some(ds) = decks.first().and_then(Value::as_array) {
            for deck in ds {
                let Some(id) = deck.get("id").map(id_key) else { continue };
                if newer_than(deck, col.deck_get(&id)) {
                    col.deck_update(deck.clone());
                }
            }
        }
        if let Some(confs) = decks.get(1).and_then(Value::as_array) {
            for conf in confs {
                let Some(id) = conf.get("id").map(id_key) else { continue };
                if newer_than(conf, col.deck_conf_get(&id)) {
                    col.deck_conf_update(conf.clone());
                }
            }
        }
    }
    if let Some(tags) = rchg.get("tags").and_then(Value::as_array) {
        let names = tags
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect::<Vec<_>>();
        col.tags_register(names, st.max_usn);
    }
    if let Some(conf) = rchg.get("conf") {
        if !conf.is_null() {
            col.replace_conf(conf.clone());
        }
    }
    if let Some(crt) = rchg.get("crt").and_then(Value::as_i64) {
        col.crt = crt;
    }
}

/// Latest-wins per entity: the incoming copy is adopted when there is no
/// local copy or the incoming `mod` is strictly newer.
fn newer_than(incoming: &Value, local: Option<&Value>) -> bool {
    let incoming_mod = incoming.get("mod").and_then(Value::as_i64).unwrap_or(0);
    match local {
        None => true,
        Some(local) => local.get("mod").and_then(Value::as_i64).unwrap_or(0) < incoming_mod,
    }
}

fn get_models(col: &Collection, min_usn: i64) -> Vec<Value> {
    col.models_all()
        .into_iter()
        .filter(|m| m.get("usn").and_then(Value::as_i64).unwrap_or(-1) >= min_usn)
        .collect()
}

fn get_decks(col: &Collection, min_usn: i64) -> Value {
    let dirty = |v: &Value| v.get("usn").and_then(Value::as_i64).unwrap_or(-1) >= min_usn;
    json!([
        col.decks_all().into_iter().filter(|d| dirty(d)).collect::<Vec<_>>(),
        col.deck_confs_all().into_iter().filter(|c| dirty(c)).collect::<Vec<_>>(),
    ])
}

fn get_tags(col: &Collection, min_usn: i64) -> Vec<String> {
    col.tags_items()
        .into_iter()
        .filter(|(_, usn)| *usn >= min_usn)
        .map(|(name, _)| name)
        .collect()
}

// ----------------------------------------------------------------------
// chunk / applyChunk
// ----------------------------------------------------------------------

fn chunk(col: &mut Collection, state: &mut Option<SyncState>) -> Result<SyncOutput> {
    let st = started(state)?;
    let cursor = st
        .chunk
        .as_mut()
        .ok_or_else(|| SyncError::internal("chunk requested before applyChanges"))?;

    let mut buf = Map::new();
    let mut lim = CHUNK_ROWS;
    while lim > 0 {
        let Some(table) = cursor.current() else { break };
        let rows = col.chunk_rows(table, st.min_usn, st.max_usn, lim, cursor.offset)?;
        let fetched = rows.len();
        cursor.offset += fetched as u64;

        let entry = buf
            .entry(table.name().to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = entry {
            list.extend(rows);
        }

        let drained = fetched < lim;
        lim -= fetched;
        if drained {
            col.mark_chunk_sent(table, st.min_usn, st.max_usn)?;
            cursor.advance();
        }
    }
    buf.insert("done".into(), json!(cursor.done()));
    Ok(SyncOutput::Json(Value::Object(buf)))
}

fn apply_chunk(
    col: &mut Collection,
    state: &mut Option<SyncState>,
    data: &Value,
) -> Result<SyncOutput> {
    let st = started(state)?;
    let chunk = data.get("chunk").cloned().unwrap_or_else(|| json!({}));

    if let Some(rows) = chunk.get("revlog").and_then(Value::as_array) {
        col.merge_revlog(rows)?;
    }
    if let Some(rows) = chunk.get("cards").and_then(Value::as_array) {
        col.merge_cards(rows, st.min_usn)?;
    }
    if let Some(rows) = chunk.get("notes").and_then(Value::as_array) {
        col.merge_notes(rows, st.min_usn)?;
    }
    Ok(SyncOutput::Json(Value::Null))
}

// ----------------------------------------------------------------------
// sanityCheck2 / finish
// ----------------------------------------------------------------------

fn sanity_check2(col: &mut Collection, data: &Value) -> Result<SyncOutput> {
    let client = data.get("client").cloned().unwrap_or(Value::Null);
    if col.has_pending_usn()? {
        return Ok(SyncOutput::Json(json!({
            "status": "bad",
            "c": client,
            "s": "collection has unsent changes",
        })));
    }
    let server = Value::Array(col.sanity_check()?);
    if client != server {
        tracing::warn!(client = %client, server = %server, "sanity check mismatch");
        return Ok(SyncOutput::Json(json!({
            "status": "bad",
            "c": client,
            "s": server,
        })));
    }
    Ok(SyncOutput::Json(json!({"status": "ok"})))
}

fn finish(col: &mut Collection, state: &mut Option<SyncState>) -> Result<SyncOutput> {
    let st = started(state)?;
    let now = int_time(1000);
    col.ls = now;
    col.usn = st.max_usn + 1;
    col.modified = now;
    col.save()?;
    *state = None;
    Ok(SyncOutput::Json(json!(now)))
}

fn started(state: &mut Option<SyncState>) -> Result<&mut SyncState> {
    state
        .as_mut()
        .ok_or_else(|| SyncError::internal("sync has not been started"))
}

#[cfg(test)]
mod tests {
    use super::is_old_client;

    #[test]
    fn desktop_clients_are_gated_at_2_0_27() {
        assert!(is_old_client(Some("ankidesktop,2.0.26,linux")));
        assert!(!is_old_client(Some("ankidesktop,2.0.27,linux")));
        assert!(!is_old_client(Some("ankidesktop,2.1.49,mac")));
        // Pre-release suffixes are stripped before comparing.
        assert!(!is_old_client(Some("ankidesktop,2.13.1alpha10,win")));
    }

    #[test]
    fn ankidroid_2_3_needs_alpha_4() {
        assert!(is_old_client(Some("ankidroid,2.3.0alpha3,android")));
        assert!(!is_old_client(Some("ankidroid,2.3.0alpha4,android")));
        assert!(!is_old_client(Some("ankidroid,2.3.0,android")));
        assert!(is_old_client(Some("ankidroid,2.2.2,android")));
        assert!(!is_old_client(Some("ankidroid,2.2.3,android")));
    }

    #[test]
    fn unknown_clients_are_assumed_current() {
        assert!(!is_old_client(None));
        assert!(!is_old_client(Some("fancynewclient,0.1.0,plan9")));
        assert!(!is_old_client(Some("garbage")));
    }
}
