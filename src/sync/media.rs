//! The media-change protocol: bounded zip archives of added files plus
//! tombstone markers, with deterministic USN accounting on both ends.

use crate::collection::Collection;
use crate::error::{Result, SyncError};
use crate::sync::{MAX_META_BYTES, MAX_ZIP_BYTES, SYNC_MAX_BYTES, SYNC_MAX_FILES, SyncOutput};
use crate::utils::{checksum, normalize_filename};
use serde_json::{Map, Value, json};
use std::io::{Cursor, Read, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const OPERATIONS: &[&str] = &[
    "begin",
    "mediaChanges",
    "mediaSanity",
    "uploadChanges",
    "downloadFiles",
];

pub fn dispatch(
    col: &mut Collection,
    op: &str,
    data: Value,
    raw: Option<Vec<u8>>,
    skey: &str,
) -> Result<SyncOutput> {
    match op {
        "begin" => begin(col, skey),
        "uploadChanges" => {
            let bytes =
                raw.ok_or_else(|| SyncError::bad_request("media upload carried no archive"))?;
            upload_changes(col, bytes)
        }
        "downloadFiles" => download_files(col, &data),
        "mediaChanges" => media_changes(col, &data),
        "mediaSanity" => media_sanity(col, &data),
        other => Err(SyncError::NotFound(other.to_string())),
    }
}

fn begin(col: &mut Collection, skey: &str) -> Result<SyncOutput> {
    Ok(SyncOutput::Json(json!({
        "data": {
            "sk": skey,
            "usn": col.media.last_usn()?,
        },
        "err": "",
    })))
}

// ----------------------------------------------------------------------
// uploadChanges
// ----------------------------------------------------------------------

fn upload_changes(col: &mut Collection, bytes: Vec<u8>) -> Result<SyncOutput> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    check_archive(&mut archive)?;
    let (processed, last_usn) = adopt_media_changes(col, &mut archive)?;
    Ok(SyncOutput::Json(json!({
        "data": [processed, last_usn],
        "err": "",
    })))
}

fn check_archive(archive: &mut ZipArchive<Cursor<Vec<u8>>>) -> Result<()> {
    let meta_size = archive
        .by_name("_meta")
        .map_err(|_| SyncError::bad_request("media archive is missing its metadata entry"))?
        .size();
    if meta_size > MAX_META_BYTES {
        return Err(SyncError::bad_request(format!(
            "media archive metadata is larger than {MAX_META_BYTES} bytes"
        )));
    }
    let mut total = 0u64;
    for i in 0..archive.len() {
        total += archive.by_index(i)?.size();
    }
    if total > MAX_ZIP_BYTES {
        return Err(SyncError::bad_request(format!(
            "media archive contents are larger than {MAX_ZIP_BYTES} bytes"
        )));
    }
    Ok(())
}

/// Applies the archive to the media directory and index. Every `_meta`
/// pair is one processed change: pairs without an ordinal are deletions,
/// the rest name an archive entry by its ordinal. The media USN advances
/// exactly once per pair.
fn adopt_media_changes(
    col: &mut Collection,
    archive: &mut ZipArchive<Cursor<Vec<u8>>>,
) -> Result<(usize, i64)> {
    col.media.connect()?;
    let old_usn = col.media.last_usn()?;

    let meta: Vec<(String, Value)> = {
        let mut raw = String::new();
        archive.by_name("_meta")?.read_to_string(&mut raw)?;
        serde_json::from_str(&raw)?
    };

    let mut removed = 0usize;
    for (name, ordinal) in &meta {
        if ordinal.is_null() || *ordinal == json!("") {
            col.media.sync_delete(&normalize_filename(name))?;
            removed += 1;
        }
    }

    let mut usn = col.media.last_usn()?;
    let mut additions = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.name() == "_meta" {
            continue;
        }
        let ordinal: usize = entry.name().parse().map_err(|_| {
            SyncError::bad_request(format!("unexpected media archive entry '{}'", entry.name()))
        })?;
        let (name, _) = meta.get(ordinal).ok_or_else(|| {
            SyncError::bad_request(format!("media archive entry {ordinal} has no metadata"))
        })?;

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        let csum = checksum(&data);
        let fname = normalize_filename(name);
        std::fs::write(col.media.media_path(&fname), &data)?;
        usn += 1;
        additions.push((fname, usn, csum));
    }

    let processed = removed + additions.len();
    if processed != meta.len() {
        return Err(SyncError::bad_request(
            "media archive entries do not match its metadata",
        ));
    }
    col.media.add_media(&additions)?;

    let last_usn = col.media.last_usn()?;
    if last_usn != old_usn + processed as i64 {
        return Err(SyncError::internal("media usn accounting drifted"));
    }
    Ok((processed, last_usn))
}

// ----------------------------------------------------------------------
// downloadFiles
// ----------------------------------------------------------------------

fn download_files(col: &mut Collection, data: &Value) -> Result<SyncOutput> {
    let files = data
        .get("files")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    col.media.connect()?;

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut listing = Map::new();
    let mut count = 0usize;
    let mut size = 0u64;

    for fname in files.iter().filter_map(Value::as_str) {
        let bytes = std::fs::read(col.media.media_path(fname))?;
        writer.start_file(count.to_string(), options)?;
        writer.write_all(&bytes)?;
        listing.insert(count.to_string(), json!(fname));
        size += bytes.len() as u64;
        // The caps are checked after adding, so one archive may exceed
        // them by a single file; the client requests the rest next round.
        if size > SYNC_MAX_BYTES || count > SYNC_MAX_FILES {
            break;
        }
        count += 1;
    }
    writer.start_file("_meta", options)?;
    writer.write_all(&serde_json::to_vec(&listing)?)?;
    let cursor = writer.finish()?;
    Ok(SyncOutput::Bytes(cursor.into_inner()))
}

// ----------------------------------------------------------------------
// mediaChanges / mediaSanity
// ----------------------------------------------------------------------

fn media_changes(col: &mut Collection, data: &Value) -> Result<SyncOutput> {
    let client_usn = data.get("lastUsn").and_then(Value::as_i64).unwrap_or(0);
    let rows = col.media.changes_since(client_usn)?;
    let data: Vec<Value> = rows
        .into_iter()
        .map(|(fname, usn, csum)| json!([fname, usn, csum]))
        .collect();
    Ok(SyncOutput::Json(json!({"data": data, "err": ""})))
}

fn media_sanity(col: &mut Collection, data: &Value) -> Result<SyncOutput> {
    let local = data.get("local").and_then(Value::as_i64).unwrap_or(-1);
    let verdict = if col.media.media_count()? == local {
        "OK"
    } else {
        "FAILED"
    };
    Ok(SyncOutput::Json(json!({"data": verdict, "err": ""})))
}
