/// Incremental collection sync protocol tests, driven through the handler
/// dispatch the same way the worker runs it.
use ankisyncd::collection::{Collection, Graves};
use ankisyncd::sync::collection::dispatch;
use ankisyncd::sync::{SyncOutput, SyncState};
use serde_json::{Value, json};
use tempfile::TempDir;

fn open_collection() -> (TempDir, Collection) {
    let dir = TempDir::new().unwrap();
    let col = Collection::open(dir.path().join("collection.anki2")).unwrap();
    (dir, col)
}

fn call(
    col: &mut Collection,
    state: &mut Option<SyncState>,
    op: &str,
    data: Value,
) -> Value {
    match dispatch(col, state, op, data).unwrap() {
        SyncOutput::Json(v) => v,
        other => panic!("expected json from {op}, got {other:?}"),
    }
}

#[test]
fn empty_sync_runs_start_to_finish() {
    let (_dir, mut col) = open_collection();
    let mut state = None;

    let meta = call(&mut col, &mut state, "meta", json!({"v": 11, "cv": "ankidesktop,2.1.49,mac"}));
    assert_eq!(meta["cont"], json!(true));
    assert_eq!(meta["usn"], json!(0));
    assert_eq!(meta["musn"], json!(0));
    assert_eq!(meta["hostNum"], json!(0));
    assert_eq!(meta["msg"], json!(""));

    let graves = call(
        &mut col,
        &mut state,
        "start",
        json!({"minUsn": 0, "lnewer": false, "graves": {"cards": [], "notes": [], "decks": []}}),
    );
    assert_eq!(graves, json!({"cards": [], "notes": [], "decks": []}));

    let lchg = call(
        &mut col,
        &mut state,
        "applyChanges",
        json!({"changes": {"models": [], "decks": [[], []], "tags": []}}),
    );
    assert_eq!(lchg["models"], json!([]));
    assert_eq!(lchg["decks"], json!([[], []]));
    assert_eq!(lchg["tags"], json!([]));
    // The client said its side was not newer, so the server's conf wins
    // and is included.
    assert!(lchg.get("conf").is_some());
    assert!(lchg.get("crt").is_some());

    let chunk = call(&mut col, &mut state, "chunk", json!({}));
    assert_eq!(chunk["done"], json!(true));
    assert_eq!(chunk["revlog"], json!([]));
    assert_eq!(chunk["cards"], json!([]));
    assert_eq!(chunk["notes"], json!([]));

    let sane = call(
        &mut col,
        &mut state,
        "sanityCheck2",
        json!({"client": [0, 0, 0, 0, 0, 0, 0, 1]}),
    );
    assert_eq!(sane, json!({"status": "ok"}));

    let usn_before = col.usn;
    let finished = call(&mut col, &mut state, "finish", json!({}));
    let new_mod = finished.as_i64().unwrap();
    assert!(new_mod > 1_000_000_000_000, "finish returns milliseconds");
    assert_eq!(col.modified, new_mod);
    assert!(col.usn > usn_before);
    assert_eq!(col.usn, 1);
    assert!(state.is_none(), "finish clears the sync state");
}

#[test]
fn meta_is_side_effect_free_and_repeatable() {
    let (_dir, mut col) = open_collection();
    let mut state = None;
    let req = json!({"v": 11, "cv": "ankidesktop,2.1.49,linux"});

    let first = call(&mut col, &mut state, "meta", req.clone());
    let second = call(&mut col, &mut state, "meta", req);
    for key in ["scm", "mod", "usn", "musn", "cont"] {
        assert_eq!(first[key], second[key], "meta changed {key}");
    }
}

#[test]
fn old_clients_are_rejected_with_upgrade_required() {
    let (_dir, mut col) = open_collection();
    let mut state = None;

    let err = dispatch(
        &mut col,
        &mut state,
        "meta",
        json!({"v": 8, "cv": "ankidesktop,2.0.26,linux"}),
    )
    .unwrap_err();
    assert!(matches!(err, ankisyncd::SyncError::ClientUpgradeRequired));
}

#[test]
fn scheduler_mismatch_refuses_politely() {
    let (_dir, mut col) = open_collection();
    let mut conf = col.conf();
    conf["schedVer"] = json!(2);
    col.replace_conf(conf);

    let mut state = None;
    let refused = call(&mut col, &mut state, "meta", json!({"v": 8, "cv": "ankidesktop,2.1.0,linux"}));
    assert_eq!(refused["cont"], json!(false));
    assert!(refused["msg"].as_str().unwrap().contains("scheduler"));

    let accepted = call(&mut col, &mut state, "meta", json!({"v": 9, "cv": "ankidesktop,2.1.0,linux"}));
    assert_eq!(accepted["cont"], json!(true));
}

#[test]
fn start_returns_only_tombstones_in_the_dirty_window() {
    let (_dir, mut col) = open_collection();
    col.apply_graves(
        &Graves {
            cards: vec![1],
            notes: vec![2],
            decks: vec![3],
        },
        4,
    )
    .unwrap();
    col.usn = 5;

    let mut state = None;
    let graves = call(
        &mut col,
        &mut state,
        "start",
        json!({"minUsn": 4, "lnewer": false, "graves": null}),
    );
    assert_eq!(graves, json!({"cards": [1], "notes": [2], "decks": [3]}));

    // A later horizon sees nothing.
    let mut state = None;
    let graves = call(
        &mut col,
        &mut state,
        "start",
        json!({"minUsn": 6, "lnewer": false}),
    );
    assert_eq!(graves, json!({"cards": [], "notes": [], "decks": []}));
}

#[test]
fn apply_graves_twice_equals_once() {
    let (_dir, mut col) = open_collection();
    col.merge_cards(&[card_row(7, 10, 0, 0)], 99).unwrap();

    let mut state = None;
    call(&mut col, &mut state, "start", json!({"minUsn": 0, "lnewer": false}));
    let chunk = json!({"chunk": {"cards": [7], "notes": [], "decks": []}});
    call(&mut col, &mut state, "applyGraves", chunk.clone());
    call(&mut col, &mut state, "applyGraves", chunk);

    let graves = col.pending_graves(0).unwrap();
    assert_eq!(graves.cards, vec![7]);
    assert_eq!(col.sanity_check().unwrap()[0], json!(0), "card is gone");
    assert_eq!(col.sanity_check().unwrap()[3], json!(1), "one tombstone");
}

fn card_row(id: i64, modified: i64, usn: i64, reps: i64) -> Value {
    json!([id, 1, 1, 0, modified, usn, 0, 0, 0, 0, 2500, reps, 0, 0, 0, 0, 0, ""])
}

fn note_row(id: i64, modified: i64, usn: i64, fields: &str) -> Value {
    json!([id, format!("guid{id}"), 1000, modified, usn, "", fields, "", "", 0, ""])
}

#[test]
fn chunk_streams_dirty_rows_stamped_with_max_usn() {
    let (_dir, mut col) = open_collection();
    col.merge_cards(&[card_row(1, 10, 2, 0), card_row(2, 11, 2, 0)], 99)
        .unwrap();
    col.merge_notes(&[note_row(1, 10, 2, "hello\u{1f}world")], 99)
        .unwrap();
    col.usn = 5;

    let mut state = None;
    call(&mut col, &mut state, "start", json!({"minUsn": 1, "lnewer": false}));
    call(
        &mut col,
        &mut state,
        "applyChanges",
        json!({"changes": {"models": [], "decks": [[], []], "tags": []}}),
    );

    let chunk = call(&mut col, &mut state, "chunk", json!({}));
    assert_eq!(chunk["done"], json!(true));
    let cards = chunk["cards"].as_array().unwrap();
    assert_eq!(cards.len(), 2);
    for card in cards {
        assert_eq!(card[5], json!(5), "usn rewritten to max_usn");
    }
    let notes = chunk["notes"].as_array().unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0][4], json!(5));
    // Derived note columns travel blank; the receiver recomputes them.
    assert_eq!(notes[0][7], json!(""));

    // Drained tables were restamped in the database too, so a second sync
    // from the new horizon sees nothing.
    let mut state = None;
    call(&mut col, &mut state, "start", json!({"minUsn": 6, "lnewer": false}));
    call(
        &mut col,
        &mut state,
        "applyChanges",
        json!({"changes": {"models": [], "decks": [[], []], "tags": []}}),
    );
    let chunk = call(&mut col, &mut state, "chunk", json!({}));
    assert_eq!(chunk["cards"], json!([]));
    assert_eq!(chunk["notes"], json!([]));
}

#[test]
fn apply_chunk_merges_client_rows_latest_wins() {
    let (_dir, mut col) = open_collection();
    col.merge_cards(&[card_row(1, 100, 2, 1)], 99).unwrap();
    col.usn = 5;

    let mut state = None;
    call(&mut col, &mut state, "start", json!({"minUsn": 1, "lnewer": false}));
    call(
        &mut col,
        &mut state,
        "applyChanges",
        json!({"changes": {"models": [], "decks": [[], []], "tags": []}}),
    );

    // The client's copy of card 1 is older and loses; card 2 is new.
    call(
        &mut col,
        &mut state,
        "applyChunk",
        json!({"chunk": {"cards": [card_row(1, 50, 5, 7), card_row(2, 60, 5, 3)]}}),
    );
    assert_eq!(col.sanity_check().unwrap()[0], json!(2));

    let mut state = None;
    call(&mut col, &mut state, "start", json!({"minUsn": 0, "lnewer": false}));
    call(
        &mut col,
        &mut state,
        "applyChanges",
        json!({"changes": {"models": [], "decks": [[], []], "tags": []}}),
    );
    let chunk = call(&mut col, &mut state, "chunk", json!({}));
    let cards = chunk["cards"].as_array().unwrap();
    let card1 = cards.iter().find(|c| c[0] == json!(1)).unwrap();
    assert_eq!(card1[11], json!(1), "local newer copy survived");
}

#[test]
fn apply_changes_merges_entities_and_reports_local_ones() {
    let (_dir, mut col) = open_collection();
    col.model_update(json!({"id": 100, "name": "Server Basic", "mod": 50, "usn": 3}));
    col.usn = 5;

    let mut state = None;
    call(&mut col, &mut state, "start", json!({"minUsn": 2, "lnewer": true}));

    let lchg = call(
        &mut col,
        &mut state,
        "applyChanges",
        json!({"changes": {
            "models": [
                {"id": 100, "name": "Client Basic", "mod": 80, "usn": 5},
                {"id": 200, "name": "Cloze", "mod": 70, "usn": 5},
            ],
            "decks": [[{"id": 1, "name": "Default", "mod": 90, "usn": 5}], []],
            "tags": ["verbs"],
        }}),
    );

    // Server reports its own dirty model back.
    let models = lchg["models"].as_array().unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0]["name"], json!("Server Basic"));
    // Client said it was newer, so the server keeps conf to itself.
    assert!(lchg.get("conf").is_none());

    // Client copies won on mod: both models and the deck are adopted.
    assert_eq!(col.model_get("100").unwrap()["name"], json!("Client Basic"));
    assert_eq!(col.model_get("200").unwrap()["name"], json!("Cloze"));
    assert_eq!(col.deck_get("1").unwrap()["name"], json!("Default"));
    // Tags registered at the snapshot usn.
    assert_eq!(col.tags_items(), vec![("verbs".to_string(), 5)]);
}

#[test]
fn sanity_check_flags_divergence() {
    let (_dir, mut col) = open_collection();
    let mut state = None;
    call(&mut col, &mut state, "start", json!({"minUsn": 0, "lnewer": false}));

    let bad = call(
        &mut col,
        &mut state,
        "sanityCheck2",
        json!({"client": [1, 0, 0, 0, 0, 0, 0, 1]}),
    );
    assert_eq!(bad["status"], json!("bad"));
    assert_eq!(bad["c"], json!([1, 0, 0, 0, 0, 0, 0, 1]));
    assert_eq!(bad["s"], json!([0, 0, 0, 0, 0, 0, 0, 1]));
}

#[test]
fn finish_advances_past_both_horizons() {
    let (_dir, mut col) = open_collection();
    col.usn = 3;
    let mut state = None;
    call(&mut col, &mut state, "start", json!({"minUsn": 2, "lnewer": false}));
    let usn_before = col.usn;

    let finished = call(&mut col, &mut state, "finish", json!({}));
    assert!(col.usn > usn_before.max(2));
    assert_eq!(col.modified, finished.as_i64().unwrap());
}
