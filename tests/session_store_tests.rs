/// Session store behavior shared by both backends, plus persistence
/// semantics specific to the SQLite store.
use ankisyncd::session::{
    MemorySessionStore, Session, SessionStore, SqliteSessionStore, generate_host_key,
};
use ankisyncd::sync::SyncState;
use tempfile::TempDir;

fn new_session(dir: &TempDir, user: &str) -> Session {
    Session::new(generate_host_key(user), user, dir.path().join(user)).unwrap()
}

#[tokio::test]
async fn memory_store_round_trips_by_both_keys() {
    let dir = TempDir::new().unwrap();
    let store = MemorySessionStore::new();
    let session = new_session(&dir, "alice");

    store.save(&session.hkey, &session).await.unwrap();
    let by_hkey = store.load(&session.hkey).await.unwrap().unwrap();
    assert_eq!(by_hkey.username, "alice");
    let by_skey = store.load_from_skey(&session.skey).await.unwrap().unwrap();
    assert_eq!(by_skey.hkey, session.hkey);

    assert!(store.load("missing").await.unwrap().is_none());
    store.delete(&session.hkey).await.unwrap();
    assert!(store.load(&session.hkey).await.unwrap().is_none());
}

#[tokio::test]
async fn loaded_sessions_share_the_in_flight_sync_state() {
    let dir = TempDir::new().unwrap();
    let store = MemorySessionStore::new();
    let session = new_session(&dir, "alice");
    store.save(&session.hkey, &session).await.unwrap();

    // One request records sync state ...
    let first = store.load(&session.hkey).await.unwrap().unwrap();
    *first.sync_state.lock().unwrap() = Some(SyncState::new(3, 8, false));

    // ... and the next request for the same session sees it.
    let second = store.load(&session.hkey).await.unwrap().unwrap();
    let state = second.sync_state.lock().unwrap();
    let state = state.as_ref().expect("state survives across loads");
    assert_eq!(state.min_usn, 3);
    assert_eq!(state.max_usn, 8);
    assert!(state.lnewer, "server stores the inverted flag");
}

#[tokio::test]
async fn sqlite_store_survives_a_restart_with_a_clean_slate() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("session.db");
    let session = new_session(&dir, "alice");

    {
        let store = SqliteSessionStore::open(&db_path).unwrap();
        store.save(&session.hkey, &session).await.unwrap();
        *session.sync_state.lock().unwrap() = Some(SyncState::new(1, 2, true));
    }

    // A fresh store (new process) reconstructs the session from its row:
    // same identity, no in-flight sync.
    let store = SqliteSessionStore::open(&db_path).unwrap();
    let restored = store.load(&session.hkey).await.unwrap().unwrap();
    assert_eq!(restored.username, "alice");
    assert_eq!(restored.skey, session.skey);
    assert_eq!(restored.path, session.path);
    assert!(restored.sync_state.lock().unwrap().is_none());

    let by_skey = store.load_from_skey(&session.skey).await.unwrap().unwrap();
    assert_eq!(by_skey.hkey, session.hkey);

    store.delete(&session.hkey).await.unwrap();
    assert!(store.load(&session.hkey).await.unwrap().is_none());
}

#[tokio::test]
async fn sqlite_store_caches_live_sessions() {
    let dir = TempDir::new().unwrap();
    let store = SqliteSessionStore::open(dir.path().join("session.db")).unwrap();
    let session = new_session(&dir, "alice");
    store.save(&session.hkey, &session).await.unwrap();

    let first = store.load(&session.hkey).await.unwrap().unwrap();
    *first.sync_state.lock().unwrap() = Some(SyncState::new(0, 4, false));

    // The cached session, not a reconstruction, comes back while the
    // process lives.
    let second = store.load(&session.hkey).await.unwrap().unwrap();
    assert!(second.sync_state.lock().unwrap().is_some());
}
