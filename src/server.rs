//! The request dispatcher: decodes sync requests, authenticates or
//! resolves the session, routes by operation name and submits the work to
//! the session's collection worker.

use crate::config::{SessionBackend, SyncConfig, UserBackend};
use crate::error::{Result, SyncError};
use crate::session::{
    MemorySessionStore, Session, SessionStore, SqliteSessionStore, generate_host_key,
};
use crate::sync::full::FullSyncManager;
use crate::sync::{SyncOutput, collection as collection_sync, media as media_sync};
use crate::users::{SqliteUserManager, UserManager};
use crate::worker::{WorkerContext, WorkerPool};
use axum::Router;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::routing::{get, post};
use flate2::read::GzDecoder;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Collection uploads are whole database files; give them headroom well
/// past the media archive cap.
const MAX_REQUEST_BYTES: usize = 256 * 1024 * 1024;

/// Hooks run on the worker immediately before/after an operation.
pub type Hook = Arc<dyn Fn(&mut WorkerContext, &Session) -> Result<()> + Send + Sync>;

#[derive(Default, Clone)]
pub struct Hooks {
    pre: HashMap<String, Hook>,
    post: HashMap<String, Hook>,
}

/// Which handler kind owns an operation. The tables are static; there is
/// no name-based reflection.
#[derive(Clone, Copy)]
enum OpKind {
    Collection,
    Media,
    Upload,
    Download,
}

fn classify(op: &str) -> Option<OpKind> {
    if op == "upload" {
        Some(OpKind::Upload)
    } else if op == "download" {
        Some(OpKind::Download)
    } else if collection_sync::OPERATIONS.contains(&op) {
        Some(OpKind::Collection)
    } else if media_sync::OPERATIONS.contains(&op) {
        Some(OpKind::Media)
    } else {
        None
    }
}

/// A decoded sync request: the JSON payload (or raw bytes for database and
/// archive uploads) plus the token fields.
pub struct SyncRequest {
    pub data: Value,
    pub raw: Option<Vec<u8>>,
    pub host_key: Option<String>,
    pub session_key: Option<String>,
    pub media_skey: Option<String>,
}

impl SyncRequest {
    async fn decode(mut multipart: Multipart, query: &HashMap<String, String>) -> Result<Self> {
        let mut fields = HashMap::new();
        let mut raw_data = None;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| SyncError::bad_request(format!("malformed form data: {e}")))?
        {
            let name = field.name().map(str::to_string);
            match name.as_deref() {
                Some("data") => {
                    raw_data = Some(
                        field
                            .bytes()
                            .await
                            .map_err(|e| SyncError::bad_request(format!("unreadable payload: {e}")))?
                            .to_vec(),
                    );
                }
                Some(name) => {
                    let text = field
                        .text()
                        .await
                        .map_err(|e| SyncError::bad_request(format!("unreadable field: {e}")))?;
                    fields.insert(name.to_string(), text);
                }
                None => {}
            }
        }

        let compressed = fields
            .get("c")
            .map(|c| c.parse::<i64>().unwrap_or(0) != 0)
            .unwrap_or(false);
        let (data, raw) = decode_payload(raw_data, compressed)?;

        Ok(Self {
            data,
            raw,
            host_key: fields.get("k").cloned().or_else(|| query.get("k").cloned()),
            session_key: fields.get("sk").cloned(),
            media_skey: fields.get("s").cloned(),
        })
    }
}

/// Gunzips when the compression flag is set, then tries JSON; payloads
/// that are not JSON (database files, media archives) stay raw.
fn decode_payload(raw: Option<Vec<u8>>, compressed: bool) -> Result<(Value, Option<Vec<u8>>)> {
    let Some(mut bytes) = raw else {
        return Ok((json!({}), None));
    };
    if compressed {
        let mut inflated = Vec::new();
        GzDecoder::new(bytes.as_slice())
            .read_to_end(&mut inflated)
            .map_err(|e| SyncError::bad_request(format!("bad gzip payload: {e}")))?;
        bytes = inflated;
    }
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(value) => Ok((value, None)),
        Err(_) => Ok((json!({}), Some(bytes))),
    }
}

pub struct SyncApp {
    pub config: SyncConfig,
    users: Arc<dyn UserManager>,
    sessions: Arc<dyn SessionStore>,
    pool: WorkerPool,
    full_sync: FullSyncManager,
    hooks: Hooks,
}

impl SyncApp {
    pub fn new(
        config: SyncConfig,
        users: Arc<dyn UserManager>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            config,
            users,
            sessions,
            pool: WorkerPool::new(),
            full_sync: FullSyncManager,
            hooks: Hooks::default(),
        }
    }

    /// Builds the app with the managers named by the configuration.
    pub fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let users: Arc<dyn UserManager> = match config.user_manager {
            UserBackend::Sqlite => Arc::new(SqliteUserManager::open(&config.auth_db_path)?),
        };
        let sessions: Arc<dyn SessionStore> = match config.session_manager {
            SessionBackend::Memory => Arc::new(MemorySessionStore::new()),
            SessionBackend::Sqlite => Arc::new(SqliteSessionStore::open(&config.session_db_path)?),
        };
        Ok(Self::new(config.clone(), users, sessions))
    }

    pub fn with_pre_hook(mut self, op: &str, hook: Hook) -> Self {
        self.hooks.pre.insert(op.to_string(), hook);
        self
    }

    pub fn with_post_hook(mut self, op: &str, hook: Hook) -> Self {
        self.hooks.post.insert(op.to_string(), hook);
        self
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    pub async fn dispatch(&self, op: &str, req: SyncRequest) -> Result<SyncOutput> {
        if op == "hostKey" {
            return self.host_key(&req).await;
        }

        let mut session = self.resolve_session(&req).await?;
        let kind = classify(op).ok_or_else(|| SyncError::NotFound(op.to_string()))?;
        debug!(username = %session.username, op, "dispatching sync operation");

        if op == "meta" {
            self.record_client_info(&mut session, &req).await?;
        }

        let op_name = op.to_string();
        let pre = self.hooks.pre.get(op).cloned();
        let post = self.hooks.post.get(op).cloned();
        let full_sync = self.full_sync.clone();
        let job_session = session.clone();
        let data = req.data;
        let raw = req.raw;

        self.pool
            .execute(session.collection_path(), move |ctx| {
                if let Some(hook) = &pre {
                    hook(ctx, &job_session)?;
                }
                let output = match kind {
                    OpKind::Upload => {
                        let bytes = raw.ok_or_else(|| {
                            SyncError::bad_request("upload carried no collection payload")
                        })?;
                        full_sync.upload(ctx, &bytes, &job_session)
                    }
                    OpKind::Download => full_sync.download(ctx, &job_session),
                    OpKind::Collection => {
                        let col = ctx.collection()?;
                        let mut state = job_session
                            .sync_state
                            .lock()
                            .map_err(|_| SyncError::internal("sync state lock poisoned"))?;
                        collection_sync::dispatch(col, &mut *state, &op_name, data)
                    }
                    OpKind::Media => {
                        let col = ctx.collection()?;
                        media_sync::dispatch(col, &op_name, data, raw, &job_session.skey)
                    }
                }?;
                if let Some(hook) = &post {
                    hook(ctx, &job_session)?;
                }
                Ok(output)
            })
            .await
    }

    async fn host_key(&self, req: &SyncRequest) -> Result<SyncOutput> {
        let username = req.data.get("u").and_then(Value::as_str);
        let password = req.data.get("p").and_then(Value::as_str);
        let (Some(username), Some(password)) = (username, password) else {
            return Err(SyncError::AuthFailure);
        };
        if !self.users.authenticate(username, password).await? {
            return Err(SyncError::AuthFailure);
        }
        let Some(dirname) = self.users.userdir(username).await? else {
            return Err(SyncError::AuthFailure);
        };

        let hkey = generate_host_key(username);
        let session = Session::new(hkey.clone(), username, self.config.data_root.join(dirname))?;
        self.sessions.save(&hkey, &session).await?;
        info!(username, "session established");
        Ok(SyncOutput::Json(json!({ "key": hkey })))
    }

    async fn resolve_session(&self, req: &SyncRequest) -> Result<Session> {
        if let Some(hkey) = &req.host_key {
            if let Some(session) = self.sessions.load(hkey).await? {
                return Ok(session);
            }
        }
        if let Some(skey) = &req.session_key {
            if let Some(session) = self.sessions.load_from_skey(skey).await? {
                return Ok(session);
            }
        }
        Err(SyncError::AuthFailure)
    }

    /// `meta` carries the client's protocol version and identity; record
    /// them on the session before dispatching.
    async fn record_client_info(&self, session: &mut Session, req: &SyncRequest) -> Result<()> {
        if session.skey.is_empty() {
            if let Some(skey) = &req.media_skey {
                session.skey = skey.clone();
            }
        }
        if let Some(version) = req.data.get("v").and_then(Value::as_i64) {
            session.version = Some(version);
        }
        if let Some(cv) = req.data.get("cv").and_then(Value::as_str) {
            session.client_version = Some(cv.to_string());
        }
        let hkey = session.hkey.clone();
        self.sessions.save(&hkey, session).await
    }
}

pub fn router(app: Arc<SyncApp>) -> Router {
    let collection_route = format!("{}:op", app.config.base_url);
    let media_route = format!("{}:op", app.config.base_media_url);
    Router::new()
        .route("/", get(index))
        .route(&collection_route, post(sync_op))
        .route(&media_route, post(sync_op))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

async fn index() -> &'static str {
    "anki sync server is running"
}

async fn sync_op(
    State(app): State<Arc<SyncApp>>,
    Path(op): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    multipart: Multipart,
) -> Result<SyncOutput> {
    let req = SyncRequest::decode(multipart, &query).await?;
    app.dispatch(&op, req).await
}
