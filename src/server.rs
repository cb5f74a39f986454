//! HTTP endpoint accepting snapshot uploads.
//!
//! `POST /upload` takes a multipart form with a `file` field holding a
//! BroodMinder app SQLite export and replays it into the configured store.

use crate::replay::{ReplayError, ReplaySummary, Watermarks, replay_file};
use crate::sink::{RetryPolicy, Sink};
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

/// Multipart field carrying the snapshot.
pub const FILE_FIELD: &str = "file";

/// A store that can both receive readings and report watermarks.
pub trait RemoteStore: Sink + Watermarks {}

impl<T: Sink + Watermarks + ?Sized> RemoteStore for T {}

#[derive(Clone)]
pub struct ServerState {
    store: Arc<dyn RemoteStore>,
    upload_dir: PathBuf,
    retry: RetryPolicy,
    // One replay at a time
    replay_lock: Arc<Mutex<()>>,
}

impl ServerState {
    pub fn new(store: Arc<dyn RemoteStore>, upload_dir: PathBuf, retry: RetryPolicy) -> Self {
        Self {
            store,
            upload_dir,
            retry,
            replay_lock: Arc::new(Mutex::new(())),
        }
    }
}

#[derive(Error, Debug)]
enum UploadError {
    #[error("No file uploaded")]
    MissingFile,
    #[error("Invalid upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Could not store upload: {0}")]
    Store(#[from] io::Error),
    #[error("Import failed: {0}")]
    Replay(#[from] ReplayError),
}

#[derive(Serialize)]
struct Message {
    message: String,
}

#[derive(Serialize)]
struct Imported {
    message: &'static str,
    data: ReplaySummary,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = match &self {
            UploadError::MissingFile => StatusCode::BAD_REQUEST,
            UploadError::Multipart(err) => err.status(),
            UploadError::Store(_) | UploadError::Replay(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("{self}");
        }
        let body = Message {
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Create the upload router.
pub fn router(state: ServerState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/upload", post(upload))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

/// Serve `router` on `listener` until the process is stopped.
pub async fn serve(listener: TcpListener, router: Router) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Accepting snapshot uploads");
    }
    axum::serve(listener, router).await
}

/// GET / - liveness banner
async fn home() -> &'static str {
    "BroodMinder bridge is running"
}

/// POST /upload - store the snapshot, replay it, report per-device results
async fn upload(
    State(state): State<ServerState>,
    multipart: Multipart,
) -> Result<Json<Imported>, UploadError> {
    let path = store_upload(&state.upload_dir, multipart).await?;

    let _guard = state.replay_lock.lock().await;
    info!(path = %path.display(), "Replaying uploaded snapshot");
    let summary = replay_file(&path, &*state.store, &*state.store, &state.retry).await?;
    info!(delivered = summary.delivered(), "Snapshot imported");

    Ok(Json(Imported {
        message: "Data imported",
        data: summary,
    }))
}

/// Write the `file` field to a uniquely named file in `dir`.
async fn store_upload(dir: &Path, mut multipart: Multipart) -> Result<PathBuf, UploadError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let data = field.bytes().await?;
        let path = dir.join(format!("broodminder-{}.db", Uuid::new_v4()));
        if let Err(err) = tokio::fs::write(&path, &data).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(err.into());
        }
        return Ok(path);
    }
    Err(UploadError::MissingFile)
}
