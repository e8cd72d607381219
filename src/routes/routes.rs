//! Route table.
//!
//! - `GET  /healthz`, `GET /readyz`: probes
//! - `POST /files/upload`: multipart upload, field `file`
//! - `GET  /files/{uid}`: descriptor JSON
//! - `GET  /files/download/{uid}`: file bytes

use crate::{
    handlers::{
        file_handlers::{download_file, get_file_info, upload_file},
        health_handlers::{healthz, readyz},
    },
    services::file_service::FileService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. `max_upload_bytes` bounds the whole upload request body.
pub fn routes(max_upload_bytes: usize) -> Router<FileService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/files/upload",
            post(upload_file).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/files/download/{uid}", get(download_file))
        .route("/files/{uid}", get(get_file_info))
}
