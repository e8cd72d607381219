//! HTTP handlers for file upload, description and download.
//! Upload and download bodies are streamed; storage concerns live in
//! `FileService`.

use crate::{errors::AppError, models::file::FileDescriptor, services::file_service::FileService};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State, multipart::MultipartError},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use serde::Serialize;
use std::io;
use tracing::debug;

/// Multipart field carrying the uploaded file.
pub const FILE_FIELD: &str = "file";

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub uid: String,
}

#[derive(Debug, Serialize)]
pub struct FileInfoResponse {
    pub uid: String,
    pub original_name: String,
    pub file_size: i64,
    pub file_extension: String,
    pub file_format: Option<String>,
}

impl From<FileDescriptor> for FileInfoResponse {
    fn from(d: FileDescriptor) -> Self {
        Self {
            uid: d.identifier,
            original_name: d.original_name,
            file_size: d.size_bytes,
            file_extension: d.extension,
            file_format: d.format,
        }
    }
}

/// `POST /files/upload` with a multipart `file` field.
///
/// The request `Content-Length` (the whole multipart body) is passed on as
/// the size hint; it only influences how the bytes are written.
pub async fn upload_file(
    State(service): State<FileService>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let declared_len = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let filename = match field.file_name() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(AppError::bad_request("Uploaded file has no filename")),
        };
        debug!(filename = %filename, ?declared_len, "receiving upload");

        let stream = field.map_err(io::Error::other);
        let uid = service.upload(&filename, declared_len, stream).await?;
        return Ok((StatusCode::CREATED, Json(UploadResponse { uid })));
    }

    Err(AppError::bad_request("Missing multipart field `file`"))
}

/// `GET /files/{uid}`: descriptor as JSON.
pub async fn get_file_info(
    State(service): State<FileService>,
    Path(uid): Path<String>,
) -> Result<Json<FileInfoResponse>, AppError> {
    let descriptor = service.describe(&uid).await?;
    Ok(Json(descriptor.into()))
}

/// `GET /files/download/{uid}`: streams the file, rehydrating it first
/// when only the remote copy is left.
pub async fn download_file(
    State(service): State<FileService>,
    Path(uid): Path<String>,
) -> Result<Response, AppError> {
    let download = service.download(&uid).await?;

    let mut response = Response::new(Body::from_stream(download.body));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(download.content_type),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(download.content_length));
    // Percent-encoding keeps the value ASCII, so this only fails on a bug.
    let disposition = HeaderValue::from_str(&download.content_disposition)
        .map_err(|err| AppError::internal(format!("invalid Content-Disposition: {err}")))?;
    headers.insert(header::CONTENT_DISPOSITION, disposition);

    Ok(response)
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), err.body_text())
}
