//! Represents an uploaded file's descriptor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::path::{Path, PathBuf};

/// Fallback format when the extension maps to no known MIME type.
pub const UNKNOWN_FORMAT: &str = "unknown";

/// Replication state of the remote copy of a file.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ReplicationStatus {
    /// Stored locally, offload not yet confirmed.
    Pending,
    /// Remote copy written and completed.
    Completed,
    /// Offload gave up after exhausting its retries.
    Failed,
}

/// Persisted metadata record for one uploaded file.
///
/// The descriptor never stores a path: both the local staging path and the
/// remote key are derived from `identifier` and `extension`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileDescriptor {
    /// Opaque unique token (UUID v4) assigned at upload time.
    pub identifier: String,

    /// Client-supplied filename, used only for display.
    pub original_name: String,

    /// Byte length of the stored file, measured after the write.
    pub size_bytes: i64,

    /// Extension including the leading dot, or empty.
    pub extension: String,

    /// Best-effort MIME type derived from the extension.
    pub format: Option<String>,

    /// Whether the remote copy has been confirmed.
    pub replication_status: ReplicationStatus,

    /// When this descriptor was created.
    pub created_at: DateTime<Utc>,
}

impl FileDescriptor {
    /// `{identifier}{extension}`, the local filename and the remote key.
    pub fn storage_name(&self) -> String {
        storage_name(&self.identifier, &self.extension)
    }

    /// Local staging path for this file under `root`.
    pub fn local_path(&self, root: &Path) -> PathBuf {
        root.join(self.storage_name())
    }
}

/// Fields supplied when creating a descriptor.
#[derive(Clone, Debug)]
pub struct NewFileDescriptor {
    pub identifier: String,
    pub original_name: String,
    pub size_bytes: i64,
    pub extension: String,
    pub format: Option<String>,
}

pub fn storage_name(identifier: &str, extension: &str) -> String {
    format!("{identifier}{extension}")
}

/// Split the extension off a client filename.
///
/// Only the final path component is considered and leading dots do not
/// start an extension, so `notes.txt` gives `.txt`, `archive.tar.gz`
/// gives `.gz` and `.bashrc` gives an empty extension. Extensions with
/// characters outside `[A-Za-z0-9_-]` are dropped.
pub fn file_extension(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename);
    let stem_start = base.len() - base.trim_start_matches('.').len();
    let Some(dot) = base[stem_start..].rfind('.') else {
        return String::new();
    };

    let ext = &base[stem_start + dot..];
    let valid = ext.len() > 1
        && ext[1..]
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid { ext.to_string() } else { String::new() }
}

/// Guess a MIME type from an extension (with or without leading dot).
///
/// The extension is only a hint: the content itself is never inspected.
pub fn format_for_extension(extension: &str) -> &'static str {
    let ext = extension.trim_start_matches('.').to_ascii_lowercase();
    match ext.as_str() {
        "txt" | "text" | "log" => "text/plain",
        "csv" => "text/csv",
        "htm" | "html" => "text/html",
        "css" => "text/css",
        "md" => "text/markdown",
        "xml" => "application/xml",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "odt" => "application/vnd.oasis.opendocument.text",
        "rtf" => "application/rtf",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        "gz" | "tgz" => "application/gzip",
        "bz2" => "application/x-bzip2",
        "7z" => "application/x-7z-compressed",
        "rar" => "application/vnd.rar",
        "bin" | "exe" | "dll" => "application/octet-stream",
        "wasm" => "application/wasm",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "ico" => "image/vnd.microsoft.icon",
        "tif" | "tiff" => "image/tiff",
        "avif" => "image/avif",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        _ => UNKNOWN_FORMAT,
    }
}
