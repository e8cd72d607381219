//! Remote object storage tier.
//!
//! Two layers:
//! - [`MultipartClient`] mirrors the S3 wire operations
//!   (CreateMultipartUpload, UploadPart, CompleteMultipartUpload,
//!   AbortMultipartUpload, GetObject). Implemented by [`s3::S3Client`] and
//!   the in-process [`memory::MemoryObjectClient`].
//! - [`RemoteObjectProvider`] is the capability the rest of the service
//!   uses: upload a local file under a key, download a key to a local path.
//!   [`multipart::MultipartProvider`] implements it on top of any client.

pub mod memory;
pub mod multipart;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use std::{io, path::Path, pin::Pin};
use thiserror::Error;
use tokio::io::AsyncRead;

pub use memory::MemoryObjectClient;
pub use multipart::MultipartProvider;
pub use s3::{S3Client, S3Settings};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote object `{0}` not found")]
    NotFound(String),
    #[error("{operation} failed for `{key}`: {message}")]
    Protocol {
        operation: &'static str,
        key: String,
        message: String,
    },
    #[error("invalid part sequence for `{key}`: {reason}")]
    InvalidPartSequence { key: String, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RemoteError {
    pub fn protocol(operation: &'static str, key: &str, message: impl ToString) -> Self {
        Self::Protocol {
            operation,
            key: key.to_string(),
            message: message.to_string(),
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Body of a fetched object, read chunk by chunk.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// One uploaded part, as listed in the completion request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based, contiguous part number.
    pub part_number: i32,
    /// Integrity tag returned by UploadPart.
    pub etag: String,
}

/// S3-compatible multipart and object-read operations.
#[async_trait]
pub trait MultipartClient: Send + Sync {
    /// Start a multipart session for `key`, returning its upload id.
    async fn create_multipart_upload(&self, key: &str) -> RemoteResult<String>;

    /// Upload one part and return its ETag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> RemoteResult<String>;

    /// Assemble the object from `parts`, in part-number order.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> RemoteResult<()>;

    /// Discard an unfinished session and its parts.
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> RemoteResult<()>;

    /// Open the object body, or `NotFound` if the key does not exist.
    async fn get_object(&self, key: &str) -> RemoteResult<ObjectReader>;
}

/// Upload/download capability of a remote object store backend.
#[async_trait]
pub trait RemoteObjectProvider: Send + Sync {
    /// Store the file at `local_path` under `key`.
    async fn upload(&self, key: &str, local_path: &Path) -> RemoteResult<()>;

    /// Write the object stored under `key` to `destination`.
    ///
    /// Fails with [`RemoteError::NotFound`] when the key does not exist.
    async fn download(&self, key: &str, destination: &Path) -> RemoteResult<()>;
}
