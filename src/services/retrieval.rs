//! Retrieval coordinator: serve from local staging, rehydrate from remote.
//!
//! Per request: resolve the descriptor, check the local path, fetch from
//! the remote provider when the local copy is gone, then stream the local
//! file. Remote misses are not cached; every request re-checks.

use crate::{
    models::file::FileDescriptor,
    services::{
        chunked::chunks,
        metadata::{MetadataError, MetadataStore},
        remote::{RemoteError, RemoteObjectProvider},
        staging::{LocalStagingStore, PartialFile},
    },
};
use bytes::Bytes;
use futures::Stream;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::{
    io,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
};
use thiserror::Error;
use tokio::fs::{self, File};
use tracing::{debug, info};

/// Content type declared on every download.
pub const DOWNLOAD_CONTENT_TYPE: &str = "application/octet-stream";

/// RFC 3986 unreserved characters stay literal, everything else is encoded.
const FILENAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Remote(RemoteError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Chunked body of a file being served.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Where a served file came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Local,
    Rehydrated,
}

/// Everything the HTTP layer needs to answer a download.
pub struct FileDownload {
    pub descriptor: FileDescriptor,
    pub path: PathBuf,
    pub content_length: u64,
    pub content_type: &'static str,
    pub content_disposition: String,
    pub source: Source,
    pub body: ByteStream,
}

/// `attachment; filename*=UTF-8''<percent-encoded name>`
pub fn content_disposition(original_name: &str) -> String {
    format!(
        "attachment; filename*=UTF-8''{}",
        utf8_percent_encode(original_name, FILENAME_ENCODE_SET)
    )
}

#[derive(Clone)]
pub struct RetrievalCoordinator {
    metadata: MetadataStore,
    staging: LocalStagingStore,
    provider: Arc<dyn RemoteObjectProvider>,
}

impl RetrievalCoordinator {
    pub fn new(
        metadata: MetadataStore,
        staging: LocalStagingStore,
        provider: Arc<dyn RemoteObjectProvider>,
    ) -> Self {
        Self {
            metadata,
            staging,
            provider,
        }
    }

    pub async fn retrieve(&self, identifier: &str) -> Result<FileDownload, RetrievalError> {
        let descriptor = self
            .metadata
            .get_by_identifier(identifier)
            .await?
            .ok_or_else(|| RetrievalError::NotFound(identifier.to_string()))?;

        let path = descriptor.local_path(self.staging.root());
        let source = if fs::try_exists(&path).await? {
            Source::Local
        } else {
            self.rehydrate(&descriptor, &path).await?;
            Source::Rehydrated
        };

        let file = File::open(&path).await?;
        let content_length = file.metadata().await?.len();
        debug!(identifier, ?source, content_length, "serving file");

        Ok(FileDownload {
            content_disposition: content_disposition(&descriptor.original_name),
            content_type: DOWNLOAD_CONTENT_TYPE,
            body: Box::pin(chunks(file, self.staging.chunk_size())),
            descriptor,
            path,
            content_length,
            source,
        })
    }

    /// Fetch the remote copy into a temporary file, then move it into place.
    async fn rehydrate(
        &self,
        descriptor: &FileDescriptor,
        path: &Path,
    ) -> Result<(), RetrievalError> {
        let key = descriptor.storage_name();
        info!(identifier = %descriptor.identifier, key = %key, "local copy missing, fetching from remote");

        let (partial, file) = PartialFile::create(self.staging.partial_path()).await?;
        drop(file);

        self.provider
            .download(&key, partial.path())
            .await
            .map_err(|err| match err {
                RemoteError::NotFound(_) => RetrievalError::NotFound(descriptor.identifier.clone()),
                other => RetrievalError::Remote(other),
            })?;
        partial.commit(path).await?;

        info!(identifier = %descriptor.identifier, "file rehydrated from remote");
        Ok(())
    }
}
