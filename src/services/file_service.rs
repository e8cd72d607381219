//! Upload, describe and download over the tiered store.
//!
//! Upload order is fixed: bytes are durably staged, then the descriptor is
//! created, then the offload job is published. A replication job therefore
//! never races its descriptor, and the response never waits for the remote
//! copy.

use crate::{
    models::{
        file::{
            FileDescriptor, NewFileDescriptor, file_extension, format_for_extension, storage_name,
        },
        offload_job::OffloadJobRequest,
    },
    services::{
        metadata::{MetadataError, MetadataStore},
        offload::OffloadQueue,
        remote::{RemoteError, RemoteObjectProvider},
        retrieval::{FileDownload, RetrievalCoordinator, RetrievalError},
        staging::{LocalStagingStore, StagedFile},
    },
};
use bytes::Bytes;
use futures::Stream;
use sqlx::SqlitePool;
use std::{io, path::Path, sync::Arc};
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FileServiceError {
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error("file identifier `{0}` already exists")]
    Conflict(String),
    #[error("invalid upload: {0}")]
    InvalidUpload(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<MetadataError> for FileServiceError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(id) => Self::NotFound(id),
            MetadataError::Conflict(id) => Self::Conflict(id),
            MetadataError::Sqlx(e) => Self::Sqlx(e),
        }
    }
}

impl From<RetrievalError> for FileServiceError {
    fn from(err: RetrievalError) -> Self {
        match err {
            RetrievalError::NotFound(id) => Self::NotFound(id),
            RetrievalError::Metadata(e) => e.into(),
            RetrievalError::Remote(e) => Self::Remote(e),
            RetrievalError::Io(e) => Self::Io(e),
        }
    }
}

pub type FileServiceResult<T> = Result<T, FileServiceError>;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct FileService {
    staging: LocalStagingStore,
    metadata: MetadataStore,
    offload: OffloadQueue,
    retrieval: RetrievalCoordinator,
}

impl FileService {
    pub fn new(
        staging: LocalStagingStore,
        metadata: MetadataStore,
        offload: OffloadQueue,
        provider: Arc<dyn RemoteObjectProvider>,
    ) -> Self {
        let retrieval = RetrievalCoordinator::new(metadata.clone(), staging.clone(), provider);
        Self {
            staging,
            metadata,
            offload,
            retrieval,
        }
    }

    pub fn db(&self) -> &SqlitePool {
        self.metadata.pool()
    }

    pub fn storage_root(&self) -> &Path {
        self.staging.root()
    }

    /// Stage an upload, record it, schedule its offload. Returns the identifier.
    ///
    /// `declared_len` only selects the write strategy; the recorded size is
    /// measured on disk.
    pub async fn upload<S>(
        &self,
        original_name: &str,
        declared_len: Option<u64>,
        body: S,
    ) -> FileServiceResult<String>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        if original_name.trim().is_empty() {
            return Err(FileServiceError::InvalidUpload("missing filename".into()));
        }

        let identifier = Uuid::new_v4().to_string();
        let extension = file_extension(original_name);

        let staged = self
            .staging
            .stage(&identifier, &extension, declared_len, body)
            .await?;

        let record = NewFileDescriptor {
            identifier: identifier.clone(),
            original_name: original_name.to_string(),
            size_bytes: staged.size_bytes as i64,
            format: Some(format_for_extension(&extension).to_string()),
            extension: extension.clone(),
        };
        if let Err(err) = self.metadata.create_record(record).await {
            self.discard(&staged).await;
            return Err(err.into());
        }

        info!(
            identifier = %identifier,
            original_name,
            size_bytes = staged.size_bytes,
            strategy = ?staged.strategy,
            "file stored locally"
        );

        let job = OffloadJobRequest {
            identifier: identifier.clone(),
            local_path: staged.path.to_string_lossy().into_owned(),
            remote_key: storage_name(&identifier, &extension),
        };
        if let Err(err) = self.offload.enqueue(job).await {
            // The descriptor stays `pending`; the local copy is still served.
            error!(identifier = %identifier, error = %err, "failed to enqueue offload job");
        }

        Ok(identifier)
    }

    pub async fn describe(&self, identifier: &str) -> FileServiceResult<FileDescriptor> {
        Ok(self.metadata.require(identifier).await?)
    }

    pub async fn download(&self, identifier: &str) -> FileServiceResult<FileDownload> {
        Ok(self.retrieval.retrieve(identifier).await?)
    }

    /// Remove a staged file whose descriptor could not be written.
    async fn discard(&self, staged: &StagedFile) {
        if let Err(err) = fs::remove_file(&staged.path).await {
            warn!(
                path = %staged.path.display(),
                error = %err,
                "failed to remove staged file after metadata error"
            );
        }
    }
}
