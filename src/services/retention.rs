//! Age-based cleanup of the local tier.
//!
//! A staged file may only leave local disk once a remote copy exists. Files
//! with no descriptor at all (orphans, abandoned `.tmp-*` writes) have
//! nothing to protect and go once they are old enough.

use crate::{
    models::file::ReplicationStatus,
    services::{metadata::MetadataStore, staging::PARTIAL_PREFIX},
};
use std::{
    io,
    path::PathBuf,
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Metadata(#[from] crate::services::metadata::MetadataError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Regular files seen in the storage root.
    pub examined: usize,
    pub deleted: usize,
    /// Old enough, but replication is pending or failed.
    pub kept_unreplicated: usize,
    /// Younger than the retention age.
    pub kept_recent: usize,
}

pub struct RetentionSweeper {
    root: PathBuf,
    metadata: MetadataStore,
    max_age: Duration,
}

impl RetentionSweeper {
    pub fn new(root: impl Into<PathBuf>, metadata: MetadataStore, max_age: Duration) -> Self {
        Self {
            root: root.into(),
            metadata,
            max_age,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport, RetentionError> {
        let mut report = SweepReport::default();
        let now = SystemTime::now();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            report.examined += 1;

            let age = meta
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < self.max_age {
                report.kept_recent += 1;
                continue;
            }

            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.is_evictable(&name).await? {
                match fs::remove_file(&path).await {
                    Ok(()) => {
                        debug!(path = %path.display(), age_secs = age.as_secs(), "evicted local copy");
                        report.deleted += 1;
                    }
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "failed to evict local copy");
                    }
                }
            } else {
                report.kept_unreplicated += 1;
            }
        }

        info!(
            root = %self.root.display(),
            examined = report.examined,
            deleted = report.deleted,
            kept_unreplicated = report.kept_unreplicated,
            kept_recent = report.kept_recent,
            "retention sweep finished"
        );
        Ok(report)
    }

    async fn is_evictable(&self, file_name: &str) -> Result<bool, RetentionError> {
        if file_name.starts_with(PARTIAL_PREFIX) {
            return Ok(true);
        }
        let identifier = identifier_of(file_name);
        let status = self
            .metadata
            .get_by_identifier(identifier)
            .await?
            .map(|descriptor| descriptor.replication_status);
        Ok(matches!(status, None | Some(ReplicationStatus::Completed)))
    }
}

/// Stored names are `<uuid><extension>` and identifiers contain no dots.
fn identifier_of(file_name: &str) -> &str {
    file_name
        .split_once('.')
        .map_or(file_name, |(identifier, _)| identifier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, models::file::NewFileDescriptor};
    use tempfile::TempDir;

    async fn record(metadata: &MetadataStore, identifier: &str, status: ReplicationStatus) {
        metadata
            .create_record(NewFileDescriptor {
                identifier: identifier.into(),
                original_name: format!("{identifier}.txt"),
                size_bytes: 1,
                extension: ".txt".into(),
                format: Some("text/plain".into()),
            })
            .await
            .unwrap();
        metadata
            .set_replication_status(identifier, status)
            .await
            .unwrap();
    }

    async fn setup() -> (TempDir, MetadataStore) {
        let dir = TempDir::new().unwrap();
        let metadata = MetadataStore::new(db::connect_in_memory().await.unwrap());
        record(&metadata, "done", ReplicationStatus::Completed).await;
        record(&metadata, "waiting", ReplicationStatus::Pending).await;
        record(&metadata, "broken", ReplicationStatus::Failed).await;
        for name in ["done.txt", "waiting.txt", "broken.txt", "orphan.bin", ".tmp-abc"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        (dir, metadata)
    }

    #[test]
    fn identifier_is_the_name_before_the_extension() {
        assert_eq!(identifier_of("abc.tar"), "abc");
        assert_eq!(identifier_of("abc"), "abc");
    }

    #[tokio::test]
    async fn only_replicated_and_orphaned_files_are_evicted() {
        let (dir, metadata) = setup().await;
        let sweeper = RetentionSweeper::new(dir.path(), metadata, Duration::ZERO);

        let report = sweeper.sweep().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                examined: 5,
                deleted: 3,
                kept_unreplicated: 2,
                kept_recent: 0,
            }
        );
        assert!(!dir.path().join("done.txt").exists());
        assert!(!dir.path().join("orphan.bin").exists());
        assert!(!dir.path().join(".tmp-abc").exists());
        assert!(dir.path().join("waiting.txt").exists());
        assert!(dir.path().join("broken.txt").exists());
        assert!(dir.path().join("nested").is_dir());
    }

    #[tokio::test]
    async fn recent_files_are_kept() {
        let (dir, metadata) = setup().await;
        let sweeper =
            RetentionSweeper::new(dir.path(), metadata, Duration::from_secs(24 * 60 * 60));

        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.examined, 5);
        assert_eq!(report.kept_recent, 5);
        assert_eq!(report.deleted, 0);
        assert!(dir.path().join("done.txt").exists());
    }

    #[tokio::test]
    async fn missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let metadata = MetadataStore::new(db::connect_in_memory().await.unwrap());
        let sweeper =
            RetentionSweeper::new(dir.path().join("absent"), metadata, Duration::ZERO);
        assert!(matches!(sweeper.sweep().await, Err(RetentionError::Io(_))));
    }
}
