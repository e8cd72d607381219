//! Metadata resolver: SQLite-backed file descriptors.

use crate::models::file::{FileDescriptor, NewFileDescriptor, ReplicationStatus};
use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error("file identifier `{0}` already exists")]
    Conflict(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

const DESCRIPTOR_COLUMNS: &str = "identifier, original_name, size_bytes, extension, format, \
     replication_status, created_at";

#[derive(Clone)]
pub struct MetadataStore {
    db: SqlitePool,
}

impl MetadataStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Insert a new descriptor in `pending` replication state.
    ///
    /// An identifier collision is reported as `Conflict`; the existing row
    /// is never overwritten.
    pub async fn create_record(&self, new: NewFileDescriptor) -> MetadataResult<String> {
        let result = sqlx::query(
            "INSERT INTO files (
                identifier, original_name, size_bytes, extension, format,
                replication_status, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new.identifier)
        .bind(&new.original_name)
        .bind(new.size_bytes)
        .bind(&new.extension)
        .bind(&new.format)
        .bind(ReplicationStatus::Pending)
        .bind(Utc::now())
        .execute(&self.db)
        .await;

        match result {
            Ok(_) => Ok(new.identifier),
            Err(err) if is_unique_violation(&err) => Err(MetadataError::Conflict(new.identifier)),
            Err(err) => Err(MetadataError::Sqlx(err)),
        }
    }

    pub async fn get_by_identifier(&self, identifier: &str) -> MetadataResult<Option<FileDescriptor>> {
        let descriptor = sqlx::query_as::<_, FileDescriptor>(&format!(
            "SELECT {DESCRIPTOR_COLUMNS} FROM files WHERE identifier = ?"
        ))
        .bind(identifier)
        .fetch_optional(&self.db)
        .await?;
        Ok(descriptor)
    }

    /// Like `get_by_identifier`, but a missing row is an error.
    pub async fn require(&self, identifier: &str) -> MetadataResult<FileDescriptor> {
        self.get_by_identifier(identifier)
            .await?
            .ok_or_else(|| MetadataError::NotFound(identifier.to_string()))
    }

    pub async fn set_replication_status(
        &self,
        identifier: &str,
        status: ReplicationStatus,
    ) -> MetadataResult<()> {
        let result = sqlx::query("UPDATE files SET replication_status = ? WHERE identifier = ?")
            .bind(status)
            .bind(identifier)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(identifier.to_string()));
        }
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::collections::HashSet;
    use uuid::Uuid;

    fn new_descriptor(identifier: &str) -> NewFileDescriptor {
        NewFileDescriptor {
            identifier: identifier.to_string(),
            original_name: "notes.txt".into(),
            size_bytes: 5120,
            extension: ".txt".into(),
            format: Some("text/plain".into()),
        }
    }

    async fn store() -> MetadataStore {
        MetadataStore::new(db::connect_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn create_then_get() {
        let store = store().await;
        let id = store.create_record(new_descriptor("abc")).await.unwrap();
        assert_eq!(id, "abc");

        let found = store.get_by_identifier("abc").await.unwrap().unwrap();
        assert_eq!(found.original_name, "notes.txt");
        assert_eq!(found.size_bytes, 5120);
        assert_eq!(found.extension, ".txt");
        assert_eq!(found.format.as_deref(), Some("text/plain"));
        assert_eq!(found.replication_status, ReplicationStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_identifier_is_none() {
        let store = store().await;
        assert!(store.get_by_identifier("missing").await.unwrap().is_none());
        assert!(matches!(
            store.require("missing").await,
            Err(MetadataError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_identifier_is_a_conflict() {
        let store = store().await;
        store.create_record(new_descriptor("dup")).await.unwrap();

        let mut second = new_descriptor("dup");
        second.original_name = "other.bin".into();
        let err = store.create_record(second).await.unwrap_err();
        assert!(matches!(err, MetadataError::Conflict(id) if id == "dup"));

        let kept = store.require("dup").await.unwrap();
        assert_eq!(kept.original_name, "notes.txt");
    }

    #[tokio::test]
    async fn replication_status_updates() {
        let store = store().await;
        store.create_record(new_descriptor("r1")).await.unwrap();
        store
            .set_replication_status("r1", ReplicationStatus::Completed)
            .await
            .unwrap();
        assert_eq!(
            store.require("r1").await.unwrap().replication_status,
            ReplicationStatus::Completed
        );
        assert!(matches!(
            store
                .set_replication_status("nope", ReplicationStatus::Failed)
                .await,
            Err(MetadataError::NotFound(_))
        ));
    }

    #[test]
    fn generated_identifiers_do_not_collide() {
        let ids: HashSet<String> = (0..10_000).map(|_| Uuid::new_v4().to_string()).collect();
        assert_eq!(ids.len(), 10_000);
    }
}
