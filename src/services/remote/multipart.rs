//! Multipart upload / chunked download protocol over a [`MultipartClient`].

use super::{CompletedPart, MultipartClient, RemoteError, RemoteObjectProvider, RemoteResult};
use crate::services::chunked::{chunks, copy_chunked};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, pin_mut};
use std::{path::Path, sync::Arc, time::Instant};
use tokio::fs::{self, File};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct MultipartProvider {
    client: Arc<dyn MultipartClient>,
    part_size: usize,
    chunk_size: usize,
}

impl MultipartProvider {
    /// `part_size` bounds each uploaded part, `chunk_size` each download read.
    pub fn new(client: Arc<dyn MultipartClient>, part_size: usize, chunk_size: usize) -> Self {
        Self {
            client,
            part_size,
            chunk_size,
        }
    }

    /// Read `file` in `part_size` chunks and upload them as parts 1..N.
    ///
    /// Parts go out strictly one after another. An empty file is sent as a
    /// single empty part so the session can still be completed.
    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        file: File,
    ) -> RemoteResult<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut part_number: i32 = 0;

        let source = chunks(file, self.part_size);
        pin_mut!(source);
        while let Some(chunk) = source.next().await {
            let body = chunk?;
            part_number += 1;
            let size = body.len();
            let etag = self
                .client
                .upload_part(key, upload_id, part_number, body)
                .await?;
            debug!(key, part_number, size, etag = %etag, "uploaded part");
            parts.push(CompletedPart { part_number, etag });
        }

        if parts.is_empty() {
            let etag = self
                .client
                .upload_part(key, upload_id, 1, Bytes::new())
                .await?;
            parts.push(CompletedPart {
                part_number: 1,
                etag,
            });
        }

        Ok(parts)
    }
}

#[async_trait]
impl RemoteObjectProvider for MultipartProvider {
    async fn upload(&self, key: &str, local_path: &Path) -> RemoteResult<()> {
        let start = Instant::now();
        let file = File::open(local_path).await?;
        let upload_id = self.client.create_multipart_upload(key).await?;

        let result = async {
            let parts = self.upload_parts(key, &upload_id, file).await?;
            validate_part_sequence(key, &parts)?;
            self.client
                .complete_multipart_upload(key, &upload_id, &parts)
                .await?;
            Ok::<_, RemoteError>(parts.len())
        }
        .await;

        match result {
            Ok(part_count) => {
                info!(
                    key,
                    part_count,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "multipart upload completed"
                );
                Ok(())
            }
            Err(err) => {
                warn!(key, upload_id = %upload_id, error = %err, "multipart upload failed, aborting");
                if let Err(abort_err) = self.client.abort_multipart_upload(key, &upload_id).await {
                    debug!(key, error = %abort_err, "abort after failed upload also failed");
                }
                Err(err)
            }
        }
    }

    async fn download(&self, key: &str, destination: &Path) -> RemoteResult<()> {
        let start = Instant::now();
        let reader = self.client.get_object(key).await?;

        let mut file = File::create(destination).await?;
        let copied = match copy_chunked(reader, &mut file, self.chunk_size).await {
            Ok(copied) => copied,
            Err(err) => {
                drop(file);
                let _ = fs::remove_file(destination).await;
                return Err(RemoteError::Io(err));
            }
        };
        file.sync_all().await?;

        info!(
            key,
            size_bytes = copied,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "remote download completed"
        );
        Ok(())
    }
}

/// Parts must be numbered 1..N in order with no gaps.
pub fn validate_part_sequence(key: &str, parts: &[CompletedPart]) -> RemoteResult<()> {
    if parts.is_empty() {
        return Err(RemoteError::InvalidPartSequence {
            key: key.to_string(),
            reason: "no parts".into(),
        });
    }
    for (index, part) in parts.iter().enumerate() {
        let expected = index as i32 + 1;
        if part.part_number != expected {
            return Err(RemoteError::InvalidPartSequence {
                key: key.to_string(),
                reason: format!(
                    "expected part {expected} at position {index}, found {}",
                    part.part_number
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::remote::{MemoryObjectClient, ObjectReader};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Delegates to the in-memory backend and records part numbers.
    struct RecordingClient {
        inner: MemoryObjectClient,
        parts: Mutex<Vec<(i32, usize)>>,
        aborted: Mutex<Vec<String>>,
        fail_on_part: Option<i32>,
    }

    impl RecordingClient {
        fn new(inner: MemoryObjectClient, fail_on_part: Option<i32>) -> Self {
            Self {
                inner,
                parts: Mutex::new(Vec::new()),
                aborted: Mutex::new(Vec::new()),
                fail_on_part,
            }
        }
    }

    #[async_trait]
    impl MultipartClient for RecordingClient {
        async fn create_multipart_upload(&self, key: &str) -> RemoteResult<String> {
            self.inner.create_multipart_upload(key).await
        }

        async fn upload_part(
            &self,
            key: &str,
            upload_id: &str,
            part_number: i32,
            body: Bytes,
        ) -> RemoteResult<String> {
            if self.fail_on_part == Some(part_number) {
                return Err(RemoteError::protocol("UploadPart", key, "connection reset"));
            }
            self.parts.lock().unwrap().push((part_number, body.len()));
            self.inner.upload_part(key, upload_id, part_number, body).await
        }

        async fn complete_multipart_upload(
            &self,
            key: &str,
            upload_id: &str,
            parts: &[CompletedPart],
        ) -> RemoteResult<()> {
            self.inner
                .complete_multipart_upload(key, upload_id, parts)
                .await
        }

        async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> RemoteResult<()> {
            self.aborted.lock().unwrap().push(upload_id.to_string());
            self.inner.abort_multipart_upload(key, upload_id).await
        }

        async fn get_object(&self, key: &str) -> RemoteResult<ObjectReader> {
            self.inner.get_object(key).await
        }
    }

    fn write_file(dir: &TempDir, name: &str, len: usize) -> (std::path::PathBuf, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        let path = dir.path().join(name);
        std::fs::write(&path, &data).unwrap();
        (path, data)
    }

    #[tokio::test]
    async fn parts_are_numbered_contiguously_in_order() {
        let dir = TempDir::new().unwrap();
        let memory = MemoryObjectClient::new();
        let client = Arc::new(RecordingClient::new(memory.clone(), None));
        let provider = MultipartProvider::new(client.clone(), 10, 4);

        // 5 full parts of 10 bytes, mirroring 50 MiB in 10 MiB parts.
        let (path, data) = write_file(&dir, "big.bin", 50);
        provider.upload("big.bin", &path).await.unwrap();

        let recorded = client.parts.lock().unwrap().clone();
        assert_eq!(
            recorded,
            vec![(1, 10), (2, 10), (3, 10), (4, 10), (5, 10)]
        );
        assert_eq!(memory.object("big.bin").unwrap(), data);
        assert!(client.aborted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn short_last_part_is_kept() {
        let dir = TempDir::new().unwrap();
        let memory = MemoryObjectClient::new();
        let client = Arc::new(RecordingClient::new(memory.clone(), None));
        let provider = MultipartProvider::new(client.clone(), 10, 4);

        let (path, data) = write_file(&dir, "odd.bin", 23);
        provider.upload("odd.bin", &path).await.unwrap();

        let numbers: Vec<(i32, usize)> = client.parts.lock().unwrap().clone();
        assert_eq!(numbers, vec![(1, 10), (2, 10), (3, 3)]);
        assert_eq!(memory.object("odd.bin").unwrap(), data);
    }

    #[tokio::test]
    async fn empty_file_uploads_as_one_empty_part() {
        let dir = TempDir::new().unwrap();
        let memory = MemoryObjectClient::new();
        let provider = MultipartProvider::new(Arc::new(memory.clone()), 10, 4);

        let (path, _) = write_file(&dir, "empty", 0);
        provider.upload("empty", &path).await.unwrap();
        assert_eq!(memory.object("empty").unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn part_failure_aborts_the_whole_upload() {
        let dir = TempDir::new().unwrap();
        let memory = MemoryObjectClient::new();
        let client = Arc::new(RecordingClient::new(memory.clone(), Some(2)));
        let provider = MultipartProvider::new(client.clone(), 10, 4);

        let (path, _) = write_file(&dir, "doomed.bin", 35);
        let err = provider.upload("doomed.bin", &path).await.unwrap_err();

        assert!(matches!(err, RemoteError::Protocol { operation: "UploadPart", .. }));
        assert_eq!(client.parts.lock().unwrap().clone(), vec![(1, 10)]);
        assert_eq!(client.aborted.lock().unwrap().len(), 1);
        assert!(memory.object("doomed.bin").is_none());
        assert_eq!(memory.open_uploads(), 0);
    }

    #[tokio::test]
    async fn missing_local_file_never_starts_a_session() {
        let dir = TempDir::new().unwrap();
        let memory = MemoryObjectClient::new();
        let provider = MultipartProvider::new(Arc::new(memory.clone()), 10, 4);

        let err = provider
            .upload("ghost", &dir.path().join("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Io(_)));
        assert_eq!(memory.open_uploads(), 0);
    }

    #[tokio::test]
    async fn download_writes_object_to_destination() {
        let dir = TempDir::new().unwrap();
        let memory = MemoryObjectClient::new();
        let data: Vec<u8> = (0..97u8).collect();
        memory.insert_object("k.bin", data.clone());
        let provider = MultipartProvider::new(Arc::new(memory), 10, 8);

        let dest = dir.path().join("k.bin");
        provider.download("k.bin", &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn download_of_missing_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        let provider = MultipartProvider::new(Arc::new(MemoryObjectClient::new()), 10, 8);

        let dest = dir.path().join("absent");
        let err = provider.download("absent", &dest).await.unwrap_err();
        assert!(matches!(err, RemoteError::NotFound(key) if key == "absent"));
        assert!(!dest.exists());
    }

    #[test]
    fn part_sequence_validation() {
        let part = |n: i32| CompletedPart {
            part_number: n,
            etag: format!("\"{n}\""),
        };
        assert!(validate_part_sequence("k", &[part(1), part(2), part(3)]).is_ok());
        assert!(validate_part_sequence("k", &[]).is_err());
        assert!(validate_part_sequence("k", &[part(2), part(1)]).is_err());
        assert!(validate_part_sequence("k", &[part(1), part(3)]).is_err());
        assert!(validate_part_sequence("k", &[part(0), part(1)]).is_err());
    }
}
