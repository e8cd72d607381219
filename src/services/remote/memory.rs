//! In-process object store speaking the multipart protocol.
//!
//! Used when no remote endpoint is configured (`--remote-backend memory`)
//! and as the backend for tests. It enforces the same completion rules as
//! S3: parts listed in ascending, contiguous order with matching ETags.

use super::{CompletedPart, MultipartClient, ObjectReader, RemoteError, RemoteResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::{
    collections::{BTreeMap, HashMap},
    io::Cursor,
    sync::{Arc, Mutex, MutexGuard},
};
use uuid::Uuid;

#[derive(Default)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<i32, (String, Bytes)>,
}

#[derive(Default)]
struct State {
    objects: HashMap<String, Bytes>,
    uploads: HashMap<String, PendingUpload>,
}

/// Cheaply cloneable handle; clones share the same store.
#[derive(Clone, Default)]
pub struct MemoryObjectClient {
    state: Arc<Mutex<State>>,
}

impl MemoryObjectClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave the maps half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_object(&self, key: &str, data: impl Into<Bytes>) {
        self.state().objects.insert(key.to_string(), data.into());
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state().objects.get(key).map(|b| b.to_vec())
    }

    /// Multipart sessions neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.state().uploads.len()
    }
}

fn etag_for(body: &[u8]) -> String {
    format!("\"{:x}\"", md5::compute(body))
}

#[async_trait]
impl MultipartClient for MemoryObjectClient {
    async fn create_multipart_upload(&self, key: &str) -> RemoteResult<String> {
        let upload_id = Uuid::new_v4().to_string();
        self.state().uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                ..PendingUpload::default()
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> RemoteResult<String> {
        if !(1..=10_000).contains(&part_number) {
            return Err(RemoteError::protocol(
                "UploadPart",
                key,
                format!("part number {part_number} out of range"),
            ));
        }
        let mut state = self.state();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| RemoteError::protocol("UploadPart", key, "no such upload"))?;

        let etag = etag_for(&body);
        upload.parts.insert(part_number, (etag.clone(), body));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> RemoteResult<()> {
        let mut state = self.state();
        let upload = state
            .uploads
            .get(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| {
                RemoteError::protocol("CompleteMultipartUpload", key, "no such upload")
            })?;

        if parts.is_empty() {
            return Err(RemoteError::protocol(
                "CompleteMultipartUpload",
                key,
                "part list is empty",
            ));
        }

        let mut assembled = BytesMut::new();
        for (index, part) in parts.iter().enumerate() {
            if part.part_number != index as i32 + 1 {
                return Err(RemoteError::protocol(
                    "CompleteMultipartUpload",
                    key,
                    format!(
                        "part {} listed at position {}; parts must be ascending and contiguous",
                        part.part_number,
                        index + 1
                    ),
                ));
            }
            match upload.parts.get(&part.part_number) {
                Some((etag, body)) if *etag == part.etag => assembled.extend_from_slice(body),
                Some(_) => {
                    return Err(RemoteError::protocol(
                        "CompleteMultipartUpload",
                        key,
                        format!("etag mismatch for part {}", part.part_number),
                    ));
                }
                None => {
                    return Err(RemoteError::protocol(
                        "CompleteMultipartUpload",
                        key,
                        format!("part {} was never uploaded", part.part_number),
                    ));
                }
            }
        }

        state.uploads.remove(upload_id);
        state.objects.insert(key.to_string(), assembled.freeze());
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> RemoteResult<()> {
        match self.state().uploads.remove(upload_id) {
            Some(_) => Ok(()),
            None => Err(RemoteError::protocol(
                "AbortMultipartUpload",
                key,
                "no such upload",
            )),
        }
    }

    async fn get_object(&self, key: &str) -> RemoteResult<ObjectReader> {
        let body = self
            .state()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(key.to_string()))?;
        Ok(Box::pin(Cursor::new(body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn upload_two_parts(client: &MemoryObjectClient) -> (String, Vec<CompletedPart>) {
        let id = client.create_multipart_upload("obj").await.unwrap();
        let mut parts = Vec::new();
        for (n, body) in [(1, "hello "), (2, "world")] {
            let etag = client
                .upload_part("obj", &id, n, Bytes::from_static(body.as_bytes()))
                .await
                .unwrap();
            parts.push(CompletedPart {
                part_number: n,
                etag,
            });
        }
        (id, parts)
    }

    #[tokio::test]
    async fn completes_and_reads_back() {
        let client = MemoryObjectClient::new();
        let (id, parts) = upload_two_parts(&client).await;
        client
            .complete_multipart_upload("obj", &id, &parts)
            .await
            .unwrap();

        let mut body = String::new();
        client
            .get_object("obj")
            .await
            .unwrap()
            .read_to_string(&mut body)
            .await
            .unwrap();
        assert_eq!(body, "hello world");
        assert_eq!(client.open_uploads(), 0);
    }

    #[tokio::test]
    async fn out_of_order_completion_is_rejected() {
        let client = MemoryObjectClient::new();
        let (id, mut parts) = upload_two_parts(&client).await;
        parts.reverse();

        let err = client
            .complete_multipart_upload("obj", &id, &parts)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Protocol { .. }));
        assert!(client.object("obj").is_none());
    }

    #[tokio::test]
    async fn gapped_completion_is_rejected() {
        let client = MemoryObjectClient::new();
        let (id, mut parts) = upload_two_parts(&client).await;
        parts[1].part_number = 3;

        assert!(
            client
                .complete_multipart_upload("obj", &id, &parts)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn etag_mismatch_is_rejected() {
        let client = MemoryObjectClient::new();
        let (id, mut parts) = upload_two_parts(&client).await;
        parts[0].etag = "\"bogus\"".into();

        assert!(
            client
                .complete_multipart_upload("obj", &id, &parts)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let client = MemoryObjectClient::new();
        assert!(matches!(
            client.get_object("nope").await,
            Err(RemoteError::NotFound(_))
        ));
    }

    #[test]
    fn etag_is_quoted_md5() {
        assert_eq!(etag_for(b""), "\"d41d8cd98f00b204e9800998ecf8427e\"");
    }
}
