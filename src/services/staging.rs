//! Local staging store: the write-once disk tier.
//!
//! Every upload lands at `{root}/{identifier}{extension}`. Bytes are first
//! written to a hidden temporary file in the same directory, fsynced, then
//! renamed into place, so a reader never observes a half-written file and
//! a failed write leaves nothing behind.

use crate::{models::file::storage_name, services::chunked::write_chunked};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, pin_mut, stream};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Declared lengths below this are read into memory in one go (10 MiB).
pub const DEFAULT_BUFFERED_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Prefix shared by every in-progress file in the storage root.
pub const PARTIAL_PREFIX: &str = ".tmp-";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Whole body read into memory, written in one operation.
    Buffered,
    /// Body written chunk by chunk as it arrives.
    Streaming,
}

#[derive(Debug)]
pub struct StagedFile {
    pub path: PathBuf,
    /// Size measured on disk after the write.
    pub size_bytes: u64,
    pub strategy: WriteStrategy,
}

#[derive(Clone, Debug)]
pub struct LocalStagingStore {
    root: PathBuf,
    chunk_size: usize,
    buffered_threshold: u64,
}

impl LocalStagingStore {
    pub fn new(root: impl Into<PathBuf>, chunk_size: usize, buffered_threshold: u64) -> Self {
        Self {
            root: root.into(),
            chunk_size,
            buffered_threshold,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    /// Final staging path of a file.
    pub fn path_for(&self, identifier: &str, extension: &str) -> PathBuf {
        self.root.join(storage_name(identifier, extension))
    }

    /// Pick the write path from the client's declared length.
    ///
    /// The declared length is only a hint: an unknown length always streams,
    /// and the buffered path itself falls back to streaming once the body
    /// outgrows the threshold.
    pub fn select_strategy(&self, declared_len: Option<u64>) -> WriteStrategy {
        match declared_len {
            Some(len) if len < self.buffered_threshold => WriteStrategy::Buffered,
            _ => WriteStrategy::Streaming,
        }
    }

    /// Persist `body` for `identifier`, choosing the strategy from `declared_len`.
    pub async fn stage<S>(
        &self,
        identifier: &str,
        extension: &str,
        declared_len: Option<u64>,
        body: S,
    ) -> io::Result<StagedFile>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        match self.select_strategy(declared_len) {
            WriteStrategy::Buffered => self.write_buffered(identifier, extension, body).await,
            WriteStrategy::Streaming => self.write_streaming(identifier, extension, body).await,
        }
    }

    /// Read the entire body into memory, then write it at once.
    pub async fn write_buffered<S>(
        &self,
        identifier: &str,
        extension: &str,
        body: S,
    ) -> io::Result<StagedFile>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        pin_mut!(body);
        let mut buffer = BytesMut::new();
        while let Some(piece) = body.next().await {
            buffer.extend_from_slice(&piece?);
            if buffer.len() as u64 > self.buffered_threshold {
                debug!(
                    identifier,
                    buffered = buffer.len(),
                    "upload outgrew buffered threshold, continuing as stream"
                );
                let head = stream::iter([Ok::<_, io::Error>(buffer.freeze())]);
                return self
                    .write_streaming(identifier, extension, head.chain(body))
                    .await;
            }
        }

        let dest = self.path_for(identifier, extension);
        let (partial, mut file) = PartialFile::create(self.partial_path()).await?;
        file.write_all(&buffer).await?;
        file.sync_all().await?;
        drop(file);
        partial.commit(&dest).await?;

        self.finish(dest, WriteStrategy::Buffered).await
    }

    /// Write the body chunk by chunk without holding it in memory.
    pub async fn write_streaming<S>(
        &self,
        identifier: &str,
        extension: &str,
        body: S,
    ) -> io::Result<StagedFile>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let dest = self.path_for(identifier, extension);
        let (partial, mut file) = PartialFile::create(self.partial_path()).await?;
        write_chunked(body, &mut file, self.chunk_size).await?;
        file.sync_all().await?;
        drop(file);
        partial.commit(&dest).await?;

        self.finish(dest, WriteStrategy::Streaming).await
    }

    /// Fresh hidden path in the storage root for an in-progress write.
    pub(crate) fn partial_path(&self) -> PathBuf {
        self.root.join(format!("{PARTIAL_PREFIX}{}", Uuid::new_v4()))
    }

    async fn finish(&self, path: PathBuf, strategy: WriteStrategy) -> io::Result<StagedFile> {
        let size_bytes = fs::metadata(&path).await?.len();
        debug!(path = %path.display(), size_bytes, ?strategy, "staged file");
        Ok(StagedFile {
            path,
            size_bytes,
            strategy,
        })
    }
}

/// A file being written under a temporary name.
///
/// Unless `commit` succeeds, the file is removed when the guard drops,
/// including when the owning future is cancelled mid-write.
pub(crate) struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    pub(crate) async fn create(path: PathBuf) -> io::Result<(Self, File)> {
        let file = File::create(&path).await?;
        Ok((
            Self {
                path,
                committed: false,
            },
            file,
        ))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically move the finished file to `dest`.
    pub(crate) async fn commit(mut self, dest: &Path) -> io::Result<()> {
        fs::rename(&self.path, dest).await?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("removed partial file {}", self.path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove partial file {}: {}", self.path.display(), err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn body(data: &[u8], piece: usize) -> impl Stream<Item = io::Result<Bytes>> + use<> {
        let pieces: Vec<io::Result<Bytes>> = data
            .chunks(piece)
            .map(|p| Ok(Bytes::copy_from_slice(p)))
            .collect();
        stream::iter(pieces)
    }

    fn store(dir: &TempDir, threshold: u64) -> LocalStagingStore {
        LocalStagingStore::new(dir.path(), 16, threshold)
    }

    fn entries(dir: &TempDir) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn strategy_follows_declared_length() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 100);
        assert_eq!(store.select_strategy(Some(0)), WriteStrategy::Buffered);
        assert_eq!(store.select_strategy(Some(99)), WriteStrategy::Buffered);
        assert_eq!(store.select_strategy(Some(100)), WriteStrategy::Streaming);
        assert_eq!(store.select_strategy(None), WriteStrategy::Streaming);
    }

    #[tokio::test]
    async fn small_upload_is_buffered() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 100);
        let data = vec![7u8; 50];

        let staged = store
            .stage("small", ".txt", Some(50), body(&data, 7))
            .await
            .unwrap();

        assert_eq!(staged.strategy, WriteStrategy::Buffered);
        assert_eq!(staged.path, dir.path().join("small.txt"));
        assert_eq!(staged.size_bytes, 50);
        assert_eq!(std::fs::read(&staged.path).unwrap(), data);
        assert_eq!(entries(&dir), vec!["small.txt"]);
    }

    #[tokio::test]
    async fn large_upload_streams() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 100);
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();

        let staged = store
            .stage("large", ".bin", Some(1000), body(&data, 33))
            .await
            .unwrap();

        assert_eq!(staged.strategy, WriteStrategy::Streaming);
        assert_eq!(staged.size_bytes, 1000);
        assert_eq!(std::fs::read(&staged.path).unwrap(), data);
    }

    #[tokio::test]
    async fn size_comes_from_disk_not_the_declared_length() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 100);

        let understated = vec![1u8; 500];
        let staged = store
            .stage("lie-small", "", Some(10), body(&understated, 64))
            .await
            .unwrap();
        assert_eq!(staged.size_bytes, 500);
        assert_eq!(staged.strategy, WriteStrategy::Streaming);
        assert_eq!(std::fs::read(&staged.path).unwrap(), understated);

        let overstated = vec![2u8; 20];
        let staged = store
            .stage("lie-big", "", Some(10_000), body(&overstated, 3))
            .await
            .unwrap();
        assert_eq!(staged.size_bytes, 20);

        let unknown = vec![3u8; 42];
        let staged = store
            .stage("no-hint", "", None, body(&unknown, 5))
            .await
            .unwrap();
        assert_eq!(staged.size_bytes, 42);
    }

    #[tokio::test]
    async fn empty_upload_creates_empty_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 100);
        let staged = store
            .stage("empty", ".txt", Some(0), body(&[], 1))
            .await
            .unwrap();
        assert_eq!(staged.size_bytes, 0);
        assert!(staged.path.exists());
    }

    #[tokio::test]
    async fn failed_write_leaves_no_file_behind() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 100);

        for declared in [Some(10), None] {
            let broken = stream::iter(vec![
                Ok(Bytes::from_static(b"partial bytes that never finish")),
                Err(io::Error::new(ErrorKind::ConnectionReset, "client dropped")),
            ]);
            let err = store
                .stage("broken", ".txt", declared, broken)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ConnectionReset);
        }

        assert!(entries(&dir).is_empty());
    }

    #[tokio::test]
    async fn unwritable_root_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let store = LocalStagingStore::new(dir.path().join("missing"), 16, 100);
        let err = store
            .stage("x", ".txt", Some(3), body(b"abc", 3))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
