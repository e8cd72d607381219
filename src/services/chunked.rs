//! Bounded-memory chunked I/O shared by every transfer path.
//!
//! Uploads to disk, multipart part reads, remote download bodies and
//! response bodies all go through these helpers, so at most one chunk is
//! ever held in memory per transfer regardless of file size.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, pin_mut, stream};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// General transfer chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Chunk size used when reading multipart upload parts (10 MiB).
pub const DEFAULT_PART_SIZE: usize = 10 * 1024 * 1024;

/// Read up to `chunk_size` bytes, filling the buffer unless the reader is
/// exhausted first. Returns `None` once the reader yields no more bytes.
pub async fn read_chunk<R>(reader: &mut R, chunk_size: usize) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let chunk_size = chunk_size.max(1);
    let mut buf = BytesMut::with_capacity(chunk_size);
    while buf.len() < chunk_size {
        let remaining = (chunk_size - buf.len()) as u64;
        let read = (&mut *reader).take(remaining).read_buf(&mut buf).await?;
        if read == 0 {
            break;
        }
    }

    if buf.is_empty() {
        Ok(None)
    } else {
        Ok(Some(buf.freeze()))
    }
}

/// Lazy sequence of `chunk_size` chunks over `reader`.
///
/// Every chunk except the last is exactly `chunk_size` bytes long. The
/// stream ends on the first zero-length read.
pub fn chunks<R>(reader: R, chunk_size: usize) -> impl Stream<Item = io::Result<Bytes>> + Send
where
    R: AsyncRead + Unpin + Send,
{
    stream::try_unfold(reader, move |mut reader| async move {
        Ok(read_chunk(&mut reader, chunk_size)
            .await?
            .map(|chunk| (chunk, reader)))
    })
}

/// Drain `source` into `writer`, regrouping the incoming pieces into
/// `chunk_size` writes. Returns the number of bytes written.
pub async fn write_chunked<S, W>(source: S, writer: &mut W, chunk_size: usize) -> io::Result<u64>
where
    S: Stream<Item = io::Result<Bytes>>,
    W: AsyncWrite + Unpin,
{
    let chunk_size = chunk_size.max(1);
    let mut pending = BytesMut::with_capacity(chunk_size);
    let mut written: u64 = 0;

    pin_mut!(source);
    while let Some(piece) = source.next().await {
        let mut piece = piece?;
        while !piece.is_empty() {
            let take = (chunk_size - pending.len()).min(piece.len());
            pending.extend_from_slice(&piece.split_to(take));
            if pending.len() == chunk_size {
                writer.write_all(&pending).await?;
                written += pending.len() as u64;
                pending.clear();
            }
        }
    }

    if !pending.is_empty() {
        writer.write_all(&pending).await?;
        written += pending.len() as u64;
    }
    writer.flush().await?;

    Ok(written)
}

/// Copy `reader` into `writer` one chunk at a time.
pub async fn copy_chunked<R, W>(reader: R, writer: &mut W, chunk_size: usize) -> io::Result<u64>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin,
{
    write_chunked(chunks(reader, chunk_size), writer, chunk_size).await
}
