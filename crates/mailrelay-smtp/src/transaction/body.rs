//! Message body streams.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Default read size for [`ReaderBody`].
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Pull-based source of message body bytes.
///
/// The body is handed out in chunks so it never has to fit in memory.
/// `Ok(None)` marks the end of the body; once returned, further calls keep
/// returning it.
#[async_trait]
pub trait BodyStream: Send {
    /// Returns the next non-empty chunk, or `None` at the end of the body.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Body held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBody {
    data: Option<Bytes>,
}

impl MemoryBody {
    /// Wraps an in-memory body.
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data: Bytes = data.into();
        Self {
            data: (!data.is_empty()).then_some(data),
        }
    }
}

#[async_trait]
impl BodyStream for MemoryBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.data.take())
    }
}

/// Body read from any asynchronous reader until end of file.
#[derive(Debug)]
pub struct ReaderBody<R> {
    reader: R,
    chunk_size: usize,
    done: bool,
}

impl<R> ReaderBody<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Wraps a reader.
    pub const fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, DEFAULT_CHUNK_SIZE)
    }

    /// Wraps a reader, reading at most `chunk_size` bytes per chunk.
    pub const fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size,
            done: false,
        }
    }
}

#[async_trait]
impl<R> BodyStream for ReaderBody<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        let mut buf = BytesMut::with_capacity(self.chunk_size.max(1));
        let read = self.reader.read_buf(&mut buf).await?;
        if read == 0 {
            self.done = true;
            return Ok(None);
        }
        Ok(Some(buf.freeze()))
    }
}

/// Enforces that a body yields exactly its declared length.
///
/// A sender that announced the length on the wire (`BDAT <size>`) cannot
/// recover when the source disagrees, so both a short and a long body are
/// [`Error::Protocol`].
#[derive(Debug)]
pub struct ExactSizeBody<B> {
    inner: B,
    declared: u64,
    seen: u64,
}

impl<B> ExactSizeBody<B> {
    /// Wraps `inner`, which must yield exactly `declared` bytes.
    pub const fn new(inner: B, declared: u64) -> Self {
        Self {
            inner,
            declared,
            seen: 0,
        }
    }

    /// Bytes yielded so far.
    pub const fn transferred(&self) -> u64 {
        self.seen
    }
}

#[async_trait]
impl<B> BodyStream for ExactSizeBody<B>
where
    B: BodyStream,
{
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match self.inner.next_chunk().await? {
            Some(chunk) => {
                self.seen += chunk.len() as u64;
                if self.seen > self.declared {
                    return Err(Error::Protocol(format!(
                        "body is longer than the declared {} octets",
                        self.declared
                    )));
                }
                Ok(Some(chunk))
            }
            None if self.seen < self.declared => Err(Error::Protocol(format!(
                "body ended after {} of {} declared octets",
                self.seen, self.declared
            ))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<B> BodyStream for &mut B
where
    B: BodyStream + ?Sized,
{
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        (**self).next_chunk().await
    }
}

/// Collects a whole body into memory.
///
/// # Errors
///
/// Propagates the stream's error.
pub async fn read_to_end(body: &mut dyn BodyStream) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next_chunk().await? {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}
