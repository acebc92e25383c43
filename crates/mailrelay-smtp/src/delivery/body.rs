//! Body sources fed from the delivery side's own transport.
//!
//! A handler sees these as plain [`BodyStream`]s. When the transport itself
//! fails mid-body the original error is kept here, so the session can tell
//! a broken channel apart from a failing handler after the handler returns.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::transaction::BodyStream;
use crate::transport::Transport;

fn source_failed(err: &Error) -> Error {
    Error::Protocol(format!("message body source failed: {err}"))
}

/// Dot-terminated body following `DATA`, unstuffed line by line.
pub struct DataBody<'a, T: ?Sized> {
    transport: &'a mut T,
    chunk_size: usize,
    finished: bool,
    fault: Option<Error>,
}

impl<'a, T> DataBody<'a, T>
where
    T: Transport + ?Sized,
{
    pub fn new(transport: &'a mut T, chunk_size: usize) -> Self {
        Self {
            transport,
            chunk_size,
            finished: false,
            fault: None,
        }
    }

    async fn read_lines(&mut self) -> Result<Option<Bytes>> {
        let mut buf = BytesMut::new();
        while !self.finished {
            let line = self.transport.receive_line().await?;
            if line.as_ref() == b".\r\n" {
                self.finished = true;
                break;
            }
            if line.first() == Some(&b'.') {
                buf.extend_from_slice(&line[1..]);
            } else {
                buf.extend_from_slice(&line);
            }
            if buf.len() >= self.chunk_size || !self.transport.has_buffered_input() {
                break;
            }
        }
        Ok((!buf.is_empty()).then(|| buf.freeze()))
    }

    /// Consumes whatever the handler left unread, up to the terminator.
    ///
    /// # Errors
    ///
    /// Returns the transport failure seen while the handler was reading, or
    /// one hit while draining.
    pub async fn finish(mut self) -> Result<()> {
        if let Some(fault) = self.fault.take() {
            return Err(fault);
        }
        while !self.finished {
            self.read_lines().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<T> BodyStream for DataBody<'_, T>
where
    T: Transport + ?Sized,
{
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if let Some(fault) = &self.fault {
            return Err(source_failed(fault));
        }
        match self.read_lines().await {
            Ok(chunk) => Ok(chunk),
            Err(err) => {
                let reported = source_failed(&err);
                self.fault = Some(err);
                self.finished = true;
                Err(reported)
            }
        }
    }
}

/// Body assembled from the chunks buffered before `BDAT ... LAST` plus the
/// final chunk streamed from the transport.
pub struct BdatBody<'a, T: ?Sized> {
    transport: &'a mut T,
    buffered: Option<Bytes>,
    remaining: u64,
    chunk_size: usize,
    fault: Option<Error>,
}

impl<'a, T> BdatBody<'a, T>
where
    T: Transport + ?Sized,
{
    pub fn new(transport: &'a mut T, buffered: Bytes, last_size: u64, chunk_size: usize) -> Self {
        Self {
            transport,
            buffered: (!buffered.is_empty()).then_some(buffered),
            remaining: last_size,
            chunk_size,
            fault: None,
        }
    }

    async fn read_chunk(&mut self) -> Result<Bytes> {
        let want = usize::try_from(self.remaining).map_or(self.chunk_size, |r| r.min(self.chunk_size));
        let chunk = self.transport.receive_binary(want).await?;
        self.remaining -= chunk.len() as u64;
        Ok(chunk)
    }

    /// Consumes the rest of the final chunk.
    ///
    /// # Errors
    ///
    /// Returns the transport failure seen while the handler was reading, or
    /// one hit while draining.
    pub async fn finish(mut self) -> Result<()> {
        if let Some(fault) = self.fault.take() {
            return Err(fault);
        }
        while self.remaining > 0 {
            self.read_chunk().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<T> BodyStream for BdatBody<'_, T>
where
    T: Transport + ?Sized,
{
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if let Some(fault) = &self.fault {
            return Err(source_failed(fault));
        }
        if let Some(buffered) = self.buffered.take() {
            return Ok(Some(buffered));
        }
        if self.remaining == 0 {
            return Ok(None);
        }
        match self.read_chunk().await {
            Ok(chunk) => Ok(Some(chunk)),
            Err(err) => {
                let reported = source_failed(&err);
                self.fault = Some(err);
                Err(reported)
            }
        }
    }
}

/// Reads a `BDAT` payload of `size` bytes, appending it to `sink` or
/// discarding it when `sink` is `None`.
pub async fn receive_payload<T>(
    transport: &mut T,
    mut size: u64,
    mut sink: Option<&mut BytesMut>,
    chunk_size: usize,
) -> Result<()>
where
    T: Transport + ?Sized,
{
    while size > 0 {
        let want = usize::try_from(size).map_or(chunk_size, |s| s.min(chunk_size));
        let chunk = transport.receive_binary(want).await?;
        size -= chunk.len() as u64;
        if let Some(sink) = sink.as_deref_mut() {
            sink.extend_from_slice(&chunk);
        }
    }
    Ok(())
}
