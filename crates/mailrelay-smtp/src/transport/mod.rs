//! Transport abstraction.
//!
//! Sessions never touch sockets directly. They exchange commands, replies
//! and raw body bytes through a [`Transport`], which also owns the TLS
//! upgrade. [`StreamTransport`] implements it over any tokio byte stream.

mod stream;

use async_trait::async_trait;
use bytes::Bytes;
use rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub use stream::{StreamTransport, connect, connect_tls, default_tls_connector};

use crate::command::{Command, ExpectedInput};
use crate::error::Result;
use crate::transaction::BodyStream;
use crate::types::Reply;

/// Maximum command line length including CRLF.
///
/// RFC 5321 4.5.3.1.4 sets 512; extensions such as `AUTH` initial responses
/// need more.
pub const DEFAULT_MAX_COMMAND_LINE: usize = 4096;

/// Maximum body line length including CRLF for `DATA` transfers.
pub const DEFAULT_MAX_TEXT_LINE: usize = 1024 * 1024; // 1 MB

/// Maximum number of bytes handed out by one binary read.
pub const DEFAULT_MAX_BINARY_READ: usize = 64 * 1024;

/// Size limits a transport enforces while reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportLimits {
    /// Longest accepted command line, CRLF included.
    pub max_command_line: usize,
    /// Longest accepted body line, CRLF included.
    pub max_text_line: usize,
    /// Upper bound for a single binary read.
    pub max_binary_read: usize,
}

impl Default for TransportLimits {
    fn default() -> Self {
        Self {
            max_command_line: DEFAULT_MAX_COMMAND_LINE,
            max_text_line: DEFAULT_MAX_TEXT_LINE,
            max_binary_read: DEFAULT_MAX_BINARY_READ,
        }
    }
}

/// Bidirectional SMTP channel.
///
/// Writes are buffered. A reply marked as groupable stays in the buffer
/// until a later write or an explicit [`flush`](Self::flush), which is how
/// pipelined replies leave in one batch. Receiving a reply flushes pending
/// commands first.
#[async_trait]
pub trait Transport: Send {
    /// Queues a command. [`Command::DataBlock`] payloads are written raw.
    async fn send_command(&mut self, command: &Command) -> Result<()>;

    /// Queues a reply, flushing unless `can_be_grouped` is set.
    async fn send_reply(&mut self, reply: &Reply, can_be_grouped: bool) -> Result<()>;

    /// Writes a whole body stream raw and returns the number of bytes sent.
    async fn send_binary(&mut self, body: &mut dyn BodyStream) -> Result<u64> {
        let mut sent = 0u64;
        while let Some(chunk) = body.next_chunk().await? {
            sent += chunk.len() as u64;
            self.send_command(&Command::DataBlock(chunk)).await?;
        }
        Ok(sent)
    }

    /// Writes everything buffered.
    async fn flush(&mut self) -> Result<()>;

    /// Receives one reply.
    async fn receive_reply(&mut self) -> Result<Reply>;

    /// Receives one command line and parses it in the given context.
    async fn receive_command(&mut self, expected: ExpectedInput) -> Result<Command>;

    /// Receives one raw line including its CRLF, for `DATA` bodies.
    async fn receive_line(&mut self) -> Result<Bytes>;

    /// Receives between 1 and `max` raw bytes.
    async fn receive_binary(&mut self, max: usize) -> Result<Bytes>;

    /// Returns true if received bytes are waiting to be consumed.
    fn has_buffered_input(&self) -> bool;

    /// Upgrades the channel to TLS as the client.
    async fn start_tls_client(
        &mut self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<()>;

    /// Upgrades the channel to TLS as the server.
    async fn start_tls_server(&mut self, acceptor: &TlsAcceptor) -> Result<()>;

    /// Returns true once the TLS upgrade completed.
    fn is_secure(&self) -> bool;

    /// Certificates presented by the peer during the TLS handshake.
    fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>>;
}
