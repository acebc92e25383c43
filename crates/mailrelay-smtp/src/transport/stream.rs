//! Buffered transport over a tokio byte stream.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector, client, server};

use super::{Transport, TransportLimits};
use crate::command::{Command, ExpectedInput};
use crate::error::{Error, Result};
use crate::parser::{find_crlf, parse_reply};
use crate::types::Reply;

/// Default buffer size for reading and writing.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Buffered bytes above which queued writes go out without a flush.
const WRITE_HIGH_WATER: usize = 64 * 1024;

/// Underlying byte channel, plain or upgraded.
enum Channel<S> {
    Plain(S),
    ClientTls(Box<client::TlsStream<S>>),
    ServerTls(Box<server::TlsStream<S>>),
    /// Left behind when a TLS handshake fails half-way.
    Closed,
}

impl<S> Channel<S> {
    const fn is_secure(&self) -> bool {
        matches!(self, Self::ClientTls(_) | Self::ServerTls(_))
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport closed")
}

impl<S> AsyncRead for Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::ClientTls(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::ServerTls(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Closed => Poll::Ready(Err(closed())),
        }
    }
}

impl<S> AsyncWrite for Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::ClientTls(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::ServerTls(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Closed => Poll::Ready(Err(closed())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::ClientTls(stream) => Pin::new(stream).poll_flush(cx),
            Self::ServerTls(stream) => Pin::new(stream).poll_flush(cx),
            Self::Closed => Poll::Ready(Err(closed())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::ClientTls(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::ServerTls(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Closed => Poll::Ready(Ok(())),
        }
    }
}

/// [`Transport`] over any `AsyncRead + AsyncWrite` stream.
///
/// Incoming bytes are buffered in a `BytesMut`, so pipelined commands that
/// arrive together stay available through
/// [`has_buffered_input`](Transport::has_buffered_input).
pub struct StreamTransport<S> {
    channel: Channel<S>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    limits: TransportLimits,
}

impl<S> std::fmt::Debug for StreamTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("secure", &self.channel.is_secure())
            .field("buffered_in", &self.read_buf.len())
            .field("buffered_out", &self.write_buf.len())
            .field("limits", &self.limits)
            .finish()
    }
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps a plain stream with default limits.
    pub fn new(stream: S) -> Self {
        Self::with_limits(stream, TransportLimits::default())
    }

    /// Wraps a plain stream.
    pub fn with_limits(stream: S, limits: TransportLimits) -> Self {
        Self {
            channel: Channel::Plain(stream),
            read_buf: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            limits,
        }
    }

    /// Returns the limits in force.
    #[must_use]
    pub const fn limits(&self) -> &TransportLimits {
        &self.limits
    }

    /// Returns the underlying stream, beneath TLS if the channel was
    /// upgraded.
    #[must_use]
    pub fn get_ref(&self) -> Option<&S> {
        match &self.channel {
            Channel::Plain(stream) => Some(stream),
            Channel::ClientTls(stream) => Some(stream.get_ref().0),
            Channel::ServerTls(stream) => Some(stream.get_ref().0),
            Channel::Closed => None,
        }
    }

    /// Shuts the write side of the channel down after flushing.
    ///
    /// # Errors
    ///
    /// Returns an error if the final write fails.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.write_pending().await?;
        self.channel.shutdown().await?;
        Ok(())
    }

    /// Reads more bytes into the read buffer.
    async fn fill(&mut self) -> Result<()> {
        self.read_buf.reserve(DEFAULT_BUFFER_SIZE);
        let read = self.channel.read_buf(&mut self.read_buf).await?;
        if read == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }
        Ok(())
    }

    /// Reads one CRLF-terminated line of at most `max` bytes.
    async fn read_line(&mut self, max: usize) -> Result<Bytes> {
        let mut scanned: usize = 0;
        loop {
            // Back up one byte in case CR arrived at the end of the last read.
            let from = scanned.saturating_sub(1);
            if let Some(pos) = find_crlf(&self.read_buf[from..]) {
                let end = from + pos + 2;
                if end > max {
                    return Err(Error::Protocol(format!(
                        "line of {end} bytes exceeds {max}"
                    )));
                }
                return Ok(self.read_buf.split_to(end).freeze());
            }
            if self.read_buf.len() > max {
                return Err(Error::Protocol(format!(
                    "no line terminator within {max} bytes"
                )));
            }
            scanned = self.read_buf.len();
            self.fill().await?;
        }
    }

    async fn write_pending(&mut self) -> Result<()> {
        if !self.write_buf.is_empty() {
            self.channel.write_all(&self.write_buf).await?;
            self.write_buf.clear();
        }
        self.channel.flush().await?;
        Ok(())
    }

    async fn queue(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_buf.extend_from_slice(bytes);
        if self.write_buf.len() >= WRITE_HIGH_WATER {
            self.channel.write_all(&self.write_buf).await?;
            self.write_buf.clear();
        }
        Ok(())
    }

    fn take_plain(&mut self) -> Result<S> {
        match std::mem::replace(&mut self.channel, Channel::Closed) {
            Channel::Plain(stream) => Ok(stream),
            other => {
                let secure = other.is_secure();
                self.channel = other;
                Err(Error::InvalidState(if secure {
                    "channel is already secure".into()
                } else {
                    "channel is closed".into()
                }))
            }
        }
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_command(&mut self, command: &Command) -> Result<()> {
        tracing::trace!("C: {command}");
        self.queue(&command.serialize()).await
    }

    async fn send_reply(&mut self, reply: &Reply, can_be_grouped: bool) -> Result<()> {
        for (i, line) in reply.lines.iter().enumerate() {
            let sep = if i + 1 == reply.lines.len() { ' ' } else { '-' };
            tracing::trace!("S: {}{sep}{line}", reply.code);
        }
        self.queue(&reply.serialize()).await?;
        if can_be_grouped {
            Ok(())
        } else {
            self.write_pending().await
        }
    }

    async fn flush(&mut self) -> Result<()> {
        self.write_pending().await
    }

    async fn receive_reply(&mut self) -> Result<Reply> {
        self.write_pending().await?;
        loop {
            if let Some(reply) = parse_reply(&mut self.read_buf)? {
                for line in &reply.lines {
                    tracing::trace!("S: {} {line}", reply.code);
                }
                return Ok(reply);
            }
            self.fill().await?;
        }
    }

    async fn receive_command(&mut self, expected: ExpectedInput) -> Result<Command> {
        let line = self.read_line(self.limits.max_command_line).await?;
        let command = Command::parse(&line, expected)?;
        tracing::trace!("C: {command}");
        Ok(command)
    }

    async fn receive_line(&mut self) -> Result<Bytes> {
        self.read_line(self.limits.max_text_line).await
    }

    async fn receive_binary(&mut self, max: usize) -> Result<Bytes> {
        let max = max.clamp(1, self.limits.max_binary_read);
        if self.read_buf.is_empty() {
            self.fill().await?;
        }
        let len = self.read_buf.len().min(max);
        Ok(self.read_buf.split_to(len).freeze())
    }

    fn has_buffered_input(&self) -> bool {
        !self.read_buf.is_empty()
    }

    async fn start_tls_client(
        &mut self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<()> {
        if !self.read_buf.is_empty() {
            return Err(Error::Protocol(
                "unexpected data received before TLS negotiation".into(),
            ));
        }
        self.write_pending().await?;
        let stream = self.take_plain()?;
        let tls = connector.connect(server_name, stream).await?;
        self.channel = Channel::ClientTls(Box::new(tls));
        tracing::debug!("TLS established (client)");
        Ok(())
    }

    async fn start_tls_server(&mut self, acceptor: &TlsAcceptor) -> Result<()> {
        if !self.read_buf.is_empty() {
            return Err(Error::Protocol(
                "unexpected data received before TLS negotiation".into(),
            ));
        }
        self.write_pending().await?;
        let stream = self.take_plain()?;
        let tls = acceptor.accept(stream).await?;
        self.channel = Channel::ServerTls(Box::new(tls));
        tracing::debug!("TLS established (server)");
        Ok(())
    }

    fn is_secure(&self) -> bool {
        self.channel.is_secure()
    }

    fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>> {
        let certs = match &self.channel {
            Channel::ClientTls(stream) => stream.get_ref().1.peer_certificates(),
            Channel::ServerTls(stream) => stream.get_ref().1.peer_certificates(),
            Channel::Plain(_) | Channel::Closed => None,
        };
        certs.map(<[CertificateDer<'static>]>::to_vec)
    }
}

/// Connects to an SMTP server over plain TCP.
///
/// # Errors
///
/// Returns an error if the connection fails.
pub async fn connect(hostname: &str, port: u16) -> Result<StreamTransport<TcpStream>> {
    let stream = TcpStream::connect((hostname, port)).await?;
    tracing::debug!(hostname, port, "connected");
    Ok(StreamTransport::new(stream))
}

/// Connects to an SMTP server over TLS (implicit TLS on port 465).
///
/// # Errors
///
/// Returns an error if the connection or TLS handshake fails.
pub async fn connect_tls(hostname: &str, port: u16) -> Result<StreamTransport<TcpStream>> {
    let server_name = ServerName::try_from(hostname.to_string())?;
    let mut transport = connect(hostname, port).await?;
    transport
        .start_tls_client(&default_tls_connector(), server_name)
        .await?;
    Ok(transport)
}

/// Creates a TLS connector trusting the webpki root certificates.
#[must_use]
pub fn default_tls_connector() -> TlsConnector {
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::ReplyCode;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn receive_reply_flushes_pending_command() {
        let mock = Builder::new()
            .write(b"NOOP\r\n")
            .read(b"250 OK\r\n")
            .build();
        let mut transport = StreamTransport::new(mock);
        transport.send_command(&Command::Noop).await.unwrap();
        let reply = transport.receive_reply().await.unwrap();
        assert_eq!(reply.code, ReplyCode::OK);
    }

    #[tokio::test]
    async fn multi_line_reply_split_across_reads() {
        let mock = Builder::new()
            .read(b"250-first\r\n250-sec")
            .read(b"ond\r\n250 third\r\n")
            .build();
        let mut transport = StreamTransport::new(mock);
        let reply = transport.receive_reply().await.unwrap();
        assert_eq!(reply.lines, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn pipelined_commands_stay_buffered() {
        let mock = Builder::new()
            .read(b"MAIL FROM:<a@b.c>\r\nRCPT TO:<d@e.f>\r\n")
            .build();
        let mut transport = StreamTransport::new(mock);
        let first = transport
            .receive_command(ExpectedInput::Command)
            .await
            .unwrap();
        assert!(matches!(first, Command::MailFrom { .. }));
        assert!(transport.has_buffered_input());
        let second = transport
            .receive_command(ExpectedInput::Command)
            .await
            .unwrap();
        assert!(matches!(second, Command::RcptTo { .. }));
        assert!(!transport.has_buffered_input());
    }

    #[tokio::test]
    async fn crlf_split_between_reads() {
        let mock = Builder::new().read(b"NOOP\r").read(b"\nQUIT\r\n").build();
        let mut transport = StreamTransport::new(mock);
        let command = transport
            .receive_command(ExpectedInput::Command)
            .await
            .unwrap();
        assert_eq!(command, Command::Noop);
    }

    #[tokio::test]
    async fn grouped_replies_leave_together() {
        let mock = Builder::new().write(b"250 OK\r\n250 OK\r\n").build();
        let mut transport = StreamTransport::new(mock);
        transport.send_reply(&Reply::ok(), true).await.unwrap();
        transport.send_reply(&Reply::ok(), true).await.unwrap();
        transport.flush().await.unwrap();
    }

    #[tokio::test]
    async fn overlong_command_line_is_fatal() {
        let limits = TransportLimits {
            max_command_line: 16,
            ..TransportLimits::default()
        };
        let mock = Builder::new().read(&[b'A'; 32]).build();
        let mut transport = StreamTransport::with_limits(mock, limits);
        let err = transport
            .receive_command(ExpectedInput::Command)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.is_unrecoverable());
    }

    #[tokio::test]
    async fn eof_is_an_io_error() {
        let mock = Builder::new().read(b"NOO").build();
        let mut transport = StreamTransport::new(mock);
        let err = transport
            .receive_command(ExpectedInput::Command)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn binary_reads_respect_bounds() {
        let mock = Builder::new().read(b"BDAT 3\r\nabcNOOP\r\n").build();
        let mut transport = StreamTransport::new(mock);
        transport
            .receive_command(ExpectedInput::Command)
            .await
            .unwrap();
        assert_eq!(transport.receive_binary(3).await.unwrap(), "abc");
        let command = transport
            .receive_command(ExpectedInput::Command)
            .await
            .unwrap();
        assert_eq!(command, Command::Noop);
    }

    #[tokio::test]
    async fn tls_upgrade_refused_with_pending_input() {
        let mock = Builder::new().read(b"STARTTLS\r\nNOOP\r\n").build();
        let mut transport = StreamTransport::new(mock);
        transport
            .receive_command(ExpectedInput::Command)
            .await
            .unwrap();
        let err = transport
            .start_tls_client(
                &default_tls_connector(),
                ServerName::try_from("mail.example.com").unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(!transport.is_secure());
    }
}
