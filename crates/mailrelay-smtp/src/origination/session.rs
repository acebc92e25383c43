//! Client-role session: handshake, extension discovery and transactions.

use async_trait::async_trait;
use bytes::BytesMut;
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use super::config::OriginatorConfig;
use super::transaction::DataTransferTransaction;
use crate::command::Command;
use crate::error::{Error, Result};
use crate::transaction::{
    BodyStream, DotStuffer, ExactSizeBody, TransactionHandler, cancellable,
};
use crate::transport::Transport;
use crate::types::{AuthMechanism, ExtensionSet, Reply, ReplyCode};

/// Supplies the transactions an [`OriginatingSession`] sends.
#[async_trait]
pub trait TransactionSource: Send {
    /// Drives the next transaction through `transaction`.
    ///
    /// Returns `Ok(false)` when there is nothing left to send, in which case
    /// `transaction` must be left untouched.
    async fn next_transaction(
        &mut self,
        transaction: &mut dyn TransactionHandler,
        cancel: &CancellationToken,
    ) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
    Ready,
    Broken,
    Closed,
}

/// Originating side of one SMTP connection.
pub struct OriginatingSession<T> {
    transport: T,
    config: OriginatorConfig,
    greeting: Reply,
    extensions: ExtensionSet,
    extended: bool,
    authenticated: bool,
    pub(super) needs_reset: bool,
    health: Health,
}

impl<T> std::fmt::Debug for OriginatingSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginatingSession")
            .field("config", &self.config)
            .field("greeting", &self.greeting)
            .field("extensions", &self.extensions)
            .field("extended", &self.extended)
            .field("authenticated", &self.authenticated)
            .field("needs_reset", &self.needs_reset)
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> OriginatingSession<T> {
    /// Reads the greeting and performs the `EHLO`/`HELO` handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SmtpError`] if the greeting is not 2xx or both
    /// `EHLO` and `HELO` are refused, or the transport failure.
    pub async fn connect(
        mut transport: T,
        config: OriginatorConfig,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let greeting = cancellable(cancel, transport.receive_reply()).await?;
        if !greeting.is_success() {
            tracing::warn!(code = greeting.code.as_u16(), "server refused the connection");
            return Err(greeting.into_error());
        }

        let mut session = Self {
            transport,
            config,
            greeting,
            extensions: ExtensionSet::new(),
            extended: false,
            authenticated: false,
            needs_reset: false,
            health: Health::Ready,
        };
        session.hello(cancel).await?;
        Ok(session)
    }

    async fn hello(&mut self, cancel: &CancellationToken) -> Result<()> {
        let domain = self.config.local_identity.clone();
        let reply = self
            .exchange(&Command::Ehlo { domain: domain.clone() }, cancel)
            .await?;
        if reply.is_success() {
            self.extensions = ExtensionSet::from_hello_reply(&reply);
            self.extended = true;
            tracing::debug!(extensions = self.extensions.len(), "EHLO accepted");
            return Ok(());
        }

        tracing::debug!(code = reply.code.as_u16(), "EHLO refused, falling back to HELO");
        let reply = self.exchange(&Command::Helo { domain }, cancel).await?;
        if !reply.is_success() {
            return Err(reply.into_error());
        }
        self.extensions = ExtensionSet::new();
        self.extended = false;
        Ok(())
    }

    /// Returns the greeting received on connect.
    #[must_use]
    pub const fn greeting(&self) -> &Reply {
        &self.greeting
    }

    /// Returns the extensions advertised in the last hello reply.
    #[must_use]
    pub const fn extensions(&self) -> &ExtensionSet {
        &self.extensions
    }

    /// Returns true if the server accepted `EHLO`.
    #[must_use]
    pub const fn is_extended(&self) -> bool {
        self.extended
    }

    /// Returns true after a successful `AUTH`.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Returns true while the channel is usable.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.health == Health::Ready
    }

    /// Returns the session configuration.
    #[must_use]
    pub const fn config(&self) -> &OriginatorConfig {
        &self.config
    }

    /// Returns the underlying transport.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Consumes the session and returns the transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.health {
            Health::Ready => Ok(()),
            Health::Broken => Err(Error::InvalidState(
                "connection is desynchronized".to_string(),
            )),
            Health::Closed => Err(Error::InvalidState("connection is closed".to_string())),
        }
    }

    /// Sends one command and waits for its reply.
    ///
    /// Any failure leaves the channel in an unknown position and marks the
    /// session unusable.
    pub(super) async fn exchange(
        &mut self,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<Reply> {
        self.ensure_ready()?;
        let transport = &mut self.transport;
        let result = cancellable(cancel, async move {
            transport.send_command(command).await?;
            transport.receive_reply().await
        })
        .await;
        self.settle(result)
    }

    fn settle(&mut self, result: Result<Reply>) -> Result<Reply> {
        match result {
            Ok(reply) => {
                tracing::trace!(code = reply.code.as_u16(), "reply");
                Ok(reply)
            }
            Err(err) => {
                tracing::warn!(error = %err, "exchange failed, abandoning connection");
                self.health = Health::Broken;
                Err(err)
            }
        }
    }

    /// Upgrades the channel with `STARTTLS` and repeats the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the channel is already secure,
    /// [`Error::NotSupported`] if the server does not offer `STARTTLS`, and
    /// [`Error::SmtpError`] if it refuses the command.
    pub async fn start_tls(
        &mut self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.transport.is_secure() {
            return Err(Error::InvalidState("channel is already secure".to_string()));
        }
        if !self.extensions.contains("STARTTLS") {
            return Err(Error::NotSupported("STARTTLS".to_string()));
        }

        let reply = self.exchange(&Command::StartTls, cancel).await?;
        if reply.code != ReplyCode::SERVICE_READY {
            return Err(reply.into_error());
        }

        let transport = &mut self.transport;
        if let Err(err) = cancellable(cancel, transport.start_tls_client(connector, server_name)).await
        {
            self.health = Health::Broken;
            return Err(err);
        }
        tracing::debug!("TLS established");

        self.extensions = ExtensionSet::new();
        self.authenticated = false;
        self.needs_reset = false;
        self.hello(cancel).await
    }

    /// Authenticates with `AUTH PLAIN`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupported`] if the server does not offer `PLAIN`
    /// and [`Error::SmtpError`] for any reply other than 235.
    pub async fn authenticate_plain(
        &mut self,
        username: &str,
        password: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.authenticated {
            return Err(Error::InvalidState("already authenticated".to_string()));
        }
        if !self.extensions.auth_mechanisms().contains(&AuthMechanism::Plain) {
            return Err(Error::NotSupported("AUTH PLAIN".to_string()));
        }

        // authzid NUL authcid NUL password
        let mut response = Vec::with_capacity(username.len() + password.len() + 2);
        response.push(0);
        response.extend_from_slice(username.as_bytes());
        response.push(0);
        response.extend_from_slice(password.as_bytes());

        let command = Command::Auth {
            mechanism: AuthMechanism::Plain.as_str().to_string(),
            initial_response: Some(response),
        };
        let reply = self.exchange(&command, cancel).await?;
        if reply.code != ReplyCode::AUTH_SUCCESS {
            return Err(reply.into_error());
        }
        self.authenticated = true;
        tracing::debug!(username, "authenticated");
        Ok(())
    }

    /// Prepares the next mail transaction.
    ///
    /// If an earlier transaction was abandoned after `MAIL` was accepted,
    /// `RSET` is sent when the new one starts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the session is unusable.
    pub fn begin_transaction(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<DataTransferTransaction<'_, T>> {
        self.ensure_ready()?;
        Ok(DataTransferTransaction::new(self, cancel.clone()))
    }

    /// Sends `RSET` if an abandoned transaction is still open on the server.
    pub(super) async fn reset_if_needed(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.needs_reset {
            let reply = self.exchange(&Command::Rset, cancel).await?;
            if !reply.is_success() {
                return Err(reply.into_error());
            }
            self.needs_reset = false;
        }
        Ok(())
    }

    /// Runs transactions from `source` until it reports there are no more.
    ///
    /// Returns the number of transactions the source ran.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by the source.
    pub async fn originate<S>(
        &mut self,
        source: &mut S,
        cancel: &CancellationToken,
    ) -> Result<usize>
    where
        S: TransactionSource + ?Sized,
    {
        let mut count = 0;
        loop {
            let mut transaction = self.begin_transaction(cancel)?;
            if !source.next_transaction(&mut transaction, cancel).await? {
                break;
            }
            count += 1;
        }
        tracing::debug!(count, "transactions originated");
        Ok(count)
    }

    /// Sends `QUIT` and closes the session.
    ///
    /// # Errors
    ///
    /// Returns the transport failure, or [`Error::SmtpError`] if the reply is
    /// not 221.
    pub async fn quit(&mut self, cancel: &CancellationToken) -> Result<()> {
        let reply = self.exchange(&Command::Quit, cancel).await?;
        self.health = Health::Closed;
        if reply.code != ReplyCode::CLOSING {
            return Err(reply.into_error());
        }
        Ok(())
    }

    /// Sends a body as one `BDAT <size> LAST` chunk.
    pub(super) async fn transfer_chunked(
        &mut self,
        body: &mut dyn BodyStream,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<Reply> {
        self.ensure_ready()?;
        let transport = &mut self.transport;
        let result = cancellable(cancel, async move {
            transport
                .send_command(&Command::Bdat { size, last: true })
                .await?;
            let mut exact = ExactSizeBody::new(body, size);
            transport.send_binary(&mut exact).await?;
            transport.receive_reply().await
        })
        .await;
        self.settle(result)
    }

    /// Sends a body with `DATA`, dot-stuffed and terminated.
    ///
    /// A refused `DATA` command is returned as an error; the server keeps the
    /// transaction open in that case.
    pub(super) async fn transfer_text(
        &mut self,
        body: &mut dyn BodyStream,
        cancel: &CancellationToken,
    ) -> Result<Reply> {
        let reply = self.exchange(&Command::Data, cancel).await?;
        if reply.code != ReplyCode::START_DATA {
            return Err(reply.into_error());
        }

        let transport = &mut self.transport;
        let result = cancellable(cancel, async move {
            let mut stuffer = DotStuffer::new();
            let mut out = BytesMut::new();
            while let Some(chunk) = body.next_chunk().await? {
                stuffer.process(&chunk, &mut out)?;
                if !out.is_empty() {
                    transport
                        .send_command(&Command::DataBlock(out.split().freeze()))
                        .await?;
                }
            }
            stuffer.finish(&mut out);
            transport
                .send_command(&Command::DataBlock(out.freeze()))
                .await?;
            transport.receive_reply().await
        })
        .await;
        self.settle(result)
    }
}
