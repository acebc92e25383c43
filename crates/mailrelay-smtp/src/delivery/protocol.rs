//! Server-role outer loop.

use tokio_util::sync::CancellationToken;

use super::session::{DeliverySession, Flow};
use crate::error::Result;
use crate::transaction::{TransactionFactory, cancellable};
use crate::transport::Transport;

/// Binds a [`DeliverySession`] to a transport and runs it to completion.
pub struct DeliveryProtocol<T, F>
where
    F: TransactionFactory,
{
    transport: T,
    session: DeliverySession<F>,
}

impl<T, F> DeliveryProtocol<T, F>
where
    T: Transport,
    F: TransactionFactory,
{
    /// Creates the loop for one accepted connection.
    pub const fn new(transport: T, session: DeliverySession<F>) -> Self {
        Self { transport, session }
    }

    /// Returns the session.
    #[must_use]
    pub const fn session(&self) -> &DeliverySession<F> {
        &self.session
    }

    /// Returns the transport.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Splits the loop into its transport and session.
    pub fn into_parts(self) -> (T, DeliverySession<F>) {
        (self.transport, self.session)
    }

    /// Sends the greeting and serves commands until `QUIT`.
    ///
    /// Replies to pipelined commands are flushed once the transport has no
    /// more buffered input, so a batch of commands is answered with one
    /// batch of replies.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`](crate::Error::Cancelled) when `cancel`
    /// fires, or the unrecoverable error that ended the session. The open
    /// transaction, if any, is dropped first.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let result = self.serve(cancel).await;
        if let Err(err) = &result {
            tracing::warn!(error = %err, "delivery session ended abnormally");
            self.session.abort();
        }
        result
    }

    async fn serve(&mut self, cancel: &CancellationToken) -> Result<()> {
        let greeting = self.session.greeting();
        cancellable(cancel, self.transport.send_reply(&greeting, false)).await?;
        tracing::debug!(domain = %self.session.config().domain, "delivery session started");

        loop {
            if !self.transport.has_buffered_input() {
                cancellable(cancel, self.transport.flush()).await?;
            }
            let expected = self.session.expected_input();
            let command =
                cancellable(cancel, self.transport.receive_command(expected)).await?;
            match self
                .session
                .execute(command, &mut self.transport, cancel)
                .await?
            {
                Flow::Continue => {}
                Flow::Quit => {
                    self.transport.flush().await?;
                    tracing::debug!("delivery session closed by client");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio_test::io::Builder;

    use super::*;
    use crate::Error;
    use crate::delivery::DeliveryConfig;
    use crate::transaction::{BodyStream, ConnectionInfo, TransactionHandler, Verdict, read_to_end};
    use crate::transport::StreamTransport;
    use crate::types::{Address, BodyEncoding, ReversePath};

    struct Mailbox(Arc<Mutex<Vec<Bytes>>>);

    #[async_trait]
    impl TransactionHandler for Mailbox {
        async fn start(&mut self, _: &ReversePath, _: BodyEncoding) -> Result<Verdict> {
            Ok(Verdict::Accepted)
        }

        async fn try_add_recipient(&mut self, _: &Address) -> Result<Verdict> {
            Ok(Verdict::Accepted)
        }

        async fn transfer_data_and_finish(
            &mut self,
            body: &mut dyn BodyStream,
            _: Option<u64>,
        ) -> Result<()> {
            let data = read_to_end(body).await?;
            self.0.lock().unwrap().push(data);
            Ok(())
        }
    }

    fn session(
        delivered: &Arc<Mutex<Vec<Bytes>>>,
    ) -> DeliverySession<impl FnMut(&ConnectionInfo) -> Result<Mailbox> + Send> {
        let delivered = Arc::clone(delivered);
        DeliverySession::new(
            DeliveryConfig::new("mx.example.org"),
            move |_: &ConnectionInfo| Ok(Mailbox(Arc::clone(&delivered))),
        )
    }

    #[tokio::test]
    async fn answers_pipelined_batch() {
        let mock = Builder::new()
            .write(b"220 mx.example.org ESMTP service ready\r\n")
            .read(b"HELO client.example.com\r\n")
            .write(b"250 mx.example.org Hello client.example.com\r\n")
            .read(b"MAIL FROM:<alice@example.com>\r\nRCPT TO:<bob@example.org>\r\nRCPT TO:<carol@example.org>\r\nDATA\r\n")
            .write(b"250 OK\r\n250 OK\r\n250 OK\r\n354 Start mail input; end with <CRLF>.<CRLF>\r\n")
            .read(b"Subject: test\r\n\r\nbody\r\n.\r\n")
            .write(b"250 OK\r\n")
            .read(b"QUIT\r\n")
            .write(b"221 mx.example.org Service closing transmission channel\r\n")
            .build();
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let mut protocol = DeliveryProtocol::new(StreamTransport::new(mock), session(&delivered));

        protocol.run(&CancellationToken::new()).await.unwrap();

        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].as_ref(), b"Subject: test\r\n\r\nbody\r\n");
    }

    #[tokio::test]
    async fn connection_loss_ends_session() {
        let mock = Builder::new()
            .write(b"220 mx.example.org ESMTP service ready\r\n")
            .read(b"HELO client.example.com\r\n")
            .write(b"250 mx.example.org Hello client.example.com\r\n")
            .read(b"MAIL FROM:<alice@example.com>\r\n")
            .write(b"250 OK\r\n")
            .build();
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let mut protocol = DeliveryProtocol::new(StreamTransport::new(mock), session(&delivered));

        let err = protocol.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(!protocol.session().has_transaction());
    }

    #[tokio::test]
    async fn cancelled_before_greeting() {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let mut protocol =
            DeliveryProtocol::new(StreamTransport::new(Builder::new().build()), session(&delivered));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(protocol.run(&cancel).await.unwrap_err().is_cancelled());
    }
}
