//! Server-role session state machine.

use std::net::SocketAddr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::BytesMut;
use tokio_util::sync::CancellationToken;

use super::auth::{Authenticator, SaslStep};
use super::body::{BdatBody, DataBody, receive_payload};
use super::config::DeliveryConfig;
use crate::command::{Command, CommandKind, ExpectedInput};
use crate::error::{Error, Result};
use crate::transaction::{
    ConnectionInfo, TransactionFactory, TransactionHandler, Verdict, cancellable,
};
use crate::transport::Transport;
use crate::types::{
    Address, AuthMechanism, BodyEncoding, Extension, ExtensionSet, Reply, ReplyCode, ReversePath,
};

/// Coarse session state, derived from the identification and transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No `HELO`/`EHLO` yet.
    Initial,
    /// Identified, no open transaction.
    Identified,
    /// A transaction is open.
    InTransaction,
}

/// What the outer loop should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Read the next command.
    Continue,
    /// `QUIT` was answered; close the connection.
    Quit,
}

/// Open mail transaction.
struct Transaction<H> {
    handler: H,
    reverse_path: ReversePath,
    recipients: Vec<Address>,
    encoding: BodyEncoding,
    /// Payload of `BDAT` chunks received before the last one.
    chunks: BytesMut,
    /// Set once any `BDAT` chunk was accepted.
    chunked: bool,
}

/// Per-connection delivery state machine.
///
/// [`execute`](Self::execute) consumes one command, drives the transaction
/// handler and writes the reply (or replies) through the transport. Replies
/// to non-synchronizing commands are queued so pipelined answers leave
/// together.
pub struct DeliverySession<F>
where
    F: TransactionFactory,
{
    config: DeliveryConfig,
    factory: F,
    authenticator: Option<Box<dyn Authenticator>>,
    peer_addr: Option<SocketAddr>,
    client_identity: Option<String>,
    authenticated_as: Option<String>,
    sasl_active: bool,
    transaction: Option<Transaction<F::Handler>>,
}

impl<F> DeliverySession<F>
where
    F: TransactionFactory,
{
    /// Creates a session for one connection.
    pub const fn new(config: DeliveryConfig, factory: F) -> Self {
        Self {
            config,
            factory,
            authenticator: None,
            peer_addr: None,
            client_identity: None,
            authenticated_as: None,
            sasl_active: false,
            transaction: None,
        }
    }

    /// Records the remote address passed on to the transaction factory.
    #[must_use]
    pub const fn with_peer_addr(mut self, peer_addr: SocketAddr) -> Self {
        self.peer_addr = Some(peer_addr);
        self
    }

    /// Enables `AUTH` with the given authenticator.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticator = Some(Box::new(authenticator));
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        if self.transaction.is_some() {
            SessionState::InTransaction
        } else if self.client_identity.is_some() {
            SessionState::Identified
        } else {
            SessionState::Initial
        }
    }

    /// Identification declared by the client.
    #[must_use]
    pub fn client_identity(&self) -> Option<&str> {
        self.client_identity.as_deref()
    }

    /// Identity established with `AUTH`.
    #[must_use]
    pub fn authenticated_as(&self) -> Option<&str> {
        self.authenticated_as.as_deref()
    }

    /// Returns true while a transaction is open.
    #[must_use]
    pub const fn has_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Reverse path of the open transaction.
    #[must_use]
    pub fn reverse_path(&self) -> Option<&ReversePath> {
        self.transaction.as_ref().map(|tx| &tx.reverse_path)
    }

    /// Recipients accepted in the open transaction.
    #[must_use]
    pub fn recipients(&self) -> &[Address] {
        self.transaction
            .as_ref()
            .map_or(&[], |tx| tx.recipients.as_slice())
    }

    /// How the next input line must be parsed.
    #[must_use]
    pub const fn expected_input(&self) -> ExpectedInput {
        if self.sasl_active {
            ExpectedInput::SaslResponse
        } else {
            ExpectedInput::Command
        }
    }

    /// The 220 greeting sent when the connection opens.
    #[must_use]
    pub fn greeting(&self) -> Reply {
        Reply::service_ready(&self.config.domain, &self.config.greeting)
    }

    /// Extensions advertised in the `EHLO` reply.
    #[must_use]
    pub fn extensions(&self, secure: bool) -> ExtensionSet {
        let mut extensions = ExtensionSet::new();
        extensions.insert(Extension::Pipelining);
        if let Some(max) = self.config.max_message_size {
            extensions.insert(Extension::Size(Some(max)));
        }
        if self.config.eight_bit_mime {
            extensions.insert(Extension::EightBitMime);
        }
        if self.config.chunking {
            extensions.insert(Extension::Chunking);
            extensions.insert(Extension::BinaryMime);
        }
        if self.config.tls_acceptor.is_some() && !secure {
            extensions.insert(Extension::StartTls);
        }
        if let Some(authenticator) = &self.authenticator {
            if self.authenticated_as.is_none() {
                extensions.insert(Extension::Auth(authenticator.mechanisms()));
            }
        }
        extensions
    }

    /// Drops the open transaction, releasing its handler.
    pub fn abort(&mut self) {
        if let Some(tx) = self.transaction.take() {
            tracing::debug!(recipients = tx.recipients.len(), "transaction discarded");
        }
    }

    /// Processes one command.
    ///
    /// Syntax, sequence and business errors are answered with a reply and
    /// return `Ok`. An `Err` means the connection cannot continue; the open
    /// transaction has been dropped by then and no reply was sent for the
    /// failed exchange.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when `cancel` fires during a suspending
    /// step, [`Error::Protocol`] when the channel is desynchronized, and any
    /// transport failure.
    pub async fn execute<T>(
        &mut self,
        command: Command,
        transport: &mut T,
        cancel: &CancellationToken,
    ) -> Result<Flow>
    where
        T: Transport + ?Sized,
    {
        let result = self.dispatch(command, transport, cancel).await;
        if let Err(err) = &result {
            tracing::debug!(error = %err, "session aborted");
            self.abort();
            self.sasl_active = false;
        }
        result
    }

    async fn dispatch<T>(
        &mut self,
        command: Command,
        transport: &mut T,
        cancel: &CancellationToken,
    ) -> Result<Flow>
    where
        T: Transport + ?Sized,
    {
        let grouped = !command.is_sync_point();
        let reply = match command {
            Command::Helo { domain } => {
                self.abort();
                let reply = Reply::hello(&self.config.domain, &domain, None);
                self.identify(domain);
                reply
            }
            Command::Ehlo { domain } => {
                self.abort();
                let extensions = self.extensions(transport.is_secure());
                let reply = Reply::hello(&self.config.domain, &domain, Some(&extensions));
                self.identify(domain);
                reply
            }
            Command::MailFrom {
                reverse_path,
                body,
                auth,
            } => {
                if let Some(auth) = &auth {
                    tracing::debug!(%auth, "MAIL FROM carries AUTH parameter");
                }
                let secure = transport.is_secure();
                self.mail_from(reverse_path, body.unwrap_or_default(), secure, cancel)
                    .await?
            }
            Command::RcptTo { forward_path } => self.rcpt_to(forward_path, cancel).await?,
            Command::Data => match self.data(transport, cancel).await? {
                Some(reply) => reply,
                None => return Ok(Flow::Continue),
            },
            Command::Bdat { size, last } => {
                self.bdat(size, last, transport, cancel).await?
            }
            Command::Rset => {
                self.abort();
                Reply::ok()
            }
            Command::Noop => Reply::ok(),
            Command::Quit => {
                self.abort();
                transport
                    .send_reply(&Reply::closing(&self.config.domain), false)
                    .await?;
                return Ok(Flow::Quit);
            }
            Command::Vrfy { .. } => Reply::cannot_verify(),
            Command::StartTls => match self.start_tls(transport, cancel).await? {
                Some(reply) => reply,
                None => return Ok(Flow::Continue),
            },
            Command::Auth {
                mechanism,
                initial_response,
            } => {
                self.auth(&mechanism, initial_response.as_deref(), cancel)
                    .await?
            }
            Command::SaslResponse { response } => self.sasl_response(&response, cancel).await?,
            Command::DataBlock(_) => {
                return Err(Error::Protocol("data block received as a command".into()));
            }
            Command::Invalid {
                kind: CommandKind::Bdat,
                line,
                ..
            } => {
                return Err(Error::Protocol(format!(
                    "unparsable BDAT line {line:?}, chunk boundary lost"
                )));
            }
            Command::Invalid {
                kind: CommandKind::SaslResponse,
                ..
            } => {
                self.cancel_sasl();
                Reply::parameter_error("malformed authentication response")
            }
            Command::Invalid { kind, reason, .. } => {
                tracing::info!(%kind, %reason, "invalid command syntax");
                Reply::parameter_error(&reason)
            }
            Command::Unknown { .. } => Reply::syntax_error(),
        };
        transport.send_reply(&reply, grouped).await?;
        Ok(Flow::Continue)
    }

    fn identify(&mut self, domain: String) {
        tracing::debug!(client = %domain, "client identified");
        self.client_identity = Some(domain);
    }

    fn connection_info(&self, secure: bool) -> ConnectionInfo {
        ConnectionInfo {
            peer_addr: self.peer_addr,
            client_identity: self.client_identity.clone(),
            secure,
            authenticated_as: self.authenticated_as.clone(),
        }
    }

    const fn accepts_encoding(&self, encoding: BodyEncoding) -> bool {
        match encoding {
            BodyEncoding::SevenBit => true,
            BodyEncoding::EightBitMime => self.config.eight_bit_mime,
            BodyEncoding::BinaryMime => self.config.chunking,
        }
    }

    fn exceeds_size(&self, total: u64) -> bool {
        self.config.max_message_size.is_some_and(|max| total > max)
    }

    async fn mail_from(
        &mut self,
        reverse_path: ReversePath,
        encoding: BodyEncoding,
        secure: bool,
        cancel: &CancellationToken,
    ) -> Result<Reply> {
        if self.client_identity.is_none() || self.transaction.is_some() {
            return Ok(Reply::bad_sequence());
        }

        let info = self.connection_info(secure);
        let mut handler = match self.factory.create_handler(&info) {
            Ok(handler) => handler,
            Err(err) => {
                tracing::warn!(error = %err, "transaction factory failed");
                return Ok(Reply::local_error());
            }
        };

        if !self.accepts_encoding(encoding) {
            return Ok(Reply::single(
                ReplyCode::PARAMETER_NOT_IMPLEMENTED,
                format!("BODY={encoding} not supported"),
            ));
        }

        match cancellable(cancel, handler.start(&reverse_path, encoding)).await {
            Ok(Verdict::Accepted) => {
                tracing::debug!(%reverse_path, %encoding, "transaction started");
                self.transaction = Some(Transaction {
                    handler,
                    reverse_path,
                    recipients: Vec::new(),
                    encoding,
                    chunks: BytesMut::new(),
                    chunked: false,
                });
                Ok(Reply::ok())
            }
            Ok(Verdict::Rejected(rejection)) => {
                tracing::info!(%reverse_path, ?rejection, "reverse path rejected");
                Ok(rejection.to_reply())
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(err) => {
                tracing::warn!(error = %err, "handler failed to start transaction");
                Ok(Reply::local_error())
            }
        }
    }

    async fn rcpt_to(&mut self, forward_path: Address, cancel: &CancellationToken) -> Result<Reply> {
        let Some(tx) = self.transaction.as_mut() else {
            return Ok(Reply::bad_sequence());
        };

        match cancellable(cancel, tx.handler.try_add_recipient(&forward_path)).await {
            Ok(Verdict::Accepted) => {
                tracing::debug!(%forward_path, "recipient accepted");
                tx.recipients.push(forward_path);
                Ok(Reply::ok())
            }
            Ok(Verdict::Rejected(rejection)) => {
                tracing::info!(%forward_path, ?rejection, "recipient rejected");
                Ok(rejection.to_reply())
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(err) => {
                tracing::warn!(error = %err, "handler failed to add recipient");
                Ok(Reply::local_error())
            }
        }
    }

    /// Returns `None` when the final reply was already sent.
    async fn data<T>(
        &mut self,
        transport: &mut T,
        cancel: &CancellationToken,
    ) -> Result<Option<Reply>>
    where
        T: Transport + ?Sized,
    {
        let Some(tx) = self.transaction.as_mut() else {
            return Ok(Some(Reply::bad_sequence()));
        };
        if tx.chunked {
            tracing::warn!("DATA after BDAT chunks, transaction discarded");
            self.abort();
            return Ok(Some(Reply::local_error()));
        }
        if tx.recipients.is_empty() {
            self.abort();
            return Ok(Some(Reply::transaction_failed("No valid recipients")));
        }
        if tx.encoding == BodyEncoding::BinaryMime {
            return Ok(Some(Reply::single(
                ReplyCode::BAD_SEQUENCE,
                "BINARYMIME requires BDAT",
            )));
        }

        transport.send_reply(&Reply::start_data(), false).await?;

        let chunk_size = self.config.body_chunk_size;
        let (result, drained) = {
            let mut body = DataBody::new(&mut *transport, chunk_size);
            let result =
                cancellable(cancel, tx.handler.transfer_data_and_finish(&mut body, None)).await;
            let drained = if matches!(result, Err(Error::Cancelled)) {
                Ok(())
            } else {
                cancellable(cancel, body.finish()).await
            };
            (result, drained)
        };

        let reply = self.settle_transfer(result, drained)?;
        transport.send_reply(&reply, false).await?;
        Ok(None)
    }

    async fn bdat<T>(
        &mut self,
        size: u64,
        last: bool,
        transport: &mut T,
        cancel: &CancellationToken,
    ) -> Result<Reply>
    where
        T: Transport + ?Sized,
    {
        let chunk_size = self.config.body_chunk_size;

        let refusal = if self.config.chunking {
            match &self.transaction {
                None => Some(Reply::bad_sequence()),
                Some(tx) if tx.recipients.is_empty() => {
                    Some(Reply::transaction_failed("No valid recipients"))
                }
                Some(tx) if self.exceeds_size((tx.chunks.len() as u64).saturating_add(size)) => {
                    Some(Reply::message_too_large())
                }
                Some(_) => None,
            }
        } else {
            Some(Reply::not_implemented())
        };

        if let Some(reply) = refusal {
            // The payload follows regardless; consume it to stay in step.
            cancellable(cancel, receive_payload(transport, size, None, chunk_size)).await?;
            if matches!(
                reply.code,
                ReplyCode::TRANSACTION_FAILED | ReplyCode::EXCEEDED_STORAGE
            ) {
                self.abort();
            }
            tracing::info!(code = reply.code.as_u16(), size, "BDAT refused");
            return Ok(reply);
        }

        let Some(tx) = self.transaction.as_mut() else {
            return Ok(Reply::bad_sequence());
        };
        tx.chunked = true;

        if !last {
            cancellable(
                cancel,
                receive_payload(transport, size, Some(&mut tx.chunks), chunk_size),
            )
            .await?;
            tracing::debug!(size, buffered = tx.chunks.len(), "BDAT chunk buffered");
            return Ok(Reply::single(
                ReplyCode::OK,
                format!("{size} octets received"),
            ));
        }

        let buffered = std::mem::take(&mut tx.chunks).freeze();
        let total = buffered.len() as u64 + size;
        let (result, drained) = {
            let mut body = BdatBody::new(&mut *transport, buffered, size, chunk_size);
            let result = cancellable(
                cancel,
                tx.handler.transfer_data_and_finish(&mut body, Some(total)),
            )
            .await;
            let drained = if matches!(result, Err(Error::Cancelled)) {
                Ok(())
            } else {
                cancellable(cancel, body.finish()).await
            };
            (result, drained)
        };

        self.settle_transfer(result, drained)
    }

    /// Closes the transaction after a body transfer and picks the reply.
    fn settle_transfer(&mut self, result: Result<()>, drained: Result<()>) -> Result<Reply> {
        let tx = self.transaction.take();
        match (result, drained) {
            (Err(Error::Cancelled), _) | (_, Err(Error::Cancelled)) => Err(Error::Cancelled),
            (_, Err(fault)) => {
                tracing::warn!(error = %fault, "message body transfer broke the channel");
                Err(fault)
            }
            (Ok(()), Ok(())) => {
                if let Some(tx) = tx {
                    tracing::debug!(
                        reverse_path = %tx.reverse_path,
                        recipients = tx.recipients.len(),
                        "message delivered"
                    );
                }
                Ok(Reply::ok())
            }
            (Err(err), Ok(())) => {
                tracing::warn!(error = %err, "handler failed during message transfer");
                Ok(Reply::local_error())
            }
        }
    }

    /// Returns `None` when the channel was upgraded and nothing is left to
    /// send.
    async fn start_tls<T>(
        &mut self,
        transport: &mut T,
        cancel: &CancellationToken,
    ) -> Result<Option<Reply>>
    where
        T: Transport + ?Sized,
    {
        let Some(acceptor) = self.config.tls_acceptor.clone() else {
            return Ok(Some(Reply::tls_unavailable()));
        };
        if transport.is_secure() {
            return Ok(Some(Reply::bad_sequence()));
        }
        if transport.has_buffered_input() {
            return Err(Error::Protocol(
                "commands pipelined after STARTTLS".into(),
            ));
        }

        transport.send_reply(&Reply::ready_for_tls(), false).await?;
        cancellable(cancel, transport.start_tls_server(&acceptor)).await?;

        // RFC 3207 4.2: forget everything learned before the upgrade.
        self.abort();
        self.client_identity = None;
        self.authenticated_as = None;
        self.sasl_active = false;
        tracing::debug!("session reset after STARTTLS");
        Ok(None)
    }

    fn cancel_sasl(&mut self) {
        if self.sasl_active {
            self.sasl_active = false;
            if let Some(authenticator) = self.authenticator.as_mut() {
                authenticator.abort();
            }
        }
    }

    async fn auth(
        &mut self,
        mechanism: &str,
        initial_response: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> Result<Reply> {
        let Some(authenticator) = self.authenticator.as_mut() else {
            return Ok(Reply::not_implemented());
        };
        if self.client_identity.is_none()
            || self.authenticated_as.is_some()
            || self.transaction.is_some()
        {
            return Ok(Reply::bad_sequence());
        }
        let Some(mechanism) = AuthMechanism::parse(mechanism)
            .filter(|m| authenticator.mechanisms().contains(m))
        else {
            return Ok(Reply::single(
                ReplyCode::PARAMETER_NOT_IMPLEMENTED,
                "Unrecognized authentication type",
            ));
        };

        let step = cancellable(cancel, authenticator.start(mechanism, initial_response)).await;
        self.apply_sasl_step(step)
    }

    async fn sasl_response(&mut self, response: &str, cancel: &CancellationToken) -> Result<Reply> {
        if !self.sasl_active {
            return Ok(Reply::bad_sequence());
        }
        if response == "*" {
            self.cancel_sasl();
            return Ok(Reply::parameter_error("authentication cancelled"));
        }
        let Ok(decoded) = STANDARD.decode(response) else {
            self.cancel_sasl();
            return Ok(Reply::parameter_error("malformed authentication response"));
        };
        let Some(authenticator) = self.authenticator.as_mut() else {
            self.sasl_active = false;
            return Ok(Reply::bad_sequence());
        };

        let step = cancellable(cancel, authenticator.step(&decoded)).await;
        self.apply_sasl_step(step)
    }

    fn apply_sasl_step(&mut self, step: Result<SaslStep>) -> Result<Reply> {
        match step {
            Ok(SaslStep::Challenge(challenge)) => {
                self.sasl_active = true;
                Ok(Reply::auth_challenge(STANDARD.encode(challenge)))
            }
            Ok(SaslStep::Success(identity)) => {
                self.sasl_active = false;
                tracing::debug!(%identity, "client authenticated");
                self.authenticated_as = Some(identity);
                Ok(Reply::auth_succeeded())
            }
            Ok(SaslStep::Failure) => {
                self.sasl_active = false;
                tracing::info!("authentication failed");
                Ok(Reply::auth_failed())
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(err) => {
                self.sasl_active = false;
                tracing::warn!(error = %err, "authenticator failed");
                Ok(Reply::local_error())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::oneshot;
    use tokio_test::io::{Builder, Mock};

    use super::*;
    use crate::transaction::{BodyStream, Rejection, read_to_end};
    use crate::transport::StreamTransport;

    const HELO: &[u8] = b"HELO client.example.com\r\n";
    const HELO_REPLY: &[u8] = b"250 mx.example.org Hello client.example.com\r\n";
    const OK: &[u8] = b"250 OK\r\n";

    #[derive(Debug, Default)]
    struct Record {
        created: usize,
        started: Option<ReversePath>,
        recipients: Vec<Address>,
        body: Vec<u8>,
        size: Option<u64>,
        finish_calls: usize,
        completed: bool,
        disposed: bool,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Stall {
        Start,
        Recipient,
    }

    struct Recorder {
        record: Arc<Mutex<Record>>,
        stall: Option<(Stall, oneshot::Sender<()>)>,
    }

    impl Recorder {
        /// Parks forever at `stage` after signalling that it got there.
        async fn suspend_at(&mut self, stage: Stall) {
            if self.stall.as_ref().is_some_and(|(at, _)| *at == stage) {
                if let Some((_, entered)) = self.stall.take() {
                    let _ = entered.send(());
                }
                std::future::pending::<()>().await;
            }
        }
    }

    impl Drop for Recorder {
        fn drop(&mut self) {
            self.record.lock().unwrap().disposed = true;
        }
    }

    #[async_trait]
    impl TransactionHandler for Recorder {
        async fn start(
            &mut self,
            reverse_path: &ReversePath,
            _encoding: BodyEncoding,
        ) -> Result<Verdict> {
            self.suspend_at(Stall::Start).await;
            self.record.lock().unwrap().started = Some(reverse_path.clone());
            Ok(Verdict::Accepted)
        }

        async fn try_add_recipient(&mut self, forward_path: &Address) -> Result<Verdict> {
            self.suspend_at(Stall::Recipient).await;
            if forward_path.as_str().starts_with("nobody@") {
                return Ok(Verdict::Rejected(Rejection::MailboxUnavailable));
            }
            self.record.lock().unwrap().recipients.push(forward_path.clone());
            Ok(Verdict::Accepted)
        }

        async fn transfer_data_and_finish(
            &mut self,
            body: &mut dyn BodyStream,
            size: Option<u64>,
        ) -> Result<()> {
            self.record.lock().unwrap().finish_calls += 1;
            let data = read_to_end(body).await?;
            let mut record = self.record.lock().unwrap();
            record.body = data.to_vec();
            record.size = size;
            record.completed = true;
            Ok(())
        }
    }

    type Factory = Box<dyn FnMut(&ConnectionInfo) -> Result<Recorder> + Send>;

    fn factory(records: &Arc<Mutex<Vec<Arc<Mutex<Record>>>>>) -> Factory {
        stalling_factory(records, None)
    }

    fn stalling_factory(
        records: &Arc<Mutex<Vec<Arc<Mutex<Record>>>>>,
        mut stall: Option<(Stall, oneshot::Sender<()>)>,
    ) -> Factory {
        let records = Arc::clone(records);
        Box::new(move |_: &ConnectionInfo| {
            let record = Arc::new(Mutex::new(Record {
                created: records.lock().unwrap().len() + 1,
                ..Record::default()
            }));
            records.lock().unwrap().push(Arc::clone(&record));
            Ok(Recorder {
                record,
                stall: stall.take(),
            })
        })
    }

    struct Harness {
        session: DeliverySession<Factory>,
        transport: StreamTransport<Mock>,
        records: Arc<Mutex<Vec<Arc<Mutex<Record>>>>>,
        cancel: CancellationToken,
    }

    impl Harness {
        fn new(config: DeliveryConfig, mock: Mock) -> Self {
            let records = Arc::new(Mutex::new(Vec::new()));
            Self {
                session: DeliverySession::new(config, factory(&records)),
                transport: StreamTransport::new(mock),
                records,
                cancel: CancellationToken::new(),
            }
        }

        async fn step(&mut self) -> Result<Flow> {
            let command = self
                .transport
                .receive_command(self.session.expected_input())
                .await?;
            let flow = self
                .session
                .execute(command, &mut self.transport, &self.cancel)
                .await?;
            self.transport.flush().await?;
            Ok(flow)
        }

        async fn steps(&mut self, count: usize) {
            for _ in 0..count {
                assert_eq!(self.step().await.unwrap(), Flow::Continue);
            }
        }

        fn stalling(mock: Mock, stage: Stall) -> (Self, oneshot::Receiver<()>) {
            let (entered_tx, entered_rx) = oneshot::channel();
            let records = Arc::new(Mutex::new(Vec::new()));
            let harness = Self {
                session: DeliverySession::new(
                    config(),
                    stalling_factory(&records, Some((stage, entered_tx))),
                ),
                transport: StreamTransport::new(mock),
                records,
                cancel: CancellationToken::new(),
            };
            (harness, entered_rx)
        }

        /// Runs one step, cancelling once the handler has suspended.
        async fn step_cancelled_when(&mut self, entered: oneshot::Receiver<()>) -> Error {
            let token = self.cancel.clone();
            let (result, ()) = tokio::join!(self.step(), async move {
                entered.await.unwrap();
                token.cancel();
            });
            result.unwrap_err()
        }

        fn record(&self, index: usize) -> Arc<Mutex<Record>> {
            Arc::clone(&self.records.lock().unwrap()[index])
        }

        fn created(&self) -> usize {
            self.records.lock().unwrap().len()
        }
    }

    fn config() -> DeliveryConfig {
        DeliveryConfig::new("mx.example.org")
    }

    #[tokio::test]
    async fn mail_requires_identification() {
        let mock = Builder::new()
            .read(b"MAIL FROM:<alice@example.com>\r\n")
            .write(b"503 Bad sequence of commands\r\n")
            .build();
        let mut h = Harness::new(config(), mock);
        h.steps(1).await;
        assert_eq!(h.created(), 0);
        assert_eq!(h.session.state(), SessionState::Initial);
    }

    #[tokio::test]
    async fn ehlo_advertises_configured_extensions() {
        let config = DeliveryConfig::builder("mx.example.org")
            .chunking(false)
            .eight_bit_mime(false)
            .max_message_size(None)
            .build();
        let mock = Builder::new()
            .read(b"EHLO client.example.com\r\n")
            .write(b"250-mx.example.org Hello client.example.com\r\n250 PIPELINING\r\n")
            .build();
        let mut h = Harness::new(config, mock);
        h.steps(1).await;
        assert_eq!(h.session.client_identity(), Some("client.example.com"));
        assert_eq!(h.session.state(), SessionState::Identified);
    }

    #[test]
    fn extensions_follow_configuration() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let session = DeliverySession::new(config(), factory(&records));
        let extensions = session.extensions(false);
        assert!(extensions.contains("PIPELINING"));
        assert!(extensions.contains("CHUNKING"));
        assert!(extensions.contains("BINARYMIME"));
        assert!(extensions.contains("8BITMIME"));
        assert_eq!(
            extensions.max_message_size(),
            Some(crate::delivery::DEFAULT_MAX_MESSAGE_SIZE)
        );
        assert!(!extensions.contains("STARTTLS"));
        assert!(!extensions.contains("AUTH"));
    }

    #[tokio::test]
    async fn data_transfer_unstuffs_body() {
        let mock = Builder::new()
            .read(HELO)
            .write(HELO_REPLY)
            .read(b"MAIL FROM:<alice@example.com>\r\n")
            .write(OK)
            .read(b"RCPT TO:<bob@example.org>\r\n")
            .write(OK)
            .read(b"DATA\r\n")
            .write(b"354 Start mail input; end with <CRLF>.<CRLF>\r\n")
            .read(b"Subject: hi\r\n\r\n..leading dot\r\n.\r\n")
            .write(OK)
            .build();
        let mut h = Harness::new(config(), mock);
        h.steps(4).await;

        let record = h.record(0);
        let record = record.lock().unwrap();
        assert_eq!(record.recipients, vec![Address::new("bob@example.org").unwrap()]);
        assert_eq!(record.body, b"Subject: hi\r\n\r\n.leading dot\r\n");
        assert_eq!(record.size, None);
        assert_eq!(record.finish_calls, 1);
        assert!(record.completed);
        assert!(record.disposed);
        assert!(!h.session.has_transaction());
    }

    #[tokio::test]
    async fn bdat_chunks_are_delivered_once() {
        let mock = Builder::new()
            .read(HELO)
            .write(HELO_REPLY)
            .read(b"MAIL FROM:<alice@example.com>\r\n")
            .write(OK)
            .read(b"RCPT TO:<bob@example.org>\r\n")
            .write(OK)
            .read(b"BDAT 13\r\nHello dear!\r\n")
            .write(b"250 13 octets received\r\n")
            .read(b"BDAT 49 LAST\r\nTell me please how you feel about last meeting.\r\n")
            .write(OK)
            .build();
        let mut h = Harness::new(config(), mock);
        h.steps(4).await;
        {
            let record = h.record(0);
            let record = record.lock().unwrap();
            assert_eq!(record.finish_calls, 0);
            assert!(!record.completed);
            assert!(!record.disposed);
        }
        h.steps(1).await;

        let record = h.record(0);
        let record = record.lock().unwrap();
        assert_eq!(
            record.body,
            b"Hello dear!\r\nTell me please how you feel about last meeting.\r\n"
        );
        assert_eq!(record.size, Some(62));
        assert_eq!(record.finish_calls, 1);
        assert!(record.completed);
        assert!(record.disposed);
    }

    #[tokio::test]
    async fn bdat_without_transaction_discards_payload() {
        let mock = Builder::new()
            .read(HELO)
            .write(HELO_REPLY)
            .read(b"BDAT 5 LAST\r\nhello")
            .write(b"503 Bad sequence of commands\r\n")
            .read(b"NOOP\r\n")
            .write(OK)
            .build();
        let mut h = Harness::new(config(), mock);
        h.steps(3).await;
    }

    #[tokio::test]
    async fn bdat_over_size_limit_drops_transaction() {
        let config = DeliveryConfig::builder("mx.example.org")
            .max_message_size(Some(4))
            .build();
        let mock = Builder::new()
            .read(HELO)
            .write(HELO_REPLY)
            .read(b"MAIL FROM:<alice@example.com>\r\n")
            .write(OK)
            .read(b"RCPT TO:<bob@example.org>\r\n")
            .write(OK)
            .read(b"BDAT 5 LAST\r\nhello")
            .write(b"552 Message size exceeds fixed maximum message size\r\n")
            .build();
        let mut h = Harness::new(config, mock);
        h.steps(4).await;

        let record = h.record(0);
        let record = record.lock().unwrap();
        assert!(record.disposed);
        assert!(!record.completed);
    }

    #[tokio::test]
    async fn bdat_refused_when_chunking_disabled() {
        let config = DeliveryConfig::builder("mx.example.org").chunking(false).build();
        let mock = Builder::new()
            .read(b"BDAT 3\r\nabc")
            .write(b"502 Command not implemented\r\n")
            .build();
        let mut h = Harness::new(config, mock);
        h.steps(1).await;
    }

    #[tokio::test]
    async fn data_without_recipients_fails_transaction() {
        let mock = Builder::new()
            .read(HELO)
            .write(HELO_REPLY)
            .read(b"MAIL FROM:<alice@example.com>\r\n")
            .write(OK)
            .read(b"RCPT TO:<nobody@example.org>\r\n")
            .write(b"550 Requested action not taken: mailbox unavailable\r\n")
            .read(b"DATA\r\n")
            .write(b"554 No valid recipients\r\n")
            .build();
        let mut h = Harness::new(config(), mock);
        h.steps(4).await;

        assert!(h.record(0).lock().unwrap().disposed);
        assert_eq!(h.session.state(), SessionState::Identified);
    }

    #[tokio::test]
    async fn data_after_bdat_is_refused() {
        let mock = Builder::new()
            .read(HELO)
            .write(HELO_REPLY)
            .read(b"MAIL FROM:<alice@example.com>\r\n")
            .write(OK)
            .read(b"RCPT TO:<bob@example.org>\r\n")
            .write(OK)
            .read(b"BDAT 2\r\nhi")
            .write(b"250 2 octets received\r\n")
            .read(b"DATA\r\n")
            .write(b"451 Requested action aborted: local error in processing\r\n")
            .build();
        let mut h = Harness::new(config(), mock);
        h.steps(5).await;

        let record = h.record(0);
        let record = record.lock().unwrap();
        assert!(record.disposed);
        assert_eq!(record.finish_calls, 0);
    }

    #[tokio::test]
    async fn binarymime_requires_bdat() {
        let mock = Builder::new()
            .read(HELO)
            .write(HELO_REPLY)
            .read(b"MAIL FROM:<alice@example.com> BODY=BINARYMIME\r\n")
            .write(OK)
            .read(b"RCPT TO:<bob@example.org>\r\n")
            .write(OK)
            .read(b"DATA\r\n")
            .write(b"503 BINARYMIME requires BDAT\r\n")
            .build();
        let mut h = Harness::new(config(), mock);
        h.steps(4).await;
        assert!(h.session.has_transaction());
    }

    #[tokio::test]
    async fn unsupported_body_encoding() {
        let config = DeliveryConfig::builder("mx.example.org")
            .eight_bit_mime(false)
            .build();
        let mock = Builder::new()
            .read(HELO)
            .write(HELO_REPLY)
            .read(b"MAIL FROM:<alice@example.com> BODY=8BITMIME\r\n")
            .write(b"504 BODY=8BITMIME not supported\r\n")
            .build();
        let mut h = Harness::new(config, mock);
        h.steps(2).await;
        assert!(!h.session.has_transaction());
        assert!(h.record(0).lock().unwrap().disposed);
    }

    #[tokio::test]
    async fn rset_disposes_and_next_mail_creates_handler() {
        let mock = Builder::new()
            .read(HELO)
            .write(HELO_REPLY)
            .read(b"MAIL FROM:<alice@example.com>\r\n")
            .write(OK)
            .read(b"RSET\r\n")
            .write(OK)
            .read(b"MAIL FROM:<>\r\n")
            .write(OK)
            .build();
        let mut h = Harness::new(config(), mock);
        h.steps(3).await;
        assert!(h.record(0).lock().unwrap().disposed);
        assert!(!h.session.has_transaction());

        h.steps(1).await;
        assert_eq!(h.created(), 2);
        assert_eq!(h.record(1).lock().unwrap().created, 2);
        assert_eq!(h.session.reverse_path(), Some(&ReversePath::Null));
    }

    #[tokio::test]
    async fn syntax_errors_get_replies() {
        let mock = Builder::new()
            .read(b"FROB\r\n")
            .write(b"500 Syntax error, command unrecognized\r\n")
            .read(b"VRFY bob\r\n")
            .write(b"252 Cannot VRFY user, but will accept message and attempt delivery\r\n")
            .read(b"STARTTLS\r\n")
            .write(b"454 TLS not available due to temporary reason\r\n")
            .read(b"AUTH PLAIN\r\n")
            .write(b"502 Command not implemented\r\n")
            .build();
        let mut h = Harness::new(config(), mock);
        h.steps(4).await;
    }

    #[tokio::test]
    async fn invalid_mail_syntax_is_501() {
        let mock = Builder::new()
            .read(HELO)
            .write(HELO_REPLY)
            .read(b"MAIL FROM:alice@example.com\r\n")
            .write(b"501 Syntax error in parameters or arguments: path must start with '<'\r\n")
            .build();
        let mut h = Harness::new(config(), mock);
        h.steps(2).await;
        assert_eq!(h.created(), 0);
        assert_eq!(h.session.state(), SessionState::Identified);
    }

    #[tokio::test]
    async fn unparsable_bdat_is_unrecoverable() {
        let mock = Builder::new()
            .read(HELO)
            .write(HELO_REPLY)
            .read(b"MAIL FROM:<alice@example.com>\r\n")
            .write(OK)
            .read(b"BDAT lots\r\n")
            .build();
        let mut h = Harness::new(config(), mock);
        h.steps(2).await;
        let err = h.step().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(h.record(0).lock().unwrap().disposed);
    }

    #[tokio::test]
    async fn quit_ends_session() {
        let mock = Builder::new()
            .read(HELO)
            .write(HELO_REPLY)
            .read(b"MAIL FROM:<alice@example.com>\r\n")
            .write(OK)
            .read(b"QUIT\r\n")
            .write(b"221 mx.example.org Service closing transmission channel\r\n")
            .build();
        let mut h = Harness::new(config(), mock);
        h.steps(2).await;
        assert_eq!(h.step().await.unwrap(), Flow::Quit);
        assert!(h.record(0).lock().unwrap().disposed);
    }

    #[tokio::test]
    async fn cancellation_during_mail_disposes_handler() {
        let mock = Builder::new()
            .read(HELO)
            .write(HELO_REPLY)
            .read(b"MAIL FROM:<alice@example.com>\r\n")
            .build();
        let mut h = Harness::new(config(), mock);
        h.steps(1).await;

        h.cancel.cancel();
        let err = h.step().await.unwrap_err();
        assert!(err.is_cancelled());
        let record = h.record(0);
        let record = record.lock().unwrap();
        assert!(record.disposed);
        assert!(record.started.is_none());
    }

    #[tokio::test]
    async fn cancellation_while_start_is_suspended() {
        let mock = Builder::new()
            .read(HELO)
            .write(HELO_REPLY)
            .read(b"MAIL FROM:<alice@example.com>\r\n")
            .build();
        let (mut h, entered) = Harness::stalling(mock, Stall::Start);
        h.steps(1).await;

        let err = h.step_cancelled_when(entered).await;
        assert!(err.is_cancelled());
        assert!(!h.session.has_transaction());
        // Nothing may have been queued for the cancelled exchange.
        h.transport.flush().await.unwrap();

        let record = h.record(0);
        let record = record.lock().unwrap();
        assert!(record.disposed);
        assert!(record.started.is_none());
        assert!(!record.completed);
    }

    #[tokio::test]
    async fn cancellation_while_recipient_is_suspended() {
        let mock = Builder::new()
            .read(HELO)
            .write(HELO_REPLY)
            .read(b"MAIL FROM:<alice@example.com>\r\n")
            .write(OK)
            .read(b"RCPT TO:<bob@example.org>\r\n")
            .build();
        let (mut h, entered) = Harness::stalling(mock, Stall::Recipient);
        h.steps(2).await;
        assert!(h.session.has_transaction());

        let err = h.step_cancelled_when(entered).await;
        assert!(err.is_cancelled());
        assert!(!h.session.has_transaction());
        assert_eq!(h.session.state(), SessionState::Identified);
        h.transport.flush().await.unwrap();

        let record = h.record(0);
        let record = record.lock().unwrap();
        assert!(record.disposed);
        assert!(record.recipients.is_empty());
        assert!(!record.completed);
    }

    struct PlainAuthenticator;

    #[async_trait]
    impl Authenticator for PlainAuthenticator {
        fn mechanisms(&self) -> Vec<AuthMechanism> {
            vec![AuthMechanism::Plain]
        }

        async fn start(
            &mut self,
            _mechanism: AuthMechanism,
            initial_response: Option<&[u8]>,
        ) -> Result<SaslStep> {
            match initial_response {
                None => Ok(SaslStep::Challenge(Vec::new())),
                Some(response) => self.step(response).await,
            }
        }

        async fn step(&mut self, response: &[u8]) -> Result<SaslStep> {
            if response == b"\0user\0secret" {
                Ok(SaslStep::Success("user".to_string()))
            } else {
                Ok(SaslStep::Failure)
            }
        }
    }

    #[tokio::test]
    async fn auth_challenge_and_response() {
        let mock = Builder::new()
            .read(HELO)
            .write(HELO_REPLY)
            .read(b"AUTH PLAIN\r\n")
            .write(b"334 \r\n")
            .read(b"AHVzZXIAc2VjcmV0\r\n")
            .write(b"235 Authentication successful\r\n")
            .read(b"AUTH PLAIN AHVzZXIAc2VjcmV0\r\n")
            .write(b"503 Bad sequence of commands\r\n")
            .build();
        let records = Arc::new(Mutex::new(Vec::new()));
        let mut h = Harness {
            session: DeliverySession::new(config(), factory(&records))
                .with_authenticator(PlainAuthenticator),
            transport: StreamTransport::new(mock),
            records,
            cancel: CancellationToken::new(),
        };
        h.steps(2).await;
        assert_eq!(h.session.expected_input(), ExpectedInput::SaslResponse);
        h.steps(2).await;
        assert_eq!(h.session.authenticated_as(), Some("user"));
        assert!(!h.session.extensions(false).contains("AUTH"));
    }

    #[tokio::test]
    async fn auth_cancelled_by_client() {
        let mock = Builder::new()
            .read(HELO)
            .write(HELO_REPLY)
            .read(b"AUTH PLAIN\r\n")
            .write(b"334 \r\n")
            .read(b"*\r\n")
            .write(b"501 Syntax error in parameters or arguments: authentication cancelled\r\n")
            .read(b"AUTH PLAIN AHVzZXIAd3Jvbmc=\r\n")
            .write(b"535 Authentication credentials invalid\r\n")
            .build();
        let records = Arc::new(Mutex::new(Vec::new()));
        let mut h = Harness {
            session: DeliverySession::new(config(), factory(&records))
                .with_authenticator(PlainAuthenticator),
            transport: StreamTransport::new(mock),
            records,
            cancel: CancellationToken::new(),
        };
        h.steps(3).await;
        assert_eq!(h.session.expected_input(), ExpectedInput::Command);
        assert_eq!(h.session.authenticated_as(), None);

        h.steps(1).await;
        assert_eq!(h.session.authenticated_as(), None);
        assert!(h.session.extensions(false).contains("AUTH"));
    }
}
