//! [`TransactionHandler`] implemented as an SMTP client exchange.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::session::OriginatingSession;
use crate::command::Command;
use crate::error::{Error, Result};
use crate::transaction::{BodyStream, Rejection, TransactionHandler, Verdict};
use crate::transport::Transport;
use crate::types::{Address, BodyEncoding, ReversePath};

/// One outgoing mail transaction.
///
/// Each handler operation becomes a command sent to the server, and the
/// reply decides the outcome. Dropping the transaction after `MAIL` was
/// accepted but before the body was sent sends nothing; `RSET` goes out
/// when the next transaction on the session starts.
pub struct DataTransferTransaction<'a, T> {
    session: &'a mut OriginatingSession<T>,
    cancel: CancellationToken,
    encoding: BodyEncoding,
    started: bool,
    recipients: usize,
    finished: bool,
}

impl<'a, T> DataTransferTransaction<'a, T> {
    pub(super) const fn new(session: &'a mut OriginatingSession<T>, cancel: CancellationToken) -> Self {
        Self {
            session,
            cancel,
            encoding: BodyEncoding::SevenBit,
            started: false,
            recipients: 0,
            finished: false,
        }
    }

    /// Returns true once `MAIL` was accepted.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }

    /// Returns true once the server answered the body transfer.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of recipients the server accepted.
    #[must_use]
    pub const fn accepted_recipients(&self) -> usize {
        self.recipients
    }
}

impl<T> Drop for DataTransferTransaction<'_, T> {
    fn drop(&mut self) {
        if self.started && !self.finished {
            tracing::debug!("transaction abandoned before completion");
            self.session.needs_reset = true;
        }
    }
}

impl<T> std::fmt::Debug for DataTransferTransaction<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataTransferTransaction")
            .field("encoding", &self.encoding)
            .field("started", &self.started)
            .field("recipients", &self.recipients)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> DataTransferTransaction<'_, T> {
    fn check_encoding(&self, encoding: BodyEncoding) -> Result<()> {
        let extensions = self.session.extensions();
        match encoding {
            BodyEncoding::SevenBit => Ok(()),
            BodyEncoding::EightBitMime if extensions.contains("8BITMIME") => Ok(()),
            BodyEncoding::BinaryMime
                if extensions.contains("BINARYMIME") && extensions.contains("CHUNKING") =>
            {
                Ok(())
            }
            other => Err(Error::NotSupported(other.as_str().to_string())),
        }
    }

    fn use_chunking(&self, size: Option<u64>) -> bool {
        self.encoding == BodyEncoding::BinaryMime
            || (size.is_some()
                && self.session.config().prefer_chunking
                && self.session.extensions().contains("CHUNKING"))
    }
}

#[async_trait]
impl<T: Transport> TransactionHandler for DataTransferTransaction<'_, T> {
    async fn start(&mut self, reverse_path: &ReversePath, encoding: BodyEncoding) -> Result<Verdict> {
        if self.started {
            return Err(Error::InvalidState("transaction already started".to_string()));
        }
        self.check_encoding(encoding)?;
        self.session.reset_if_needed(&self.cancel).await?;

        let command = Command::MailFrom {
            reverse_path: reverse_path.clone(),
            body: (encoding != BodyEncoding::SevenBit).then_some(encoding),
            auth: None,
        };
        let reply = self.session.exchange(&command, &self.cancel).await?;
        if reply.is_success() {
            self.started = true;
            self.encoding = encoding;
            tracing::debug!(%reverse_path, "transaction started");
            Ok(Verdict::Accepted)
        } else if reply.is_permanent_error() {
            tracing::info!(code = reply.code.as_u16(), %reverse_path, "reverse path refused");
            Ok(Verdict::Rejected(Rejection::MailboxNotAllowed))
        } else {
            tracing::info!(code = reply.code.as_u16(), %reverse_path, "reverse path deferred");
            Ok(Verdict::Rejected(Rejection::from_reply(reply)))
        }
    }

    async fn try_add_recipient(&mut self, forward_path: &Address) -> Result<Verdict> {
        if !self.started {
            return Err(Error::InvalidState("transaction not started".to_string()));
        }
        if self.finished {
            return Err(Error::InvalidState("transaction already finished".to_string()));
        }

        let command = Command::RcptTo {
            forward_path: forward_path.clone(),
        };
        let reply = self.session.exchange(&command, &self.cancel).await?;
        if reply.is_success() {
            self.recipients += 1;
            Ok(Verdict::Accepted)
        } else {
            tracing::info!(code = reply.code.as_u16(), recipient = %forward_path, "recipient refused");
            Ok(Verdict::Rejected(Rejection::from_reply(reply)))
        }
    }

    async fn transfer_data_and_finish(
        &mut self,
        body: &mut dyn BodyStream,
        size: Option<u64>,
    ) -> Result<()> {
        if !self.started || self.finished {
            return Err(Error::InvalidState("no open transaction".to_string()));
        }
        if self.recipients == 0 {
            return Err(Error::InvalidState("no accepted recipients".to_string()));
        }

        let reply = if self.use_chunking(size) {
            let Some(size) = size else {
                return Err(Error::NotSupported(
                    "BINARYMIME body of unknown size".to_string(),
                ));
            };
            tracing::debug!(size, "sending body with BDAT");
            self.session
                .transfer_chunked(body, size, &self.cancel)
                .await?
        } else {
            tracing::debug!("sending body with DATA");
            self.session.transfer_text(body, &self.cancel).await?
        };

        self.finished = true;
        if reply.is_success() {
            tracing::debug!("transaction completed");
            Ok(())
        } else {
            Err(reply.into_error())
        }
    }
}
