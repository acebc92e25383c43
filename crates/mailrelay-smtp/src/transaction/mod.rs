//! Mail transaction abstraction.
//!
//! A [`TransactionHandler`] is the boundary between a session and the
//! delivery logic. On the delivery side the environment supplies handlers
//! through a [`TransactionFactory`]; on the originating side
//! [`DataTransferTransaction`](crate::origination::DataTransferTransaction)
//! implements the same trait in terms of commands and replies.
//!
//! Releasing a handler is dropping it. A session drops the in-flight handler
//! on `RSET`, on a new `HELO`/`EHLO`, after the body transfer finished, on
//! any unrecoverable error and on cancellation.

mod body;
mod dot_stuff;

use std::future::Future;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use body::{BodyStream, ExactSizeBody, MemoryBody, ReaderBody, read_to_end};
pub use dot_stuff::DotStuffer;

use crate::error::{Error, Result};
use crate::types::{Address, BodyEncoding, Reply, ReplyCode, ReversePath};

/// Outcome of a handler operation that the peer may legitimately be refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The reverse path or recipient was accepted.
    Accepted,
    /// The reverse path or recipient was refused.
    Rejected(Rejection),
}

impl Verdict {
    /// Returns true for [`Verdict::Accepted`].
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Business reason for refusing a mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Mailbox name not allowed (553).
    MailboxNotAllowed,
    /// Mailbox unavailable (550).
    MailboxUnavailable,
    /// Mailbox temporarily unavailable (450).
    MailboxBusy,
    /// Insufficient system storage (452).
    InsufficientStorage,
    /// Any other negative reply, sent or received verbatim.
    Other(Reply),
}

impl Rejection {
    /// Returns the reply announcing this rejection to the peer.
    #[must_use]
    pub fn to_reply(&self) -> Reply {
        match self {
            Self::MailboxNotAllowed => Reply::mailbox_not_allowed(),
            Self::MailboxUnavailable => Reply::mailbox_unavailable(),
            Self::MailboxBusy => Reply::single(
                ReplyCode::MAILBOX_BUSY,
                "Requested mail action not taken: mailbox unavailable",
            ),
            Self::InsufficientStorage => Reply::single(
                ReplyCode::INSUFFICIENT_STORAGE,
                "Requested action not taken: insufficient system storage",
            ),
            Self::Other(reply) => reply.clone(),
        }
    }

    /// Classifies a negative reply received from a peer.
    #[must_use]
    pub fn from_reply(reply: Reply) -> Self {
        match reply.code {
            ReplyCode::MAILBOX_NAME_INVALID => Self::MailboxNotAllowed,
            ReplyCode::MAILBOX_UNAVAILABLE => Self::MailboxUnavailable,
            ReplyCode::MAILBOX_BUSY => Self::MailboxBusy,
            ReplyCode::INSUFFICIENT_STORAGE => Self::InsufficientStorage,
            _ => Self::Other(reply),
        }
    }
}

/// Attributes of the connection a transaction belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Address of the remote peer, if known.
    pub peer_addr: Option<SocketAddr>,
    /// Identification declared with `HELO`/`EHLO`.
    pub client_identity: Option<String>,
    /// Whether the channel is protected by TLS.
    pub secure: bool,
    /// Identity established with `AUTH`, if any.
    pub authenticated_as: Option<String>,
}

/// Delivery logic for one mail transaction.
///
/// Operations are called in order: [`start`](Self::start) once, then
/// [`try_add_recipient`](Self::try_add_recipient) any number of times, then
/// at most one [`transfer_data_and_finish`](Self::transfer_data_and_finish).
/// Returning `Err` from any of them is a handler failure and ends the
/// transaction.
#[async_trait]
pub trait TransactionHandler: Send {
    /// Opens the transaction with its reverse path.
    async fn start(&mut self, reverse_path: &ReversePath, encoding: BodyEncoding)
    -> Result<Verdict>;

    /// Offers one recipient.
    async fn try_add_recipient(&mut self, forward_path: &Address) -> Result<Verdict>;

    /// Consumes the message body and completes the transaction.
    ///
    /// `size` is the exact body length when the sender declared it.
    async fn transfer_data_and_finish(
        &mut self,
        body: &mut dyn BodyStream,
        size: Option<u64>,
    ) -> Result<()>;
}

/// Creates one handler per transaction on the delivery side.
pub trait TransactionFactory: Send {
    /// Handler type produced by this factory.
    type Handler: TransactionHandler;

    /// Creates the handler for a new transaction.
    ///
    /// # Errors
    ///
    /// Any error is reported to the peer as a transient local failure.
    fn create_handler(&mut self, connection: &ConnectionInfo) -> Result<Self::Handler>;
}

impl<F, H> TransactionFactory for F
where
    F: FnMut(&ConnectionInfo) -> Result<H> + Send,
    H: TransactionHandler,
{
    type Handler = H;

    fn create_handler(&mut self, connection: &ConnectionInfo) -> Result<H> {
        self(connection)
    }
}

/// Runs `operation` unless `cancel` fires first.
///
/// Cancellation wins when both are ready. The operation future is dropped on
/// cancellation, so whatever it borrowed is released before this returns.
///
/// # Errors
///
/// Returns [`Error::Cancelled`] on cancellation, otherwise the operation's
/// own result.
pub async fn cancellable<T, F>(cancel: &CancellationToken, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = operation => result,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rejection_replies() {
        assert_eq!(Rejection::MailboxNotAllowed.to_reply().code.as_u16(), 553);
        assert_eq!(Rejection::MailboxUnavailable.to_reply().code.as_u16(), 550);
        assert_eq!(Rejection::MailboxBusy.to_reply().code.as_u16(), 450);
        assert_eq!(Rejection::InsufficientStorage.to_reply().code.as_u16(), 452);
    }

    #[test]
    fn rejection_from_reply() {
        let reply = Reply::single(ReplyCode::MAILBOX_UNAVAILABLE, "no such user");
        assert_eq!(Rejection::from_reply(reply), Rejection::MailboxUnavailable);

        let reply = Reply::single(ReplyCode::new(551), "try elsewhere");
        let rejection = Rejection::from_reply(reply.clone());
        assert_eq!(rejection, Rejection::Other(reply.clone()));
        assert_eq!(rejection.to_reply(), reply);
    }

    #[tokio::test]
    async fn cancellable_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = cancellable(&cancel, async { Ok(1) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn cancellable_passes_result_through() {
        let cancel = CancellationToken::new();
        assert_eq!(cancellable(&cancel, async { Ok(7) }).await.unwrap(), 7);
        let result: Result<()> = cancellable(&cancel, async { Err(Error::handler("boom")) }).await;
        assert!(matches!(result, Err(Error::Handler(_))));
    }

    #[tokio::test]
    async fn cancellable_interrupts_pending_operation() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move { trigger.cancel() });
        let result: Result<()> = cancellable(&cancel, std::future::pending()).await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
