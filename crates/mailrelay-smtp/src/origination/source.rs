//! In-memory [`TransactionSource`] over a list of prepared messages.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::session::TransactionSource;
use crate::error::{Error, Result};
use crate::transaction::{MemoryBody, Rejection, TransactionHandler, Verdict};
use crate::types::{Address, BodyEncoding, ReversePath};

/// A message with its envelope, ready to be sent.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Envelope sender.
    pub reverse_path: ReversePath,
    /// Envelope recipients.
    pub recipients: Vec<Address>,
    /// Transfer encoding of the body.
    pub encoding: BodyEncoding,
    /// Message content.
    pub body: Bytes,
}

impl OutgoingMessage {
    /// Creates a 7-bit message.
    pub fn new(reverse_path: ReversePath, recipients: Vec<Address>, body: impl Into<Bytes>) -> Self {
        Self {
            reverse_path,
            recipients,
            encoding: BodyEncoding::SevenBit,
            body: body.into(),
        }
    }

    /// Sets the body encoding.
    #[must_use]
    pub const fn with_encoding(mut self, encoding: BodyEncoding) -> Self {
        self.encoding = encoding;
        self
    }
}

/// What happened to one [`OutgoingMessage`].
#[derive(Debug, Default)]
pub struct DeliveryReport {
    /// Set when the reverse path was refused.
    pub sender_rejected: Option<Rejection>,
    /// Recipients the server accepted.
    pub accepted: Vec<Address>,
    /// Recipients the server refused, with the reason.
    pub rejected: Vec<(Address, Rejection)>,
    /// Negative reply to the message body, if any.
    pub failure: Option<Error>,
    /// True once the server accepted the message.
    pub delivered: bool,
}

/// Sends a fixed list of messages, one transaction each.
#[derive(Debug, Default)]
pub struct MessageBatch {
    pending: VecDeque<OutgoingMessage>,
    reports: Vec<DeliveryReport>,
}

impl MessageBatch {
    /// Creates a batch.
    #[must_use]
    pub fn new(messages: impl IntoIterator<Item = OutgoingMessage>) -> Self {
        Self {
            pending: messages.into_iter().collect(),
            reports: Vec::new(),
        }
    }

    /// Reports for the messages processed so far, in order.
    #[must_use]
    pub fn reports(&self) -> &[DeliveryReport] {
        &self.reports
    }

    /// Number of messages not yet attempted.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    async fn send(
        message: &OutgoingMessage,
        transaction: &mut dyn TransactionHandler,
        report: &mut DeliveryReport,
    ) -> Result<()> {
        if let Verdict::Rejected(rejection) = transaction
            .start(&message.reverse_path, message.encoding)
            .await?
        {
            report.sender_rejected = Some(rejection);
            return Ok(());
        }

        for recipient in &message.recipients {
            match transaction.try_add_recipient(recipient).await? {
                Verdict::Accepted => report.accepted.push(recipient.clone()),
                Verdict::Rejected(rejection) => {
                    report.rejected.push((recipient.clone(), rejection));
                }
            }
        }
        if report.accepted.is_empty() {
            return Ok(());
        }

        let mut body = MemoryBody::new(message.body.clone());
        let size = Some(message.body.len() as u64);
        match transaction.transfer_data_and_finish(&mut body, size).await {
            Ok(()) => report.delivered = true,
            Err(err @ Error::SmtpError { .. }) => report.failure = Some(err),
            Err(err) => return Err(err),
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionSource for MessageBatch {
    async fn next_transaction(
        &mut self,
        transaction: &mut dyn TransactionHandler,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        let Some(message) = self.pending.pop_front() else {
            return Ok(false);
        };
        let mut report = DeliveryReport::default();
        let result = Self::send(&message, transaction, &mut report).await;
        self.reports.push(report);
        result.map(|()| true)
    }
}
