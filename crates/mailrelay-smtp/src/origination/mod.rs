//! Originating (client) role.
//!
//! ```text
//! connect ──► greeting 2xx ──► EHLO ──(refused)──► HELO
//!                                │                   │
//!                                ▼                   ▼
//!                     [STARTTLS ──► EHLO]     transactions ──► QUIT
//! ```
//!
//! Each transaction is a [`DataTransferTransaction`] borrowed from the
//! session. It implements [`TransactionHandler`](crate::transaction::TransactionHandler),
//! so the same driver code can feed a local delivery handler or a remote
//! server.

mod config;
mod protocol;
mod session;
mod source;
mod transaction;

pub use config::{ClientTls, OriginatorConfig, OriginatorConfigBuilder};
pub use protocol::OriginatorProtocol;
pub use session::{OriginatingSession, TransactionSource};
pub use source::{DeliveryReport, MessageBatch, OutgoingMessage};
pub use transaction::DataTransferTransaction;
