//! # mailrelay-smtp
//!
//! SMTP wire engine (RFC 5321) for both sides of a mail transfer.
//!
//! ## Features
//!
//! - **Command/reply codec**: parsing and serialization of every command the
//!   engine speaks, sans-I/O reply parser
//! - **Delivery role**: server session state machine with pipelining,
//!   `CHUNKING`/`BINARYMIME`, `8BITMIME`, `STARTTLS` and an `AUTH` envelope
//! - **Originating role**: client session with `EHLO`/`HELO` fallback,
//!   `STARTTLS`, `AUTH PLAIN` and `BDAT` or dot-stuffed `DATA` transfers
//! - **One transaction abstraction**: [`TransactionHandler`] is implemented
//!   by the environment on the delivery side and by the engine itself on the
//!   originating side
//! - **Cooperative cancellation** through `tokio_util`'s `CancellationToken`
//!
//! ## Quick Start
//!
//! ```ignore
//! use mailrelay_smtp::origination::{MessageBatch, OriginatorConfig, OriginatorProtocol, OutgoingMessage};
//! use mailrelay_smtp::transport::connect;
//! use mailrelay_smtp::{Address, ReversePath};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> mailrelay_smtp::Result<()> {
//!     let transport = connect("mx.example.org", 25).await?;
//!     let message = OutgoingMessage::new(
//!         ReversePath::Mailbox(Address::new("alice@example.com")?),
//!         vec![Address::new("bob@example.org")?],
//!         &b"Subject: Test\r\n\r\nHello, World!\r\n"[..],
//!     );
//!     let mut batch = MessageBatch::new([message]);
//!
//!     OriginatorProtocol::new(transport, OriginatorConfig::new("client.example.com"))
//!         .run(&mut batch, &CancellationToken::new())
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`command`]: SMTP commands, parser and serializer
//! - [`parser`]: Reply parser
//! - [`types`]: Core SMTP types (addresses, extensions, replies)
//! - [`transport`]: Byte channel abstraction and its stream implementation
//! - [`transaction`]: Transaction handler boundary and body streams
//! - [`delivery`]: Server role
//! - [`origination`]: Client role

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod command;
pub mod delivery;
mod error;
pub mod origination;
pub mod parser;
pub mod transaction;
pub mod transport;
pub mod types;

pub use command::{Command, CommandKind, ExpectedInput};
pub use error::{Error, Result};
pub use transaction::{
    BodyStream, ConnectionInfo, Rejection, TransactionFactory, TransactionHandler, Verdict,
};
pub use transport::{StreamTransport, Transport};
pub use types::{
    Address, AuthMechanism, BodyEncoding, Extension, ExtensionSet, Reply, ReplyCode, ReversePath,
};
