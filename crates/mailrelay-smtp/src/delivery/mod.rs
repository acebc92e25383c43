//! Delivery (server) role.
//!
//! [`DeliverySession`] is the per-connection state machine that validates
//! the command sequence and drives a [`TransactionHandler`] obtained from a
//! [`TransactionFactory`]. [`DeliveryProtocol`] runs it over a transport.
//!
//! ```text
//! ┌─────────┐ HELO/EHLO ┌────────────┐ MAIL FROM ┌───────────────┐
//! │ Initial │ ────────→ │ Identified │ ────────→ │ InTransaction │
//! └─────────┘           └────────────┘ ←──────── └───────────────┘
//!                                      RSET, body done, error
//! ```
//!
//! [`TransactionHandler`]: crate::transaction::TransactionHandler
//! [`TransactionFactory`]: crate::transaction::TransactionFactory

mod auth;
mod body;
mod config;
mod protocol;
mod session;

pub use auth::{Authenticator, SaslStep};
pub use config::{ConfigBuilder, DEFAULT_BODY_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE, DeliveryConfig};
pub use protocol::DeliveryProtocol;
pub use session::{DeliverySession, Flow, SessionState};
