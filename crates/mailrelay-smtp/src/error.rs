//! Error types for SMTP operations.

use std::io;

/// Result type alias for SMTP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SMTP error types.
///
/// Business rejections (a refused mailbox, an unknown recipient) are not
/// errors; handlers report them through [`Verdict`](crate::transaction::Verdict).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// Peer returned a negative reply.
    #[error("SMTP error {code}: {message}")]
    SmtpError {
        /// Reply code (e.g., 550).
        code: u16,
        /// Error message from the peer.
        message: String,
    },

    /// Malformed reply or command framing.
    #[error("Format error: {0}")]
    Format(String),

    /// The channel is desynchronized and the connection must be dropped.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The operation was cancelled through its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid email address.
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    /// Feature not supported by the peer.
    #[error("Peer does not support {0}")]
    NotSupported(String),

    /// Invalid state for operation.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    /// Delivery logic failed for a reason unrelated to protocol syntax.
    #[error("Transaction handler failed: {0}")]
    Handler(String),
}

impl Error {
    /// Creates an SMTP error from a reply code and message.
    #[must_use]
    pub fn smtp_error(code: u16, message: impl Into<String>) -> Self {
        Self::SmtpError {
            code,
            message: message.into(),
        }
    }

    /// Creates a handler failure.
    #[must_use]
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::SmtpError { code, .. } if *code >= 500 && *code < 600)
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::SmtpError { code, .. } if *code >= 400 && *code < 500)
    }

    /// Returns true if the connection cannot continue after this error.
    ///
    /// No reply may be sent once one of these has been raised; the outer loop
    /// closes the transport.
    #[must_use]
    pub const fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Tls(_)
                | Self::InvalidDnsName(_)
                | Self::Format(_)
                | Self::Protocol(_)
                | Self::Cancelled
        )
    }

    /// Returns true if this error is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn classify_smtp_errors() {
        assert!(Error::smtp_error(550, "no such user").is_permanent());
        assert!(Error::smtp_error(451, "try later").is_transient());
        assert!(!Error::smtp_error(451, "try later").is_unrecoverable());
    }

    #[test]
    fn unrecoverable_variants() {
        assert!(Error::Protocol("desync".into()).is_unrecoverable());
        assert!(Error::Cancelled.is_unrecoverable());
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::handler("disk full").is_unrecoverable());
        assert!(!Error::InvalidAddress("x".into()).is_unrecoverable());
    }

    #[test]
    fn display() {
        assert_eq!(
            Error::smtp_error(550, "unknown user").to_string(),
            "SMTP error 550: unknown user"
        );
        assert_eq!(Error::Cancelled.to_string(), "Operation cancelled");
    }
}
