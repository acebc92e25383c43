//! SMTP commands: typed model, parser and serializer.
//!
//! A [`Command`] is built either by the originating side (and serialized
//! with [`Command::serialize`]) or by the delivery side from a raw line
//! (with [`Command::parse`]). Syntax problems in a recognized verb never fail
//! the parse; they produce [`Command::Invalid`] so the session can answer
//! with a reply and carry on.

mod parse;
mod serialize;

use bytes::Bytes;

use crate::types::{Address, BodyEncoding, ReversePath};

/// What the channel expects as the next input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpectedInput {
    /// An ordinary command line.
    #[default]
    Command,
    /// A SASL response line following a 334 challenge.
    SaslResponse,
}

/// Command verb, used to report which command a syntax error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// `HELO`
    Helo,
    /// `EHLO`
    Ehlo,
    /// `MAIL FROM`
    MailFrom,
    /// `RCPT TO`
    RcptTo,
    /// `DATA`
    Data,
    /// `BDAT`
    Bdat,
    /// `RSET`
    Rset,
    /// `NOOP`
    Noop,
    /// `QUIT`
    Quit,
    /// `VRFY`
    Vrfy,
    /// `STARTTLS`
    StartTls,
    /// `AUTH`
    Auth,
    /// SASL response line.
    SaslResponse,
    /// Message payload block.
    DataBlock,
    /// Unrecognized verb.
    Unknown,
}

impl CommandKind {
    /// Returns the verb as written on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Helo => "HELO",
            Self::Ehlo => "EHLO",
            Self::MailFrom => "MAIL FROM",
            Self::RcptTo => "RCPT TO",
            Self::Data => "DATA",
            Self::Bdat => "BDAT",
            Self::Rset => "RSET",
            Self::Noop => "NOOP",
            Self::Quit => "QUIT",
            Self::Vrfy => "VRFY",
            Self::StartTls => "STARTTLS",
            Self::Auth => "AUTH",
            Self::SaslResponse => "SASL response",
            Self::DataBlock => "data block",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SMTP command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// HELO - Simple greeting
    Helo {
        /// Client identification, verbatim
        domain: String,
    },
    /// EHLO - Extended greeting
    Ehlo {
        /// Client identification, verbatim
        domain: String,
    },
    /// MAIL FROM - Start mail transaction
    MailFrom {
        /// Sender address, possibly null
        reverse_path: ReversePath,
        /// BODY parameter
        body: Option<BodyEncoding>,
        /// AUTH parameter (RFC 4954), possibly `<>`
        auth: Option<ReversePath>,
    },
    /// RCPT TO - Add recipient
    RcptTo {
        /// Recipient address
        forward_path: Address,
    },
    /// DATA - Begin dot-terminated message data
    Data,
    /// BDAT - Send one chunk of message data (RFC 3030)
    Bdat {
        /// Exact number of payload octets following the command line
        size: u64,
        /// Whether this is the final chunk
        last: bool,
    },
    /// RSET - Reset transaction
    Rset,
    /// NOOP - No operation
    Noop,
    /// QUIT - Close connection
    Quit,
    /// VRFY - Verify address
    Vrfy {
        /// Address or name to verify, verbatim
        argument: String,
    },
    /// STARTTLS - Upgrade to TLS
    StartTls,
    /// AUTH - Begin authentication
    Auth {
        /// SASL mechanism name
        mechanism: String,
        /// Decoded initial response (`=` decodes to an empty response)
        initial_response: Option<Vec<u8>>,
    },
    /// SASL response line following a 334 challenge, verbatim base64
    SaslResponse {
        /// Base64 text, `=` or the `*` cancellation marker
        response: String,
    },
    /// Message payload sent as-is after `DATA` or `BDAT`
    DataBlock(Bytes),
    /// Recognized verb with a syntax error
    Invalid {
        /// Verb the line was recognized as
        kind: CommandKind,
        /// The offending line without its terminator
        line: String,
        /// What was wrong with it
        reason: String,
    },
    /// Unrecognized verb
    Unknown {
        /// The line without its terminator
        line: String,
    },
}

impl Command {
    /// Returns the verb of this command.
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::Helo { .. } => CommandKind::Helo,
            Self::Ehlo { .. } => CommandKind::Ehlo,
            Self::MailFrom { .. } => CommandKind::MailFrom,
            Self::RcptTo { .. } => CommandKind::RcptTo,
            Self::Data => CommandKind::Data,
            Self::Bdat { .. } => CommandKind::Bdat,
            Self::Rset => CommandKind::Rset,
            Self::Noop => CommandKind::Noop,
            Self::Quit => CommandKind::Quit,
            Self::Vrfy { .. } => CommandKind::Vrfy,
            Self::StartTls => CommandKind::StartTls,
            Self::Auth { .. } => CommandKind::Auth,
            Self::SaslResponse { .. } => CommandKind::SaslResponse,
            Self::DataBlock(_) => CommandKind::DataBlock,
            Self::Invalid { kind, .. } => *kind,
            Self::Unknown { .. } => CommandKind::Unknown,
        }
    }

    /// Returns true for [`Command::Invalid`].
    #[must_use]
    pub const fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid { .. })
    }

    /// Returns true if a reply to this command must be flushed immediately
    /// rather than grouped with following replies (RFC 2920 section 3.1).
    #[must_use]
    pub const fn is_sync_point(&self) -> bool {
        !matches!(
            self,
            Self::MailFrom { .. } | Self::RcptTo { .. } | Self::Rset | Self::Bdat { last: false, .. }
        )
    }
}

/// Command lines as logged: payload blocks are summarized and SASL data is
/// masked.
impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DataBlock(data) => write!(f, "<{} octets>", data.len()),
            Self::SaslResponse { .. } => f.write_str("<sasl response>"),
            Self::Auth { mechanism, .. } => write!(f, "AUTH {mechanism} ..."),
            other => {
                let wire = other.serialize();
                let text = String::from_utf8_lossy(&wire);
                f.write_str(text.trim_end_matches("\r\n"))
            }
        }
    }
}
