//! SMTP reply types.

use bytes::{BufMut, Bytes, BytesMut};

use super::ExtensionSet;

/// SMTP reply: a three-digit code and one or more text lines.
///
/// All lines share the code; on the wire every line but the last is written
/// as `code-text` and the last as `code text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply code (e.g., 250).
    pub code: ReplyCode,
    /// Reply text lines, never empty.
    pub lines: Vec<String>,
}

impl Reply {
    /// Creates a new reply. An empty line list becomes a single empty line.
    #[must_use]
    pub fn new(code: ReplyCode, mut lines: Vec<String>) -> Self {
        if lines.is_empty() {
            lines.push(String::new());
        }
        Self { code, lines }
    }

    /// Creates a single-line reply.
    #[must_use]
    pub fn single(code: ReplyCode, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    /// Returns true if this is a positive reply (2xx or 3xx).
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.code.is_success() || self.code.is_intermediate()
    }

    /// Returns true if this is a success reply (2xx).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient_error(&self) -> bool {
        self.code.is_transient()
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code.is_permanent()
    }

    /// Returns the full message as a single string.
    #[must_use]
    pub fn message_text(&self) -> String {
        self.lines.join("\n")
    }

    /// Converts the reply into an [`Error::SmtpError`](crate::Error::SmtpError).
    #[must_use]
    pub fn into_error(self) -> crate::Error {
        crate::Error::smtp_error(self.code.as_u16(), self.message_text())
    }

    /// Serializes the reply to its wire form.
    #[must_use]
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.lines.iter().map(|l| l.len() + 6).sum());
        let code = self.code.to_string();
        let last = self.lines.len().saturating_sub(1);
        for (index, line) in self.lines.iter().enumerate() {
            buf.put_slice(code.as_bytes());
            buf.put_u8(if index == last { b' ' } else { b'-' });
            buf.put_slice(line.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.freeze()
    }
}

// Canonical replies.
impl Reply {
    /// 220 service ready banner.
    #[must_use]
    pub fn service_ready(domain: &str, text: &str) -> Self {
        Self::single(ReplyCode::SERVICE_READY, format!("{domain} {text}"))
    }

    /// 250 hello reply. `EHLO` gets one line per extension after the
    /// greeting line; `HELO` gets the greeting only.
    #[must_use]
    pub fn hello(domain: &str, client: &str, extensions: Option<&ExtensionSet>) -> Self {
        let mut lines = vec![format!("{domain} Hello {client}")];
        if let Some(extensions) = extensions {
            lines.extend(extensions.iter().map(super::Extension::to_line));
        }
        Self::new(ReplyCode::OK, lines)
    }

    /// 250 generic OK.
    #[must_use]
    pub fn ok() -> Self {
        Self::single(ReplyCode::OK, "OK")
    }

    /// 221 closing.
    #[must_use]
    pub fn closing(domain: &str) -> Self {
        Self::single(
            ReplyCode::CLOSING,
            format!("{domain} Service closing transmission channel"),
        )
    }

    /// 354 start mail input.
    #[must_use]
    pub fn start_data() -> Self {
        Self::single(
            ReplyCode::START_DATA,
            "Start mail input; end with <CRLF>.<CRLF>",
        )
    }

    /// 550 mailbox unavailable.
    #[must_use]
    pub fn mailbox_unavailable() -> Self {
        Self::single(
            ReplyCode::MAILBOX_UNAVAILABLE,
            "Requested action not taken: mailbox unavailable",
        )
    }

    /// 553 mailbox name not allowed.
    #[must_use]
    pub fn mailbox_not_allowed() -> Self {
        Self::single(
            ReplyCode::MAILBOX_NAME_INVALID,
            "Requested action not taken: mailbox name not allowed",
        )
    }

    /// 503 bad sequence of commands.
    #[must_use]
    pub fn bad_sequence() -> Self {
        Self::single(ReplyCode::BAD_SEQUENCE, "Bad sequence of commands")
    }

    /// 500 command unrecognized.
    #[must_use]
    pub fn syntax_error() -> Self {
        Self::single(ReplyCode::SYNTAX_ERROR, "Syntax error, command unrecognized")
    }

    /// 501 syntax error in parameters.
    #[must_use]
    pub fn parameter_error(reason: &str) -> Self {
        Self::single(
            ReplyCode::PARAMETER_ERROR,
            format!("Syntax error in parameters or arguments: {reason}"),
        )
    }

    /// 502 command not implemented.
    #[must_use]
    pub fn not_implemented() -> Self {
        Self::single(ReplyCode::NOT_IMPLEMENTED, "Command not implemented")
    }

    /// 451 local error in processing.
    #[must_use]
    pub fn local_error() -> Self {
        Self::single(
            ReplyCode::LOCAL_ERROR,
            "Requested action aborted: local error in processing",
        )
    }

    /// 554 transaction failed.
    #[must_use]
    pub fn transaction_failed(text: &str) -> Self {
        Self::single(ReplyCode::TRANSACTION_FAILED, text)
    }

    /// 252 cannot verify.
    #[must_use]
    pub fn cannot_verify() -> Self {
        Self::single(
            ReplyCode::CANNOT_VERIFY,
            "Cannot VRFY user, but will accept message and attempt delivery",
        )
    }

    /// 220 ready to start TLS.
    #[must_use]
    pub fn ready_for_tls() -> Self {
        Self::single(ReplyCode::SERVICE_READY, "Ready to start TLS")
    }

    /// 454 TLS not available.
    #[must_use]
    pub fn tls_unavailable() -> Self {
        Self::single(
            ReplyCode::TLS_UNAVAILABLE,
            "TLS not available due to temporary reason",
        )
    }

    /// 334 authentication challenge (already base64 encoded).
    #[must_use]
    pub fn auth_challenge(encoded: String) -> Self {
        Self::single(ReplyCode::AUTH_CONTINUE, encoded)
    }

    /// 235 authentication succeeded.
    #[must_use]
    pub fn auth_succeeded() -> Self {
        Self::single(ReplyCode::AUTH_SUCCESS, "Authentication successful")
    }

    /// 535 authentication failed.
    #[must_use]
    pub fn auth_failed() -> Self {
        Self::single(
            ReplyCode::AUTH_FAILED,
            "Authentication credentials invalid",
        )
    }

    /// 552 exceeded storage allocation.
    #[must_use]
    pub fn message_too_large() -> Self {
        Self::single(
            ReplyCode::EXCEEDED_STORAGE,
            "Message size exceeds fixed maximum message size",
        )
    }
}

/// SMTP reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplyCode(u16);

impl ReplyCode {
    /// Creates a new reply code without range checking.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Creates a reply code, returning `None` outside 100..=599.
    #[must_use]
    pub const fn try_new(code: u16) -> Option<Self> {
        if code >= 100 && code <= 599 {
            Some(Self(code))
        } else {
            None
        }
    }

    /// Returns the numeric code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns true if this is a success code (2xx).
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 >= 200 && self.0 < 300
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient(self) -> bool {
        self.0 >= 400 && self.0 < 500
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        self.0 >= 500 && self.0 < 600
    }

    /// Returns true if this is an intermediate reply (3xx).
    #[must_use]
    pub const fn is_intermediate(self) -> bool {
        self.0 >= 300 && self.0 < 400
    }
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Common reply codes
impl ReplyCode {
    /// 220 Service ready
    pub const SERVICE_READY: Self = Self(220);
    /// 221 Service closing transmission channel
    pub const CLOSING: Self = Self(221);
    /// 235 Authentication succeeded
    pub const AUTH_SUCCESS: Self = Self(235);
    /// 250 Requested mail action okay, completed
    pub const OK: Self = Self(250);
    /// 251 User not local; will forward
    pub const FORWARD: Self = Self(251);
    /// 252 Cannot verify user, will attempt delivery
    pub const CANNOT_VERIFY: Self = Self(252);
    /// 334 Continue with authentication
    pub const AUTH_CONTINUE: Self = Self(334);
    /// 354 Start mail input
    pub const START_DATA: Self = Self(354);
    /// 421 Service not available, closing transmission channel
    pub const SERVICE_UNAVAILABLE: Self = Self(421);
    /// 450 Mailbox unavailable (busy)
    pub const MAILBOX_BUSY: Self = Self(450);
    /// 451 Local error in processing
    pub const LOCAL_ERROR: Self = Self(451);
    /// 452 Insufficient system storage
    pub const INSUFFICIENT_STORAGE: Self = Self(452);
    /// 454 TLS not available
    pub const TLS_UNAVAILABLE: Self = Self(454);
    /// 500 Syntax error, command unrecognized
    pub const SYNTAX_ERROR: Self = Self(500);
    /// 501 Syntax error in parameters or arguments
    pub const PARAMETER_ERROR: Self = Self(501);
    /// 502 Command not implemented
    pub const NOT_IMPLEMENTED: Self = Self(502);
    /// 503 Bad sequence of commands
    pub const BAD_SEQUENCE: Self = Self(503);
    /// 504 Command parameter not implemented
    pub const PARAMETER_NOT_IMPLEMENTED: Self = Self(504);
    /// 535 Authentication credentials invalid
    pub const AUTH_FAILED: Self = Self(535);
    /// 550 Mailbox unavailable (not found, access denied)
    pub const MAILBOX_UNAVAILABLE: Self = Self(550);
    /// 551 User not local
    pub const USER_NOT_LOCAL: Self = Self(551);
    /// 552 Exceeded storage allocation
    pub const EXCEEDED_STORAGE: Self = Self(552);
    /// 553 Mailbox name not allowed
    pub const MAILBOX_NAME_INVALID: Self = Self(553);
    /// 554 Transaction failed
    pub const TRANSACTION_FAILED: Self = Self(554);
}
