//! Envelope address types.

use crate::error::{Error, Result};

/// Mailbox address as it appears between angle brackets in `MAIL FROM`,
/// `RCPT TO` or the `AUTH=` parameter.
///
/// Only the envelope syntax is checked: the address must be non-empty,
/// free of whitespace, control characters and angle brackets, and if it
/// carries a domain part neither side of the last `@` may be empty.
/// `postmaster` without a domain is therefore accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(String);

impl Address {
    /// Creates a new address from a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid.
    pub fn new(addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        Self::validate(&addr)?;
        Ok(Self(addr))
    }

    /// Returns the address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the domain part, if any.
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        self.0.rsplit_once('@').map(|(_, domain)| domain)
    }

    fn validate(addr: &str) -> Result<()> {
        if addr.is_empty() {
            return Err(Error::InvalidAddress("Address cannot be empty".into()));
        }

        if let Some(c) = addr
            .chars()
            .find(|c| c.is_whitespace() || c.is_control() || *c == '<' || *c == '>')
        {
            return Err(Error::InvalidAddress(format!(
                "Address contains forbidden character {c:?}"
            )));
        }

        if let Some((local, domain)) = addr.rsplit_once('@') {
            if local.is_empty() || domain.is_empty() {
                return Err(Error::InvalidAddress(
                    "Local and domain parts cannot be empty".into(),
                ));
            }
        }

        Ok(())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Reverse path of a mail transaction: a sender mailbox, or the null path
/// `<>` used for bounces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ReversePath {
    /// The null reverse path `<>`.
    #[default]
    Null,
    /// A sender mailbox.
    Mailbox(Address),
}

impl ReversePath {
    /// Returns the mailbox, if the path is not null.
    #[must_use]
    pub const fn mailbox(&self) -> Option<&Address> {
        match self {
            Self::Null => None,
            Self::Mailbox(address) => Some(address),
        }
    }

    /// Returns true for the null path.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<Address> for ReversePath {
    fn from(address: Address) -> Self {
        Self::Mailbox(address)
    }
}

impl std::fmt::Display for ReversePath {
    /// Formats the path in its bracketed wire form.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("<>"),
            Self::Mailbox(address) => write!(f, "<{address}>"),
        }
    }
}
