//! SMTP service extensions advertised in the EHLO reply.

use std::collections::BTreeMap;

use super::Reply;

/// Well-known SMTP service extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Extension {
    /// STARTTLS - TLS upgrade
    StartTls,
    /// AUTH - Authentication
    Auth(Vec<AuthMechanism>),
    /// SIZE - Maximum message size
    Size(Option<u64>),
    /// 8BITMIME - 8-bit MIME transport
    EightBitMime,
    /// PIPELINING - Command pipelining
    Pipelining,
    /// CHUNKING - Chunked message transfer (BDAT)
    Chunking,
    /// SMTPUTF8 - UTF-8 email addresses
    SmtpUtf8,
    /// DSN - Delivery status notifications
    Dsn,
    /// BINARYMIME - Binary MIME
    BinaryMime,
    /// Unknown extension keyword (upper-cased) with its raw parameters.
    Unknown(String),
}

impl Extension {
    /// Parses an extension line from the EHLO reply.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Self::Unknown(line.to_string());
        };

        let keyword = first.to_ascii_uppercase();
        match keyword.as_str() {
            "STARTTLS" => Self::StartTls,
            "AUTH" => {
                let mechanisms = parts[1..]
                    .iter()
                    .filter_map(|m| AuthMechanism::parse(m))
                    .collect();
                Self::Auth(mechanisms)
            }
            "SIZE" => Self::Size(parts.get(1).and_then(|s| s.parse().ok())),
            "8BITMIME" => Self::EightBitMime,
            "PIPELINING" => Self::Pipelining,
            "CHUNKING" => Self::Chunking,
            "SMTPUTF8" => Self::SmtpUtf8,
            "DSN" => Self::Dsn,
            "BINARYMIME" => Self::BinaryMime,
            _ => Self::Unknown(line.to_string()),
        }
    }

    /// Returns the extension keyword.
    #[must_use]
    pub fn keyword(&self) -> &str {
        match self {
            Self::StartTls => "STARTTLS",
            Self::Auth(_) => "AUTH",
            Self::Size(_) => "SIZE",
            Self::EightBitMime => "8BITMIME",
            Self::Pipelining => "PIPELINING",
            Self::Chunking => "CHUNKING",
            Self::SmtpUtf8 => "SMTPUTF8",
            Self::Dsn => "DSN",
            Self::BinaryMime => "BINARYMIME",
            Self::Unknown(line) => line.split_whitespace().next().unwrap_or(line),
        }
    }

    /// Renders the extension as an EHLO reply line.
    #[must_use]
    pub fn to_line(&self) -> String {
        match self {
            Self::Auth(mechanisms) => {
                let mut line = String::from("AUTH");
                for mechanism in mechanisms {
                    line.push(' ');
                    line.push_str(mechanism.as_str());
                }
                line
            }
            Self::Size(Some(size)) => format!("SIZE {size}"),
            Self::Unknown(line) => line.clone(),
            other => other.keyword().to_string(),
        }
    }
}

/// Set of extensions advertised by a server, keyed by case-insensitive
/// keyword.
///
/// Discovered once per connection from the hello reply and read-only
/// afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionSet {
    entries: BTreeMap<String, Extension>,
}

impl ExtensionSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the set from an EHLO reply. The first line is the server
    /// greeting and carries no extension.
    #[must_use]
    pub fn from_hello_reply(reply: &Reply) -> Self {
        reply
            .lines
            .iter()
            .skip(1)
            .filter(|line| !line.trim().is_empty())
            .map(|line| Extension::parse(line))
            .collect()
    }

    /// Adds an extension, replacing any previous one with the same keyword.
    pub fn insert(&mut self, extension: Extension) {
        self.entries
            .insert(extension.keyword().to_ascii_uppercase(), extension);
    }

    /// Checks for a keyword, ignoring case.
    #[must_use]
    pub fn contains(&self, keyword: &str) -> bool {
        self.entries.contains_key(&keyword.to_ascii_uppercase())
    }

    /// Checks for a well-known extension by keyword (parameters are ignored).
    #[must_use]
    pub fn supports(&self, extension: &Extension) -> bool {
        self.contains(extension.keyword())
    }

    /// Returns the extension registered under a keyword.
    #[must_use]
    pub fn get(&self, keyword: &str) -> Option<&Extension> {
        self.entries.get(&keyword.to_ascii_uppercase())
    }

    /// Returns the maximum message size, if advertised with a value.
    #[must_use]
    pub fn max_message_size(&self) -> Option<u64> {
        match self.get("SIZE") {
            Some(Extension::Size(size)) => *size,
            _ => None,
        }
    }

    /// Returns the advertised authentication mechanisms.
    #[must_use]
    pub fn auth_mechanisms(&self) -> &[AuthMechanism] {
        match self.get("AUTH") {
            Some(Extension::Auth(mechanisms)) => mechanisms,
            _ => &[],
        }
    }

    /// Iterates over the extensions in keyword order.
    pub fn iter(&self) -> impl Iterator<Item = &Extension> {
        self.entries.values()
    }

    /// Number of extensions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no extension was advertised.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<Extension> for ExtensionSet {
    fn from_iter<I: IntoIterator<Item = Extension>>(iter: I) -> Self {
        let mut set = Self::new();
        for extension in iter {
            set.insert(extension);
        }
        set
    }
}

/// SASL authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMechanism {
    /// PLAIN - plaintext authentication
    Plain,
    /// LOGIN - legacy plaintext
    Login,
    /// CRAM-MD5 - challenge-response
    CramMd5,
    /// `XOAUTH2` - `OAuth2` (Google/Microsoft)
    XOAuth2,
    /// `OAUTHBEARER` - RFC 7628 `OAuth2`
    OAuthBearer,
}

impl AuthMechanism {
    /// Parses an authentication mechanism name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            "CRAM-MD5" => Some(Self::CramMd5),
            "XOAUTH2" => Some(Self::XOAuth2),
            "OAUTHBEARER" => Some(Self::OAuthBearer),
            _ => None,
        }
    }

    /// Returns the mechanism name as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::CramMd5 => "CRAM-MD5",
            Self::XOAuth2 => "XOAUTH2",
            Self::OAuthBearer => "OAUTHBEARER",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::ReplyCode;

    mod extension_parse_tests {
        use super::*;

        #[test]
        fn parse_starttls_lowercase() {
            assert_eq!(Extension::parse("starttls"), Extension::StartTls);
        }

        #[test]
        fn parse_auth_mechanisms() {
            let ext = Extension::parse("AUTH PLAIN LOGIN XOAUTH2");
            let Extension::Auth(mechs) = ext else {
                panic!("Expected Auth variant");
            };
            assert_eq!(
                mechs,
                vec![
                    AuthMechanism::Plain,
                    AuthMechanism::Login,
                    AuthMechanism::XOAuth2
                ]
            );
        }

        #[test]
        fn parse_size() {
            assert_eq!(
                Extension::parse("SIZE 52428800"),
                Extension::Size(Some(52_428_800))
            );
            assert_eq!(Extension::parse("SIZE"), Extension::Size(None));
        }

        #[test]
        fn parse_unknown_keeps_line() {
            let ext = Extension::parse("X-CUSTOM arg");
            assert_eq!(ext, Extension::Unknown("X-CUSTOM arg".into()));
            assert_eq!(ext.keyword(), "X-CUSTOM");
        }

        #[test]
        fn to_line() {
            assert_eq!(
                Extension::Auth(vec![AuthMechanism::Plain, AuthMechanism::Login]).to_line(),
                "AUTH PLAIN LOGIN"
            );
            assert_eq!(Extension::Size(Some(1000)).to_line(), "SIZE 1000");
            assert_eq!(Extension::Size(None).to_line(), "SIZE");
            assert_eq!(Extension::Chunking.to_line(), "CHUNKING");
        }
    }

    mod extension_set_tests {
        use super::*;

        fn hello() -> Reply {
            Reply::new(
                ReplyCode::OK,
                vec![
                    "mx.example.com greets you".into(),
                    "PIPELINING".into(),
                    "chunking".into(),
                    "SIZE 1000".into(),
                    "AUTH PLAIN".into(),
                    "X-FOO".into(),
                ],
            )
        }

        #[test]
        fn from_hello_reply_skips_greeting() {
            let set = ExtensionSet::from_hello_reply(&hello());
            assert_eq!(set.len(), 5);
            assert!(!set.contains("MX.EXAMPLE.COM"));
        }

        #[test]
        fn lookup_is_case_insensitive() {
            let set = ExtensionSet::from_hello_reply(&hello());
            assert!(set.contains("Chunking"));
            assert!(set.contains("x-foo"));
            assert!(set.supports(&Extension::Pipelining));
            assert!(!set.supports(&Extension::StartTls));
        }

        #[test]
        fn typed_accessors() {
            let set = ExtensionSet::from_hello_reply(&hello());
            assert_eq!(set.max_message_size(), Some(1000));
            assert_eq!(set.auth_mechanisms(), &[AuthMechanism::Plain]);
            assert!(ExtensionSet::new().auth_mechanisms().is_empty());
        }
    }

    mod auth_mechanism_tests {
        use super::*;

        #[test]
        fn parse_plain() {
            assert_eq!(AuthMechanism::parse("plain"), Some(AuthMechanism::Plain));
            assert_eq!(
                AuthMechanism::parse("CRAM-MD5"),
                Some(AuthMechanism::CramMd5)
            );
            assert_eq!(AuthMechanism::parse("UNKNOWN"), None);
        }

        #[test]
        fn as_str() {
            assert_eq!(AuthMechanism::OAuthBearer.as_str(), "OAUTHBEARER");
        }
    }
}
