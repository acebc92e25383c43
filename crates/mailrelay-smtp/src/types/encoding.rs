//! Message body transfer encodings (`BODY=` parameter).

/// Body transfer encoding requested by the `BODY=` parameter of `MAIL FROM`
/// (RFC 6152, RFC 3030).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BodyEncoding {
    /// `7BIT`: US-ASCII lines of at most 1000 octets. The default.
    #[default]
    SevenBit,
    /// `8BITMIME`: octets above 127 permitted, still line oriented.
    EightBitMime,
    /// `BINARYMIME`: arbitrary octets, only transferable with `BDAT`.
    BinaryMime,
}

impl BodyEncoding {
    /// Parses a `BODY=` parameter value, ignoring case.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("7BIT") {
            Some(Self::SevenBit)
        } else if value.eq_ignore_ascii_case("8BITMIME") {
            Some(Self::EightBitMime)
        } else if value.eq_ignore_ascii_case("BINARYMIME") {
            Some(Self::BinaryMime)
        } else {
            None
        }
    }

    /// Returns the parameter value as sent on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SevenBit => "7BIT",
            Self::EightBitMime => "8BITMIME",
            Self::BinaryMime => "BINARYMIME",
        }
    }
}

impl std::fmt::Display for BodyEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
