//! Command line parser.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use super::{Command, CommandKind, ExpectedInput};
use crate::error::{Error, Result};
use crate::types::{Address, BodyEncoding, ReversePath};

type Parsed = std::result::Result<Command, String>;

impl Command {
    /// Parses one CRLF-terminated line.
    ///
    /// `expected` selects between an ordinary command and a SASL response
    /// line. Unknown verbs yield [`Command::Unknown`] and syntax errors in a
    /// known verb yield [`Command::Invalid`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] if the line does not end with CRLF.
    pub fn parse(raw: &[u8], expected: ExpectedInput) -> Result<Self> {
        let Some(line) = raw.strip_suffix(b"\r\n") else {
            return Err(Error::Format("command line is not CRLF terminated".into()));
        };

        let Ok(line) = std::str::from_utf8(line) else {
            let line = String::from_utf8_lossy(line).into_owned();
            return Ok(match expected {
                ExpectedInput::Command => Self::Unknown { line },
                ExpectedInput::SaslResponse => Self::Invalid {
                    kind: CommandKind::SaslResponse,
                    line,
                    reason: "response is not base64".into(),
                },
            });
        };

        Ok(match expected {
            ExpectedInput::Command => parse_command(line),
            ExpectedInput::SaslResponse => parse_sasl_response(line),
        })
    }
}

fn parse_sasl_response(line: &str) -> Command {
    let valid = line == "*"
        || line
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='));
    if valid {
        Command::SaslResponse {
            response: line.to_string(),
        }
    } else {
        invalid(CommandKind::SaslResponse, line, "response is not base64".into())
    }
}

fn parse_command(line: &str) -> Command {
    let (verb, rest) = match line.split_once(' ') {
        Some((verb, rest)) => (verb, Some(rest)),
        None => (line, None),
    };

    let kind = match verb.to_ascii_uppercase().as_str() {
        "HELO" => CommandKind::Helo,
        "EHLO" => CommandKind::Ehlo,
        "MAIL" => CommandKind::MailFrom,
        "RCPT" => CommandKind::RcptTo,
        "DATA" => return Command::Data,
        "BDAT" => CommandKind::Bdat,
        "RSET" => return Command::Rset,
        "NOOP" => return Command::Noop,
        "QUIT" => return Command::Quit,
        "VRFY" => CommandKind::Vrfy,
        "STARTTLS" => return Command::StartTls,
        "AUTH" => CommandKind::Auth,
        _ => {
            return Command::Unknown {
                line: line.to_string(),
            };
        }
    };

    let parsed = match kind {
        CommandKind::Helo => required(rest, "domain").map(|domain| Command::Helo { domain }),
        CommandKind::Ehlo => required(rest, "domain").map(|domain| Command::Ehlo { domain }),
        CommandKind::Vrfy => required(rest, "argument").map(|argument| Command::Vrfy { argument }),
        CommandKind::MailFrom => parse_mail_from(rest),
        CommandKind::RcptTo => parse_rcpt_to(rest),
        CommandKind::Bdat => parse_bdat(rest),
        _ => parse_auth(rest),
    };
    parsed.unwrap_or_else(|reason| invalid(kind, line, reason))
}

fn invalid(kind: CommandKind, line: &str, reason: String) -> Command {
    Command::Invalid {
        kind,
        line: line.to_string(),
        reason,
    }
}

fn required(rest: Option<&str>, what: &str) -> std::result::Result<String, String> {
    match rest {
        Some(rest) if !rest.is_empty() => Ok(rest.to_string()),
        _ => Err(format!("{what} required")),
    }
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &text[prefix.len()..])
}

/// Splits `<path>` off the front of `text`, returning the inner text and
/// what follows the closing bracket.
fn take_path(text: &str) -> std::result::Result<(&str, &str), String> {
    let inner = text
        .strip_prefix('<')
        .ok_or_else(|| "path must start with '<'".to_string())?;
    let close = inner
        .find('>')
        .ok_or_else(|| "path must end with '>'".to_string())?;
    Ok((&inner[..close], &inner[close + 1..]))
}

fn parse_reverse_path(inner: &str) -> std::result::Result<ReversePath, String> {
    if inner.is_empty() {
        Ok(ReversePath::Null)
    } else {
        Address::new(inner)
            .map(ReversePath::Mailbox)
            .map_err(|e| e.to_string())
    }
}

fn parse_mail_from(rest: Option<&str>) -> Parsed {
    let rest = rest
        .and_then(|rest| strip_prefix_ignore_case(rest, "FROM:"))
        .ok_or_else(|| "expected FROM:<reverse-path>".to_string())?;
    let (inner, params) = take_path(rest)?;
    let reverse_path = parse_reverse_path(inner)?;

    if !params.is_empty() && !params.starts_with(' ') {
        return Err("parameters must be separated by a space".into());
    }

    let mut body = None;
    let mut auth = None;
    for param in params.split(' ').filter(|p| !p.is_empty()) {
        let (key, value) = param
            .split_once('=')
            .ok_or_else(|| format!("malformed parameter {param:?}"))?;
        if key.eq_ignore_ascii_case("BODY") {
            if body.is_some() {
                return Err("duplicate BODY parameter".into());
            }
            body = Some(
                BodyEncoding::parse(value)
                    .ok_or_else(|| format!("unsupported BODY value {value:?}"))?,
            );
        } else if key.eq_ignore_ascii_case("AUTH") {
            if auth.is_some() {
                return Err("duplicate AUTH parameter".into());
            }
            let (inner, trailing) = take_path(value)?;
            if !trailing.is_empty() {
                return Err(format!("malformed AUTH value {value:?}"));
            }
            auth = Some(parse_reverse_path(inner)?);
        } else {
            return Err(format!("unsupported parameter {key:?}"));
        }
    }

    Ok(Command::MailFrom {
        reverse_path,
        body,
        auth,
    })
}

fn parse_rcpt_to(rest: Option<&str>) -> Parsed {
    let rest = rest
        .and_then(|rest| strip_prefix_ignore_case(rest, "TO:"))
        .ok_or_else(|| "expected TO:<forward-path>".to_string())?;
    let (inner, trailing) = take_path(rest)?;
    if inner.is_empty() {
        return Err("recipient address required".into());
    }
    if !trailing.trim_matches(' ').is_empty() {
        return Err(format!("unexpected parameters {:?}", trailing.trim()));
    }
    let forward_path = Address::new(inner).map_err(|e| e.to_string())?;
    Ok(Command::RcptTo { forward_path })
}

fn parse_bdat(rest: Option<&str>) -> Parsed {
    let rest = rest.ok_or_else(|| "chunk size required".to_string())?;
    let (size, tail) = match rest.split_once(' ') {
        Some((size, tail)) => (size, Some(tail)),
        None => (rest, None),
    };
    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid chunk size {size:?}"));
    }
    let size = size
        .parse::<u64>()
        .map_err(|_| format!("chunk size {size} out of range"))?;
    let last = match tail {
        None => false,
        Some(tail) if tail.eq_ignore_ascii_case("LAST") => true,
        Some(tail) => return Err(format!("unexpected text {tail:?} after chunk size")),
    };
    Ok(Command::Bdat { size, last })
}

fn parse_auth(rest: Option<&str>) -> Parsed {
    let rest = rest
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| "mechanism required".to_string())?;
    let (mechanism, response) = match rest.split_once(' ') {
        Some((mechanism, response)) => (mechanism, Some(response)),
        None => (rest, None),
    };
    if mechanism.is_empty()
        || !mechanism
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_'))
    {
        return Err(format!("invalid mechanism {mechanism:?}"));
    }
    let initial_response = match response {
        None => None,
        Some("=") => Some(Vec::new()),
        Some("") => return Err("empty initial response must be sent as '='".into()),
        Some(encoded) => Some(
            STANDARD
                .decode(encoded)
                .map_err(|e| format!("initial response is not base64: {e}"))?,
        ),
    };
    Ok(Command::Auth {
        mechanism: mechanism.to_string(),
        initial_response,
    })
}
