//! SMTP reply parser.
//!
//! Sans-I/O: the parser works on a [`BytesMut`] buffer filled by the
//! transport and consumes exactly one logical reply from its front.

use bytes::{Buf, BytesMut};

use crate::error::{Error, Result};
use crate::types::{Reply, ReplyCode};

/// Maximum length of one reply line including CRLF (RFC 5321 4.5.3.1.5).
pub const MAX_REPLY_LINE_LENGTH: usize = 512;

/// Parses one reply from the front of `buf`.
///
/// SMTP replies can be single-line or multi-line:
/// - Single: `250 OK\r\n`
/// - Multi: `250-First line\r\n250-Second line\r\n250 Last line\r\n`
///
/// Returns `Ok(None)` when the buffer does not yet hold the final line; the
/// buffer is left untouched in that case. On success the reply's bytes are
/// removed from the buffer and anything after them is preserved.
///
/// # Errors
///
/// Returns [`Error::Format`] when a line exceeds [`MAX_REPLY_LINE_LENGTH`]
/// without a terminator, the code is not three digits in 100..=599, the
/// fourth character is neither space nor hyphen, a continuation line carries
/// a different code, or a byte falls outside printable 7-bit ASCII.
pub fn parse_reply(buf: &mut BytesMut) -> Result<Option<Reply>> {
    let mut pos = 0;
    let mut code: Option<ReplyCode> = None;
    let mut lines = Vec::new();

    loop {
        let Some(end) = find_crlf(&buf[pos..]) else {
            if buf.len() - pos > MAX_REPLY_LINE_LENGTH {
                return Err(Error::Format(format!(
                    "no line terminator within {MAX_REPLY_LINE_LENGTH} bytes"
                )));
            }
            return Ok(None);
        };
        if end + 2 > MAX_REPLY_LINE_LENGTH {
            return Err(Error::Format(format!(
                "reply line of {} bytes exceeds {MAX_REPLY_LINE_LENGTH}",
                end + 2
            )));
        }

        let line = &buf[pos..pos + end];
        let (line_code, is_last, text) = parse_line(line)?;
        match code {
            None => code = Some(line_code),
            Some(first) if first != line_code => {
                return Err(Error::Format(format!(
                    "continuation code {line_code} does not match {first}"
                )));
            }
            Some(_) => {}
        }
        lines.push(text);
        pos += end + 2;

        if is_last {
            buf.advance(pos);
            let code = code.unwrap_or(ReplyCode::new(0));
            return Ok(Some(Reply::new(code, lines)));
        }
    }
}

fn parse_line(line: &[u8]) -> Result<(ReplyCode, bool, String)> {
    if let Some(&byte) = line.iter().find(|&&b| !(0x20..=0x7e).contains(&b)) {
        return Err(Error::Format(format!(
            "reply contains non-printable byte 0x{byte:02x}"
        )));
    }
    if line.len() < 3 || !line[..3].iter().all(u8::is_ascii_digit) {
        return Err(Error::Format(format!(
            "malformed reply code in {:?}",
            String::from_utf8_lossy(line)
        )));
    }

    let value = line[..3]
        .iter()
        .fold(0u16, |acc, digit| acc * 10 + u16::from(digit - b'0'));
    let code = ReplyCode::try_new(value)
        .ok_or_else(|| Error::Format(format!("reply code {value} out of range")))?;

    let is_last = match line.get(3) {
        None | Some(b' ') => true,
        Some(b'-') => false,
        Some(&other) => {
            return Err(Error::Format(format!(
                "invalid separator {:?} after reply code",
                char::from(other)
            )));
        }
    };
    let text = line
        .get(4..)
        .map(|text| String::from_utf8_lossy(text).into_owned())
        .unwrap_or_default();

    Ok((code, is_last, text))
}

/// Finds the position of CRLF in a buffer.
pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
