//! Command serializer.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{BufMut, Bytes, BytesMut};

use super::Command;

impl Command {
    /// Serializes the command to its wire form.
    ///
    /// Every command except [`Command::DataBlock`] is terminated with CRLF.
    /// A data block is emitted exactly as held.
    #[must_use]
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);

        match self {
            Self::Data => return Bytes::from_static(b"DATA\r\n"),
            Self::Rset => return Bytes::from_static(b"RSET\r\n"),
            Self::Noop => return Bytes::from_static(b"NOOP\r\n"),
            Self::Quit => return Bytes::from_static(b"QUIT\r\n"),
            Self::StartTls => return Bytes::from_static(b"STARTTLS\r\n"),
            Self::DataBlock(data) => return data.clone(),
            Self::Helo { domain } => {
                buf.extend_from_slice(b"HELO ");
                buf.extend_from_slice(domain.as_bytes());
            }
            Self::Ehlo { domain } => {
                buf.extend_from_slice(b"EHLO ");
                buf.extend_from_slice(domain.as_bytes());
            }
            Self::MailFrom {
                reverse_path,
                body,
                auth,
            } => {
                buf.extend_from_slice(b"MAIL FROM:");
                buf.extend_from_slice(reverse_path.to_string().as_bytes());
                if let Some(body) = body {
                    buf.extend_from_slice(b" BODY=");
                    buf.extend_from_slice(body.as_str().as_bytes());
                }
                if let Some(auth) = auth {
                    buf.extend_from_slice(b" AUTH=");
                    buf.extend_from_slice(auth.to_string().as_bytes());
                }
            }
            Self::RcptTo { forward_path } => {
                buf.extend_from_slice(b"RCPT TO:<");
                buf.extend_from_slice(forward_path.as_str().as_bytes());
                buf.put_u8(b'>');
            }
            Self::Bdat { size, last } => {
                buf.extend_from_slice(format!("BDAT {size}").as_bytes());
                if *last {
                    buf.extend_from_slice(b" LAST");
                }
            }
            Self::Vrfy { argument } => {
                buf.extend_from_slice(b"VRFY ");
                buf.extend_from_slice(argument.as_bytes());
            }
            Self::Auth {
                mechanism,
                initial_response,
            } => {
                buf.extend_from_slice(b"AUTH ");
                buf.extend_from_slice(mechanism.as_bytes());
                match initial_response {
                    None => {}
                    Some(response) if response.is_empty() => buf.extend_from_slice(b" ="),
                    Some(response) => {
                        buf.put_u8(b' ');
                        buf.extend_from_slice(STANDARD.encode(response).as_bytes());
                    }
                }
            }
            Self::SaslResponse { response } => {
                buf.extend_from_slice(response.as_bytes());
            }
            Self::Invalid { line, .. } | Self::Unknown { line } => {
                buf.extend_from_slice(line.as_bytes());
            }
        }

        buf.extend_from_slice(b"\r\n");
        buf.freeze()
    }
}
