//! Dot-stuffing encoder for bodies sent after `DATA` (RFC 5321 4.5.2).

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Nothing written yet.
    BodyStart,
    /// At the start of a line, after CRLF.
    LineStart,
    /// Inside a line.
    Normal,
    /// Inside a line, after CR.
    SawCr,
    /// A `.` at line start, held back.
    Dot,
    /// `.` CR at line start, held back.
    DotCr,
    /// A complete `.` CRLF line, held back. Only valid at the end of the body.
    Terminated,
}

/// Streaming dot-stuffer.
///
/// A leading `.` on every line is doubled. A body that already ends with the
/// `CRLF.CRLF` terminator keeps it as the terminator; a bare `.` line
/// anywhere else means the source is broken and is reported as
/// [`Error::Protocol`].
#[derive(Debug, Clone)]
pub struct DotStuffer {
    state: State,
}

impl Default for DotStuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl DotStuffer {
    /// Creates a stuffer positioned at the start of a body.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: State::BodyStart,
        }
    }

    /// Encodes one chunk of body into `out`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] when the chunk continues past an
    /// unescaped end-of-data line.
    pub fn process(&mut self, chunk: &[u8], out: &mut BytesMut) -> Result<()> {
        out.reserve(chunk.len() + 8);
        for &byte in chunk {
            self.state = match self.state {
                State::Terminated => {
                    return Err(Error::Protocol(
                        "body contains the end-of-data sequence before its end".into(),
                    ));
                }
                State::BodyStart if byte == b'.' => {
                    out.extend_from_slice(b"..");
                    State::Normal
                }
                State::LineStart if byte == b'.' => State::Dot,
                State::Dot if byte == b'\r' => State::DotCr,
                State::DotCr if byte == b'\n' => State::Terminated,
                State::Dot => {
                    out.extend_from_slice(b"..");
                    emit(out, byte)
                }
                State::DotCr => {
                    out.extend_from_slice(b"..\r");
                    emit(out, byte)
                }
                State::SawCr if byte == b'\n' => {
                    out.put_u8(byte);
                    State::LineStart
                }
                State::BodyStart | State::LineStart | State::Normal | State::SawCr => {
                    emit(out, byte)
                }
            };
        }
        Ok(())
    }

    /// Writes whatever is held back plus the end-of-data terminator and
    /// resets the stuffer.
    pub fn finish(&mut self, out: &mut BytesMut) {
        match self.state {
            State::BodyStart | State::LineStart | State::Terminated => {}
            State::Normal | State::SawCr => out.extend_from_slice(b"\r\n"),
            State::Dot => out.extend_from_slice(b"..\r\n"),
            State::DotCr => out.extend_from_slice(b"..\r\r\n"),
        }
        out.extend_from_slice(b".\r\n");
        self.state = State::BodyStart;
    }
}

fn emit(out: &mut BytesMut, byte: u8) -> State {
    out.put_u8(byte);
    if byte == b'\r' {
        State::SawCr
    } else {
        State::Normal
    }
}
