//! Flag submission protocol: framing and response formatting.
//!
//! Implements the line-oriented submission protocol:
//! - Server greeting: banner (no blank line inside) terminated by `\n\n`
//! - Requests: one flag per line, `\n` terminated (`\r\n` tolerated)
//! - Responses: `<flag> <CODE> <message>\n`, possibly out of order
//!
//! Instead of a banner the server may send a single error message and
//! close the connection.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Alphabet of the flag body after the prefix
fn is_flag_body_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'/' || b == b'+'
}

/// Accepted flag shape: a fixed prefix followed by a base64 body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagFormat {
    prefix: String,
    body_length: usize,
}

impl FlagFormat {
    pub fn new(prefix: impl Into<String>, body_length: usize) -> Self {
        Self {
            prefix: prefix.into(),
            body_length,
        }
    }

    /// Check a submitted flag without consulting any state.
    pub fn matches(&self, flag: &[u8]) -> bool {
        let Some(body) = flag.strip_prefix(self.prefix.as_bytes()) else {
            return false;
        };
        body.len() == self.body_length && body.iter().copied().all(is_flag_body_byte)
    }
}

impl Default for FlagFormat {
    fn default() -> Self {
        Self::new("FLAG_", 32)
    }
}

/// Classification result sent back for a submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    /// Accepted
    Ok,
    /// Already submitted by this team
    Dup,
    /// Flag belongs to the submitting team
    Own,
    /// Flag expired
    Old,
    /// Not a flag
    Inv,
    /// Temporary server error, retry later
    Err,
    /// Any other uppercase code
    Other(String),
}

impl ResponseCode {
    pub fn as_str(&self) -> &str {
        match self {
            ResponseCode::Ok => "OK",
            ResponseCode::Dup => "DUP",
            ResponseCode::Own => "OWN",
            ResponseCode::Old => "OLD",
            ResponseCode::Inv => "INV",
            ResponseCode::Err => "ERR",
            ResponseCode::Other(code) => code,
        }
    }

    /// Human-readable text sent after the code.
    pub fn message(&self) -> &'static str {
        match self {
            ResponseCode::Ok => "Accepted",
            ResponseCode::Dup => "Already submitted",
            ResponseCode::Own => "This is your own flag",
            ResponseCode::Old => "Flag has expired",
            ResponseCode::Inv => "Invalid flag",
            ResponseCode::Err => "Internal error, try again later",
            ResponseCode::Other(_) => "",
        }
    }

    /// Parse a code field. Anything made of uppercase ASCII letters is valid.
    #[allow(dead_code)]
    pub fn parse(code: &str) -> Option<Self> {
        if code.is_empty() || !code.bytes().all(|b| b.is_ascii_uppercase()) {
            return None;
        }

        Some(match code {
            "OK" => ResponseCode::Ok,
            "DUP" => ResponseCode::Dup,
            "OWN" => ResponseCode::Own,
            "OLD" => ResponseCode::Old,
            "INV" => ResponseCode::Inv,
            "ERR" => ResponseCode::Err,
            other => ResponseCode::Other(other.to_string()),
        })
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of pulling a line out of the receive buffer
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// A complete line without its terminator
    Line(Bytes),
    /// No newline buffered yet
    Incomplete,
    /// More than the allowed bytes arrived without a newline
    TooLong,
}

/// Take the next `\n`-terminated line from `buffer`.
///
/// One trailing `\r` is stripped. Consumed bytes are removed from the
/// buffer; an incomplete tail stays buffered.
pub fn next_line(buffer: &mut BytesMut, max_length: usize) -> Frame {
    let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
        // A trailing \r may still turn out to be part of the terminator
        let pending_cr = usize::from(buffer.last() == Some(&b'\r'));
        return if buffer.len() > max_length + pending_cr {
            Frame::TooLong
        } else {
            Frame::Incomplete
        };
    };

    let content = if pos > 0 && buffer[pos - 1] == b'\r' {
        pos - 1
    } else {
        pos
    };
    if content > max_length {
        return Frame::TooLong;
    }

    let mut line = buffer.split_to(pos + 1);
    line.truncate(content);

    Frame::Line(line.freeze())
}

/// Whether a banner can be sent as-is before the `\n\n` terminator.
pub fn is_valid_banner(banner: &str) -> bool {
    !banner.contains("\n\n") && !banner.ends_with('\n')
}

/// Response builders
pub struct Response;

impl Response {
    /// Banner followed by the blank-line terminator.
    pub fn banner(banner: &str) -> Bytes {
        let mut buf = BytesMut::with_capacity(banner.len() + 2);
        buf.put_slice(banner.as_bytes());
        buf.put_slice(b"\n\n");
        buf.freeze()
    }

    /// Error line sent instead of the banner.
    pub fn error_message(message: &str) -> Bytes {
        let mut buf = BytesMut::with_capacity(message.len() + 1);
        buf.put_slice(message.as_bytes());
        buf.put_u8(b'\n');
        buf.freeze()
    }

    /// `<flag> <CODE> <message>\n`
    pub fn line(flag: &[u8], code: &ResponseCode) -> BytesMut {
        let message = code.message();
        let code = code.as_str();

        let mut buf = BytesMut::with_capacity(flag.len() + code.len() + message.len() + 3);
        buf.put_slice(flag);
        buf.put_u8(b' ');
        buf.put_slice(code.as_bytes());
        if !message.is_empty() {
            buf.put_u8(b' ');
            buf.put_slice(message.as_bytes());
        }
        buf.put_u8(b'\n');
        buf
    }
}

/// A response line as seen by a client.
#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub flag: Vec<u8>,
    pub code: ResponseCode,
    pub message: Vec<u8>,
}

#[allow(dead_code)]
impl ResponseLine {
    /// Parse one response line (with or without the trailing newline).
    ///
    /// Fields are separated by one or more spaces or tabs.
    pub fn parse(line: &[u8]) -> Option<Self> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let is_sep = |b: &u8| *b == b' ' || *b == b'\t';

        let flag_end = line.iter().position(is_sep)?;
        let flag = &line[..flag_end];
        let rest = skip_separators(&line[flag_end..]);

        let code_end = rest.iter().position(is_sep).unwrap_or(rest.len());
        let code = std::str::from_utf8(&rest[..code_end]).ok()?;
        let code = ResponseCode::parse(code)?;
        let message = skip_separators(&rest[code_end..]);

        Some(Self {
            flag: flag.to_vec(),
            code,
            message: message.to_vec(),
        })
    }
}

fn skip_separators(input: &[u8]) -> &[u8] {
    let start = input
        .iter()
        .position(|b| *b != b' ' && *b != b'\t')
        .unwrap_or(input.len());
    &input[start..]
}
