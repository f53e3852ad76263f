//! Delayed-echo wire protocol.
//!
//! A CRLF-terminated text protocol multiplexed over one TCP connection.
//! Every frame carries a call id chosen by the client, so responses may be
//! written back in any order:
//!
//! ```text
//! client -> server   ECHO <id> <delay_ms> <name>\r\n
//! client -> server   CANCEL <id>\r\n
//! server -> client   OK <id> <message>\r\n
//! server -> client   ERROR <id> <code> <detail>\r\n
//! ```
//!
//! The name and message are the trailing field of their line and may
//! contain spaces. Id `0` is reserved for connection-level errors.

use bytes::{Buf, BytesMut};
use std::fmt;
use std::str;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Longest accepted line, excluding CRLF.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Id used for errors that are not attributable to a single call.
pub const CONNECTION_ID: u64 = 0;

/// A delayed-echo request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub name: String,
    /// Signed so that a negative delay reaches the server and is rejected there.
    pub delay_ms: i64,
}

impl Request {
    pub fn new(name: impl Into<String>, delay_ms: i64) -> Self {
        Request {
            name: name.into(),
            delay_ms,
        }
    }
}

/// A delayed-echo response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub message: String,
}

/// Failure category carried by an `ERROR` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    InvalidArgument,
    Cancelled,
    Unavailable,
    Internal,
    Unknown,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unknown => "UNKNOWN",
        }
    }

    /// Unrecognised codes map to `Unknown` rather than failing the frame.
    pub fn parse(code: &str) -> StatusCode {
        match code {
            "INVALID_ARGUMENT" => StatusCode::InvalidArgument,
            "CANCELLED" => StatusCode::Cancelled,
            "UNAVAILABLE" => StatusCode::Unavailable,
            "INTERNAL" => StatusCode::Internal,
            _ => StatusCode::Unknown,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol line, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Invoke the delayed echo
    Echo { id: u64, request: Request },

    /// Abandon an in-flight call
    Cancel { id: u64 },

    /// Successful reply
    Ok { id: u64, response: Response },

    /// Failed reply
    Error {
        id: u64,
        code: StatusCode,
        detail: String,
    },
}

impl Frame {
    /// Call id this frame belongs to.
    pub fn id(&self) -> u64 {
        match self {
            Frame::Echo { id, .. }
            | Frame::Cancel { id }
            | Frame::Ok { id, .. }
            | Frame::Error { id, .. } => *id,
        }
    }

    /// Length of the encoded line, excluding CRLF.
    pub fn line_len(&self) -> usize {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.len() - 2
    }

    /// Append the wire form of this frame to `dst`.
    ///
    /// CR and LF inside free-text fields are replaced by spaces so a frame
    /// always occupies exactly one line.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Frame::Echo { id, request } => {
                let line = format!("ECHO {} {} ", id, request.delay_ms);
                dst.extend_from_slice(line.as_bytes());
                put_text(dst, &request.name);
            }
            Frame::Cancel { id } => {
                let line = format!("CANCEL {}", id);
                dst.extend_from_slice(line.as_bytes());
            }
            Frame::Ok { id, response } => {
                let line = format!("OK {} ", id);
                dst.extend_from_slice(line.as_bytes());
                put_text(dst, &response.message);
            }
            Frame::Error { id, code, detail } => {
                let line = format!("ERROR {} {} ", id, code);
                dst.extend_from_slice(line.as_bytes());
                put_text(dst, detail);
            }
        }
        dst.extend_from_slice(b"\r\n");
    }
}

fn put_text(dst: &mut BytesMut, text: &str) {
    dst.extend(
        text.bytes()
            .map(|b| if b == b'\r' || b == b'\n' { b' ' } else { b }),
    );
}

/// Protocol parsing errors
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Line exceeds `MAX_LINE_LENGTH`
    LineTooLong,
    /// Line is not valid UTF-8
    InvalidUtf8,
    /// Invalid number format
    InvalidNumber(String),
    /// Required field missing
    MissingField(&'static str),
    /// Unknown command
    UnknownCommand(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::LineTooLong => write!(f, "line too long"),
            ParseError::InvalidUtf8 => write!(f, "line is not valid UTF-8"),
            ParseError::InvalidNumber(msg) => write!(f, "invalid number: {}", msg),
            ParseError::MissingField(field) => write!(f, "missing field: {}", field),
            ParseError::UnknownCommand(cmd) => write!(f, "unknown command: {}", cmd),
        }
    }
}

impl std::error::Error for ParseError {}

/// Result of parsing the front of a buffer
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed frame with bytes consumed.
    Complete(Frame, usize),
    /// Need more data.
    Incomplete,
    /// Malformed line; skip the given number of bytes to resynchronise.
    Invalid(ParseError, usize),
}

/// Parse one frame from the front of `input`.
pub fn parse(input: &[u8]) -> ParseResult {
    let line_end = match find_crlf(input) {
        Some(pos) => pos,
        None => return ParseResult::Incomplete,
    };
    let consumed = line_end + 2;

    if line_end > MAX_LINE_LENGTH {
        return ParseResult::Invalid(ParseError::LineTooLong, consumed);
    }

    let line = match str::from_utf8(&input[..line_end]) {
        Ok(line) => line,
        Err(_) => return ParseResult::Invalid(ParseError::InvalidUtf8, consumed),
    };

    match parse_line(line) {
        Ok(frame) => ParseResult::Complete(frame, consumed),
        Err(e) => ParseResult::Invalid(e, consumed),
    }
}

fn parse_line(line: &str) -> Result<Frame, ParseError> {
    let (command, rest) = split_field(line);

    match command {
        "ECHO" => {
            let (id, rest) = split_field(rest);
            let (delay, name) = split_field(rest);
            Ok(Frame::Echo {
                id: parse_id(id)?,
                request: Request {
                    name: name.to_string(),
                    delay_ms: parse_number(delay, "delay_ms")?,
                },
            })
        }
        "CANCEL" => {
            let (id, _) = split_field(rest);
            Ok(Frame::Cancel { id: parse_id(id)? })
        }
        "OK" => {
            let (id, message) = split_field(rest);
            Ok(Frame::Ok {
                id: parse_id(id)?,
                response: Response {
                    message: message.to_string(),
                },
            })
        }
        "ERROR" => {
            let (id, rest) = split_field(rest);
            let (code, detail) = split_field(rest);
            if code.is_empty() {
                return Err(ParseError::MissingField("code"));
            }
            Ok(Frame::Error {
                id: parse_id(id)?,
                code: StatusCode::parse(code),
                detail: detail.to_string(),
            })
        }
        "" => Err(ParseError::MissingField("command")),
        other => Err(ParseError::UnknownCommand(other.to_string())),
    }
}

/// Split off the first space-separated field. The remainder keeps any
/// further spaces intact.
fn split_field(s: &str) -> (&str, &str) {
    match s.split_once(' ') {
        Some((field, rest)) => (field, rest),
        None => (s, ""),
    }
}

fn parse_id(s: &str) -> Result<u64, ParseError> {
    parse_number(s, "id")
}

fn parse_number<T: str::FromStr>(s: &str, field: &'static str) -> Result<T, ParseError> {
    if s.is_empty() {
        return Err(ParseError::MissingField(field));
    }
    s.parse()
        .map_err(|_| ParseError::InvalidNumber(format!("{}={}", field, s)))
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}

/// Frame-at-a-time reader over one half of a connection.
///
/// A line longer than `MAX_LINE_LENGTH` is dropped as it streams in and
/// reported once as `LineTooLong` when its CRLF arrives, however the bytes
/// were split across reads.
pub(crate) struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    discarding: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        FrameReader {
            reader,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            discarding: false,
        }
    }

    /// Next frame or parse error. `None` on EOF.
    pub(crate) async fn next(&mut self) -> std::io::Result<Option<Result<Frame, ParseError>>> {
        loop {
            if self.discarding {
                match find_crlf(&self.buffer) {
                    Some(pos) => {
                        self.buffer.advance(pos + 2);
                        self.discarding = false;
                        return Ok(Some(Err(ParseError::LineTooLong)));
                    }
                    None => {
                        // Keep a trailing \r in case its \n is in the next read.
                        let keep = usize::from(self.buffer.last() == Some(&b'\r'));
                        let skip = self.buffer.len() - keep;
                        self.buffer.advance(skip);
                    }
                }
            } else {
                match parse(&self.buffer) {
                    ParseResult::Complete(frame, consumed) => {
                        self.buffer.advance(consumed);
                        return Ok(Some(Ok(frame)));
                    }
                    ParseResult::Invalid(e, consumed) => {
                        self.buffer.advance(consumed);
                        return Ok(Some(Err(e)));
                    }
                    ParseResult::Incomplete if self.buffer.len() > MAX_LINE_LENGTH + 1 => {
                        self.discarding = true;
                        continue;
                    }
                    ParseResult::Incomplete => {}
                }
            }

            let n = self.reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Ok(None);
            }
        }
    }
}

/// Drain `rx` onto `writer`, one frame per write. Returns when every sender
/// has been dropped or the peer stops accepting data.
pub(crate) async fn write_frames<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(1024);

    while let Some(frame) = rx.recv().await {
        buffer.clear();
        frame.encode(&mut buffer);
        writer.write_all(&buffer).await?;
    }

    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(frame: &Frame) -> Vec<u8> {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn test_parse_echo() {
        match parse(b"ECHO 7 1000 world 0\r\n") {
            ParseResult::Complete(Frame::Echo { id, request }, 21) => {
                assert_eq!(id, 7);
                assert_eq!(request.delay_ms, 1000);
                assert_eq!(request.name, "world 0");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_negative_delay() {
        match parse(b"ECHO 1 -5 x\r\n") {
            ParseResult::Complete(Frame::Echo { request, .. }, _) => {
                assert_eq!(request.delay_ms, -5);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_empty_name() {
        match parse(b"ECHO 3 0 \r\n") {
            ParseResult::Complete(Frame::Echo { request, .. }, _) => {
                assert_eq!(request.name, "");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_replies() {
        match parse(b"OK 2 Hello world\r\n") {
            ParseResult::Complete(Frame::Ok { id: 2, response }, _) => {
                assert_eq!(response.message, "Hello world");
            }
            other => panic!("unexpected: {:?}", other),
        }

        match parse(b"ERROR 9 INVALID_ARGUMENT delay_ms must be non-negative\r\n") {
            ParseResult::Complete(Frame::Error { id: 9, code, detail }, _) => {
                assert_eq!(code, StatusCode::InvalidArgument);
                assert_eq!(detail, "delay_ms must be non-negative");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_status_code() {
        match parse(b"ERROR 1 TEAPOT short and stout\r\n") {
            ParseResult::Complete(Frame::Error { code, .. }, _) => {
                assert_eq!(code, StatusCode::Unknown);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_cancel() {
        match parse(b"CANCEL 42\r\n") {
            ParseResult::Complete(Frame::Cancel { id: 42 }, 11) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_incomplete() {
        assert!(matches!(parse(b"ECHO 1 10 wor"), ParseResult::Incomplete));
        assert!(matches!(parse(b""), ParseResult::Incomplete));
    }

    #[test]
    fn test_invalid_lines_report_consumed_bytes() {
        match parse(b"FOO 1\r\nCANCEL 1\r\n") {
            ParseResult::Invalid(ParseError::UnknownCommand(cmd), 7) => assert_eq!(cmd, "FOO"),
            other => panic!("unexpected: {:?}", other),
        }

        match parse(b"ECHO abc 10 x\r\n") {
            ParseResult::Invalid(ParseError::InvalidNumber(_), 15) => {}
            other => panic!("unexpected: {:?}", other),
        }

        match parse(b"CANCEL\r\n") {
            ParseResult::Invalid(ParseError::MissingField("id"), 8) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_line_too_long() {
        let mut input = vec![b'a'; MAX_LINE_LENGTH + 1];
        input.extend_from_slice(b"\r\nCANCEL 1\r\n");
        match parse(&input) {
            ParseResult::Invalid(ParseError::LineTooLong, n) => {
                assert_eq!(n, MAX_LINE_LENGTH + 3)
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_long_partial_line_is_incomplete() {
        let input = vec![b'a'; MAX_LINE_LENGTH * 2];
        assert!(matches!(parse(&input), ParseResult::Incomplete));
    }

    #[test]
    fn test_line_len() {
        let frame = Frame::Echo {
            id: 1,
            request: Request::new("abc", 10),
        };
        assert_eq!(frame.line_len(), "ECHO 1 10 abc".len());
    }

    #[tokio::test]
    async fn test_reader_reports_oversized_line_once() {
        let chunk = vec![b'x'; 40 * 1024];
        let mock = tokio_test::io::Builder::new()
            .read(b"ECHO 1 0 ")
            .read(&chunk)
            .read(&chunk)
            .read(&chunk)
            .read(b"\r")
            .read(b"\nCANCEL 4\r\n")
            .build();
        let mut reader = FrameReader::new(mock);

        match reader.next().await.unwrap() {
            Some(Err(ParseError::LineTooLong)) => {}
            other => panic!("unexpected: {:?}", other),
        }
        match reader.next().await.unwrap() {
            Some(Ok(Frame::Cancel { id: 4 })) => {}
            other => panic!("unexpected: {:?}", other),
        }
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_joins_split_frames() {
        let mock = tokio_test::io::Builder::new()
            .read(b"OK 2 Hel")
            .read(b"lo world\r\nOK 3 Hello\r\n")
            .build();
        let mut reader = FrameReader::new(mock);

        match reader.next().await.unwrap() {
            Some(Ok(Frame::Ok { id: 2, response })) => assert_eq!(response.message, "Hello world"),
            other => panic!("unexpected: {:?}", other),
        }
        match reader.next().await.unwrap() {
            Some(Ok(Frame::Ok { id: 3, .. })) => {}
            other => panic!("unexpected: {:?}", other),
        }
        assert!(reader.next().await.unwrap().is_none());
    }

    #[test]
    fn test_encode_strips_line_breaks() {
        let frame = Frame::Ok {
            id: 5,
            response: Response {
                message: "Hello a\r\nb".to_string(),
            },
        };
        assert_eq!(encoded(&frame), b"OK 5 Hello a  b\r\n");
    }

    #[test]
    fn test_encode_echo_parses_back() {
        let frame = Frame::Echo {
            id: 11,
            request: Request::new("some name", 250),
        };
        let bytes = encoded(&frame);
        assert_eq!(bytes, b"ECHO 11 250 some name\r\n");
        match parse(&bytes) {
            ParseResult::Complete(parsed, n) => {
                assert_eq!(parsed, frame);
                assert_eq!(n, bytes.len());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
