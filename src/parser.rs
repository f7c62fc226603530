//! Incremental STOMP frame parser.
//!
//! [`FrameParser`] assembles one frame at a time from a byte stream whose
//! chunk boundaries are arbitrary: a frame may arrive in many reads, and a
//! single read may carry many frames. The parser owns an internal buffer
//! and a state machine, so a partial frame survives across [`feed`] calls
//! and resumes exactly where the previous chunk stopped — including inside
//! a `content-length` body that contains NUL bytes.
//!
//! [`feed`]: FrameParser::feed

use bytes::{Buf, BytesMut};

use crate::error::StompError;
use crate::frame::Frame;
use crate::protocol::StompVersion;

/// Items produced by the parser: a decoded frame or a heartbeat pulse
/// (a bare LF, or CRLF, between frames).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    Frame(Frame),
    Heartbeat,
}

impl StompItem {
    /// Convert into a [`Frame`], synthesizing the `HEARTBEAT` pseudo-frame
    /// for heartbeat pulses.
    pub fn into_frame(self) -> Frame {
        match self {
            StompItem::Frame(frame) => frame,
            StompItem::Heartbeat => Frame::heartbeat(),
        }
    }
}

/// Where the parser is inside the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Between frames; blank lines here are heartbeats.
    AwaitingCommand,
    /// Command consumed; accumulating header lines.
    ReadingHeaders,
    /// Blank line seen and `content-length` was present: exactly
    /// `remaining` body bytes are owed, then the mandatory NUL.
    ReadingBodyByLength { remaining: usize },
    /// Blank line seen, no `content-length`: body runs to the first NUL.
    ReadingBodyByTerminator,
    /// A complete item is ready to be surrendered.
    Terminated,
}

#[derive(Debug, Default)]
struct PartialFrame {
    command: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

/// Incremental parser holding the state machine and the carry-over buffer.
pub struct FrameParser {
    buf: BytesMut,
    state: ParseState,
    partial: PartialFrame,
    finished: Option<StompItem>,
    version: StompVersion,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::with_version(StompVersion::default())
    }

    pub fn with_version(version: StompVersion) -> Self {
        Self {
            buf: BytesMut::with_capacity(4 * 1024),
            state: ParseState::AwaitingCommand,
            partial: PartialFrame::default(),
            finished: None,
            version,
        }
    }

    /// Switch protocol version. Applies from the next line read; the
    /// receiver only calls this between frames.
    pub fn set_version(&mut self, version: StompVersion) {
        self.version = version;
    }

    pub fn version(&self) -> StompVersion {
        self.version
    }

    /// Append raw bytes from the transport. Call [`poll`](Self::poll) to
    /// extract whatever became complete.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Feed `bytes` and drain every item that completes.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<StompItem>, StompError> {
        self.feed(bytes);
        let mut items = Vec::new();
        while let Some(item) = self.poll()? {
            items.push(item);
        }
        Ok(items)
    }

    /// Advance the state machine as far as the buffered bytes allow.
    ///
    /// Returns `Ok(Some(item))` when a frame or heartbeat completed,
    /// `Ok(None)` when more bytes are needed, and `Err` on a protocol
    /// violation (the stream is unusable afterwards).
    pub fn poll(&mut self) -> Result<Option<StompItem>, StompError> {
        loop {
            match self.state {
                ParseState::Terminated => {
                    self.state = ParseState::AwaitingCommand;
                    return Ok(self.finished.take());
                }
                ParseState::AwaitingCommand => {
                    let line = match self.take_line() {
                        Some(line) => line,
                        None => return Ok(None),
                    };
                    if line.is_empty() || line[..] == *b"\r" {
                        self.finish(StompItem::Heartbeat);
                        continue;
                    }
                    self.partial.command = parse_command(&line)?;
                    self.state = ParseState::ReadingHeaders;
                }
                ParseState::ReadingHeaders => {
                    let line = match self.take_line() {
                        Some(line) => line,
                        None => return Ok(None),
                    };
                    let line = self.trim_line(line);
                    if line.is_empty() {
                        self.state = self.body_state()?;
                        continue;
                    }
                    let header = parse_header(&line)?;
                    self.partial.headers.push(header);
                }
                ParseState::ReadingBodyByLength { remaining } => {
                    // body bytes plus the mandatory trailing NUL; a length
                    // near usize::MAX cannot be satisfied and must not
                    // overflow the arithmetic
                    let needed = remaining.checked_add(1).ok_or_else(|| {
                        StompError::ProtocolParse(format!(
                            "content-length {} out of range",
                            remaining
                        ))
                    })?;
                    if self.buf.len() < needed {
                        return Ok(None);
                    }
                    let body = self.buf.split_to(remaining);
                    if self.buf[0] != 0 {
                        return Err(StompError::ProtocolParse(
                            "missing NUL after content-length body".into(),
                        ));
                    }
                    self.buf.advance(1);
                    self.consume_optional_lf();
                    self.partial.body = body.to_vec();
                    let frame = self.take_partial();
                    self.finish(StompItem::Frame(frame));
                }
                ParseState::ReadingBodyByTerminator => {
                    let nul = match self.buf.iter().position(|&b| b == 0) {
                        Some(pos) => pos,
                        None => return Ok(None),
                    };
                    let body = self.buf.split_to(nul);
                    self.buf.advance(1);
                    self.consume_optional_lf();
                    self.partial.body = body.to_vec();
                    let frame = self.take_partial();
                    self.finish(StompItem::Frame(frame));
                }
            }
        }
    }

    /// Headers of the in-progress frame are fully read.
    pub fn headers_complete(&self) -> bool {
        !matches!(
            self.state,
            ParseState::AwaitingCommand | ParseState::ReadingHeaders
        )
    }

    /// Name of the most recently parsed header of the in-progress frame.
    pub fn last_header(&self) -> Option<&str> {
        self.partial.headers.last().map(|(k, _)| k.as_str())
    }

    /// Command of the in-progress frame, once parsed.
    pub fn command(&self) -> Option<&str> {
        if self.partial.command.is_empty() {
            None
        } else {
            Some(&self.partial.command)
        }
    }

    /// A frame is mid-flight: EOF now would truncate it.
    pub fn is_partial(&self) -> bool {
        self.state != ParseState::AwaitingCommand || !self.buf.is_empty()
    }

    fn finish(&mut self, item: StompItem) {
        self.finished = Some(item);
        self.state = ParseState::Terminated;
    }

    fn take_partial(&mut self) -> Frame {
        let partial = std::mem::take(&mut self.partial);
        Frame {
            command: partial.command,
            headers: partial.headers,
            body: partial.body,
        }
    }

    /// Take bytes up to the next LF, excluding it. `None` when no full
    /// line is buffered yet.
    fn take_line(&mut self) -> Option<BytesMut> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line = self.buf.split_to(pos);
        self.buf.advance(1);
        Some(line)
    }

    /// Trim the CR of a CRLF terminator where the version allows it.
    /// Under 1.0 a CR is an ordinary value byte.
    fn trim_line(&self, mut line: BytesMut) -> BytesMut {
        if self.version.trims_cr() && line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        line
    }

    fn consume_optional_lf(&mut self) {
        if self.buf.first() == Some(&b'\n') {
            self.buf.advance(1);
        }
    }

    /// Decide the body mode from the accumulated headers. The first
    /// `content-length` occurrence governs; an empty value is treated as
    /// absent, a malformed one is a protocol error.
    fn body_state(&self) -> Result<ParseState, StompError> {
        let raw = self
            .partial
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .map(|(_, v)| v.trim());
        match raw {
            None | Some("") => Ok(ParseState::ReadingBodyByTerminator),
            Some(value) => match value.parse::<usize>() {
                Ok(n) => Ok(ParseState::ReadingBodyByLength { remaining: n }),
                Err(_) => Err(StompError::ProtocolParse(format!(
                    "invalid content-length '{}'",
                    value
                ))),
            },
        }
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse and validate the command token. Trailing whitespace (including a
/// CR from a CRLF line ending) is trimmed first.
fn parse_command(line: &[u8]) -> Result<String, StompError> {
    let text = std::str::from_utf8(line)
        .map_err(|e| StompError::ProtocolParse(format!("invalid utf8 in command: {}", e)))?;
    let command = text.trim_end();
    if command.is_empty() {
        return Err(StompError::ProtocolParse("empty command".into()));
    }
    if !command
        .bytes()
        .all(|b| b.is_ascii_uppercase() || b == b'-')
    {
        return Err(StompError::ProtocolParse(format!(
            "bad command token '{}'",
            command
        )));
    }
    Ok(command.to_string())
}

/// Split a header line at the first colon. Names are restricted to
/// `[A-Za-z0-9-]+`; values are arbitrary UTF-8.
fn parse_header(line: &[u8]) -> Result<(String, String), StompError> {
    let colon = line.iter().position(|&b| b == b':').ok_or_else(|| {
        StompError::ProtocolParse(format!(
            "malformed header line: {:?}",
            String::from_utf8_lossy(line)
        ))
    })?;
    let (name, value) = line.split_at(colon);
    if name.is_empty()
        || !name
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'-')
    {
        return Err(StompError::ProtocolParse(format!(
            "bad header name: {:?}",
            String::from_utf8_lossy(name)
        )));
    }
    let name = std::str::from_utf8(name)
        .map_err(|e| StompError::ProtocolParse(format!("invalid utf8 in header name: {}", e)))?
        .to_string();
    let value = std::str::from_utf8(&value[1..])
        .map_err(|e| StompError::ProtocolParse(format!("invalid utf8 in header value: {}", e)))?
        .to_string();
    Ok((name, value))
}
