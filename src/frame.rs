use std::fmt;

use tracing::warn;

use crate::protocol::{self, StompVersion};

/// Synthetic command for the pseudo-frame produced when a bare LF (or CRLF)
/// heartbeat arrives on the wire.
pub const HEARTBEAT_COMMAND: &str = "HEARTBEAT";

/// A single STOMP frame: command, ordered headers, raw body bytes.
///
/// Headers keep their arrival order. When the same name occurs more than
/// once the first occurrence is authoritative (STOMP 1.2 §1.4.2); later
/// occurrences are stored but never win a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// STOMP command (e.g. CONNECT, SEND, MESSAGE), or [`HEARTBEAT_COMMAND`].
    pub command: String,
    /// Ordered headers as (name, value) pairs.
    pub headers: Vec<(String, String)>,
    /// Raw body bytes.
    pub body: Vec<u8>,
}

impl Frame {
    /// Create a frame with the given command and empty headers/body.
    ///
    /// No validation happens here; use [`FrameBuilder`] for the validated
    /// construction path.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// The pseudo-frame representing one heartbeat: synthetic command,
    /// empty headers, empty body.
    pub fn heartbeat() -> Self {
        Self::new(HEARTBEAT_COMMAND)
    }

    /// Add a header (builder style).
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the frame body (builder style).
    pub fn set_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for `name`, or `None`. First occurrence wins.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// The `content-length` header as an integer, if present and parseable.
    pub fn content_length(&self) -> Option<usize> {
        self.get_header("content-length")
            .and_then(|v| v.trim().parse::<usize>().ok())
    }

    /// The `version` header as a [`StompVersion`], if present and known.
    pub fn version(&self) -> Option<StompVersion> {
        self.get_header("version").and_then(|v| v.parse().ok())
    }

    pub fn is_heartbeat(&self) -> bool {
        self.command == HEARTBEAT_COMMAND
    }
}

impl Default for Frame {
    fn default() -> Self {
        Frame::new("")
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Command: {}", self.command)?;
        for (k, v) in &self.headers {
            writeln!(f, "{}: {}", k, v)?;
        }
        writeln!(f, "Body ({} bytes)", self.body.len())
    }
}

/// Fluent, validated builder for outgoing frames.
///
/// `FrameBuilder::new` checks the command against the STOMP command set; an
/// unknown command logs a warning and leaves the frame unchanged, so a typo
/// produces an empty-command frame rather than garbage on the wire. The
/// per-command constructors below are the usual entry points.
#[derive(Debug, Default)]
pub struct FrameBuilder {
    frame: Frame,
}

impl FrameBuilder {
    /// Start a frame with `command`, which must be a known STOMP command.
    pub fn new(command: &str) -> Self {
        let mut builder = FrameBuilder {
            frame: Frame::default(),
        };
        builder.set_command(command);
        builder
    }

    fn set_command(&mut self, command: &str) {
        if protocol::known_command(command) {
            self.frame.command = command.to_string();
        } else {
            warn!(command, "ignoring unknown STOMP command");
        }
    }

    /// The handshake frame: `CONNECT` under 1.0, `STOMP` under 1.1+.
    pub fn connect_frame(version: StompVersion) -> Self {
        if version >= StompVersion::V1_1 {
            Self::new("STOMP")
        } else {
            Self::new("CONNECT")
        }
    }

    pub fn send(destination: &str) -> Self {
        Self::new("SEND").header("destination", destination)
    }

    pub fn subscribe(id: &str, destination: &str, ack: &str) -> Self {
        Self::new("SUBSCRIBE")
            .header("id", id)
            .header("destination", destination)
            .header("ack", ack)
    }

    pub fn unsubscribe(id: &str) -> Self {
        Self::new("UNSUBSCRIBE").header("id", id)
    }

    pub fn begin(transaction: &str) -> Self {
        Self::new("BEGIN").header("transaction", transaction)
    }

    pub fn commit(transaction: &str) -> Self {
        Self::new("COMMIT").header("transaction", transaction)
    }

    pub fn abort(transaction: &str) -> Self {
        Self::new("ABORT").header("transaction", transaction)
    }

    /// An ACK quoting `id`, using the header name `version` expects:
    /// `id` under 1.2, `message-id` under 1.0/1.1.
    pub fn ack(version: StompVersion, id: &str) -> Self {
        Self::new("ACK").header(Self::ack_id_header(version), id)
    }

    /// A NACK quoting `id`. Callers must not emit NACK under 1.0; the
    /// connection layer guards that.
    pub fn nack(version: StompVersion, id: &str) -> Self {
        Self::new("NACK").header(Self::ack_id_header(version), id)
    }

    fn ack_id_header(version: StompVersion) -> &'static str {
        if version >= StompVersion::V1_2 {
            "id"
        } else {
            "message-id"
        }
    }

    pub fn disconnect() -> Self {
        Self::new("DISCONNECT")
    }

    /// Append one header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.frame.headers.push((name.into(), value.into()));
        self
    }

    /// Merge headers: an existing name is replaced in place, a new one
    /// appended.
    pub fn headers<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in pairs {
            let (name, value) = (name.into(), value.into());
            match self.frame.headers.iter_mut().find(|(k, _)| *k == name) {
                Some(slot) => slot.1 = value,
                None => self.frame.headers.push((name, value)),
            }
        }
        self
    }

    /// Replace the body.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.frame.body = body.into();
        self
    }

    /// Append `text` to the body, followed by a LF when `with_newline` is
    /// set (the default for line-oriented payloads).
    pub fn append_body(mut self, text: &str, with_newline: bool) -> Self {
        self.frame.body.extend_from_slice(text.as_bytes());
        if with_newline {
            self.frame.body.push(b'\n');
        }
        self
    }

    /// Finalize into a [`Frame`].
    pub fn build(self) -> Frame {
        self.frame
    }
}
