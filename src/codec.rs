//! `tokio_util` codec glue for the STOMP wire protocol.
//!
//! Decoding delegates to [`FrameParser`], which carries partial frames
//! across reads. Encoding produces the exact byte sequence
//! `COMMAND LF (name ':' value LF)* LF body NUL LF`: the NUL terminator is
//! always emitted, and the trailing LF is emitted for legibility — peers
//! must not rely on it. Outbound lines use bare LF; CR is never written.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::StompError;
use crate::frame::Frame;
use crate::parser::FrameParser;
use crate::protocol::StompVersion;

pub use crate::parser::StompItem;

/// STOMP codec for use with `FramedRead` / `FramedWrite`.
pub struct StompCodec {
    parser: FrameParser,
}

impl StompCodec {
    pub fn new() -> Self {
        Self {
            parser: FrameParser::new(),
        }
    }

    pub fn with_version(version: StompVersion) -> Self {
        Self {
            parser: FrameParser::with_version(version),
        }
    }

    /// Switch the inbound parser to the negotiated protocol version.
    pub fn set_version(&mut self, version: StompVersion) {
        self.parser.set_version(version);
    }
}

impl Default for StompCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for StompCodec {
    type Item = StompItem;
    type Error = StompError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Hand everything to the parser; it owns the carry-over buffer, so
        // partial frames resume on the next read without rescanning.
        if !src.is_empty() {
            self.parser.feed(&src[..]);
            src.clear();
        }
        self.parser.poll()
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None if self.parser.is_partial() => Err(StompError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            ))),
            None => Ok(None),
        }
    }
}

impl Encoder<StompItem> for StompCodec {
    type Error = StompError;

    fn encode(&mut self, item: StompItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            StompItem::Heartbeat => {
                dst.put_u8(b'\n');
            }
            StompItem::Frame(frame) => encode_frame(&frame, dst),
        }
        Ok(())
    }
}

/// Serialize one frame. A body containing NUL or non-UTF-8 bytes gets a
/// `content-length` header added unless the caller already set one, since
/// such bodies cannot be NUL-terminated unambiguously.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) {
    dst.extend_from_slice(frame.command.as_bytes());
    dst.put_u8(b'\n');

    for (name, value) in &frame.headers {
        dst.extend_from_slice(name.as_bytes());
        dst.put_u8(b':');
        dst.extend_from_slice(value.as_bytes());
        dst.put_u8(b'\n');
    }

    let needs_length =
        frame.body.contains(&0) || std::str::from_utf8(&frame.body).is_err();
    if needs_length && frame.get_header("content-length").is_none() {
        dst.extend_from_slice(b"content-length:");
        dst.extend_from_slice(frame.body.len().to_string().as_bytes());
        dst.put_u8(b'\n');
    }

    dst.put_u8(b'\n');
    dst.extend_from_slice(&frame.body);
    dst.put_u8(0);
    dst.put_u8(b'\n');
}
