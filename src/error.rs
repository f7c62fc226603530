use thiserror::Error;

/// Errors surfaced by the library.
///
/// Local precondition failures (`AlreadySubscribed`, `NotSubscribed`) are
/// returned to the caller and leave the connection intact. Transport and
/// parse failures stop the receiver and tear the connection down.
#[derive(Error, Debug)]
pub enum StompError {
    /// Underlying socket or TLS failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The CONNECT handshake yielded an ERROR frame or an unexpected command.
    #[error("server rejected connection: {0}")]
    ServerRejected(String),

    /// Malformed frame on the wire: bad command token, malformed header
    /// line, or an unparseable `content-length`.
    #[error("protocol parse error: {0}")]
    ProtocolParse(String),

    /// A subscription for this destination already exists.
    #[error("already subscribed to {0}")]
    AlreadySubscribed(String),

    /// No subscription exists for this destination.
    #[error("not subscribed to {0}")]
    NotSubscribed(String),

    /// Gzip decode failed for a compressed subscription. The frame is
    /// dropped and the connection continues.
    #[error("body decompression failed: {0}")]
    BodyDecompression(String),

    /// A version string the library does not speak.
    #[error("unsupported STOMP version: {0}")]
    VersionUnsupported(String),
}
