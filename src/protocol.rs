//! Protocol version handling and command validation.

use std::fmt;
use std::str::FromStr;

use crate::error::StompError;

/// Default broker port for plain STOMP over TCP.
pub const DEFAULT_PORT: u16 = 61613;

/// Commands valid under every STOMP version.
const COMMANDS_1_0: &[&str] = &[
    "CONNECTED",
    "MESSAGE",
    "RECEIPT",
    "ERROR",
    "CONNECT",
    "SEND",
    "SUBSCRIBE",
    "UNSUBSCRIBE",
    "BEGIN",
    "COMMIT",
    "ABORT",
    "ACK",
    "DISCONNECT",
];

/// Commands added by STOMP 1.1.
const COMMANDS_1_1: &[&str] = &["STOMP", "NACK"];

/// A negotiated STOMP protocol version.
///
/// Ordering follows the protocol: `V1_0 < V1_1 < V1_2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum StompVersion {
    V1_0,
    V1_1,
    #[default]
    V1_2,
}

impl StompVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            StompVersion::V1_0 => "1.0",
            StompVersion::V1_1 => "1.1",
            StompVersion::V1_2 => "1.2",
        }
    }

    /// Normalize a `version` or `accept-version` header value.
    ///
    /// - `None` or an empty string yields the default (1.2).
    /// - A single dotted decimal yields that version.
    /// - A comma-separated list of offered versions yields the maximum.
    ///
    /// An unrecognized version string is an error; the caller decides
    /// whether that aborts the handshake.
    pub fn normalize(input: Option<&str>) -> Result<StompVersion, StompError> {
        let input = match input {
            None => return Ok(StompVersion::default()),
            Some(s) if s.trim().is_empty() => return Ok(StompVersion::default()),
            Some(s) => s,
        };
        let mut best: Option<StompVersion> = None;
        for part in input.split(',') {
            let v = part.parse::<StompVersion>()?;
            best = Some(match best {
                Some(b) => b.max(v),
                None => v,
            });
        }
        // split always yields at least one part, so best is set here
        best.ok_or_else(|| StompError::VersionUnsupported(input.to_string()))
    }

    /// Whether CR before LF is part of line termination under this version.
    ///
    /// STOMP 1.0 lines end at a bare LF; a CR in a header value is a byte
    /// of that value. 1.1 and 1.2 accept CRLF and the CR is trimmed.
    pub(crate) fn trims_cr(&self) -> bool {
        *self >= StompVersion::V1_1
    }
}

impl fmt::Display for StompVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StompVersion {
    type Err = StompError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1.0" => Ok(StompVersion::V1_0),
            "1.1" => Ok(StompVersion::V1_1),
            "1.2" => Ok(StompVersion::V1_2),
            other => Err(StompError::VersionUnsupported(other.to_string())),
        }
    }
}

/// Is `command` a valid STOMP command under `version`?
///
/// STOMP 1.1 introduced `STOMP` and `NACK`; everything else is shared by
/// all three versions.
pub fn valid_command(command: &str, version: StompVersion) -> bool {
    if COMMANDS_1_0.contains(&command) {
        return true;
    }
    version >= StompVersion::V1_1 && COMMANDS_1_1.contains(&command)
}

/// Is `command` a command any supported version knows about?
pub(crate) fn known_command(command: &str) -> bool {
    valid_command(command, StompVersion::V1_2)
}

/// The MESSAGE-frame header that carries the id an ACK/NACK must quote.
///
/// Under 1.0 and 1.1 that is `message-id`; STOMP 1.2 assigns a dedicated
/// `ack` header.
pub fn ack_header(version: StompVersion) -> &'static str {
    match version {
        StompVersion::V1_0 | StompVersion::V1_1 => "message-id",
        StompVersion::V1_2 => "ack",
    }
}
