//! A STOMP 1.0 / 1.1 / 1.2 client.
//!
//! The heart of the crate is an incremental frame parser that assembles
//! one frame at a time from a TCP byte stream with arbitrary chunk
//! boundaries, honoring both body-termination modes (`content-length`
//! versus NUL), recognizing heartbeats, and carrying partial frames across
//! reads. On top of it sit a pull-based receiver task and a connection
//! manager handling the handshake, subscriptions, callback dispatch, and
//! acknowledgements.
//!
//! ```ignore
//! use rhodium_stomp::{ConnectOptions, Connection, SubscribeOptions};
//!
//! let conn = Connection::connect(
//!     ConnectOptions::new("broker.example.com").credentials("guest", "guest"),
//! )
//! .await?;
//! conn.subscribe("/queue/events", Vec::new(), SubscribeOptions::default())
//!     .await?;
//! conn.set_send_to_caller(true).await?;
//! while let Some(message) = conn.next_message().await {
//!     println!("{}", message.frame);
//! }
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod frame;
pub mod parser;
pub mod protocol;
mod receiver;
pub mod transport;

pub use codec::{StompCodec, StompItem};
pub use connection::{
    AckMode, Callback, CallbackHandle, CallerMessage, ConnectOptions, Connection,
    SubscribeOptions,
};
pub use error::StompError;
pub use frame::{Frame, FrameBuilder};
pub use parser::FrameParser;
pub use protocol::StompVersion;
pub use transport::TlsOptions;
