//! Byte transport over plain TCP or TLS.
//!
//! Everything above this module sees an opaque `AsyncRead + AsyncWrite`
//! stream; this is the only place where TCP and TLS diverge. TLS
//! configuration is passed through opaquely — certificate handling belongs
//! to the caller.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::StompError;

/// Opaque TLS options: a caller-built rustls client config, plus an
/// optional server name override when it differs from the broker host.
#[derive(Clone)]
pub struct TlsOptions {
    pub config: Arc<ClientConfig>,
    pub domain: Option<String>,
}

/// A connected broker socket, plain or TLS.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    /// Open a TCP connection to `host:port`, upgrading to TLS when `tls`
    /// is given. The timeout covers each establishment step.
    pub async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        tls: Option<&TlsOptions>,
    ) -> Result<Self, StompError> {
        let tcp = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| timeout_error("TCP connect timed out"))??;
        match tls {
            None => {
                debug!(host, port, "connected");
                Ok(Transport::Plain(tcp))
            }
            Some(options) => {
                let connector = TlsConnector::from(options.config.clone());
                let name = options.domain.clone().unwrap_or_else(|| host.to_string());
                let server_name = ServerName::try_from(name).map_err(|e| {
                    StompError::Transport(io::Error::new(io::ErrorKind::InvalidInput, e))
                })?;
                let stream = tokio::time::timeout(timeout, connector.connect(server_name, tcp))
                    .await
                    .map_err(|_| timeout_error("TLS handshake timed out"))??;
                debug!(host, port, "connected over TLS");
                Ok(Transport::Tls(Box::new(stream)))
            }
        }
    }
}

fn timeout_error(message: &str) -> StompError {
    StompError::Transport(io::Error::new(io::ErrorKind::TimedOut, message))
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
