//! Pull-based frame receiver task.
//!
//! The receiver owns the read half of the transport. It sits idle until
//! the connection manager requests the next frame, reads exactly one item,
//! surrenders it, and waits for the next request. That pull discipline is
//! the backpressure: a slow consumer parks the receiver, which parks the
//! TCP read buffer, which parks the broker.

use futures::StreamExt;
use tokio::io::ReadHalf;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::trace;

use crate::codec::{StompCodec, StompItem};
use crate::error::StompError;
use crate::protocol::StompVersion;
use crate::transport::Transport;

pub(crate) enum ReceiverRequest {
    /// Deliver exactly one item to the owner.
    NextFrame,
    /// Apply the negotiated protocol version between frames.
    SetVersion(StompVersion),
}

pub(crate) enum ReceiverEvent {
    Item(StompItem),
    /// Parse or transport failure, or EOF; the receiver has terminated.
    Stopped(StompError),
}

pub(crate) struct ReceiverHandle {
    request_tx: mpsc::UnboundedSender<ReceiverRequest>,
    task: tokio::task::JoinHandle<()>,
}

impl ReceiverHandle {
    pub(crate) fn spawn(
        frames: FramedRead<ReadHalf<Transport>, StompCodec>,
        event_tx: mpsc::Sender<ReceiverEvent>,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(frames, request_rx, event_tx));
        Self { request_tx, task }
    }

    /// Fire-and-forget: ask for the next frame.
    pub(crate) fn request_next(&self) {
        let _ = self.request_tx.send(ReceiverRequest::NextFrame);
    }

    pub(crate) fn set_version(&self, version: StompVersion) {
        let _ = self.request_tx.send(ReceiverRequest::SetVersion(version));
    }

    /// Unconditional stop; an in-flight read is aborted.
    pub(crate) fn stop(&self) {
        self.task.abort();
    }
}

async fn run(
    mut frames: FramedRead<ReadHalf<Transport>, StompCodec>,
    mut request_rx: mpsc::UnboundedReceiver<ReceiverRequest>,
    event_tx: mpsc::Sender<ReceiverEvent>,
) {
    while let Some(request) = request_rx.recv().await {
        match request {
            ReceiverRequest::SetVersion(version) => {
                trace!(%version, "receiver switching protocol version");
                frames.decoder_mut().set_version(version);
            }
            ReceiverRequest::NextFrame => match frames.next().await {
                Some(Ok(item)) => {
                    if event_tx.send(ReceiverEvent::Item(item)).await.is_err() {
                        break;
                    }
                }
                Some(Err(error)) => {
                    let _ = event_tx.send(ReceiverEvent::Stopped(error)).await;
                    break;
                }
                None => {
                    let eof = std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "broker closed the connection",
                    );
                    let _ = event_tx.send(ReceiverEvent::Stopped(eof.into())).await;
                    break;
                }
            },
        }
    }
}
