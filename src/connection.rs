//! Connection manager: handshake, subscriptions, dispatch.
//!
//! A [`Connection`] is a cloneable handle onto two cooperating tasks. The
//! manager task owns every piece of mutable state (subscription registry,
//! callback tables, negotiated version) and the write half of the socket;
//! the receiver task owns the read half and delivers one frame per pull.
//! No state is shared, so no locks guard it.

use std::collections::HashMap;
use std::io::{self, Read};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use futures::{SinkExt, StreamExt};
use tokio::io::WriteHalf;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{Framed, FramedParts, FramedRead, FramedWrite};
use tracing::{debug, error, trace, warn};

use crate::codec::{StompCodec, StompItem};
use crate::error::StompError;
use crate::frame::{Frame, FrameBuilder};
use crate::protocol::{self, StompVersion, DEFAULT_PORT};
use crate::receiver::{ReceiverEvent, ReceiverHandle};
use crate::transport::{TlsOptions, Transport};

/// Subscription acknowledgement modes as defined by STOMP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    #[default]
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }

    /// Parse an `ack` header value; anything unrecognized means `auto`.
    fn from_header(value: &str) -> Self {
        match value {
            "client" => AckMode::Client,
            "client-individual" => AckMode::ClientIndividual,
            _ => AckMode::Auto,
        }
    }
}

/// Configuration for [`Connection::connect`].
#[derive(Clone)]
pub struct ConnectOptions {
    /// Broker host. Also sent as the `host` handshake header.
    pub host: String,
    /// TCP port, default 61613.
    pub port: u16,
    pub login: Option<String>,
    pub passcode: Option<String>,
    /// Extra headers merged into the handshake frame.
    pub headers: Vec<(String, String)>,
    /// Connect (and TLS handshake) timeout, default 10 s.
    pub timeout: Duration,
    /// When set, the connection is made over TLS.
    pub tls: Option<TlsOptions>,
    /// Versions offered in `accept-version`, default just 1.2.
    pub accept_versions: Vec<StompVersion>,
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            login: None,
            passcode: None,
            headers: Vec::new(),
            timeout: Duration::from_secs(10),
            tls: None,
            accept_versions: vec![StompVersion::default()],
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn credentials(mut self, login: impl Into<String>, passcode: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self.passcode = Some(passcode.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn accept_versions(mut self, versions: &[StompVersion]) -> Self {
        self.accept_versions = versions.to_vec();
        self
    }
}

/// Per-subscription options beyond the SUBSCRIBE headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Gzip-decode inbound MESSAGE bodies for this destination.
    pub compressed: bool,
}

/// An inbound frame forwarded to the owning task.
#[derive(Debug, Clone)]
pub struct CallerMessage {
    pub destination: String,
    pub frame: Frame,
}

/// A frame callback. Callbacks for one destination run in registration
/// order and each sees the same frame.
pub type Callback = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Identity token returned by `register_callback`, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(u64);

struct SubscriptionEntry {
    id: String,
    ack: AckMode,
    compressed: bool,
}

enum Command {
    Subscribe {
        destination: String,
        headers: Vec<(String, String)>,
        options: SubscribeOptions,
        reply: oneshot::Sender<Result<String, StompError>>,
    },
    Unsubscribe {
        destination: String,
        reply: oneshot::Sender<Result<(), StompError>>,
    },
    Publish {
        destination: String,
        body: Vec<u8>,
        reply: oneshot::Sender<Result<(), StompError>>,
    },
    Ack {
        frame: Frame,
        reply: oneshot::Sender<Result<(), StompError>>,
    },
    Nack {
        frame: Frame,
        reply: oneshot::Sender<Result<(), StompError>>,
    },
    RegisterCallback {
        destination: String,
        callback: Callback,
        reply: oneshot::Sender<CallbackHandle>,
    },
    RemoveCallback {
        destination: String,
        handle: CallbackHandle,
        reply: oneshot::Sender<bool>,
    },
    SetSendToCaller(bool),
    Disconnect {
        reply: oneshot::Sender<Result<(), StompError>>,
    },
}

/// Handle onto an established STOMP session.
#[derive(Clone)]
pub struct Connection {
    command_tx: mpsc::Sender<Command>,
    /// Shared behind a mutex so cloned handles may await concurrently.
    messages: Arc<Mutex<mpsc::Receiver<CallerMessage>>>,
}

impl Connection {
    /// Establish a session: TCP or TLS transport, CONNECT/STOMP handshake,
    /// one synchronous read of the broker's answer, then the receiver and
    /// manager tasks are spawned.
    pub async fn connect(options: ConnectOptions) -> Result<Self, StompError> {
        let offered = if options.accept_versions.is_empty() {
            vec![StompVersion::default()]
        } else {
            options.accept_versions.clone()
        };
        let newest = *offered.iter().max().expect("offered is non-empty");

        let transport = Transport::connect(
            &options.host,
            options.port,
            options.timeout,
            options.tls.as_ref(),
        )
        .await?;
        let mut framed = Framed::new(transport, StompCodec::new());

        let accept = offered
            .iter()
            .map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let mut handshake = FrameBuilder::connect_frame(newest)
            .header("accept-version", accept)
            .header("host", options.host.clone());
        if let Some(login) = &options.login {
            handshake = handshake.header("login", login);
        }
        if let Some(passcode) = &options.passcode {
            handshake = handshake.header("passcode", passcode);
        }
        let handshake = handshake.headers(options.headers.clone()).build();
        framed.send(StompItem::Frame(handshake)).await?;

        // one synchronous read for the broker's verdict
        let reply = loop {
            match framed.next().await {
                Some(Ok(StompItem::Heartbeat)) => continue,
                Some(Ok(StompItem::Frame(frame))) => break frame,
                Some(Err(error)) => return Err(error),
                None => {
                    return Err(StompError::ServerRejected(
                        "connection closed before CONNECTED".into(),
                    ));
                }
            }
        };

        let version = match reply.command.as_str() {
            "CONNECTED" => match reply.get_header("version") {
                Some(value) => value.parse::<StompVersion>()?,
                None => StompVersion::V1_0,
            },
            "ERROR" => {
                let message = reply
                    .get_header("message")
                    .unwrap_or("connection rejected by server")
                    .to_string();
                return Err(StompError::ServerRejected(message));
            }
            other => {
                return Err(StompError::ServerRejected(format!(
                    "unexpected {} frame during handshake",
                    other
                )));
            }
        };
        debug!(%version, host = %options.host, "broker accepted connection");

        // Split the socket: the manager keeps the write half, the receiver
        // owns the read half. Bytes already buffered by the handshake read
        // are carried over.
        let FramedParts {
            io,
            mut codec,
            read_buf,
            ..
        } = framed.into_parts();
        codec.set_version(version);
        let (read_half, write_half) = tokio::io::split(io);
        let mut frames = FramedRead::new(read_half, codec);
        frames.read_buffer_mut().extend_from_slice(&read_buf);
        let sink = FramedWrite::new(write_half, StompCodec::with_version(version));

        let (event_tx, event_rx) = mpsc::channel(1);
        let receiver = ReceiverHandle::spawn(frames, event_tx);
        receiver.set_version(version);

        let (command_tx, command_rx) = mpsc::channel(32);
        let (caller_tx, caller_rx) = mpsc::channel(32);
        let manager = Manager {
            sink,
            receiver,
            version,
            subscriptions: HashMap::new(),
            callbacks: HashMap::new(),
            next_subscription_id: 1,
            next_callback_id: 1,
            send_to_caller: false,
            caller_tx,
            pulling: false,
        };
        tokio::spawn(manager.run(command_rx, event_rx));

        Ok(Connection {
            command_tx,
            messages: Arc::new(Mutex::new(caller_rx)),
        })
    }

    /// Subscribe to a destination. The subscription id is taken from an
    /// `id` entry in `headers` when present, otherwise assigned from a
    /// counter; ack mode comes from an `ack` entry, defaulting to auto.
    /// Returns the subscription id.
    pub async fn subscribe(
        &self,
        destination: &str,
        headers: Vec<(String, String)>,
        options: SubscribeOptions,
    ) -> Result<String, StompError> {
        let destination = destination.to_string();
        self.request(|reply| Command::Subscribe {
            destination,
            headers,
            options,
            reply,
        })
        .await?
    }

    pub async fn unsubscribe(&self, destination: &str) -> Result<(), StompError> {
        let destination = destination.to_string();
        self.request(|reply| Command::Unsubscribe { destination, reply })
            .await?
    }

    /// Publish `body` to `destination` with an explicit `content-length`.
    pub async fn send(
        &self,
        destination: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), StompError> {
        let destination = destination.to_string();
        let body = body.into();
        self.request(|reply| Command::Publish {
            destination,
            body,
            reply,
        })
        .await?
    }

    /// Acknowledge a MESSAGE frame, quoting the id header appropriate to
    /// the negotiated version (`ack` under 1.2, `message-id` earlier).
    pub async fn ack(&self, frame: &Frame) -> Result<(), StompError> {
        let frame = frame.clone();
        self.request(|reply| Command::Ack { frame, reply }).await?
    }

    /// Negative-acknowledge a MESSAGE frame. Under STOMP 1.0 this logs a
    /// warning and sends nothing.
    pub async fn nack(&self, frame: &Frame) -> Result<(), StompError> {
        let frame = frame.clone();
        self.request(|reply| Command::Nack { frame, reply }).await?
    }

    /// Register a callback for a destination; callbacks run in
    /// registration order. The returned handle removes it again.
    pub async fn register_callback(
        &self,
        destination: &str,
        callback: impl Fn(&Frame) + Send + Sync + 'static,
    ) -> Result<CallbackHandle, StompError> {
        let destination = destination.to_string();
        let callback: Callback = Arc::new(callback);
        self.request(|reply| Command::RegisterCallback {
            destination,
            callback,
            reply,
        })
        .await
    }

    /// Remove a previously registered callback. Returns whether anything
    /// was removed.
    pub async fn remove_callback(
        &self,
        destination: &str,
        handle: CallbackHandle,
    ) -> Result<bool, StompError> {
        let destination = destination.to_string();
        self.request(|reply| Command::RemoveCallback {
            destination,
            handle,
            reply,
        })
        .await
    }

    /// Toggle between callback dispatch and forwarding every MESSAGE to
    /// the channel read by [`next_message`](Self::next_message).
    pub async fn set_send_to_caller(&self, enabled: bool) -> Result<(), StompError> {
        self.command_tx
            .send(Command::SetSendToCaller(enabled))
            .await
            .map_err(|_| connection_closed())
    }

    /// Next frame forwarded to the owner: MESSAGE frames in send-to-caller
    /// mode, plus ERROR/RECEIPT and other non-MESSAGE frames always.
    /// `None` once the connection is closed.
    pub async fn next_message(&self) -> Option<CallerMessage> {
        let mut rx = self.messages.lock().await;
        rx.recv().await
    }

    /// Send DISCONNECT, stop the receiver, close the socket.
    pub async fn disconnect(&self) -> Result<(), StompError> {
        self.request(|reply| Command::Disconnect { reply }).await?
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, StompError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| connection_closed())?;
        reply_rx.await.map_err(|_| connection_closed())
    }
}

fn connection_closed() -> StompError {
    StompError::Transport(io::Error::new(
        io::ErrorKind::NotConnected,
        "connection is closed",
    ))
}

struct Manager {
    sink: FramedWrite<WriteHalf<Transport>, StompCodec>,
    receiver: ReceiverHandle,
    version: StompVersion,
    subscriptions: HashMap<String, SubscriptionEntry>,
    callbacks: HashMap<String, Vec<(CallbackHandle, Callback)>>,
    next_subscription_id: u64,
    next_callback_id: u64,
    send_to_caller: bool,
    caller_tx: mpsc::Sender<CallerMessage>,
    /// One pull outstanding at a time; set by the first subscription and
    /// renewed after each dispatched item.
    pulling: bool,
}

impl Manager {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<Command>,
        mut event_rx: mpsc::Receiver<ReceiverEvent>,
    ) {
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await.is_break() {
                            break;
                        }
                    }
                    // every handle dropped: tear down without DISCONNECT
                    None => {
                        let _ = self.shutdown(false).await;
                        break;
                    }
                },
                event = event_rx.recv() => match event {
                    Some(ReceiverEvent::Item(item)) => self.dispatch(item).await,
                    Some(ReceiverEvent::Stopped(error)) => {
                        error!(%error, "receiver stopped, closing connection");
                        let _ = self.shutdown(false).await;
                        break;
                    }
                    None => break,
                },
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Subscribe {
                destination,
                headers,
                options,
                reply,
            } => {
                let _ = reply.send(self.subscribe(destination, headers, options).await);
            }
            Command::Unsubscribe { destination, reply } => {
                let _ = reply.send(self.unsubscribe(destination).await);
            }
            Command::Publish {
                destination,
                body,
                reply,
            } => {
                let frame = FrameBuilder::send(&destination)
                    .header("content-length", body.len().to_string())
                    .body(body)
                    .build();
                let _ = reply.send(self.transmit(frame).await);
            }
            Command::Ack { frame, reply } => {
                let _ = reply.send(self.acknowledge(&frame, false).await);
            }
            Command::Nack { frame, reply } => {
                let _ = reply.send(self.acknowledge(&frame, true).await);
            }
            Command::RegisterCallback {
                destination,
                callback,
                reply,
            } => {
                let handle = CallbackHandle(self.next_callback_id);
                self.next_callback_id += 1;
                self.callbacks
                    .entry(destination)
                    .or_default()
                    .push((handle, callback));
                let _ = reply.send(handle);
            }
            Command::RemoveCallback {
                destination,
                handle,
                reply,
            } => {
                let mut removed = false;
                if let Some(list) = self.callbacks.get_mut(&destination) {
                    let before = list.len();
                    list.retain(|(h, _)| *h != handle);
                    removed = list.len() != before;
                    if list.is_empty() {
                        self.callbacks.remove(&destination);
                    }
                }
                let _ = reply.send(removed);
            }
            Command::SetSendToCaller(enabled) => {
                self.send_to_caller = enabled;
            }
            Command::Disconnect { reply } => {
                let _ = reply.send(self.shutdown(true).await);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn subscribe(
        &mut self,
        destination: String,
        headers: Vec<(String, String)>,
        options: SubscribeOptions,
    ) -> Result<String, StompError> {
        if self.subscriptions.contains_key(&destination) {
            return Err(StompError::AlreadySubscribed(destination));
        }
        let id = headers
            .iter()
            .find(|(name, _)| name == "id")
            .map(|(_, value)| value.clone())
            .unwrap_or_else(|| {
                let id = self.next_subscription_id;
                self.next_subscription_id += 1;
                id.to_string()
            });
        let ack = headers
            .iter()
            .find(|(name, _)| name == "ack")
            .map(|(_, value)| AckMode::from_header(value))
            .unwrap_or_default();
        let extra = headers
            .into_iter()
            .filter(|(name, _)| name != "id" && name != "ack" && name != "destination");
        let frame = FrameBuilder::subscribe(&id, &destination, ack.as_str())
            .headers(extra)
            .build();
        self.transmit(frame).await?;
        self.subscriptions.insert(
            destination,
            SubscriptionEntry {
                id: id.clone(),
                ack,
                compressed: options.compressed,
            },
        );
        // the first subscription starts the pull loop
        if !self.pulling {
            self.pulling = true;
            self.receiver.request_next();
        }
        Ok(id)
    }

    async fn unsubscribe(&mut self, destination: String) -> Result<(), StompError> {
        let entry = self
            .subscriptions
            .remove(&destination)
            .ok_or_else(|| StompError::NotSubscribed(destination.clone()))?;
        debug!(
            %destination,
            id = %entry.id,
            ack = entry.ack.as_str(),
            "unsubscribed"
        );
        self.transmit(FrameBuilder::unsubscribe(&entry.id).build())
            .await
    }

    async fn acknowledge(&mut self, frame: &Frame, negative: bool) -> Result<(), StompError> {
        if negative && self.version == StompVersion::V1_0 {
            warn!("NACK is not part of STOMP 1.0, skipping");
            return Ok(());
        }
        let id_header = protocol::ack_header(self.version);
        let id = match frame.get_header(id_header) {
            Some(id) => id,
            None => {
                warn!(header = id_header, "frame carries no ack id, skipping");
                return Ok(());
            }
        };
        let mut builder = if negative {
            FrameBuilder::nack(self.version, id)
        } else {
            FrameBuilder::ack(self.version, id)
        };
        if let Some(subscription) = frame.get_header("subscription") {
            builder = builder.header("subscription", subscription);
        }
        self.transmit(builder.build()).await
    }

    async fn transmit(&mut self, frame: Frame) -> Result<(), StompError> {
        self.sink.send(StompItem::Frame(frame)).await
    }

    /// Route one inbound item, then pull the next.
    async fn dispatch(&mut self, item: StompItem) {
        match item {
            StompItem::Heartbeat => trace!("heartbeat from broker"),
            StompItem::Frame(frame) => {
                if frame.command == "MESSAGE" {
                    self.dispatch_message(frame).await;
                } else {
                    if frame.command == "ERROR" {
                        warn!(
                            message = frame.get_header("message").unwrap_or(""),
                            "broker sent ERROR frame"
                        );
                    }
                    let destination = frame
                        .get_header("destination")
                        .unwrap_or_default()
                        .to_string();
                    let _ = self
                        .caller_tx
                        .send(CallerMessage { destination, frame })
                        .await;
                }
            }
        }
        self.receiver.request_next();
    }

    async fn dispatch_message(&mut self, mut frame: Frame) {
        let destination = match frame.get_header("destination") {
            Some(destination) => destination.to_string(),
            None => {
                warn!("MESSAGE frame without destination header dropped");
                return;
            }
        };
        if let Some(entry) = self.subscriptions.get(&destination) {
            if entry.compressed {
                match decompress_gzip(&frame.body) {
                    Ok(body) => frame.body = body,
                    Err(error) => {
                        error!(%error, %destination, "dropping message with undecodable body");
                        return;
                    }
                }
            }
        }
        if self.send_to_caller {
            let _ = self
                .caller_tx
                .send(CallerMessage { destination, frame })
                .await;
        } else if let Some(list) = self.callbacks.get(&destination) {
            for (_, callback) in list {
                callback(&frame);
            }
        } else {
            debug!(%destination, "message arrived with no callbacks registered");
        }
    }

    async fn shutdown(&mut self, graceful: bool) -> Result<(), StompError> {
        let result = if graceful {
            self.transmit(FrameBuilder::disconnect().build()).await
        } else {
            Ok(())
        };
        self.receiver.stop();
        let _ = self.sink.close().await;
        self.subscriptions.clear();
        self.callbacks.clear();
        result
    }
}

/// Gzip-decode a compressed subscription body.
fn decompress_gzip(body: &[u8]) -> Result<Vec<u8>, StompError> {
    let mut decoder = GzDecoder::new(body);
    let mut decoded = Vec::new();
    decoder
        .read_to_end(&mut decoded)
        .map_err(|e| StompError::BodyDecompression(e.to_string()))?;
    Ok(decoded)
}
