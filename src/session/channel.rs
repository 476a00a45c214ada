//! Duplex session channel to the speech-dialogue service

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::events::{ChannelEvent, EventSender};
use super::wire::{RealtimeInputMessage, ServerMessage, SetupMessage};
use crate::config::{Config, SessionConfig};
use crate::voice::AudioFrame;
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// A duplex session with the remote service
///
/// Completion and inbound traffic are reported through the [`EventSender`]
/// given to `connect`, never as return values.
pub trait SessionChannel {
    /// Open the session asynchronously
    ///
    /// Returns once the attempt is under way; `ChannelEvent::Opened` signals
    /// readiness.
    ///
    /// # Errors
    ///
    /// Returns `ConnectFailed` for problems detectable before any I/O
    fn connect(&mut self, config: &SessionConfig, events: EventSender) -> Result<()>;

    /// Queue one frame for transmission. Never blocks; failures surface as
    /// `ChannelEvent::Error`.
    fn send(&mut self, frame: &AudioFrame);

    /// Request graceful termination. Idempotent; aborts a pending connect.
    fn close(&mut self);
}

/// Live API session over a WebSocket
pub struct LiveChannel {
    endpoint: String,
    api_key: Option<SecretString>,
    connect_timeout: Duration,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    task: Option<JoinHandle<()>>,
    opened: Arc<AtomicBool>,
    closed: bool,
}

impl LiveChannel {
    #[must_use]
    pub fn new(endpoint: String, api_key: Option<SecretString>, connect_timeout: Duration) -> Self {
        // rustls needs a process-level provider; a second install is harmless
        let _ = rustls::crypto::ring::default_provider().install_default();

        Self {
            endpoint,
            api_key,
            connect_timeout,
            outbound: None,
            task: None,
            opened: Arc::new(AtomicBool::new(false)),
            closed: false,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.endpoint.clone(),
            config.api_key.clone(),
            config.connect_timeout,
        )
    }

    /// Endpoint URL with the API key attached
    fn request_url(&self) -> Result<Url> {
        let key = self
            .api_key
            .as_ref()
            .ok_or_else(|| Error::ConnectFailed("no API key configured".to_string()))?;

        let url = Url::parse_with_params(&self.endpoint, &[("key", key.expose_secret())])
            .map_err(|e| Error::ConnectFailed(format!("invalid endpoint: {e}")))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::ConnectFailed(format!(
                "endpoint must be ws:// or wss://, got {}://",
                url.scheme()
            )));
        }
        Ok(url)
    }
}

impl SessionChannel for LiveChannel {
    fn connect(&mut self, config: &SessionConfig, events: EventSender) -> Result<()> {
        if self.closed || self.task.is_some() {
            return Err(Error::ConnectFailed("channel already used".to_string()));
        }

        let url = self.request_url()?;
        let setup = serde_json::to_string(&SetupMessage::new(config))
            .map_err(|e| Error::ConnectFailed(format!("cannot encode setup: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let opened = Arc::clone(&self.opened);

        tracing::debug!(
            host = url.host_str().unwrap_or_default(),
            model = %config.model,
            voice = %config.voice,
            session = %events.session(),
            "connecting live session"
        );

        self.task = Some(tokio::spawn(run_connection(
            url,
            setup,
            rx,
            events,
            self.connect_timeout,
            opened,
        )));
        self.outbound = Some(tx);
        Ok(())
    }

    fn send(&mut self, frame: &AudioFrame) {
        let Some(outbound) = &self.outbound else {
            tracing::trace!("send on closed channel ignored");
            return;
        };

        match serde_json::to_string(&RealtimeInputMessage::from_frame(frame)) {
            Ok(json) => {
                if outbound.send(Message::Text(json)).is_err() {
                    tracing::trace!("connection task ended, frame dropped");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode frame"),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // Dropping the sender asks the writer to send a close frame
        self.outbound = None;

        let Some(task) = self.task.take() else {
            return;
        };
        if !self.opened.load(Ordering::Acquire) {
            task.abort();
            tracing::debug!("pending connect aborted");
            return;
        }

        // The task drains the close handshake within the connect timeout on
        // its own; this is the backstop for a writer stuck on a dead peer
        let grace = self.connect_timeout * 2;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(reap(task, grace));
            }
            Err(_) => task.abort(),
        }
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connect, negotiate, then pump frames both ways until either side closes
async fn run_connection(
    url: Url,
    setup: String,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: EventSender,
    connect_timeout: Duration,
    opened: Arc<AtomicBool>,
) {
    let attempt = tokio::time::timeout(connect_timeout, handshake(&url, setup)).await;
    let (mut writer, mut reader) = match attempt {
        Ok(Ok(halves)) => halves,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "live session handshake failed");
            events.channel(ChannelEvent::Error(e));
            return;
        }
        Err(_) => {
            events.channel(ChannelEvent::Error(Error::ConnectFailed(format!(
                "no setup response within {connect_timeout:?}"
            ))));
            return;
        }
    };

    opened.store(true, Ordering::Release);
    events.channel(ChannelEvent::Opened);

    loop {
        tokio::select! {
            out = outbound.recv() => {
                let Some(msg) = out else {
                    // Local close requested
                    break;
                };
                if let Err(e) = writer.send(msg).await {
                    events.channel(ChannelEvent::Error(Error::Transport(e.to_string())));
                    return;
                }
            }
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(
                        reason = frame.as_ref().map(|f| f.reason.to_string()).unwrap_or_default(),
                        "live session closed"
                    );
                    events.channel(ChannelEvent::Closed);
                    return;
                }
                Some(Ok(msg)) => dispatch_inbound(&msg, &events),
                Some(Err(e)) => {
                    events.channel(ChannelEvent::Error(Error::Transport(e.to_string())));
                    return;
                }
                None => {
                    events.channel(ChannelEvent::Closed);
                    return;
                }
            }
        }
    }

    let drained = tokio::time::timeout(connect_timeout, drain(&mut writer, &mut reader)).await;
    if drained.is_err() {
        tracing::debug!(?connect_timeout, "peer did not acknowledge close, dropping socket");
    }
    events.channel(ChannelEvent::Closed);
}

/// Send a close frame and wait for the peer's reply or end of stream
async fn drain(writer: &mut WsWriter, reader: &mut WsReader) {
    if let Err(e) = writer.send(Message::Close(None)).await {
        tracing::debug!(error = %e, "close frame not sent");
        return;
    }
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => return,
            // Late model output is discarded once closing
            Ok(_) => {}
        }
    }
}

/// Abort a detached connection task that outlives `grace`
async fn reap(mut task: JoinHandle<()>, grace: Duration) {
    if tokio::time::timeout(grace, &mut task).await.is_err() {
        task.abort();
        tracing::debug!("connection task aborted after close");
    }
}

/// Open the socket, send `setup` and wait for `setupComplete`
async fn handshake(url: &Url, setup: String) -> Result<(WsWriter, WsReader)> {
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| Error::ConnectFailed(e.to_string()))?;
    let (mut writer, mut reader) = ws.split();

    writer
        .send(Message::Text(setup))
        .await
        .map_err(|e| Error::ConnectFailed(format!("failed to send setup: {e}")))?;

    while let Some(msg) = reader.next().await {
        let msg = msg.map_err(|e| Error::ConnectFailed(e.to_string()))?;
        match msg {
            Message::Close(frame) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                return Err(Error::ConnectFailed(format!("rejected by service: {reason}")));
            }
            msg => {
                if let Some(Ok(server)) = payload(&msg).map(ServerMessage::parse) {
                    if server.is_setup_complete() {
                        return Ok((writer, reader));
                    }
                }
            }
        }
    }

    Err(Error::ConnectFailed("connection closed during setup".to_string()))
}

/// JSON bytes carried by a data frame
fn payload(msg: &Message) -> Option<&[u8]> {
    match msg {
        Message::Text(text) => Some(text.as_bytes()),
        Message::Binary(data) => Some(data.as_slice()),
        _ => None,
    }
}

/// Translate one server message into channel events, in message order
fn dispatch_inbound(msg: &Message, events: &EventSender) {
    let Some(bytes) = payload(msg) else {
        return;
    };

    let server = match ServerMessage::parse(bytes) {
        Ok(server) => server,
        Err(e) => {
            events.channel(ChannelEvent::Error(e));
            return;
        }
    };

    if server.is_interrupted() {
        events.channel(ChannelEvent::Interrupted);
    }

    if let Some(audio) = server.first_audio() {
        match audio.to_frame() {
            Ok(frame) => events.channel(ChannelEvent::Audio(frame)),
            Err(e) => events.channel(ChannelEvent::Error(e)),
        }
    }

    if server.is_turn_complete() {
        events.channel(ChannelEvent::TurnComplete);
    }

    if let Some(go_away) = &server.go_away {
        tracing::warn!(time_left = ?go_away.time_left, "service will close the session soon");
    }
}
