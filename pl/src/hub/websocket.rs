//! WebSocket hub client
//!
//! Connects straight to the hub's WebSocket endpoint (no negotiate request),
//! performs the JSON protocol handshake and then runs a driver task that owns
//! the socket. The driver forwards server invocations to the event sink,
//! routes completions to waiting `invoke` calls, sends keep-alive pings and
//! reconnects on its own when the socket drops.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{HandshakeRequest, HandshakeResponse, HubMessage, split_frames};
use super::retry::RetryPolicy;
use super::{ConnectionId, EventSink, HubConnection, HubConnectionFactory, TransportError, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingInvocations = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value, TransportError>>>>>;

/// Timing and retry settings for a hub connection
#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Reconnect schedule after an unexpected drop
    pub retry: RetryPolicy,

    /// Interval between keep-alive pings
    pub keep_alive: Duration,

    /// Silence from the server after which the socket counts as dropped
    pub server_timeout: Duration,

    /// Limit for opening the socket and completing the handshake
    pub handshake_timeout: Duration,

    /// Limit for waiting on an invocation's completion
    pub invoke_timeout: Duration,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            keep_alive: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
            invoke_timeout: Duration::from_secs(30),
        }
    }
}

/// Build the hub's WebSocket URL from an HTTP(S) API base
///
/// `http://host:5000/` + `/hubs/protocol` becomes `ws://host:5000/hubs/protocol`.
/// `ws://` and `wss://` bases are accepted as-is.
pub fn websocket_url(api_base: &str, hub_path: &str) -> Result<String, TransportError> {
    let base = api_base.trim().trim_end_matches('/');
    let (scheme, rest) = base
        .split_once("://")
        .ok_or_else(|| TransportError::InvalidUrl(format!("{api_base}: missing scheme")))?;

    let ws_scheme = match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(TransportError::InvalidUrl(format!("unsupported scheme '{other}'"))),
    };

    if rest.is_empty() {
        return Err(TransportError::InvalidUrl(format!("{api_base}: missing host")));
    }

    let path = hub_path.trim_start_matches('/');
    Ok(format!("{ws_scheme}://{rest}/{path}"))
}

enum Phase {
    Idle,
    Starting,
    Running {
        outbound: mpsc::UnboundedSender<Outbound>,
        driver: JoinHandle<()>,
    },
    Stopped,
}

enum Outbound {
    Invoke { invocation_id: String, frame: String },
    Stop,
}

/// Hub connection over a WebSocket
pub struct WsHubConnection {
    id: ConnectionId,
    url: String,
    options: HubOptions,
    sink: EventSink,
    phase: Mutex<Phase>,
    pending: PendingInvocations,
}

impl WsHubConnection {
    pub fn new(id: ConnectionId, url: impl Into<String>, options: HubOptions, sink: EventSink) -> Self {
        let url = url.into();
        debug!(connection = %id, %url, "WsHubConnection::new");
        Self {
            id,
            url,
            options,
            sink,
            phase: Mutex::new(Phase::Idle),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HubConnection for WsHubConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn start(&self) -> Result<(), TransportError> {
        {
            let mut phase = self.phase.lock().await;
            match &*phase {
                Phase::Idle => {}
                Phase::Stopped => return Err(TransportError::Closed(Some("connection was stopped".to_string()))),
                Phase::Starting | Phase::Running { .. } => return Err(TransportError::AlreadyStarted),
            }
            *phase = Phase::Starting;
        }

        info!(connection = %self.id, url = %self.url, "Starting hub connection");
        match connect_and_handshake(&self.url, &self.options).await {
            Ok((ws, leftover)) => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let driver = Driver {
                    id: self.id,
                    url: self.url.clone(),
                    options: self.options.clone(),
                    sink: self.sink.clone(),
                    pending: self.pending.clone(),
                };
                let handle = tokio::spawn(driver.run(ws, leftover, outbound_rx));
                *self.phase.lock().await = Phase::Running {
                    outbound: outbound_tx,
                    driver: handle,
                };
                info!(connection = %self.id, "Hub connection started");
                Ok(())
            }
            Err(e) => {
                warn!(connection = %self.id, error = %e, "Hub connection failed to start");
                *self.phase.lock().await = Phase::Idle;
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let previous = {
            let mut phase = self.phase.lock().await;
            if matches!(*phase, Phase::Starting) {
                return Err(TransportError::StopDuringStart);
            }
            std::mem::replace(&mut *phase, Phase::Stopped)
        };

        if let Phase::Running { outbound, driver } = previous {
            debug!(connection = %self.id, "WsHubConnection::stop: stopping driver");
            // The driver may already be gone after giving up on reconnects
            let _ = outbound.send(Outbound::Stop);
            if let Err(e) = driver.await {
                warn!(connection = %self.id, error = %e, "Hub driver task failed");
            }
            info!(connection = %self.id, "Hub connection stopped");
        }
        Ok(())
    }

    async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<Value, TransportError> {
        let outbound = match &*self.phase.lock().await {
            Phase::Running { outbound, .. } => outbound.clone(),
            _ => return Err(TransportError::NotConnected),
        };

        let invocation_id = Uuid::now_v7().to_string();
        debug!(connection = %self.id, %target, %invocation_id, "WsHubConnection::invoke");
        let frame = HubMessage::Invocation {
            invocation_id: Some(invocation_id.clone()),
            target: target.to_string(),
            arguments,
        }
        .encode()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(invocation_id.clone(), reply_tx);

        if outbound
            .send(Outbound::Invoke {
                invocation_id: invocation_id.clone(),
                frame,
            })
            .is_err()
        {
            self.pending.lock().await.remove(&invocation_id);
            return Err(TransportError::NotConnected);
        }

        match tokio::time::timeout(self.options.invoke_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed(None)),
            Err(_) => {
                self.pending.lock().await.remove(&invocation_id);
                Err(TransportError::Timeout(format!("{target} completion")))
            }
        }
    }
}

/// Creates [`WsHubConnection`]s for one hub URL
#[derive(Debug, Clone)]
pub struct WsHubFactory {
    url: String,
    options: HubOptions,
}

impl WsHubFactory {
    pub fn new(url: impl Into<String>, options: HubOptions) -> Self {
        Self {
            url: url.into(),
            options,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl HubConnectionFactory for WsHubFactory {
    fn create(&self, id: ConnectionId, sink: EventSink) -> Arc<dyn HubConnection> {
        Arc::new(WsHubConnection::new(id, self.url.clone(), self.options.clone(), sink))
    }
}

/// Open the socket and complete the JSON protocol handshake
///
/// Messages that arrive in the same frame as the handshake response are
/// returned so the caller can process them first.
async fn connect_and_handshake(url: &str, options: &HubOptions) -> Result<(WsStream, Vec<HubMessage>), TransportError> {
    let (mut ws, _response) = tokio::time::timeout(options.handshake_timeout, connect_async(url))
        .await
        .map_err(|_| TransportError::Timeout("connection".to_string()))?
        .map_err(|e| TransportError::Connect {
            url: url.to_string(),
            message: e.to_string(),
        })?;

    ws.send(Message::text(HandshakeRequest::default().encode()?))
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;

    let text = tokio::time::timeout(options.handshake_timeout, read_text(&mut ws))
        .await
        .map_err(|_| TransportError::Timeout("handshake response".to_string()))??;

    let mut frames = split_frames(&text)?.into_iter();
    let first = frames
        .next()
        .ok_or_else(|| TransportError::Handshake("empty handshake response".to_string()))?;
    if let Some(error) = HandshakeResponse::decode(first)?.error {
        return Err(TransportError::Handshake(error));
    }

    let leftover = frames.map(HubMessage::decode).collect::<Result<Vec<_>, _>>()?;
    debug!(%url, leftover = leftover.len(), "connect_and_handshake: handshake complete");
    Ok((ws, leftover))
}

async fn read_text(ws: &mut WsStream) -> Result<String, TransportError> {
    while let Some(message) = ws.next().await {
        match message.map_err(|e| TransportError::Handshake(e.to_string()))? {
            Message::Text(text) => return Ok(text.as_str().to_string()),
            Message::Binary(_) => {
                return Err(TransportError::Protocol("binary frames are not supported".to_string()));
            }
            Message::Close(_) => break,
            _ => continue,
        }
    }
    Err(TransportError::Handshake("socket closed during handshake".to_string()))
}

enum SessionEnd {
    Stopped,
    Dropped(String),
    ServerClosed { error: Option<String>, allow_reconnect: bool },
}

enum Reconnect {
    Connected(WsStream, Vec<HubMessage>),
    Stopped,
    GaveUp(Option<String>),
}

/// Owns the socket of a running connection
struct Driver {
    id: ConnectionId,
    url: String,
    options: HubOptions,
    sink: EventSink,
    pending: PendingInvocations,
}

impl Driver {
    async fn run(self, ws: WsStream, leftover: Vec<HubMessage>, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        let mut ws = ws;
        let mut leftover = leftover;

        loop {
            let end = self.session(ws, std::mem::take(&mut leftover), &mut outbound).await;
            self.fail_pending("connection lost").await;

            let error = match end {
                SessionEnd::Stopped => {
                    self.sink.emit(TransportEvent::Closed { error: None });
                    return;
                }
                SessionEnd::ServerClosed {
                    error,
                    allow_reconnect: false,
                } => {
                    info!(connection = %self.id, ?error, "Hub closed the connection");
                    self.sink.emit(TransportEvent::Closed { error });
                    return;
                }
                SessionEnd::ServerClosed {
                    error,
                    allow_reconnect: true,
                } => error,
                SessionEnd::Dropped(error) => Some(error),
            };

            warn!(connection = %self.id, ?error, "Hub connection lost, reconnecting");
            self.sink.emit(TransportEvent::Reconnecting { error: error.clone() });

            match self.reconnect(&mut outbound).await {
                Reconnect::Connected(new_ws, new_leftover) => {
                    info!(connection = %self.id, "Hub connection re-established");
                    self.sink.emit(TransportEvent::Reconnected);
                    ws = new_ws;
                    leftover = new_leftover;
                }
                Reconnect::Stopped => {
                    self.sink.emit(TransportEvent::Closed { error: None });
                    return;
                }
                Reconnect::GaveUp(last_error) => {
                    warn!(connection = %self.id, ?last_error, "Giving up on reconnecting");
                    self.sink.emit(TransportEvent::Closed {
                        error: last_error.or(error),
                    });
                    return;
                }
            }
        }
    }

    async fn session(
        &self,
        ws: WsStream,
        leftover: Vec<HubMessage>,
        outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> SessionEnd {
        let (mut writer, mut reader) = ws.split();

        for message in leftover {
            if let Some(end) = self.handle_message(message).await {
                return end;
            }
        }

        let keep_alive = self.options.keep_alive.max(Duration::from_millis(1));
        let mut ping = tokio::time::interval_at(Instant::now() + keep_alive, keep_alive);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                msg = outbound.recv() => match msg {
                    None | Some(Outbound::Stop) => {
                        let _ = writer.send(Message::Close(None)).await;
                        return SessionEnd::Stopped;
                    }
                    Some(Outbound::Invoke { invocation_id, frame }) => {
                        if let Err(e) = writer.send(Message::text(frame)).await {
                            self.reject(&invocation_id, TransportError::Closed(Some(e.to_string()))).await;
                            return SessionEnd::Dropped(e.to_string());
                        }
                    }
                },
                frame = reader.next() => match frame {
                    None => return SessionEnd::Dropped("socket closed by server".to_string()),
                    Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        match HubMessage::decode_all(text.as_str()) {
                            Ok(messages) => {
                                for message in messages {
                                    if let Some(end) = self.handle_message(message).await {
                                        return end;
                                    }
                                }
                            }
                            Err(e) => warn!(connection = %self.id, error = %e, "Ignoring malformed hub frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) => return SessionEnd::Dropped("socket closed by server".to_string()),
                    Some(Ok(Message::Binary(_))) => {
                        last_seen = Instant::now();
                        warn!(connection = %self.id, "Ignoring binary frame");
                    }
                    Some(Ok(_)) => last_seen = Instant::now(),
                },
                _ = ping.tick() => {
                    match HubMessage::Ping.encode() {
                        Ok(frame) => {
                            if let Err(e) = writer.send(Message::text(frame)).await {
                                return SessionEnd::Dropped(e.to_string());
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to encode ping"),
                    }
                },
                _ = tokio::time::sleep_until(last_seen + self.options.server_timeout) => {
                    return SessionEnd::Dropped(format!(
                        "no message from server within {:?}",
                        self.options.server_timeout
                    ));
                }
            }
        }
    }

    /// Returns the end of the session if the message closes it
    async fn handle_message(&self, message: HubMessage) -> Option<SessionEnd> {
        match message {
            HubMessage::Invocation { target, arguments, .. } => {
                self.sink.emit(TransportEvent::Invocation { target, arguments });
                None
            }
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let waiter = self.pending.lock().await.remove(&invocation_id);
                match waiter {
                    Some(reply_tx) => {
                        let outcome = match error {
                            Some(error) => Err(TransportError::Invocation(error)),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        let _ = reply_tx.send(outcome);
                    }
                    None => debug!(%invocation_id, "Completion for unknown invocation"),
                }
                None
            }
            HubMessage::Ping => None,
            HubMessage::Close { error, allow_reconnect } => Some(SessionEnd::ServerClosed { error, allow_reconnect }),
            HubMessage::Unsupported(kind) => {
                debug!(kind, "Ignoring unsupported hub message");
                None
            }
        }
    }

    async fn reconnect(&self, outbound: &mut mpsc::UnboundedReceiver<Outbound>) -> Reconnect {
        let mut attempts = 0u32;
        let mut last_error = None;

        loop {
            let Some(delay) = self.options.retry.next_delay(attempts) else {
                return Reconnect::GaveUp(last_error);
            };
            debug!(connection = %self.id, attempt = attempts + 1, ?delay, "Driver::reconnect: waiting");
            if self.unless_stopped(tokio::time::sleep(delay), outbound).await.is_none() {
                return Reconnect::Stopped;
            }

            attempts += 1;
            match self
                .unless_stopped(connect_and_handshake(&self.url, &self.options), outbound)
                .await
            {
                None => return Reconnect::Stopped,
                Some(Ok((ws, leftover))) => return Reconnect::Connected(ws, leftover),
                Some(Err(e)) => {
                    warn!(connection = %self.id, attempt = attempts, error = %e, "Reconnect attempt failed");
                    last_error = Some(e.to_string());
                }
            }
        }
    }

    /// Drive `fut` while answering outbound requests; `None` if stopped first
    async fn unless_stopped<F: Future>(
        &self,
        fut: F,
        outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return Some(output),
                msg = outbound.recv() => match msg {
                    None | Some(Outbound::Stop) => return None,
                    Some(Outbound::Invoke { invocation_id, .. }) => {
                        self.reject(&invocation_id, TransportError::NotConnected).await;
                    }
                },
            }
        }
    }

    async fn reject(&self, invocation_id: &str, error: TransportError) {
        if let Some(reply_tx) = self.pending.lock().await.remove(invocation_id) {
            let _ = reply_tx.send(Err(error));
        }
    }

    async fn fail_pending(&self, reason: &str) {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        for (invocation_id, reply_tx) in drained {
            debug!(%invocation_id, %reason, "Failing pending invocation");
            let _ = reply_tx.send(Err(TransportError::Closed(Some(reason.to_string()))));
        }
    }
}
