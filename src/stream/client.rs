//! Realtime websocket client with automatic reconnect.
//!
//! A background worker owns the socket. Handles register listeners, send
//! best-effort messages while the channel is open, and observe the connection
//! state; nothing is queued across disconnects.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::retry::{with_timeout, ReconnectPolicy, DEFAULT_RECONNECT_DELAY};
use crate::stream::dispatch::ListenerRegistry;
use crate::stream::proto::ClientMessage;

/// Path of the realtime endpoint relative to the platform base URL.
pub const WS_PATH: &str = "/api/ws";
/// Query parameter carrying the bearer credential during the handshake.
pub const TOKEN_QUERY_PARAM: &str = "token";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RealtimeDefaults;

impl RealtimeDefaults {
    pub const RECONNECT_DELAY: Duration = DEFAULT_RECONNECT_DELAY;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Tunables for the realtime worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RealtimeOptions {
    /// Delay schedule between a disconnect and the next attempt.
    pub reconnect: ReconnectPolicy,
    /// Upper bound on a single websocket handshake.
    pub connect_timeout: Duration,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::Fixed(RealtimeDefaults::RECONNECT_DELAY),
            connect_timeout: RealtimeDefaults::CONNECT_TIMEOUT,
        }
    }
}

/// Lifecycle state of a realtime connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// No socket and no reconnect scheduled.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Socket open; `send` transmits.
    Open,
    /// Socket lost; waiting out the reconnect delay.
    ReconnectPending,
}

/// Entry point for creating realtime connections.
#[derive(Clone)]
pub struct RealtimeClient {
    base_url: String,
    token: SecretString,
    endpoint_override: Option<String>,
    options: RealtimeOptions,
}

impl RealtimeClient {
    /// Creates a client for the platform served at `base_url`
    /// (e.g. `https://iot.example.com`).
    pub fn new(base_url: impl Into<String>, token: SecretString) -> Self {
        Self {
            base_url: base_url.into().trim().to_string(),
            token,
            endpoint_override: None,
            options: RealtimeOptions::default(),
        }
    }

    /// Sets an explicit `ws://` or `wss://` endpoint.
    ///
    /// The override takes precedence over the base URL. The token is still
    /// appended as a query parameter.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim().to_string());
        self
    }

    pub fn with_options(mut self, options: RealtimeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.options.reconnect = policy;
        self
    }

    /// Starts the connection worker and returns a handle to it.
    ///
    /// Returns as soon as the worker is spawned; the first handshake happens
    /// in the background and transport failures only ever lead to reconnects.
    /// Errors are limited to an unusable endpoint. Must be called from within
    /// a tokio runtime.
    pub fn connect(&self) -> Result<RealtimeConnection, RealtimeError> {
        let endpoint = self.endpoint()?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let listeners = ListenerRegistry::new();

        let worker = ConnectionWorker {
            endpoint,
            token: self.token.clone(),
            options: self.options.clone(),
            commands: command_rx,
            listeners: listeners.clone(),
            state: state_tx,
        };
        tokio::spawn(worker.run());

        Ok(RealtimeConnection {
            commands: command_tx,
            state: state_rx,
            listeners,
        })
    }

    /// Resolves the websocket endpoint, without credentials.
    fn endpoint(&self) -> Result<Url, RealtimeError> {
        if let Some(endpoint) = self.endpoint_override.as_deref() {
            let url = Url::parse(endpoint)?;
            return match url.scheme() {
                "ws" | "wss" => Ok(url),
                other => Err(RealtimeError::InvalidEndpoint(format!(
                    "endpoint override must use ws or wss, got {other}"
                ))),
            };
        }

        let mut url = Url::parse(&self.base_url)?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(RealtimeError::InvalidEndpoint(format!(
                    "unsupported base url scheme {other}"
                )))
            }
        };
        url.set_scheme(scheme).map_err(|()| {
            RealtimeError::InvalidEndpoint(format!("cannot switch base url to {scheme}"))
        })?;
        let path = format!("{}{WS_PATH}", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }
}

/// Cloneable handle to a running realtime connection.
///
/// The worker stops when [`RealtimeConnection::close`] is called or every
/// handle has been dropped.
#[derive(Clone, Debug)]
pub struct RealtimeConnection {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    listeners: ListenerRegistry,
}

impl RealtimeConnection {
    /// Registers `callback` for every future inbound message tagged `kind`.
    ///
    /// Callbacks run on the connection worker, one message at a time, and
    /// should not block.
    pub fn on<F>(&self, kind: impl Into<String>, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.listeners.on(kind, callback);
    }

    /// Serializes and transmits `message` if the channel is open.
    ///
    /// While disconnected the message is dropped without error.
    pub fn send<T>(&self, message: &T)
    where
        T: Serialize + ?Sized,
    {
        if !self.is_open() {
            debug!(event = "ws_send_dropped", reason = "not_open");
            return;
        }

        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "ws_send_dropped", reason = "encode_failed", error = %err);
                return;
            }
        };

        if self.commands.send(Command::Send(text)).is_err() {
            debug!(event = "ws_send_dropped", reason = "worker_stopped");
        }
    }

    /// Declares the devices this client wants pushed updates for.
    pub fn subscribe<I, S>(&self, devices: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(&ClientMessage::subscribe(devices));
    }

    /// Clears the device filter so every permitted device is pushed.
    pub fn unsubscribe(&self) {
        self.send(&ClientMessage::Unsubscribe);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Returns a receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Waits until the channel is open.
    pub async fn wait_until_open(&self) -> Result<(), RealtimeError> {
        self.wait_for_state(ConnectionState::Open).await
    }

    /// Waits until the connection reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), RealtimeError> {
        let mut state = self.state.clone();
        loop {
            if *state.borrow_and_update() == target {
                return Ok(());
            }
            state
                .changed()
                .await
                .map_err(|_| RealtimeError::WorkerStopped)?;
        }
    }

    /// Returns the listener registry shared with the worker.
    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// Stops the worker; no further reconnects are attempted.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// Errors produced by realtime transport and configuration.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Endpoint could not be parsed.
    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),

    /// Endpoint parsed but cannot be used for a websocket connection.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Handshake did not complete in time.
    #[error("websocket handshake timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Connection worker has stopped.
    #[error("connection worker stopped")]
    WorkerStopped,
}

#[derive(Debug)]
enum Command {
    Send(String),
    Close,
}

enum SessionOutcome {
    Shutdown,
    Reconnect,
}

enum ConnectOutcome {
    Opened(Box<Socket>),
    Failed(RealtimeError),
    Shutdown,
}

struct ConnectionWorker {
    endpoint: Url,
    token: SecretString,
    options: RealtimeOptions,
    commands: mpsc::UnboundedReceiver<Command>,
    listeners: ListenerRegistry,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionWorker {
    async fn run(mut self) {
        let mut failures = 0usize;

        loop {
            self.set_state(ConnectionState::Connecting);
            let outcome = match self.open_socket().await {
                ConnectOutcome::Opened(socket) => {
                    failures = 0;
                    self.set_state(ConnectionState::Open);
                    info!(event = "ws_connected", endpoint = %self.endpoint);
                    self.run_session(*socket).await
                }
                ConnectOutcome::Failed(err) => {
                    warn!(event = "ws_connect_failed", endpoint = %self.endpoint, error = %err);
                    SessionOutcome::Reconnect
                }
                ConnectOutcome::Shutdown => SessionOutcome::Shutdown,
            };

            if let SessionOutcome::Shutdown = outcome {
                break;
            }

            failures += 1;
            let delay = self.options.reconnect.delay_for_attempt(failures);
            self.set_state(ConnectionState::ReconnectPending);
            warn!(
                event = "ws_reconnect_scheduled",
                attempt = failures,
                delay_ms = delay.as_millis() as u64
            );
            if !self.wait_reconnect_delay(delay).await {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!(event = "ws_worker_stopped", endpoint = %self.endpoint);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn authenticated_endpoint(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair(TOKEN_QUERY_PARAM, self.token.expose_secret());
        url
    }

    async fn open_socket(&mut self) -> ConnectOutcome {
        let url = self.authenticated_endpoint();
        let timeout = self.options.connect_timeout;
        let handshake = with_timeout(timeout, connect_async(url.as_str()));
        tokio::pin!(handshake);

        loop {
            tokio::select! {
                result = &mut handshake => {
                    return match result {
                        Ok(Ok((socket, _))) => ConnectOutcome::Opened(Box::new(socket)),
                        Ok(Err(err)) => ConnectOutcome::Failed(RealtimeError::WebSocket(err)),
                        Err(_) => ConnectOutcome::Failed(RealtimeError::ConnectTimeout(timeout)),
                    };
                }
                command = self.commands.recv() => match command {
                    Some(Command::Send(_)) => {
                        debug!(event = "ws_send_dropped", reason = "connecting");
                    }
                    Some(Command::Close) | None => return ConnectOutcome::Shutdown,
                }
            }
        }
    }

    async fn run_session(&mut self, mut socket: Socket) -> SessionOutcome {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Send(text)) => {
                        if let Err(err) = socket.send(Message::Text(text.into())).await {
                            warn!(event = "ws_send_failed", error = %err);
                            return SessionOutcome::Reconnect;
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = socket.close(None).await;
                        info!(event = "ws_closed", reason = "client_close");
                        return SessionOutcome::Shutdown;
                    }
                },
                inbound = socket.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        self.listeners.dispatch_text(text.as_str());
                    }
                    Some(Ok(Message::Binary(payload))) => {
                        warn!(event = "ws_binary_frame_dropped", len = payload.len());
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return SessionOutcome::Reconnect;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|frame| frame.reason.as_str().to_string())
                            .unwrap_or_default();
                        warn!(event = "ws_closed", reason = "server_close", detail = %reason);
                        return SessionOutcome::Reconnect;
                    }
                    Some(Err(err)) => {
                        warn!(event = "ws_closed", reason = "transport_error", error = %err);
                        return SessionOutcome::Reconnect;
                    }
                    None => {
                        warn!(event = "ws_closed", reason = "stream_ended");
                        return SessionOutcome::Reconnect;
                    }
                }
            }
        }
    }

    /// Sleeps out the reconnect delay, dropping anything sent meanwhile.
    ///
    /// Returns `false` when the connection was closed during the wait.
    async fn wait_reconnect_delay(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Send(_)) => {
                        debug!(event = "ws_send_dropped", reason = "reconnect_pending");
                    }
                    Some(Command::Close) | None => return false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secrecy::SecretString;

    use super::{ConnectionState, RealtimeClient, RealtimeError, RealtimeOptions};
    use crate::retry::ReconnectPolicy;

    fn token() -> SecretString {
        SecretString::from("test-token".to_string())
    }

    #[test]
    fn https_base_url_maps_to_wss_endpoint() {
        let client = RealtimeClient::new("https://iot.example.com", token());
        assert_eq!(
            client.endpoint().expect("endpoint").as_str(),
            "wss://iot.example.com/api/ws"
        );
    }

    #[test]
    fn http_base_url_maps_to_ws_endpoint_and_keeps_port() {
        let client = RealtimeClient::new("http://localhost:8000/", token());
        assert_eq!(
            client.endpoint().expect("endpoint").as_str(),
            "ws://localhost:8000/api/ws"
        );
    }

    #[test]
    fn base_url_prefix_path_is_preserved() {
        let client = RealtimeClient::new("https://example.com/iot/", token());
        assert_eq!(
            client.endpoint().expect("endpoint").as_str(),
            "wss://example.com/iot/api/ws"
        );
    }

    #[test]
    fn endpoint_override_takes_precedence() {
        let client = RealtimeClient::new("https://iot.example.com", token())
            .with_endpoint("ws://127.0.0.1:9000/custom/ws   \n");
        assert_eq!(
            client.endpoint().expect("endpoint").as_str(),
            "ws://127.0.0.1:9000/custom/ws"
        );
    }

    #[test]
    fn endpoint_override_rejects_http_scheme() {
        let client = RealtimeClient::new("https://iot.example.com", token())
            .with_endpoint("http://127.0.0.1:9000/api/ws");
        assert!(matches!(
            client.endpoint(),
            Err(RealtimeError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn unsupported_base_scheme_is_rejected() {
        let client = RealtimeClient::new("ftp://iot.example.com", token());
        assert!(matches!(
            client.endpoint(),
            Err(RealtimeError::InvalidEndpoint(_))
        ));
        let client = RealtimeClient::new("not a url", token());
        assert!(matches!(client.endpoint(), Err(RealtimeError::Url(_))));
    }

    #[test]
    fn default_options_use_fixed_three_second_reconnect() {
        let options = RealtimeOptions::default();
        assert_eq!(
            options.reconnect,
            ReconnectPolicy::Fixed(Duration::from_secs(3))
        );
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn send_before_open_is_silently_dropped() {
        // Port 9 (discard) is not expected to accept websocket handshakes.
        let client = RealtimeClient::new("http://127.0.0.1:9", token()).with_options(
            RealtimeOptions {
                reconnect: ReconnectPolicy::Fixed(Duration::from_secs(60)),
                connect_timeout: Duration::from_millis(200),
            },
        );
        let connection = client.connect().expect("connect");

        assert_eq!(connection.state(), ConnectionState::Connecting);
        assert!(
            tokio::time::timeout(
                Duration::from_millis(100),
                connection.wait_for_state(ConnectionState::Disconnected),
            )
            .await
            .is_err(),
            "a freshly started worker is not disconnected"
        );
        assert!(!connection.is_open());
        connection.subscribe(["d1"]);
        connection.send(&serde_json::json!({"type": "subscribe", "devices": ["d1"]}));

        connection
            .wait_for_state(ConnectionState::ReconnectPending)
            .await
            .expect("reconnect pending");
        connection.close();
        connection
            .wait_for_state(ConnectionState::Disconnected)
            .await
            .expect("disconnected");
    }
}
