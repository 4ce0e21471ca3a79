/// WebSocket driver for the signal server connection
///
/// A single task owns the socket, the refresh/keepalive timers and the reconnect
/// timer, and applies the effects produced by [`ConnectionMachine`].

use crate::shared::{
    connection::{
        Backoff, ConnectionCounters, ConnectionEvent, ConnectionMachine, ConnectionState, Effect,
        Epoch, ABNORMAL_CLOSURE, NO_STATUS_RECEIVED,
    },
    error::SignalError,
    types::{InboundMessage, OutboundMessage},
};
use futures::{future::BoxFuture, FutureExt, SinkExt, StreamExt};
use serde::Serialize;
use std::{collections::VecDeque, pin::Pin, time::Duration};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior, Sleep},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

const LOCAL_ENDPOINT: &str = "ws://localhost:8765";
const PRODUCTION_ENDPOINT: &str = "ws://websocket.impviz.com";
const PRODUCTION_SECURE_ENDPOINT: &str = "wss://websocket.impviz.com";

/// Upper bound on the close handshake before the socket is dropped
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingConnect = BoxFuture<'static, Result<WsStream, WsError>>;

/// Deployment the signal server is reached in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    Local,
    #[default]
    Production,
}

impl Environment {
    /// Endpoint URL; `secure` selects TLS for production
    pub fn endpoint(&self, secure: bool) -> &'static str {
        match (self, secure) {
            (Environment::Local, _) => LOCAL_ENDPOINT,
            (Environment::Production, false) => PRODUCTION_ENDPOINT,
            (Environment::Production, true) => PRODUCTION_SECURE_ENDPOINT,
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "local" | "dev" | "development" => Some(Environment::Local),
            "prod" | "production" => Some(Environment::Production),
            _ => None,
        }
    }
}

/// WebSocket client configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// WebSocket server URL
    pub url: String,
    /// Interval between `get_latest` requests while connected
    pub refresh_interval: Duration,
    /// Interval between `ping` requests while connected
    pub keepalive_interval: Duration,
    /// First reconnect delay
    pub backoff_base: Duration,
    /// Reconnect delay cap
    pub backoff_max: Duration,
    /// Retry delay after the socket could not be created at all
    pub connect_retry_delay: Duration,
    /// Maximum channel buffer size for inbound messages
    pub channel_buffer_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: Environment::default().endpoint(false).to_string(),
            refresh_interval: Duration::from_secs(8),
            keepalive_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            connect_retry_delay: Duration::from_secs(5),
            channel_buffer_size: 1000,
        }
    }
}

impl WebSocketConfig {
    /// Create a new configuration with custom URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Create a configuration pointing at an environment's endpoint
    pub fn for_environment(environment: Environment, secure: bool) -> Self {
        Self::new(environment.endpoint(secure))
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set reconnect backoff base and cap
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_connect_retry_delay(mut self, delay: Duration) -> Self {
        self.connect_retry_delay = delay;
        self
    }

    /// Set channel buffer size
    pub fn with_channel_buffer_size(mut self, size: usize) -> Self {
        self.channel_buffer_size = size;
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_base, self.backoff_max)
    }

    /// Check the endpoint is a ws:// or wss:// URL with a host, and that the timers
    /// and channel are usable.
    pub fn validate(&self) -> Result<Url, SignalError> {
        let invalid = |reason: String| SignalError::InvalidEndpoint {
            url: self.url.clone(),
            reason,
        };

        let url = Url::parse(&self.url).map_err(|error| invalid(error.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(invalid(format!("unsupported scheme {}", url.scheme())));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(invalid("missing host".to_string()));
        }

        for (name, value) in [
            ("refresh_interval", self.refresh_interval),
            ("keepalive_interval", self.keepalive_interval),
        ] {
            if value.is_zero() {
                return Err(SignalError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        if self.channel_buffer_size == 0 {
            return Err(SignalError::InvalidConfig(
                "channel_buffer_size must be non-zero".to_string(),
            ));
        }

        Ok(url)
    }
}

/// Latest connection state and counters, published on every change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub counters: ConnectionCounters,
}

#[derive(Debug)]
enum Command {
    Connect,
    Send(OutboundMessage),
    Dispose,
}

/// Handle to the connection task.
///
/// Dropping the handle without [`ConnectionManager::dispose`] still tears the
/// connection down, but without waiting for it.
#[derive(Debug)]
pub struct ConnectionManager {
    command_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<ConnectionStatus>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Validate the config, spawn the connection task and start connecting.
    ///
    /// Returns the manager and a receiver yielding inbound messages in transport order.
    pub fn start(
        config: WebSocketConfig,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>), SignalError> {
        let url = config.validate()?;
        let (message_tx, message_rx) = mpsc::channel(config.channel_buffer_size);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());

        let driver = Driver {
            machine: ConnectionMachine::new(
                url.as_str(),
                config.backoff(),
                config.connect_retry_delay,
            ),
            config,
            url,
            connecting: None,
            session: None,
            refresh: None,
            keepalive: None,
            reconnect: None,
            message_tx,
            command_rx,
            status_tx,
        };
        let task = tokio::spawn(driver.run());

        let manager = Self {
            command_tx,
            status_rx,
            task: Some(task),
        };
        Ok((manager, message_rx))
    }

    /// Current connection state and counters
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    /// Receiver notified on every status change
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Connect if not already connected or connecting
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Send a request; dropped and counted while not connected
    pub fn send(&self, message: OutboundMessage) {
        self.command(Command::Send(message));
    }

    /// Cancel timers, close the socket with a normal closure and wait for the task.
    ///
    /// Calling it again is a no-op.
    pub async fn dispose(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        self.command(Command::Dispose);
        if let Err(error) = task.await {
            warn!(%error, "Signal connection task ended abnormally");
        }
    }

    fn command(&self, command: Command) {
        if let Err(error) = self.command_tx.send(command) {
            debug!(command = ?error.0, "Signal connection task already stopped");
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.command_tx.send(Command::Dispose);
        }
    }
}

/// What woke the driver loop
enum Wake {
    Command(Option<Command>),
    Connected(Epoch, Result<WsStream, WsError>),
    Frame(Epoch, Option<Result<Message, WsError>>),
    Refresh(Epoch),
    Keepalive(Epoch),
    ReconnectDue(Epoch),
}

struct Driver {
    machine: ConnectionMachine,
    config: WebSocketConfig,
    url: Url,
    connecting: Option<(Epoch, PendingConnect)>,
    session: Option<(Epoch, WsStream)>,
    refresh: Option<(Epoch, Interval)>,
    keepalive: Option<(Epoch, Interval)>,
    reconnect: Option<(Epoch, Pin<Box<Sleep>>)>,
    message_tx: mpsc::Sender<InboundMessage>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl Driver {
    async fn run(mut self) {
        info!(url = %self.url, "Starting signal connection task");
        let mut pending = VecDeque::from([ConnectionEvent::Connect]);

        loop {
            while let Some(event) = pending.pop_front() {
                for effect in self.machine.handle(event) {
                    self.apply(effect, &mut pending).await;
                }
            }
            self.publish();

            if self.machine.is_disposed() {
                break;
            }

            let wake = tokio::select! {
                command = self.command_rx.recv() => Wake::Command(command),
                (epoch, result) = next_connect(&mut self.connecting) => {
                    Wake::Connected(epoch, result)
                }
                (epoch, frame) = next_frame(&mut self.session) => Wake::Frame(epoch, frame),
                epoch = next_tick(&mut self.refresh) => Wake::Refresh(epoch),
                epoch = next_tick(&mut self.keepalive) => Wake::Keepalive(epoch),
                epoch = next_deadline(&mut self.reconnect) => Wake::ReconnectDue(epoch),
            };

            self.on_wake(wake, &mut pending).await;
        }

        info!(url = %self.url, "Signal connection task stopped");
    }

    /// Translate a wake-up into state machine events
    async fn on_wake(&mut self, wake: Wake, pending: &mut VecDeque<ConnectionEvent>) {
        match wake {
            Wake::Command(command) => pending.push_back(command_event(command)),
            Wake::Connected(epoch, result) => {
                self.connecting = None;
                match result {
                    Ok(stream) if epoch == self.machine.epoch() => {
                        self.session = Some((epoch, stream));
                        pending.push_back(ConnectionEvent::Opened { epoch });
                    }
                    Ok(_) => debug!(epoch, "Dropping superseded connection"),
                    Err(WsError::Url(error)) => pending.push_back(ConnectionEvent::ConnectFailed {
                        epoch,
                        reason: error.to_string(),
                    }),
                    Err(error) => {
                        pending.push_back(ConnectionEvent::TransportError {
                            epoch,
                            reason: error.to_string(),
                        });
                        pending.push_back(ConnectionEvent::Closed {
                            epoch,
                            code: ABNORMAL_CLOSURE,
                        });
                    }
                }
            }
            Wake::Frame(epoch, frame) => self.on_frame(epoch, frame, pending).await,
            Wake::Refresh(epoch) => pending.push_back(ConnectionEvent::RefreshTick { epoch }),
            Wake::Keepalive(epoch) => pending.push_back(ConnectionEvent::KeepaliveTick { epoch }),
            Wake::ReconnectDue(epoch) => {
                self.reconnect = None;
                pending.push_back(ConnectionEvent::ReconnectDue { epoch });
            }
        }
    }

    async fn on_frame(
        &mut self,
        epoch: Epoch,
        frame: Option<Result<Message, WsError>>,
        pending: &mut VecDeque<ConnectionEvent>,
    ) {
        match frame {
            Some(Ok(Message::Text(text))) => pending.push_back(ConnectionEvent::Frame {
                epoch,
                text: text.as_str().to_owned(),
            }),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => pending.push_back(ConnectionEvent::Frame { epoch, text }),
                Err(error) => pending.push_back(ConnectionEvent::MalformedFrame {
                    epoch,
                    reason: format!("binary frame of {} bytes: {error}", bytes.len()),
                }),
            },
            Some(Ok(Message::Close(close))) => {
                let code = close
                    .as_ref()
                    .map_or(NO_STATUS_RECEIVED, |frame| u16::from(frame.code));
                debug!(code, "Server sent close frame");
                // Flush the queued close reply before dropping the socket
                if let Some((_, mut stream)) = self.session.take() {
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, stream.close(None)).await;
                }
                pending.push_back(ConnectionEvent::Closed { epoch, code });
            }
            Some(Ok(_)) => {
                // Ping/Pong frames, tungstenite replies to pings itself
            }
            Some(Err(error)) => {
                self.session = None;
                pending.push_back(ConnectionEvent::TransportError {
                    epoch,
                    reason: error.to_string(),
                });
                pending.push_back(ConnectionEvent::Closed {
                    epoch,
                    code: ABNORMAL_CLOSURE,
                });
            }
            None => {
                self.session = None;
                pending.push_back(ConnectionEvent::Closed {
                    epoch,
                    code: ABNORMAL_CLOSURE,
                });
            }
        }
    }

    async fn apply(&mut self, effect: Effect, pending: &mut VecDeque<ConnectionEvent>) {
        match effect {
            Effect::OpenSocket { epoch } => {
                self.session = None;
                let url = self.url.to_string();
                let connect = async move { connect_async(url).await.map(|(stream, _)| stream) };
                self.connecting = Some((epoch, connect.boxed()));
            }
            Effect::Send(message) => {
                let Some((epoch, stream)) = self.session.as_mut() else {
                    debug!(%message, "No live socket for outbound message");
                    return;
                };
                let epoch = *epoch;
                if let Err(error) = stream.send(Message::text(message.to_json())).await {
                    warn!(%message, %error, "Failed to send to signal server");
                    self.session = None;
                    pending.push_back(ConnectionEvent::TransportError {
                        epoch,
                        reason: error.to_string(),
                    });
                    pending.push_back(ConnectionEvent::Closed {
                        epoch,
                        code: ABNORMAL_CLOSURE,
                    });
                } else {
                    debug!(%message, "Sent request");
                }
            }
            Effect::StartTimers { epoch } => {
                self.refresh = Some((epoch, timer(self.config.refresh_interval)));
                self.keepalive = Some((epoch, timer(self.config.keepalive_interval)));
            }
            Effect::CancelTimers => {
                self.refresh = None;
                self.keepalive = None;
            }
            Effect::ScheduleReconnect { epoch, delay } => {
                self.reconnect = Some((epoch, Box::pin(tokio::time::sleep(delay))));
            }
            Effect::CancelReconnect => self.reconnect = None,
            Effect::CloseSocket { code } => {
                self.connecting = None;
                if let Some((_, mut stream)) = self.session.take() {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: "client disposed".into(),
                    };
                    match tokio::time::timeout(CLOSE_TIMEOUT, stream.close(Some(frame))).await {
                        Ok(Ok(())) => debug!(code, "Closed signal server socket"),
                        Ok(Err(error)) => debug!(%error, "Close handshake failed"),
                        Err(_) => debug!("Close handshake timed out"),
                    }
                }
            }
            Effect::Forward(message) => self.forward(message, pending).await,
        }
    }

    /// Wait for channel capacity while still accepting commands, so a consumer that
    /// stopped draining cannot stall dispose.
    async fn forward(&mut self, message: InboundMessage, pending: &mut VecDeque<ConnectionEvent>) {
        let mut message = Some(message);
        while let Some(next) = message.take() {
            tokio::select! {
                permit = self.message_tx.reserve() => match permit {
                    Ok(permit) => permit.send(next),
                    Err(_) => {
                        warn!("Message receiver dropped, disposing connection");
                        pending.push_back(ConnectionEvent::Dispose);
                    }
                },
                command = self.command_rx.recv() => {
                    let event = command_event(command);
                    if event == ConnectionEvent::Dispose {
                        debug!("Dropping undelivered message on dispose");
                    } else {
                        message = Some(next);
                    }
                    pending.push_back(event);
                }
            }
        }
    }

    fn publish(&self) {
        let next = ConnectionStatus {
            state: self.machine.state().clone(),
            counters: *self.machine.counters(),
        };
        self.status_tx.send_if_modified(|status| {
            if *status == next {
                false
            } else {
                *status = next;
                true
            }
        });
    }
}

/// A closed command channel means every handle is gone
fn command_event(command: Option<Command>) -> ConnectionEvent {
    match command {
        Some(Command::Connect) => ConnectionEvent::Connect,
        Some(Command::Send(message)) => ConnectionEvent::Send(message),
        Some(Command::Dispose) | None => ConnectionEvent::Dispose,
    }
}

/// Interval whose first tick fires one period from now
fn timer(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_connect(
    connecting: &mut Option<(Epoch, PendingConnect)>,
) -> (Epoch, Result<WsStream, WsError>) {
    match connecting {
        Some((epoch, connect)) => (*epoch, connect.await),
        None => std::future::pending().await,
    }
}

async fn next_frame(
    session: &mut Option<(Epoch, WsStream)>,
) -> (Epoch, Option<Result<Message, WsError>>) {
    match session {
        Some((epoch, stream)) => (*epoch, stream.next().await),
        None => std::future::pending().await,
    }
}

async fn next_tick(timer: &mut Option<(Epoch, Interval)>) -> Epoch {
    match timer {
        Some((epoch, interval)) => {
            interval.tick().await;
            *epoch
        }
        None => std::future::pending().await,
    }
}

async fn next_deadline(deadline: &mut Option<(Epoch, Pin<Box<Sleep>>)>) -> Epoch {
    match deadline {
        Some((epoch, sleep)) => {
            sleep.as_mut().await;
            *epoch
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::connection::ConnectionPhase;

    #[test]
    fn test_config_builder() {
        let config = WebSocketConfig::new("ws://localhost:8080")
            .with_refresh_interval(Duration::from_secs(4))
            .with_keepalive_interval(Duration::from_secs(15))
            .with_backoff(Duration::from_millis(500), Duration::from_secs(10))
            .with_connect_retry_delay(Duration::from_secs(1))
            .with_channel_buffer_size(500);

        assert_eq!(config.url, "ws://localhost:8080");
        assert_eq!(config.refresh_interval, Duration::from_secs(4));
        assert_eq!(config.keepalive_interval, Duration::from_secs(15));
        assert_eq!(
            config.backoff(),
            Backoff::new(Duration::from_millis(500), Duration::from_secs(10))
        );
        assert_eq!(config.connect_retry_delay, Duration::from_secs(1));
        assert_eq!(config.channel_buffer_size, 500);
    }

    #[test]
    fn test_default_config() {
        let config = WebSocketConfig::default();
        assert_eq!(config.url, "ws://websocket.impviz.com");
        assert_eq!(config.refresh_interval, Duration::from_secs(8));
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
        assert_eq!(config.backoff(), Backoff::default());
        assert_eq!(config.connect_retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_environment_endpoints() {
        assert_eq!(Environment::Local.endpoint(true), "ws://localhost:8765");
        assert_eq!(Environment::Production.endpoint(false), "ws://websocket.impviz.com");
        assert_eq!(Environment::Production.endpoint(true), "wss://websocket.impviz.com");

        assert_eq!(Environment::from_label("Local"), Some(Environment::Local));
        assert_eq!(Environment::from_label(" prod "), Some(Environment::Production));
        assert_eq!(Environment::from_label("staging"), None);
    }

    #[test]
    fn test_validate() {
        struct TestCase {
            config: WebSocketConfig,
            expected_ok: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: plain websocket
                config: WebSocketConfig::new("ws://localhost:8765"),
                expected_ok: true,
            },
            TestCase {
                // TC1: secure websocket
                config: WebSocketConfig::for_environment(Environment::Production, true),
                expected_ok: true,
            },
            TestCase {
                // TC2: http is not a websocket scheme
                config: WebSocketConfig::new("http://localhost:8765"),
                expected_ok: false,
            },
            TestCase {
                // TC3: not a url
                config: WebSocketConfig::new("localhost"),
                expected_ok: false,
            },
            TestCase {
                // TC4: zero refresh interval
                config: WebSocketConfig::new("ws://localhost:8765")
                    .with_refresh_interval(Duration::ZERO),
                expected_ok: false,
            },
            TestCase {
                // TC5: zero channel capacity
                config: WebSocketConfig::new("ws://localhost:8765").with_channel_buffer_size(0),
                expected_ok: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(test.config.validate().is_ok(), test.expected_ok, "TC{} failed", index);
        }
    }

    #[test]
    fn test_command_events() {
        assert_eq!(command_event(Some(Command::Connect)), ConnectionEvent::Connect);
        assert_eq!(
            command_event(Some(Command::Send(OutboundMessage::Ping))),
            ConnectionEvent::Send(OutboundMessage::Ping)
        );
        assert_eq!(command_event(Some(Command::Dispose)), ConnectionEvent::Dispose);
        // Every handle dropped
        assert_eq!(command_event(None), ConnectionEvent::Dispose);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_endpoint() {
        let result = ConnectionManager::start(WebSocketConfig::new("http://localhost:8765"));
        assert!(matches!(result, Err(SignalError::InvalidEndpoint { .. })));
    }

    #[tokio::test]
    async fn test_dispose_without_server_is_idempotent() {
        // Nothing listens on the discard port, so the task sits in the reconnect cycle
        let config = WebSocketConfig::new("ws://127.0.0.1:9")
            .with_backoff(Duration::from_millis(10), Duration::from_millis(50));
        let (mut manager, mut messages) = ConnectionManager::start(config).unwrap();

        manager.send(OutboundMessage::Ping);
        manager.dispose().await;
        manager.dispose().await;

        let status = manager.status();
        assert_eq!(status.state.phase, ConnectionPhase::Disconnected);
        assert!(messages.recv().await.is_none());
    }
}
