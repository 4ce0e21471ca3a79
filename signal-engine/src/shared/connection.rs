//! Connection lifecycle state machine.
//!
//! Socket and timer callbacks are modelled as [`ConnectionEvent`]s. Every transition
//! returns the [`Effect`]s the driver must perform, so the whole lifecycle can be
//! exercised without a socket. Events carry the epoch they were issued for; an event
//! from a superseded epoch, or any event after disposal, is a no-op.

use crate::shared::{
    error::SignalError,
    types::{InboundMessage, OutboundMessage},
};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Deliberate, normal closure; never followed by a reconnect
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close frame without a status code
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Connection dropped without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Connection attempt number
pub type Epoch = u64;

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionPhase::Disconnected => "DISCONNECTED",
            ConnectionPhase::Connecting => "CONNECTING",
            ConnectionPhase::Connected => "CONNECTED",
            ConnectionPhase::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Consumer visible connection state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    /// Reconnects scheduled since the last successful connect
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }
}

/// Locally recovered faults and traffic counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ConnectionCounters {
    pub messages_forwarded: u64,
    pub malformed_messages: u64,
    pub pongs_received: u64,
    pub sends_while_disconnected: u64,
    pub reconnects_scheduled: u64,
}

/// Exponential reconnect backoff: `min(base × 2^attempt, max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Input to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Consumer (or startup) asks for a connection
    Connect,
    /// Handshake completed
    Opened { epoch: Epoch },
    /// Text frame received
    Frame { epoch: Epoch, text: String },
    /// Data frame that could not be read as text (eg/ binary frame that is not UTF-8)
    MalformedFrame { epoch: Epoch, reason: String },
    /// Mid-session transport failure; a `Closed` event follows
    TransportError { epoch: Epoch, reason: String },
    /// Socket closed with the given close code
    Closed { epoch: Epoch, code: u16 },
    /// Socket could not even be constructed (eg/ invalid request)
    ConnectFailed { epoch: Epoch, reason: String },
    RefreshTick { epoch: Epoch },
    KeepaliveTick { epoch: Epoch },
    ReconnectDue { epoch: Epoch },
    /// Consumer initiated outbound message
    Send(OutboundMessage),
    Dispose,
}

/// Side effect the driver must perform
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    OpenSocket { epoch: Epoch },
    Send(OutboundMessage),
    StartTimers { epoch: Epoch },
    CancelTimers,
    ScheduleReconnect { epoch: Epoch, delay: Duration },
    CancelReconnect,
    CloseSocket { code: u16 },
    Forward(InboundMessage),
}

/// Owned connection state: phase, attempts, counters and the current epoch
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    url: String,
    state: ConnectionState,
    counters: ConnectionCounters,
    backoff: Backoff,
    connect_retry_delay: Duration,
    epoch: Epoch,
    disposed: bool,
}

impl ConnectionMachine {
    pub fn new(url: impl Into<String>, backoff: Backoff, connect_retry_delay: Duration) -> Self {
        Self {
            url: url.into(),
            state: ConnectionState::default(),
            counters: ConnectionCounters::default(),
            backoff,
            connect_retry_delay,
            epoch: 0,
            disposed: false,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn counters(&self) -> &ConnectionCounters {
        &self.counters
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Apply one event and return the effects to perform, in order
    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<Effect> {
        if self.disposed {
            debug!(?event, "Ignoring connection event after dispose");
            return Vec::new();
        }

        match event {
            ConnectionEvent::Connect => self.begin_connect(),
            ConnectionEvent::Opened { epoch } if self.is_pending(epoch) => self.on_open(),
            ConnectionEvent::Frame { epoch, text } if self.is_live(epoch) => self.on_frame(&text),
            ConnectionEvent::MalformedFrame { epoch, reason } if self.is_live(epoch) => {
                self.on_malformed(SignalError::MalformedMessage(reason))
            }
            ConnectionEvent::TransportError { epoch, reason } if epoch == self.epoch => {
                self.on_transport_error(reason)
            }
            ConnectionEvent::Closed { epoch, code } if epoch == self.epoch => self.on_close(code),
            ConnectionEvent::ConnectFailed { epoch, reason } if self.is_pending(epoch) => {
                self.on_connect_failed(reason)
            }
            ConnectionEvent::RefreshTick { epoch } if self.is_live(epoch) => {
                vec![Effect::Send(OutboundMessage::GetLatest)]
            }
            ConnectionEvent::KeepaliveTick { epoch } if self.is_live(epoch) => {
                vec![Effect::Send(OutboundMessage::Ping)]
            }
            ConnectionEvent::ReconnectDue { epoch } if epoch == self.epoch => self.begin_connect(),
            ConnectionEvent::Send(message) => self.on_send(message),
            ConnectionEvent::Dispose => self.dispose(),
            stale => {
                debug!(?stale, current_epoch = self.epoch, "Ignoring superseded connection event");
                Vec::new()
            }
        }
    }

    fn is_pending(&self, epoch: Epoch) -> bool {
        epoch == self.epoch && self.state.phase == ConnectionPhase::Connecting
    }

    fn is_live(&self, epoch: Epoch) -> bool {
        epoch == self.epoch && self.state.phase == ConnectionPhase::Connected
    }

    fn begin_connect(&mut self) -> Vec<Effect> {
        match self.state.phase {
            ConnectionPhase::Connecting | ConnectionPhase::Connected => {
                debug!(phase = %self.state.phase, "Already connected or connecting, skipping");
                Vec::new()
            }
            ConnectionPhase::Disconnected | ConnectionPhase::Error => {
                self.epoch += 1;
                self.state.phase = ConnectionPhase::Connecting;
                info!(
                    url = %self.url,
                    epoch = self.epoch,
                    attempt = self.state.attempt_count,
                    "Connecting to signal server"
                );
                vec![
                    Effect::CancelReconnect,
                    Effect::OpenSocket { epoch: self.epoch },
                ]
            }
        }
    }

    fn on_open(&mut self) -> Vec<Effect> {
        info!(url = %self.url, epoch = self.epoch, "Connected to signal server");
        self.state = ConnectionState {
            phase: ConnectionPhase::Connected,
            attempt_count: 0,
            last_error: None,
        };
        vec![
            Effect::Send(OutboundMessage::GetLatest),
            Effect::StartTimers { epoch: self.epoch },
        ]
    }

    fn on_frame(&mut self, text: &str) -> Vec<Effect> {
        match InboundMessage::decode(text) {
            Ok(InboundMessage::Pong) => {
                self.counters.pongs_received += 1;
                debug!("Received pong");
                Vec::new()
            }
            Ok(message) => {
                self.counters.messages_forwarded += 1;
                vec![Effect::Forward(message)]
            }
            Err(error) => {
                debug!("Raw message: {}", text.chars().take(200).collect::<String>());
                self.on_malformed(error)
            }
        }
    }

    fn on_malformed(&mut self, error: SignalError) -> Vec<Effect> {
        self.counters.malformed_messages += 1;
        warn!(%error, total = self.counters.malformed_messages, "Dropping inbound message");
        Vec::new()
    }

    fn on_transport_error(&mut self, reason: String) -> Vec<Effect> {
        let error = SignalError::Transport(reason);
        warn!(%error, epoch = self.epoch, "Signal server connection error");
        self.state.phase = ConnectionPhase::Error;
        self.state.last_error = Some(error.to_string());
        Vec::new()
    }

    fn on_close(&mut self, code: u16) -> Vec<Effect> {
        self.state.phase = ConnectionPhase::Disconnected;
        let mut effects = vec![Effect::CancelTimers];

        if code == NORMAL_CLOSURE {
            info!(url = %self.url, code, "Signal server connection closed normally");
            return effects;
        }

        let delay = self.backoff.delay(self.state.attempt_count);
        self.state.attempt_count = self.state.attempt_count.saturating_add(1);
        self.counters.reconnects_scheduled += 1;
        warn!(
            url = %self.url,
            code,
            attempt = self.state.attempt_count,
            delay_ms = delay.as_millis() as u64,
            "Signal server connection lost, reconnecting"
        );
        effects.push(Effect::ScheduleReconnect {
            epoch: self.epoch,
            delay,
        });
        effects
    }

    fn on_connect_failed(&mut self, reason: String) -> Vec<Effect> {
        let error = SignalError::ConnectFailed {
            url: self.url.clone(),
            reason,
        };
        warn!(
            %error,
            retry_ms = self.connect_retry_delay.as_millis() as u64,
            "Failed to create signal server connection"
        );
        self.state.phase = ConnectionPhase::Error;
        self.state.last_error = Some(error.to_string());
        vec![Effect::ScheduleReconnect {
            epoch: self.epoch,
            delay: self.connect_retry_delay,
        }]
    }

    fn on_send(&mut self, message: OutboundMessage) -> Vec<Effect> {
        if self.state.is_connected() {
            return vec![Effect::Send(message)];
        }

        self.counters.sends_while_disconnected += 1;
        let error = SignalError::SendWhileDisconnected {
            message: message.to_string(),
        };
        warn!(
            %error,
            phase = %self.state.phase,
            dropped = self.counters.sends_while_disconnected,
            "Dropping outbound message"
        );
        Vec::new()
    }

    fn dispose(&mut self) -> Vec<Effect> {
        info!(url = %self.url, "Disposing signal server connection");
        self.disposed = true;
        self.epoch += 1;
        self.state.phase = ConnectionPhase::Disconnected;
        vec![
            Effect::CancelReconnect,
            Effect::CancelTimers,
            Effect::CloseSocket {
                code: NORMAL_CLOSURE,
            },
        ]
    }
}
