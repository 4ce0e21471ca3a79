use thiserror::Error;

/// All errors generated in `signal-engine`.
///
/// None of these are fatal: the engine keeps running in a degraded or reconnecting
/// state and surfaces failures through [`ConnectionState`](super::connection::ConnectionState).
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum SignalError {
    #[error("failed to connect to {url}: {reason}")]
    ConnectFailed { url: String, reason: String },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("cannot send {message} while not connected")]
    SendWhileDisconnected { message: String },

    #[error("invalid endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported history granularity: {0}")]
    InvalidGranularity(String),
}

impl SignalError {
    /// Determine if an error should drive the connection into the reconnect cycle.
    #[allow(clippy::match_like_matches_macro)]
    pub fn drives_reconnect(&self) -> bool {
        match self {
            SignalError::ConnectFailed { .. } | SignalError::Transport(_) => true,
            _ => false,
        }
    }
}
