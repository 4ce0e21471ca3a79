/// Signal Engine - Shared Library
///
/// Real-time ingestion and aggregation of strategy signals published by the signal
/// server, for dashboards and monitors:
/// - Resilient WebSocket connection with exponential reconnect backoff
/// - Per-market, per-direction strength scoring
/// - Rolling score history with bucketed downsampling
/// - Regime shift detection and best setup ranking
pub mod shared;

// Re-export commonly used types for convenience
pub use shared::error::SignalError;

pub use shared::types::{
    Direction, InboundMessage, OutboundMessage, SetupPerformance, Signal, SignalPayload,
};

pub use shared::connection::{
    Backoff, ConnectionCounters, ConnectionEvent, ConnectionMachine, ConnectionPhase,
    ConnectionState, Effect,
};
pub use shared::websocket::{ConnectionManager, ConnectionStatus, Environment, WebSocketConfig};

pub use shared::history::{Granularity, HistoryWindow, ScoreHistoryEntry};
pub use shared::regime::{RegimeDetector, RegimeLabel, RegimeShiftEvent};
pub use shared::scoring::{
    calculate_fallback_score, score_signals, DirectionAggregate, MarketAggregate, MarketSnapshot,
    MarketVerdict,
};
pub use shared::setups::{BestSetup, StrategyTag};

// Aggregation pipeline (shared by every consumer)
pub use shared::state::{AggregatorConfig, DashboardView, SignalAggregator, UpdateSummary};
