/// Core data types for strategy signals
///
/// These types match the JSON message format published by the signal server
/// (`get_latest` responses and liveness replies).

use crate::shared::error::SignalError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Setup name used when the server omits one
pub const UNKNOWN_SETUP: &str = "Unknown";

/// Exposure stance of a signal
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Long, Direction::Short];

    /// Convert to display string
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "Long",
            Direction::Short => "Short",
        }
    }

    /// Parse the wire representation; anything but "Long"/"Short" is unsupported
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "Long" => Some(Direction::Long),
            "Short" => Some(Direction::Short),
            _ => None,
        }
    }

    pub fn is_long(&self) -> bool {
        matches!(self, Direction::Long)
    }

    pub fn is_short(&self) -> bool {
        matches!(self, Direction::Short)
    }

    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Historical performance statistics attached to a setup
///
/// Only used for ranking setups, never for scoring.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SetupPerformance {
    #[serde(default)]
    pub hit_rate: Option<f64>,
    #[serde(default)]
    pub pnl_per_trade: Option<f64>,
    #[serde(default)]
    pub avg_drawdown: Option<f64>,
    #[serde(default)]
    pub sample_size: Option<f64>,
    #[serde(default)]
    pub risk_reward_ratio: Option<f64>,
}

/// One observed strategy trigger, normalized from a [`SignalRecord`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub market: String,
    pub direction: Direction,
    /// False when the server omitted the direction and Long was assumed
    pub direction_explicit: bool,
    pub setup_name: String,
    /// Empty when the server did not report a timeframe
    pub timeframe: String,
    pub is_active: bool,
    pub strength: f64,
    pub performance: SetupPerformance,
}

/// Signal record exactly as published inside `signals_by_market`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SignalRecord {
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub setup_name: Option<String>,
    #[serde(default)]
    pub timeframe: Option<String>,
    /// Published either as a bool or as 0/1
    #[serde(default, deserialize_with = "de_active_flag")]
    pub has_active_signal: bool,
    #[serde(default)]
    pub signal_strength: Option<f64>,
    #[serde(flatten)]
    pub performance: SetupPerformance,
}

impl SignalRecord {
    /// Normalize into a [`Signal`] for `market`.
    ///
    /// A missing direction defaults to Long; unsupported directions are dropped.
    pub fn into_signal(self, market: &str) -> Option<Signal> {
        let direction = match self.direction.as_deref() {
            None => Direction::Long,
            Some(value) => Direction::from_wire(value)?,
        };

        Some(Signal {
            market: market.to_string(),
            direction,
            direction_explicit: self.direction.is_some(),
            setup_name: self
                .setup_name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| UNKNOWN_SETUP.to_string()),
            timeframe: self.timeframe.unwrap_or_default(),
            is_active: self.has_active_signal,
            strength: self.signal_strength.unwrap_or(0.0),
            performance: self.performance,
        })
    }
}

fn de_active_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Bool(flag)) => flag,
        Some(serde_json::Value::Number(number)) => number.as_f64() == Some(1.0),
        _ => false,
    })
}

/// Treats an explicit `null` like a missing field
fn de_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Signals published for one market
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MarketSignals {
    #[serde(default, deserialize_with = "de_null_default")]
    pub signals: Vec<SignalRecord>,
}

/// Partial, already aggregated direction record
///
/// Some server versions publish per-direction aggregates instead of raw signal lists.
/// Counts are kept as `f64` because the publisher does not guarantee integers.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DirectionRecord {
    #[serde(default)]
    pub signals_count: Option<f64>,
    #[serde(default)]
    pub timeframes_count: Option<f64>,
    #[serde(default)]
    pub base_strength: Option<f64>,
    #[serde(default)]
    pub adjusted_strength: Option<f64>,
    #[serde(default)]
    pub conviction: Option<f64>,
    #[serde(default)]
    pub conviction_impact: Option<f64>,
    #[serde(default)]
    pub correlation_penalty: Option<f64>,
    #[serde(default)]
    pub signal_left_impact: Option<f64>,
    #[serde(default)]
    pub certainty: Option<f64>,
    #[serde(default)]
    pub conviction_penalty: Option<f64>,
    #[serde(default)]
    pub final_score: Option<f64>,
    #[serde(default, deserialize_with = "de_null_default")]
    pub setup_names: Vec<String>,
}

/// Pre-aggregated Long/Short records for one market
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MarketRecord {
    #[serde(rename = "Long", default)]
    pub long: Option<DirectionRecord>,
    #[serde(rename = "Short", default)]
    pub short: Option<DirectionRecord>,
}

impl MarketRecord {
    pub fn direction(&self, direction: Direction) -> Option<&DirectionRecord> {
        match direction {
            Direction::Long => self.long.as_ref(),
            Direction::Short => self.short.as_ref(),
        }
    }
}

/// Body of a data message (`{"data": {...}}`)
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SignalPayload {
    #[serde(default)]
    pub signals_by_market: Option<BTreeMap<String, MarketSignals>>,
    #[serde(default, deserialize_with = "de_null_default")]
    pub regime_by_market: BTreeMap<String, Option<f64>>,
    #[serde(default, deserialize_with = "de_null_default")]
    pub active_signals_score_by_market: BTreeMap<String, Option<f64>>,
    /// Every other key; pre-aggregated market records live here
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SignalPayload {
    /// True if the payload carries anything the scoring engine can turn into a snapshot
    pub fn has_market_data(&self) -> bool {
        self.signals_by_market.is_some() || !self.market_records().is_empty()
    }

    /// Normalized signals grouped by market, keeping markets with no signals
    pub fn signals(&self) -> BTreeMap<String, Vec<Signal>> {
        self.signals_by_market
            .iter()
            .flatten()
            .map(|(market, market_signals)| {
                let signals = market_signals
                    .signals
                    .iter()
                    .cloned()
                    .filter_map(|record| record.into_signal(market))
                    .collect();
                (market.clone(), signals)
            })
            .collect()
    }

    /// Pre-aggregated records among the extra keys (objects with a Long or Short entry)
    pub fn market_records(&self) -> BTreeMap<String, MarketRecord> {
        self.extra
            .iter()
            .filter(|(_, value)| {
                value.as_object().is_some_and(|object| {
                    object.contains_key("Long") || object.contains_key("Short")
                })
            })
            .filter_map(|(market, value)| {
                serde_json::from_value::<MarketRecord>(value.clone())
                    .ok()
                    .map(|record| (market.clone(), record))
            })
            .collect()
    }

    /// Latest regime indicator for a market, ignoring nulls
    pub fn regime(&self, market: &str) -> Option<f64> {
        self.regime_by_market.get(market).copied().flatten()
    }

    /// Server computed net score for a market, ignoring nulls
    pub fn active_score(&self, market: &str) -> Option<f64> {
        self.active_signals_score_by_market
            .get(market)
            .copied()
            .flatten()
    }
}

/// Decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Liveness reply, never forwarded past the connection layer
    Pong,
    /// Upstream error report; snapshots are left untouched
    Error { message: Option<String> },
    /// Signal data payload
    Data(Box<SignalPayload>),
    /// Valid JSON of an unrecognised shape
    Other(serde_json::Value),
}

impl InboundMessage {
    /// Decode a raw text frame
    pub fn decode(text: &str) -> Result<Self, SignalError> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|error| SignalError::MalformedMessage(error.to_string()))?;

        match value.get("type").and_then(|kind| kind.as_str()) {
            Some("pong") => return Ok(InboundMessage::Pong),
            Some("error") => {
                let message = ["message", "error", "detail"]
                    .iter()
                    .find_map(|key| value.get(*key).and_then(|v| v.as_str()))
                    .map(str::to_string);
                return Ok(InboundMessage::Error { message });
            }
            _ => {}
        }

        match value.get("data") {
            Some(data) if data.is_object() => serde_json::from_value::<SignalPayload>(data.clone())
                .map(|payload| InboundMessage::Data(Box::new(payload)))
                .map_err(|error| SignalError::MalformedMessage(error.to_string())),
            _ => Ok(InboundMessage::Other(value)),
        }
    }
}

/// Outbound requests understood by the signal server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Request a fresh snapshot
    GetLatest,
    /// Liveness probe
    Ping,
}

impl OutboundMessage {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundMessage::GetLatest => "get_latest",
            OutboundMessage::Ping => "ping",
        }
    }

    /// JSON text frame for this request
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl std::fmt::Display for OutboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::Long.to_string(), "Long");
        assert_eq!(Direction::Short.to_string(), "Short");
        assert_eq!(Direction::Long.opposite(), Direction::Short);
        assert!(Direction::Short.is_short());
        assert!(!Direction::Short.is_long());
    }

    #[test]
    fn test_outbound_message_json() {
        assert_eq!(OutboundMessage::GetLatest.to_json(), r#"{"type":"get_latest"}"#);
        assert_eq!(OutboundMessage::Ping.to_json(), r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_decode_pong_and_error() {
        assert_eq!(
            InboundMessage::decode(r#"{"type":"pong"}"#).unwrap(),
            InboundMessage::Pong
        );
        assert_eq!(
            InboundMessage::decode(r#"{"type":"error","message":"backend down"}"#).unwrap(),
            InboundMessage::Error {
                message: Some("backend down".to_string())
            }
        );
    }

    #[test]
    fn test_decode_malformed() {
        let result = InboundMessage::decode("{not json");
        assert!(matches!(result, Err(SignalError::MalformedMessage(_))));
    }

    #[test]
    fn test_decode_data_payload() {
        let text = r#"{
            "data": {
                "signals_by_market": {
                    "NQ": {"signals": [
                        {"direction": "Long", "setup_name": "SMA 5/20", "timeframe": "5m",
                         "has_active_signal": 1, "signal_strength": 80, "hit_rate": 0.6},
                        {"direction": "Sideways", "has_active_signal": true, "signal_strength": 10},
                        {"has_active_signal": 0, "signal_strength": 50}
                    ]},
                    "ES": {"signals": []}
                },
                "regime_by_market": {"NQ": 1.4, "ES": null},
                "active_signals_score_by_market": {"NQ": 12.5}
            }
        }"#;

        let InboundMessage::Data(payload) = InboundMessage::decode(text).unwrap() else {
            panic!("expected data payload");
        };

        let signals = payload.signals();
        assert_eq!(signals.len(), 2);
        assert!(signals["ES"].is_empty());

        let nq = &signals["NQ"];
        assert_eq!(nq.len(), 2, "unsupported direction must be dropped");
        assert_eq!(nq[0].direction, Direction::Long);
        assert!(nq[0].direction_explicit);
        assert!(nq[0].is_active);
        assert_eq!(nq[0].strength, 80.0);
        assert_eq!(nq[0].performance.hit_rate, Some(0.6));
        assert_eq!(nq[1].direction, Direction::Long);
        assert!(!nq[1].direction_explicit);
        assert_eq!(nq[1].setup_name, UNKNOWN_SETUP);
        assert!(!nq[1].is_active);

        assert_eq!(payload.regime("NQ"), Some(1.4));
        assert_eq!(payload.regime("ES"), None);
        assert_eq!(payload.active_score("NQ"), Some(12.5));
        assert!(payload.has_market_data());
    }

    #[test]
    fn test_decode_pre_aggregated_records() {
        let text = r#"{"data": {
            "NQ": {"Long": {"signals_count": 2, "base_strength": 70, "conviction": 1}},
            "regime_by_market": {"NQ": 2.0},
            "server_time": "12:00:00"
        }}"#;

        let InboundMessage::Data(payload) = InboundMessage::decode(text).unwrap() else {
            panic!("expected data payload");
        };

        let records = payload.market_records();
        assert_eq!(records.len(), 1);
        let long = records["NQ"].direction(Direction::Long).unwrap();
        assert_eq!(long.signals_count, Some(2.0));
        assert!(records["NQ"].short.is_none());
        assert!(payload.has_market_data());
    }

    #[test]
    fn test_decode_tolerates_null_collections() {
        struct TestCase {
            input: &'static str,
            signals: usize,
            has_market_data: bool,
        }

        let cases = vec![
            // TC0: null signal list
            TestCase {
                input: r#"{"data":{"signals_by_market":{"NQ":{"signals":null}}}}"#,
                signals: 0,
                has_market_data: true,
            },
            // TC1: null regime map
            TestCase {
                input: r#"{"data":{"regime_by_market":null}}"#,
                signals: 0,
                has_market_data: false,
            },
            // TC2: null score map next to real signals
            TestCase {
                input: r#"{"data":{"active_signals_score_by_market":null,
                    "signals_by_market":{"NQ":{"signals":[{"direction":"Short"}]}}}}"#,
                signals: 1,
                has_market_data: true,
            },
            // TC3: null setup names in a pre-aggregated record
            TestCase {
                input: r#"{"data":{"NQ":{"Long":{"signals_count":1,"setup_names":null}}}}"#,
                signals: 0,
                has_market_data: true,
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let message = InboundMessage::decode(test.input);
            let Ok(InboundMessage::Data(payload)) = message else {
                panic!("TC{index} failed: {message:?}");
            };
            let signals: usize = payload.signals().values().map(Vec::len).sum();
            assert_eq!(signals, test.signals, "TC{index} failed");
            assert_eq!(payload.has_market_data(), test.has_market_data, "TC{index} failed");
            assert_eq!(payload.regime("NQ"), None, "TC{index} failed");
            assert_eq!(payload.active_score("NQ"), None, "TC{index} failed");
        }
    }

    #[test]
    fn test_decode_other_shapes() {
        let message = InboundMessage::decode(r#"{"type":"welcome"}"#).unwrap();
        assert!(matches!(message, InboundMessage::Other(_)));
    }
}
