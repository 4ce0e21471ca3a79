//! Signal aggregation pipeline.
//!
//! Consumes decoded inbound messages and maintains everything a dashboard renders:
//! the current [`MarketSnapshot`], per-market regime detectors and their recent shift
//! events, the focus market's score history and the best setup per strategy tag.

use crate::shared::{
    history::{
        Granularity, HistoryWindow, ScoreHistoryEntry, DEFAULT_MIN_INTERVAL_SECS,
        DEFAULT_RETENTION_SECS,
    },
    regime::{RegimeDetector, RegimeLabel, RegimeShiftEvent, REGIME_SHIFT_LIFETIME_SECS},
    scoring::{
        build_snapshot, snapshot_from_records, MarketAggregate, MarketSnapshot, SnapshotSummary,
    },
    setups::{best_setups, BestSetup},
    types::{InboundMessage, Signal, SignalPayload},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub const DEFAULT_FOCUS_MARKET: &str = "NQ";

/// Aggregator tuning
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Market whose net score feeds the history window
    pub focus_market: String,
    /// How long a regime shift stays active
    pub shift_lifetime: ChronoDuration,
    pub history_retention: ChronoDuration,
    pub history_min_interval: ChronoDuration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            focus_market: DEFAULT_FOCUS_MARKET.to_string(),
            shift_lifetime: ChronoDuration::seconds(REGIME_SHIFT_LIFETIME_SECS),
            history_retention: ChronoDuration::seconds(DEFAULT_RETENTION_SECS),
            history_min_interval: ChronoDuration::seconds(DEFAULT_MIN_INTERVAL_SECS),
        }
    }
}

impl AggregatorConfig {
    pub fn with_focus_market(mut self, market: impl Into<String>) -> Self {
        self.focus_market = market.into();
        self
    }

    pub fn with_shift_lifetime(mut self, lifetime: ChronoDuration) -> Self {
        self.shift_lifetime = lifetime;
        self
    }

    pub fn with_history_limits(
        mut self,
        retention: ChronoDuration,
        min_interval: ChronoDuration,
    ) -> Self {
        self.history_retention = retention;
        self.history_min_interval = min_interval;
        self
    }
}

/// What a single message changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateSummary {
    pub snapshot_updated: bool,
    /// Regime shifts detected by this message, keyed by market
    pub shifts: Vec<(String, RegimeShiftEvent)>,
    pub history_recorded: bool,
}

/// Owned, render ready copy of the aggregator state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardView {
    pub snapshot: MarketSnapshot,
    pub summary: SnapshotSummary,
    pub focus_market: String,
    pub focus_regime: Option<f64>,
    pub focus_regime_label: Option<RegimeLabel>,
    pub active_shift: Option<RegimeShiftEvent>,
    pub granularity: String,
    pub history: Vec<ScoreHistoryEntry>,
    pub best_setups: Vec<BestSetup>,
    pub last_update: Option<DateTime<Utc>>,
}

/// Folds the inbound message stream into dashboard state
#[derive(Debug, Clone)]
pub struct SignalAggregator {
    config: AggregatorConfig,
    snapshot: MarketSnapshot,
    best_setups: Vec<BestSetup>,
    detectors: BTreeMap<String, RegimeDetector>,
    regimes: BTreeMap<String, f64>,
    shifts: BTreeMap<String, RegimeShiftEvent>,
    history: HistoryWindow,
    last_update: Option<DateTime<Utc>>,
    upstream_errors: u64,
    last_upstream_error: Option<String>,
}

impl SignalAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        let history =
            HistoryWindow::with_limits(config.history_retention, config.history_min_interval);
        Self {
            config,
            snapshot: MarketSnapshot::default(),
            best_setups: Vec::new(),
            detectors: BTreeMap::new(),
            regimes: BTreeMap::new(),
            shifts: BTreeMap::new(),
            history,
            last_update: None,
            upstream_errors: 0,
            last_upstream_error: None,
        }
    }

    /// Apply one inbound message observed at `now`
    pub fn process_message(
        &mut self,
        message: InboundMessage,
        now: DateTime<Utc>,
    ) -> UpdateSummary {
        match message {
            InboundMessage::Data(payload) => self.process_payload(&payload, now),
            InboundMessage::Error { message } => {
                self.upstream_errors += 1;
                warn!(
                    message = message.as_deref().unwrap_or("unspecified"),
                    total = self.upstream_errors,
                    "Signal server reported an error"
                );
                self.last_upstream_error = message;
                UpdateSummary::default()
            }
            InboundMessage::Pong => UpdateSummary::default(),
            InboundMessage::Other(value) => {
                debug!(%value, "Ignoring unrecognised message");
                UpdateSummary::default()
            }
        }
    }

    fn process_payload(&mut self, payload: &SignalPayload, now: DateTime<Utc>) -> UpdateSummary {
        let snapshot_updated = self.update_snapshot(payload);
        if snapshot_updated {
            self.last_update = Some(now);
        } else {
            debug!("Payload carried no market data, keeping previous snapshot");
        }

        let shifts = self.observe_regimes(payload, now);
        let history_recorded = self.record_history(payload, snapshot_updated, now);

        UpdateSummary {
            snapshot_updated,
            shifts,
            history_recorded,
        }
    }

    /// Raw signal lists take precedence over pre-aggregated records
    fn update_snapshot(&mut self, payload: &SignalPayload) -> bool {
        if payload.signals_by_market.is_some() {
            let signals = payload.signals();
            let flat: Vec<Signal> = signals.values().flatten().cloned().collect();
            self.best_setups = best_setups(&flat);
            self.snapshot = build_snapshot(signals);
            return true;
        }

        let records = payload.market_records();
        if records.is_empty() {
            return false;
        }

        self.best_setups.clear();
        self.snapshot = snapshot_from_records(&records);
        true
    }

    fn observe_regimes(
        &mut self,
        payload: &SignalPayload,
        now: DateTime<Utc>,
    ) -> Vec<(String, RegimeShiftEvent)> {
        let mut shifts = Vec::new();

        for (market, raw) in &payload.regime_by_market {
            let Some(raw) = raw.filter(|raw| raw.is_finite()) else {
                continue;
            };
            self.regimes.insert(market.clone(), raw);

            let detector = self.detectors.entry(market.clone()).or_default();
            if let Some(shift) = detector.observe(raw, now) {
                info!(%market, %shift, "Regime shift detected");
                self.shifts.insert(market.clone(), shift.clone());
                shifts.push((market.clone(), shift));
            }
        }

        shifts
    }

    /// Samples only on fresh focus data: a server score, or a new snapshot holding the focus
    /// market. Regime-only or empty payloads never replay the retained snapshot.
    fn record_history(
        &mut self,
        payload: &SignalPayload,
        snapshot_updated: bool,
        now: DateTime<Utc>,
    ) -> bool {
        let focus = self.config.focus_market.as_str();
        let aggregate = self.snapshot.get(focus);

        let fresh_aggregate = aggregate.filter(|_| snapshot_updated);
        let Some(score) = payload
            .active_score(focus)
            .or_else(|| fresh_aggregate.map(MarketAggregate::net_score))
        else {
            return false;
        };

        let entry = ScoreHistoryEntry {
            timestamp: now,
            score,
            long_score: aggregate.map_or(0.0, |market| market.long.final_score),
            short_score: aggregate.map_or(0.0, |market| market.short.final_score),
            regime: payload.regime(focus).filter(|regime| regime.is_finite()),
        };
        self.history.record(entry)
    }

    /// Drop shift events older than the configured lifetime, returning how many went
    pub fn expire_shifts(&mut self, now: DateTime<Utc>) -> usize {
        let lifetime = self.config.shift_lifetime;
        let before = self.shifts.len();
        self.shifts.retain(|_, shift| !shift.is_expired(now, lifetime));
        before - self.shifts.len()
    }

    /// Unexpired shift event for a market
    pub fn active_shift(&self, market: &str, now: DateTime<Utc>) -> Option<&RegimeShiftEvent> {
        self.shifts
            .get(market)
            .filter(|shift| !shift.is_expired(now, self.config.shift_lifetime))
    }

    /// Latest raw regime indicator of a market
    pub fn regime(&self, market: &str) -> Option<f64> {
        self.regimes.get(market).copied()
    }

    /// Floored regime label of a market
    pub fn regime_label(&self, market: &str) -> Option<RegimeLabel> {
        self.detectors
            .get(market)
            .and_then(RegimeDetector::current_label)
    }

    /// Owned copy of the current snapshot
    pub fn snapshot(&self) -> MarketSnapshot {
        self.snapshot.clone()
    }

    pub fn market(&self, market: &str) -> Option<&MarketAggregate> {
        self.snapshot.get(market)
    }

    pub fn history(&self) -> &HistoryWindow {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn best_setups(&self) -> &[BestSetup] {
        &self.best_setups
    }

    pub fn focus_market(&self) -> &str {
        &self.config.focus_market
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    pub fn upstream_errors(&self) -> u64 {
        self.upstream_errors
    }

    pub fn last_upstream_error(&self) -> Option<&str> {
        self.last_upstream_error.as_deref()
    }

    /// Owned view with the history downsampled at `granularity`
    pub fn view(&self, granularity: Granularity, now: DateTime<Utc>) -> DashboardView {
        let focus = self.config.focus_market.as_str();
        DashboardView {
            snapshot: self.snapshot.clone(),
            summary: self.snapshot.summary(),
            focus_market: focus.to_string(),
            focus_regime: self.regime(focus),
            focus_regime_label: self.regime_label(focus),
            active_shift: self.active_shift(focus, now).cloned(),
            granularity: granularity.to_string(),
            history: self.history.aggregate(granularity),
            best_setups: self.best_setups.clone(),
            last_update: self.last_update,
        }
    }
}

impl Default for SignalAggregator {
    fn default() -> Self {
        Self::new(AggregatorConfig::default())
    }
}
