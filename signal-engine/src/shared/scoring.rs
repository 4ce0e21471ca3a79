//! Signal scoring engine.
//!
//! Converts raw per-market signal lists into per-direction aggregate scores. Everything
//! here is a pure function of its input: snapshots are recomputed from the full signal
//! set on every update and never patched incrementally.

use crate::shared::types::{Direction, DirectionRecord, MarketRecord, Signal};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

// ============================================================================
// Scoring weights
// ============================================================================
// Policy constants of the weighted-average heuristic. Changing any of them changes
// published scores.

/// Multiplier applied to the mean signal strength
pub const STRENGTH_MULTIPLIER: f64 = 2.0;
/// Conviction level cap
pub const MAX_CONVICTION: u8 = 3;
/// Score contribution per conviction level
pub const CONVICTION_IMPACT_PER_LEVEL: f64 = 5.0;
/// Number of distinct timeframes needed to avoid a correlation penalty
pub const FULL_TIMEFRAME_COVERAGE: usize = 4;
/// Certainty lost per missing timeframe
pub const CORRELATION_PENALTY_PER_TIMEFRAME: f64 = 10.0;
/// Adjusted strength above which a direction counts as convinced
pub const CONFLICT_THRESHOLD: f64 = 10.0;
/// Certainty lost when both directions are convinced at once
pub const CONFLICT_PENALTY: f64 = 50.0;
/// Number of terms averaged into the final score
pub const SCORE_DIVISOR: f64 = 4.0;
/// Certainty before penalties
pub const MAX_CERTAINTY: f64 = 100.0;

/// Aggregate score for one (market, direction)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DirectionAggregate {
    pub signal_count: usize,
    /// Distinct timeframes among active signals
    pub active_timeframe_count: usize,
    pub base_strength: f64,
    pub adjusted_strength: f64,
    /// 0..=3
    pub conviction_level: u8,
    pub conviction_impact: f64,
    pub correlation_penalty: f64,
    /// 0..=100
    pub certainty: f64,
    pub conviction_penalty: f64,
    pub signal_left_impact: f64,
    pub final_score: f64,
    /// Deduplicated, in first-seen order
    pub setup_names: Vec<String>,
}

impl DirectionAggregate {
    pub fn has_signals(&self) -> bool {
        self.signal_count > 0
    }
}

/// Winning direction of a market and its margin
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MarketVerdict {
    pub winner: Option<Direction>,
    /// |long - short| when there is a winner, 0 otherwise
    pub strength: f64,
}

/// Long and Short aggregates of one market
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarketAggregate {
    pub long: DirectionAggregate,
    pub short: DirectionAggregate,
}

impl MarketAggregate {
    pub fn direction(&self, direction: Direction) -> &DirectionAggregate {
        match direction {
            Direction::Long => &self.long,
            Direction::Short => &self.short,
        }
    }

    /// Long minus Short final score
    pub fn net_score(&self) -> f64 {
        self.long.final_score - self.short.final_score
    }

    /// Direction with the higher positive final score
    pub fn verdict(&self) -> MarketVerdict {
        let long = self.long.final_score;
        let short = self.short.final_score;

        let winner = if long > short && long > 0.0 {
            Some(Direction::Long)
        } else if short > long && short > 0.0 {
            Some(Direction::Short)
        } else {
            None
        };

        MarketVerdict {
            winner,
            strength: if winner.is_some() { (long - short).abs() } else { 0.0 },
        }
    }
}

/// Signal counts across the whole snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotSummary {
    pub total_signals: usize,
    pub long_signals: usize,
    pub short_signals: usize,
    pub markets: usize,
}

/// Current per-market aggregate state; replaced wholesale on every update
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub markets: BTreeMap<String, MarketAggregate>,
}

impl MarketSnapshot {
    pub fn get(&self, market: &str) -> Option<&MarketAggregate> {
        self.markets.get(market)
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    pub fn summary(&self) -> SnapshotSummary {
        self.markets
            .values()
            .fold(SnapshotSummary::default(), |mut summary, market| {
                summary.long_signals += market.long.signal_count;
                summary.short_signals += market.short.signal_count;
                summary.total_signals += market.long.signal_count + market.short.signal_count;
                summary.markets += 1;
                summary
            })
    }
}

/// Active signals of one direction, before finalisation
#[derive(Debug, Default)]
struct ActiveSet<'a> {
    count: usize,
    strength_sum: f64,
    timeframes: HashSet<&'a str>,
    setup_names: Vec<String>,
}

impl<'a> ActiveSet<'a> {
    fn collect(signals: &'a [Signal], direction: Direction) -> Self {
        let mut set = ActiveSet::default();
        for signal in signals
            .iter()
            .filter(|signal| signal.is_active && signal.direction == direction)
        {
            set.count += 1;
            set.strength_sum += signal.strength;
            if !signal.timeframe.is_empty() {
                set.timeframes.insert(signal.timeframe.as_str());
            }
            if !set.setup_names.contains(&signal.setup_name) {
                set.setup_names.push(signal.setup_name.clone());
            }
        }
        set
    }

    fn adjusted_strength(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.strength_sum / self.count as f64) * STRENGTH_MULTIPLIER
        }
    }

    fn finalize(self, conflicting: bool) -> DirectionAggregate {
        if self.count == 0 {
            return DirectionAggregate::default();
        }

        let base_strength = self.strength_sum / self.count as f64;
        let adjusted_strength = base_strength * STRENGTH_MULTIPLIER;
        let conviction_level = conviction_level(self.count);
        let conviction_impact = f64::from(conviction_level) * CONVICTION_IMPACT_PER_LEVEL;
        let correlation_penalty = correlation_penalty(self.timeframes.len());

        let mut certainty = MAX_CERTAINTY - correlation_penalty;
        if conflicting {
            certainty = (certainty - CONFLICT_PENALTY).max(0.0);
        }

        let conviction_penalty = conviction_penalty(conviction_level);
        let signal_left_impact = 0.0;

        DirectionAggregate {
            signal_count: self.count,
            active_timeframe_count: self.timeframes.len(),
            base_strength,
            adjusted_strength,
            conviction_level,
            conviction_impact,
            correlation_penalty,
            certainty,
            conviction_penalty,
            signal_left_impact,
            final_score: combine(
                adjusted_strength,
                conviction_impact,
                certainty,
                signal_left_impact,
                conviction_penalty,
            ),
            setup_names: self.setup_names,
        }
    }
}

/// `min(3, floor(count / 2))`
pub fn conviction_level(signal_count: usize) -> u8 {
    u8::try_from(signal_count / 2)
        .unwrap_or(MAX_CONVICTION)
        .min(MAX_CONVICTION)
}

/// `max(0, (4 - timeframes) * 10)`
pub fn correlation_penalty(timeframe_count: usize) -> f64 {
    FULL_TIMEFRAME_COVERAGE.saturating_sub(timeframe_count) as f64
        * CORRELATION_PENALTY_PER_TIMEFRAME
}

/// -10 at conviction 1, -5 at conviction 2, otherwise 0
pub fn conviction_penalty(conviction_level: u8) -> f64 {
    match conviction_level {
        1 => -10.0,
        2 => -5.0,
        _ => 0.0,
    }
}

#[inline]
fn combine(
    adjusted_strength: f64,
    conviction_impact: f64,
    certainty: f64,
    signal_left_impact: f64,
    conviction_penalty: f64,
) -> f64 {
    (adjusted_strength + conviction_impact + certainty + signal_left_impact + conviction_penalty)
        / SCORE_DIVISOR
}

/// Score one market's signals.
///
/// Both directions' adjusted strength is known before either is finalised, so the
/// conflict penalty applies symmetrically.
pub fn score_market(signals: &[Signal]) -> MarketAggregate {
    let long = ActiveSet::collect(signals, Direction::Long);
    let short = ActiveSet::collect(signals, Direction::Short);

    let conflicting = long.adjusted_strength() > CONFLICT_THRESHOLD
        && short.adjusted_strength() > CONFLICT_THRESHOLD;

    MarketAggregate {
        long: long.finalize(conflicting),
        short: short.finalize(conflicting),
    }
}

/// Build a snapshot from signals already grouped by market.
///
/// Markets with an empty signal list are kept with zeroed aggregates.
pub fn build_snapshot<I>(markets: I) -> MarketSnapshot
where
    I: IntoIterator<Item = (String, Vec<Signal>)>,
{
    MarketSnapshot {
        markets: markets
            .into_iter()
            .map(|(market, signals)| {
                let aggregate = score_market(&signals);
                (market, aggregate)
            })
            .collect(),
    }
}

/// Build a snapshot from a flat signal list, grouping by [`Signal::market`]
pub fn score_signals(signals: &[Signal]) -> MarketSnapshot {
    let mut grouped: BTreeMap<String, Vec<Signal>> = BTreeMap::new();
    for signal in signals {
        grouped
            .entry(signal.market.clone())
            .or_default()
            .push(signal.clone());
    }
    build_snapshot(grouped)
}

/// Score a partial pre-aggregated direction record that lacks a final score.
///
/// Returns 0 for a missing record or one that reports no signals.
pub fn calculate_fallback_score(record: Option<&DirectionRecord>) -> f64 {
    let Some(record) = record else {
        return 0.0;
    };
    if record.signals_count == Some(0.0) {
        return 0.0;
    }

    let adjusted_strength = record.base_strength.unwrap_or(0.0) * STRENGTH_MULTIPLIER;
    let conviction_impact = record.conviction_impact.unwrap_or(0.0);
    let certainty = MAX_CERTAINTY - record.correlation_penalty.unwrap_or(0.0);
    let signal_left_impact = record.signal_left_impact.unwrap_or(0.0);
    let conviction_penalty = conviction_penalty(record_conviction(record));

    combine(
        adjusted_strength,
        conviction_impact,
        certainty,
        signal_left_impact,
        conviction_penalty,
    )
}

fn record_conviction(record: &DirectionRecord) -> u8 {
    record
        .conviction
        .filter(|level| level.fract() == 0.0 && (0.0..=f64::from(u8::MAX)).contains(level))
        .map(|level| level as u8)
        .unwrap_or(0)
}

/// Turn a pre-aggregated record into a [`DirectionAggregate`].
///
/// A present, non-zero `final_score` is kept as published; otherwise the fallback
/// scorer fills it in.
pub fn aggregate_from_record(record: Option<&DirectionRecord>) -> DirectionAggregate {
    let Some(record) = record else {
        return DirectionAggregate::default();
    };

    let correlation_penalty = record.correlation_penalty.unwrap_or(0.0);
    let final_score = match record.final_score {
        Some(score) if score != 0.0 => score,
        _ => calculate_fallback_score(Some(record)),
    };

    DirectionAggregate {
        signal_count: record.signals_count.unwrap_or(0.0).max(0.0) as usize,
        active_timeframe_count: record.timeframes_count.unwrap_or(0.0).max(0.0) as usize,
        base_strength: record.base_strength.unwrap_or(0.0),
        adjusted_strength: record
            .adjusted_strength
            .unwrap_or_else(|| record.base_strength.unwrap_or(0.0) * STRENGTH_MULTIPLIER),
        conviction_level: record_conviction(record).min(MAX_CONVICTION),
        conviction_impact: record.conviction_impact.unwrap_or(0.0),
        correlation_penalty,
        certainty: record
            .certainty
            .unwrap_or(MAX_CERTAINTY - correlation_penalty),
        conviction_penalty: record
            .conviction_penalty
            .unwrap_or_else(|| conviction_penalty(record_conviction(record))),
        signal_left_impact: record.signal_left_impact.unwrap_or(0.0),
        final_score,
        setup_names: record.setup_names.clone(),
    }
}

/// Build a snapshot from pre-aggregated market records
pub fn snapshot_from_records(records: &BTreeMap<String, MarketRecord>) -> MarketSnapshot {
    MarketSnapshot {
        markets: records
            .iter()
            .map(|(market, record)| {
                let aggregate = MarketAggregate {
                    long: aggregate_from_record(record.long.as_ref()),
                    short: aggregate_from_record(record.short.as_ref()),
                };
                (market.clone(), aggregate)
            })
            .collect(),
    }
}
