//! Best setup per strategy tag and direction, ranked by historical performance.
//!
//! Composite = hit_rate × pnl_per_trade × drawdown factor × sample weight × risk/reward,
//! where the drawdown factor is `1 / |avg_drawdown|` (0.1 when unknown) and the sample
//! weight saturates at 100 samples.

use crate::shared::types::{Direction, SetupPerformance, Signal};
use serde::Serialize;

/// Drawdown factor used when a setup reports no drawdown
const UNKNOWN_DRAWDOWN_FACTOR: f64 = 0.1;
/// Sample count at which the sample weight reaches 1
const FULL_SAMPLE_SIZE: f64 = 100.0;

/// Strategy family a setup belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum StrategyTag {
    TrendFollowing,
    MeanReversion,
    TrendReversal,
}

impl StrategyTag {
    pub const ALL: [StrategyTag; 3] = [
        StrategyTag::TrendFollowing,
        StrategyTag::MeanReversion,
        StrategyTag::TrendReversal,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            StrategyTag::TrendFollowing => "Trend Following",
            StrategyTag::MeanReversion => "Mean Reversion",
            StrategyTag::TrendReversal => "Trend Reversal",
        }
    }

    /// Map a setup name onto its strategy family; the counter-trend SMA check must
    /// run before the plain SMA one.
    pub fn classify(setup_name: &str) -> Option<Self> {
        let has = |needle: &str| setup_name.contains(needle);

        if has("MACD") && has("Convergence") {
            Some(StrategyTag::TrendFollowing)
        } else if has("SMA") && has("5/20") && has("Counter") {
            Some(StrategyTag::TrendReversal)
        } else if has("SMA") && has("5/20") {
            Some(StrategyTag::TrendFollowing)
        } else if has("Williams") && (has("1/99") || has("10/90")) {
            Some(StrategyTag::MeanReversion)
        } else {
            None
        }
    }
}

impl std::fmt::Display for StrategyTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Highest ranked setup for one (tag, direction)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestSetup {
    pub tag: StrategyTag,
    pub direction: Direction,
    pub signal: Signal,
    pub composite_score: f64,
}

/// Composite performance score of a setup
pub fn composite_score(performance: &SetupPerformance) -> f64 {
    let hit_rate = performance.hit_rate.unwrap_or(0.0);
    let pnl = performance.pnl_per_trade.unwrap_or(0.0);
    let drawdown_factor = match performance.avg_drawdown {
        Some(drawdown) if drawdown != 0.0 => 1.0 / drawdown.abs(),
        _ => UNKNOWN_DRAWDOWN_FACTOR,
    };
    let sample_weight = (performance.sample_size.unwrap_or(0.0) / FULL_SAMPLE_SIZE).min(1.0);
    let risk_reward = match performance.risk_reward_ratio {
        Some(ratio) if ratio != 0.0 => ratio,
        _ => 1.0,
    };

    hit_rate * pnl * drawdown_factor * sample_weight * risk_reward
}

/// Pick the best setup per (tag, direction) across every market.
///
/// Active and inactive signals both compete. Signals whose direction was assumed rather
/// than published are skipped. Ties keep the first signal seen. Output is ordered by tag,
/// then Long before Short.
pub fn best_setups(signals: &[Signal]) -> Vec<BestSetup> {
    let mut ranked = Vec::new();

    for tag in StrategyTag::ALL {
        for direction in Direction::ALL {
            let winner = signals
                .iter()
                .filter(|signal| signal.direction_explicit && signal.direction == direction)
                .filter(|signal| StrategyTag::classify(&signal.setup_name) == Some(tag))
                .map(|signal| (signal, composite_score(&signal.performance)))
                .fold(None::<(&Signal, f64)>, |best, candidate| match best {
                    Some((_, best_score)) if candidate.1 <= best_score => best,
                    _ => Some(candidate),
                });

            if let Some((signal, composite_score)) = winner {
                ranked.push(BestSetup {
                    tag,
                    direction,
                    signal: signal.clone(),
                    composite_score,
                });
            }
        }
    }

    ranked
}
