//! Rolling score history for the focus market.
//!
//! Samples are rate limited by a minimum interval, evicted after a fixed retention
//! horizon, and downsampled into fixed time buckets on demand.

use crate::shared::error::SignalError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

/// Samples older than this (relative to the newest sample) are evicted
pub const DEFAULT_RETENTION_SECS: i64 = 5 * 60;
/// Minimum spacing between two retained samples
pub const DEFAULT_MIN_INTERVAL_SECS: i64 = 5;

/// One retained sample of the focus market's score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreHistoryEntry {
    pub timestamp: DateTime<Utc>,
    /// Net score
    pub score: f64,
    pub long_score: f64,
    pub short_score: f64,
    /// Regime indicator observed alongside the score, if any
    pub regime: Option<f64>,
}

/// Bucket size used when reading the history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Raw,
    Min1,
    Min5,
    Min10,
    Min15,
    Min30,
    Hour1,
    /// Any positive duration; non-positive durations read as `Raw`
    Custom(ChronoDuration),
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Raw => "Raw",
            Granularity::Min1 => "1min",
            Granularity::Min5 => "5min",
            Granularity::Min10 => "10min",
            Granularity::Min15 => "15min",
            Granularity::Min30 => "30min",
            Granularity::Hour1 => "1h",
            Granularity::Custom(_) => "custom",
        }
    }

    /// Bucket width in milliseconds, `None` for raw reads
    pub fn bucket_millis(&self) -> Option<i64> {
        let millis = match self {
            Granularity::Raw => return None,
            Granularity::Min1 => 60_000,
            Granularity::Min5 => 5 * 60_000,
            Granularity::Min10 => 10 * 60_000,
            Granularity::Min15 => 15 * 60_000,
            Granularity::Min30 => 30 * 60_000,
            Granularity::Hour1 => 60 * 60_000,
            Granularity::Custom(duration) => duration.num_milliseconds(),
        };
        (millis > 0).then_some(millis)
    }

    pub fn all() -> [Granularity; 7] {
        [
            Granularity::Raw,
            Granularity::Min1,
            Granularity::Min5,
            Granularity::Min10,
            Granularity::Min15,
            Granularity::Min30,
            Granularity::Hour1,
        ]
    }
}

impl std::str::FromStr for Granularity {
    type Err = SignalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Granularity::all()
            .into_iter()
            .find(|granularity| granularity.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| SignalError::InvalidGranularity(value.to_string()))
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Granularity::Custom(duration) => write!(f, "{}ms", duration.num_milliseconds()),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Bounded, time-ordered buffer of score samples
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    entries: VecDeque<ScoreHistoryEntry>,
    retention: ChronoDuration,
    min_interval: ChronoDuration,
}

impl HistoryWindow {
    /// Window with the default 5 minute retention and 5 second sampling gate
    pub fn new() -> Self {
        Self::with_limits(
            ChronoDuration::seconds(DEFAULT_RETENTION_SECS),
            ChronoDuration::seconds(DEFAULT_MIN_INTERVAL_SECS),
        )
    }

    pub fn with_limits(retention: ChronoDuration, min_interval: ChronoDuration) -> Self {
        Self {
            entries: VecDeque::new(),
            retention,
            min_interval,
        }
    }

    /// Record a sample, returning whether it was retained.
    ///
    /// Rejected when the newest entry is less than the minimum interval older than the
    /// sample (this also rejects out-of-order samples). Accepted samples evict every
    /// entry that fell out of the retention horizon.
    pub fn record(&mut self, entry: ScoreHistoryEntry) -> bool {
        if let Some(last) = self.entries.back() {
            if entry.timestamp - last.timestamp < self.min_interval {
                return false;
            }
        }

        let cutoff = entry.timestamp - self.retention;
        self.entries.push_back(entry);

        while self
            .entries
            .front()
            .is_some_and(|oldest| oldest.timestamp < cutoff)
        {
            self.entries.pop_front();
        }

        true
    }

    /// Downsample into fixed buckets, oldest first.
    ///
    /// Each bucket is stamped with its start time and carries the mean of every series;
    /// the regime mean ignores samples without a regime.
    pub fn aggregate(&self, granularity: Granularity) -> Vec<ScoreHistoryEntry> {
        let Some(bucket_ms) = granularity.bucket_millis() else {
            return self.entries.iter().cloned().collect();
        };

        let mut buckets: BTreeMap<i64, BucketAccumulator> = BTreeMap::new();
        for entry in &self.entries {
            let start = entry.timestamp.timestamp_millis().div_euclid(bucket_ms) * bucket_ms;
            buckets.entry(start).or_default().add(entry);
        }

        buckets
            .into_iter()
            .filter_map(|(start, bucket)| {
                DateTime::<Utc>::from_timestamp_millis(start)
                    .map(|timestamp| bucket.finish(timestamp))
            })
            .collect()
    }

    /// Iterate retained entries, oldest first
    pub fn entries(&self) -> impl Iterator<Item = &ScoreHistoryEntry> {
        self.entries.iter()
    }

    /// Most recent `n` entries, newest first
    pub fn recent(&self, n: usize) -> Vec<&ScoreHistoryEntry> {
        self.entries.iter().rev().take(n).collect()
    }

    pub fn latest(&self) -> Option<&ScoreHistoryEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn retention(&self) -> ChronoDuration {
        self.retention
    }

    pub fn min_interval(&self) -> ChronoDuration {
        self.min_interval
    }
}

impl Default for HistoryWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct BucketAccumulator {
    count: usize,
    score_sum: f64,
    long_sum: f64,
    short_sum: f64,
    regime_count: usize,
    regime_sum: f64,
}

impl BucketAccumulator {
    fn add(&mut self, entry: &ScoreHistoryEntry) {
        self.count += 1;
        self.score_sum += entry.score;
        self.long_sum += entry.long_score;
        self.short_sum += entry.short_score;
        if let Some(regime) = entry.regime {
            self.regime_count += 1;
            self.regime_sum += regime;
        }
    }

    fn finish(self, timestamp: DateTime<Utc>) -> ScoreHistoryEntry {
        let n = self.count as f64;
        ScoreHistoryEntry {
            timestamp,
            score: self.score_sum / n,
            long_score: self.long_sum / n,
            short_score: self.short_sum / n,
            regime: (self.regime_count > 0).then(|| self.regime_sum / self.regime_count as f64),
        }
    }
}
