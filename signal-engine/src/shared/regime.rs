//! Regime change detection over a floored indicator series.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

/// How long a shift event stays displayable
pub const REGIME_SHIFT_LIFETIME_SECS: i64 = 30;

/// Discrete market-condition classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RegimeLabel {
    Bullish,
    Neutral,
    Bearish,
}

impl RegimeLabel {
    /// `>= 2` bullish, `>= 1` neutral, anything lower bearish
    pub fn from_value(value: f64) -> Self {
        if value >= 2.0 {
            RegimeLabel::Bullish
        } else if value >= 1.0 {
            RegimeLabel::Neutral
        } else {
            RegimeLabel::Bearish
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RegimeLabel::Bullish => "BULLISH",
            RegimeLabel::Neutral => "NEUTRAL",
            RegimeLabel::Bearish => "BEARISH",
        }
    }
}

impl std::fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transition between two different floored regime values
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegimeShiftEvent {
    pub from_regime: i64,
    pub to_regime: i64,
    pub observed_at: DateTime<Utc>,
}

impl RegimeShiftEvent {
    pub fn from_label(&self) -> RegimeLabel {
        RegimeLabel::from_value(self.from_regime as f64)
    }

    pub fn to_label(&self) -> RegimeLabel {
        RegimeLabel::from_value(self.to_regime as f64)
    }

    pub fn is_upgrade(&self) -> bool {
        self.to_regime > self.from_regime
    }

    /// True once `lifetime` has elapsed since the shift was observed
    pub fn is_expired(&self, now: DateTime<Utc>, lifetime: ChronoDuration) -> bool {
        now - self.observed_at >= lifetime
    }
}

impl std::fmt::Display for RegimeShiftEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) -> {} ({})",
            self.from_label(),
            self.from_regime,
            self.to_label(),
            self.to_regime
        )
    }
}

/// Remembers the last observed regime and reports transitions.
///
/// Expiry of emitted events is the consumer's job.
#[derive(Debug, Clone, Default)]
pub struct RegimeDetector {
    previous: Option<i64>,
}

impl RegimeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe a raw indicator value.
    ///
    /// Non-finite values are treated as missing and leave the memory untouched.
    pub fn observe(&mut self, raw: f64, now: DateTime<Utc>) -> Option<RegimeShiftEvent> {
        if !raw.is_finite() {
            return None;
        }

        let regime = raw.floor() as i64;
        let shift = match self.previous {
            Some(previous) if previous != regime => Some(RegimeShiftEvent {
                from_regime: previous,
                to_regime: regime,
                observed_at: now,
            }),
            _ => None,
        };

        self.previous = Some(regime);
        shift
    }

    pub fn current(&self) -> Option<i64> {
        self.previous
    }

    pub fn current_label(&self) -> Option<RegimeLabel> {
        self.previous.map(|regime| RegimeLabel::from_value(regime as f64))
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_first_observation_never_emits() {
        let mut detector = RegimeDetector::new();
        assert_eq!(detector.observe(2.7, at(0)), None);
        assert_eq!(detector.current(), Some(2));
    }

    #[test]
    fn test_regime_sequence_scenario() {
        let mut detector = RegimeDetector::new();
        let shifts: Vec<_> = [1.4, 1.9, 2.1, 2.3]
            .into_iter()
            .enumerate()
            .map(|(i, raw)| detector.observe(raw, at(i as i64)))
            .collect();

        assert_eq!(shifts[0], None);
        assert_eq!(shifts[1], None);
        assert_eq!(
            shifts[2],
            Some(RegimeShiftEvent {
                from_regime: 1,
                to_regime: 2,
                observed_at: at(2),
            })
        );
        assert_eq!(shifts[3], None);
    }

    #[test]
    fn test_emits_iff_floor_differs() {
        struct TestCase {
            previous: f64,
            next: f64,
            expected: bool,
        }

        let tests = vec![
            TestCase { previous: 0.2, next: 0.9, expected: false },
            TestCase { previous: 0.9, next: 1.0, expected: true },
            TestCase { previous: 2.0, next: 1.99, expected: true },
            TestCase { previous: -0.5, next: -0.1, expected: false },
            TestCase { previous: -0.1, next: 0.1, expected: true },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let mut detector = RegimeDetector::new();
            detector.observe(test.previous, at(0));
            let actual = detector.observe(test.next, at(1)).is_some();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_identical_values_never_emit_twice() {
        let mut detector = RegimeDetector::new();
        detector.observe(0.5, at(0));
        assert!(detector.observe(1.5, at(1)).is_some());
        assert!(detector.observe(1.5, at(2)).is_none());
        assert!(detector.observe(1.2, at(3)).is_none());
    }

    #[test]
    fn test_non_finite_values_ignored() {
        let mut detector = RegimeDetector::new();
        detector.observe(1.0, at(0));
        assert!(detector.observe(f64::NAN, at(1)).is_none());
        assert_eq!(detector.current(), Some(1));
        assert!(detector.observe(2.0, at(2)).is_some());
    }

    #[test]
    fn test_labels_and_expiry() {
        assert_eq!(RegimeLabel::from_value(2.0), RegimeLabel::Bullish);
        assert_eq!(RegimeLabel::from_value(1.5), RegimeLabel::Neutral);
        assert_eq!(RegimeLabel::from_value(0.99), RegimeLabel::Bearish);

        let event = RegimeShiftEvent {
            from_regime: 0,
            to_regime: 2,
            observed_at: at(100),
        };
        assert!(event.is_upgrade());
        assert_eq!(event.to_string(), "BEARISH (0) -> BULLISH (2)");

        let lifetime = ChronoDuration::seconds(REGIME_SHIFT_LIFETIME_SECS);
        assert!(!event.is_expired(at(129), lifetime));
        assert!(event.is_expired(at(130), lifetime));
    }
}
