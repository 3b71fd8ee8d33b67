use serde::Serialize;

/// Nearest-rank percentile over an ascending slice.
pub fn percentile(sorted: &[i64], p: f64) -> Option<i64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DurationStats {
    pub count: usize,
    pub avg_ms: Option<f64>,
    pub min_ms: Option<i64>,
    pub max_ms: Option<i64>,
    pub p50_ms: Option<i64>,
    pub p90_ms: Option<i64>,
    pub p99_ms: Option<i64>,
}

impl DurationStats {
    /// Non-positive durations are dropped before any statistic is taken.
    pub fn from_durations(durations: impl IntoIterator<Item = i64>) -> Self {
        let mut values: Vec<i64> = durations.into_iter().filter(|d| *d > 0).collect();
        if values.is_empty() {
            return Self::default();
        }
        values.sort_unstable();

        let sum: i64 = values.iter().sum();
        Self {
            count: values.len(),
            avg_ms: Some(sum as f64 / values.len() as f64),
            min_ms: values.first().copied(),
            max_ms: values.last().copied(),
            p50_ms: percentile(&values, 50.0),
            p90_ms: percentile(&values, 90.0),
            p99_ms: percentile(&values, 99.0),
        }
    }
}

/// `part / total` as a percentage, zero when `total` is zero.
pub fn rate(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_rank_matches_known_values() {
        let values: Vec<i64> = (1..=10).map(|v| v * 100).collect();
        assert_eq!(percentile(&values, 50.0), Some(500));
        assert_eq!(percentile(&values, 90.0), Some(900));
        assert_eq!(percentile(&values, 99.0), Some(1000));
        assert_eq!(percentile(&values, 0.0), Some(100));
        assert_eq!(percentile(&[], 50.0), None);
        assert_eq!(percentile(&[7], 99.0), Some(7));
    }

    #[test]
    fn stats_exclude_non_positive_durations() {
        let stats = DurationStats::from_durations([0, -5, 300, 100, 200]);
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min_ms, Some(100));
        assert_eq!(stats.max_ms, Some(300));
        assert_eq!(stats.avg_ms, Some(200.0));
    }

    #[test]
    fn percentiles_are_monotonic() {
        let seeds = [13_i64, 1, 999, 42, 42, 7, 500, 3, 88, 1_000_000, 5];
        for len in 1..=seeds.len() {
            let stats = DurationStats::from_durations(seeds[..len].iter().copied());
            let (p50, p90, p99) = (stats.p50_ms, stats.p90_ms, stats.p99_ms);
            assert!(p50 <= p90 && p90 <= p99, "len {len}: {p50:?} {p90:?} {p99:?}");
            assert!(stats.min_ms <= p50 && p99 <= stats.max_ms);
        }
    }

    #[test]
    fn empty_population_is_all_none() {
        assert_eq!(DurationStats::from_durations([0, -1]), DurationStats::default());
        assert_eq!(rate(3, 0), 0.0);
        assert_eq!(rate(1, 4), 25.0);
    }
}
