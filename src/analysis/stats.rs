use serde::{Deserialize, Serialize};

/// Arithmetic mean; `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (n - 1). Zero for fewer than two samples.
pub fn std_dev(values: &[f64]) -> f64 {
    let Some(m) = mean(values) else {
        return 0.0;
    };
    if values.len() < 2 {
        return 0.0;
    }
    let variance_sum: f64 = values
        .iter()
        .map(|v| {
            let diff = m - *v;
            diff * diff
        })
        .sum();
    (variance_sum / (values.len() - 1) as f64).sqrt()
}

/// Percentile with linear interpolation between closest ranks.
///
/// `sorted` must be ascending; `percent` is in `[0, 100]`.
pub fn percentile(sorted: &[f64], percent: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let index = (sorted.len() - 1) as f64 * percent.clamp(0.0, 100.0) / 100.0;
    let lower = index.floor() as usize;
    let upper = lower + 1;
    if upper >= sorted.len() {
        return Some(sorted[lower]);
    }
    let fraction = index - lower as f64;
    Some(sorted[lower] * (1.0 - fraction) + sorted[upper] * fraction)
}

/// Distribution summary of a set of samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    #[serde(rename = "p99.9")]
    pub p99_9: f64,
}

impl Summary {
    /// `None` when there are no samples. NaNs are discarded.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        let mut sorted: Vec<f64> = samples.iter().copied().filter(|v| !v.is_nan()).collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);

        Some(Self {
            count: sorted.len(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean: mean(&sorted)?,
            median: percentile(&sorted, 50.0)?,
            std_dev: std_dev(&sorted),
            p90: percentile(&sorted, 90.0)?,
            p95: percentile(&sorted, 95.0)?,
            p99: percentile(&sorted, 99.0)?,
            p99_9: percentile(&sorted, 99.9)?,
        })
    }
}

impl Summary {
    /// Summary from percentiles a tool already computed, given as
    /// `(percent, value)` points in any order. `min` and `max` anchor the 0th
    /// and 100th percentiles; anything between reported points is linearly
    /// interpolated.
    pub fn from_reported(
        count: usize,
        min: f64,
        max: f64,
        mean: f64,
        std_dev: f64,
        points: &[(f64, f64)],
    ) -> Option<Self> {
        if count == 0 || [min, max, mean].iter().any(|v| !v.is_finite()) {
            return None;
        }
        let mut curve: Vec<(f64, f64)> = points
            .iter()
            .copied()
            .filter(|(p, v)| (0.0..=100.0).contains(p) && v.is_finite())
            .collect();
        curve.push((0.0, min));
        curve.push((100.0, max));
        curve.sort_by(|a, b| a.0.total_cmp(&b.0));

        let at = |pct: f64| -> f64 {
            let upper = curve.iter().position(|(p, _)| *p >= pct).unwrap_or(curve.len() - 1);
            if upper == 0 {
                return curve[0].1;
            }
            let (p0, v0) = curve[upper - 1];
            let (p1, v1) = curve[upper];
            if p1 == p0 || p1 == pct {
                return v1;
            }
            v0 + (v1 - v0) * (pct - p0) / (p1 - p0)
        };

        Some(Self {
            count,
            min,
            max,
            mean,
            median: at(50.0),
            std_dev,
            p90: at(90.0),
            p95: at(95.0),
            p99: at(99.0),
            p99_9: at(99.9),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_std_dev() {
        let v = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(mean(&v), Some(5.0));
        // Sample variance = 32 / 7
        assert!((std_dev(&v) - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
        assert_eq!(mean(&[]), None);
        assert_eq!(std_dev(&[3.0]), 0.0);
    }

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&sorted, 0.0), Some(1.0));
        assert_eq!(percentile(&sorted, 100.0), Some(4.0));
        assert_eq!(percentile(&sorted, 50.0), Some(2.5));
        // index = 3 * 0.9 = 2.7
        assert!((percentile(&sorted, 90.0).unwrap() - 3.7).abs() < 1e-12);
        assert_eq!(percentile(&[], 50.0), None);
        assert_eq!(percentile(&[7.5], 99.9), Some(7.5));
    }

    #[test]
    fn test_summary_of_unsorted_samples() {
        let samples: Vec<f64> = (1..=100).rev().map(|v| v as f64).collect();
        let s = Summary::from_samples(&samples).unwrap();
        assert_eq!(s.count, 100);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 100.0);
        assert_eq!(s.mean, 50.5);
        assert_eq!(s.median, 50.5);
        assert!((s.p99 - 99.01).abs() < 1e-9);
        assert!(s.p99_9 <= s.max && s.p99_9 >= s.p99);
    }

    #[test]
    fn test_summary_skips_nan_and_handles_empty() {
        assert!(Summary::from_samples(&[]).is_none());
        assert!(Summary::from_samples(&[f64::NAN]).is_none());
        let s = Summary::from_samples(&[0.5, f64::NAN, 1.5]).unwrap();
        assert_eq!(s.count, 2);
        assert_eq!(s.mean, 1.0);
    }

    #[test]
    fn test_summary_from_reported_percentiles() {
        let points = [(99.9, 45.0), (50.0, 30.0), (90.0, 33.0), (99.0, 39.0)];
        let s = Summary::from_reported(1000, 27.0, 97.0, 30.8, 3.1, &points).unwrap();
        assert_eq!(s.count, 1000);
        assert_eq!(s.median, 30.0);
        assert_eq!(s.p90, 33.0);
        assert_eq!(s.p99, 39.0);
        assert_eq!(s.p99_9, 45.0);
        // Halfway between 90 (33.0) and 99 (39.0) by percent: 95 is 5/9 of the way.
        assert!((s.p95 - (33.0 + 6.0 * 5.0 / 9.0)).abs() < 1e-9);

        // Only min/max known: straight line between them.
        let bare = Summary::from_reported(10, 10.0, 20.0, 15.0, 1.0, &[]).unwrap();
        assert_eq!(bare.median, 15.0);
        assert!(Summary::from_reported(0, 1.0, 2.0, 1.5, 0.0, &[]).is_none());
    }
}
