//! Runtime-configured histogram bucket boundaries.

use thiserror::Error;

/// Error returned when a user-supplied bucket list is invalid.
#[derive(Debug, Error)]
pub enum BucketsError {
    /// The bucket list was empty (after stripping a trailing `+Inf`, if any).
    #[error("bucket list must contain at least one boundary")]
    Empty,
    /// Bucket boundaries were not strictly increasing.
    #[error("bucket boundaries must be strictly increasing, got {0} after {1}")]
    NotIncreasing(f64, f64),
    /// A boundary was not a finite, non-NaN number (other than a single trailing `+Inf`).
    #[error("bucket boundary {0} is not a finite number")]
    NotFinite(f64),
}

/// Ascending, finite histogram bucket boundaries.
///
/// The implicit `+Inf` bucket that every Prometheus histogram carries is *not* stored here;
/// [`prometheus_client`]'s `Histogram` adds it automatically when a metric is constructed from
/// these boundaries. Per the configuration schema, a trailing `+Inf` in the user's YAML list is
/// informational only and is stripped on construction rather than passed through twice.
#[derive(Debug, Clone, PartialEq)]
pub struct Buckets(Vec<f64>);

impl Buckets {
    /// The default bucket set used when a `histograms` entry has an empty or absent value,
    /// matching the upstream Python client's `Histogram.DEFAULT_BUCKETS`.
    pub fn default_buckets() -> Self {
        Self(vec![
            0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
        ])
    }

    /// Validates and builds a bucket list from user-supplied values.
    ///
    /// A trailing `+Inf` is tolerated and stripped (see struct docs); any other non-finite value
    /// is rejected.
    pub fn new(mut values: Vec<f64>) -> Result<Self, BucketsError> {
        if values.last().is_some_and(|v| v.is_infinite() && *v > 0.0) {
            values.pop();
        }
        if values.is_empty() {
            return Err(BucketsError::Empty);
        }

        let mut prev = None;
        for &value in &values {
            if !value.is_finite() {
                return Err(BucketsError::NotFinite(value));
            }
            if let Some(prev) = prev {
                if value <= prev {
                    return Err(BucketsError::NotIncreasing(value, prev));
                }
            }
            prev = Some(value);
        }
        Ok(Self(values))
    }

    /// Returns the boundaries in ascending order (without the implicit `+Inf` bucket).
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.0.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepting_plain_values() {
        let buckets = Buckets::new(vec![0.1, 1.0, 2.0]).unwrap();
        assert_eq!(buckets.as_slice(), [0.1, 1.0, 2.0]);
    }

    #[test]
    fn stripping_trailing_infinity() {
        let buckets = Buckets::new(vec![0.1, 1.0, f64::INFINITY]).unwrap();
        assert_eq!(buckets.as_slice(), [0.1, 1.0]);
    }

    #[test]
    fn rejecting_empty_list() {
        assert!(matches!(Buckets::new(vec![]), Err(BucketsError::Empty)));
        assert!(matches!(
            Buckets::new(vec![f64::INFINITY]),
            Err(BucketsError::Empty)
        ));
    }

    #[test]
    fn rejecting_non_increasing_values() {
        assert!(matches!(
            Buckets::new(vec![1.0, 1.0]),
            Err(BucketsError::NotIncreasing(..))
        ));
        assert!(matches!(
            Buckets::new(vec![1.0, 0.5]),
            Err(BucketsError::NotIncreasing(..))
        ));
    }

    #[test]
    fn rejecting_nan() {
        assert!(matches!(
            Buckets::new(vec![f64::NAN]),
            Err(BucketsError::NotFinite(_))
        ));
    }

    #[test]
    fn default_buckets_are_valid() {
        let defaults = Buckets::default_buckets();
        assert!(defaults.as_slice().windows(2).all(|w| w[0] < w[1]));
    }
}
