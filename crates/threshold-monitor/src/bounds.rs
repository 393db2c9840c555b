//! Acceptable value range

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lower bound used when none is configured
pub const DEFAULT_LOW: f64 = -1024.0;
/// Upper bound used when none is configured
pub const DEFAULT_HIGH: f64 = 1024.0;

/// Acceptable range `(low, high)` for the monitored variable.
///
/// Ordering is not validated. Each side is checked on its own, so an
/// inverted pair (`low > high`) flags every reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundPair {
    pub low: f64,
    pub high: f64,
}

impl BoundPair {
    /// Create a bound pair
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    /// Check if a reading falls outside the range
    pub fn is_out_of_range(&self, value: f64) -> bool {
        value < self.low || value > self.high
    }
}

impl Default for BoundPair {
    fn default() -> Self {
        Self::new(DEFAULT_LOW, DEFAULT_HIGH)
    }
}

impl fmt::Display for BoundPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.low, self.high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_edges_are_in_range() {
        let bounds = BoundPair::new(0.0, 100.0);
        assert!(!bounds.is_out_of_range(0.0));
        assert!(!bounds.is_out_of_range(100.0));
        assert!(!bounds.is_out_of_range(57.345));
        assert!(bounds.is_out_of_range(-0.01));
        assert!(bounds.is_out_of_range(100.01));
    }

    #[test]
    fn test_inverted_bounds_flag_everything() {
        let bounds = BoundPair::new(100.0, 0.0);
        assert!(bounds.is_out_of_range(50.0));
        assert!(bounds.is_out_of_range(0.0));
        assert!(bounds.is_out_of_range(100.0));
        assert!(bounds.is_out_of_range(-5.0));
    }

    #[test]
    fn test_nan_is_never_out_of_range() {
        assert!(!BoundPair::default().is_out_of_range(f64::NAN));
    }

    #[test]
    fn test_default_bounds() {
        assert_eq!(BoundPair::default(), BoundPair::new(-1024.0, 1024.0));
        assert_eq!(BoundPair::default().to_string(), "[-1024, 1024]");
    }

    proptest! {
        #[test]
        fn prop_out_of_range_iff_either_side(
            low in -1.0e6f64..1.0e6,
            high in -1.0e6f64..1.0e6,
            value in -2.0e6f64..2.0e6,
        ) {
            let bounds = BoundPair::new(low, high);
            prop_assert_eq!(bounds.is_out_of_range(value), value < low || value > high);
            if low > high {
                prop_assert!(bounds.is_out_of_range(value));
            }
        }
    }
}
