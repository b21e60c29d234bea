//! Threshold fractions for multi-block decoding

use serde::{Deserialize, Serialize};

/// Fractions steering block transitions in multi-block mode.
///
/// Values outside `[0, 1]` are accepted; they simply make the comparisons
/// always or never hold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiBlockThresholds {
    /// Whether decoding of a block is complete
    pub decoding_threshold: f64,

    /// Whether a new block should be added
    pub add_block_threshold: f64,

    /// Whether decoding of the next block may start
    pub semi_complete_threshold: f64,
}

impl Default for MultiBlockThresholds {
    fn default() -> Self {
        Self {
            decoding_threshold: 0.95,
            add_block_threshold: 0.50,
            semi_complete_threshold: 0.95,
        }
    }
}

impl MultiBlockThresholds {
    pub fn new(
        decoding_threshold: f64,
        add_block_threshold: f64,
        semi_complete_threshold: f64,
    ) -> Self {
        Self {
            decoding_threshold,
            add_block_threshold,
            semi_complete_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let thresholds = MultiBlockThresholds::default();
        assert_eq!(thresholds.decoding_threshold, 0.95);
        assert_eq!(thresholds.add_block_threshold, 0.50);
        assert_eq!(thresholds.semi_complete_threshold, 0.95);
    }

    #[test]
    fn test_partial_override() {
        let thresholds: MultiBlockThresholds =
            serde_json::from_str(r#"{"add_block_threshold": 0.25}"#).unwrap();
        assert_eq!(thresholds.add_block_threshold, 0.25);
        assert_eq!(thresholds.decoding_threshold, 0.95);
        assert_eq!(thresholds.semi_complete_threshold, 0.95);
    }

    #[test]
    fn test_out_of_range_accepted() {
        let thresholds = MultiBlockThresholds::new(1.5, -0.1, 2.0);
        assert_eq!(thresholds.decoding_threshold, 1.5);
        assert_eq!(thresholds.add_block_threshold, -0.1);
    }
}
