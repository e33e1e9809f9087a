//! Router tuning handed to the external routing algorithm.
//!
//! The numbers are opaque to this crate; it only selects and merges them per
//! network and per requested quote speed.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolPoolSelection {
    pub top_n: u32,
    pub top_n_direct_swaps: u32,
    pub top_n_token_in_out: u32,
    pub top_n_second_hop: u32,
    pub top_n_with_each_base_token: u32,
    pub top_n_with_base_token: u32,
}

impl ProtocolPoolSelection {
    /// Single candidate per bucket, no second hop.
    pub const fn minimal() -> Self {
        Self {
            top_n: 1,
            top_n_direct_swaps: 1,
            top_n_token_in_out: 1,
            top_n_second_hop: 0,
            top_n_with_each_base_token: 1,
            top_n_with_base_token: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub v2_pool_selection: ProtocolPoolSelection,
    pub v3_pool_selection: ProtocolPoolSelection,
    pub max_swaps_per_path: u32,
    pub min_splits: u32,
    pub max_splits: u32,
    pub distribution_percent: u32,
    pub force_cross_protocol: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            v2_pool_selection: ProtocolPoolSelection {
                top_n: 3,
                top_n_direct_swaps: 1,
                top_n_token_in_out: 5,
                top_n_second_hop: 2,
                top_n_with_each_base_token: 2,
                top_n_with_base_token: 6,
            },
            v3_pool_selection: ProtocolPoolSelection {
                top_n: 2,
                top_n_direct_swaps: 2,
                top_n_token_in_out: 2,
                top_n_second_hop: 1,
                top_n_with_each_base_token: 3,
                top_n_with_base_token: 3,
            },
            max_swaps_per_path: 3,
            min_splits: 1,
            max_splits: 7,
            distribution_percent: 10,
            force_cross_protocol: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteSpeed {
    #[default]
    Standard,
    Fast,
}

impl FromStr for QuoteSpeed {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(QuoteSpeed::Standard),
            "fast" => Ok(QuoteSpeed::Fast),
            other => Err(ProviderError::InvalidRequest(format!(
                "unknown quote speed '{other}'"
            ))),
        }
    }
}

/// Partial override of [`RoutingConfig`] for one quote speed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuoteSpeedConfig {
    pub v2_pool_selection: Option<ProtocolPoolSelection>,
    pub v3_pool_selection: Option<ProtocolPoolSelection>,
    pub max_swaps_per_path: Option<u32>,
    pub max_splits: Option<u32>,
    pub distribution_percent: Option<u32>,
    pub write_to_cached_routes: Option<bool>,
}

impl QuoteSpeedConfig {
    pub fn for_speed(speed: QuoteSpeed) -> Self {
        match speed {
            QuoteSpeed::Standard => Self::default(),
            QuoteSpeed::Fast => Self {
                v2_pool_selection: Some(ProtocolPoolSelection::minimal()),
                v3_pool_selection: Some(ProtocolPoolSelection::minimal()),
                max_swaps_per_path: Some(2),
                max_splits: Some(1),
                distribution_percent: Some(100),
                write_to_cached_routes: Some(false),
            },
        }
    }

    /// Cached routes are written unless the preset turns it off.
    pub fn writes_cached_routes(&self) -> bool {
        self.write_to_cached_routes.unwrap_or(true)
    }

    pub fn apply(&self, base: &RoutingConfig) -> RoutingConfig {
        RoutingConfig {
            v2_pool_selection: self.v2_pool_selection.unwrap_or(base.v2_pool_selection),
            v3_pool_selection: self.v3_pool_selection.unwrap_or(base.v3_pool_selection),
            max_swaps_per_path: self.max_swaps_per_path.unwrap_or(base.max_swaps_per_path),
            min_splits: base.min_splits,
            max_splits: self.max_splits.unwrap_or(base.max_splits),
            distribution_percent: self
                .distribution_percent
                .unwrap_or(base.distribution_percent),
            force_cross_protocol: base.force_cross_protocol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_speed_keeps_defaults() {
        let base = RoutingConfig::default();
        let merged = QuoteSpeedConfig::for_speed(QuoteSpeed::Standard).apply(&base);
        assert_eq!(merged, base);
        assert!(QuoteSpeedConfig::for_speed(QuoteSpeed::Standard).writes_cached_routes());
    }

    #[test]
    fn test_fast_speed_narrows_search_and_skips_cache_writes() {
        let fast = QuoteSpeedConfig::for_speed(QuoteSpeed::Fast);
        let merged = fast.apply(&RoutingConfig::default());
        assert_eq!(merged.max_splits, 1);
        assert_eq!(merged.max_swaps_per_path, 2);
        assert_eq!(merged.distribution_percent, 100);
        assert_eq!(merged.v3_pool_selection.top_n_second_hop, 0);
        assert_eq!(merged.min_splits, 1);
        assert!(!fast.writes_cached_routes());
    }

    #[test]
    fn test_quote_speed_parsing() {
        assert_eq!("FAST".parse::<QuoteSpeed>().unwrap(), QuoteSpeed::Fast);
        assert!("turbo".parse::<QuoteSpeed>().is_err());
    }
}
