//! Row-level outcomes.
//!
//! Bad rows never abort a chunk. Each skipped row carries a typed reason and
//! the chunk keeps a count per reason, so noisy input stays debuggable.

use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Why a CSV row produced no fact
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    #[error("missing region code")]
    MissingRegionCode,

    #[error("invalid region code '{0}'")]
    InvalidRegionCode(String),

    #[error("missing product name")]
    MissingProduct,

    #[error("missing subsector")]
    MissingSubsector,

    #[error("invalid date '{0}'")]
    InvalidDate(String),

    #[error("entity resolution failed: {0}")]
    Resolution(String),
}

impl SkipReason {
    /// Stable key used when aggregating and persisting skip counts
    pub fn kind(&self) -> &'static str {
        match self {
            SkipReason::MissingRegionCode => "missing_region_code",
            SkipReason::InvalidRegionCode(_) => "invalid_region_code",
            SkipReason::MissingProduct => "missing_product",
            SkipReason::MissingSubsector => "missing_subsector",
            SkipReason::InvalidDate(_) => "invalid_date",
            SkipReason::Resolution(_) => "resolution",
        }
    }
}

/// Skipped rows, counted by [`SkipReason::kind`]
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SkipCounts(BTreeMap<&'static str, usize>);

impl SkipCounts {
    pub fn record(&mut self, reason: &SkipReason) {
        *self.0.entry(reason.kind()).or_insert(0) += 1;
    }

    pub fn merge(&mut self, other: &SkipCounts) {
        for (kind, count) in &other.0 {
            *self.0.entry(*kind).or_insert(0) += *count;
        }
    }

    pub fn get(&self, kind: &str) -> usize {
        self.0.get(kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for SkipCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(kind, count)| format!("{}={}", kind, count))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}
