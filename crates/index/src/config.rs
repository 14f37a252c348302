use serde::{Deserialize, Serialize};

use crate::Error;

/// Index maintenance tuning. Deserialized from ledger options; every knob
/// has a default, and `validate` runs once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Config {
    /// Novelty size at which a refresh becomes worthwhile.
    #[serde(default = "default_reindex_min_bytes")]
    pub reindex_min_bytes: u64,
    /// Novelty size at which staging should push back on new transactions.
    #[serde(default = "default_reindex_max_bytes")]
    pub reindex_max_bytes: u64,
    /// Superseded index roots retained before pruning.
    #[serde(default = "default_max_old_indexes")]
    pub max_old_indexes: u32,
    /// Leaf size at which a split is forced.
    #[serde(default = "default_overflow_bytes")]
    pub overflow_bytes: u64,
    /// Leaf size below which a merge with a sibling is preferred.
    #[serde(default = "default_underflow_bytes")]
    pub underflow_bytes: u64,
    /// Branch fanout at which children are regrouped.
    #[serde(default = "default_overflow_children")]
    pub overflow_children: usize,
}

fn default_reindex_min_bytes() -> u64 {
    100_000
}
fn default_reindex_max_bytes() -> u64 {
    1_000_000
}
fn default_max_old_indexes() -> u32 {
    3
}
fn default_overflow_bytes() -> u64 {
    500_000
}
fn default_underflow_bytes() -> u64 {
    50_000
}
fn default_overflow_children() -> usize {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reindex_min_bytes: default_reindex_min_bytes(),
            reindex_max_bytes: default_reindex_max_bytes(),
            max_old_indexes: default_max_old_indexes(),
            overflow_bytes: default_overflow_bytes(),
            underflow_bytes: default_underflow_bytes(),
            overflow_children: default_overflow_children(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.reindex_min_bytes > self.reindex_max_bytes {
            return Err(Error::InvalidConfig(format!(
                "reindexMinBytes ({}) exceeds reindexMaxBytes ({})",
                self.reindex_min_bytes, self.reindex_max_bytes
            )));
        }
        if self.underflow_bytes >= self.overflow_bytes {
            return Err(Error::InvalidConfig(format!(
                "underflowBytes ({}) must be below overflowBytes ({})",
                self.underflow_bytes, self.overflow_bytes
            )));
        }
        if self.overflow_children < 2 {
            return Err(Error::InvalidConfig(
                "overflowChildren must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}
