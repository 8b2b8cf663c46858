//! Versioned weight snapshots shared by every scoring request.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use gjd_core::{board_key, ExtractionTier, FactorName, JobBoard};
use serde::{Deserialize, Serialize};

use crate::config::ScoringRules;

pub const WEIGHTS_SNAPSHOT_KEY: &str = "weights/current";

/// Learned multiplier around a configured base weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorWeight {
    pub base: f64,
    /// Running agreement rate in [0, 1]; 0.5 leaves the base untouched.
    pub reliability: f64,
}

impl FactorWeight {
    pub fn new(base: f64) -> Self {
        Self {
            base,
            reliability: 0.5,
        }
    }

    pub fn effective(&self) -> f64 {
        self.base * (0.5 + self.reliability)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightTable {
    pub version: u64,
    pub bias: f64,
    pub factors: BTreeMap<FactorName, FactorWeight>,
    /// Per-board success-rate estimates, keyed by `board_key`.
    #[serde(default)]
    pub tiers: BTreeMap<String, BTreeMap<ExtractionTier, f64>>,
    #[serde(default)]
    pub verified_companies: BTreeMap<String, u32>,
}

impl WeightTable {
    pub fn from_rules(rules: &ScoringRules) -> Self {
        Self {
            version: 0,
            bias: rules.bias,
            factors: rules
                .weights
                .iter()
                .map(|(name, base)| (*name, FactorWeight::new(*base)))
                .collect(),
            tiers: BTreeMap::new(),
            verified_companies: BTreeMap::new(),
        }
    }

    pub fn weight(&self, name: FactorName) -> f64 {
        self.factors
            .get(&name)
            .map(FactorWeight::effective)
            .unwrap_or(0.0)
    }

    pub fn tier_reliability(&self, board: Option<JobBoard>, tier: ExtractionTier) -> f64 {
        self.tiers
            .get(board_key(board))
            .and_then(|rates| rates.get(&tier))
            .copied()
            .unwrap_or_else(|| tier.default_reliability())
    }

    /// Trial order for a board: best observed success rate first, canonical
    /// tier order among equals.
    pub fn tier_order(&self, board: Option<JobBoard>) -> Vec<ExtractionTier> {
        let mut order = ExtractionTier::ALL.to_vec();
        order.sort_by(|a, b| {
            self.tier_reliability(board, *b)
                .total_cmp(&self.tier_reliability(board, *a))
        });
        order
    }

    pub fn verified_postings(&self, company_key: &str) -> u32 {
        self.verified_companies.get(company_key).copied().unwrap_or(0)
    }
}

/// Read side of the weight snapshot. Cloning is cheap and every clone sees
/// the same published table.
#[derive(Debug, Clone)]
pub struct WeightStore {
    current: Arc<RwLock<Arc<WeightTable>>>,
}

/// Sole writer of the weight snapshot. Deliberately not `Clone`.
#[derive(Debug)]
pub struct WeightPublisher {
    current: Arc<RwLock<Arc<WeightTable>>>,
}

impl WeightStore {
    pub fn new(initial: WeightTable) -> (Self, WeightPublisher) {
        let current = Arc::new(RwLock::new(Arc::new(initial)));
        (
            Self {
                current: Arc::clone(&current),
            },
            WeightPublisher { current },
        )
    }

    /// Table to use for the whole of one request.
    pub fn snapshot(&self) -> Arc<WeightTable> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version
    }
}

impl WeightPublisher {
    pub fn current(&self) -> Arc<WeightTable> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Swaps in `table` as the next version and returns what readers will now see.
    pub fn publish(&self, mut table: WeightTable) -> Arc<WeightTable> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        table.version = guard.version + 1;
        let next = Arc::new(table);
        *guard = Arc::clone(&next);
        next
    }
}
