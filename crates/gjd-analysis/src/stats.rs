//! Aggregates over the analyses of one run.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use gjd_core::{PlatformKind, RiskLevel};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::AnalysisOutcome;

const TOP_COMPANIES: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub analysis_id: Uuid,
    pub company_key: String,
    pub platform: PlatformKind,
    pub probability: f64,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyInsight {
    pub company_key: String,
    pub total_posts: u64,
    pub ghost_posts: u64,
    pub avg_probability: f64,
    pub min_probability: f64,
    pub max_probability: f64,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStats {
    pub total_analyses: u64,
    pub avg_ghost_probability: f64,
    pub high_risk_count: u64,
    pub medium_risk_count: u64,
    pub low_risk_count: u64,
    pub platform_breakdown: BTreeMap<PlatformKind, u64>,
    pub top_ghost_companies: Vec<CompanyInsight>,
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Append-only record of scored analyses.
#[derive(Debug, Default)]
pub struct RunLedger {
    entries: RwLock<Vec<LedgerEntry>>,
}

impl RunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a scored outcome. Outcomes that reused an earlier analysis
    /// carry no score and are skipped.
    pub fn record(&self, outcome: &AnalysisOutcome) -> bool {
        let Some(score) = outcome.score.as_ref() else {
            return false;
        };
        self.push(LedgerEntry {
            analysis_id: outcome.analysis_id,
            company_key: outcome.company_key.clone(),
            platform: outcome.platform,
            probability: score.probability,
            risk_level: score.risk_level,
        });
        true
    }

    pub fn push(&self, entry: LedgerEntry) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recent first.
    pub fn history(&self, limit: usize) -> Vec<LedgerEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> AnalysisStats {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        if entries.is_empty() {
            return AnalysisStats::default();
        }

        let mut stats = AnalysisStats {
            total_analyses: entries.len() as u64,
            ..AnalysisStats::default()
        };
        let mut by_company: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        let mut sum = 0.0;
        for entry in entries.iter() {
            sum += entry.probability;
            match RiskLevel::from_probability(entry.probability) {
                RiskLevel::High => stats.high_risk_count += 1,
                RiskLevel::Medium => stats.medium_risk_count += 1,
                RiskLevel::Low => stats.low_risk_count += 1,
            }
            *stats.platform_breakdown.entry(entry.platform).or_insert(0) += 1;
            by_company
                .entry(entry.company_key.as_str())
                .or_default()
                .push(entry.probability);
        }
        stats.avg_ghost_probability = round3(sum / entries.len() as f64);

        let mut companies: Vec<CompanyInsight> = by_company
            .into_iter()
            .map(|(key, probabilities)| {
                let total = probabilities.len() as f64;
                let avg = probabilities.iter().sum::<f64>() / total;
                let min = probabilities.iter().copied().fold(f64::INFINITY, f64::min);
                let max = probabilities.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                CompanyInsight {
                    company_key: key.to_string(),
                    total_posts: probabilities.len() as u64,
                    ghost_posts: probabilities
                        .iter()
                        .filter(|p| **p >= RiskLevel::HIGH_THRESHOLD)
                        .count() as u64,
                    avg_probability: round3(avg),
                    min_probability: round3(min),
                    max_probability: round3(max),
                    risk_level: RiskLevel::from_probability(avg),
                }
            })
            .collect();
        companies.sort_by(|a, b| {
            b.avg_probability
                .total_cmp(&a.avg_probability)
                .then_with(|| a.company_key.cmp(&b.company_key))
        });
        companies.truncate(TOP_COMPANIES);
        stats.top_ghost_companies = companies;
        stats
    }
}
