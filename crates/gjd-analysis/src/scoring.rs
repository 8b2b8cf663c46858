//! Multi-factor ghost-probability scoring.
//!
//! Scoring is a pure function of the posting, its cluster summary, the
//! weight snapshot and the rules. Missing fields never fail a score: the
//! signals that need them are skipped and confidence drops instead.

use std::cmp::Ordering;

use gjd_core::{
    ClusterSummary, ConfidenceTier, Direction, Factor, FactorName, NormalizedPosting, RiskLevel,
    ScoreResult,
};

use crate::config::ScoringRules;
use crate::dedup::normalize_key_fragment;
use crate::weights::WeightTable;

const PENALTY_TITLE: f64 = 0.2;
const PENALTY_COMPANY: f64 = 0.1;
const PENALTY_LOCATION: f64 = 0.1;
const PENALTY_DESCRIPTION: f64 = 0.2;
const PENALTY_POSTED_AT: f64 = 0.15;

struct Signal {
    name: FactorName,
    strength: f64,
    detail: String,
}

impl Signal {
    fn new(name: FactorName, strength: f64, detail: impl Into<String>) -> Self {
        Self {
            name,
            strength: strength.clamp(0.0, 1.0),
            detail: detail.into(),
        }
    }
}

fn signals(
    posting: &NormalizedPosting,
    cluster: &ClusterSummary,
    weights: &WeightTable,
    rules: &ScoringRules,
) -> Vec<Signal> {
    let thresholds = &rules.thresholds;
    let mut out = Vec::new();

    if let Some(age) = posting.age_days() {
        let stale = thresholds.stale_after_days;
        if stale > 0 && age > stale {
            let over = ((age - stale) as f64 / stale as f64).min(1.0);
            out.push(Signal::new(
                FactorName::StalePosting,
                0.5 + 0.5 * over,
                format!("Posted {age} days ago, past the {stale}-day freshness window"),
            ));
        }
        let recent = thresholds.recent_within_days;
        if recent > 0 && age <= recent {
            let strength = 1.0 - age as f64 / recent as f64;
            if strength > 0.0 {
                out.push(Signal::new(
                    FactorName::RecentPosting,
                    strength,
                    format!("Posted {age} days ago"),
                ));
            }
        }
    }

    let span = cluster.span_days();
    if cluster.size > 1 && span <= thresholds.repost_window_days {
        out.push(Signal::new(
            FactorName::RepostCluster,
            ((cluster.size - 1) as f64 / 4.0).min(1.0),
            format!("Same posting seen {} times within {span} days", cluster.size),
        ));
    }

    if let Some(description) = posting.description_text() {
        let lower = description.to_lowercase();
        let words = description.split_whitespace().count();
        let min_words = thresholds.min_description_words;
        if min_words > 0 && words < min_words {
            out.push(Signal::new(
                FactorName::ThinDescription,
                1.0 - words as f64 / min_words as f64,
                format!("Description is only {words} words long"),
            ));
        }

        let boilerplate = count_hits(&lower, &rules.boilerplate_phrases);
        if boilerplate > 0 {
            out.push(Signal::new(
                FactorName::BoilerplateLanguage,
                boilerplate as f64 / 3.0,
                format!("Generic recruiting language detected ({boilerplate} phrases)"),
            ));
        }

        if !mentions_compensation(&lower, rules) {
            out.push(Signal::new(
                FactorName::MissingCompensation,
                1.0,
                "No salary or compensation information provided",
            ));
        }

        let markers = count_hits(&lower, &rules.requirement_markers);
        if markers >= thresholds.min_requirement_markers.max(1) {
            out.push(Signal::new(
                FactorName::DetailedRequirements,
                markers as f64 / 6.0,
                format!("Lists {markers} specific requirements"),
            ));
        }
    }

    if !posting.remote {
        match posting.location_text() {
            None => out.push(Signal::new(
                FactorName::VagueLocation,
                1.0,
                "No work location given",
            )),
            Some(location) => {
                let folded = normalize_key_fragment(location);
                let vague = rules
                    .vague_location_terms
                    .iter()
                    .any(|term| folded.contains(&normalize_key_fragment(term)));
                if vague {
                    out.push(Signal::new(
                        FactorName::VagueLocation,
                        0.6,
                        format!("Location \"{location}\" is not specific"),
                    ));
                }
            }
        }
    }

    let verified = posting
        .company_key
        .as_deref()
        .map(|key| weights.verified_postings(key))
        .unwrap_or(0);
    if verified >= 1 {
        out.push(Signal::new(
            FactorName::VerifiedCompany,
            verified as f64 / 5.0,
            format!("Company has {verified} verified legitimate postings"),
        ));
    }

    out
}

fn count_hits(haystack: &str, needles: &[String]) -> usize {
    needles
        .iter()
        .filter(|needle| !needle.is_empty() && haystack.contains(&needle.to_lowercase()))
        .count()
}

/// A compensation match only counts when it does not start inside a
/// boilerplate phrase, so "competitive salary" alone is not a pay range.
fn mentions_compensation(lower: &str, rules: &ScoringRules) -> bool {
    let boilerplate: Vec<(usize, usize)> = rules
        .boilerplate_phrases
        .iter()
        .filter(|phrase| !phrase.is_empty())
        .flat_map(|phrase| {
            let phrase = phrase.to_lowercase();
            lower
                .match_indices(&phrase)
                .map(|(start, hit)| (start, start + hit.len()))
                .collect::<Vec<_>>()
        })
        .collect();
    rules
        .compensation_patterns
        .find_all(lower)
        .any(|(start, _)| !boilerplate.iter().any(|(from, to)| (*from..*to).contains(&start)))
}

fn confidence(posting: &NormalizedPosting, weights: &WeightTable, rules: &ScoringRules) -> f64 {
    let base = posting
        .extraction_tier
        .map(|tier| weights.tier_reliability(posting.board, tier))
        .unwrap_or(rules.thresholds.uploaded_document_confidence);
    let penalty: f64 = posting
        .missing_fields()
        .into_iter()
        .map(|field| match field {
            "title" => PENALTY_TITLE,
            "company" => PENALTY_COMPANY,
            "location" => PENALTY_LOCATION,
            "description" => PENALTY_DESCRIPTION,
            "posted_at" => PENALTY_POSTED_AT,
            _ => 0.0,
        })
        .sum();
    (base - penalty).clamp(0.0, 1.0)
}

/// Scores `posting` against one weight snapshot.
pub fn score(
    posting: &NormalizedPosting,
    cluster: &ClusterSummary,
    weights: &WeightTable,
    rules: &ScoringRules,
) -> ScoreResult {
    let mut factors: Vec<Factor> = signals(posting, cluster, weights, rules)
        .into_iter()
        .map(|signal| Factor {
            name: signal.name,
            direction: signal.name.direction(),
            magnitude: (weights.weight(signal.name) * signal.strength).max(0.0),
            detail: signal.detail,
        })
        .collect();

    if factors.is_empty() {
        factors.push(Factor {
            name: FactorName::BaselineAssessment,
            direction: Direction::Risk,
            magnitude: 0.0,
            detail: "Standard analysis completed with baseline risk assessment".to_string(),
        });
    }

    let logit = factors.iter().fold(weights.bias, |z, factor| match factor.direction {
        Direction::Risk => z + factor.magnitude,
        Direction::Positive => z - factor.magnitude,
    });
    let probability = 1.0 / (1.0 + (-logit).exp());
    let probability = if probability.is_finite() {
        probability.clamp(0.0, 1.0)
    } else {
        0.5
    };

    factors.sort_by(|a, b| match b.magnitude.total_cmp(&a.magnitude) {
        Ordering::Equal => a.name.cmp(&b.name),
        other => other,
    });

    let confidence = confidence(posting, weights, rules);
    ScoreResult {
        probability,
        factors,
        confidence,
        confidence_tier: ConfidenceTier::from_confidence(confidence),
        risk_level: RiskLevel::from_probability(probability),
        clustered: cluster.clustered,
        weights_version: weights.version,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    rules: ScoringRules,
}

impl ScoringEngine {
    pub fn new(rules: ScoringRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &ScoringRules {
        &self.rules
    }

    pub fn score(
        &self,
        posting: &NormalizedPosting,
        cluster: &ClusterSummary,
        weights: &WeightTable,
    ) -> ScoreResult {
        score(posting, cluster, weights, &self.rules)
    }
}
