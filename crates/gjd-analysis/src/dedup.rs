//! Exact and near-duplicate identity for normalized postings.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gjd_core::{
    AnalysisError, ClusterId, ClusterSummary, Fingerprint, IdentifyOutcome, NormalizedPosting,
};
use gjd_storage::{content_hash, with_deadline, FingerprintStore};
use tracing::{debug, warn};

use crate::config::AnalysisConfig;

const FINGERPRINT_STORE: &str = "fingerprint-store";
const SHINGLE_WIDTH: usize = 3;

pub fn normalize_key_fragment(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn location_key(posting: &NormalizedPosting) -> Option<String> {
    match posting.location_text() {
        Some(location) => Some(normalize_key_fragment(location)).filter(|l| !l.is_empty()),
        None if posting.remote => Some("remote".to_string()),
        None => None,
    }
}

/// Exact-duplicate key over company, title, location and canonical id.
pub fn fingerprint(posting: &NormalizedPosting) -> Fingerprint {
    let title = normalize_key_fragment(&posting.title);
    let location = location_key(posting).unwrap_or_default();
    content_hash([
        posting.company_key.as_deref().unwrap_or_default(),
        title.as_str(),
        location.as_str(),
        posting.canonical_job_id.as_deref().unwrap_or_default(),
    ])
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityWeights {
    pub title: f64,
    pub description: f64,
    pub location: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            title: 0.4,
            description: 0.4,
            location: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityVector {
    pub company_key: String,
    pub title_tokens: BTreeSet<String>,
    pub location: Option<String>,
    pub shingles: BTreeSet<String>,
}

impl SimilarityVector {
    pub fn from_posting(posting: &NormalizedPosting) -> Self {
        let title_tokens = normalize_key_fragment(&posting.title)
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let words: Vec<String> = posting
            .description_text()
            .map(normalize_key_fragment)
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let shingles = if words.len() < SHINGLE_WIDTH {
            Some(words.join(" "))
                .filter(|w| !w.is_empty())
                .into_iter()
                .collect()
        } else {
            words.windows(SHINGLE_WIDTH).map(|w| w.join(" ")).collect()
        };
        Self {
            company_key: posting.company_key.clone().unwrap_or_default(),
            title_tokens,
            location: location_key(posting),
            shingles,
        }
    }

    /// Weighted overlap in [0, 1]. Without a description on both sides the
    /// description weight drops out and the rest is renormalized.
    pub fn similarity(&self, other: &Self, weights: SimilarityWeights) -> f64 {
        let title = jaccard(&self.title_tokens, &other.title_tokens);
        let location = match (&self.location, &other.location) {
            (Some(a), Some(b)) if a == b => 1.0,
            _ => 0.0,
        };
        if self.shingles.is_empty() || other.shingles.is_empty() {
            let total = weights.title + weights.location;
            if total <= 0.0 {
                return 0.0;
            }
            return (weights.title * title + weights.location * location) / total;
        }
        let description = jaccard(&self.shingles, &other.shingles);
        weights.title * title + weights.description * description + weights.location * location
    }
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

#[derive(Debug, Clone)]
pub struct DuplicateConfig {
    pub near_duplicate_threshold: f64,
    pub max_candidates_per_company: usize,
    pub store_timeout: Duration,
    pub weights: SimilarityWeights,
}

impl From<&AnalysisConfig> for DuplicateConfig {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            near_duplicate_threshold: config.near_duplicate_threshold,
            max_candidates_per_company: config.max_candidates_per_company,
            store_timeout: config.store_timeout,
            weights: SimilarityWeights::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct ClusterState {
    size: u64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl ClusterState {
    fn summary(&self, cluster_id: ClusterId) -> ClusterSummary {
        ClusterSummary {
            cluster_id,
            size: self.size,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            clustered: self.size > 1,
        }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    cluster: ClusterId,
    vector: SimilarityVector,
}

pub struct DuplicateIndex {
    store: Arc<dyn FingerprintStore>,
    config: DuplicateConfig,
    clusters: DashMap<ClusterId, ClusterState>,
    /// Most recent first, bounded per company key.
    candidates: DashMap<String, VecDeque<Candidate>>,
}

impl DuplicateIndex {
    pub fn new(store: Arc<dyn FingerprintStore>, config: DuplicateConfig) -> Self {
        Self {
            store,
            config,
            clusters: DashMap::new(),
            candidates: DashMap::new(),
        }
    }

    pub async fn identify(
        &self,
        posting: &NormalizedPosting,
    ) -> Result<IdentifyOutcome, AnalysisError> {
        let fingerprint = fingerprint(posting);
        let seen_at = posting.received_at;
        let deadline = self.config.store_timeout;

        let hit = with_deadline("fingerprint get", deadline, self.store.get(&fingerprint))
            .await
            .map_err(|err| err.unavailable(FINGERPRINT_STORE))?;
        if let Some(cluster) = hit {
            debug!(fingerprint = %fingerprint, cluster = %cluster, "exact duplicate");
            return Ok(IdentifyOutcome::Existing {
                cluster: self.summary_or_singleton(cluster, seen_at),
            });
        }

        let vector = SimilarityVector::from_posting(posting);
        let near = self.nearest(&vector);
        let candidate = near
            .map(|(cluster, _)| cluster)
            .unwrap_or_else(|| ClusterId::for_fingerprint(&fingerprint));

        let registration = with_deadline(
            "fingerprint get_or_create",
            deadline,
            self.store.get_or_create(&fingerprint, candidate),
        )
        .await
        .map_err(|err| err.unavailable(FINGERPRINT_STORE))?;

        if registration.existing {
            let conflict = AnalysisError::IdentityConflict {
                cluster: registration.cluster,
            };
            warn!(fingerprint = %fingerprint, error = %conflict, "lost identity race");
            return Ok(IdentifyOutcome::Existing {
                cluster: self.summary_or_singleton(registration.cluster, seen_at),
            });
        }

        let outcome = match near {
            Some((cluster, similarity)) => {
                let summary = self.join(cluster, seen_at);
                debug!(
                    cluster = %cluster,
                    similarity,
                    size = summary.size,
                    "joined near-duplicate cluster"
                );
                IdentifyOutcome::Joined {
                    cluster: ClusterSummary {
                        clustered: true,
                        ..summary
                    },
                    similarity,
                }
            }
            None => {
                let state = self
                    .clusters
                    .entry(registration.cluster)
                    .or_insert_with(|| ClusterState {
                        size: 1,
                        first_seen: seen_at,
                        last_seen: seen_at,
                    });
                let summary = state.summary(registration.cluster);
                drop(state);
                debug!(cluster = %registration.cluster, "cluster created");
                IdentifyOutcome::Created { cluster: summary }
            }
        };
        self.remember(vector, outcome.cluster_id());
        Ok(outcome)
    }

    pub fn cluster(&self, cluster_id: &ClusterId) -> Option<ClusterSummary> {
        self.clusters
            .get(cluster_id)
            .map(|state| state.summary(*cluster_id))
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    fn summary_or_singleton(
        &self,
        cluster_id: ClusterId,
        seen_at: DateTime<Utc>,
    ) -> ClusterSummary {
        self.cluster(&cluster_id)
            .unwrap_or_else(|| ClusterSummary::singleton(cluster_id, seen_at))
    }

    /// Best candidate strictly above the threshold; the older one wins ties.
    fn nearest(&self, vector: &SimilarityVector) -> Option<(ClusterId, f64)> {
        let candidates = self.candidates.get(&vector.company_key)?;
        let mut best: Option<(ClusterId, f64)> = None;
        for candidate in candidates.iter() {
            let score = candidate.vector.similarity(vector, self.config.weights);
            if score <= self.config.near_duplicate_threshold {
                continue;
            }
            if best.map_or(true, |(_, top)| score >= top) {
                best = Some((candidate.cluster, score));
            }
        }
        best
    }

    fn join(&self, cluster_id: ClusterId, seen_at: DateTime<Utc>) -> ClusterSummary {
        let mut state = self.clusters.entry(cluster_id).or_insert_with(|| ClusterState {
            size: 0,
            first_seen: seen_at,
            last_seen: seen_at,
        });
        state.size += 1;
        state.first_seen = state.first_seen.min(seen_at);
        state.last_seen = state.last_seen.max(seen_at);
        state.summary(cluster_id)
    }

    fn remember(&self, vector: SimilarityVector, cluster: ClusterId) {
        let limit = self.config.max_candidates_per_company.max(1);
        let mut list = self.candidates.entry(vector.company_key.clone()).or_default();
        list.push_front(Candidate { cluster, vector });
        list.truncate(limit);
    }
}
