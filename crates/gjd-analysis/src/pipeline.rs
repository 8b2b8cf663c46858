//! End-to-end analysis of one normalized posting.

use std::sync::Arc;

use gjd_core::{
    AnalysisError, ClusterSummary, CorrectionEvent, IdentifyOutcome, NormalizedPosting,
    PlatformClassification, PlatformKind, ScoreResult,
};
use gjd_storage::{get_json, put_json, with_deadline, FingerprintStore, KeyValueStore};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::canonicalize::Canonicalizer;
use crate::company::{CompanyKey, CompanyNormalizer, CompanyRegistrySnapshot, REGISTRY_SNAPSHOT_KEY};
use crate::config::{AnalysisConfig, Rules};
use crate::dedup::{DuplicateConfig, DuplicateIndex};
use crate::feedback::{FeedbackConfig, FeedbackHandle, FeedbackLoop, FeedbackStats};
use crate::scoring::ScoringEngine;
use crate::weights::{WeightStore, WeightTable, WEIGHTS_SNAPSHOT_KEY};

const SNAPSHOT_STORE: &str = "snapshot-store";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub analysis_id: Uuid,
    pub platform: PlatformKind,
    pub classification: Option<PlatformClassification>,
    pub company_key: CompanyKey,
    pub identity: IdentifyOutcome,
    /// Absent when an earlier analysis of the same identity stands.
    pub score: Option<ScoreResult>,
    pub degraded_fields: Vec<String>,
}

pub struct Analyzer {
    config: AnalysisConfig,
    canonicalizer: Canonicalizer,
    companies: Arc<CompanyNormalizer>,
    index: DuplicateIndex,
    scoring: ScoringEngine,
    weights: WeightStore,
    feedback: FeedbackHandle,
    snapshots: Option<Arc<dyn KeyValueStore>>,
}

impl Analyzer {
    /// Builds an analyzer from rule defaults and starts its feedback worker.
    pub fn new(
        config: AnalysisConfig,
        rules: Rules,
        fingerprints: Arc<dyn FingerprintStore>,
        snapshots: Option<Arc<dyn KeyValueStore>>,
    ) -> (Self, JoinHandle<FeedbackStats>) {
        Self::build(config, rules, fingerprints, snapshots, None, None)
    }

    /// Like [`Analyzer::new`], but resumes from the weight and company
    /// snapshots found in `snapshots`.
    pub async fn restore(
        config: AnalysisConfig,
        rules: Rules,
        fingerprints: Arc<dyn FingerprintStore>,
        snapshots: Arc<dyn KeyValueStore>,
    ) -> Result<(Self, JoinHandle<FeedbackStats>), AnalysisError> {
        let deadline = config.store_timeout;
        let table: Option<WeightTable> = with_deadline(
            "weights get",
            deadline,
            get_json(snapshots.as_ref(), WEIGHTS_SNAPSHOT_KEY),
        )
        .await
        .map_err(|err| err.unavailable(SNAPSHOT_STORE))?;
        let registry: Option<CompanyRegistrySnapshot> = with_deadline(
            "registry get",
            deadline,
            get_json(snapshots.as_ref(), REGISTRY_SNAPSHOT_KEY),
        )
        .await
        .map_err(|err| err.unavailable(SNAPSHOT_STORE))?;
        info!(
            weights_version = table.as_ref().map(|t| t.version),
            companies = registry.as_ref().map(|r| r.keys.len()),
            "restoring analyzer state"
        );
        Ok(Self::build(config, rules, fingerprints, Some(snapshots), table, registry))
    }

    fn build(
        config: AnalysisConfig,
        rules: Rules,
        fingerprints: Arc<dyn FingerprintStore>,
        snapshots: Option<Arc<dyn KeyValueStore>>,
        table: Option<WeightTable>,
        registry: Option<CompanyRegistrySnapshot>,
    ) -> (Self, JoinHandle<FeedbackStats>) {
        let companies = Arc::new(CompanyNormalizer::new(
            &rules.companies,
            config.company_similarity_threshold,
        ));
        if let Some(registry) = registry {
            companies.restore(registry);
        }

        let mut table = table.unwrap_or_else(|| WeightTable::from_rules(&rules.scoring));
        for seed in &rules.companies.verified_companies {
            let key = companies.normalize(&seed.name);
            let count = table.verified_companies.entry(key).or_insert(0);
            *count = (*count).max(seed.verified_postings);
        }

        let (weights, publisher) = WeightStore::new(table);
        let (feedback, worker) = FeedbackLoop::spawn(
            FeedbackConfig::from(&config),
            publisher,
            Arc::clone(&companies),
            snapshots.clone(),
        );
        let analyzer = Self {
            canonicalizer: Canonicalizer::new(weights.clone()),
            index: DuplicateIndex::new(fingerprints, DuplicateConfig::from(&config)),
            scoring: ScoringEngine::new(rules.scoring),
            companies,
            weights,
            feedback,
            snapshots,
            config,
        };
        (analyzer, worker)
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn weights(&self) -> &WeightStore {
        &self.weights
    }

    pub fn feedback(&self) -> &FeedbackHandle {
        &self.feedback
    }

    pub fn companies(&self) -> &CompanyNormalizer {
        &self.companies
    }

    pub fn index(&self) -> &DuplicateIndex {
        &self.index
    }

    pub fn classify(&self, url: &str) -> Result<PlatformClassification, AnalysisError> {
        self.canonicalizer.classify(url)
    }

    pub fn normalize_company(&self, raw: &str) -> CompanyKey {
        self.companies.normalize(raw)
    }

    pub async fn identify(
        &self,
        posting: &NormalizedPosting,
    ) -> Result<IdentifyOutcome, AnalysisError> {
        self.index.identify(posting).await
    }

    /// Scores against the weight snapshot current at call time.
    pub fn score(&self, posting: &NormalizedPosting, cluster: &ClusterSummary) -> ScoreResult {
        self.scoring.score(posting, cluster, &self.weights.snapshot())
    }

    pub fn apply_correction(&self, event: CorrectionEvent) -> Result<(), AnalysisError> {
        self.feedback.apply_correction(event)
    }

    pub async fn analyze(
        &self,
        posting: &NormalizedPosting,
    ) -> Result<AnalysisOutcome, AnalysisError> {
        let analysis_id = Uuid::new_v4();
        let span = info_span!("analyze", %analysis_id, company = %posting.company);
        self.analyze_inner(analysis_id, posting).instrument(span).await
    }

    async fn analyze_inner(
        &self,
        analysis_id: Uuid,
        posting: &NormalizedPosting,
    ) -> Result<AnalysisOutcome, AnalysisError> {
        // One snapshot for the whole request.
        let weights = self.weights.snapshot();
        if let Err(err) = posting.validate() {
            warn!(error = %err, "continuing in degraded mode");
        }
        let degraded_fields: Vec<String> = posting
            .missing_fields()
            .into_iter()
            .map(str::to_string)
            .collect();

        let source_url = posting
            .source_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty());
        let classification = match source_url {
            Some(url) => {
                let classification = self.canonicalizer.classify_with(url, &weights)?;
                self.feedback.observe_tier(classification.observation(), true);
                Some(classification)
            }
            None => None,
        };

        let company_key = self.companies.normalize(&posting.company);
        let resolved = match &classification {
            Some(classification) => posting.with_classification(classification),
            None => posting.clone(),
        }
        .with_company_key(company_key.clone());

        let identity = self.index.identify(&resolved).await?;
        let score = identity
            .needs_scoring()
            .then(|| self.scoring.score(&resolved, identity.cluster(), &weights));

        info!(
            cluster = %identity.cluster_id(),
            new = identity.is_new(),
            probability = score.as_ref().map(|s| s.probability),
            degraded = !degraded_fields.is_empty(),
            "posting analyzed"
        );
        Ok(AnalysisOutcome {
            analysis_id,
            platform: resolved.platform,
            classification,
            company_key,
            identity,
            score,
            degraded_fields,
        })
    }

    /// Writes the current weights and company registry to the snapshot store.
    pub async fn persist_snapshots(&self) -> Result<(), AnalysisError> {
        let Some(store) = self.snapshots.as_ref() else {
            return Ok(());
        };
        let deadline = self.config.store_timeout;
        let table = self.weights.snapshot();
        with_deadline(
            "weights put",
            deadline,
            put_json(store.as_ref(), WEIGHTS_SNAPSHOT_KEY, table.as_ref()),
        )
        .await
        .map_err(|err| err.unavailable(SNAPSHOT_STORE))?;
        with_deadline(
            "registry put",
            deadline,
            put_json(store.as_ref(), REGISTRY_SNAPSHOT_KEY, &self.companies.snapshot()),
        )
        .await
        .map_err(|err| err.unavailable(SNAPSHOT_STORE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use gjd_core::{ExtractionTier, JobBoard};
    use gjd_storage::{MemoryFingerprintStore, MemoryKeyValueStore};

    fn posting(url: Option<&str>) -> NormalizedPosting {
        let received = Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).single().unwrap();
        let mut posting =
            NormalizedPosting::new("Site Reliability Engineer", "Microsoft Corporation", received);
        posting.location = Some("Redmond, WA".into());
        posting.source_url = url.map(str::to_string);
        posting
    }

    fn analyzer() -> (Analyzer, JoinHandle<FeedbackStats>) {
        Analyzer::new(
            AnalysisConfig::default(),
            Rules::default(),
            Arc::new(MemoryFingerprintStore::new()),
            None,
        )
    }

    #[tokio::test]
    async fn verified_seed_companies_resolve_through_suffixes() {
        let (analyzer, _worker) = analyzer();
        assert_eq!(analyzer.weights().snapshot().verified_postings("microsoft"), 12);
        assert_eq!(analyzer.weights().snapshot().verified_postings("google"), 10);

        let outcome = analyzer
            .analyze(&posting(Some("https://www.linkedin.com/jobs/view/3900000001/")))
            .await
            .unwrap();
        assert_eq!(outcome.company_key, "microsoft");
        assert_eq!(outcome.platform, PlatformKind::DirectPlatform);
        let classification = outcome.classification.as_ref().unwrap();
        assert_eq!(classification.board, Some(JobBoard::LinkedIn));
        assert_eq!(classification.tier, ExtractionTier::DirectPath);
        let score = outcome.score.unwrap();
        assert!(score
            .factors
            .iter()
            .any(|f| f.name == gjd_core::FactorName::VerifiedCompany));
    }

    #[tokio::test]
    async fn uploaded_documents_skip_classification() {
        let (analyzer, _worker) = analyzer();
        let outcome = analyzer.analyze(&posting(None)).await.unwrap();
        assert!(outcome.classification.is_none());
        assert!(outcome.identity.is_new());
        assert_eq!(outcome.degraded_fields, vec!["description", "posted_at"]);
    }

    #[tokio::test]
    async fn unrecognized_urls_stop_the_analysis() {
        let (analyzer, _worker) = analyzer();
        let err = analyzer
            .analyze(&posting(Some("https://example.org/about-us")))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::UnrecognizedUrl { .. }));
        assert_eq!(analyzer.index().cluster_count(), 0);
    }

    #[tokio::test]
    async fn snapshots_round_trip_through_the_store() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let (first, _worker) = Analyzer::new(
            AnalysisConfig::default(),
            Rules::default(),
            Arc::new(MemoryFingerprintStore::new()),
            Some(Arc::clone(&store)),
        );
        first.normalize_company("Initech LLC");
        first.persist_snapshots().await.unwrap();

        let (second, _worker) = Analyzer::restore(
            AnalysisConfig::default(),
            Rules::default(),
            Arc::new(MemoryFingerprintStore::new()),
            store,
        )
        .await
        .unwrap();
        assert!(second.companies().snapshot().keys.contains(&"initech".to_string()));
        assert_eq!(second.weights().snapshot().verified_postings("apple"), 8);
    }
}
