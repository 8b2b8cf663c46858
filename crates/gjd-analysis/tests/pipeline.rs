use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gjd_analysis::{AnalysisConfig, Analyzer, Rules, RunLedger};
use gjd_core::{
    AnalysisError, ClusterId, CorrectionEvent, ExtractionTier, Fingerprint, IdentifyOutcome,
    JobBoard, NormalizedPosting, OriginHint, PlatformKind, RiskLevel,
};
use gjd_storage::{FingerprintStore, MemoryFingerprintStore, Registration, StoreError};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn rules() -> Rules {
    Rules::from_dir(&workspace_root().join("rules")).expect("shipped rules")
}

fn fixture(name: &str) -> NormalizedPosting {
    let path = workspace_root().join("fixtures/postings").join(name);
    let text = std::fs::read_to_string(&path).expect("fixture");
    serde_json::from_str(&text).expect("fixture json")
}

fn analyzer() -> Analyzer {
    let (analyzer, _worker) = Analyzer::new(
        AnalysisConfig::default(),
        rules(),
        Arc::new(MemoryFingerprintStore::new()),
        None,
    );
    analyzer
}

#[tokio::test]
async fn linkedin_view_and_collections_urls_share_identity() {
    let analyzer = analyzer();
    let view = analyzer.analyze(&fixture("linkedin_view.json")).await.unwrap();
    let collections = analyzer
        .analyze(&fixture("linkedin_collections.json"))
        .await
        .unwrap();

    let view_id = &view.classification.as_ref().unwrap().canonical_id;
    let collections_id = &collections.classification.as_ref().unwrap().canonical_id;
    assert_eq!(view_id, "linkedin:4279149653");
    assert_eq!(collections_id, view_id);
    assert_eq!(view.company_key, collections.company_key);

    assert!(view.identity.is_new());
    assert!(matches!(collections.identity, IdentifyOutcome::Existing { .. }));
    assert_eq!(collections.identity.cluster_id(), view.identity.cluster_id());
    assert!(view.score.is_some());
    assert!(collections.score.is_none());
}

#[tokio::test]
async fn third_party_origin_is_classified_not_rejected() {
    let analyzer = analyzer();
    let outcome = analyzer
        .analyze(&fixture("third_party_origin.json"))
        .await
        .unwrap();

    let classification = outcome.classification.as_ref().unwrap();
    assert_eq!(classification.platform, PlatformKind::ThirdPartyAts);
    assert_eq!(classification.tier, ExtractionTier::OriginSignal);
    assert!(classification
        .hints
        .contains(&OriginHint::ReferredBy { board: JobBoard::LinkedIn }));
    assert_eq!(outcome.company_key, "contoso");

    let score = outcome.score.unwrap();
    assert_eq!(score.risk_level, RiskLevel::High);
    assert!(!score.factors.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_submissions_resolve_to_one_cluster() {
    let analyzer = Arc::new(analyzer());
    let posting = fixture("linkedin_view.json");
    let mut handles = Vec::new();
    for _ in 0..12 {
        let analyzer = Arc::clone(&analyzer);
        let posting = posting.clone();
        handles.push(tokio::spawn(async move { analyzer.analyze(&posting).await.unwrap() }));
    }
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    assert_eq!(outcomes.iter().filter(|o| o.identity.is_new()).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| o.score.is_some()).count(), 1);
    let cluster = outcomes[0].identity.cluster_id();
    assert!(outcomes.iter().all(|o| o.identity.cluster_id() == cluster));
    assert_eq!(analyzer.index().cluster(&cluster).unwrap().size, 1);
}

#[tokio::test]
async fn sparse_uploads_degrade_instead_of_failing() {
    let analyzer = analyzer();
    let full = analyzer.analyze(&fixture("linkedin_view.json")).await.unwrap();
    let sparse = analyzer.analyze(&fixture("sparse_upload.json")).await.unwrap();

    assert!(sparse.classification.is_none());
    assert_eq!(sparse.degraded_fields, vec!["location", "description", "posted_at"]);
    let full_score = full.score.unwrap();
    let sparse_score = sparse.score.unwrap();
    assert!(!sparse_score.factors.is_empty());
    assert!(sparse_score.confidence_tier < full_score.confidence_tier);
}

#[tokio::test]
async fn scoring_is_deterministic_for_a_snapshot() {
    let analyzer = analyzer();
    let outcome = analyzer.analyze(&fixture("third_party_origin.json")).await.unwrap();
    let posting = fixture("third_party_origin.json")
        .with_classification(outcome.classification.as_ref().unwrap())
        .with_company_key(outcome.company_key.clone());

    // Tier observations may publish in the background; pin one snapshot.
    let weights = analyzer.weights().snapshot();
    let rules = rules();
    let cluster = outcome.identity.cluster();
    let first = gjd_analysis::score(&posting, cluster, &weights, &rules.scoring);
    let second = gjd_analysis::score(&posting, cluster, &weights, &rules.scoring);
    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
    assert_eq!(first.weights_version, weights.version);
}

struct StalledStore;

#[async_trait]
impl FingerprintStore for StalledStore {
    async fn get(&self, _fingerprint: &Fingerprint) -> Result<Option<ClusterId>, StoreError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(None)
    }

    async fn get_or_create(
        &self,
        _fingerprint: &Fingerprint,
        _candidate: ClusterId,
    ) -> Result<Registration, StoreError> {
        Err(StoreError::Backend("unreachable".into()))
    }
}

#[tokio::test]
async fn stalled_fingerprint_store_surfaces_as_retryable() {
    let config = AnalysisConfig {
        store_timeout: Duration::from_millis(25),
        ..AnalysisConfig::default()
    };
    let (analyzer, _worker) = Analyzer::new(config, rules(), Arc::new(StalledStore), None);
    let err = analyzer
        .analyze(&fixture("linkedin_view.json"))
        .await
        .unwrap_err();
    assert!(matches!(err, AnalysisError::DependencyUnavailable { .. }));
    assert!(err.is_recoverable());
    assert_eq!(
        err.user_message(),
        "could not analyze this submission, try again or provide more detail"
    );
}

#[tokio::test]
async fn corrections_reshape_later_analyses() {
    let analyzer = analyzer();
    let text =
        std::fs::read_to_string(workspace_root().join("fixtures/corrections.jsonl")).unwrap();
    let events: Vec<CorrectionEvent> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(events.len(), 4);

    let before = analyzer.weights().snapshot();
    let results: Vec<_> = events
        .into_iter()
        .map(|event| analyzer.apply_correction(event))
        .collect();
    assert!(results[..3].iter().all(Result::is_ok));
    assert!(matches!(results[3], Err(AnalysisError::MalformedCorrection { .. })));

    let version = analyzer.feedback().flush().await.unwrap();
    assert!(version > before.version);
    let after = analyzer.weights().snapshot();
    assert_ne!(after.bias, before.bias);
    assert_eq!(after.verified_postings("northwind logistics"), 1);
    assert_eq!(analyzer.normalize_company("Northwind"), "northwind logistics");
    assert_eq!(analyzer.feedback().dropped().len(), 1);

    // The snapshot taken before the corrections is untouched.
    assert_eq!(before.verified_postings("northwind logistics"), 0);
}

#[tokio::test]
async fn batch_fixture_feeds_run_statistics() {
    let analyzer = analyzer();
    let ledger = RunLedger::new();
    let text = std::fs::read_to_string(workspace_root().join("fixtures/batch.jsonl")).unwrap();
    let mut failures = 0;
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        let posting: NormalizedPosting = serde_json::from_str(line).unwrap();
        match analyzer.analyze(&posting).await {
            Ok(outcome) => {
                ledger.record(&outcome);
            }
            Err(AnalysisError::UnrecognizedUrl { .. }) => failures += 1,
            Err(other) => panic!("unexpected {other:?}"),
        }
    }

    assert_eq!(failures, 1);
    let stats = ledger.stats();
    assert_eq!(stats.total_analyses, 4);
    assert_eq!(
        stats.high_risk_count + stats.medium_risk_count + stats.low_risk_count,
        4
    );
    assert_eq!(stats.top_ghost_companies[0].company_key, "contoso");
    assert_eq!(stats.platform_breakdown[&PlatformKind::ThirdPartyAts], 2);
    assert_eq!(ledger.history(1)[0].company_key, "microsoft");
}
