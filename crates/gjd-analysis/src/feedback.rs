//! Online learning from verified corrections.
//!
//! Corrections and tier observations are queued to a single worker task that
//! owns the [`FeedbackLearner`]. The worker is the only writer of the weight
//! snapshot; request paths only ever `try_send` and never wait on it.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use gjd_core::{
    board_key, AnalysisError, CorrectedField, CorrectionEvent, Direction, ExtractionTier,
    FactorName, JobBoard, TierObservation, Verdict, UNKNOWN_COMPANY_KEY,
};
use gjd_storage::{put_json, with_deadline, KeyValueStore};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::company::{CompanyKey, CompanyNormalizer, REGISTRY_SNAPSHOT_KEY};
use crate::config::AnalysisConfig;
use crate::weights::{WeightPublisher, WeightTable, WEIGHTS_SNAPSHOT_KEY};

const FEEDBACK_QUEUE: &str = "feedback-queue";
const MAX_ABS_BIAS: f64 = 4.0;
/// Verdicts remembered for duplicate and contradiction checks. Older ones are
/// forgotten; long-term verdict history belongs to the external store.
pub const VERDICT_MEMORY: usize = 10_000;

#[derive(Debug, Clone)]
pub struct FeedbackConfig {
    pub queue_capacity: usize,
    pub learning_rate: f64,
    pub persist_every: usize,
    pub store_timeout: Duration,
    pub drop_log_capacity: usize,
}

impl From<&AnalysisConfig> for FeedbackConfig {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            queue_capacity: config.feedback_queue.max(1),
            learning_rate: config.learning_rate.clamp(0.0, 1.0),
            persist_every: config.persist_every.max(1),
            store_timeout: config.store_timeout,
            drop_log_capacity: 64,
        }
    }
}

/// Shape checks that need no learner state.
pub fn validate(event: &CorrectionEvent) -> Result<(), AnalysisError> {
    match event {
        CorrectionEvent::ExtractionCorrection {
            extracted, corrected, ..
        } => {
            let corrected = corrected.trim();
            if corrected.is_empty() {
                return Err(AnalysisError::malformed("corrected value is empty"));
            }
            if extracted
                .as_deref()
                .is_some_and(|e| e.trim().eq_ignore_ascii_case(corrected))
            {
                return Err(AnalysisError::malformed(
                    "corrected value equals the extracted value",
                ));
            }
            Ok(())
        }
        CorrectionEvent::VerdictCorrection {
            company,
            predicted_probability,
            factors,
            ..
        } => {
            if !predicted_probability.is_finite() || !(0.0..=1.0).contains(predicted_probability) {
                return Err(AnalysisError::malformed(format!(
                    "predicted probability {predicted_probability} is outside [0, 1]"
                )));
            }
            let no_company = company.as_deref().map_or(true, |c| c.trim().is_empty());
            if factors.is_empty() && no_company {
                return Err(AnalysisError::malformed("verdict names no factors and no company"));
            }
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LearnerEffect {
    pub weights_changed: bool,
    pub alias: Option<CompanyKey>,
}

/// Synchronous learning state; owned by the feedback worker.
#[derive(Debug)]
pub struct FeedbackLearner {
    table: WeightTable,
    learning_rate: f64,
    verdicts: HashMap<Uuid, Verdict>,
    /// Insertion order of `verdicts`, oldest first.
    verdict_order: VecDeque<Uuid>,
    verdict_capacity: usize,
    companies: Arc<CompanyNormalizer>,
}

impl FeedbackLearner {
    pub fn new(table: WeightTable, learning_rate: f64, companies: Arc<CompanyNormalizer>) -> Self {
        Self {
            table,
            learning_rate,
            verdicts: HashMap::new(),
            verdict_order: VecDeque::new(),
            verdict_capacity: VERDICT_MEMORY,
            companies,
        }
    }

    pub fn with_verdict_capacity(mut self, capacity: usize) -> Self {
        self.verdict_capacity = capacity.max(1);
        self
    }

    fn remember_verdict(&mut self, analysis_id: Uuid, verdict: Verdict) {
        while self.verdict_order.len() >= self.verdict_capacity {
            if let Some(oldest) = self.verdict_order.pop_front() {
                self.verdicts.remove(&oldest);
            }
        }
        self.verdicts.insert(analysis_id, verdict);
        self.verdict_order.push_back(analysis_id);
    }

    pub fn table(&self) -> &WeightTable {
        &self.table
    }

    /// Moves the success-rate estimate for `(board, tier)`. Returns whether it changed.
    pub fn observe_tier(
        &mut self,
        board: Option<JobBoard>,
        tier: ExtractionTier,
        success: bool,
    ) -> bool {
        let rate = self
            .table
            .tiers
            .entry(board_key(board).to_string())
            .or_default()
            .entry(tier)
            .or_insert_with(|| tier.default_reliability());
        let target = if success { 1.0 } else { 0.0 };
        let next = (*rate + self.learning_rate * (target - *rate)).clamp(0.0, 1.0);
        let changed = (next - *rate).abs() > f64::EPSILON;
        *rate = next;
        changed
    }

    pub fn apply(&mut self, event: &CorrectionEvent) -> Result<LearnerEffect, AnalysisError> {
        validate(event)?;
        match event {
            CorrectionEvent::ExtractionCorrection {
                board,
                tier,
                field,
                extracted,
                corrected,
                ..
            } => {
                let weights_changed = self.observe_tier(*board, *tier, false);
                let alias = match (field, extracted) {
                    (CorrectedField::Company, Some(extracted)) => {
                        self.companies.register_alias(extracted, corrected)
                    }
                    _ => None,
                };
                Ok(LearnerEffect {
                    weights_changed,
                    alias,
                })
            }
            CorrectionEvent::VerdictCorrection {
                analysis_id,
                company,
                predicted_probability,
                actual,
                factors,
            } => {
                match self.verdicts.get(analysis_id) {
                    Some(previous) if previous == actual => {
                        return Err(AnalysisError::malformed(format!(
                            "verdict for {analysis_id} was already applied"
                        )))
                    }
                    Some(_) => {
                        return Err(AnalysisError::malformed(format!(
                            "verdict for {analysis_id} contradicts an earlier verdict"
                        )))
                    }
                    None => {}
                }
                self.remember_verdict(*analysis_id, *actual);

                let alpha = self.learning_rate;
                let named: BTreeSet<FactorName> = factors
                    .iter()
                    .copied()
                    .filter(|f| *f != FactorName::BaselineAssessment)
                    .collect();
                for name in named {
                    let agrees = matches!(
                        (name.direction(), actual),
                        (Direction::Risk, Verdict::Ghost)
                            | (Direction::Positive, Verdict::Legitimate)
                    );
                    if let Some(weight) = self.table.factors.get_mut(&name) {
                        let target = if agrees { 1.0 } else { 0.0 };
                        let next = weight.reliability + alpha * (target - weight.reliability);
                        weight.reliability = next.clamp(0.0, 1.0);
                    }
                }

                let target = match actual {
                    Verdict::Ghost => 1.0,
                    Verdict::Legitimate => 0.0,
                };
                self.table.bias = (self.table.bias
                    + alpha * 0.5 * (target - predicted_probability))
                    .clamp(-MAX_ABS_BIAS, MAX_ABS_BIAS);

                if *actual == Verdict::Legitimate {
                    if let Some(company) = company {
                        let key = self.companies.normalize(company);
                        if key != UNKNOWN_COMPANY_KEY {
                            *self.table.verified_companies.entry(key).or_insert(0) += 1;
                        }
                    }
                }
                Ok(LearnerEffect {
                    weights_changed: true,
                    alias: None,
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DroppedCorrection {
    pub analysis_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedbackStats {
    pub applied: u64,
    pub dropped: u64,
    pub tier_observations: u64,
    pub published: u64,
    pub persisted: u64,
}

#[derive(Debug)]
enum FeedbackMessage {
    Correction(CorrectionEvent),
    Tier { observation: TierObservation, success: bool },
    Flush(oneshot::Sender<u64>),
    Shutdown,
}

type DropLog = Arc<Mutex<VecDeque<DroppedCorrection>>>;

fn record_drop(log: &DropLog, capacity: usize, analysis_id: Uuid, err: &AnalysisError) {
    warn!(%analysis_id, error = %err, "correction dropped");
    let mut log = log.lock().unwrap_or_else(PoisonError::into_inner);
    while log.len() >= capacity.max(1) {
        log.pop_front();
    }
    log.push_back(DroppedCorrection {
        analysis_id,
        reason: err.to_string(),
    });
}

/// Cloneable sender side of the feedback loop.
#[derive(Debug, Clone)]
pub struct FeedbackHandle {
    tx: mpsc::Sender<FeedbackMessage>,
    dropped: DropLog,
    drop_log_capacity: usize,
}

impl FeedbackHandle {
    /// Validates and enqueues a correction without waiting for the worker.
    pub fn apply_correction(&self, event: CorrectionEvent) -> Result<(), AnalysisError> {
        if let Err(err) = validate(&event) {
            record_drop(&self.dropped, self.drop_log_capacity, event.analysis_id(), &err);
            return Err(err);
        }
        self.tx
            .try_send(FeedbackMessage::Correction(event))
            .map_err(|err| match err {
                TrySendError::Full(_) => AnalysisError::dependency(FEEDBACK_QUEUE, "queue is full"),
                TrySendError::Closed(_) => {
                    AnalysisError::dependency(FEEDBACK_QUEUE, "loop has stopped")
                }
            })
    }

    /// Best-effort; silently skipped when the queue is full.
    pub fn observe_tier(&self, observation: TierObservation, success: bool) {
        if self
            .tx
            .try_send(FeedbackMessage::Tier { observation, success })
            .is_err()
        {
            debug!(tier = %observation.tier, "tier observation skipped");
        }
    }

    /// Waits until everything queued before this call has been processed and
    /// returns the weight version published at that point.
    pub async fn flush(&self) -> Result<u64, AnalysisError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(FeedbackMessage::Flush(reply))
            .await
            .map_err(|_| AnalysisError::dependency(FEEDBACK_QUEUE, "loop has stopped"))?;
        done.await
            .map_err(|_| AnalysisError::dependency(FEEDBACK_QUEUE, "loop has stopped"))
    }

    /// Stops intake; the worker drains what is already queued, then exits.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(FeedbackMessage::Shutdown).await;
    }

    pub fn dropped(&self) -> Vec<DroppedCorrection> {
        self.dropped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

pub struct FeedbackLoop;

impl FeedbackLoop {
    /// Starts the worker. Must be called from inside a tokio runtime.
    pub fn spawn(
        config: FeedbackConfig,
        publisher: WeightPublisher,
        companies: Arc<CompanyNormalizer>,
        store: Option<Arc<dyn KeyValueStore>>,
    ) -> (FeedbackHandle, JoinHandle<FeedbackStats>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let dropped: DropLog = Arc::new(Mutex::new(VecDeque::new()));
        let learner = FeedbackLearner::new(
            (*publisher.current()).clone(),
            config.learning_rate,
            Arc::clone(&companies),
        );
        let worker = Worker {
            rx,
            publisher,
            learner,
            companies,
            store,
            dropped: Arc::clone(&dropped),
            stats: FeedbackStats::default(),
            pending: 0,
            config: config.clone(),
        };
        let handle = FeedbackHandle {
            tx,
            dropped,
            drop_log_capacity: config.drop_log_capacity,
        };
        (handle, tokio::spawn(worker.run()))
    }
}

struct Worker {
    rx: mpsc::Receiver<FeedbackMessage>,
    publisher: WeightPublisher,
    learner: FeedbackLearner,
    companies: Arc<CompanyNormalizer>,
    store: Option<Arc<dyn KeyValueStore>>,
    dropped: DropLog,
    stats: FeedbackStats,
    /// Published updates not yet persisted.
    pending: usize,
    config: FeedbackConfig,
}

impl Worker {
    async fn run(mut self) -> FeedbackStats {
        while let Some(message) = self.rx.recv().await {
            match message {
                FeedbackMessage::Correction(event) => match self.learner.apply(&event) {
                    Ok(effect) => {
                        self.stats.applied += 1;
                        if let Some(alias) = effect.alias {
                            debug!(key = %alias, "company alias registered");
                        }
                        if effect.weights_changed {
                            self.publish();
                        }
                    }
                    Err(err) => {
                        self.stats.dropped += 1;
                        record_drop(
                            &self.dropped,
                            self.config.drop_log_capacity,
                            event.analysis_id(),
                            &err,
                        );
                    }
                },
                FeedbackMessage::Tier { observation, success } => {
                    self.stats.tier_observations += 1;
                    if self.learner.observe_tier(observation.board, observation.tier, success) {
                        self.publish();
                    }
                }
                FeedbackMessage::Flush(reply) => {
                    if self.pending > 0 {
                        self.persist().await;
                    }
                    let _ = reply.send(self.publisher.current().version);
                }
                FeedbackMessage::Shutdown => self.rx.close(),
            }
            if self.pending >= self.config.persist_every {
                self.persist().await;
            }
        }
        if self.pending > 0 {
            self.persist().await;
        }
        info!(
            applied = self.stats.applied,
            dropped = self.stats.dropped,
            published = self.stats.published,
            "feedback loop stopped"
        );
        self.stats
    }

    fn publish(&mut self) {
        let published = self.publisher.publish(self.learner.table().clone());
        self.stats.published += 1;
        self.pending += 1;
        debug!(version = published.version, "weights published");
    }

    /// Writes the current table and registry. `pending` is only cleared once
    /// both writes land, so a failed attempt is retried on the next message
    /// or at shutdown.
    async fn persist(&mut self) {
        let Some(store) = self.store.as_ref() else {
            self.pending = 0;
            return;
        };
        let deadline = self.config.store_timeout;
        let table = self.publisher.current();
        let registry = self.companies.snapshot();
        let weights = with_deadline(
            "weights put",
            deadline,
            put_json(store.as_ref(), WEIGHTS_SNAPSHOT_KEY, table.as_ref()),
        )
        .await;
        let companies = with_deadline(
            "registry put",
            deadline,
            put_json(store.as_ref(), REGISTRY_SNAPSHOT_KEY, &registry),
        )
        .await;
        match (weights, companies) {
            (Ok(()), Ok(())) => {
                self.pending = 0;
                self.stats.persisted += 1;
                debug!(version = table.version, "weights persisted");
            }
            (Err(err), _) | (_, Err(err)) => {
                warn!(
                    version = table.version,
                    pending = self.pending,
                    error = %err,
                    "weight persistence failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompanyRules, ScoringRules};
    use crate::weights::WeightStore;
    use gjd_storage::{get_json, MemoryKeyValueStore, StoreError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn companies() -> Arc<CompanyNormalizer> {
        Arc::new(CompanyNormalizer::new(&CompanyRules::default(), 0.8))
    }

    fn table() -> WeightTable {
        WeightTable::from_rules(&ScoringRules::default())
    }

    fn verdict(actual: Verdict, factors: Vec<FactorName>) -> CorrectionEvent {
        CorrectionEvent::VerdictCorrection {
            analysis_id: Uuid::new_v4(),
            company: None,
            predicted_probability: 0.8,
            actual,
            factors,
        }
    }

    fn extraction(
        field: CorrectedField,
        extracted: Option<&str>,
        corrected: &str,
    ) -> CorrectionEvent {
        CorrectionEvent::ExtractionCorrection {
            analysis_id: Uuid::new_v4(),
            board: Some(JobBoard::LinkedIn),
            tier: ExtractionTier::DirectPath,
            field,
            extracted: extracted.map(str::to_string),
            corrected: corrected.to_string(),
        }
    }

    fn config() -> FeedbackConfig {
        FeedbackConfig::from(&AnalysisConfig::default())
    }

    #[test]
    fn malformed_shapes_are_rejected() {
        let cases = [
            extraction(CorrectedField::Title, Some("Engineer"), "   "),
            extraction(CorrectedField::Title, Some("Engineer"), " engineer "),
            CorrectionEvent::VerdictCorrection {
                analysis_id: Uuid::new_v4(),
                company: None,
                predicted_probability: f64::NAN,
                actual: Verdict::Ghost,
                factors: vec![FactorName::StalePosting],
            },
            CorrectionEvent::VerdictCorrection {
                analysis_id: Uuid::new_v4(),
                company: None,
                predicted_probability: 1.2,
                actual: Verdict::Ghost,
                factors: vec![FactorName::StalePosting],
            },
            verdict(Verdict::Ghost, vec![]),
        ];
        for event in cases {
            assert!(
                matches!(validate(&event), Err(AnalysisError::MalformedCorrection { .. })),
                "{event:?} should be rejected"
            );
        }
        assert!(validate(&verdict(Verdict::Ghost, vec![FactorName::StalePosting])).is_ok());
    }

    #[test]
    fn verdicts_move_reliability_toward_agreement() {
        let mut learner = FeedbackLearner::new(table(), 0.1, companies());
        let before = learner.table().clone();
        learner
            .apply(&verdict(
                Verdict::Ghost,
                vec![FactorName::StalePosting, FactorName::VerifiedCompany],
            ))
            .unwrap();
        let after = learner.table();

        let stale = after.factors[&FactorName::StalePosting];
        let verified = after.factors[&FactorName::VerifiedCompany];
        assert!((stale.reliability - 0.55).abs() < 1e-12);
        assert!((verified.reliability - 0.45).abs() < 1e-12);
        assert!(after.weight(FactorName::StalePosting) > before.weight(FactorName::StalePosting));
        assert!((after.bias - (before.bias + 0.1 * 0.5 * 0.2)).abs() < 1e-12);
    }

    #[test]
    fn repeated_and_contradicting_verdicts_are_rejected() {
        let mut learner = FeedbackLearner::new(table(), 0.1, companies());
        let event = verdict(Verdict::Ghost, vec![FactorName::StalePosting]);
        learner.apply(&event).unwrap();
        assert!(learner.apply(&event).is_err());

        let CorrectionEvent::VerdictCorrection { analysis_id, .. } = event else {
            unreachable!()
        };
        let flipped = CorrectionEvent::VerdictCorrection {
            analysis_id,
            company: None,
            predicted_probability: 0.8,
            actual: Verdict::Legitimate,
            factors: vec![FactorName::StalePosting],
        };
        match learner.apply(&flipped) {
            Err(AnalysisError::MalformedCorrection { reason }) => {
                assert!(reason.contains("contradicts"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn legitimate_verdicts_grow_the_verified_registry() {
        let companies = companies();
        let mut learner = FeedbackLearner::new(table(), 0.1, Arc::clone(&companies));
        for _ in 0..2 {
            learner
                .apply(&CorrectionEvent::VerdictCorrection {
                    analysis_id: Uuid::new_v4(),
                    company: Some("Acme, Inc.".into()),
                    predicted_probability: 0.7,
                    actual: Verdict::Legitimate,
                    factors: vec![],
                })
                .unwrap();
        }
        assert_eq!(learner.table().verified_postings("acme"), 2);
    }

    #[test]
    fn extraction_corrections_demote_tiers_and_alias_companies() {
        let companies = companies();
        let mut learner = FeedbackLearner::new(table(), 0.5, Arc::clone(&companies));
        let canonical = companies.normalize("Alphabet");
        for _ in 0..2 {
            learner
                .apply(&extraction(CorrectedField::CanonicalId, Some("linkedin:1"), "linkedin:2"))
                .unwrap();
        }
        let effect = learner
            .apply(&extraction(CorrectedField::Company, Some("Google"), "Alphabet"))
            .unwrap();
        assert_eq!(effect.alias, Some(canonical.clone()));
        assert_eq!(companies.normalize("google"), canonical);
        assert_eq!(
            learner.table().tier_order(Some(JobBoard::LinkedIn))[0],
            ExtractionTier::QueryParameter
        );
    }

    #[tokio::test]
    async fn loop_publishes_and_persists_snapshots() {
        let (weights, publisher) = WeightStore::new(table());
        let store = Arc::new(MemoryKeyValueStore::new());
        let (handle, worker) = FeedbackLoop::spawn(
            FeedbackConfig {
                persist_every: 1,
                ..config()
            },
            publisher,
            companies(),
            Some(store.clone() as Arc<dyn KeyValueStore>),
        );

        handle
            .apply_correction(verdict(Verdict::Ghost, vec![FactorName::ThinDescription]))
            .unwrap();
        let version = handle.flush().await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(weights.version(), 1);
        assert!(weights.snapshot().factors[&FactorName::ThinDescription].reliability > 0.5);

        let persisted: Option<WeightTable> =
            get_json(store.as_ref(), WEIGHTS_SNAPSHOT_KEY).await.unwrap();
        assert_eq!(persisted.map(|t| t.version), Some(1));

        handle.shutdown().await;
        let stats = worker.await.unwrap();
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.published, 1);
        assert!(stats.persisted >= 1);
    }

    #[tokio::test]
    async fn rejected_corrections_are_logged_not_fatal() {
        let (weights, publisher) = WeightStore::new(table());
        let (handle, worker) = FeedbackLoop::spawn(config(), publisher, companies(), None);

        let bad = verdict(Verdict::Ghost, vec![]);
        let bad_id = bad.analysis_id();
        assert!(handle.apply_correction(bad).is_err());

        let good = verdict(Verdict::Ghost, vec![FactorName::StalePosting]);
        handle.apply_correction(good.clone()).unwrap();
        handle.apply_correction(good).unwrap();
        handle.flush().await.unwrap();

        let dropped = handle.dropped();
        assert_eq!(dropped.len(), 2);
        assert_eq!(dropped[0].analysis_id, bad_id);
        assert_eq!(weights.version(), 1);

        handle.shutdown().await;
        let stats = worker.await.unwrap();
        assert_eq!(stats.dropped, 1);
        assert!(matches!(
            handle.apply_correction(verdict(Verdict::Ghost, vec![FactorName::StalePosting])),
            Err(AnalysisError::DependencyUnavailable { .. })
        ));
    }

    #[test]
    fn verdict_memory_is_bounded() {
        let mut learner =
            FeedbackLearner::new(table(), 0.1, companies()).with_verdict_capacity(2);
        let events: Vec<_> = (0..3)
            .map(|_| verdict(Verdict::Ghost, vec![FactorName::StalePosting]))
            .collect();
        for event in &events {
            learner.apply(event).unwrap();
        }
        assert_eq!(learner.verdicts.len(), 2);
        assert_eq!(learner.verdict_order.len(), 2);
        // The oldest verdict was forgotten; the newest is still guarded.
        assert!(learner.apply(&events[0]).is_ok());
        assert!(learner.apply(&events[2]).is_err());
    }

    #[tokio::test]
    async fn full_queue_rejects_without_waiting() {
        let (_weights, publisher) = WeightStore::new(table());
        let (handle, worker) = FeedbackLoop::spawn(
            FeedbackConfig {
                queue_capacity: 1,
                ..config()
            },
            publisher,
            companies(),
            None,
        );

        // The current-thread runtime has not polled the worker yet.
        handle
            .apply_correction(verdict(Verdict::Ghost, vec![FactorName::StalePosting]))
            .unwrap();
        match handle.apply_correction(verdict(Verdict::Ghost, vec![FactorName::StalePosting])) {
            Err(AnalysisError::DependencyUnavailable { dependency, .. }) => {
                assert_eq!(dependency, FEEDBACK_QUEUE)
            }
            other => panic!("unexpected {other:?}"),
        }

        handle.flush().await.unwrap();
        handle.shutdown().await;
        assert_eq!(worker.await.unwrap().applied, 1);
    }

    /// Fails its first `failures` puts, then behaves like the memory store.
    struct FlakyStore {
        inner: MemoryKeyValueStore,
        failures: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl KeyValueStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Backend("write refused".into()));
            }
            self.inner.put(key, value).await
        }
    }

    #[tokio::test]
    async fn failed_persistence_is_retried() {
        let (_weights, publisher) = WeightStore::new(table());
        let store = Arc::new(FlakyStore {
            inner: MemoryKeyValueStore::new(),
            failures: AtomicUsize::new(2),
        });
        let (handle, worker) = FeedbackLoop::spawn(
            FeedbackConfig {
                persist_every: 1,
                ..config()
            },
            publisher,
            companies(),
            Some(store.clone() as Arc<dyn KeyValueStore>),
        );

        handle
            .apply_correction(verdict(Verdict::Ghost, vec![FactorName::ThinDescription]))
            .unwrap();
        let version = handle.flush().await.unwrap();

        let persisted: Option<WeightTable> =
            get_json(store.as_ref(), WEIGHTS_SNAPSHOT_KEY).await.unwrap();
        assert_eq!(persisted.map(|t| t.version), Some(version));

        handle.shutdown().await;
        let stats = worker.await.unwrap();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.persisted, 1);
    }
}
