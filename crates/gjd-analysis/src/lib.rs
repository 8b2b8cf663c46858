//! Ghost-job analysis core: canonicalization, company normalization,
//! duplicate identity, scoring and the feedback loop that tunes them.

pub mod canonicalize;
pub mod company;
pub mod config;
pub mod dedup;
pub mod feedback;
pub mod pipeline;
pub mod scoring;
pub mod stats;
pub mod weights;

pub use canonicalize::{classify_url, Canonicalizer};
pub use company::{CompanyKey, CompanyNormalizer, CompanyRegistrySnapshot};
pub use config::{AnalysisConfig, Rules};
pub use dedup::{fingerprint, DuplicateConfig, DuplicateIndex, SimilarityVector};
pub use feedback::{FeedbackHandle, FeedbackLearner, FeedbackLoop, FeedbackStats};
pub use pipeline::{AnalysisOutcome, Analyzer};
pub use scoring::{score, ScoringEngine};
pub use stats::{AnalysisStats, RunLedger};
pub use weights::{WeightPublisher, WeightStore, WeightTable};

pub const CRATE_NAME: &str = "gjd-analysis";
