//! Core domain model for ghost-job analysis.
//!
//! Everything here is plain data shared by the storage seams, the analysis
//! engine and the CLI. Nothing in this crate performs I/O.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod error;

pub use error::AnalysisError;

pub const CRATE_NAME: &str = "gjd-core";

/// Key used when a company string normalizes to nothing.
pub const UNKNOWN_COMPANY_KEY: &str = "unknown-company";

/// Coarse platform tag attached to every classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformKind {
    DirectPlatform,
    ThirdPartyAts,
    #[default]
    Unknown,
}

impl PlatformKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectPlatform => "direct-platform",
            Self::ThirdPartyAts => "third-party-ats",
            Self::Unknown => "unknown",
        }
    }
}

/// Job boards and applicant-tracking systems the canonicalizer recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobBoard {
    LinkedIn,
    Indeed,
    Glassdoor,
    ZipRecruiter,
    Greenhouse,
    Lever,
    Workday,
    Ashby,
    SmartRecruiters,
}

impl JobBoard {
    pub const ALL: [JobBoard; 9] = [
        JobBoard::LinkedIn,
        JobBoard::Indeed,
        JobBoard::Glassdoor,
        JobBoard::ZipRecruiter,
        JobBoard::Greenhouse,
        JobBoard::Lever,
        JobBoard::Workday,
        JobBoard::Ashby,
        JobBoard::SmartRecruiters,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LinkedIn => "linkedin",
            Self::Indeed => "indeed",
            Self::Glassdoor => "glassdoor",
            Self::ZipRecruiter => "ziprecruiter",
            Self::Greenhouse => "greenhouse",
            Self::Lever => "lever",
            Self::Workday => "workday",
            Self::Ashby => "ashby",
            Self::SmartRecruiters => "smartrecruiters",
        }
    }

    /// Registrable host suffix owned by the board.
    pub fn host_suffix(self) -> &'static str {
        match self {
            Self::LinkedIn => "linkedin.com",
            Self::Indeed => "indeed.com",
            Self::Glassdoor => "glassdoor.com",
            Self::ZipRecruiter => "ziprecruiter.com",
            Self::Greenhouse => "greenhouse.io",
            Self::Lever => "lever.co",
            Self::Workday => "myworkdayjobs.com",
            Self::Ashby => "ashbyhq.com",
            Self::SmartRecruiters => "smartrecruiters.com",
        }
    }

    pub fn is_ats(self) -> bool {
        matches!(
            self,
            Self::Greenhouse | Self::Lever | Self::Workday | Self::Ashby | Self::SmartRecruiters
        )
    }

    pub fn kind(self) -> PlatformKind {
        if self.is_ats() {
            PlatformKind::ThirdPartyAts
        } else {
            PlatformKind::DirectPlatform
        }
    }

    /// Board named by a free-form tracking value such as `utm_source=LinkedIn_Jobs`.
    ///
    /// The value is split into alphanumeric tokens. A token, or two adjacent
    /// tokens joined (`zip-recruiter`), must equal or start with a board name;
    /// a board name buried inside a longer word (`clevertap`) does not count.
    pub fn from_tracking_value(value: &str) -> Option<Self> {
        let lowered = value.to_ascii_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        let joined = tokens.windows(2).map(|pair| pair.concat());
        let candidates: Vec<String> = tokens.iter().map(|t| t.to_string()).chain(joined).collect();
        Self::ALL.into_iter().find(|board| {
            candidates
                .iter()
                .any(|candidate| candidate.starts_with(board.as_str()))
        })
    }
}

impl fmt::Display for JobBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered extraction strategies. Earlier variants win ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionTier {
    DirectPath,
    QueryParameter,
    OriginSignal,
    GenericNumeric,
}

impl ExtractionTier {
    pub const ALL: [ExtractionTier; 4] = [
        ExtractionTier::DirectPath,
        ExtractionTier::QueryParameter,
        ExtractionTier::OriginSignal,
        ExtractionTier::GenericNumeric,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectPath => "direct-path",
            Self::QueryParameter => "query-parameter",
            Self::OriginSignal => "origin-signal",
            Self::GenericNumeric => "generic-numeric",
        }
    }

    /// Prior success-rate estimate before any feedback has been observed.
    pub fn default_reliability(self) -> f64 {
        match self {
            Self::DirectPath => 1.0,
            Self::QueryParameter => 0.9,
            Self::OriginSignal => 0.7,
            Self::GenericNumeric => 0.5,
        }
    }
}

impl fmt::Display for ExtractionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Secondary signals recorded next to the winning canonical id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum OriginHint {
    ReferredBy { board: JobBoard },
    AtsHost { board: JobBoard },
    AlternateId { tier: ExtractionTier, id: String },
}

impl fmt::Display for OriginHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReferredBy { board } => write!(f, "referred-by-{board}"),
            Self::AtsHost { board } => write!(f, "ats-host-{board}"),
            Self::AlternateId { tier, id } => write!(f, "alternate-id:{tier}:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformClassification {
    pub platform: PlatformKind,
    pub board: Option<JobBoard>,
    pub canonical_id: String,
    pub tier: ExtractionTier,
    #[serde(default)]
    pub hints: BTreeSet<OriginHint>,
}

impl PlatformClassification {
    pub fn observation(&self) -> TierObservation {
        TierObservation {
            board: self.board,
            tier: self.tier,
        }
    }
}

/// Which tier resolved a URL for which board; fed to the learning loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierObservation {
    pub board: Option<JobBoard>,
    pub tier: ExtractionTier,
}

/// Key under which per-board tier statistics are kept. Unbranded hosts share `*`.
pub fn board_key(board: Option<JobBoard>) -> &'static str {
    board.map(JobBoard::as_str).unwrap_or("*")
}

/// Posting handed over by the ingestion layer, already reduced to text fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPosting {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub company_key: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub remote: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub platform: PlatformKind,
    #[serde(default)]
    pub board: Option<JobBoard>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub canonical_job_id: Option<String>,
    #[serde(default)]
    pub extraction_tier: Option<ExtractionTier>,
}

impl NormalizedPosting {
    pub fn new(
        title: impl Into<String>,
        company: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            title: title.into(),
            company: company.into(),
            company_key: None,
            location: None,
            remote: false,
            description: None,
            posted_at: None,
            received_at,
            platform: PlatformKind::Unknown,
            board: None,
            source_url: None,
            canonical_job_id: None,
            extraction_tier: None,
        }
    }

    /// Copy carrying the platform facts resolved for its source URL.
    pub fn with_classification(&self, classification: &PlatformClassification) -> Self {
        Self {
            platform: classification.platform,
            board: classification.board,
            canonical_job_id: Some(classification.canonical_id.clone()),
            extraction_tier: Some(classification.tier),
            ..self.clone()
        }
    }

    pub fn with_company_key(&self, key: impl Into<String>) -> Self {
        Self {
            company_key: Some(key.into()),
            ..self.clone()
        }
    }

    pub fn description_text(&self) -> Option<&str> {
        non_blank(self.description.as_deref())
    }

    pub fn location_text(&self) -> Option<&str> {
        non_blank(self.location.as_deref())
    }

    /// Whole days between posting and receipt; `None` without a posting date.
    pub fn age_days(&self) -> Option<i64> {
        self.posted_at
            .map(|posted| (self.received_at - posted).num_days().max(0))
    }

    /// Names of the fields that are absent or blank.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.title.trim().is_empty() {
            missing.push("title");
        }
        if self.company.trim().is_empty() {
            missing.push("company");
        }
        if self.location_text().is_none() && !self.remote {
            missing.push("location");
        }
        if self.description_text().is_none() {
            missing.push("description");
        }
        if self.posted_at.is_none() {
            missing.push("posted_at");
        }
        missing
    }

    /// Checks the fields identity depends on. Callers treat the error as a
    /// signal to continue in degraded mode.
    pub fn validate(&self) -> Result<(), AnalysisError> {
        let fields: Vec<String> = self
            .missing_fields()
            .into_iter()
            .filter(|f| matches!(*f, "title" | "company"))
            .map(str::to_string)
            .collect();
        if fields.is_empty() {
            Ok(())
        } else {
            Err(AnalysisError::IncompleteInput { fields })
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Exact-duplicate key: hex digest over the identity fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub Uuid);

impl ClusterId {
    /// Deterministic id for a cluster first seen under `fingerprint`.
    pub fn for_fingerprint(fingerprint: &Fingerprint) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, fingerprint.as_str().as_bytes()))
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Read-only view of a duplicate cluster at the time a posting was identified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub cluster_id: ClusterId,
    pub size: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub clustered: bool,
}

impl ClusterSummary {
    pub fn singleton(cluster_id: ClusterId, seen_at: DateTime<Utc>) -> Self {
        Self {
            cluster_id,
            size: 1,
            first_seen: seen_at,
            last_seen: seen_at,
            clustered: false,
        }
    }

    pub fn span_days(&self) -> i64 {
        (self.last_seen - self.first_seen).num_days().max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum IdentifyOutcome {
    /// Exact fingerprint already registered; the stored result stands.
    Existing { cluster: ClusterSummary },
    /// Near-duplicate of an existing cluster; scored again as a clustered member.
    Joined { cluster: ClusterSummary, similarity: f64 },
    Created { cluster: ClusterSummary },
}

impl IdentifyOutcome {
    pub fn cluster(&self) -> &ClusterSummary {
        match self {
            Self::Existing { cluster }
            | Self::Joined { cluster, .. }
            | Self::Created { cluster } => cluster,
        }
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster().cluster_id
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Created { .. })
    }

    pub fn needs_scoring(&self) -> bool {
        !matches!(self, Self::Existing { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Risk,
    Positive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FactorName {
    StalePosting,
    RepostCluster,
    ThinDescription,
    BoilerplateLanguage,
    MissingCompensation,
    VagueLocation,
    VerifiedCompany,
    DetailedRequirements,
    RecentPosting,
    BaselineAssessment,
}

impl FactorName {
    pub const ALL: [FactorName; 10] = [
        FactorName::StalePosting,
        FactorName::RepostCluster,
        FactorName::ThinDescription,
        FactorName::BoilerplateLanguage,
        FactorName::MissingCompensation,
        FactorName::VagueLocation,
        FactorName::VerifiedCompany,
        FactorName::DetailedRequirements,
        FactorName::RecentPosting,
        FactorName::BaselineAssessment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StalePosting => "stale-posting",
            Self::RepostCluster => "repost-cluster",
            Self::ThinDescription => "thin-description",
            Self::BoilerplateLanguage => "boilerplate-language",
            Self::MissingCompensation => "missing-compensation",
            Self::VagueLocation => "vague-location",
            Self::VerifiedCompany => "verified-company",
            Self::DetailedRequirements => "detailed-requirements",
            Self::RecentPosting => "recent-posting",
            Self::BaselineAssessment => "baseline-assessment",
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            Self::VerifiedCompany | Self::DetailedRequirements | Self::RecentPosting => {
                Direction::Positive
            }
            _ => Direction::Risk,
        }
    }
}

impl fmt::Display for FactorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Factor {
    pub name: FactorName,
    pub direction: Direction,
    pub magnitude: f64,
    pub detail: String,
}

/// Bucketed confidence; declaration order is weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
    Minimal,
    Low,
    Medium,
    High,
}

impl ConfidenceTier {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.8 {
            Self::High
        } else if confidence >= 0.6 {
            Self::Medium
        } else if confidence >= 0.4 {
            Self::Low
        } else {
            Self::Minimal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub const HIGH_THRESHOLD: f64 = 0.67;
    pub const MEDIUM_THRESHOLD: f64 = 0.34;

    pub fn from_probability(probability: f64) -> Self {
        if probability >= Self::HIGH_THRESHOLD {
            Self::High
        } else if probability >= Self::MEDIUM_THRESHOLD {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub probability: f64,
    pub factors: Vec<Factor>,
    pub confidence: f64,
    pub confidence_tier: ConfidenceTier,
    pub risk_level: RiskLevel,
    pub clustered: bool,
    pub weights_version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Ghost,
    Legitimate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CorrectedField {
    CanonicalId,
    Title,
    Company,
    Location,
    Description,
    PostedAt,
}

/// Verified user correction entering the learning loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CorrectionEvent {
    #[serde(rename = "extraction")]
    ExtractionCorrection {
        analysis_id: Uuid,
        #[serde(default)]
        board: Option<JobBoard>,
        tier: ExtractionTier,
        field: CorrectedField,
        #[serde(default)]
        extracted: Option<String>,
        corrected: String,
    },
    #[serde(rename = "verdict")]
    VerdictCorrection {
        analysis_id: Uuid,
        #[serde(default)]
        company: Option<String>,
        predicted_probability: f64,
        actual: Verdict,
        #[serde(default)]
        factors: Vec<FactorName>,
    },
}

impl CorrectionEvent {
    pub fn analysis_id(&self) -> Uuid {
        match self {
            Self::ExtractionCorrection { analysis_id, .. }
            | Self::VerdictCorrection { analysis_id, .. } => *analysis_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn tracking_values_resolve_to_boards() {
        assert_eq!(JobBoard::from_tracking_value("LinkedIn_Jobs"), Some(JobBoard::LinkedIn));
        assert_eq!(JobBoard::from_tracking_value("zip-recruiter"), Some(JobBoard::ZipRecruiter));
        assert_eq!(JobBoard::from_tracking_value("IndeedJobs"), Some(JobBoard::Indeed));
        assert_eq!(JobBoard::from_tracking_value("newsletter"), None);
        assert_eq!(JobBoard::from_tracking_value(""), None);
    }

    #[test]
    fn board_names_inside_other_words_are_not_referrals() {
        assert_eq!(JobBoard::from_tracking_value("clevertap_push"), None);
        assert_eq!(JobBoard::from_tracking_value("cleverindeed"), None);
        assert_eq!(JobBoard::from_tracking_value("mail-clevertap"), None);
    }

    #[test]
    fn missing_fields_respects_remote_flag() {
        let mut posting = NormalizedPosting::new("Engineer", "Acme", received());
        assert_eq!(posting.missing_fields(), vec!["location", "description", "posted_at"]);
        posting.remote = true;
        assert_eq!(posting.missing_fields(), vec!["description", "posted_at"]);
    }

    #[test]
    fn validate_reports_identity_fields_only() {
        let posting = NormalizedPosting::new("  ", "", received());
        match posting.validate() {
            Err(AnalysisError::IncompleteInput { fields }) => {
                assert_eq!(fields, vec!["title".to_string(), "company".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cluster_ids_are_stable_per_fingerprint() {
        let fp = Fingerprint::from_hex("abc123");
        assert_eq!(ClusterId::for_fingerprint(&fp), ClusterId::for_fingerprint(&fp));
        assert_ne!(
            ClusterId::for_fingerprint(&fp),
            ClusterId::for_fingerprint(&Fingerprint::from_hex("abc124"))
        );
    }

    #[test]
    fn risk_and_confidence_buckets() {
        assert_eq!(RiskLevel::from_probability(0.67), RiskLevel::High);
        assert_eq!(RiskLevel::from_probability(0.34), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_probability(0.33), RiskLevel::Low);
        assert!(ConfidenceTier::from_confidence(0.9) > ConfidenceTier::from_confidence(0.65));
        assert_eq!(ConfidenceTier::from_confidence(0.1), ConfidenceTier::Minimal);
    }

    #[test]
    fn correction_events_use_tagged_json() {
        let json = r#"{
            "kind": "verdict",
            "analysis_id": "6f9619ff-8b86-d011-b42d-00c04fc964ff",
            "predicted_probability": 0.8,
            "actual": "legitimate",
            "factors": ["stale-posting"]
        }"#;
        let event: CorrectionEvent = serde_json::from_str(json).unwrap();
        match event {
            CorrectionEvent::VerdictCorrection { actual, factors, company, .. } => {
                assert_eq!(actual, Verdict::Legitimate);
                assert_eq!(factors, vec![FactorName::StalePosting]);
                assert!(company.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn hints_render_as_tags() {
        let hint = OriginHint::ReferredBy { board: JobBoard::LinkedIn };
        assert_eq!(hint.to_string(), "referred-by-linkedin");
    }
}
