//! URL canonicalization and platform classification.
//!
//! Extraction runs as an ordered list of tiers. The weight snapshot decides
//! which tier is *tried* first for a board, but the canonically earliest
//! matching tier always wins: a candidate only settles once every earlier
//! tier has been tried and failed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use gjd_core::{
    AnalysisError, ExtractionTier, JobBoard, OriginHint, PlatformClassification, PlatformKind,
    TierObservation,
};
use regex::Regex;
use tracing::debug;
use url::Url;

use crate::weights::{WeightStore, WeightTable};

const TRACKING_KEYS: [&str; 10] = [
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "source",
    "src",
    "ref",
    "referrer",
    "trk",
    "trackingId",
    "lever-source",
];

const QUERY_KEYS: [(JobBoard, &[&str]); 4] = [
    (JobBoard::LinkedIn, &["currentJobId"]),
    (JobBoard::Indeed, &["jk", "vjk"]),
    (JobBoard::Glassdoor, &["jl", "jobListingId"]),
    (JobBoard::ZipRecruiter, &["jid"]),
];

/// Greenhouse embeds its job id on whatever host serves the careers page.
const GREENHOUSE_EMBED_KEY: &str = "gh_jid";

const UUID: &str = r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}";

static DIRECT_PATTERNS: LazyLock<Vec<(JobBoard, Regex)>> = LazyLock::new(|| {
    let patterns = [
        (JobBoard::LinkedIn, r"^/(?:comm/)?jobs/view/(?:[^/]*-)?(\d{6,})(?:/|$)".to_string()),
        (JobBoard::Indeed, r"^/(?:m/)?viewjob/([0-9a-fA-F]{16})/?$".to_string()),
        (JobBoard::Indeed, r"^/(?:m/)?job/[^/]*-([0-9a-fA-F]{16})/?$".to_string()),
        (JobBoard::Glassdoor, r"(?i)-JV_[^/]*?(\d{9,})\.htm$".to_string()),
        (JobBoard::ZipRecruiter, r"^/jobs/(?:[^/]+/)*[^/]*-([A-Za-z0-9]{8,})/?$".to_string()),
        (JobBoard::Greenhouse, r"^/(?:embed/)?[^/]+/jobs/(\d+)/?$".to_string()),
        (JobBoard::Lever, format!(r"^/[^/]+/({UUID})(?:/apply)?/?$")),
        (JobBoard::Workday, r"(?i)/job/(?:[^/]+/)*[^/]*_(R-?\d+)(?:-\d+)?/?$".to_string()),
        (JobBoard::Ashby, format!(r"^/[^/]+/({UUID})(?:/application)?/?$")),
        (JobBoard::SmartRecruiters, r"^/[^/]+/(\d{6,})(?:-[^/]*)?/?$".to_string()),
    ];
    patterns
        .into_iter()
        .map(|(board, pattern)| (board, Regex::new(&pattern).expect("direct path pattern")))
        .collect()
});

static NUMERIC_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{10,}").expect("numeric run pattern"));

#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    board: Option<JobBoard>,
    id: String,
}

/// A submission URL reduced to the parts the tiers look at.
#[derive(Debug)]
struct SubmissionUrl {
    raw: String,
    host: String,
    path: String,
    query: Vec<(String, String)>,
    board: Option<JobBoard>,
    careers_page: bool,
}

impl SubmissionUrl {
    fn parse(raw: &str) -> Result<Self, AnalysisError> {
        let trimmed = raw.trim();
        let parsed = match Url::parse(trimmed) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Url::parse(&format!("https://{trimmed}"))
                    .map_err(|err| unrecognized(raw, err.to_string()))?
            }
            Err(err) => return Err(unrecognized(raw, err.to_string())),
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(unrecognized(raw, format!("unsupported scheme {}", parsed.scheme())));
        }
        let host = parsed
            .host_str()
            .map(|h| h.to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| unrecognized(raw, "missing host"))?;
        let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
        let path = parsed.path().to_string();
        let board = board_for_host(&host);
        let lower_path = path.to_ascii_lowercase();
        let careers_page = board.is_none()
            && (host.starts_with("careers.")
                || host.starts_with("jobs.")
                || lower_path.contains("/careers")
                || lower_path.contains("/jobs"));

        Ok(Self {
            raw: raw.to_string(),
            host,
            path,
            query: parsed
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
            board,
            careers_page,
        })
    }

    fn param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Boards named by tracking parameters, excluding the host's own board.
    fn referrals(&self) -> BTreeSet<JobBoard> {
        self.query
            .iter()
            .filter(|(k, _)| TRACKING_KEYS.iter().any(|t| t.eq_ignore_ascii_case(k)))
            .filter_map(|(_, v)| JobBoard::from_tracking_value(v))
            .filter(|referred| Some(*referred) != self.board)
            .collect()
    }

    fn attempt(&self, tier: ExtractionTier) -> Option<Candidate> {
        match tier {
            ExtractionTier::DirectPath => self.direct_path(),
            ExtractionTier::QueryParameter => self.query_parameter(),
            ExtractionTier::OriginSignal => self.origin_signal(),
            ExtractionTier::GenericNumeric => self.generic_numeric(),
        }
    }

    fn direct_path(&self) -> Option<Candidate> {
        let board = self.board?;
        DIRECT_PATTERNS
            .iter()
            .filter(|(b, _)| *b == board)
            .find_map(|(_, re)| re.captures(&self.path))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .filter(|id| id.bytes().any(|b| b.is_ascii_digit()))
            .map(|id| Candidate {
                board: Some(board),
                id: namespaced(board.as_str(), id),
            })
    }

    fn query_parameter(&self) -> Option<Candidate> {
        let from_board = self.board.and_then(|board| {
            QUERY_KEYS
                .iter()
                .filter(|(b, _)| *b == board)
                .flat_map(|(_, keys)| keys.iter())
                .find_map(|key| self.param(key).filter(|v| is_query_id(v)))
                .map(|id| Candidate {
                    board: Some(board),
                    id: namespaced(board.as_str(), id),
                })
        });
        from_board.or_else(|| {
            self.param(GREENHOUSE_EMBED_KEY)
                .filter(|v| is_query_id(v))
                .map(|id| Candidate {
                    board: Some(JobBoard::Greenhouse),
                    id: namespaced(JobBoard::Greenhouse.as_str(), id),
                })
        })
    }

    fn origin_signal(&self) -> Option<Candidate> {
        if self.board.is_some_and(|b| !b.is_ats()) || self.referrals().is_empty() {
            return None;
        }
        let path = self.path.to_ascii_lowercase();
        let key = format!("{}{}", self.host, path.trim_end_matches('/'));
        Some(Candidate {
            board: self.board,
            id: namespaced("url", &key),
        })
    }

    fn generic_numeric(&self) -> Option<Candidate> {
        let query = self
            .query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let haystack = format!("{}?{}", self.path, query);
        let longest = NUMERIC_RUN.find_iter(&haystack).fold(None, |best: Option<&str>, m| {
            match best {
                Some(b) if b.len() >= m.as_str().len() => Some(b),
                _ => Some(m.as_str()),
            }
        })?;
        let prefix = self.board.map(JobBoard::as_str).unwrap_or("num");
        Some(Candidate {
            board: self.board,
            id: namespaced(prefix, longest),
        })
    }
}

fn board_for_host(host: &str) -> Option<JobBoard> {
    JobBoard::ALL.into_iter().find(|board| {
        let suffix = board.host_suffix();
        host == suffix
            || host
                .strip_suffix(suffix)
                .is_some_and(|rest| rest.ends_with('.'))
    })
}

fn is_query_id(value: &str) -> bool {
    value.len() >= 4
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn namespaced(prefix: &str, id: &str) -> String {
    format!("{prefix}:{id}")
}

fn unrecognized(url: &str, reason: impl Into<String>) -> AnalysisError {
    AnalysisError::UnrecognizedUrl {
        url: url.to_string(),
        reason: reason.into(),
    }
}

/// Deduplicates `order` and appends any tier it left out, in canonical order.
fn complete_trial_order(order: &[ExtractionTier]) -> Vec<ExtractionTier> {
    let mut seen = BTreeSet::new();
    order
        .iter()
        .chain(ExtractionTier::ALL.iter())
        .copied()
        .filter(|tier| seen.insert(*tier))
        .collect()
}

/// Classifies `raw` trying tiers in `trial_order`.
pub fn classify_url(
    raw: &str,
    trial_order: &[ExtractionTier],
) -> Result<PlatformClassification, AnalysisError> {
    let url = SubmissionUrl::parse(raw)?;
    classify_parsed(&url, trial_order)
}

fn classify_parsed(
    url: &SubmissionUrl,
    trial_order: &[ExtractionTier],
) -> Result<PlatformClassification, AnalysisError> {
    let mut tried = BTreeSet::new();
    let mut found: BTreeMap<ExtractionTier, Candidate> = BTreeMap::new();

    for tier in complete_trial_order(trial_order) {
        let candidate = url.attempt(tier);
        debug!(
            url = %url.raw,
            tier = %tier,
            matched = candidate.is_some(),
            "extraction tier attempted"
        );
        tried.insert(tier);
        if let Some(candidate) = candidate {
            found.insert(tier, candidate);
        }
        let settled = found.keys().next().is_some_and(|best| {
            ExtractionTier::ALL
                .iter()
                .filter(|t| *t < best)
                .all(|t| tried.contains(t))
        });
        if settled {
            break;
        }
    }

    let (tier, winner) = found
        .pop_first()
        .ok_or_else(|| unrecognized(&url.raw, "no extraction tier matched"))?;

    let mut hints = BTreeSet::new();
    for (other_tier, other) in found {
        if other.id != winner.id {
            hints.insert(OriginHint::AlternateId {
                tier: other_tier,
                id: other.id,
            });
        }
    }
    // Structural tiers always cross-check each other.
    let peer = match tier {
        ExtractionTier::DirectPath => Some(ExtractionTier::QueryParameter),
        ExtractionTier::QueryParameter => Some(ExtractionTier::DirectPath),
        _ => None,
    };
    if let Some(peer) = peer.filter(|p| !tried.contains(p)) {
        if let Some(other) = url.attempt(peer).filter(|c| c.id != winner.id) {
            hints.insert(OriginHint::AlternateId {
                tier: peer,
                id: other.id,
            });
        }
    }

    let referrals = url.referrals();
    hints.extend(referrals.iter().map(|board| OriginHint::ReferredBy { board: *board }));
    let board = url.board.or(winner.board);
    for ats in [url.board, winner.board].into_iter().flatten().filter(|b| b.is_ats()) {
        hints.insert(OriginHint::AtsHost { board: ats });
    }

    let platform = match board {
        Some(board) => board.kind(),
        None if !referrals.is_empty() || url.careers_page => PlatformKind::ThirdPartyAts,
        None => PlatformKind::Unknown,
    };

    Ok(PlatformClassification {
        platform,
        board,
        canonical_id: winner.id,
        tier,
        hints,
    })
}

/// Classifies submission URLs using the tier order learned for each board.
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    weights: WeightStore,
}

impl Canonicalizer {
    pub fn new(weights: WeightStore) -> Self {
        Self { weights }
    }

    pub fn classify(&self, url: &str) -> Result<PlatformClassification, AnalysisError> {
        self.classify_with(url, &self.weights.snapshot())
    }

    /// Classification plus the tier observation the feedback loop consumes.
    pub fn classify_observed(
        &self,
        url: &str,
    ) -> Result<(PlatformClassification, TierObservation), AnalysisError> {
        let classification = self.classify(url)?;
        let observation = classification.observation();
        Ok((classification, observation))
    }

    pub fn classify_with(
        &self,
        url: &str,
        weights: &WeightTable,
    ) -> Result<PlatformClassification, AnalysisError> {
        let parsed = SubmissionUrl::parse(url)?;
        let order = weights.tier_order(parsed.board);
        classify_parsed(&parsed, &order)
    }
}
