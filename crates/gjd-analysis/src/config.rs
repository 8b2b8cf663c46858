//! Environment configuration and YAML rule files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use gjd_core::FactorName;
use regex::Regex;
use serde::{Deserialize, Serialize};

const RULES_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub company_similarity_threshold: f64,
    pub near_duplicate_threshold: f64,
    pub max_candidates_per_company: usize,
    pub store_timeout: Duration,
    pub feedback_queue: usize,
    pub learning_rate: f64,
    pub persist_every: usize,
    pub rules_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            company_similarity_threshold: 0.80,
            near_duplicate_threshold: 0.80,
            max_candidates_per_company: 256,
            store_timeout: Duration::from_millis(2000),
            feedback_queue: 1024,
            learning_rate: 0.1,
            persist_every: 25,
            rules_dir: PathBuf::from("./rules"),
            state_dir: PathBuf::from("./state"),
        }
    }
}

impl AnalysisConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            company_similarity_threshold: env_or(
                "GJD_COMPANY_SIMILARITY_THRESHOLD",
                defaults.company_similarity_threshold,
            ),
            near_duplicate_threshold: env_or(
                "GJD_NEAR_DUPLICATE_THRESHOLD",
                defaults.near_duplicate_threshold,
            ),
            max_candidates_per_company: env_or(
                "GJD_MAX_CANDIDATES_PER_COMPANY",
                defaults.max_candidates_per_company,
            ),
            store_timeout: Duration::from_millis(env_or("GJD_STORE_TIMEOUT_MS", 2000)),
            feedback_queue: env_or("GJD_FEEDBACK_QUEUE", defaults.feedback_queue),
            learning_rate: env_or("GJD_LEARNING_RATE", defaults.learning_rate),
            persist_every: env_or("GJD_PERSIST_EVERY", defaults.persist_every),
            rules_dir: std::env::var("GJD_RULES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.rules_dir),
            state_dir: std::env::var("GJD_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringThresholds {
    pub stale_after_days: i64,
    pub recent_within_days: i64,
    pub repost_window_days: i64,
    pub min_description_words: usize,
    pub min_requirement_markers: usize,
    pub uploaded_document_confidence: f64,
}

impl Default for ScoringThresholds {
    fn default() -> Self {
        Self {
            stale_after_days: 30,
            recent_within_days: 7,
            repost_window_days: 45,
            min_description_words: 80,
            min_requirement_markers: 3,
            uploaded_document_confidence: 0.6,
        }
    }
}

const DEFAULT_COMPENSATION_PATTERNS: &[&str] = &[
    r"[$€£]\s?\d",
    r"\b(?:usd|eur|gbp|cad|aud)\s?\d",
    r"\d(?:[\d,.]*\d)?\s?(?:k|usd|eur|gbp)\b",
    r"\b(?:salary|compensation|pay range|pay rate|base pay)\b[^.\n\d]{0,40}\d",
    r"\d[^.\n]{0,30}\b(?:per (?:hour|year|annum)|an hour|annually)\b",
    r"\d\s?/\s?(?:hr|hour|yr|year)\b",
];

/// Case-insensitive regexes kept next to their YAML source text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct PatternList {
    sources: Vec<String>,
    compiled: Vec<Regex>,
}

impl PatternList {
    fn builtin(patterns: &[&str]) -> Self {
        let sources = strings(patterns);
        Self::try_from(sources).expect("built-in patterns compile")
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Byte ranges of every match in `text`.
    pub fn find_all<'a>(&'a self, text: &'a str) -> impl Iterator<Item = (usize, usize)> + 'a {
        self.compiled
            .iter()
            .flat_map(move |re| re.find_iter(text).map(|m| (m.start(), m.end())))
    }
}

impl TryFrom<Vec<String>> for PatternList {
    type Error = regex::Error;

    fn try_from(sources: Vec<String>) -> Result<Self, Self::Error> {
        let compiled = sources
            .iter()
            .map(|source| Regex::new(&format!("(?i){source}")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { sources, compiled })
    }
}

impl From<PatternList> for Vec<String> {
    fn from(list: PatternList) -> Self {
        list.sources
    }
}

impl PartialEq for PatternList {
    fn eq(&self, other: &Self) -> bool {
        self.sources == other.sources
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringRules {
    pub bias: f64,
    pub weights: BTreeMap<FactorName, f64>,
    #[serde(default)]
    pub thresholds: ScoringThresholds,
    #[serde(default)]
    pub boilerplate_phrases: Vec<String>,
    #[serde(default)]
    pub compensation_patterns: PatternList,
    #[serde(default)]
    pub vague_location_terms: Vec<String>,
    #[serde(default)]
    pub requirement_markers: Vec<String>,
}

impl Default for ScoringRules {
    fn default() -> Self {
        let weights = [
            (FactorName::StalePosting, 1.2),
            (FactorName::RepostCluster, 1.0),
            (FactorName::ThinDescription, 0.9),
            (FactorName::BoilerplateLanguage, 0.8),
            (FactorName::MissingCompensation, 0.6),
            (FactorName::VagueLocation, 0.5),
            (FactorName::VerifiedCompany, 1.0),
            (FactorName::DetailedRequirements, 0.6),
            (FactorName::RecentPosting, 0.5),
            (FactorName::BaselineAssessment, 0.0),
        ]
        .into_iter()
        .collect();
        Self {
            bias: -0.6,
            weights,
            thresholds: ScoringThresholds::default(),
            boilerplate_phrases: strings(&[
                "fast-paced environment",
                "rockstar",
                "ninja",
                "self-starter",
                "wear many hats",
                "competitive salary",
                "always looking for talented",
                "talent pipeline",
                "future opportunities",
                "work hard play hard",
                "dynamic team",
                "other duties as assigned",
            ]),
            compensation_patterns: PatternList::builtin(DEFAULT_COMPENSATION_PATTERNS),
            vague_location_terms: strings(&[
                "anywhere",
                "multiple locations",
                "various locations",
                "nationwide",
                "tbd",
                "flexible",
                "global",
            ]),
            requirement_markers: strings(&[
                "years of experience",
                "bachelor",
                "degree",
                "proficien",
                "experience with",
                "knowledge of",
                "familiarity with",
                "certification",
                "must have",
                "qualifications",
                "responsibilities",
                "you will",
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedCompanySeed {
    pub name: String,
    pub verified_postings: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyRules {
    pub suffixes: Vec<String>,
    #[serde(default)]
    pub verified_companies: Vec<VerifiedCompanySeed>,
}

impl Default for CompanyRules {
    fn default() -> Self {
        Self {
            suffixes: strings(&[
                "inc",
                "incorporated",
                "llc",
                "ltd",
                "limited",
                "corp",
                "corporation",
                "co",
                "company",
                "gmbh",
                "plc",
                "sa",
                "ag",
                "bv",
                "pty",
                "lp",
                "llp",
                "group",
                "holdings",
            ]),
            verified_companies: vec![
                VerifiedCompanySeed {
                    name: "Microsoft".into(),
                    verified_postings: 12,
                },
                VerifiedCompanySeed {
                    name: "Google LLC".into(),
                    verified_postings: 10,
                },
                VerifiedCompanySeed {
                    name: "Apple Inc.".into(),
                    verified_postings: 8,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RulesFile<T> {
    version: u32,
    #[serde(flatten)]
    body: T,
}

#[derive(Debug, Clone, Default)]
pub struct Rules {
    pub scoring: ScoringRules,
    pub companies: CompanyRules,
}

impl Rules {
    /// Loads `scoring.yaml` and `companies.yaml` from `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        Ok(Self {
            scoring: read_rules_file(&dir.join("scoring.yaml"))?,
            companies: read_rules_file(&dir.join("companies.yaml"))?,
        })
    }
}

fn read_rules_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: RulesFile<T> =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    ensure!(
        file.version == RULES_VERSION,
        "{} has version {}, expected {}",
        path.display(),
        file.version,
        RULES_VERSION
    );
    Ok(file.body)
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    #[test]
    fn shipped_rules_match_builtin_defaults() {
        let rules = Rules::from_dir(&workspace_root().join("rules")).unwrap();
        let defaults = Rules::default();
        assert_eq!(rules.scoring.weights, defaults.scoring.weights);
        assert_eq!(rules.scoring.bias, defaults.scoring.bias);
        assert_eq!(rules.scoring.boilerplate_phrases, defaults.scoring.boilerplate_phrases);
        assert_eq!(rules.scoring.compensation_patterns, defaults.scoring.compensation_patterns);
        assert_eq!(rules.scoring.requirement_markers, defaults.scoring.requirement_markers);
        assert_eq!(
            rules.scoring.thresholds.stale_after_days,
            defaults.scoring.thresholds.stale_after_days
        );
        assert_eq!(rules.companies.suffixes, defaults.companies.suffixes);
        assert_eq!(rules.companies.verified_companies.len(), 3);
    }

    #[test]
    fn unknown_rules_version_is_rejected() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("scoring.yaml"),
            "version: 9\nbias: 0.0\nweights: {}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("companies.yaml"), "version: 1\nsuffixes: []\n").unwrap();
        let err = Rules::from_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("version 9"));
    }

    #[test]
    fn invalid_compensation_patterns_fail_to_load() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("scoring.yaml"),
            "version: 1\nbias: 0.0\nweights: {}\ncompensation_patterns:\n  - \"(unclosed\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("companies.yaml"), "version: 1\nsuffixes: []\n").unwrap();
        let err = Rules::from_dir(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("scoring.yaml"));
    }

    #[test]
    fn env_values_fall_back_on_garbage() {
        assert_eq!(env_or("GJD_TEST_UNSET_VARIABLE", 0.8), 0.8);
    }
}
