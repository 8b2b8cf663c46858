//! Company-name normalization against a growing registry of canonical keys.

use std::collections::{BTreeMap, HashSet};
use std::sync::{PoisonError, RwLock};

use dashmap::DashMap;
use gjd_core::UNKNOWN_COMPANY_KEY;
use serde::{Deserialize, Serialize};
use strsim::normalized_levenshtein;
use tracing::debug;

use crate::config::CompanyRules;

pub const REGISTRY_SNAPSHOT_KEY: &str = "companies/registry";

pub type CompanyKey = String;

/// Persistable view of the registry; restoring it only ever adds keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyRegistrySnapshot {
    pub keys: Vec<CompanyKey>,
    #[serde(default)]
    pub aliases: BTreeMap<String, CompanyKey>,
}

#[derive(Debug)]
pub struct CompanyNormalizer {
    suffixes: HashSet<String>,
    threshold: f64,
    /// Normalized spelling to canonical key, filled by exact and fuzzy hits.
    exact: DashMap<String, CompanyKey>,
    aliases: DashMap<String, CompanyKey>,
    /// Canonical keys in registration order.
    registry: RwLock<Vec<CompanyKey>>,
}

impl CompanyNormalizer {
    pub fn new(rules: &CompanyRules, threshold: f64) -> Self {
        Self {
            suffixes: rules.suffixes.iter().map(|s| s.to_lowercase()).collect(),
            threshold,
            exact: DashMap::new(),
            aliases: DashMap::new(),
            registry: RwLock::new(Vec::new()),
        }
    }

    /// Lowercases, folds punctuation and strips trailing entity suffixes.
    pub fn normalize_name(&self, raw: &str) -> String {
        let folded: String = raw
            .to_lowercase()
            .replace('&', " and ")
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();
        let mut tokens: Vec<&str> = folded.split_whitespace().collect();
        if tokens.len() > 1 && tokens[0] == "the" {
            tokens.remove(0);
        }
        while tokens.len() > 1
            && tokens
                .last()
                .is_some_and(|last| self.suffixes.contains(*last))
        {
            tokens.pop();
        }
        tokens.join(" ")
    }

    pub fn normalize(&self, raw: &str) -> CompanyKey {
        let normalized = self.normalize_name(raw);
        if normalized.is_empty() {
            return UNKNOWN_COMPANY_KEY.to_string();
        }
        if let Some(key) = self.aliases.get(&normalized) {
            return key.value().clone();
        }
        if let Some(key) = self.exact.get(&normalized) {
            return key.value().clone();
        }

        // Fuzzy joins and mints both go through the write lock so a new
        // spelling is always checked against every spelling joined before it.
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(key) = self.exact.get(&normalized) {
            return key.value().clone();
        }
        if let Some((key, similarity)) = self.best_match(&registry, &normalized) {
            debug!(raw, key = %key, similarity, "company matched by similarity");
            self.exact.insert(normalized, key.clone());
            return key;
        }
        registry.push(normalized.clone());
        self.exact.insert(normalized.clone(), normalized.clone());
        debug!(raw, key = %normalized, "company key minted");
        normalized
    }

    /// Closest key at or above the threshold. A key only qualifies when
    /// every spelling already resolved to it is also within the threshold.
    fn best_match(&self, registry: &[CompanyKey], normalized: &str) -> Option<(CompanyKey, f64)> {
        let mut best: Option<(&CompanyKey, f64)> = None;
        for key in registry {
            let similarity = normalized_levenshtein(normalized, key);
            if similarity < self.threshold {
                continue;
            }
            if best.is_some_and(|(_, top)| similarity <= top) {
                continue;
            }
            if self.spellings_within_threshold(key, normalized) {
                best = Some((key, similarity));
            }
        }
        best.map(|(key, similarity)| (key.clone(), similarity))
    }

    fn spellings_within_threshold(&self, key: &str, normalized: &str) -> bool {
        self.exact
            .iter()
            .filter(|entry| entry.value() == key)
            .all(|entry| normalized_levenshtein(normalized, entry.key()) >= self.threshold)
    }

    /// Routes `raw` to the key `canonical` resolves to. Returns that key, or
    /// `None` when `raw` carries no usable name.
    pub fn register_alias(&self, raw: &str, canonical: &str) -> Option<CompanyKey> {
        let alias = self.normalize_name(raw);
        if alias.is_empty() {
            return None;
        }
        let key = self.normalize(canonical);
        if key == UNKNOWN_COMPANY_KEY {
            return None;
        }
        self.aliases.insert(alias, key.clone());
        Some(key)
    }

    pub fn len(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> CompanyRegistrySnapshot {
        let keys = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let aliases = self
            .aliases
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        CompanyRegistrySnapshot { keys, aliases }
    }

    pub fn restore(&self, snapshot: CompanyRegistrySnapshot) {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        for key in snapshot.keys {
            if !self.exact.contains_key(&key) {
                self.exact.insert(key.clone(), key.clone());
                registry.push(key);
            }
        }
        for (alias, key) in snapshot.aliases {
            self.aliases.insert(alias, key);
        }
    }
}
