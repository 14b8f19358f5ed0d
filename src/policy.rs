//! Per-intent retrieval parameters, optionally loaded from TOML.
//!
//! ```toml
//! candidate_multiplier = 2
//! max_candidates = 12
//! expand_queries = true
//!
//! [skills]
//! top_k = 5
//! min_similarity = 0.22
//! expansion = "skills technologies tools"
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::classifier::{default_rules, ClassifierRule, Intent, QueryClassifier};
use crate::error::{RagError, Result};

/// Retrieval knobs for one intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentParams {
    /// Maximum number of chunks returned.
    pub top_k: usize,
    /// Minimum similarity (1 - cosine distance) a chunk must reach.
    pub min_similarity: f32,
    /// Terms appended to the query text before embedding, when expansion is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expansion: Option<String>,
}

impl IntentParams {
    fn new(top_k: usize, min_similarity: f32, expansion: &str) -> Self {
        Self {
            top_k,
            min_similarity,
            expansion: Some(expansion.to_string()),
        }
    }
}

/// Retrieval policy covering every intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalPolicy {
    /// Parameters for [`Intent::General`].
    pub general: IntentParams,
    /// Parameters for [`Intent::CareerHistory`].
    pub career_history: IntentParams,
    /// Parameters for [`Intent::Skills`].
    pub skills: IntentParams,
    /// Parameters for [`Intent::Technical`].
    pub technical: IntentParams,
    /// Candidates fetched per requested result before threshold filtering.
    pub candidate_multiplier: usize,
    /// Hard cap on fetched candidates (never below `top_k`).
    pub max_candidates: usize,
    /// Append each intent's expansion terms to the embedded query text.
    pub expand_queries: bool,
    /// Classifier rules; `None` keeps the built-in rules.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<ClassifierRule>>,
}

impl Default for RetrievalPolicy {
    fn default() -> Self {
        Self {
            general: IntentParams::new(
                7,
                0.15,
                "professional summary background profile overview",
            ),
            career_history: IntentParams::new(
                6,
                0.20,
                "work history employment timeline job chronology",
            ),
            skills: IntentParams::new(
                5,
                0.22,
                "skills technologies tools expertise proficiency",
            ),
            technical: IntentParams::new(
                4,
                0.25,
                "technical implementation architecture systems design",
            ),
            candidate_multiplier: 2,
            max_candidates: 12,
            expand_queries: false,
            rules: None,
        }
    }
}

impl RetrievalPolicy {
    /// Parses and validates a TOML policy. Missing sections keep defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let policy: Self = toml::from_str(raw)
            .map_err(|err| RagError::config(format!("invalid retrieval policy: {err}")))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Reads a TOML policy file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|source| RagError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parameters for `intent`.
    pub fn params(&self, intent: Intent) -> &IntentParams {
        match intent {
            Intent::General => &self.general,
            Intent::CareerHistory => &self.career_history,
            Intent::Skills => &self.skills,
            Intent::Technical => &self.technical,
        }
    }

    /// Candidate count for a request of `top_k` results.
    pub fn candidate_count(&self, top_k: usize) -> usize {
        top_k
            .saturating_mul(self.candidate_multiplier.max(1))
            .min(self.max_candidates)
            .max(top_k)
    }

    /// Classifier configured by this policy.
    pub fn classifier(&self) -> QueryClassifier {
        QueryClassifier::new(self.rules.clone().unwrap_or_else(default_rules))
    }

    /// Rejects thresholds outside `[0, 1]` and empty result sizes.
    pub fn validate(&self) -> Result<()> {
        for intent in Intent::ALL {
            let params = self.params(intent);
            if params.top_k == 0 {
                return Err(RagError::config(format!("{intent}.top_k must be positive")));
            }
            if !(0.0..=1.0).contains(&params.min_similarity) {
                return Err(RagError::config(format!(
                    "{intent}.min_similarity must be within [0, 1], got {}",
                    params.min_similarity
                )));
            }
        }
        if self.candidate_multiplier == 0 {
            return Err(RagError::config("candidate_multiplier must be positive"));
        }
        Ok(())
    }
}
