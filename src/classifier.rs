//! Keyword-based query intent classification.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RagError;

/// Coarse query category driving retrieval parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// How something was designed or built.
    Technical,
    /// Employers, roles and timelines.
    CareerHistory,
    /// Languages, tools and proficiencies.
    Skills,
    /// Anything else.
    General,
}

impl Intent {
    /// All intents.
    pub const ALL: [Intent; 4] = [
        Intent::Technical,
        Intent::CareerHistory,
        Intent::Skills,
        Intent::General,
    ];

    /// Stable snake_case label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Technical => "technical",
            Self::CareerHistory => "career_history",
            Self::Skills => "skills",
            Self::General => "general",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Intent {
    type Err = RagError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Intent::ALL
            .into_iter()
            .find(|intent| intent.as_str() == value.trim())
            .ok_or_else(|| RagError::config(format!("unknown intent `{value}`")))
    }
}

/// Phrases that select one intent. Rules are evaluated in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierRule {
    /// Intent selected when any phrase matches.
    pub intent: Intent,
    /// Whole-word phrases, matched case-insensitively.
    pub phrases: Vec<String>,
}

impl ClassifierRule {
    fn new(intent: Intent, phrases: &[&str]) -> Self {
        Self {
            intent,
            phrases: phrases.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Default rules in priority order: skills, technical, career history.
pub fn default_rules() -> Vec<ClassifierRule> {
    vec![
        ClassifierRule::new(
            Intent::Skills,
            &[
                "skill",
                "skills",
                "skillset",
                "skill set",
                "programming languages",
                "languages do you",
                "proficient",
                "proficiency",
                "familiar with",
                "do you know",
                "tech stack",
                "toolset",
                "technologies",
                "frameworks",
                "certifications",
                "certified",
                "expertise",
                "strengths",
                "good at",
            ],
        ),
        ClassifierRule::new(
            Intent::Technical,
            &[
                "architecture",
                "architect",
                "design",
                "designed",
                "implement",
                "implemented",
                "implementation",
                "how did you build",
                "how did you",
                "how does",
                "system",
                "systems",
                "pipeline",
                "pipelines",
                "iot",
                "cloud",
                "aws",
                "azure",
                "gcp",
                "kubernetes",
                "docker",
                "terraform",
                "microservices",
                "api",
                "apis",
                "database",
                "databases",
                "machine learning",
                "data engineering",
                "devops",
                "scalability",
                "performance",
                "infrastructure",
                "kafka",
                "spark",
            ],
        ),
        ClassifierRule::new(
            Intent::CareerHistory,
            &[
                "career",
                "work history",
                "work experience",
                "employment",
                "job",
                "jobs",
                "role",
                "roles",
                "position",
                "positions",
                "company",
                "companies",
                "employer",
                "employers",
                "worked",
                "experience",
                "timeline",
                "how long",
                "years",
                "joined",
                "previous",
                "promotion",
                "responsibilities",
                "oxy",
                "occidental",
                "entergy",
                "enchanted rock",
                "u blox",
                "ublox",
                "clutch sports",
                "marine corps",
                "marines",
            ],
        ),
    ]
}

/// Deterministic first-match classifier.
#[derive(Debug, Clone)]
pub struct QueryClassifier {
    rules: Vec<CompiledRule>,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    intent: Intent,
    needles: Vec<String>,
}

impl Default for QueryClassifier {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl QueryClassifier {
    /// Builds a classifier; earlier rules win over later ones.
    pub fn new(rules: Vec<ClassifierRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| CompiledRule {
                intent: rule.intent,
                needles: rule
                    .phrases
                    .iter()
                    .map(|phrase| normalize(phrase))
                    .filter(|needle| !needle.trim().is_empty())
                    .collect(),
            })
            .collect();
        Self { rules }
    }

    /// Classifies a query. Empty or unmatched queries are [`Intent::General`].
    pub fn classify(&self, query: &str) -> Intent {
        let haystack = normalize(query);
        self.rules
            .iter()
            .find(|rule| rule.needles.iter().any(|needle| haystack.contains(needle.as_str())))
            .map(|rule| rule.intent)
            .unwrap_or(Intent::General)
    }
}

/// Lowercases, keeps word characters plus `#`/`+`, and pads with spaces so
/// `contains(" term ")` is a whole-word test.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push(' ');
    let mut last_space = true;
    for ch in text.chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() || ch == '#' || ch == '+' {
            out.push(ch);
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    if !last_space {
        out.push(' ');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn programming_language_questions_are_skills() {
        let classifier = QueryClassifier::default();
        assert_eq!(
            classifier.classify("What programming languages do you know?"),
            Intent::Skills
        );
    }

    #[test]
    fn priority_order_breaks_ties() {
        let classifier = QueryClassifier::default();
        // "skills" and "experience" both match; skills wins.
        assert_eq!(
            classifier.classify("What skills did that experience build?"),
            Intent::Skills
        );
        // "designed" (technical) beats "worked" (career history).
        assert_eq!(
            classifier.classify("How was the pipeline designed when you worked at Oxy?"),
            Intent::Technical
        );
        assert_eq!(
            classifier.classify("When did you join Entergy and what was your role?"),
            Intent::CareerHistory
        );
    }

    #[test]
    fn matches_whole_words_only() {
        let classifier = QueryClassifier::default();
        assert_eq!(classifier.classify("Tell me a joke about rapid testing"), Intent::General);
        assert_eq!(classifier.classify("Any apis?"), Intent::Technical);
    }

    #[test]
    fn empty_and_unmatched_queries_are_general() {
        let classifier = QueryClassifier::default();
        assert_eq!(classifier.classify(""), Intent::General);
        assert_eq!(classifier.classify("   ?!  "), Intent::General);
        assert_eq!(classifier.classify("Hello there"), Intent::General);
    }

    #[test]
    fn custom_rules_replace_defaults() {
        let classifier = QueryClassifier::new(vec![ClassifierRule::new(
            Intent::Technical,
            &["rust"],
        )]);
        assert_eq!(classifier.classify("Rust?"), Intent::Technical);
        assert_eq!(classifier.classify("skills?"), Intent::General);
    }

    #[test]
    fn intents_parse_from_labels() {
        assert_eq!("career_history".parse::<Intent>().unwrap(), Intent::CareerHistory);
        assert!("careers".parse::<Intent>().is_err());
    }
}
