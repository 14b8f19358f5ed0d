//! Best-effort entity detection over chunk text.
//!
//! Extraction is deterministic and rule-based: regular expressions for dates
//! and "City, ST" locations, a configurable skill lexicon, and runs of
//! capitalized words for organization names. Results are sets, so repeated
//! mentions collapse.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::chunker::Chunk;

/// Entity categories attached to chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Year ranges, month-year and numeric month/year mentions.
    Date,
    /// Companies, agencies and other named organizations.
    Organization,
    /// Cities, states and countries.
    Location,
    /// Terms from the skill lexicon.
    Skill,
}

impl EntityKind {
    /// All kinds in metadata order.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Date,
        EntityKind::Organization,
        EntityKind::Location,
        EntityKind::Skill,
    ];

    /// Metadata key holding the flattened entity list.
    pub fn metadata_key(self) -> &'static str {
        match self {
            Self::Date => "dates",
            Self::Organization => "organizations",
            Self::Location => "locations",
            Self::Skill => "skills",
        }
    }

    /// Heading used when the kind is shown to a reader.
    pub fn label(self) -> &'static str {
        match self {
            Self::Date => "Dates",
            Self::Organization => "Organizations",
            Self::Location => "Locations",
            Self::Skill => "Skills",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Date => "date",
            Self::Organization => "organization",
            Self::Location => "location",
            Self::Skill => "skill",
        };
        f.write_str(label)
    }
}

/// Entities grouped by kind.
pub type EntityMap = BTreeMap<EntityKind, BTreeSet<String>>;

/// Technology terms recognized in resume text.
pub const DEFAULT_SKILLS: &[&str] = &[
    "Python", "JavaScript", "TypeScript", "Java", "Rust", "Go", "C#", "C++", "Scala",
    "Kotlin", "Swift", "Bash", "SQL", "NoSQL", "MySQL", "PostgreSQL", "MongoDB", "Redis",
    "Snowflake", "Databricks", "React", "Angular", "Vue", "Node.js", "Django", "Flask",
    "FastAPI", "GraphQL", "REST API", "Azure", "AWS", "GCP", "Docker", "Kubernetes",
    "Terraform", "CI/CD", "Jenkins", "GitHub Actions", "Git", "Linux", "Apache Spark",
    "Spark", "Kafka", "RabbitMQ", "Airflow", "Iceberg", "IoT Hub", "Event Hub", "IoT",
    "Serverless", "Pandas", "PyTorch", "TensorFlow", "Machine Learning", "LangChain",
    "OpenAI", "pgvector",
];

/// Multi-word and single-word place names treated as locations.
pub const DEFAULT_GAZETTEER: &[&str] = &[
    "houston", "austin", "dallas", "san antonio", "new orleans", "baton rouge", "denver",
    "seattle", "san francisco", "los angeles", "san diego", "new york", "chicago", "boston",
    "atlanta", "miami", "phoenix", "portland", "texas", "louisiana", "california",
    "colorado", "florida", "oklahoma", "virginia", "north carolina", "south carolina",
    "new mexico", "united states", "usa", "canada", "mexico", "switzerland", "germany",
    "united kingdom", "japan", "okinawa", "camp pendleton", "camp lejeune", "remote",
];

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "i", "my", "we", "our", "in", "at", "on", "to", "by", "with", "from",
    "as", "this", "that", "these", "he", "she", "they", "it", "and", "or", "of", "for",
    "present", "current", "january", "february", "march", "april", "may", "june", "july",
    "august", "september", "october", "november", "december", "monday", "tuesday",
    "wednesday", "thursday", "friday", "saturday", "sunday", "led", "built", "designed",
    "developed", "managed", "created", "implemented", "worked", "responsible", "senior",
    "junior", "lead", "summary", "experience", "education", "skills", "projects",
    "contact", "about", "key", "technical",
];

const CONNECTORS: &[&str] = &["of", "&", "the", "de"];

const US_STATE_CODES: &[&str] = &[
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "FL", "GA", "HI", "ID", "IL", "IN", "IA",
    "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH", "NJ",
    "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT", "VT",
    "VA", "WA", "WV", "WI", "WY", "DC",
];

const MONTHS: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// Configurable list of skill terms.
#[derive(Debug, Clone)]
pub struct SkillLexicon {
    terms: Vec<SkillTerm>,
}

#[derive(Debug, Clone)]
struct SkillTerm {
    canonical: String,
    needle: String,
    case_sensitive: bool,
}

impl Default for SkillLexicon {
    fn default() -> Self {
        Self::new(DEFAULT_SKILLS.iter().copied())
    }
}

impl SkillLexicon {
    /// Builds a lexicon. Short terms (three characters or fewer) match
    /// case-sensitively so that `Go` does not fire on "go".
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let terms = terms
            .into_iter()
            .map(|term| term.as_ref().trim().to_string())
            .filter(|term| !term.is_empty())
            .map(|canonical| {
                let case_sensitive = canonical.chars().count() <= 3;
                let needle = if case_sensitive {
                    canonical.clone()
                } else {
                    canonical.to_ascii_lowercase()
                };
                SkillTerm {
                    canonical,
                    needle,
                    case_sensitive,
                }
            })
            .collect();
        Self { terms }
    }

    /// Canonical spellings of every term.
    pub fn terms(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().map(|term| term.canonical.as_str())
    }

    /// Whether `candidate` is a lexicon term, ignoring ASCII case.
    pub fn contains(&self, candidate: &str) -> bool {
        self.terms
            .iter()
            .any(|term| term.canonical.eq_ignore_ascii_case(candidate))
    }

    fn find_in(&self, text: &str, lowered: &str, found: &mut BTreeSet<String>) {
        for term in &self.terms {
            let haystack = if term.case_sensitive { text } else { lowered };
            let hit = haystack
                .match_indices(term.needle.as_str())
                .any(|(start, matched)| is_word_bounded(text, start, start + matched.len()));
            if hit {
                found.insert(term.canonical.clone());
            }
        }
    }
}

fn is_word_bounded(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    let is_word = |ch: char| ch.is_alphanumeric() || ch == '_';
    !before.map(is_word).unwrap_or(false) && !after.map(is_word).unwrap_or(false)
}

/// Rule-based entity extractor.
#[derive(Debug, Clone)]
pub struct EntityExtractor {
    lexicon: SkillLexicon,
    gazetteer: BTreeSet<String>,
    stopwords: BTreeSet<String>,
    year_range: Regex,
    month_year: Regex,
    numeric_month: Regex,
    city_state: Regex,
}

impl Default for EntityExtractor {
    fn default() -> Self {
        Self::new(SkillLexicon::default())
    }
}

impl EntityExtractor {
    /// Builds an extractor with the given skill lexicon and the default gazetteer.
    pub fn new(lexicon: SkillLexicon) -> Self {
        Self {
            lexicon,
            gazetteer: DEFAULT_GAZETTEER.iter().map(|s| s.to_string()).collect(),
            stopwords: STOPWORDS.iter().map(|s| s.to_string()).collect(),
            year_range: Regex::new(
                r"\b((?:19|20)\d{2})\s*(?:-|–|—|to)\s*((?:19|20)\d{2}|[Pp]resent|[Cc]urrent|[Nn]ow|[Tt]oday)\b",
            )
            .expect("year range pattern"),
            month_year: Regex::new(
                r"(?i)\b(jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)\.?,?\s+((?:19|20)\d{2})\b",
            )
            .expect("month year pattern"),
            numeric_month: Regex::new(r"\b(0?[1-9]|1[0-2])/((?:19|20)\d{2})\b")
                .expect("numeric month pattern"),
            city_state: Regex::new(r"\b([A-Z][a-z]+(?: [A-Z][a-z]+)*), ([A-Z]{2})\b")
                .expect("city state pattern"),
        }
    }

    /// Adds place names recognized as locations.
    pub fn with_gazetteer<I, S>(mut self, places: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.gazetteer
            .extend(places.into_iter().map(|p| p.as_ref().to_lowercase()));
        self
    }

    /// Returns the skill lexicon.
    pub fn lexicon(&self) -> &SkillLexicon {
        &self.lexicon
    }

    /// Extracts every entity kind from `text`. Every kind is present; kinds
    /// with no hits map to an empty set.
    pub fn extract(&self, text: &str) -> EntityMap {
        let mut dates = BTreeSet::new();
        let mut organizations = BTreeSet::new();
        let mut locations = BTreeSet::new();
        let mut skills = BTreeSet::new();

        self.find_dates(text, &mut dates);
        self.lexicon
            .find_in(text, &text.to_ascii_lowercase(), &mut skills);
        self.find_city_states(text, &mut locations);
        self.find_named_runs(text, &mut organizations, &mut locations);

        EntityMap::from([
            (EntityKind::Date, dates),
            (EntityKind::Organization, organizations),
            (EntityKind::Location, locations),
            (EntityKind::Skill, skills),
        ])
    }

    /// Fills [`Chunk::entities`] for every chunk.
    pub fn enrich(&self, chunks: &mut [Chunk]) {
        for chunk in chunks {
            chunk.entities = self.extract(&chunk.text);
        }
    }

    fn find_dates(&self, text: &str, found: &mut BTreeSet<String>) {
        for caps in self.year_range.captures_iter(text) {
            let end = &caps[2];
            let end = if end.chars().all(|c| c.is_ascii_digit()) {
                end.to_string()
            } else {
                "Present".to_string()
            };
            found.insert(format!("{}-{}", &caps[1], end));
        }
        for caps in self.month_year.captures_iter(text) {
            if let Some(month) = month_name(&caps[1]) {
                found.insert(format!("{month} {}", &caps[2]));
            }
        }
        for caps in self.numeric_month.captures_iter(text) {
            if let Ok(month) = caps[1].parse::<u8>() {
                found.insert(format!("{month:02}/{}", &caps[2]));
            }
        }
    }

    fn find_city_states(&self, text: &str, found: &mut BTreeSet<String>) {
        for caps in self.city_state.captures_iter(text) {
            if US_STATE_CODES.contains(&&caps[2]) {
                found.insert(format!("{}, {}", &caps[1], &caps[2]));
            }
        }
    }

    fn find_named_runs(
        &self,
        text: &str,
        organizations: &mut BTreeSet<String>,
        locations: &mut BTreeSet<String>,
    ) {
        for line in text.lines() {
            let mut run: Vec<&str> = Vec::new();
            for raw in line.split_whitespace() {
                let opens_clause = raw.starts_with(&['(', '[', '"'][..]);
                if opens_clause {
                    self.flush_run(&mut run, organizations, locations);
                }

                let word = raw.trim_matches(|c: char| !c.is_alphanumeric() && c != '&');
                if word.is_empty() {
                    self.flush_run(&mut run, organizations, locations);
                    continue;
                }

                if is_capitalized(word) {
                    if self.gazetteer.contains(&word.to_lowercase()) {
                        locations.insert(word.to_string());
                    }
                    run.push(word);
                } else if !run.is_empty() && CONNECTORS.contains(&word.to_lowercase().as_str()) {
                    run.push(word);
                } else {
                    self.flush_run(&mut run, organizations, locations);
                }

                let closes_clause = raw
                    .trim_end_matches(&['*', '_', '`', '"', '\''][..])
                    .ends_with(&[',', '.', ';', ':', '!', '?', ')', ']'][..]);
                if closes_clause {
                    self.flush_run(&mut run, organizations, locations);
                }
            }
            self.flush_run(&mut run, organizations, locations);
        }
    }

    fn flush_run(
        &self,
        run: &mut Vec<&str>,
        organizations: &mut BTreeSet<String>,
        locations: &mut BTreeSet<String>,
    ) {
        let words = std::mem::take(run);
        let mut start = 0;
        let mut end = words.len();
        while start < end && self.is_edge_noise(words[start]) {
            start += 1;
        }
        while end > start && self.is_edge_noise(words[end - 1]) {
            end -= 1;
        }
        let core = &words[start..end];
        let capitalized = core.iter().filter(|word| is_capitalized(word)).count();
        if capitalized < 2 {
            return;
        }

        let candidate = core.join(" ");
        if self.lexicon.contains(&candidate) {
            return;
        }
        if self.gazetteer.contains(&candidate.to_lowercase()) {
            locations.insert(candidate);
        } else {
            organizations.insert(candidate);
        }
    }

    fn is_edge_noise(&self, word: &str) -> bool {
        let lowered = word.to_lowercase();
        self.stopwords.contains(&lowered) || CONNECTORS.contains(&lowered.as_str())
    }
}

fn is_capitalized(word: &str) -> bool {
    word.chars().next().map(char::is_uppercase).unwrap_or(false)
}

fn month_name(token: &str) -> Option<&'static str> {
    let lowered = token.to_ascii_lowercase();
    let prefix = lowered.get(..3)?;
    MONTHS
        .iter()
        .copied()
        .find(|month| month.to_ascii_lowercase().starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(entities: &EntityMap, kind: EntityKind) -> Vec<&str> {
        entities[&kind].iter().map(String::as_str).collect()
    }

    #[test]
    fn every_kind_is_present_even_without_hits() {
        let entities = EntityExtractor::default().extract("hello there");
        assert_eq!(entities.len(), EntityKind::ALL.len());
        for kind in EntityKind::ALL {
            assert!(entities[&kind].is_empty(), "{kind:?}");
        }
    }

    #[test]
    fn normalizes_dates() {
        let extractor = EntityExtractor::default();
        let entities = extractor.extract(
            "Built pipelines in 2019-2021. Lead from 2021 – present. Joined Sept. 2018, left 03/2020.",
        );
        assert_eq!(
            values(&entities, EntityKind::Date),
            vec!["03/2020", "2019-2021", "2021-Present", "September 2018"]
        );
    }

    #[test]
    fn finds_lexicon_skills_with_word_boundaries() {
        let extractor = EntityExtractor::default();
        let entities =
            extractor.extract("Shipped javascript and Node.js services on AWS; no MySQLish words. let's go");
        assert_eq!(
            values(&entities, EntityKind::Skill),
            vec!["AWS", "JavaScript", "Node.js"]
        );
    }

    #[test]
    fn capitalized_runs_become_organizations_or_locations() {
        let extractor = EntityExtractor::default();
        let entities = extractor.extract(
            "Worked at Enchanted Rock in Houston, TX after serving in the United States Marine Corps.\n\
             Moved to New Orleans for Entergy Services.",
        );
        assert_eq!(
            values(&entities, EntityKind::Organization),
            vec!["Enchanted Rock", "Entergy Services", "United States Marine Corps"]
        );
        assert_eq!(
            values(&entities, EntityKind::Location),
            vec!["Houston", "Houston, TX", "New Orleans"]
        );
    }

    #[test]
    fn skill_phrases_are_not_organizations() {
        let extractor = EntityExtractor::default();
        let entities = extractor.extract("Automated releases with GitHub Actions and Machine Learning.");
        assert!(values(&entities, EntityKind::Organization).is_empty());
        assert_eq!(
            values(&entities, EntityKind::Skill),
            vec!["GitHub Actions", "Machine Learning"]
        );
    }

    #[test]
    fn extraction_is_deterministic_and_deduplicated() {
        let extractor = EntityExtractor::default();
        let text = "Python at Clutch Sports. Python again at Clutch Sports in 2022-2023.";
        let first = extractor.extract(text);
        assert_eq!(first, extractor.extract(text));
        assert_eq!(values(&first, EntityKind::Skill), vec!["Python"]);
        assert_eq!(values(&first, EntityKind::Organization), vec!["Clutch Sports"]);
    }

    #[test]
    fn custom_lexicon_replaces_defaults() {
        let extractor = EntityExtractor::new(SkillLexicon::new(["Fortran"]));
        let entities = extractor.extract("Fortran and Python");
        assert_eq!(values(&entities, EntityKind::Skill), vec!["Fortran"]);
    }
}
