#![allow(dead_code)]

use std::fs;
use std::path::Path;

use portfolio_rag::error::EmbedError;
use portfolio_rag::Embedder;

/// Counts occurrences of a fixed vocabulary, one dimension per term.
pub struct VocabularyEmbedder {
    model: String,
    vocabulary: Vec<&'static str>,
}

pub const VOCABULARY: &[&str] = &[
    "rust",
    "python",
    "typescript",
    "programming",
    "languages",
    "skills",
    "experience",
    "engineer",
    "energy",
    "houston",
    "marine",
    "weather",
    "pipeline",
    "data",
];

impl VocabularyEmbedder {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            vocabulary: VOCABULARY.to_vec(),
        }
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.vocabulary.len()];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| !word.is_empty())
        {
            let word = word.to_lowercase();
            if let Some(idx) = self.vocabulary.iter().position(|term| *term == word) {
                vector[idx] += 1.0;
            }
        }
        vector
    }
}

impl Embedder for VocabularyEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(inputs.iter().map(|text| self.vector(text)).collect())
    }
}

pub const RESUME: &str = "# Jane Doe

## Experience

### Enchanted Rock
Senior Data Engineer in Houston, TX from 2019-2021. Built energy data pipelines for microgrid telemetry.

### United States Marine Corps
Served as a communications specialist 2010-2014.

## Skills
Programming languages: Rust, Python, TypeScript. Strong skills in data pipeline design.
";

pub const PROJECTS: &str = "# Projects

## Crawler
A polite web crawler with a persistent frontier and per-host throttling.
";

/// Writes the sample portfolio into `dir`.
pub fn write_portfolio(dir: &Path) {
    fs::write(dir.join("resume.md"), RESUME).unwrap();
    fs::create_dir_all(dir.join("extra")).unwrap();
    fs::write(dir.join("extra").join("projects.md"), PROJECTS).unwrap();
    fs::write(dir.join("notes.bin"), [0u8, 159, 146, 150]).unwrap();
}
