//! Markdown-aware chunking for embedding and retrieval.
//!
//! Documents are cut at heading boundaries first. Sections shorter than the
//! configured minimum are merged into the section that follows them, and
//! sections longer than the maximum are windowed with a fixed overlap. Each
//! chunk records the heading stack that was active where its new content
//! starts, so a chunk that opens with `# Experience` / `## Oxy` carries both.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::entities::EntityMap;
use crate::error::{ParseError, RagError, Result};
use crate::loader::SourceDocument;
use crate::metadata::HEADING_PATH_SEPARATOR;

/// Heading hierarchy captured while walking the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionHeading {
    /// Heading depth (1-6).
    pub level: u8,
    /// Visible heading text.
    pub title: String,
}

/// Chunking tuning knobs. Sizes are UTF-8 byte lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// Upper bound on a chunk's length, overlap included.
    pub max_chunk_size: usize,
    /// Sections shorter than this are merged forward.
    pub min_chunk_size: usize,
    /// Bytes repeated from the previous chunk at the start of each chunk.
    pub chunk_overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 1000,
            min_chunk_size: 100,
            chunk_overlap: 200,
        }
    }
}

impl ChunkerConfig {
    /// Rejects combinations that cannot produce progress or honor the bounds.
    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_size == 0 {
            return Err(RagError::config("max chunk size must be positive"));
        }
        if self.chunk_overlap >= self.max_chunk_size {
            return Err(RagError::config(format!(
                "chunk overlap ({}) must be smaller than the max chunk size ({})",
                self.chunk_overlap, self.max_chunk_size
            )));
        }
        if self.min_chunk_size > self.max_chunk_size - self.chunk_overlap {
            return Err(RagError::config(format!(
                "min chunk size ({}) must not exceed max chunk size minus overlap ({})",
                self.min_chunk_size,
                self.max_chunk_size - self.chunk_overlap
            )));
        }
        Ok(())
    }
}

/// Chunk emitted for entity enrichment and embedding.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    /// Identifier of the owning document.
    pub document_id: String,
    /// Title of the owning document.
    pub document_title: String,
    /// Zero-based position within the document.
    pub index: usize,
    /// Chunk text, overlap prefix included.
    pub text: String,
    /// Heading stack active where the chunk's new content starts.
    pub heading_path: Vec<SectionHeading>,
    /// Byte offset of the chunk start within the document.
    pub char_start: usize,
    /// Exclusive byte offset of the chunk end.
    pub char_end: usize,
    /// Length of the prefix shared with the previous chunk.
    pub overlap: usize,
    /// Entities detected in the chunk text.
    pub entities: EntityMap,
}

impl Chunk {
    /// Record identifier, unique within a collection.
    pub fn id(&self) -> String {
        format!("{}#{}", self.document_id, self.index)
    }

    /// Byte range covered within the document.
    pub fn span(&self) -> Range<usize> {
        self.char_start..self.char_end
    }

    /// The part of the text not shared with the previous chunk.
    pub fn fresh_text(&self) -> &str {
        &self.text[self.overlap..]
    }

    /// Heading titles joined with ` > `.
    pub fn render_heading_path(&self) -> String {
        render_heading_path(&self.heading_path)
    }

    /// Text sent to the embedding capability: heading context plus chunk text.
    pub fn embedding_text(&self) -> String {
        let context = if self.heading_path.is_empty() {
            self.document_title.clone()
        } else {
            self.render_heading_path()
        };
        if context.trim().is_empty() {
            self.text.clone()
        } else {
            format!("{context}\n\n{}", self.text)
        }
    }
}

/// Joins heading titles with ` > `.
pub fn render_heading_path(path: &[SectionHeading]) -> String {
    path.iter()
        .map(|heading| heading.title.as_str())
        .collect::<Vec<_>>()
        .join(HEADING_PATH_SEPARATOR)
}

/// Chunks of one document plus the parse failure that forced a fallback, if any.
#[derive(Debug, Clone)]
pub struct ChunkedDocument {
    /// Ordered chunks.
    pub chunks: Vec<Chunk>,
    /// Set when the markdown was malformed and plain-text chunking was used.
    pub fallback: Option<ParseError>,
}

/// Stateless markdown chunking service.
#[derive(Debug, Clone)]
pub struct MarkdownChunker {
    config: ChunkerConfig,
}

impl MarkdownChunker {
    /// Builds a chunker after validating the config.
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Returns the underlying config reference.
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunks a document, falling back to plain text when the markdown is malformed.
    pub fn chunk(&self, document: &SourceDocument) -> ChunkedDocument {
        match self.try_chunk(document) {
            Ok(chunks) => ChunkedDocument {
                chunks,
                fallback: None,
            },
            Err(err) => {
                warn!(
                    document = %document.id,
                    error = %err,
                    "malformed markdown; chunking as plain text"
                );
                ChunkedDocument {
                    chunks: self.chunk_plain(document),
                    fallback: Some(err),
                }
            }
        }
    }

    /// Chunks a document, failing on unterminated code fences.
    pub fn try_chunk(
        &self,
        document: &SourceDocument,
    ) -> std::result::Result<Vec<Chunk>, ParseError> {
        let outline = Outline::scan(&document.text)?;
        Ok(self.build(document, &outline))
    }

    /// Chunks a document without interpreting any markdown structure.
    pub fn chunk_plain(&self, document: &SourceDocument) -> Vec<Chunk> {
        self.build(document, &Outline::default())
    }

    fn build(&self, document: &SourceDocument, outline: &Outline) -> Vec<Chunk> {
        let text = document.text.as_str();
        if text.is_empty() {
            return Vec::new();
        }

        let starts = outline.section_starts(text);
        let groups = merge_sections(text, &starts, self.config.min_chunk_size);
        let tail_floor = self
            .config
            .min_chunk_size
            .saturating_sub(self.config.chunk_overlap);

        let mut chunks = Vec::new();
        let mut previous_start: Option<usize> = None;
        for group in groups {
            let mut fresh = group.start;
            while fresh < group.end {
                let chunk_start = match previous_start {
                    Some(prev) => ceil_char_boundary(
                        text,
                        fresh.saturating_sub(self.config.chunk_overlap).max(prev),
                    ),
                    None => fresh,
                };
                let overlap = fresh - chunk_start;
                let budget = self.config.max_chunk_size - overlap;

                let end = if group.end - fresh <= budget {
                    group.end
                } else {
                    let ceiling = floor_char_boundary(text, fresh + budget);
                    let lower = ceil_char_boundary(
                        text,
                        fresh + self.config.min_chunk_size.saturating_sub(overlap),
                    )
                    .min(ceiling);
                    let mut limit = ceiling;
                    if group.end - limit < tail_floor {
                        // Never pull back past the floor of this chunk.
                        limit = floor_char_boundary(text, group.end - tail_floor).max(lower);
                    }
                    find_break(text, fresh, lower, limit)
                };

                let anchor = outline.content_anchor(text, fresh, end);
                chunks.push(Chunk {
                    document_id: document.id.clone(),
                    document_title: document.title.clone(),
                    index: chunks.len(),
                    text: text[chunk_start..end].to_string(),
                    heading_path: outline.path_at(anchor),
                    char_start: chunk_start,
                    char_end: end,
                    overlap,
                    entities: EntityMap::new(),
                });
                previous_start = Some(chunk_start);
                fresh = end;
            }
        }

        debug!(
            document = %document.id,
            chunks = chunks.len(),
            headings = outline.headings.len(),
            "chunked document"
        );
        chunks
    }
}

#[derive(Debug)]
struct HeadingLine {
    start: usize,
    end: usize,
    level: u8,
    title: String,
}

#[derive(Debug, Default)]
struct Outline {
    headings: Vec<HeadingLine>,
}

impl Outline {
    fn scan(text: &str) -> std::result::Result<Self, ParseError> {
        let mut headings = Vec::new();
        let mut fence: Option<Fence> = None;
        let mut offset = 0usize;

        for (idx, raw) in text.split_inclusive('\n').enumerate() {
            let start = offset;
            offset += raw.len();
            let line = raw.trim_end_matches(|c| c == '\n' || c == '\r');

            if let Some(open) = &fence {
                if open.closed_by(line) {
                    fence = None;
                }
                continue;
            }
            if let Some(open) = Fence::opened_by(line, idx + 1) {
                fence = Some(open);
                continue;
            }
            if let Some((level, title)) = parse_atx_heading(line) {
                headings.push(HeadingLine {
                    start,
                    end: offset,
                    level,
                    title,
                });
            }
        }

        match fence {
            Some(open) => Err(ParseError::UnterminatedFence { line: open.line }),
            None => Ok(Self { headings }),
        }
    }

    /// Offsets where sections begin. A run of headings separated only by
    /// blank lines opens a single section.
    fn section_starts(&self, text: &str) -> Vec<usize> {
        let mut starts = vec![0];
        let mut previous_end: Option<usize> = None;
        for heading in &self.headings {
            let continues_run = previous_end
                .map(|end| text[end..heading.start].trim().is_empty())
                .unwrap_or(false);
            if !continues_run && heading.start > 0 {
                starts.push(heading.start);
            }
            previous_end = Some(heading.end);
        }
        starts
    }

    /// First offset in `from..to` that is neither heading nor whitespace.
    fn content_anchor(&self, text: &str, from: usize, to: usize) -> usize {
        let mut pos = from;
        while pos < to {
            if let Some(heading) = self.heading_containing(pos) {
                pos = heading.end;
                continue;
            }
            match text[pos..].chars().next() {
                Some(ch) if ch.is_whitespace() => pos += ch.len_utf8(),
                _ => return pos,
            }
        }
        to.saturating_sub(1).max(from)
    }

    fn heading_containing(&self, pos: usize) -> Option<&HeadingLine> {
        let idx = self.headings.partition_point(|heading| heading.start <= pos);
        idx.checked_sub(1)
            .map(|i| &self.headings[i])
            .filter(|heading| pos < heading.end)
    }

    fn path_at(&self, pos: usize) -> Vec<SectionHeading> {
        let mut path = Vec::new();
        for heading in self.headings.iter().take_while(|h| h.start <= pos) {
            update_heading_path(&mut path, heading.level, &heading.title);
        }
        path
    }
}

fn update_heading_path(path: &mut Vec<SectionHeading>, level: u8, title: &str) {
    while let Some(last) = path.last() {
        if last.level >= level {
            path.pop();
        } else {
            break;
        }
    }
    path.push(SectionHeading {
        level,
        title: title.to_string(),
    });
}

struct Fence {
    marker: char,
    width: usize,
    line: usize,
}

impl Fence {
    fn opened_by(line: &str, line_no: usize) -> Option<Self> {
        let trimmed = strip_indent(line)?;
        let marker = trimmed.chars().next()?;
        if marker != '`' && marker != '~' {
            return None;
        }
        let width = trimmed.chars().take_while(|c| *c == marker).count();
        if width < 3 {
            return None;
        }
        // Backtick info strings may not contain backticks.
        if marker == '`' && trimmed[width..].contains('`') {
            return None;
        }
        Some(Self {
            marker,
            width,
            line: line_no,
        })
    }

    fn closed_by(&self, line: &str) -> bool {
        let Some(trimmed) = strip_indent(line) else {
            return false;
        };
        let width = trimmed.chars().take_while(|c| *c == self.marker).count();
        width >= self.width && trimmed[width..].trim().is_empty()
    }
}

fn strip_indent(line: &str) -> Option<&str> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        None
    } else {
        Some(&line[indent..])
    }
}

fn parse_atx_heading(line: &str) -> Option<(u8, String)> {
    let trimmed = strip_indent(line)?;
    let level = trimmed.bytes().take_while(|b| *b == b'#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with(|c: char| c == ' ' || c == '\t') {
        return None;
    }
    let mut title = rest.trim();
    let without_closing = title.trim_end_matches('#');
    if without_closing.is_empty() || without_closing.ends_with(|c: char| c == ' ' || c == '\t')
    {
        title = without_closing.trim_end();
    }
    if title.is_empty() {
        return None;
    }
    Some((level as u8, title.to_string()))
}

fn merge_sections(text: &str, starts: &[usize], min_size: usize) -> Vec<Range<usize>> {
    let mut groups = Vec::new();
    let mut group_start: Option<usize> = None;
    for (idx, &start) in starts.iter().enumerate() {
        let end = starts.get(idx + 1).copied().unwrap_or(text.len());
        let begin = *group_start.get_or_insert(start);
        let is_last = idx + 1 == starts.len();
        let substantive = end - begin >= min_size && !text[begin..end].trim().is_empty();
        if substantive || is_last {
            groups.push(begin..end);
            group_start = None;
        }
    }
    groups
}

/// Picks a split point in `lower..=limit`, preferring paragraph, line,
/// sentence and word boundaries in that order. Structural boundaries only
/// count in the back half of the window.
fn find_break(text: &str, from: usize, lower: usize, limit: usize) -> usize {
    if limit <= from {
        return ceil_char_boundary(text, from + 1);
    }
    let window = &text[from..limit];
    let min_cut = lower.saturating_sub(from);
    let structural = min_cut.max(window.len() / 2);

    for separator in ["\n\n", "\n"] {
        if let Some(pos) = window.rfind(separator) {
            let cut = pos + separator.len();
            if cut >= structural {
                return from + cut;
            }
        }
    }
    if let Some(cut) = last_sentence_end(window) {
        if cut >= structural {
            return from + cut;
        }
    }
    if let Some((pos, ch)) = window
        .char_indices()
        .rev()
        .find(|(_, ch)| ch.is_whitespace())
    {
        let cut = pos + ch.len_utf8();
        if cut >= min_cut {
            return from + cut;
        }
    }
    limit
}

fn last_sentence_end(window: &str) -> Option<usize> {
    let mut after: Option<(usize, char)> = None;
    for (pos, ch) in window.char_indices().rev() {
        if matches!(ch, '.' | '!' | '?') {
            if let Some((next_pos, next)) = after {
                if next.is_whitespace() {
                    return Some(next_pos + next.len_utf8());
                }
            }
        }
        after = Some((pos, ch));
    }
    None
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut idx = index;
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut idx = index;
    while !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(max: usize, min: usize, overlap: usize) -> MarkdownChunker {
        MarkdownChunker::new(ChunkerConfig {
            max_chunk_size: max,
            min_chunk_size: min,
            chunk_overlap: overlap,
        })
        .expect("valid config")
    }

    fn titles(chunk: &Chunk) -> Vec<&str> {
        chunk
            .heading_path
            .iter()
            .map(|heading| heading.title.as_str())
            .collect()
    }

    fn assert_tiles(doc: &SourceDocument, chunks: &[Chunk]) {
        let mut rebuilt = String::new();
        for (idx, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, idx);
            assert_eq!(chunk.text, &doc.text[chunk.span()]);
            rebuilt.push_str(chunk.fresh_text());
        }
        assert_eq!(rebuilt, doc.text);
    }

    fn long_body(sentences: usize) -> String {
        let mut body = String::new();
        for idx in 0..sentences {
            body.push_str("Designed streaming ingestion for telemetry at scale. ");
            if idx % 6 == 5 {
                body.push_str("\n\n");
            }
        }
        body
    }

    #[test]
    fn nested_headings_form_the_chunk_path() {
        let doc = SourceDocument::new(
            "resume.md",
            "# Experience\n## Oxy\nBuilt pipelines in 2019-2021.",
        );
        let chunks = MarkdownChunker::new(ChunkerConfig::default())
            .unwrap()
            .try_chunk(&doc)
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(titles(&chunks[0]), vec!["Experience", "Oxy"]);
        assert_eq!(chunks[0].render_heading_path(), "Experience > Oxy");
        assert_eq!(chunks[0].overlap, 0);
        assert_tiles(&doc, &chunks);
    }

    #[test]
    fn sections_split_at_headings_and_overlap_across_them() {
        let text = format!(
            "# Jane Doe\n## Skills\n{}\n## Experience\n{}",
            "Python and Rust across data platforms and backend services.",
            "Led the platform team that shipped the telemetry pipeline."
        );
        let doc = SourceDocument::new("resume.md", text);
        let chunks = chunker(200, 20, 10).try_chunk(&doc).unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(titles(&chunks[0]), vec!["Jane Doe", "Skills"]);
        assert_eq!(titles(&chunks[1]), vec!["Jane Doe", "Experience"]);
        assert_eq!(chunks[1].overlap, 10);
        assert!(chunks[1].fresh_text().starts_with("## Experience"));
        assert_tiles(&doc, &chunks);
    }

    #[test]
    fn short_sections_merge_forward() {
        let text = format!("# A\nshort\n# B\n{}", long_body(3));
        let doc = SourceDocument::new("notes.md", text);
        let chunks = chunker(1000, 50, 0).try_chunk(&doc).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(titles(&chunks[0]), vec!["A"]);
        assert!(chunks[0].text.contains("# B"));
    }

    #[test]
    fn long_sections_window_with_exact_overlap() {
        let mut text = String::from("# Projects\n");
        while text.len() < 10_000 {
            text.push_str(&long_body(6));
        }
        text.truncate(10_000);
        let doc = SourceDocument::new("projects.md", text);
        let chunks = chunker(1000, 100, 100).try_chunk(&doc).unwrap();

        assert!(chunks.len() >= 10, "got {} chunks", chunks.len());
        for chunk in &chunks {
            assert!(chunk.text.len() <= 1000);
            assert_eq!(titles(chunk), vec!["Projects"]);
        }
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].overlap, 100);
            assert_eq!(pair[0].char_end - pair[1].char_start, 100);
        }
        assert_tiles(&doc, &chunks);
    }

    #[test]
    fn non_final_chunks_reach_the_min_size() {
        let mut text = String::from("# Projects\n");
        for idx in 0..20 {
            let paragraph = format!("Paragraph {idx:02} shipped telemetry ingestion for the team.");
            text.push_str(&format!("{paragraph:<58}\n\n"));
        }
        let doc = SourceDocument::new("projects.md", text);

        for overlap in [0, 30] {
            let chunks = chunker(200, 150, overlap).try_chunk(&doc).unwrap();
            assert!(chunks.len() > 5);
            let lens: Vec<usize> = chunks.iter().map(|chunk| chunk.text.len()).collect();
            for len in &lens[..lens.len() - 1] {
                assert!((150..=200).contains(len), "overlap {overlap}: {lens:?}");
            }
            assert_tiles(&doc, &chunks);
        }
    }

    #[test]
    fn splits_prefer_paragraph_and_word_boundaries() {
        let doc = SourceDocument::new("a.md", long_body(40));
        let chunks = chunker(300, 0, 0).try_chunk(&doc).unwrap();
        for chunk in &chunks[..chunks.len() - 1] {
            let last = chunk.text.chars().last().unwrap();
            assert!(last.is_whitespace(), "chunk ends mid-word: {:?}", chunk.text);
        }
    }

    #[test]
    fn headings_inside_fences_are_ignored() {
        let doc = SourceDocument::new(
            "code.md",
            "# Real\nText before.\n```bash\n# not a heading\n```\nText after.",
        );
        let chunks = chunker(1000, 0, 0).try_chunk(&doc).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(titles(&chunks[0]), vec!["Real"]);
    }

    #[test]
    fn unterminated_fence_falls_back_to_plain_text() {
        let doc = SourceDocument::new("broken.md", "# Title\n```\n# inside\nno close");
        let chunker = chunker(1000, 0, 0);
        assert_eq!(
            chunker.try_chunk(&doc).unwrap_err(),
            ParseError::UnterminatedFence { line: 2 }
        );

        let chunked = chunker.chunk(&doc);
        assert!(chunked.fallback.is_some());
        assert_eq!(chunked.chunks.len(), 1);
        assert!(chunked.chunks[0].heading_path.is_empty());
        assert_eq!(chunked.chunks[0].embedding_text(), format!("Title\n\n{}", doc.text));
        assert_tiles(&doc, &chunked.chunks);
    }

    #[test]
    fn documents_without_headings_use_the_title_as_context() {
        let doc = SourceDocument::new("bio.md", "Plain paragraph about the candidate.");
        let chunks = chunker(1000, 0, 0).try_chunk(&doc).unwrap();
        assert!(chunks[0].heading_path.is_empty());
        assert!(chunks[0].embedding_text().starts_with("bio\n\n"));
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let mut text = String::from("# Résumé\n");
        for _ in 0..80 {
            text.push_str("Développeur à Zürich, 東京 et São Paulo. ");
        }
        let doc = SourceDocument::new("intl.md", text);
        let chunks = chunker(120, 10, 17).try_chunk(&doc).unwrap();
        assert!(chunks.len() > 5);
        for chunk in &chunks {
            assert!(chunk.text.len() <= 120);
            assert!(chunk.overlap <= 17);
        }
        assert_tiles(&doc, &chunks);
    }

    #[test]
    fn parses_atx_heading_variants() {
        assert_eq!(parse_atx_heading("## Skills ##"), Some((2, "Skills".into())));
        assert_eq!(parse_atx_heading("### C#"), Some((3, "C#".into())));
        assert_eq!(parse_atx_heading("   # Indented"), Some((1, "Indented".into())));
        assert_eq!(parse_atx_heading("#hashtag"), None);
        assert_eq!(parse_atx_heading("    # code"), None);
        assert_eq!(parse_atx_heading("####### seven"), None);
        assert_eq!(parse_atx_heading("#"), None);
    }

    #[test]
    fn rejects_inconsistent_config() {
        assert!(ChunkerConfig {
            max_chunk_size: 100,
            min_chunk_size: 10,
            chunk_overlap: 100,
        }
        .validate()
        .is_err());
        assert!(ChunkerConfig {
            max_chunk_size: 100,
            min_chunk_size: 90,
            chunk_overlap: 20,
        }
        .validate()
        .is_err());
        assert!(ChunkerConfig::default().validate().is_ok());
    }
}
