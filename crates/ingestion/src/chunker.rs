//! Text chunking module
//!
//! Splits a document into bounded, overlapping chunks tagged with the
//! structural region they came from. Sizes are counted in characters.

use crate::errors::IngestionError;
use crate::markup::{self, MarkupOutline};
use kbforge_common::config::ChunkingConfig;
use kbforge_common::metrics;
use kbforge_common::{ChunkMetadata, Document, SemanticSource, TextChunk};
use regex_lite::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use tracing::debug;
use uuid::Uuid;

/// Metadata keys owned by the chunker; never copied from the document
const RESERVED_KEYS: &[&str] = &[
    "url", "doc_id", "chunk_index", "total_chunks", "semanticSource", "navContent",
];

fn legal_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)privacy|terms|gdpr|ccpa|disclaimer|cookie|legal|notice").ok())
        .as_ref()
}

fn mentions_legal_terms(text: &str) -> bool {
    legal_pattern().is_some_and(|pattern| pattern.is_match(text))
}

/// Configuration for text chunking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// Maximum characters per chunk
    pub max_chunk_size: usize,
    /// Characters of the previous chunk repeated at the start of the next
    pub overlap_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 512,
            overlap_size: 150,
        }
    }
}

impl From<&ChunkingConfig> for ChunkerConfig {
    fn from(config: &ChunkingConfig) -> Self {
        Self {
            max_chunk_size: config.chunk_size,
            overlap_size: config.chunk_overlap,
        }
    }
}

/// Splits documents into chunks
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    /// Create a chunker, rejecting sizes that would produce wrong boundaries
    pub fn new(config: ChunkerConfig) -> Result<Self, IngestionError> {
        if config.max_chunk_size == 0 {
            return Err(IngestionError::InvalidConfig(
                "max_chunk_size must be positive".to_string(),
            ));
        }
        if config.overlap_size >= config.max_chunk_size {
            return Err(IngestionError::InvalidConfig(format!(
                "overlap_size ({}) must be smaller than max_chunk_size ({})",
                config.overlap_size, config.max_chunk_size
            )));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunk one document. Blank input yields no chunks; any other input
    /// yields at least one.
    pub fn process_document(&self, doc: &Document) -> Vec<TextChunk> {
        if doc.text.trim().is_empty() {
            debug!(doc_id = ?doc.id, "Skipping blank document");
            return Vec::new();
        }

        let doc_id = doc
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("doc-{}", Uuid::new_v4()));

        let pieces = if markup::looks_like_markup(&doc.text) {
            let outline = markup::outline(&doc.text);
            if outline.is_empty() {
                debug!(doc_id = %doc_id, "Markup produced no text, chunking as plain text");
                self.plain_pieces(&doc.text)
            } else {
                self.markup_pieces(outline)
            }
        } else {
            self.plain_pieces(&doc.text)
        };

        let chunks = build_chunks(&doc_id, doc, pieces);

        for source in [
            SemanticSource::Body,
            SemanticSource::LikelyFooter,
            SemanticSource::LegalBlock,
            SemanticSource::Navigation,
        ] {
            let count = chunks.iter().filter(|c| c.semantic_source() == source).count();
            if count > 0 {
                metrics::record_chunks(source.as_str(), count);
            }
        }

        debug!(
            doc_id = %doc_id,
            input_len = doc.text.len(),
            chunk_count = chunks.len(),
            max_chunk_size = self.config.max_chunk_size,
            "Document chunked"
        );

        chunks
    }

    /// Body chunks first, then each structural region in document order
    fn markup_pieces(&self, outline: MarkupOutline) -> Vec<(SemanticSource, String)> {
        let mut pieces: Vec<_> = self
            .split(&outline.body)
            .into_iter()
            .map(|text| (classify_body_text(&text), text))
            .collect();

        for section in outline.regions {
            pieces.extend(
                self.split(&section.text)
                    .into_iter()
                    .map(|text| (section.source, text)),
            );
        }
        pieces
    }

    fn plain_pieces(&self, text: &str) -> Vec<(SemanticSource, String)> {
        let mut pieces: Vec<_> = self
            .split(text)
            .into_iter()
            .map(|text| (classify_body_text(&text), text))
            .collect();

        // Trailing text of a longer plain document is usually sign-off or footer
        if pieces.len() >= 2 {
            if let Some(last) = pieces.last_mut() {
                last.0 = SemanticSource::LikelyFooter;
            }
        }
        pieces
    }

    /// Split text into windows of at most `max_chunk_size` characters
    pub fn split(&self, text: &str) -> Vec<String> {
        let normalized = text.replace("\r\n", "\n");
        let chars: Vec<char> = normalized.trim().chars().collect();
        let total_len = chars.len();
        let max = self.config.max_chunk_size;
        let overlap = self.config.overlap_size;

        let mut chunks = Vec::new();
        let mut start = 0;

        while start < total_len {
            if total_len - start <= max {
                push_piece(&mut chunks, &chars[start..]);
                break;
            }

            let upper = start + max;
            // Cutting past start + overlap guarantees forward progress
            let lower = (start + overlap + 1).max(start + max / 2);
            let cut = find_boundary(&chars, lower, upper).unwrap_or(upper);
            push_piece(&mut chunks, &chars[start..cut]);

            // Overlap is measured back from the end of the trimmed piece
            let mut end = cut;
            while end > start && chars[end - 1].is_whitespace() {
                end -= 1;
            }
            let mut next = end.saturating_sub(overlap).max(start + 1);
            if overlap == 0 {
                while next < total_len && chars[next].is_whitespace() {
                    next += 1;
                }
            }
            start = next;
        }

        chunks
    }
}

fn push_piece(chunks: &mut Vec<String>, chars: &[char]) {
    let text: String = chars.iter().collect();
    let text = text.trim();
    if !text.is_empty() {
        chunks.push(text.to_string());
    }
}

/// Best exclusive cut position in `lower..=upper`: paragraph break, then
/// sentence end, then whitespace
fn find_boundary(chars: &[char], lower: usize, upper: usize) -> Option<usize> {
    let candidates = || (lower..=upper).rev();

    candidates()
        .find(|&p| p >= 2 && chars[p - 1] == '\n' && chars[p - 2] == '\n')
        .or_else(|| {
            candidates().find(|&p| {
                p >= 1
                    && matches!(chars[p - 1], '.' | '!' | '?')
                    && chars.get(p).is_some_and(|c| c.is_whitespace())
            })
        })
        .or_else(|| candidates().find(|&p| chars.get(p).is_some_and(|c| c.is_whitespace())))
}

fn classify_body_text(text: &str) -> SemanticSource {
    if mentions_legal_terms(text) {
        SemanticSource::LegalBlock
    } else {
        SemanticSource::Body
    }
}

fn build_chunks(
    doc_id: &str,
    doc: &Document,
    pieces: Vec<(SemanticSource, String)>,
) -> Vec<TextChunk> {
    let total_chunks = pieces.len();
    let url = doc.url().map(str::to_string);
    let extra: Map<String, Value> = doc
        .metadata
        .iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    pieces
        .into_iter()
        .enumerate()
        .map(|(chunk_index, (source, text))| TextChunk {
            id: format!("{}-chunk-{}", doc_id, chunk_index),
            text,
            embedding: None,
            metadata: ChunkMetadata {
                doc_id: doc_id.to_string(),
                chunk_index,
                total_chunks,
                url: url.clone(),
                semantic_source: source,
                nav_content: source == SemanticSource::Navigation,
                extra: extra.clone(),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(max_chunk_size: usize, overlap_size: usize) -> Chunker {
        Chunker::new(ChunkerConfig {
            max_chunk_size,
            overlap_size,
        })
        .unwrap()
    }

    fn assert_contiguous(chunks: &[TextChunk]) {
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.metadata.chunk_index, i);
            assert_eq!(chunk.metadata.total_chunks, chunks.len());
        }
    }

    #[test]
    fn test_footer_is_kept_as_its_own_chunk() {
        let doc = Document::new(
            "<html><body><p>Intro.</p><footer>Must have a privacy policy.</footer></body></html>",
        )
        .with_id("doc1");
        let chunks = chunker(4096, 0).process_document(&doc);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].semantic_source(), SemanticSource::Body);
        assert!(chunks[0].text.contains("Intro."));
        assert_eq!(chunks[1].semantic_source(), SemanticSource::LikelyFooter);
        assert!(chunks[1].text.contains("Must have a privacy policy."));
        assert!(chunks.iter().all(|c| c.metadata.doc_id == "doc1"));
        assert_eq!(chunks[0].id, "doc1-chunk-0");
        assert_contiguous(&chunks);
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let err = Chunker::new(ChunkerConfig {
            max_chunk_size: 100,
            overlap_size: 100,
        })
        .unwrap_err();
        assert!(matches!(err, IngestionError::InvalidConfig(_)));

        assert!(Chunker::new(ChunkerConfig {
            max_chunk_size: 0,
            overlap_size: 0,
        })
        .is_err());
        assert!(Chunker::new(ChunkerConfig::default()).is_ok());
    }

    #[test]
    fn test_chunks_respect_max_size() {
        let text = "This is a test sentence with several words. ".repeat(60);
        let chunks = chunker(120, 30).process_document(&Document::new(text));
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.char_len() <= 120, "chunk too long: {}", chunk.char_len());
        }
        assert_contiguous(&chunks);
    }

    #[test]
    fn test_hard_cut_without_boundaries() {
        let text = "x".repeat(250);
        let pieces = chunker(100, 10).split(&text);
        assert_eq!(pieces[0].len(), 100);
        assert!(pieces.iter().all(|p| p.len() <= 100));
        // 0..100, 90..190, 180..250
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[2].len(), 70);
    }

    #[test]
    fn test_overlap_repeats_previous_tail() {
        let text = "x".repeat(100) + &"y".repeat(100);
        let pieces = chunker(120, 20).split(&text);
        assert_eq!(pieces[0], "x".repeat(100) + &"y".repeat(20));
        assert!(pieces[1].starts_with(&"y".repeat(20)));
    }

    #[test]
    fn test_overlap_on_mixed_boundaries_keeps_every_word() {
        let text = "Cookies are used for analytics. They help us measure traffic.\n\n\
            We share data with partners only when required by law. Requests can be sent \
            to the privacy team at any time.\n\nAccounts may be closed on request and \
            records are removed within thirty days unless retention is mandated.";
        let overlap = 15;
        let pieces = chunker(70, overlap).split(text);
        assert!(pieces.len() > 2);
        assert!(pieces.iter().all(|p| p.chars().count() <= 70));

        let mut rebuilt = pieces[0].clone();
        for pair in pieces.windows(2) {
            let prev: Vec<char> = pair[0].chars().collect();
            let tail: String = prev[prev.len() - overlap..].iter().collect();
            let tail = tail.trim_start();
            assert!(
                pair[1].starts_with(tail),
                "{:?} does not start with {:?}",
                pair[1],
                tail
            );
            rebuilt.push(' ');
            rebuilt.push_str(&pair[1][tail.len()..]);
        }

        let expected: Vec<&str> = text.split_whitespace().collect();
        let actual: Vec<&str> = rebuilt.split_whitespace().collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_overlap_skips_trailing_whitespace_at_cut() {
        let text = format!("{}\n\n{}", "a".repeat(30), "b".repeat(40));
        let pieces = chunker(50, 5).split(&text);
        assert_eq!(pieces[0], "a".repeat(30));
        assert!(pieces[1].starts_with(&"a".repeat(5)));
    }

    #[test]
    fn test_prefers_sentence_boundary() {
        let text = "First sentence is here. Second sentence follows it and runs long enough.";
        let pieces = chunker(40, 0).split(text);
        assert_eq!(pieces[0], "First sentence is here.");
        assert!(pieces[1].starts_with("Second"));
    }

    #[test]
    fn test_prefers_paragraph_break() {
        let text = "Para one line. More text.\n\nPara two starts here and keeps going on.";
        let pieces = chunker(45, 0).split(text);
        assert_eq!(pieces[0], "Para one line. More text.");
        assert!(pieces[1].starts_with("Para two"));
    }

    #[test]
    fn test_no_overlap_covers_all_words() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu";
        let pieces = chunker(20, 0).split(text);
        let rejoined = pieces.join(" ");
        assert_eq!(rejoined, text);
    }

    #[test]
    fn test_short_document_yields_one_chunk() {
        let doc = Document::new("Short note.").with_url("https://example.com/a");
        let chunks = chunker(512, 150).process_document(&doc);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].semantic_source(), SemanticSource::Body);
        assert_eq!(chunks[0].metadata.url.as_deref(), Some("https://example.com/a"));
        assert!(chunks[0].metadata.doc_id.starts_with("doc-"));
    }

    #[test]
    fn test_blank_document_yields_nothing() {
        assert!(chunker(512, 150)
            .process_document(&Document::new("  \n "))
            .is_empty());
    }

    #[test]
    fn test_plain_text_last_chunk_is_likely_footer() {
        let text = format!(
            "{}\n\nCopyright 2024 Example Corp.",
            "Body paragraph text goes on. ".repeat(10)
        );
        let chunks = chunker(100, 0).process_document(&Document::new(text));
        assert!(chunks.len() >= 2);
        assert_eq!(
            chunks.last().unwrap().semantic_source(),
            SemanticSource::LikelyFooter
        );
        assert_eq!(chunks[0].semantic_source(), SemanticSource::Body);
    }

    #[test]
    fn test_legal_terms_in_body_are_legal_blocks() {
        let doc = Document::new("<p>Read our Terms of Service before continuing.</p>");
        let chunks = chunker(512, 0).process_document(&doc);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].semantic_source(), SemanticSource::LegalBlock);
    }

    #[test]
    fn test_navigation_sets_nav_content() {
        let doc = Document::new(
            r#"<body><nav><a href="/about">About</a></nav><p>Welcome to the site.</p></body>"#,
        );
        let chunks = chunker(512, 0).process_document(&doc);
        let nav = chunks
            .iter()
            .find(|c| c.semantic_source() == SemanticSource::Navigation)
            .unwrap();
        assert!(nav.metadata.nav_content);
        assert_eq!(nav.text, "About (/about)");
        assert!(!chunks[0].metadata.nav_content);
    }

    #[test]
    fn test_markup_without_text_falls_back_to_plain() {
        let doc = Document::new("<style>p { color: red }</style><script>track()</script>");
        let chunks = chunker(512, 0).process_document(&doc);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("<script>track()</script>"));
    }

    #[test]
    fn test_document_metadata_is_copied() {
        let mut doc = Document::new("Some body text.").with_id("d");
        doc.metadata.insert("title".into(), Value::String("Home".into()));
        doc.metadata.insert("chunk_index".into(), Value::from(99));
        let chunks = chunker(512, 0).process_document(&doc);
        assert_eq!(chunks[0].metadata.extra.get("title"), Some(&Value::String("Home".into())));
        assert!(!chunks[0].metadata.extra.contains_key("chunk_index"));
        assert_eq!(chunks[0].metadata.chunk_index, 0);
    }
}
