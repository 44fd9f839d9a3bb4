//! Content-type-aware document chunker.
//!
//! Splits normalized document text into overlapping, semantically
//! bounded chunks and attaches entity and metadata tags. The splitting
//! policy follows the document type:
//!
//! - **Code objects** — boundaries at `METHOD`/`FORM`/`FUNCTION`/`MODULE`
//!   definitions, signature kept with the body; a unit over the hard cap
//!   is split at statement boundaries and the pieces marked as
//!   continuations.
//! - **Specs, OSS notes, customizing guides** — heading boundaries.
//! - **Runbooks** — symptom/cause/resolution/rollback/validation
//!   boundaries.
//!
//! # Guarantees
//!
//! - Chunk spans are byte offsets into the parent text; the ordered
//!   spans cover the text contiguously except for the configured
//!   overlap, and [`reconstruct`] round-trips the original.
//! - A document shorter than one chunk yields exactly one chunk.
//! - Chunks below the quality floor are discarded from the result but
//!   their spans are still recorded for audit.
//! - Chunk indices are dense: `0, 1, 2, …, N-1`.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::entities::EntityExtractor;
use crate::models::{Chunk, ChunkSpan, ChunkType, Document, DocumentType, InheritedMeta,
    SpanDisposition};

/// Chunking parameters, decoupled from application config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Token budget per chunk when grouping sections (code target upper
    /// bound as well).
    pub max_tokens: usize,
    /// Hard cap; a single unit over this is split at statement
    /// boundaries.
    pub hard_cap_tokens: usize,
    /// Overlap between adjacent chunks as a fraction of `max_tokens`.
    pub overlap_fraction: f64,
    /// Chunks scoring below this are discarded (span still recorded).
    pub quality_floor: f64,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: 500,
            hard_cap_tokens: 800,
            overlap_fraction: 0.12,
            quality_floor: 0.15,
        }
    }
}

/// Splitter with compiled boundary patterns.
pub struct Chunker {
    config: ChunkerConfig,
    code_boundary: Regex,
    heading: Regex,
    runbook_boundary: Regex,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self {
            config,
            code_boundary: Regex::new(
                r"(?i)^\s*(METHOD|FORM|FUNCTION|MODULE|CLASS|REPORT|FUNCTION-POOL)\b",
            )
            .unwrap(),
            heading: Regex::new(r"^(#{1,6}\s+\S|\d+(\.\d+)*[.)]?\s+\S|[A-Z][A-Z0-9 /_-]{4,}$)")
                .unwrap(),
            runbook_boundary: Regex::new(
                r"(?i)^\s*(symptom|cause|resolution|rollback|validation)s?\b",
            )
            .unwrap(),
        }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Split a document's normalized text into chunks with entity and
    /// metadata tags. Returns the surviving chunks plus the complete
    /// span audit record (including discarded spans).
    pub fn chunk_document(
        &self,
        doc: &Document,
        text: &str,
        extractor: &EntityExtractor,
    ) -> (Vec<Chunk>, Vec<ChunkSpan>) {
        if text.trim().is_empty() {
            return (Vec::new(), Vec::new());
        }

        let (raw_spans, chunk_type) = match doc.doc_type {
            DocumentType::CodeObject => (self.split_code(text), ChunkType::Method),
            DocumentType::Runbook => (
                self.split_sections(text, |l| self.runbook_boundary.is_match(l)),
                ChunkType::ProcedureStep,
            ),
            DocumentType::OssNote => (
                self.split_sections(text, |l| self.heading.is_match(l)),
                ChunkType::QaPair,
            ),
            _ => (
                self.split_sections(text, |l| self.heading.is_match(l)),
                ChunkType::Paragraph,
            ),
        };

        let overlap_tokens =
            ((self.config.max_tokens as f64) * self.config.overlap_fraction).round() as usize;

        let meta = InheritedMeta {
            doc_type: doc.doc_type,
            release: doc.release.clone(),
            modules: doc.modules.clone(),
            classification: doc.classification,
            jurisdiction: doc.jurisdiction.clone(),
            updated_at: doc.updated_at,
        };

        let mut chunks = Vec::new();
        let mut spans = Vec::new();
        let mut index = 0usize;
        let mut prev_span: Option<(usize, usize)> = None;

        for raw in raw_spans {
            // Extend the start backward into the previous span by the
            // overlap window (first chunk keeps its start).
            let (start, overlap_bytes) = match prev_span {
                // Continuation pieces are already contiguous fragments
                // of one unit and must stay under the hard cap.
                Some((prev_start, prev_end)) if overlap_tokens > 0 && !raw.continuation => {
                    let ov_start = overlap_start(text, prev_start, prev_end, overlap_tokens);
                    (ov_start, prev_end - ov_start)
                }
                _ => (raw.start, 0),
            };
            let slice = &text[start..raw.end];

            let quality = quality_score(slice);
            if quality < self.config.quality_floor {
                spans.push(ChunkSpan {
                    document_id: doc.id.clone(),
                    span_start: raw.start,
                    span_end: raw.end,
                    disposition: SpanDisposition::BelowQualityFloor,
                });
                prev_span = Some((raw.start, raw.end));
                continue;
            }

            let entities = extractor.extract(slice);
            chunks.push(Chunk {
                id: format!("{}:{:03}", doc.id, index),
                document_id: doc.id.clone(),
                chunk_index: index,
                chunk_type,
                span_start: start,
                span_end: raw.end,
                overlap_bytes,
                text: slice.to_string(),
                token_count: slice.split_whitespace().count(),
                continuation: raw.continuation,
                entities,
                meta: meta.clone(),
                embedding: None,
                quality,
                fingerprint: fingerprint64(slice),
                stale: false,
            });
            spans.push(ChunkSpan {
                document_id: doc.id.clone(),
                span_start: raw.start,
                span_end: raw.end,
                disposition: SpanDisposition::Indexed,
            });
            prev_span = Some((raw.start, raw.end));
            index += 1;
        }

        (chunks, spans)
    }

    /// Split code text at unit definitions, accumulating small units up
    /// to the token budget and statement-splitting oversized ones.
    fn split_code(&self, text: &str) -> Vec<RawSpan> {
        let lines = line_spans(text);
        let mut unit_starts: Vec<usize> = vec![0];
        for &(start, end) in &lines {
            if start > 0 && self.code_boundary.is_match(&text[start..end]) {
                unit_starts.push(start);
            }
        }
        unit_starts.dedup();

        let mut units: Vec<(usize, usize)> = Vec::new();
        for (i, &start) in unit_starts.iter().enumerate() {
            let end = unit_starts.get(i + 1).copied().unwrap_or(text.len());
            if start < end {
                units.push((start, end));
            }
        }

        let mut out = Vec::new();
        let mut acc: Option<(usize, usize)> = None;

        for (start, end) in units {
            let unit_tokens = token_count(&text[start..end]);
            if unit_tokens > self.config.hard_cap_tokens {
                if let Some((a, b)) = acc.take() {
                    out.push(RawSpan::plain(a, b));
                }
                out.extend(self.split_statements(text, start, end));
                continue;
            }

            match acc {
                Some((a, _b)) => {
                    if token_count(&text[a..end]) > self.config.max_tokens {
                        let (pa, pb) = acc.take().unwrap();
                        out.push(RawSpan::plain(pa, pb));
                        acc = Some((start, end));
                    } else {
                        acc = Some((a, end));
                    }
                }
                None => acc = Some((start, end)),
            }
        }
        if let Some((a, b)) = acc {
            out.push(RawSpan::plain(a, b));
        }
        out
    }

    /// Split an oversized code unit at ABAP statement boundaries
    /// (period-terminated lines). The first piece keeps the unit
    /// signature; the rest are marked as continuations.
    fn split_statements(&self, text: &str, start: usize, end: usize) -> Vec<RawSpan> {
        let mut pieces = Vec::new();
        let mut piece_start = start;
        let mut last_stmt_end = start;
        let mut first = true;

        for (ls, le) in line_spans(&text[start..end]) {
            let abs_end = start + le;
            // Cut at the last completed statement before the line that
            // would push the piece over the cap.
            if token_count(&text[piece_start..abs_end]) > self.config.hard_cap_tokens
                && last_stmt_end > piece_start
            {
                pieces.push(RawSpan {
                    start: piece_start,
                    end: last_stmt_end,
                    continuation: !first,
                });
                first = false;
                piece_start = last_stmt_end;
            }
            let line = &text[start + ls..abs_end];
            if line.trim_end().ends_with('.') {
                last_stmt_end = abs_end;
            }
        }
        if piece_start < end {
            pieces.push(RawSpan {
                start: piece_start,
                end,
                continuation: !first,
            });
        }
        pieces
    }

    /// Split prose at boundary lines (headings or runbook sections),
    /// accumulating sections up to the token budget.
    fn split_sections(&self, text: &str, is_boundary: impl Fn(&str) -> bool) -> Vec<RawSpan> {
        let lines = line_spans(text);
        let mut section_starts: Vec<usize> = vec![0];
        for &(start, end) in &lines {
            if start > 0 && is_boundary(text[start..end].trim_end()) {
                section_starts.push(start);
            }
        }
        section_starts.dedup();

        let mut sections: Vec<(usize, usize)> = Vec::new();
        for (i, &start) in section_starts.iter().enumerate() {
            let end = section_starts.get(i + 1).copied().unwrap_or(text.len());
            if start < end {
                sections.push((start, end));
            }
        }

        let mut out = Vec::new();
        let mut acc: Option<(usize, usize)> = None;
        for (start, end) in sections {
            if token_count(&text[start..end]) > self.config.max_tokens {
                if let Some((a, b)) = acc.take() {
                    out.push(RawSpan::plain(a, b));
                }
                out.extend(self.split_paragraphs(text, start, end));
                continue;
            }
            match acc {
                Some((a, _)) => {
                    if token_count(&text[a..end]) > self.config.max_tokens {
                        let (pa, pb) = acc.take().unwrap();
                        out.push(RawSpan::plain(pa, pb));
                        acc = Some((start, end));
                    } else {
                        acc = Some((a, end));
                    }
                }
                None => acc = Some((start, end)),
            }
        }
        if let Some((a, b)) = acc {
            out.push(RawSpan::plain(a, b));
        }
        out
    }

    /// Paragraph-level fallback for an oversized prose section. A
    /// paragraph that alone exceeds the budget is hard-split at line
    /// boundaries.
    fn split_paragraphs(&self, text: &str, start: usize, end: usize) -> Vec<RawSpan> {
        let section = &text[start..end];
        let mut cuts: Vec<usize> = vec![start];
        let mut search_from = 0;
        while let Some(pos) = section[search_from..].find("\n\n") {
            let abs = start + search_from + pos + 2;
            cuts.push(abs);
            search_from = search_from + pos + 2;
        }
        cuts.push(end);
        cuts.dedup();

        let mut out = Vec::new();
        let mut acc: Option<(usize, usize)> = None;
        for w in cuts.windows(2) {
            let (ps, pe) = (w[0], w[1]);
            if ps >= pe {
                continue;
            }
            if token_count(&text[ps..pe]) > self.config.max_tokens {
                if let Some((a, b)) = acc.take() {
                    out.push(RawSpan::plain(a, b));
                }
                out.extend(self.hard_split(text, ps, pe));
                continue;
            }
            match acc {
                Some((a, _)) => {
                    if token_count(&text[a..pe]) > self.config.max_tokens {
                        let (pa, pb) = acc.take().unwrap();
                        out.push(RawSpan::plain(pa, pb));
                        acc = Some((ps, pe));
                    } else {
                        acc = Some((a, pe));
                    }
                }
                None => acc = Some((ps, pe)),
            }
        }
        if let Some((a, b)) = acc {
            out.push(RawSpan::plain(a, b));
        }
        out
    }

    /// Last-resort split at line boundaries when a single paragraph
    /// exceeds the budget.
    fn hard_split(&self, text: &str, start: usize, end: usize) -> Vec<RawSpan> {
        let mut out = Vec::new();
        let mut piece_start = start;
        for (_, le) in line_spans(&text[start..end]) {
            let abs_end = start + le;
            if token_count(&text[piece_start..abs_end]) >= self.config.max_tokens {
                out.push(RawSpan::plain(piece_start, abs_end));
                piece_start = abs_end;
            }
        }
        if piece_start < end {
            out.push(RawSpan::plain(piece_start, end));
        }
        out
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(ChunkerConfig::default())
    }
}

/// A pre-chunk byte span plus its continuation marker.
#[derive(Debug, Clone, Copy)]
struct RawSpan {
    start: usize,
    end: usize,
    continuation: bool,
}

impl RawSpan {
    fn plain(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            continuation: false,
        }
    }
}

/// Reassemble a document's text from its ordered chunks, dropping each
/// chunk's overlap prefix. Inverse of chunking when no chunk was
/// discarded.
pub fn reconstruct(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    for chunk in chunks {
        out.push_str(&chunk.text[chunk.overlap_bytes..]);
    }
    out
}

/// Byte spans of lines, `[start, end)` including the trailing newline.
fn line_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    for line in text.split_inclusive('\n') {
        let end = start + line.len();
        spans.push((start, end));
        start = end;
    }
    spans
}

fn token_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Byte offset where the overlap window into `[prev_start, prev_end)`
/// begins: the start of the last `overlap_tokens` whitespace tokens,
/// clamped to the previous span's start.
fn overlap_start(text: &str, prev_start: usize, prev_end: usize, overlap_tokens: usize) -> usize {
    let prev = &text[prev_start..prev_end];
    let mut token_starts: Vec<usize> = Vec::new();
    let mut in_token = false;
    for (i, c) in prev.char_indices() {
        if c.is_whitespace() {
            in_token = false;
        } else if !in_token {
            token_starts.push(i);
            in_token = true;
        }
    }
    if token_starts.len() <= overlap_tokens {
        return prev_start;
    }
    prev_start + token_starts[token_starts.len() - overlap_tokens]
}

/// Quality score in `[0, 1]`: the alphanumeric character ratio, halved
/// for fragments of fewer than three tokens. Separator art and
/// boilerplate rulers score near zero.
pub fn quality_score(text: &str) -> f64 {
    let total = text.chars().filter(|c| !c.is_whitespace()).count();
    if total == 0 {
        return 0.0;
    }
    let alnum = text.chars().filter(|c| c.is_alphanumeric()).count();
    let base = alnum as f64 / total as f64;
    if text.split_whitespace().count() < 3 {
        base * 0.5
    } else {
        base
    }
}

/// 64-bit simhash-style shingle fingerprint for near-duplicate
/// detection. Token trigrams are hashed with FNV-1a and their bits
/// majority-voted into the signature; similar text lands within a few
/// bits of Hamming distance.
pub fn fingerprint64(text: &str) -> u64 {
    let tokens: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.is_empty() {
        return 0;
    }
    let mut counts = [0i32; 64];
    let shingles = if tokens.len() < 3 { 1 } else { tokens.len() - 2 };
    for i in 0..shingles {
        let end = (i + 3).min(tokens.len());
        let mut h = FNV_OFFSET;
        for t in &tokens[i..end] {
            for b in t.to_lowercase().as_bytes() {
                h ^= *b as u64;
                h = h.wrapping_mul(FNV_PRIME);
            }
            h ^= 0x1f;
            h = h.wrapping_mul(FNV_PRIME);
        }
        for (bit, count) in counts.iter_mut().enumerate() {
            if (h >> bit) & 1 == 1 {
                *count += 1;
            } else {
                *count -= 1;
            }
        }
    }
    let mut sig = 0u64;
    for (bit, count) in counts.iter().enumerate() {
        if *count > 0 {
            sig |= 1 << bit;
        }
    }
    sig
}

/// Hamming distance between two fingerprints.
pub fn fingerprint_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;
