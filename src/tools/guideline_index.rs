//! In-memory guideline index
//!
//! Read-only keyword-overlap retrieval over pre-chunked guideline text.
//! Results are deterministic for a fixed set of chunks: ties keep insertion
//! order. Share one index across concurrent runs behind an `Arc`.

use crate::tools::{DocumentRetrieval, GuidelineChunk, ToolError};
use async_trait::async_trait;
use std::collections::HashSet;

pub const DEFAULT_CHUNK_CHARS: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

const MIN_TERM_LEN: usize = 3;

/// Source document prior to chunking
#[derive(Debug, Clone)]
pub struct GuidelineDocument {
    pub source: String,
    pub category: String,
    pub text: String,
}

#[derive(Debug)]
struct IndexedChunk {
    chunk: GuidelineChunk,
    terms: HashSet<String>,
}

/// Deterministic retrieval index over guideline chunks
#[derive(Debug, Default)]
pub struct GuidelineIndex {
    chunks: Vec<IndexedChunk>,
}

impl GuidelineIndex {
    pub fn from_chunks(chunks: Vec<GuidelineChunk>) -> Self {
        Self {
            chunks: chunks
                .into_iter()
                .map(|chunk| IndexedChunk {
                    terms: tokenize(&chunk.content),
                    chunk,
                })
                .collect(),
        }
    }

    /// Split documents into overlapping fixed-size chunks and index them
    pub fn from_documents(documents: &[GuidelineDocument], chunk_chars: usize, overlap: usize) -> Self {
        let chunks = documents
            .iter()
            .flat_map(|doc| {
                split_chunks(&doc.text, chunk_chars, overlap)
                    .into_iter()
                    .map(move |content| GuidelineChunk {
                        content,
                        source: doc.source.clone(),
                        category: doc.category.clone(),
                    })
            })
            .collect();
        Self::from_chunks(chunks)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Top `k` chunks by number of shared query terms; chunks sharing none are skipped
    pub fn search(&self, query: &str, k: usize) -> Vec<GuidelineChunk> {
        let query_terms = tokenize(query);
        let mut scored: Vec<(usize, usize)> = self
            .chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (i, c.terms.intersection(&query_terms).count()))
            .filter(|(_, overlap)| *overlap > 0)
            .collect();

        scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        scored
            .into_iter()
            .take(k)
            .map(|(i, _)| self.chunks[i].chunk.clone())
            .collect()
    }
}

#[async_trait]
impl DocumentRetrieval for GuidelineIndex {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<GuidelineChunk>, ToolError> {
        if self.is_empty() {
            return Err(ToolError::RetrievalUnavailable(
                "guideline index is empty".to_string(),
            ));
        }
        Ok(self.search(query, k))
    }
}

/// Lowercased alphanumeric terms of at least three characters
fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= MIN_TERM_LEN)
        .map(str::to_lowercase)
        .collect()
}

/// Char windows of `size` advancing by `size - overlap`
fn split_chunks(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() || size == 0 {
        return Vec::new();
    }

    let step = size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size).min(chars.len());
        let chunk: String = chars[start..end].iter().collect();
        if !chunk.trim().is_empty() {
            chunks.push(chunk.trim().to_string());
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}
