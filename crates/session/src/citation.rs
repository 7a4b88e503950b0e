//! Citation resolution.
//!
//! Generated text cites a knowledge chunk with the markup
//! `[(<seqNo>)](citation#<id> '<file>')`. The file title may contain
//! quotes and may be left out. Resolution keeps only the
//! retrieved chunks and files the text actually cites.

use std::sync::LazyLock;

use colloquy_core::knowledge::{KnowledgeChunk, KnowledgeFile};
use colloquy_core::message::CitedChunk;
use regex_lite::Regex;

static CITATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\(\d+\)\]\(citation#([^\s')]+)(?:\s+'.*?')?\)")
        .expect("citation pattern is valid")
});

/// What a reply cited, ready to persist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Citations {
    /// Cited chunks in retrieval order, renumbered from 1
    pub cited_chunks: Vec<CitedChunk>,
    /// Names of the cited chunks' files, in candidate order
    pub cited_files: Vec<String>,
}

impl Citations {
    pub fn is_empty(&self) -> bool {
        self.cited_chunks.is_empty()
    }
}

/// Chunk ids cited in `text`, in order of first appearance.
pub fn extract_citation_ids(text: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for caps in CITATION.captures_iter(text) {
        let id = &caps[1];
        if !ids.iter().any(|known| known == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

/// Match the citations in `text` against the retrieved candidates.
pub fn resolve(text: &str, chunks: &[KnowledgeChunk], files: &[KnowledgeFile]) -> Citations {
    let ids = extract_citation_ids(text);
    if ids.is_empty() {
        return Citations::default();
    }

    let cited: Vec<&KnowledgeChunk> = chunks.iter().filter(|c| ids.contains(&c.id)).collect();

    let mut file_ids: Vec<&str> = Vec::new();
    for chunk in &cited {
        if !file_ids.contains(&chunk.file_id.as_str()) {
            file_ids.push(&chunk.file_id);
        }
    }

    Citations {
        cited_chunks: cited
            .iter()
            .enumerate()
            .map(|(idx, chunk)| CitedChunk {
                seq_no: idx + 1,
                content: chunk.content.clone(),
                id: chunk.id.clone(),
            })
            .collect(),
        cited_files: files
            .iter()
            .filter(|f| file_ids.contains(&f.id.as_str()))
            .map(|f| f.name.clone())
            .collect(),
    }
}
