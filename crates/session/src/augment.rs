//! Knowledge augmentation of a prompt.
//!
//! Retrieves chunks from the chat's collections and rewrites the prompt into
//! a context block with citation instructions, followed by the original
//! prompt as the objective. The retrieved chunks and their files are kept so
//! the reply's citations can be resolved against them afterwards.

use colloquy_core::error::RetrievalError;
use colloquy_core::knowledge::{KnowledgeChunk, KnowledgeFile, KnowledgeService};
use serde::Serialize;
use tracing::debug;

const CONTEXT_PREAMBLE: &str = r#"
# Context #
Please read carefully and use the following context information in JSON format to answer questions.
The context format is {"seqNo": number, "id": "id", "file":"fileName", "content": "content"}.
When using context information in your response, output the reference as `[(<seqNo>)](citation#<id> '<file>')` strictly after the relevant content.
---------------------------------------------------
For example:
the context information is: {"seqNo": 1, "id": "432939KFD83242", "file":"Fruit Encyclopedia", "content": "apples are one of common fruit"}.
and the question is: "What are some common fruits?".
The answer should be:
"According to the information provided, apples are a common fruit [(1)](citation#432939KFD83242 'Fruit Encyclopedia')."
---------------------------------------------------
Ensure that the context information is accurately referenced, and label it as [(<seqNo>)](citation#<id> '<file>') when a piece of information is actually used.
"#;

/// The prompt actually sent, plus the candidates citations can refer to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Augmentation {
    pub prompt: String,
    pub chunks: Vec<KnowledgeChunk>,
    pub files: Vec<KnowledgeFile>,
}

impl Augmentation {
    /// The raw prompt with nothing retrieved.
    pub fn passthrough(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            ..Self::default()
        }
    }

    pub fn is_augmented(&self) -> bool {
        !self.chunks.is_empty()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContextEntry<'a> {
    seq_no: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<&'a str>,
    id: &'a str,
    content: &'a str,
}

/// Retrieve context for `prompt` from the given collections.
///
/// With no collections the prompt passes through unchanged and no
/// retrieval call is made.
pub async fn augment(
    knowledge: &dyn KnowledgeService,
    prompt: &str,
    collection_ids: &[String],
) -> Result<Augmentation, RetrievalError> {
    if collection_ids.is_empty() {
        return Ok(Augmentation::passthrough(prompt));
    }

    let chunks = knowledge.search(collection_ids, prompt).await?;
    knowledge.cache_chunks(&chunks);

    let mut file_ids: Vec<String> = Vec::new();
    for chunk in &chunks {
        if !file_ids.contains(&chunk.file_id) {
            file_ids.push(chunk.file_id.clone());
        }
    }
    let files = knowledge.get_files(&file_ids).await?;

    debug!(
        collections = collection_ids.len(),
        chunks = chunks.len(),
        files = files.len(),
        "Prompt augmented with knowledge"
    );

    Ok(Augmentation {
        prompt: build_prompt(prompt, &chunks, &files)?,
        chunks,
        files,
    })
}

/// Render the augmented prompt. Chunks are numbered from 1 in retrieval order.
pub fn build_prompt(
    prompt: &str,
    chunks: &[KnowledgeChunk],
    files: &[KnowledgeFile],
) -> Result<String, RetrievalError> {
    let entries: Vec<ContextEntry<'_>> = chunks
        .iter()
        .enumerate()
        .map(|(idx, chunk)| ContextEntry {
            seq_no: idx + 1,
            file: files
                .iter()
                .find(|f| f.id == chunk.file_id)
                .map(|f| f.name.as_str()),
            id: &chunk.id,
            content: &chunk.content,
        })
        .collect();
    let context = serde_json::to_string(&entries)
        .map_err(|e| RetrievalError::MalformedPayload(e.to_string()))?;

    Ok(format!(
        "{CONTEXT_PREAMBLE}{context}\n\n# Objective #\n{prompt}\n"
    ))
}
