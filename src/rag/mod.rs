pub mod embeddings;
pub mod store;

use anyhow::anyhow;
use serde::{Serialize, Deserialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use text_splitter::TextSplitter;

use crate::rag::embeddings::EmbeddingService;
use crate::rag::store::{LinearVectorStore, VectorStore};

const CHUNK_CHARS: usize = 1000;
const SNIPPET_CHARS: usize = 600;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: HashMap<String, String>,
}

/// A row of text to vectorize.
#[derive(Clone, Debug, Default)]
pub struct TextRecord {
    pub id: String,
    pub text: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Serialize, Debug, Default, Clone, PartialEq)]
pub struct VectorizeReport {
    pub success: bool,
    pub indexed_count: usize,
    pub failed_count: usize,
    pub fetched_count: usize,
    pub missing_ids: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub snippet: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug)]
pub struct IndexStats {
    pub document_count: usize,
    pub docs_by_source: HashMap<String, usize>,
    pub total_content_bytes: usize,
    pub embedding_dimensions: usize,
    pub file_size_bytes: u64,
    pub storage_path: String,
    pub embedding_model: String,
}

impl IndexStats {
    /// Index file size for log lines, e.g. "1.50 MB".
    pub fn format_file_size(&self) -> String {
        let bytes = self.file_size_bytes;
        if bytes < 1024 {
            format!("{} B", bytes)
        } else if bytes < 1024 * 1024 {
            format!("{:.2} KB", bytes as f64 / 1024.0)
        } else {
            format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
        }
    }
}

/// Embeds text and keeps it searchable in a vector store.
pub struct VectorIndex {
    store: Mutex<Box<dyn VectorStore>>,
    embedder: Arc<dyn EmbeddingService>,
}

impl VectorIndex {
    pub fn open(storage_path: &Path, embedder: Arc<dyn EmbeddingService>) -> anyhow::Result<Self> {
        let store = LinearVectorStore::open(storage_path, &embedder.model_name(), embedder.dimensions())?;
        Ok(Self::with_store(Box::new(store), embedder))
    }

    pub fn with_store(store: Box<dyn VectorStore>, embedder: Arc<dyn EmbeddingService>) -> Self {
        Self { store: Mutex::new(store), embedder }
    }

    fn store(&self) -> anyhow::Result<MutexGuard<'_, Box<dyn VectorStore>>> {
        self.store.lock().map_err(|_| anyhow!("vector index lock poisoned"))
    }

    pub fn count_documents(&self) -> anyhow::Result<usize> {
        Ok(self.store()?.count())
    }

    /// Embeds every record with text in one batch. Records with blank text
    /// are reported in `missing_ids` and never sent to the embedder.
    pub async fn vectorize(&self, records: Vec<TextRecord>, source: &str) -> anyhow::Result<VectorizeReport> {
        let mut report = VectorizeReport::default();
        if records.is_empty() {
            report.errors.push("No records provided".to_string());
            return Ok(report);
        }

        let (present, missing): (Vec<TextRecord>, Vec<TextRecord>) =
            records.into_iter().partition(|r| !r.text.trim().is_empty());
        report.missing_ids = missing.into_iter().map(|r| r.id).collect();
        report.fetched_count = present.len();

        if present.is_empty() {
            report.errors.push("No records with text found for provided IDs".to_string());
            return Ok(report);
        }

        let texts: Vec<String> = present.iter().map(|r| r.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await;
        let created_at = chrono::Utc::now().to_rfc3339();

        let mut docs = Vec::with_capacity(present.len());
        for (record, embedding) in present.into_iter().zip(embeddings) {
            if embedding.len() != self.embedder.dimensions() {
                report.failed_count += 1;
                report.errors.push(format!(
                    "{}: expected {} dimensions, got {}",
                    record.id,
                    self.embedder.dimensions(),
                    embedding.len()
                ));
                continue;
            }
            let has_embedding = embedding.iter().any(|v| *v != 0.0);
            let mut metadata = record.metadata;
            metadata.insert("source".to_string(), source.to_string());
            metadata.insert("created_at".to_string(), created_at.clone());
            metadata.insert("has_embedding".to_string(), has_embedding.to_string());
            docs.push(Document { id: record.id, content: record.text, embedding, metadata });
        }

        let indexed = docs.len();
        if indexed > 0 {
            if let Err(e) = self.store()?.add_documents(docs) {
                tracing::error!("Failed to persist {} vectors: {}", indexed, e);
                report.failed_count += indexed;
                report.errors.push(format!("Indexing failed: {}", e));
                return Ok(report);
            }
        }
        report.indexed_count = indexed;
        report.success = report.failed_count == 0;

        tracing::info!(
            source,
            indexed = report.indexed_count,
            failed = report.failed_count,
            missing = report.missing_ids.len(),
            "Vectorization finished"
        );
        Ok(report)
    }

    /// Replaces any earlier chunks of `doc_id` with the chunks of `data`.
    pub async fn index_extraction(
        &self,
        doc_id: &str,
        data: &Value,
        metadata: HashMap<String, String>,
    ) -> anyhow::Result<VectorizeReport> {
        let text = flatten_json(data);
        let splitter = TextSplitter::new(CHUNK_CHARS);
        let chunks: Vec<&str> = splitter.chunks(&text).collect();

        let removed = self.store()?.remove_document(doc_id)?;
        if removed > 0 {
            tracing::debug!(doc_id, removed, "Dropped previous chunks");
        }

        let records = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut meta = metadata.clone();
                meta.insert("document_id".to_string(), doc_id.to_string());
                meta.insert("chunk".to_string(), i.to_string());
                TextRecord { id: format!("{}#{}", doc_id, i), text: chunk.to_string(), metadata: meta }
            })
            .collect();

        self.vectorize(records, "extraction").await
    }

    pub async fn search(&self, query: &str, top_k: usize) -> anyhow::Result<Vec<SearchHit>> {
        let query_embedding = self
            .embedder
            .embed_batch(&[query.to_string()])
            .await
            .into_iter()
            .next()
            .unwrap_or_default();

        let results = self.store()?.search(&query_embedding, top_k, 0.0)?;
        tracing::debug!(query, hits = results.len(), "Vector search");

        let query_words: Vec<String> = query.to_lowercase().split_whitespace().map(str::to_string).collect();
        Ok(results
            .into_iter()
            .map(|(doc, score)| SearchHit {
                snippet: extract_relevant_snippet(&doc.content, &query_words, SNIPPET_CHARS),
                id: doc.id,
                score,
                metadata: doc.metadata,
            })
            .collect())
    }

    pub fn get_stats(&self) -> anyhow::Result<IndexStats> {
        let store = self.store()?;
        let stats = store.get_stats();
        Ok(IndexStats {
            document_count: stats.document_count,
            docs_by_source: stats.docs_by_source,
            total_content_bytes: stats.total_content_bytes,
            embedding_dimensions: stats.embedding_dimensions,
            file_size_bytes: stats.file_size_bytes,
            storage_path: store.storage_path(),
            embedding_model: self.embedder.model_name(),
        })
    }
}

/// One `path: value` line per non-null leaf, in document order.
pub fn flatten_json(value: &Value) -> String {
    let mut lines = Vec::new();
    flatten_into(value, String::new(), &mut lines);
    lines.join("\n")
}

fn flatten_into(value: &Value, path: String, lines: &mut Vec<String>) {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (key, v) in map {
                let child = if path.is_empty() { key.clone() } else { format!("{}.{}", path, key) };
                flatten_into(v, child, lines);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(v, format!("{}[{}]", path, i), lines);
            }
        }
        Value::String(s) if s.trim().is_empty() => {}
        Value::String(s) => lines.push(format!("{}: {}", path, s.trim())),
        other => lines.push(format!("{}: {}", path, other)),
    }
}

/// Starts a few words before the densest run of query words.
fn extract_relevant_snippet(content: &str, query_words: &[String], max_chars: usize) -> String {
    const WINDOW: usize = 30;
    const LEAD_IN: usize = 5;

    let words: Vec<&str> = content.split_whitespace().collect();
    let is_hit = |word: &str| {
        let lowered = word.to_lowercase();
        query_words.iter().any(|qw| lowered.contains(qw.as_str()))
    };

    let mut best_start = 0;
    let mut best_score = 0;
    for i in (0..words.len()).filter(|&i| is_hit(words[i])) {
        let end = (i + WINDOW).min(words.len());
        let score = words[i..end].iter().filter(|w| is_hit(w)).count();
        if score > best_score {
            best_score = score;
            best_start = i;
        }
    }
    let start = best_start.saturating_sub(LEAD_IN);

    let mut snippet = String::new();
    for word in &words[start..] {
        if snippet.chars().count() + word.chars().count() + 1 > max_chars {
            snippet.push_str("...");
            break;
        }
        if !snippet.is_empty() {
            snippet.push(' ');
        }
        snippet.push_str(word);
    }
    if start > 0 {
        snippet = format!("...{}", snippet);
    }
    snippet
}
