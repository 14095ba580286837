use super::Document;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Backend for embedded chunks. Implementations persist on every mutation.
pub trait VectorStore: Send + Sync {
    /// Inserts or replaces by id
    fn add_documents(&mut self, docs: Vec<Document>) -> Result<()>;

    /// Documents scoring above `min_score`, best first, at most `top_k` (0 = all)
    fn search(&self, query_embedding: &[f32], top_k: usize, min_score: f32) -> Result<Vec<(Document, f32)>>;

    fn count(&self) -> usize;

    fn contains(&self, id: &str) -> bool;

    /// Drops `prefix` and every `prefix#n` chunk; returns how many went
    fn remove_document(&mut self, prefix: &str) -> Result<usize>;

    fn storage_path(&self) -> String;

    fn get_stats(&self) -> StoreStats;
}

#[derive(Default, Debug)]
pub struct StoreStats {
    pub document_count: usize,
    pub docs_by_source: HashMap<String, usize>,
    pub total_content_bytes: usize,
    pub embedding_dimensions: usize,
    pub file_size_bytes: u64,
}

/// On-disk layout. Vectors from a different model or width are not comparable,
/// so a header mismatch discards the stored documents.
#[derive(Serialize, Deserialize)]
struct IndexFile {
    model: String,
    dimensions: usize,
    documents: Vec<Document>,
}

/// Exact cosine scan over every stored vector, persisted with bincode.
pub struct LinearVectorStore {
    path: PathBuf,
    model: String,
    dimensions: usize,
    documents: Vec<Document>,
}

impl LinearVectorStore {
    pub fn open(path: &Path, model: &str, dimensions: usize) -> Result<Self> {
        let mut store = Self {
            path: path.to_path_buf(),
            model: model.to_string(),
            dimensions,
            documents: Vec::new(),
        };
        if !path.exists() {
            return Ok(store);
        }

        let reader = BufReader::new(std::fs::File::open(path)?);
        match bincode::deserialize_from::<_, IndexFile>(reader) {
            Ok(file) if file.model == model && file.dimensions == dimensions => {
                tracing::debug!(path = %path.display(), documents = file.documents.len(), "Loaded vector index");
                store.documents = file.documents;
            }
            Ok(file) => tracing::warn!(
                stored_model = %file.model,
                stored_dimensions = file.dimensions,
                model,
                dimensions,
                "Embedding model changed, discarding {} stored vectors",
                file.documents.len()
            ),
            Err(e) => tracing::warn!(path = %path.display(), "Unreadable vector index, starting empty: {}", e),
        }
        Ok(store)
    }

    fn persist(&self) -> Result<()> {
        let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            let file = IndexFile {
                model: self.model.clone(),
                dimensions: self.dimensions,
                documents: self.documents.clone(),
            };
            bincode::serialize_into(&mut writer, &file)?;
            writer.flush()?;
        }
        tmp.persist(&self.path)?;
        Ok(())
    }
}

impl VectorStore for LinearVectorStore {
    fn add_documents(&mut self, docs: Vec<Document>) -> Result<()> {
        if let Some(bad) = docs.iter().find(|d| d.embedding.len() != self.dimensions) {
            bail!("{} has {} dimensions, index expects {}", bad.id, bad.embedding.len(), self.dimensions);
        }
        for doc in docs {
            match self.documents.iter_mut().find(|d| d.id == doc.id) {
                Some(slot) => *slot = doc,
                None => self.documents.push(doc),
            }
        }
        self.persist()
    }

    fn search(&self, query_embedding: &[f32], top_k: usize, min_score: f32) -> Result<Vec<(Document, f32)>> {
        if query_embedding.len() != self.dimensions {
            bail!("query has {} dimensions, index expects {}", query_embedding.len(), self.dimensions);
        }
        let mut ranked: Vec<(&Document, f32)> = self
            .documents
            .iter()
            .map(|d| (d, cosine_similarity(query_embedding, &d.embedding)))
            .filter(|(_, score)| *score > min_score)
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        if top_k > 0 {
            ranked.truncate(top_k);
        }
        Ok(ranked.into_iter().map(|(d, score)| (d.clone(), score)).collect())
    }

    fn count(&self) -> usize {
        self.documents.len()
    }

    fn contains(&self, id: &str) -> bool {
        self.documents.iter().any(|d| d.id == id)
    }

    fn remove_document(&mut self, prefix: &str) -> Result<usize> {
        let chunk_prefix = format!("{}#", prefix);
        let before = self.documents.len();
        self.documents.retain(|d| d.id != prefix && !d.id.starts_with(&chunk_prefix));
        let removed = before - self.documents.len();
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    fn storage_path(&self) -> String {
        self.path.display().to_string()
    }

    fn get_stats(&self) -> StoreStats {
        let mut docs_by_source: HashMap<String, usize> = HashMap::new();
        for doc in &self.documents {
            let source = doc.metadata.get("source").map(String::as_str).unwrap_or("unknown");
            *docs_by_source.entry(source.to_string()).or_default() += 1;
        }
        StoreStats {
            document_count: self.documents.len(),
            docs_by_source,
            total_content_bytes: self.documents.iter().map(|d| d.content.len()).sum(),
            embedding_dimensions: self.dimensions,
            file_size_bytes: std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
        }
    }
}

/// Zero vectors score 0 against everything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
