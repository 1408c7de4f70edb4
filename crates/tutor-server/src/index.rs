/// Persistent per-subject vector indices.
///
/// An index directory holds a LanceDB database with a single `chunks` table plus a
/// `manifest.json` describing what was embedded. Builds are written to a sibling staging
/// directory and renamed into place only once complete, so the final path either holds a
/// whole index or nothing.
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{
    Array, ArrayRef, FixedSizeListArray, Float32Array, RecordBatch, StringArray, UInt32Array,
};
use arrow_schema::{DataType, Field, Schema};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use tutor_common::embedding::Embed;
use tutor_common::error::CommonError;
use tutor_common::vectordb::VectorDb;

use crate::error::AppError;
use crate::model::{Chunk, ScoredChunk, SourceTag};

const TABLE_NAME: &str = "chunks";
const MANIFEST_FILE: &str = "manifest.json";
const STAGING_SUFFIX: &str = ".building";

/// Query-time interface over a built index.
pub trait Retrieve: Send + Sync + 'static {
    /// Up to `k` chunks most similar to `query`, highest score first.
    fn retrieve_top_k(
        &self,
        query: &str,
        k: usize,
    ) -> impl Future<Output = Result<Vec<ScoredChunk>, AppError>> + Send;
}

/// Creates and opens persisted indices.
pub trait IndexStore: Send + Sync + 'static {
    type Index: Retrieve;

    /// Whether a persisted index is present at `dir`.
    fn exists(&self, dir: &Path) -> bool;

    fn load(&self, dir: &Path) -> impl Future<Output = Result<Self::Index, AppError>> + Send;

    /// Embed `chunks` and persist them at `dir`. An index already present at `dir` is
    /// loaded rather than rewritten.
    fn build(
        &self,
        chunks: &[Chunk],
        dir: &Path,
    ) -> impl Future<Output = Result<Self::Index, AppError>> + Send;
}

/// Written next to the table; identifies the chunk set and embedding shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub chunk_count: usize,
    pub dimensions: usize,
    /// SHA-256 over every chunk's source, position and text, lowercase hex
    pub digest: String,
}

impl Manifest {
    pub fn for_chunks(chunks: &[Chunk], dimensions: usize) -> Self {
        Self {
            chunk_count: chunks.len(),
            dimensions,
            digest: chunk_digest(chunks),
        }
    }
}

/// LanceDB-backed store. Both building and querying embed through `E`.
pub struct LanceIndexStore<E> {
    embedder: Arc<E>,
}

impl<E: Embed> LanceIndexStore<E> {
    pub fn new(embedder: Arc<E>) -> Self {
        Self { embedder }
    }

    async fn write_staged(&self, chunks: &[Chunk], staging: &Path) -> Result<(), AppError> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        info!(chunks = texts.len(), "generating embeddings");
        let embeddings = self.embedder.embed_documents(&texts).await?;

        if embeddings.len() != chunks.len() {
            return Err(CommonError::Embedding(format!(
                "embedding count mismatch: expected {}, got {}",
                chunks.len(),
                embeddings.len()
            ))
            .into());
        }
        let dimensions = self.embedder.dimensions();
        if let Some(bad) = embeddings.iter().find(|e| e.len() != dimensions) {
            return Err(CommonError::Embedding(format!(
                "embedding dimension mismatch: expected {dimensions}, got {}",
                bad.len()
            ))
            .into());
        }

        tokio::fs::create_dir_all(staging).await?;
        let db = VectorDb::connect(&staging.to_string_lossy()).await?;
        let batch = build_record_batch(chunks, &embeddings, dimensions)?;
        db.create_table(TABLE_NAME, batch.schema(), vec![batch])
            .await?;

        let manifest = Manifest::for_chunks(chunks, dimensions);
        let raw = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| CommonError::VectorDb(format!("failed to encode manifest: {e}")))?;
        tokio::fs::write(staging.join(MANIFEST_FILE), raw).await?;
        Ok(())
    }
}

impl<E: Embed> IndexStore for LanceIndexStore<E> {
    type Index = LanceIndex<E>;

    fn exists(&self, dir: &Path) -> bool {
        dir.is_dir()
    }

    async fn load(&self, dir: &Path) -> Result<LanceIndex<E>, AppError> {
        let dimensions = self.embedder.dimensions();
        match read_manifest(dir).await? {
            Some(manifest) if manifest.dimensions != dimensions => {
                return Err(CommonError::VectorDb(format!(
                    "index at {} holds {}-dimensional vectors, embedder produces {dimensions}",
                    dir.display(),
                    manifest.dimensions
                ))
                .into());
            }
            Some(manifest) => {
                debug!(chunks = manifest.chunk_count, digest = %manifest.digest, "manifest ok");
            }
            None => warn!(dir = %dir.display(), "index has no manifest, skipping checks"),
        }

        let db = VectorDb::connect(&dir.to_string_lossy()).await?;
        db.ensure_table(TABLE_NAME).await?;
        Ok(LanceIndex {
            db,
            embedder: Arc::clone(&self.embedder),
        })
    }

    async fn build(&self, chunks: &[Chunk], dir: &Path) -> Result<LanceIndex<E>, AppError> {
        if self.exists(dir) {
            info!(dir = %dir.display(), "index already present, loading instead of rebuilding");
            return self.load(dir).await;
        }
        if chunks.is_empty() {
            return Err(AppError::EmptySources(dir.to_path_buf()));
        }

        let staging = staging_dir(dir);
        if staging.exists() {
            warn!(dir = %staging.display(), "removing leftover staging directory");
            tokio::fs::remove_dir_all(&staging).await?;
        }

        if let Err(e) = self.write_staged(chunks, &staging).await {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&staging).await {
                debug!(error = %cleanup, "staging cleanup failed");
            }
            return Err(e);
        }
        tokio::fs::rename(&staging, dir).await?;
        info!(dir = %dir.display(), chunks = chunks.len(), "index persisted");

        self.load(dir).await
    }
}

pub struct LanceIndex<E> {
    db: VectorDb,
    embedder: Arc<E>,
}

impl<E: Embed> Retrieve for LanceIndex<E> {
    async fn retrieve_top_k(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>, AppError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_embedding = self.embedder.embed_query(query).await?;
        let batches = self.db.search(TABLE_NAME, &query_embedding, k).await?;
        let mut results = extract_scored_chunks(&batches);
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(k);
        Ok(results)
    }
}

fn staging_dir(dir: &Path) -> PathBuf {
    let mut name = dir.as_os_str().to_os_string();
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

async fn read_manifest(dir: &Path) -> Result<Option<Manifest>, AppError> {
    let path = dir.join(MANIFEST_FILE);
    let raw = match tokio::fs::read(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| CommonError::VectorDb(format!("invalid manifest {}: {e}", path.display())).into())
}

fn chunk_digest(chunks: &[Chunk]) -> String {
    let mut h = Sha256::new();
    for chunk in chunks {
        h.update(chunk.source.to_string().as_bytes());
        h.update([0u8]);
        h.update((chunk.index as u64).to_le_bytes());
        h.update((chunk.start as u64).to_le_bytes());
        h.update(chunk.text.as_bytes());
        h.update([0u8]);
    }
    format!("{:x}", h.finalize())
}

fn build_record_batch(
    chunks: &[Chunk],
    embeddings: &[Vec<f32>],
    dimensions: usize,
) -> Result<RecordBatch, AppError> {
    let batch_error = |e: arrow_schema::ArrowError| {
        AppError::Common(CommonError::VectorDb(format!("failed to build record batch: {e}")))
    };
    let dim = i32::try_from(dimensions)
        .map_err(|_| CommonError::VectorDb(format!("unsupported dimension {dimensions}")))?;

    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    let sources: Vec<String> = chunks.iter().map(|c| c.source.to_string()).collect();
    let indices: Vec<u32> = chunks.iter().map(|c| c.index as u32).collect();
    let starts: Vec<u32> = chunks.iter().map(|c| c.start as u32).collect();

    let text_array: ArrayRef = Arc::new(StringArray::from(texts));
    let source_array: ArrayRef = Arc::new(StringArray::from(sources));
    let index_array: ArrayRef = Arc::new(UInt32Array::from(indices));
    let start_array: ArrayRef = Arc::new(UInt32Array::from(starts));

    let flat_values: Vec<f32> = embeddings.iter().flat_map(|e| e.iter().copied()).collect();
    let item_field = Arc::new(Field::new("item", DataType::Float32, true));
    let embedding_array: ArrayRef = Arc::new(
        FixedSizeListArray::try_new(
            Arc::clone(&item_field),
            dim,
            Arc::new(Float32Array::from(flat_values)),
            None,
        )
        .map_err(batch_error)?,
    );

    let schema = Arc::new(Schema::new(vec![
        Field::new("text", DataType::Utf8, false),
        Field::new("source", DataType::Utf8, false),
        Field::new("chunk_index", DataType::UInt32, false),
        Field::new("chunk_start", DataType::UInt32, false),
        Field::new(
            "embedding",
            DataType::FixedSizeList(item_field, dim),
            false,
        ),
    ]));

    RecordBatch::try_new(
        schema,
        vec![
            text_array,
            source_array,
            index_array,
            start_array,
            embedding_array,
        ],
    )
    .map_err(batch_error)
}

/// Turn search result rows into scored chunks.
///
/// LanceDB reports L2 distance in `_distance`; the score is `1 - distance` clamped at zero.
/// Rows with an unreadable source tag are skipped.
fn extract_scored_chunks(batches: &[RecordBatch]) -> Vec<ScoredChunk> {
    let mut results = Vec::new();

    for batch in batches {
        let text_col = string_column(batch, "text");
        let source_col = string_column(batch, "source");
        let index_col = u32_column(batch, "chunk_index");
        let start_col = u32_column(batch, "chunk_start");
        let distance_col = f32_column(batch, "_distance");

        let (Some(text_col), Some(source_col)) = (text_col, source_col) else {
            warn!("search result batch missing expected columns");
            continue;
        };

        for row in 0..batch.num_rows() {
            let source = match source_col.value(row).parse::<SourceTag>() {
                Ok(source) => source,
                Err(e) => {
                    warn!(error = %e, "skipping row with bad source tag");
                    continue;
                }
            };
            let distance = distance_col.map(|c| c.value(row)).unwrap_or(0.0);
            results.push(ScoredChunk {
                chunk: Chunk {
                    source,
                    text: text_col.value(row).to_string(),
                    index: index_col.map_or(0, |c| c.value(row) as usize),
                    start: start_col.map_or(0, |c| c.value(row) as usize),
                },
                score: (1.0_f32 - distance).max(0.0),
            });
        }
    }

    results
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a StringArray> {
    batch.column_by_name(name)?.as_any().downcast_ref::<StringArray>()
}

fn u32_column<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a UInt32Array> {
    batch.column_by_name(name)?.as_any().downcast_ref::<UInt32Array>()
}

fn f32_column<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a Float32Array> {
    batch.column_by_name(name)?.as_any().downcast_ref::<Float32Array>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic bag-of-letters embedder; identical texts get identical vectors.
    struct LetterEmbedder {
        document_calls: AtomicUsize,
    }

    impl LetterEmbedder {
        fn new() -> Self {
            Self {
                document_calls: AtomicUsize::new(0),
            }
        }

        fn vector(text: &str) -> Vec<f32> {
            let mut v = vec![0.0_f32; 8];
            for c in text.chars().filter(|c| c.is_ascii_lowercase()) {
                v[(c as usize - 'a' as usize) % 8] += 1.0;
            }
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1.0);
            v.iter().map(|x| x / norm).collect()
        }
    }

    impl Embed for LetterEmbedder {
        async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
            self.document_calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| Self::vector(t)).collect())
        }

        async fn embed_query(&self, query: &str) -> Result<Vec<f32>, CommonError> {
            Ok(Self::vector(query))
        }

        fn dimensions(&self) -> usize {
            8
        }
    }

    fn chunk(source: SourceTag, index: usize, text: &str) -> Chunk {
        Chunk {
            source,
            text: text.to_string(),
            index,
            start: index * 10,
        }
    }

    fn sample_chunks() -> Vec<Chunk> {
        vec![
            chunk(SourceTag::Syllabus, 0, "aaaa aaaa"),
            chunk(SourceTag::Syllabus, 1, "bbbb cccc"),
            chunk(SourceTag::Notes("forces.mmd".to_string()), 0, "dddd eeee ffff"),
        ]
    }

    #[test]
    fn test_digest_depends_on_content_and_order() {
        let chunks = sample_chunks();
        let same = Manifest::for_chunks(&chunks, 8);
        assert_eq!(same, Manifest::for_chunks(&sample_chunks(), 8));
        assert_eq!(same.digest.len(), 64);

        let mut reordered = sample_chunks();
        reordered.swap(0, 1);
        assert_ne!(same.digest, Manifest::for_chunks(&reordered, 8).digest);
    }

    #[test]
    fn test_staging_dir_is_sibling() {
        assert_eq!(
            staging_dir(Path::new("/idx/psle/Science")),
            PathBuf::from("/idx/psle/Science.building")
        );
    }

    #[test]
    fn test_extract_scored_chunks_from_batch() {
        let chunks = sample_chunks();
        let embeddings: Vec<Vec<f32>> = chunks.iter().map(|c| LetterEmbedder::vector(&c.text)).collect();
        let batch = build_record_batch(&chunks, &embeddings, 8).unwrap();
        assert_eq!(batch.num_rows(), 3);

        let mut columns: Vec<ArrayRef> = batch.columns().to_vec();
        columns.push(Arc::new(Float32Array::from(vec![0.0, 0.25, 3.0])));
        let mut fields: Vec<Field> = batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect();
        fields.push(Field::new("_distance", DataType::Float32, true));
        let with_distance = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).unwrap();

        let scored = extract_scored_chunks(&[with_distance]);
        assert_eq!(scored.len(), 3);
        assert_eq!(scored[0].chunk, chunks[0]);
        assert_eq!(scored[0].score, 1.0);
        assert_eq!(scored[1].score, 0.75);
        assert_eq!(scored[2].score, 0.0);
        assert_eq!(scored[2].chunk.source, SourceTag::Notes("forces.mmd".to_string()));
    }

    #[test]
    fn test_record_batch_rejects_wrong_dimension() {
        let chunks = sample_chunks();
        let embeddings = vec![vec![0.0_f32; 3]; chunks.len()];
        assert!(build_record_batch(&chunks, &embeddings, 8).is_err());
    }

    #[tokio::test]
    async fn test_build_persists_atomically_and_retrieves() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("psle").join("Science");
        let embedder = Arc::new(LetterEmbedder::new());
        let store = LanceIndexStore::new(Arc::clone(&embedder));

        assert!(!store.exists(&dir));
        let index = store.build(&sample_chunks(), &dir).await.unwrap();
        assert!(store.exists(&dir));
        assert!(dir.join(MANIFEST_FILE).is_file());
        assert!(!staging_dir(&dir).exists());

        let results = index.retrieve_top_k("dddd eeee ffff", 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.text, "dddd eeee ffff");
        assert!(results[0].score >= results[1].score);

        // Building again over the same location loads what is there.
        store.build(&sample_chunks(), &dir).await.unwrap();
        assert_eq!(embedder.document_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_load_rejects_dimension_mismatch() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("index");
        std::fs::create_dir_all(&dir).unwrap();
        let manifest = Manifest {
            chunk_count: 1,
            dimensions: 384,
            digest: "00".to_string(),
        };
        std::fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec(&manifest).unwrap()).unwrap();

        let store = LanceIndexStore::new(Arc::new(LetterEmbedder::new()));
        let err = store.load(&dir).await.err().unwrap();
        assert!(matches!(err, AppError::Common(CommonError::VectorDb(_))));
    }

    #[tokio::test]
    async fn test_build_with_no_chunks_fails_without_writing() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("index");
        let store = LanceIndexStore::new(Arc::new(LetterEmbedder::new()));
        let err = store.build(&[], &dir).await.err().unwrap();
        assert!(matches!(err, AppError::EmptySources(_)));
        assert!(!dir.exists());
    }
}
