/// Process-wide cache of ready-to-query subject indices.
///
/// Each (level, subject) key gets one slot. A slot is filled at most once: the first
/// caller loads the persisted index or builds it from the subject's sources, and every
/// concurrent caller for the same key waits on that single attempt instead of starting
/// its own. A failed attempt leaves the slot empty, so a later request retries. Once
/// filled, a slot is never refreshed for the lifetime of the process.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};

use crate::chunker::Chunker;
use crate::conversation::ConversationMemory;
use crate::error::AppError;
use crate::index::IndexStore;
use crate::loader::load_documents;
use crate::taxonomy::SubjectKey;

/// Roots under which subject sources and persisted indices live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLayout {
    pub data_root: PathBuf,
    pub index_root: PathBuf,
}

/// A ready retriever plus the conversation turns recorded against it.
pub struct CacheEntry<I> {
    pub key: SubjectKey,
    pub index: I,
    pub memory: ConversationMemory,
}

type Slot<I> = Arc<OnceCell<Arc<CacheEntry<I>>>>;

pub struct RetrieverCache<S: IndexStore> {
    store: S,
    layout: SourceLayout,
    chunker: Chunker,
    memory_max_turns: usize,
    entries: RwLock<HashMap<String, Slot<S::Index>>>,
}

impl<S: IndexStore> RetrieverCache<S> {
    pub fn new(store: S, layout: SourceLayout, chunker: Chunker, memory_max_turns: usize) -> Self {
        Self {
            store,
            layout,
            chunker,
            memory_max_turns,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Return the ready entry for `level`/`subject`, loading or building it on first use.
    ///
    /// The key is validated before any filesystem access.
    pub async fn get(&self, level: &str, subject: &str) -> Result<Arc<CacheEntry<S::Index>>, AppError> {
        let key = SubjectKey::resolve(level, subject)?;
        let cache_key = key.cache_key();
        let slot = self.slot(&cache_key).await;

        let entry = slot
            .get_or_try_init(|| self.open(key))
            .await
            .inspect_err(|e| warn!(key = %cache_key, error = %e, "retriever initialization failed"))?;
        Ok(Arc::clone(entry))
    }

    /// Whether `cache_key` (`"{level}:{subject}"`) has a ready entry.
    #[cfg(test)]
    pub async fn is_ready(&self, cache_key: &str) -> bool {
        self.entries
            .read()
            .await
            .get(cache_key)
            .is_some_and(|slot| slot.initialized())
    }

    /// Number of ready entries.
    pub async fn len(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    async fn slot(&self, cache_key: &str) -> Slot<S::Index> {
        if let Some(slot) = self.entries.read().await.get(cache_key) {
            return Arc::clone(slot);
        }
        let mut entries = self.entries.write().await;
        Arc::clone(entries.entry(cache_key.to_string()).or_default())
    }

    async fn open(&self, key: SubjectKey) -> Result<Arc<CacheEntry<S::Index>>, AppError> {
        let paths = key.paths(&self.layout.data_root, &self.layout.index_root);

        let index = if self.store.exists(&paths.index_dir) {
            info!(level = key.level, subject = key.subject, dir = %paths.index_dir.display(), "loading persisted index");
            self.store.load(&paths.index_dir).await?
        } else {
            info!(level = key.level, subject = key.subject, dir = %paths.index_dir.display(), "building index");
            let documents = load_documents(&paths.syllabus, &paths.notes_dir)?;
            let chunks = self.chunker.split_documents(&documents);
            self.store.build(&chunks, &paths.index_dir).await?
        };

        info!(level = key.level, subject = key.subject, "index ready");
        Ok(Arc::new(CacheEntry {
            key,
            index,
            memory: ConversationMemory::new(self.memory_max_turns),
        }))
    }
}
