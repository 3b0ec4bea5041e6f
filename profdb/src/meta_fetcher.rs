use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::block::{is_deletion_mark_filename, is_no_compact_mark_filename, BlockMeta};
use crate::blockstore::BlockStore;
use crate::error::Error;
use crate::utils::build_concurrent;

/// How many `meta.json` objects are fetched concurrently during one listing.
const META_FETCH_CONCURRENCY: usize = 32;

/// A filter applied to the fetched metadata map. Filters run in registration
/// order; each may delete entries and record side state for downstream
/// consumers.
#[async_trait]
pub trait MetadataFilter: Send + Sync {
    async fn filter(
        &self,
        ct: &CancellationToken,
        metas: &mut HashMap<Ulid, Arc<BlockMeta>>,
    ) -> Result<(), Error>;
}

/// A metadata filter that removes blocks whose data is fully contained in a
/// block with a higher compaction level, and reports the removed ids so
/// garbage collection can mark them for deletion.
pub trait DeduplicateFilter: MetadataFilter {
    /// Ids of the duplicate blocks removed by the last call to `filter`.
    fn duplicate_ids(&self) -> Vec<Ulid>;
}

/// Lists block metadata in the bucket and applies the configured filter
/// chain. Pure read path: one corrupt block cannot halt compaction of the
/// whole tenant.
pub struct MetaFetcher {
    store: Arc<BlockStore>,
    filters: Vec<Arc<dyn MetadataFilter>>,
}

impl MetaFetcher {
    pub fn new(store: Arc<BlockStore>, filters: Vec<Arc<dyn MetadataFilter>>) -> Self {
        Self { store, filters }
    }

    /// Fetches all readable block metas and runs the filter chain. Blocks
    /// whose meta could not be loaded are returned in the partial map rather
    /// than failing the call; enumeration failures are fatal.
    pub async fn fetch_without_marked_for_deletion(
        &self,
        ct: &CancellationToken,
    ) -> Result<(HashMap<Ulid, Arc<BlockMeta>>, HashMap<Ulid, Error>), Error> {
        let ids = self.store.list_blocks(ct).await?;
        let fetched = build_concurrent(ids, META_FETCH_CONCURRENCY, |id| {
            let store = self.store.clone();
            async move { Ok((id, store.read_meta(id).await)) }
        })
        .await?;

        let mut metas = HashMap::new();
        let mut partial = HashMap::new();
        for (id, result) in fetched {
            match result {
                Ok(meta) => {
                    metas.insert(id, Arc::new(meta));
                }
                Err(e) => {
                    warn!("failed to load meta of block {}: {}", id, e);
                    partial.insert(id, e);
                }
            }
        }

        for filter in &self.filters {
            filter.filter(ct, &mut metas).await?;
        }
        Ok((metas, partial))
    }
}

/// Removes blocks that carry a deletion marker. No deletion delay is applied:
/// a marked block is never considered for compaction again.
pub struct IgnoreDeletionMarkFilter {
    store: Arc<BlockStore>,
}

impl IgnoreDeletionMarkFilter {
    pub fn new(store: Arc<BlockStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MetadataFilter for IgnoreDeletionMarkFilter {
    async fn filter(
        &self,
        ct: &CancellationToken,
        metas: &mut HashMap<Ulid, Arc<BlockMeta>>,
    ) -> Result<(), Error> {
        for name in self.store.list_markers(ct).await? {
            if let Some(id) = is_deletion_mark_filename(&name) {
                metas.remove(&id);
            }
        }
        Ok(())
    }
}

/// Finds blocks with no-compaction marker files and records them. When
/// `remove_no_compact_blocks` is set the blocks are also stripped from the
/// metadata map.
///
/// `filter` must not be called concurrently with itself; reading
/// `no_compact_marked_blocks` between calls from another actor is fine.
pub struct NoCompactionMarkFilter {
    store: Arc<BlockStore>,
    remove_no_compact_blocks: bool,
    marked: Mutex<HashSet<Ulid>>,
}

impl NoCompactionMarkFilter {
    pub fn new(store: Arc<BlockStore>, remove_no_compact_blocks: bool) -> Self {
        Self {
            store,
            remove_no_compact_blocks,
            marked: Mutex::new(HashSet::new()),
        }
    }

    /// Block ids that were marked for no compaction, as of the last `filter`
    /// call.
    pub fn no_compact_marked_blocks(&self) -> HashSet<Ulid> {
        self.marked.lock().clone()
    }
}

#[async_trait]
impl MetadataFilter for NoCompactionMarkFilter {
    async fn filter(
        &self,
        ct: &CancellationToken,
        metas: &mut HashMap<Ulid, Arc<BlockMeta>>,
    ) -> Result<(), Error> {
        let mut marked = HashSet::new();
        for name in self.store.list_markers(ct).await? {
            let Some(id) = is_no_compact_mark_filename(&name) else {
                continue;
            };
            if !metas.contains_key(&id) {
                continue;
            }
            marked.insert(id);
            if self.remove_no_compact_blocks {
                metas.remove(&id);
            }
        }
        *self.marked.lock() = marked;
        Ok(())
    }
}

/// Default cover rule: block B is a duplicate iff some other block has a
/// strictly higher compaction level and carries all of B's sources.
pub struct DefaultDeduplicateFilter {
    duplicates: Mutex<Vec<Ulid>>,
}

impl Default for DefaultDeduplicateFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultDeduplicateFilter {
    pub fn new() -> Self {
        Self {
            duplicates: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MetadataFilter for DefaultDeduplicateFilter {
    async fn filter(
        &self,
        _ct: &CancellationToken,
        metas: &mut HashMap<Ulid, Arc<BlockMeta>>,
    ) -> Result<(), Error> {
        let mut duplicates = Vec::new();
        for (id, meta) in metas.iter() {
            let sources = meta.sources_or_self();
            let covered = metas.values().any(|other| {
                other.ulid != meta.ulid
                    && other.compaction.level > meta.compaction.level
                    && sources.iter().all(|s| other.compaction.sources.contains(s))
            });
            if covered {
                duplicates.push(*id);
            }
        }
        duplicates.sort();
        for id in &duplicates {
            metas.remove(id);
        }
        *self.duplicates.lock() = duplicates;
        Ok(())
    }
}

impl DeduplicateFilter for DefaultDeduplicateFilter {
    fn duplicate_ids(&self) -> Vec<Ulid> {
        self.duplicates.lock().clone()
    }
}
