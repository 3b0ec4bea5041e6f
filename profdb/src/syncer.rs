use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use log::info;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::block::BlockMeta;
use crate::blockstore::BlockStore;
use crate::error::Error;
use crate::meta_fetcher::{DeduplicateFilter, MetaFetcher};
use crate::stats::{Counter, Histogram, StatRegistry};

pub const GARBAGE_COLLECTIONS: &str = "thanos_compact_garbage_collection_total";
pub const GARBAGE_COLLECTION_FAILURES: &str = "thanos_compact_garbage_collection_failures_total";
pub const GARBAGE_COLLECTION_DURATION: &str = "thanos_compact_garbage_collection_duration_seconds";

pub(crate) struct SyncerMetrics {
    pub(crate) garbage_collections: Arc<Counter>,
    pub(crate) garbage_collection_failures: Arc<Counter>,
    pub(crate) garbage_collection_duration: Arc<Histogram>,
    pub(crate) blocks_marked_for_deletion: Arc<Counter>,
}

impl SyncerMetrics {
    fn new(registry: &StatRegistry, blocks_marked_for_deletion: Arc<Counter>) -> Self {
        let metrics = Self {
            garbage_collections: Arc::new(Counter::default()),
            garbage_collection_failures: Arc::new(Counter::default()),
            garbage_collection_duration: Arc::new(Histogram::with_bounds(vec![
                0.01, 0.1, 0.3, 0.6, 1.0, 3.0, 6.0, 9.0, 20.0, 30.0, 60.0, 90.0, 120.0, 240.0,
                360.0, 720.0,
            ])),
            blocks_marked_for_deletion,
        };
        registry.register(GARBAGE_COLLECTIONS, metrics.garbage_collections.clone());
        registry.register(
            GARBAGE_COLLECTION_FAILURES,
            metrics.garbage_collection_failures.clone(),
        );
        registry.register(
            GARBAGE_COLLECTION_DURATION,
            metrics.garbage_collection_duration.clone(),
        );
        metrics
    }
}

/// Holds the current in-memory view of the bucket's block metadata and
/// serializes metadata sync and garbage collection under one lock.
pub struct Syncer {
    store: Arc<BlockStore>,
    fetcher: MetaFetcher,
    deduplicate_filter: Arc<dyn DeduplicateFilter>,
    // Serializes sync_metas and garbage_collect; the snapshot cell below is
    // only replaced while this lock is held.
    op_lock: tokio::sync::Mutex<()>,
    blocks: Mutex<Arc<HashMap<Ulid, Arc<BlockMeta>>>>,
    metrics: SyncerMetrics,
}

impl Syncer {
    pub fn new(
        store: Arc<BlockStore>,
        fetcher: MetaFetcher,
        deduplicate_filter: Arc<dyn DeduplicateFilter>,
        registry: &StatRegistry,
        blocks_marked_for_deletion: Arc<Counter>,
    ) -> Self {
        Self {
            store,
            fetcher,
            deduplicate_filter,
            op_lock: tokio::sync::Mutex::new(()),
            blocks: Mutex::new(Arc::new(HashMap::new())),
            metrics: SyncerMetrics::new(registry, blocks_marked_for_deletion),
        }
    }

    /// Replaces the in-memory view with a fresh fetch. Blocks marked for
    /// deletion are excluded with no delay and never considered for
    /// compaction.
    pub async fn sync_metas(&self, ct: &CancellationToken) -> Result<(), Error> {
        let _guard = self.op_lock.lock().await;
        let (metas, _partial) = self.fetcher.fetch_without_marked_for_deletion(ct).await?;
        *self.blocks.lock() = Arc::new(metas);
        Ok(())
    }

    /// The metadata snapshot from the last sync. Callers share the snapshot;
    /// it is replaced, never mutated in place.
    pub fn metas(&self) -> Arc<HashMap<Ulid, Arc<BlockMeta>>> {
        self.blocks.lock().clone()
    }

    /// Marks the duplicate blocks found by the last sync for deletion and
    /// drops them from the in-memory view. Requires a preceding
    /// [`Syncer::sync_metas`] in the same pass so the dedup filter is
    /// populated. The first marking failure aborts the collection.
    pub async fn garbage_collect(&self, ct: &CancellationToken) -> Result<(), Error> {
        let _guard = self.op_lock.lock().await;
        let begin = Instant::now();

        // Deletion-marked blocks were already excluded from the view, so
        // these duplicates have not been marked yet; marking handles the
        // remote race where they have.
        let duplicate_ids = self.deduplicate_filter.duplicate_ids();
        for id in duplicate_ids {
            if ct.is_cancelled() {
                return Err(Error::Cancelled);
            }

            info!("marking outdated block {} for deletion", id);
            // The marker write runs on its own fresh five-minute budget, so a
            // loop shutdown cannot leave the collection half applied.
            if let Err(e) = self
                .store
                .mark_for_deletion(id, "outdated block", &self.metrics.blocks_marked_for_deletion)
                .await
            {
                self.metrics.garbage_collection_failures.inc();
                return Err(e);
            }

            // Update the view immediately so no further sync is needed after
            // garbage collection.
            let mut blocks = self.blocks.lock();
            let mut next = (**blocks).clone();
            next.remove(&id);
            *blocks = Arc::new(next);
        }
        self.metrics.garbage_collections.inc();
        self.metrics
            .garbage_collection_duration
            .observe(begin.elapsed().as_secs_f64());
        Ok(())
    }
}
