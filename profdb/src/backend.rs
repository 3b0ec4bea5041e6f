use std::path::Path as StdPath;
use std::sync::Arc;

use async_trait::async_trait;
use object_store::ObjectStore;
use tokio_util::sync::CancellationToken;

use crate::block::BlockMeta;
use crate::error::Error;

/// An opened handle on one local block, ready to be merged.
#[async_trait]
pub trait BlockReader: Send + Sync {
    fn meta(&self) -> &BlockMeta;

    /// Releases the reader's resources. Every successfully opened reader is
    /// closed by the job runner on all exit paths.
    async fn close(&self) -> Result<(), Error>;
}

/// Seam to the low-level block codec. The compactor core drives this
/// contract and never looks inside block data files.
#[async_trait]
pub trait CompactionBackend: Send + Sync {
    /// Opens a downloaded block through a filesystem-backed object store
    /// rooted at the job's working directory.
    async fn open_block(
        &self,
        ct: &CancellationToken,
        local: Arc<dyn ObjectStore>,
        meta: Arc<BlockMeta>,
    ) -> Result<Box<dyn BlockReader>, Error>;

    /// Merges the readers into up to `shards` output blocks written under
    /// `dest_dir`. Positions in the returned vector correspond to shard
    /// indices; an output meta with the nil ULID means that shard produced
    /// no samples. Each non-empty output directory contains `meta.json`,
    /// the block data files, and a `tombstones` file (which the runner
    /// deletes before upload).
    async fn compact_with_splitting(
        &self,
        ct: &CancellationToken,
        readers: &[Box<dyn BlockReader>],
        shards: u64,
        dest_dir: &StdPath,
    ) -> Result<Vec<BlockMeta>, Error>;

    /// Verifies a local block directory is structurally sound before upload.
    async fn validate_local_block(
        &self,
        ct: &CancellationToken,
        dir: &StdPath,
    ) -> Result<(), Error>;
}
