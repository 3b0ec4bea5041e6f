use std::path::Path as StdPath;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use log::{debug, info};
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore, PutPayload};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;
use walkdir::WalkDir;

use crate::block::{
    block_prefix, deletion_mark_path, meta_path, no_compact_mark_path, BlockMeta, DeletionMark,
    NoCompactMark, META_FILENAME,
};
use crate::clock::SystemClock;
use crate::error::Error;
use crate::stats::Counter;

/// Every marker write runs under this budget on a fresh timer, independent of
/// the caller's cancellation token, so a shutting-down loop still persists
/// its deletion decisions in full.
const MARK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Block-granular IO against the bucket and the local scratch tree. Owns all
/// path construction so callers never assemble object paths by hand.
pub struct BlockStore {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn SystemClock>,
}

impl BlockStore {
    pub fn new(store: Arc<dyn ObjectStore>, clock: Arc<dyn SystemClock>) -> Self {
        Self { store, clock }
    }

    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    /// Enumerates the top-level block directories in the bucket. Non-ULID
    /// entries (markers, stray files) are skipped.
    pub async fn list_blocks(&self, ct: &CancellationToken) -> Result<Vec<Ulid>, Error> {
        if ct.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let listing = self.store.list_with_delimiter(None).await?;
        let mut ids = Vec::with_capacity(listing.common_prefixes.len());
        for prefix in listing.common_prefixes {
            if let Some(id) = prefix
                .filename()
                .and_then(crate::block::parse_block_dir)
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Lists the basenames of every marker object in the bucket.
    pub async fn list_markers(&self, ct: &CancellationToken) -> Result<Vec<String>, Error> {
        let prefix = crate::block::markers_prefix();
        let mut markers = self.store.list(Some(&prefix));
        let mut names = Vec::new();
        while let Some(object) = markers.try_next().await? {
            if ct.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(name) = object.location.filename() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    pub async fn read_meta(&self, id: Ulid) -> Result<BlockMeta, Error> {
        let bytes = self.store.get(&meta_path(id)).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Attributes of the block's `meta.json`; `last_modified` is the block's
    /// upload time, used for the wait-period check.
    pub async fn meta_attributes(&self, id: Ulid) -> Result<ObjectMeta, Error> {
        Ok(self.store.head(&meta_path(id)).await?)
    }

    /// Downloads every object of the block into `local_dir`, preserving the
    /// block's file layout.
    pub async fn download_block(
        &self,
        ct: &CancellationToken,
        id: Ulid,
        local_dir: &StdPath,
    ) -> Result<(), Error> {
        let prefix = block_prefix(id);
        let mut objects = self.store.list(Some(&prefix));
        while let Some(object) = objects.try_next().await? {
            if ct.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(parts) = object.location.prefix_match(&prefix) else {
                continue;
            };
            let mut target = local_dir.to_path_buf();
            for part in parts {
                target.push(part.as_ref());
            }
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let bytes = self.store.get(&object.location).await?.bytes().await?;
            tokio::fs::write(&target, bytes).await?;
        }
        Ok(())
    }

    /// Uploads a block directory into the bucket. Data files go first and
    /// `meta.json` goes last, so a crashed upload never leaves a block that
    /// looks complete to the meta fetcher.
    pub async fn upload_block(
        &self,
        ct: &CancellationToken,
        id: Ulid,
        local_dir: &StdPath,
    ) -> Result<(), Error> {
        let mut data_files = Vec::new();
        let mut meta_file = None;
        for entry in WalkDir::new(local_dir) {
            let entry = entry.map_err(|e| Error::IoError(Arc::new(e.into())))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(local_dir)
                .expect("walked entry outside its root")
                .to_path_buf();
            if rel == StdPath::new(META_FILENAME) {
                meta_file = Some(entry.into_path());
            } else {
                data_files.push((entry.into_path(), rel));
            }
        }

        for (file, rel) in data_files {
            if ct.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let key = Path::from(format!("{}/{}", id, rel.to_string_lossy()));
            let bytes = tokio::fs::read(&file).await?;
            self.store.put(&key, PutPayload::from(bytes)).await?;
        }
        if let Some(file) = meta_file {
            let bytes = tokio::fs::read(&file).await?;
            self.store.put(&meta_path(id), PutPayload::from(bytes)).await?;
        }
        Ok(())
    }

    /// Writes the deletion marker for `id`. Idempotent: an existing marker is
    /// left untouched and the counter is not incremented again.
    pub async fn mark_for_deletion(
        &self,
        id: Ulid,
        details: &str,
        blocks_marked_for_deletion: &Counter,
    ) -> Result<(), Error> {
        let path = deletion_mark_path(id);
        let mark = DeletionMark {
            id,
            deletion_time: self.clock.now().timestamp(),
            details: details.to_string(),
        };
        let payload = serde_json::to_vec(&mark)?;
        let marked = tokio::time::timeout(MARK_TIMEOUT, async {
            match self.store.head(&path).await {
                Ok(_) => {
                    debug!("block {} already marked for deletion", id);
                    return Ok(false);
                }
                Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(Error::from(e)),
            }
            self.store.put(&path, PutPayload::from(payload)).await?;
            Ok(true)
        })
        .await
        .map_err(|_| Error::Timeout {
            msg: format!("mark block {} for deletion", id),
        })??;
        if marked {
            info!("block {} marked for deletion: {}", id, details);
            blocks_marked_for_deletion.inc();
        }
        Ok(())
    }

    /// Writes the no-compaction marker for `id`. Idempotent like
    /// [`BlockStore::mark_for_deletion`].
    pub async fn mark_for_no_compact(
        &self,
        id: Ulid,
        reason: &str,
        blocks_marked_for_no_compact: &Counter,
    ) -> Result<(), Error> {
        let path = no_compact_mark_path(id);
        let mark = NoCompactMark {
            id,
            no_compact_time: self.clock.now().timestamp(),
            reason: reason.to_string(),
        };
        let payload = serde_json::to_vec(&mark)?;
        let marked = tokio::time::timeout(MARK_TIMEOUT, async {
            match self.store.head(&path).await {
                Ok(_) => {
                    debug!("block {} already marked for no compaction", id);
                    return Ok(false);
                }
                Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(Error::from(e)),
            }
            self.store.put(&path, PutPayload::from(payload)).await?;
            Ok(true)
        })
        .await
        .map_err(|_| Error::Timeout {
            msg: format!("mark block {} for no compaction", id),
        })??;
        if marked {
            info!("block {} marked for no compaction: {}", id, reason);
            blocks_marked_for_no_compact.inc();
        }
        Ok(())
    }

    /// Removes the block's local working directory and marks the block for
    /// deletion in the bucket.
    pub async fn delete_block(
        &self,
        id: Ulid,
        local_dir: &StdPath,
        details: &str,
        blocks_marked_for_deletion: &Counter,
    ) -> Result<(), Error> {
        match tokio::fs::remove_dir_all(local_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.mark_for_deletion(id, details, blocks_marked_for_deletion)
            .await
    }
}

/// Reads and parses `meta.json` from a local block directory.
pub async fn read_meta_from_dir(dir: &StdPath) -> Result<BlockMeta, Error> {
    let bytes = tokio::fs::read(dir.join(META_FILENAME)).await?;
    Ok(serde_json::from_slice(&bytes)?)
}
