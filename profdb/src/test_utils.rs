use std::collections::BTreeMap;
use std::path::Path as StdPath;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::backend::{BlockReader, CompactionBackend};
use crate::block::{
    meta_path, BlockCompaction, BlockMeta, BlockStats, Downsample, META_FILENAME,
    TOMBSTONES_FILENAME,
};
use crate::error::Error;

/// Installs the tracing subscriber once, so running tests with `RUST_LOG`
/// set shows the compactor's log output.
pub(crate) fn init_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

pub(crate) struct MetaBuilder {
    meta: BlockMeta,
}

/// Builder for block metas with sensible test defaults: fresh ULID, level 1,
/// one sample, time window [0, 1000).
pub(crate) fn meta_builder() -> MetaBuilder {
    MetaBuilder {
        meta: BlockMeta {
            version: 1,
            ulid: Ulid::new(),
            min_time: 0,
            max_time: 1000,
            labels: BTreeMap::new(),
            downsample: Downsample::default(),
            compaction: BlockCompaction::default(),
            stats: BlockStats { num_samples: 1 },
        },
    }
}

impl MetaBuilder {
    pub(crate) fn min_time(mut self, min_time: i64) -> Self {
        self.meta.min_time = min_time;
        self
    }

    pub(crate) fn max_time(mut self, max_time: i64) -> Self {
        self.meta.max_time = max_time;
        self
    }

    pub(crate) fn labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.meta.labels = labels;
        self
    }

    pub(crate) fn resolution(mut self, resolution: i64) -> Self {
        self.meta.downsample.resolution = resolution;
        self
    }

    pub(crate) fn level(mut self, level: u32) -> Self {
        self.meta.compaction.level = level;
        self
    }

    pub(crate) fn sources(mut self, sources: Vec<Ulid>) -> Self {
        self.meta.compaction.sources = sources;
        self
    }

    pub(crate) fn num_samples(mut self, num_samples: u64) -> Self {
        self.meta.stats.num_samples = num_samples;
        self
    }

    pub(crate) fn build(self) -> BlockMeta {
        self.meta
    }
}

/// Writes a complete block (meta + payload) into a bucket.
pub(crate) async fn put_block(store: &dyn ObjectStore, meta: &BlockMeta) {
    store
        .put(
            &Path::from(format!("{}/profiles.bin", meta.ulid)),
            PutPayload::from_static(b"samples"),
        )
        .await
        .unwrap();
    store
        .put(
            &meta_path(meta.ulid),
            PutPayload::from(serde_json::to_vec(meta).unwrap()),
        )
        .await
        .unwrap();
}

pub(crate) struct TestBlockReader {
    meta: BlockMeta,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl BlockReader for TestBlockReader {
    fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// An in-memory compaction backend that merges block metas: union time
/// range, summed samples, max source level + 1, accumulated sources. With
/// more than one shard the samples are split into two non-empty outputs
/// covering [min, mid] and [mid, max] (each labeled with its shard id, like
/// the real splitting compactor); remaining shard positions yield the nil
/// ULID. Failure modes can be injected for the error-path scenarios.
#[derive(Default)]
pub(crate) struct TestCompactionBackend {
    /// Produce an output whose min time undercuts the sources by one.
    pub(crate) force_min_time_violation: AtomicBool,
    /// Produce outputs strictly inside the source range, so neither the
    /// source min nor max time is covered.
    pub(crate) shrink_output_range: AtomicBool,
    /// Panic inside the compaction call, to exercise job containment.
    pub(crate) panic_on_compact: AtomicBool,
    reader_close_flags: Mutex<Vec<Arc<AtomicBool>>>,
}

impl TestCompactionBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// True when every reader handed out so far has been closed.
    pub(crate) fn all_readers_closed(&self) -> bool {
        self.reader_close_flags
            .lock()
            .iter()
            .all(|closed| closed.load(Ordering::SeqCst))
    }

    async fn write_output(&self, dest_dir: &StdPath, meta: &BlockMeta) -> Result<(), Error> {
        let dir = dest_dir.join(meta.ulid.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(META_FILENAME), serde_json::to_vec(meta)?).await?;
        tokio::fs::write(dir.join("profiles.bin"), b"compacted samples").await?;
        tokio::fs::write(dir.join(TOMBSTONES_FILENAME), b"").await?;
        Ok(())
    }
}

fn nil_output() -> BlockMeta {
    BlockMeta {
        version: 1,
        ulid: Ulid::nil(),
        min_time: 0,
        max_time: 0,
        labels: BTreeMap::new(),
        downsample: Downsample::default(),
        compaction: BlockCompaction::default(),
        stats: BlockStats::default(),
    }
}

#[async_trait]
impl CompactionBackend for TestCompactionBackend {
    async fn open_block(
        &self,
        _ct: &CancellationToken,
        local: Arc<dyn ObjectStore>,
        meta: Arc<BlockMeta>,
    ) -> Result<Box<dyn BlockReader>, Error> {
        // Read the meta back through the job-local store to prove the block
        // was actually downloaded into the workspace.
        let bytes = local.get(&meta_path(meta.ulid)).await?.bytes().await?;
        let read_back: BlockMeta = serde_json::from_slice(&bytes)?;
        let closed = Arc::new(AtomicBool::new(false));
        self.reader_close_flags.lock().push(closed.clone());
        Ok(Box::new(TestBlockReader {
            meta: read_back,
            closed,
        }))
    }

    async fn compact_with_splitting(
        &self,
        _ct: &CancellationToken,
        readers: &[Box<dyn BlockReader>],
        shards: u64,
        dest_dir: &StdPath,
    ) -> Result<Vec<BlockMeta>, Error> {
        if self.panic_on_compact.load(Ordering::SeqCst) {
            panic!("compaction backend exploded");
        }

        let metas: Vec<&BlockMeta> = readers.iter().map(|r| r.meta()).collect();
        let total_samples: u64 = metas.iter().map(|m| m.stats.num_samples).sum();
        let shards = shards.max(1) as usize;
        if total_samples == 0 {
            return Ok(vec![nil_output(); shards]);
        }

        let min_time = metas.iter().map(|m| m.min_time).min().unwrap_or(0);
        let max_time = metas.iter().map(|m| m.max_time).max().unwrap_or(0);
        let level = metas.iter().map(|m| m.compaction.level).max().unwrap_or(0) + 1;
        let mut sources: Vec<Ulid> = metas
            .iter()
            .flat_map(|m| m.sources_or_self())
            .collect();
        sources.sort();
        sources.dedup();
        let labels = metas
            .first()
            .map(|m| m.labels.clone())
            .unwrap_or_default();
        let resolution = metas.first().map(|m| m.downsample.resolution).unwrap_or(0);

        let min_violation = self.force_min_time_violation.load(Ordering::SeqCst);
        let output = |min: i64, max: i64, samples: u64| BlockMeta {
            version: 1,
            ulid: Ulid::new(),
            min_time: min,
            max_time: max,
            labels: labels.clone(),
            downsample: Downsample { resolution },
            compaction: BlockCompaction {
                level,
                sources: sources.clone(),
            },
            stats: BlockStats {
                num_samples: samples,
            },
        };

        let shrink = self.shrink_output_range.load(Ordering::SeqCst);
        let (out_min, out_max) = if shrink {
            (min_time + 1, max_time - 1)
        } else {
            (min_time, max_time)
        };
        let out_min = if min_violation { min_time - 1 } else { out_min };

        let mut outputs = Vec::with_capacity(shards);
        if shards == 1 || total_samples < 2 {
            outputs.push(output(out_min, out_max, total_samples));
        } else {
            let mid = out_min + (out_max - out_min) / 2;
            outputs.push(output(out_min, mid, total_samples / 2));
            outputs.push(output(mid, out_max, total_samples - total_samples / 2));
        }
        while outputs.len() < shards {
            outputs.push(nil_output());
        }
        if shards > 1 {
            // Split outputs carry a shard id label, so each shard lands in
            // its own compaction group on the next pass.
            for (index, meta) in outputs.iter_mut().enumerate() {
                if !meta.ulid.is_nil() {
                    meta.labels.insert(
                        "__compactor_shard_id__".to_string(),
                        format!("{}_of_{}", index + 1, shards),
                    );
                }
            }
        }

        for meta in &outputs {
            if !meta.ulid.is_nil() {
                self.write_output(dest_dir, meta).await?;
            }
        }
        Ok(outputs)
    }

    async fn validate_local_block(
        &self,
        _ct: &CancellationToken,
        dir: &StdPath,
    ) -> Result<(), Error> {
        crate::blockstore::read_meta_from_dir(dir).await?;
        if !dir.join("profiles.bin").exists() {
            return Err(Error::IoError(Arc::new(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("missing data file in {}", dir.display()),
            ))));
        }
        Ok(())
    }
}
