use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ulid::Ulid;

use crate::block::BlockMeta;
use crate::error::Error;
use crate::job::Job;

/// Partitions all known blocks into compaction jobs that are safe to compact
/// concurrently. Called fresh every pass; creates all jobs from scratch.
pub trait Grouper: Send + Sync {
    fn groups(&self, blocks: &HashMap<Ulid, Arc<BlockMeta>>) -> Result<Vec<Job>, Error>;
}

/// Deterministic, process-independent hash of a label set. Labels are stored
/// in a `BTreeMap`, so iteration order is canonical regardless of how the
/// map was built.
pub fn stable_hash(labels: &BTreeMap<String, String>) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    for (name, value) in labels {
        hasher.update(name.as_bytes());
        hasher.update(&[0xff]);
        hasher.update(value.as_bytes());
        hasher.update(&[0xff]);
    }
    hasher.finalize() as u64
}

/// Group key for a block: blocks sharing a key are safe to compact together.
pub fn group_key(resolution: i64, labels: &BTreeMap<String, String>) -> String {
    format!("{}@{}", resolution, stable_hash(labels))
}

/// Groups blocks by downsampling resolution and stable label hash.
pub struct DefaultGrouper {
    /// Number of output shards for split compaction; zero disables splitting.
    splitting_shards: u64,
}

impl DefaultGrouper {
    pub fn new(splitting_shards: u64) -> Self {
        Self { splitting_shards }
    }
}

impl Grouper for DefaultGrouper {
    fn groups(&self, blocks: &HashMap<Ulid, Arc<BlockMeta>>) -> Result<Vec<Job>, Error> {
        let mut by_key: HashMap<String, Vec<Arc<BlockMeta>>> = HashMap::new();
        for meta in blocks.values() {
            let key = group_key(meta.downsample.resolution, &meta.labels);
            by_key.entry(key).or_default().push(meta.clone());
        }

        let mut jobs: Vec<Job> = by_key
            .into_iter()
            .map(|(key, mut metas)| {
                metas.sort_by_key(|m| (m.min_time, m.ulid));
                Job::new(
                    key,
                    metas,
                    self.splitting_shards > 0,
                    self.splitting_shards,
                )
            })
            .collect();
        jobs.sort_by(|a, b| a.key().cmp(b.key()));
        Ok(jobs)
    }
}
