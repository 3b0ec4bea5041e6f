use std::sync::Arc;

use ulid::Ulid;

use crate::block::{max_time, min_time, BlockMeta};
use crate::error::Error;

/// A set of blocks sharing a group key, considered together in one
/// compaction attempt.
#[derive(Clone, Debug)]
pub struct Job {
    key: String,
    metas_by_min_time: Vec<Arc<BlockMeta>>,
    use_splitting: bool,
    splitting_shards: u64,
}

impl Job {
    pub(crate) fn new(
        key: String,
        metas_by_min_time: Vec<Arc<BlockMeta>>,
        use_splitting: bool,
        splitting_shards: u64,
    ) -> Self {
        debug_assert!(metas_by_min_time.windows(2).all(|w| w[0].min_time <= w[1].min_time));
        Self {
            key,
            metas_by_min_time,
            use_splitting,
            splitting_shards,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The job's blocks, ordered by min time.
    pub fn metas(&self) -> &[Arc<BlockMeta>] {
        &self.metas_by_min_time
    }

    pub fn ids(&self) -> impl Iterator<Item = Ulid> + '_ {
        self.metas_by_min_time.iter().map(|m| m.ulid)
    }

    pub fn min_time(&self) -> Option<i64> {
        min_time(&self.metas_by_min_time)
    }

    pub fn max_time(&self) -> Option<i64> {
        max_time(&self.metas_by_min_time)
    }

    pub fn use_splitting(&self) -> bool {
        self.use_splitting
    }

    pub fn splitting_shards(&self) -> u64 {
        self.splitting_shards
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} blocks)", self.key, self.metas_by_min_time.len())
    }
}

/// Predicate deciding whether this compactor instance is responsible for a
/// job. Used for horizontal sharding of compactors; may consult a hash ring.
pub type OwnCompactionJobFn = Arc<dyn Fn(&Job) -> Result<bool, Error> + Send + Sync>;

/// An ownership predicate that claims every job.
pub fn own_all_jobs() -> OwnCompactionJobFn {
    Arc::new(|_| Ok(true))
}

/// Total order over the jobs produced in one pass.
pub type JobsOrderFn = Arc<dyn Fn(Vec<Job>) -> Vec<Job> + Send + Sync>;

/// Orders jobs by the width of their overall time range, then by the oldest
/// min time, with the group key as the final tiebreak. Small, old merges go
/// first; the order is deterministic.
pub fn sort_jobs_by_smallest_range_oldest_blocks_first() -> JobsOrderFn {
    Arc::new(|mut jobs| {
        jobs.sort_by_key(|job| {
            let min = job.min_time().unwrap_or(0);
            let max = job.max_time().unwrap_or(0);
            (max - min, min, job.key().to_string())
        });
        jobs
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::meta_builder;

    fn job(key: &str, ranges: &[(i64, i64)]) -> Job {
        let mut metas: Vec<Arc<BlockMeta>> = ranges
            .iter()
            .map(|(min, max)| Arc::new(meta_builder().min_time(*min).max_time(*max).build()))
            .collect();
        metas.sort_by_key(|m| m.min_time);
        Job::new(key.to_string(), metas, false, 0)
    }

    #[test]
    fn test_job_time_range_spans_all_blocks() {
        let job = job("0@1", &[(100, 200), (50, 120), (180, 300)]);
        assert_eq!(job.min_time(), Some(50));
        assert_eq!(job.max_time(), Some(300));
        assert_eq!(job.ids().count(), 3);
    }

    #[test]
    fn test_sort_jobs_smallest_range_first() {
        let wide = job("0@wide", &[(0, 1000)]);
        let narrow = job("0@narrow", &[(500, 600)]);
        let narrow_older = job("0@older", &[(100, 200)]);

        let sorted = sort_jobs_by_smallest_range_oldest_blocks_first()(vec![
            wide.clone(),
            narrow.clone(),
            narrow_older.clone(),
        ]);

        let keys: Vec<&str> = sorted.iter().map(|j| j.key()).collect();
        assert_eq!(keys, vec!["0@older", "0@narrow", "0@wide"]);
    }

    #[test]
    fn test_sort_jobs_is_deterministic_on_ties() {
        let a = job("0@a", &[(0, 100)]);
        let b = job("0@b", &[(0, 100)]);

        let sorted1 = sort_jobs_by_smallest_range_oldest_blocks_first()(vec![a.clone(), b.clone()]);
        let sorted2 = sort_jobs_by_smallest_range_oldest_blocks_first()(vec![b, a]);

        let keys1: Vec<&str> = sorted1.iter().map(|j| j.key()).collect();
        let keys2: Vec<&str> = sorted2.iter().map(|j| j.key()).collect();
        assert_eq!(keys1, keys2);
    }

    #[test]
    fn test_own_all_jobs_claims_everything() {
        let own = own_all_jobs();
        assert!(own(&job("0@1", &[(0, 1)])).unwrap());
    }
}
