use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::block::BlockMeta;
use crate::error::Error;

/// Decides which blocks of a job are merged in the current pass.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Returns the subset of `metas_by_min_time` to compact now, possibly
    /// empty ("no useful compaction now"). The input is ordered by min time;
    /// implementations may rely on that. The returned blocks may overlap in
    /// time.
    async fn plan(
        &self,
        ct: &CancellationToken,
        metas_by_min_time: &[Arc<BlockMeta>],
    ) -> Result<Vec<Arc<BlockMeta>>, Error>;
}

/// Merges the whole group whenever it holds at least two blocks. A group
/// that has already collapsed into a single block yields no further work.
pub struct DefaultPlanner;

#[async_trait]
impl Planner for DefaultPlanner {
    async fn plan(
        &self,
        ct: &CancellationToken,
        metas_by_min_time: &[Arc<BlockMeta>],
    ) -> Result<Vec<Arc<BlockMeta>>, Error> {
        if ct.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if metas_by_min_time.len() < 2 {
            return Ok(Vec::new());
        }
        Ok(metas_by_min_time.to_vec())
    }
}
