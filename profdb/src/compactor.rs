//! Bucket compactor orchestration.
//!
//! The compactor is a long-running control loop that reduces the number of
//! immutable blocks in a bucket by merging adjacent blocks into fewer,
//! larger ones, optionally splitting output by shard, and garbage-collecting
//! superseded sources. One pass works as follows:
//!
//! 1. [`Syncer::sync_metas`] refreshes the in-memory view of the bucket and
//!    [`Syncer::garbage_collect`] marks duplicate blocks for deletion.
//! 2. The [`Grouper`] partitions the view into [`Job`]s; jobs not owned by
//!    this instance and jobs with recently uploaded blocks are filtered out,
//!    and the rest are put into a deterministic order.
//! 3. Jobs are handed to a pool of worker tasks. Each worker re-checks
//!    ownership and runs the per-job pipeline: plan, download, open,
//!    compact, verify, upload, mark sources for deletion. A panicking job is
//!    converted into a job error and never tears down the loop.
//! 4. The loop repeats until a pass reports no more work or the wall-clock
//!    budget for the whole call elapses.
//!
//! Every stage can fail independently; aborted jobs leave their sources
//! either all live or all marked, and abandoned outputs become duplicates
//! that the dedup filter and garbage collection remove on a later pass.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path as StdPath, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use futures::{FutureExt, StreamExt};
use log::{error, info, warn};
use object_store::local::LocalFileSystem;
use object_store::ObjectStore;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use ulid::Ulid;

use crate::backend::{BlockReader, CompactionBackend};
use crate::block::{max_time, min_time, TOMBSTONES_FILENAME};
use crate::blockstore::{read_meta_from_dir, BlockStore};
use crate::clock::SystemClock;
use crate::compactor::stats::BucketCompactorMetrics;
use crate::config::CompactorOptions;
use crate::error::{Error, MultiError};
use crate::grouper::Grouper;
use crate::job::{Job, JobsOrderFn, OwnCompactionJobFn};
use crate::planner::Planner;
use crate::syncer::Syncer;
use crate::utils::{build_concurrent, delete_all_except, panic_to_err};

/// Compacts blocks in a bucket until there is no work left.
pub struct BucketCompactor {
    syncer: Arc<Syncer>,
    grouper: Arc<dyn Grouper>,
    planner: Arc<dyn Planner>,
    backend: Arc<dyn CompactionBackend>,
    store: Arc<BlockStore>,
    clock: Arc<dyn SystemClock>,
    options: CompactorOptions,
    own_job: OwnCompactionJobFn,
    sort_jobs: JobsOrderFn,
    metrics: Arc<BucketCompactorMetrics>,
}

impl BucketCompactor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        syncer: Arc<Syncer>,
        grouper: Arc<dyn Grouper>,
        planner: Arc<dyn Planner>,
        backend: Arc<dyn CompactionBackend>,
        store: Arc<BlockStore>,
        clock: Arc<dyn SystemClock>,
        options: CompactorOptions,
        own_job: OwnCompactionJobFn,
        sort_jobs: JobsOrderFn,
        metrics: Arc<BucketCompactorMetrics>,
    ) -> Result<Self, Error> {
        options.validate()?;
        Ok(Self {
            syncer,
            grouper,
            planner,
            backend,
            store,
            clock,
            options,
            own_job,
            sort_jobs,
            metrics,
        })
    }

    /// Runs compaction passes until a pass finishes all jobs or
    /// `max_compaction_time` elapses (zero means unlimited). After the
    /// budget expires no new jobs are started; in-flight jobs finish.
    #[instrument(level = "debug", skip_all)]
    pub async fn compact(
        self: &Arc<Self>,
        ct: CancellationToken,
        max_compaction_time: Duration,
    ) -> Result<(), Error> {
        let result = self.compact_inner(&ct, max_compaction_time).await;
        // Keep the scratch tree on error: the next run may reuse the
        // downloads instead of fetching everything again.
        if result.is_ok() {
            if let Err(e) = tokio::fs::remove_dir_all(&self.options.compact_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(
                        "failed to remove compaction work directory {}: {}",
                        self.options.compact_dir.display(),
                        e
                    );
                }
            }
        }
        result
    }

    async fn compact_inner(
        self: &Arc<Self>,
        ct: &CancellationToken,
        max_compaction_time: Duration,
    ) -> Result<(), Error> {
        let deadline = (max_compaction_time > Duration::ZERO)
            .then(|| tokio::time::Instant::now() + max_compaction_time);

        // Loop over the bucket and compact until there's no work left.
        loop {
            let work_ct = ct.child_token();
            // Capacity-one handoff: at most one dispatched job waits for a
            // worker, so the select below races job sends against worker
            // errors and the time budget instead of queueing the whole pass.
            let (job_tx, job_rx) = mpsc::channel::<Job>(1);
            let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
            let (err_tx, mut err_rx) = mpsc::channel::<Error>(self.options.concurrency);
            let finished_all_jobs = Arc::new(Mutex::new(true));

            let mut workers = Vec::with_capacity(self.options.concurrency);
            for _ in 0..self.options.concurrency {
                let this = self.clone();
                let work_ct = work_ct.clone();
                let job_rx = job_rx.clone();
                let err_tx = err_tx.clone();
                let finished_all_jobs = finished_all_jobs.clone();
                workers.push(tokio::spawn(async move {
                    this.job_worker(work_ct, job_rx, err_tx, finished_all_jobs)
                        .await;
                }));
            }

            info!("start sync of metas");
            self.syncer.sync_metas(ct).await?;

            info!("start of GC");
            // Compacted blocks are garbage collected after each pass, but a
            // crashed compactor leaves duplicates to resolve on startup.
            self.syncer.garbage_collect(ct).await?;

            let jobs = self.grouper.groups(self.syncer.metas().as_ref())?;

            // Workers re-check ownership right before running a job, but
            // dropping unowned jobs here avoids dispatching them at all.
            let jobs = self.filter_own_jobs(jobs)?;

            // The age of the blocks about to be compacted shows whether this
            // compactor keeps up with the rate of block creation.
            let now = self.clock.now();
            for delta in self.block_max_time_deltas(now, &jobs) {
                self.metrics.blocks_max_time_delta.observe(delta);
            }

            let jobs = self.filter_jobs_by_wait_period(ct, jobs).await;
            let jobs = (self.sort_jobs)(jobs);

            // Bound scratch disk usage by the work still in flight.
            let keep: HashSet<PathBuf> = jobs
                .iter()
                .flat_map(|job| {
                    job.ids()
                        .map(|id| PathBuf::from(job.key()).join(id.to_string()))
                })
                .collect();
            delete_all_except(&self.options.compact_dir, &keep);

            info!("start of compactions");

            let mut max_compaction_time_reached = false;
            let mut job_errs: Vec<Error> = Vec::new();
            'job_loop: for job in jobs {
                let deadline_reached = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    biased;
                    Some(job_err) = err_rx.recv() => {
                        job_errs.push(job_err);
                        break 'job_loop;
                    }
                    _ = deadline_reached => {
                        max_compaction_time_reached = true;
                        info!("max compaction time reached, no more compactions will be started");
                        break 'job_loop;
                    }
                    permit = job_tx.reserve() => {
                        match permit {
                            Ok(permit) => permit.send(job),
                            Err(_) => break 'job_loop,
                        }
                    }
                }
            }
            drop(job_tx);
            for worker in workers {
                if let Err(e) = worker.await {
                    job_errs.push(Error::CompactionJobPanic { msg: e.to_string() });
                }
            }

            // Collect any error reported while the last batch of jobs ran.
            drop(err_tx);
            while let Some(job_err) = err_rx.recv().await {
                job_errs.push(job_err);
            }
            work_ct.cancel();

            if !job_errs.is_empty() {
                return Err(Error::CompactionFailed(MultiError::new(job_errs)));
            }
            if max_compaction_time_reached || *finished_all_jobs.lock() {
                break;
            }
        }
        info!("compaction iterations done");
        Ok(())
    }

    /// One worker of the per-pass pool: pulls jobs until the channel closes
    /// or a job fails. Panics inside a job are converted to job errors so
    /// they cannot tear down the supervisor.
    async fn job_worker(
        self: Arc<Self>,
        work_ct: CancellationToken,
        job_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
        err_tx: mpsc::Sender<Error>,
        finished_all_jobs: Arc<Mutex<bool>>,
    ) {
        loop {
            let job = { job_rx.lock().await.recv().await };
            let Some(job) = job else { break };

            // Another compactor instance may have taken over the job since
            // it was dispatched; if so it must not run here too.
            match (self.own_job)(&job) {
                Ok(true) => {}
                Ok(false) => {
                    info!(
                        "skipped compaction because job {} is not owned by this instance anymore",
                        job.key()
                    );
                    continue;
                }
                Err(e) => {
                    info!(
                        "skipped compaction because the ownership check failed for job {}: {}",
                        job.key(),
                        e
                    );
                    continue;
                }
            }

            self.metrics.group_compaction_runs_started.inc();

            let outcome = AssertUnwindSafe(self.run_compaction_job(&work_ct, &job))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(panic_to_err(panic)));

            match outcome {
                Ok((should_rerun, compacted_ids)) => {
                    self.metrics.group_compaction_runs_completed.inc();
                    if has_non_nil_ulids(&compacted_ids) {
                        self.metrics.group_compactions.inc();
                    }
                    if should_rerun {
                        *finished_all_jobs.lock() = false;
                    }
                }
                Err(e) => {
                    self.metrics.group_compaction_runs_failed.inc();
                    let _ = err_tx.send(Error::for_job(job.key(), e)).await;
                    return;
                }
            }
        }
    }

    /// Plans and runs a single compaction for the job. The result is
    /// uploaded into the bucket the sources came from. Returns whether
    /// another pass may find more work, plus the output block ids (shard
    /// positions, nil for empty shards).
    #[instrument(level = "debug", skip_all, fields(group_key = %job.key()))]
    async fn run_compaction_job(
        &self,
        ct: &CancellationToken,
        job: &Job,
    ) -> Result<(bool, Vec<Ulid>), Error> {
        let begin = Instant::now();
        let sub_dir = self.options.compact_dir.join(job.key());

        let result = self.run_compaction_job_in_dir(ct, job, &sub_dir).await;

        match &result {
            Ok(_) => info!(
                "compaction job {} succeeded after {:?}",
                job.key(),
                begin.elapsed()
            ),
            Err(e) => error!(
                "compaction job {} failed after {:?}: {}",
                job.key(),
                begin.elapsed(),
                e
            ),
        }
        if let Err(e) = tokio::fs::remove_dir_all(&sub_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(
                    "failed to remove compaction job work directory {}: {}",
                    sub_dir.display(),
                    e
                );
            }
        }
        result
    }

    async fn run_compaction_job_in_dir(
        &self,
        ct: &CancellationToken,
        job: &Job,
        sub_dir: &StdPath,
    ) -> Result<(bool, Vec<Ulid>), Error> {
        tokio::fs::create_dir_all(sub_dir).await?;

        let to_compact = self.planner.plan(ct, job.metas()).await?;
        let (Some(src_min_time), Some(src_max_time)) =
            (min_time(&to_compact), max_time(&to_compact))
        else {
            // Nothing to do.
            return Ok((false, Vec::new()));
        };

        info!(
            "compaction planned for job {} (minTime {}, maxTime {}); downloading {} blocks",
            job.key(),
            src_min_time,
            src_max_time,
            to_compact.len()
        );
        let download_begin = Instant::now();

        build_concurrent(
            to_compact.iter().cloned(),
            self.options.block_sync_concurrency,
            |meta| {
                let store = self.store.clone();
                let ct = ct.clone();
                let bdir = sub_dir.join(meta.ulid.to_string());
                async move { store.download_block(&ct, meta.ulid, &bdir).await }
            },
        )
        .await?;

        // The downloaded blocks are opened through a bucket rooted at the
        // job's working directory.
        let local_store: Arc<dyn ObjectStore> =
            Arc::new(LocalFileSystem::new_with_prefix(sub_dir)?);

        let open_results: Vec<Result<Box<dyn BlockReader>, Error>> =
            futures::stream::iter(to_compact.iter().cloned())
                .map(|meta| {
                    let backend = self.backend.clone();
                    let local_store = local_store.clone();
                    let ct = ct.clone();
                    async move { backend.open_block(&ct, local_store, meta).await }
                })
                .buffered(self.options.block_open_concurrency.max(1))
                .collect()
                .await;

        let mut readers = Vec::with_capacity(open_results.len());
        let mut open_err = None;
        for result in open_results {
            match result {
                Ok(reader) => readers.push(reader),
                Err(e) => open_err = Some(e),
            }
        }
        if let Some(e) = open_err {
            close_readers(&readers).await;
            return Err(e);
        }
        info!(
            "downloaded and opened {} blocks for job {} in {:?}; compacting",
            readers.len(),
            job.key(),
            download_begin.elapsed()
        );

        let compaction_begin = Instant::now();
        let shards = if job.use_splitting() {
            job.splitting_shards()
        } else {
            1
        };
        let compact_result = self
            .backend
            .compact_with_splitting(ct, &readers, shards, sub_dir)
            .await;
        close_readers(&readers).await;
        let out = compact_result?;
        let comp_ids: Vec<Ulid> = out.iter().map(|m| m.ulid).collect();

        if !has_non_nil_ulids(&comp_ids) {
            // The compacted block would have no samples. Drop the sources
            // that are themselves empty; best effort, the next pass retries.
            info!(
                "compacted block for job {} would have no samples, deleting empty source blocks",
                job.key()
            );
            for meta in to_compact.iter().filter(|m| m.stats.num_samples == 0) {
                if let Err(e) = self
                    .store
                    .delete_block(
                        meta.ulid,
                        &sub_dir.join(meta.ulid.to_string()),
                        "source of compacted block",
                        &self.metrics.blocks_marked_for_deletion,
                    )
                    .await
                {
                    warn!(
                        "failed to mark empty block {} found during compaction for deletion: {}",
                        meta.ulid, e
                    );
                }
            }
            // Even though this block was empty, there may be more work to do.
            return Ok((true, Vec::new()));
        }

        info!(
            "compacted {} blocks for job {} in {:?}",
            to_compact.len(),
            job.key(),
            compaction_begin.elapsed()
        );

        if let Err(err) =
            verify_compacted_blocks_time_ranges(&comp_ids, src_min_time, src_max_time, sub_dir)
                .await
        {
            self.metrics.compaction_blocks_verification_failed.inc();
            match err {
                // Missing coverage of the exact source bounds is an
                // observability signal only; the job proceeds.
                Error::TimeRangeNotCovered { .. } => {
                    warn!(
                        "compacted blocks verification failed for job {}: {}",
                        job.key(),
                        err
                    );
                }
                err => return Err(err),
            }
        }

        let upload_begin = Instant::now();
        let blocks_to_upload = non_empty_outputs(&comp_ids, job.use_splitting());
        let uploaded = blocks_to_upload.len();
        build_concurrent(
            blocks_to_upload,
            self.options.block_sync_concurrency,
            |(shard_index, id)| {
                let store = self.store.clone();
                let backend = self.backend.clone();
                let ct = ct.clone();
                let bdir = sub_dir.join(id.to_string());
                async move {
                    let new_meta = read_meta_from_dir(&bdir).await?;

                    // Tombstones are irrelevant in this storage model.
                    tokio::fs::remove_file(bdir.join(TOMBSTONES_FILENAME)).await?;

                    // Ensure the compacted block is valid before it becomes
                    // visible in the bucket.
                    backend.validate_local_block(&ct, &bdir).await?;

                    let begin = Instant::now();
                    store.upload_block(&ct, id, &bdir).await?;
                    info!(
                        "uploaded block {} (shard {}, minTime {}, maxTime {}) in {:?}",
                        id,
                        shard_index,
                        new_meta.min_time,
                        new_meta.max_time,
                        begin.elapsed()
                    );
                    Ok(())
                }
            },
        )
        .await?;
        info!(
            "uploaded {} blocks for job {} in {:?}",
            uploaded,
            job.key(),
            upload_begin.elapsed()
        );

        // Mark the compacted source blocks for deletion so they do not get
        // included in the next planning cycle. This is the final step: a
        // failed job leaves the sources either all live or all marked. The
        // uploaded outputs enter the view on the next sync.
        for meta in to_compact.iter() {
            self.store
                .delete_block(
                    meta.ulid,
                    &sub_dir.join(meta.ulid.to_string()),
                    "source of compacted block",
                    &self.metrics.blocks_marked_for_deletion,
                )
                .await?;
        }

        Ok((true, comp_ids))
    }

    fn filter_own_jobs(&self, jobs: Vec<Job>) -> Result<Vec<Job>, Error> {
        let mut owned = Vec::with_capacity(jobs.len());
        for job in jobs {
            if (self.own_job)(&job)? {
                owned.push(job);
            }
        }
        Ok(owned)
    }

    /// Removes jobs containing a block uploaded within the wait period. A
    /// failing check keeps the job rather than stalling it forever.
    async fn filter_jobs_by_wait_period(
        &self,
        ct: &CancellationToken,
        jobs: Vec<Job>,
    ) -> Vec<Job> {
        if self.options.wait_period.is_zero() {
            return jobs;
        }
        let mut admitted = Vec::with_capacity(jobs.len());
        for job in jobs {
            match self.job_wait_period_elapsed(ct, &job).await {
                Ok(None) => admitted.push(job),
                Ok(Some(not_elapsed_block)) => {
                    info!(
                        "skipping compaction job {} because block {} was uploaded too recently \
                         (within wait period)",
                        job.key(),
                        not_elapsed_block
                    );
                }
                Err(e) => {
                    warn!(
                        "not enforcing compaction wait period because the recently-uploaded \
                         check failed for job {}: {}",
                        job.key(),
                        e
                    );
                    admitted.push(job);
                }
            }
        }
        admitted
    }

    /// Returns the first block of the job still inside the wait period, or
    /// `None` when the whole job is old enough.
    async fn job_wait_period_elapsed(
        &self,
        ct: &CancellationToken,
        job: &Job,
    ) -> Result<Option<Ulid>, Error> {
        let threshold = TimeDelta::from_std(self.options.wait_period).unwrap_or(TimeDelta::MAX);
        for meta in job.metas() {
            if ct.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let attributes = self.store.meta_attributes(meta.ulid).await?;
            if self
                .clock
                .now()
                .signed_duration_since(attributes.last_modified)
                < threshold
            {
                return Ok(Some(meta.ulid));
            }
        }
        Ok(None)
    }

    /// Seconds between now and the max time of each block about to be
    /// compacted, one observation per block per job.
    fn block_max_time_deltas(&self, now: DateTime<Utc>, jobs: &[Job]) -> Vec<f64> {
        let now_ms = now.timestamp_millis();
        jobs.iter()
            .flat_map(|job| {
                job.metas()
                    .iter()
                    .map(move |meta| (now_ms - meta.max_time) as f64 / 1000.0)
            })
            .collect()
    }
}

async fn close_readers(readers: &[Box<dyn BlockReader>]) {
    for reader in readers {
        if let Err(e) = reader.close().await {
            warn!("failed to close block {}: {}", reader.meta().ulid, e);
        }
    }
}

fn has_non_nil_ulids(ids: &[Ulid]) -> bool {
    ids.iter().any(|id| !id.is_nil())
}

/// Filters out empty shards, keeping each output's shard index for logging.
fn non_empty_outputs(comp_ids: &[Ulid], split_job: bool) -> Vec<(usize, Ulid)> {
    let mut outputs = Vec::with_capacity(comp_ids.len());
    for (shard_index, id) in comp_ids.iter().enumerate() {
        if id.is_nil() {
            if split_job {
                info!(
                    "compaction produced an empty block for shard {} of {}",
                    shard_index,
                    comp_ids.len()
                );
            } else {
                info!("compaction produced an empty block");
            }
            continue;
        }
        outputs.push((shard_index, *id));
    }
    outputs
}

/// Verifies the compacted blocks against the source time range: every output
/// must fit within `[source_min_time, source_max_time]`, and both bounds
/// must be hit by at least one output.
async fn verify_compacted_blocks_time_ranges(
    comp_ids: &[Ulid],
    source_min_time: i64,
    source_max_time: i64,
    sub_dir: &StdPath,
) -> Result<(), Error> {
    let mut source_min_time_found = false;
    let mut source_max_time_found = false;

    for id in comp_ids {
        // Skip empty blocks.
        if id.is_nil() {
            continue;
        }

        let meta = read_meta_from_dir(&sub_dir.join(id.to_string())).await?;
        if meta.min_time < source_min_time {
            return Err(Error::InvalidBlockMinTime {
                id: *id,
                min_time: meta.min_time,
                source_min_time,
            });
        }
        if meta.max_time > source_max_time {
            return Err(Error::InvalidBlockMaxTime {
                id: *id,
                max_time: meta.max_time,
                source_max_time,
            });
        }
        if meta.min_time == source_min_time {
            source_min_time_found = true;
        }
        if meta.max_time == source_max_time {
            source_max_time_found = true;
        }
    }

    if !source_min_time_found || !source_max_time_found {
        return Err(Error::TimeRangeNotCovered {
            min_time: source_min_time,
            max_time: source_max_time,
        });
    }
    Ok(())
}

pub mod stats {
    use std::sync::Arc;

    use crate::stats::{Counter, Histogram, StatRegistry};

    pub const GROUP_COMPACTION_RUNS_STARTED: &str =
        "pyroscope_compactor_group_compaction_runs_started_total";
    pub const GROUP_COMPACTION_RUNS_COMPLETED: &str =
        "pyroscope_compactor_group_compaction_runs_completed_total";
    pub const GROUP_COMPACTION_RUNS_FAILED: &str =
        "pyroscope_compactor_group_compactions_failures_total";
    pub const GROUP_COMPACTIONS: &str = "pyroscope_compactor_group_compactions_total";
    pub const BLOCKS_VERIFICATION_FAILURES: &str =
        "pyroscope_compactor_blocks_verification_failures_total";
    pub const BLOCKS_MARKED_FOR_DELETION: &str =
        "pyroscope_compactor_blocks_marked_for_deletion_total";
    /// Counts no-compaction marks written for blocks that failed compaction
    /// with out-of-order chunks
    /// ([`crate::block::OUT_OF_ORDER_CHUNKS_NO_COMPACT_REASON`]).
    pub const BLOCKS_MARKED_FOR_NO_COMPACTION: &str =
        "pyroscope_compactor_blocks_marked_for_no_compaction_total";
    pub const BLOCK_MAX_TIME_DELTA_SECONDS: &str =
        "pyroscope_compactor_block_max_time_delta_seconds";

    /// Metrics tracked by the bucket compactor. The name constants above are
    /// a stable contract.
    pub struct BucketCompactorMetrics {
        pub(crate) group_compaction_runs_started: Arc<Counter>,
        pub(crate) group_compaction_runs_completed: Arc<Counter>,
        pub(crate) group_compaction_runs_failed: Arc<Counter>,
        pub(crate) group_compactions: Arc<Counter>,
        pub(crate) compaction_blocks_verification_failed: Arc<Counter>,
        pub(crate) blocks_marked_for_deletion: Arc<Counter>,
        pub(crate) blocks_marked_for_no_compact: Arc<Counter>,
        pub(crate) blocks_max_time_delta: Arc<Histogram>,
    }

    impl BucketCompactorMetrics {
        pub fn new(registry: &StatRegistry) -> Self {
            let metrics = Self {
                group_compaction_runs_started: Arc::new(Counter::default()),
                group_compaction_runs_completed: Arc::new(Counter::default()),
                group_compaction_runs_failed: Arc::new(Counter::default()),
                group_compactions: Arc::new(Counter::default()),
                compaction_blocks_verification_failed: Arc::new(Counter::default()),
                blocks_marked_for_deletion: Arc::new(Counter::default()),
                blocks_marked_for_no_compact: Arc::new(Counter::default()),
                // 1 to 5 days, in 12 hour intervals.
                blocks_max_time_delta: Arc::new(Histogram::linear(86400.0, 43200.0, 8)),
            };
            registry.register(
                GROUP_COMPACTION_RUNS_STARTED,
                metrics.group_compaction_runs_started.clone(),
            );
            registry.register(
                GROUP_COMPACTION_RUNS_COMPLETED,
                metrics.group_compaction_runs_completed.clone(),
            );
            registry.register(
                GROUP_COMPACTION_RUNS_FAILED,
                metrics.group_compaction_runs_failed.clone(),
            );
            registry.register(GROUP_COMPACTIONS, metrics.group_compactions.clone());
            registry.register(
                BLOCKS_VERIFICATION_FAILURES,
                metrics.compaction_blocks_verification_failed.clone(),
            );
            registry.register(
                BLOCKS_MARKED_FOR_DELETION,
                metrics.blocks_marked_for_deletion.clone(),
            );
            registry.register(
                BLOCKS_MARKED_FOR_NO_COMPACTION,
                metrics.blocks_marked_for_no_compact.clone(),
            );
            registry.register(
                BLOCK_MAX_TIME_DELTA_SECONDS,
                metrics.blocks_max_time_delta.clone(),
            );
            metrics
        }

        /// The shared marked-for-deletion counter, wired into the
        /// [`crate::syncer::Syncer`] and the job runner alike.
        pub fn blocks_marked_for_deletion(&self) -> Arc<Counter> {
            self.blocks_marked_for_deletion.clone()
        }

        /// Counter for no-compaction marks, passed to
        /// [`crate::blockstore::BlockStore::mark_for_no_compact`].
        pub fn blocks_marked_for_no_compact(&self) -> Arc<Counter> {
            self.blocks_marked_for_no_compact.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;

    use object_store::memory::InMemory;
    use object_store::ObjectStore;
    use tempfile::TempDir;

    use super::stats::*;
    use super::*;
    use crate::block::{deletion_mark_path, BlockMeta};
    use crate::clock::DefaultSystemClock;
    use crate::grouper::DefaultGrouper;
    use crate::job::{own_all_jobs, sort_jobs_by_smallest_range_oldest_blocks_first};
    use crate::meta_fetcher::{
        DefaultDeduplicateFilter, IgnoreDeletionMarkFilter, MetaFetcher, MetadataFilter,
        NoCompactionMarkFilter,
    };
    use crate::planner::DefaultPlanner;
    use crate::stats::StatRegistry;
    use crate::test_utils::{meta_builder, put_block, TestCompactionBackend};

    struct Fixture {
        inner: Arc<InMemory>,
        registry: Arc<StatRegistry>,
        backend: Arc<TestCompactionBackend>,
        compactor: Arc<BucketCompactor>,
        // Holds the scratch dir alive for the duration of the test.
        _scratch: TempDir,
    }

    fn fixture(options: CompactorOptions, splitting_shards: u64) -> Fixture {
        fixture_full(
            options,
            splitting_shards,
            own_all_jobs(),
            Arc::new(DefaultSystemClock::new()),
        )
    }

    fn fixture_with_ownership(
        options: CompactorOptions,
        splitting_shards: u64,
        own_job: OwnCompactionJobFn,
    ) -> Fixture {
        fixture_full(
            options,
            splitting_shards,
            own_job,
            Arc::new(DefaultSystemClock::new()),
        )
    }

    fn fixture_full(
        mut options: CompactorOptions,
        splitting_shards: u64,
        own_job: OwnCompactionJobFn,
        clock: Arc<dyn SystemClock>,
    ) -> Fixture {
        crate::test_utils::init_logging();
        let scratch = tempfile::tempdir().unwrap();
        options.compact_dir = scratch.path().join("compact");

        let inner = Arc::new(InMemory::new());
        let store = Arc::new(BlockStore::new(inner.clone(), clock.clone()));

        let dedup = Arc::new(DefaultDeduplicateFilter::new());
        let filters: Vec<Arc<dyn MetadataFilter>> = vec![
            Arc::new(IgnoreDeletionMarkFilter::new(store.clone())),
            Arc::new(NoCompactionMarkFilter::new(store.clone(), true)),
            dedup.clone(),
        ];
        let fetcher = MetaFetcher::new(store.clone(), filters);

        let registry = Arc::new(StatRegistry::new());
        let metrics = Arc::new(BucketCompactorMetrics::new(&registry));
        let syncer = Arc::new(Syncer::new(
            store.clone(),
            fetcher,
            dedup,
            &registry,
            metrics.blocks_marked_for_deletion(),
        ));

        let backend = Arc::new(TestCompactionBackend::new());
        let compactor = Arc::new(
            BucketCompactor::new(
                syncer,
                Arc::new(DefaultGrouper::new(splitting_shards)),
                Arc::new(DefaultPlanner),
                backend.clone(),
                store,
                clock,
                options,
                own_job,
                sort_jobs_by_smallest_range_oldest_blocks_first(),
                metrics,
            )
            .unwrap(),
        );

        Fixture {
            inner,
            registry,
            backend,
            compactor,
            _scratch: scratch,
        }
    }

    fn stat(f: &Fixture, name: &'static str) -> i64 {
        f.registry.lookup(name).unwrap().get()
    }

    async fn is_marked_for_deletion(f: &Fixture, id: Ulid) -> bool {
        f.inner.head(&deletion_mark_path(id)).await.is_ok()
    }

    /// Blocks currently in the bucket that are not marked for deletion.
    async fn live_blocks(f: &Fixture) -> Vec<BlockMeta> {
        let store = BlockStore::new(f.inner.clone(), Arc::new(DefaultSystemClock::new()));
        let ct = CancellationToken::new();
        let mut live = Vec::new();
        for id in store.list_blocks(&ct).await.unwrap() {
            if !is_marked_for_deletion(f, id).await {
                live.push(store.read_meta(id).await.unwrap());
            }
        }
        live
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_simple_merge() {
        // given: two adjacent blocks with the same labels
        let f = fixture(CompactorOptions::default(), 0);
        let a = meta_builder().min_time(1000).max_time(2000).num_samples(5).build();
        let b = meta_builder().min_time(2000).max_time(3000).num_samples(7).build();
        put_block(f.inner.as_ref(), &a).await;
        put_block(f.inner.as_ref(), &b).await;

        // when:
        f.compactor
            .compact(CancellationToken::new(), Duration::ZERO)
            .await
            .unwrap();

        // then: one merged output, sources marked for deletion
        let live = live_blocks(&f).await;
        assert_eq!(live.len(), 1);
        let merged = &live[0];
        assert_eq!(merged.min_time, 1000);
        assert_eq!(merged.max_time, 3000);
        assert_eq!(merged.stats.num_samples, 12);
        assert_eq!(merged.compaction.level, 2);
        let mut sources = merged.compaction.sources.clone();
        sources.sort();
        let mut expected = vec![a.ulid, b.ulid];
        expected.sort();
        assert_eq!(sources, expected);

        assert!(is_marked_for_deletion(&f, a.ulid).await);
        assert!(is_marked_for_deletion(&f, b.ulid).await);
        assert_eq!(stat(&f, GROUP_COMPACTIONS), 1);
        assert_eq!(stat(&f, GROUP_COMPACTION_RUNS_FAILED), 0);
        assert_eq!(stat(&f, BLOCKS_MARKED_FOR_DELETION), 2);
        assert!(f.backend.all_readers_closed());

        // The scratch tree is removed on a clean exit.
        assert!(!f.compactor.options.compact_dir.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_compact_call_is_a_noop() {
        let f = fixture(CompactorOptions::default(), 0);
        let a = meta_builder().min_time(1000).max_time(2000).build();
        let b = meta_builder().min_time(2000).max_time(3000).build();
        put_block(f.inner.as_ref(), &a).await;
        put_block(f.inner.as_ref(), &b).await;

        let ct = CancellationToken::new();
        f.compactor.compact(ct.clone(), Duration::ZERO).await.unwrap();
        let compactions_after_first = stat(&f, GROUP_COMPACTIONS);
        let live_after_first = live_blocks(&f).await;

        f.compactor.compact(ct, Duration::ZERO).await.unwrap();

        assert_eq!(stat(&f, GROUP_COMPACTIONS), compactions_after_first);
        assert_eq!(live_blocks(&f).await, live_after_first);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_compact_on_empty_bucket_is_a_noop() {
        let f = fixture(CompactorOptions::default(), 0);

        f.compactor
            .compact(CancellationToken::new(), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(stat(&f, GROUP_COMPACTIONS), 0);
        assert_eq!(stat(&f, GROUP_COMPACTION_RUNS_STARTED), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_split_compaction_covers_source_range() {
        // given: a job with splitting into 4 shards over [0, 10000]
        let f = fixture(CompactorOptions::default(), 4);
        let a = meta_builder().min_time(0).max_time(4000).num_samples(5).build();
        let b = meta_builder().min_time(3000).max_time(7000).num_samples(6).build();
        let c = meta_builder().min_time(6000).max_time(10000).num_samples(7).build();
        for meta in [&a, &b, &c] {
            put_block(f.inner.as_ref(), meta).await;
        }

        // when:
        f.compactor
            .compact(CancellationToken::new(), Duration::ZERO)
            .await
            .unwrap();

        // then: up to 4 outputs, all within [0, 10000], jointly covering it
        let live = live_blocks(&f).await;
        assert!(!live.is_empty());
        assert!(live.len() <= 4);
        for output in &live {
            assert!(output.min_time >= 0);
            assert!(output.max_time <= 10000);
        }
        assert_eq!(live.iter().map(|m| m.min_time).min(), Some(0));
        assert_eq!(live.iter().map(|m| m.max_time).max(), Some(10000));

        for meta in [&a, &b, &c] {
            assert!(is_marked_for_deletion(&f, meta.ulid).await);
        }
        assert_eq!(stat(&f, GROUP_COMPACTIONS), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_all_empty_result_marks_empty_sources() {
        // given: all sources have zero samples
        let f = fixture(CompactorOptions::default(), 0);
        let a = meta_builder().min_time(0).max_time(1000).num_samples(0).build();
        let b = meta_builder().min_time(1000).max_time(2000).num_samples(0).build();
        put_block(f.inner.as_ref(), &a).await;
        put_block(f.inner.as_ref(), &b).await;

        // when:
        f.compactor
            .compact(CancellationToken::new(), Duration::ZERO)
            .await
            .unwrap();

        // then: nothing was uploaded, the empty sources are gone
        assert!(live_blocks(&f).await.is_empty());
        assert!(is_marked_for_deletion(&f, a.ulid).await);
        assert!(is_marked_for_deletion(&f, b.ulid).await);
        assert_eq!(stat(&f, GROUP_COMPACTIONS), 0);
        assert_eq!(stat(&f, GROUP_COMPACTION_RUNS_COMPLETED), 1);
        assert_eq!(stat(&f, GROUP_COMPACTION_RUNS_FAILED), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bound_violation_aborts_job_without_marking_sources() {
        // given: the backend produces an output before the source min time
        let f = fixture(CompactorOptions::default(), 0);
        f.backend.force_min_time_violation.store(true, Ordering::SeqCst);
        let a = meta_builder().min_time(0).max_time(1000).build();
        let b = meta_builder().min_time(1000).max_time(2000).build();
        put_block(f.inner.as_ref(), &a).await;
        put_block(f.inner.as_ref(), &b).await;

        // when:
        let result = f
            .compactor
            .compact(CancellationToken::new(), Duration::ZERO)
            .await;

        // then: the job fails hard and the sources stay live
        assert!(matches!(result, Err(Error::CompactionFailed(_))));
        assert!(!is_marked_for_deletion(&f, a.ulid).await);
        assert!(!is_marked_for_deletion(&f, b.ulid).await);
        assert_eq!(stat(&f, BLOCKS_MARKED_FOR_DELETION), 0);
        assert_eq!(stat(&f, GROUP_COMPACTION_RUNS_FAILED), 1);
        assert_eq!(stat(&f, BLOCKS_VERIFICATION_FAILURES), 1);

        // The scratch tree survives a failed run for reuse.
        assert!(f.compactor.options.compact_dir.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_bound_coverage_warns_but_completes() {
        // given: outputs strictly inside the source range
        let f = fixture(CompactorOptions::default(), 0);
        f.backend.shrink_output_range.store(true, Ordering::SeqCst);
        let a = meta_builder().min_time(0).max_time(1000).build();
        let b = meta_builder().min_time(1000).max_time(2000).build();
        put_block(f.inner.as_ref(), &a).await;
        put_block(f.inner.as_ref(), &b).await;

        // when: coverage verification fails, but only as a warning
        let result = f
            .compactor
            .compact(CancellationToken::new(), Duration::ZERO)
            .await;

        // then: the job completed and the sources were replaced
        result.unwrap();
        assert!(is_marked_for_deletion(&f, a.ulid).await);
        assert!(is_marked_for_deletion(&f, b.ulid).await);
        assert_eq!(stat(&f, BLOCKS_VERIFICATION_FAILURES), 1);
        assert_eq!(stat(&f, GROUP_COMPACTION_RUNS_FAILED), 0);
        assert_eq!(stat(&f, GROUP_COMPACTIONS), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_period_skips_recently_uploaded_blocks() {
        // given: blocks uploaded just now, with a five minute wait period
        let options = CompactorOptions {
            wait_period: Duration::from_secs(300),
            ..CompactorOptions::default()
        };
        let f = fixture(options, 0);
        let a = meta_builder().min_time(0).max_time(1000).build();
        let b = meta_builder().min_time(1000).max_time(2000).build();
        put_block(f.inner.as_ref(), &a).await;
        put_block(f.inner.as_ref(), &b).await;

        // when:
        f.compactor
            .compact(CancellationToken::new(), Duration::ZERO)
            .await
            .unwrap();

        // then: the job was filtered out of the pass, no work happened
        assert_eq!(stat(&f, GROUP_COMPACTION_RUNS_STARTED), 0);
        assert_eq!(stat(&f, GROUP_COMPACTIONS), 0);
        assert_eq!(live_blocks(&f).await.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_period_admits_blocks_older_than_it() {
        use crate::clock::test::TestClock;

        // given: the same five minute wait period, but the clock has moved
        // ten minutes past the upload
        let options = CompactorOptions {
            wait_period: Duration::from_secs(300),
            ..CompactorOptions::default()
        };
        let clock = Arc::new(TestClock::new(Utc::now()));
        let f = fixture_full(options, 0, own_all_jobs(), clock.clone());
        let a = meta_builder().min_time(0).max_time(1000).build();
        let b = meta_builder().min_time(1000).max_time(2000).build();
        put_block(f.inner.as_ref(), &a).await;
        put_block(f.inner.as_ref(), &b).await;
        clock.advance(TimeDelta::minutes(10));

        // when:
        f.compactor
            .compact(CancellationToken::new(), Duration::ZERO)
            .await
            .unwrap();

        // then: the blocks are old enough and get merged
        assert_eq!(stat(&f, GROUP_COMPACTIONS), 1);
        assert!(is_marked_for_deletion(&f, a.ulid).await);
        assert!(is_marked_for_deletion(&f, b.ulid).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unowned_jobs_are_skipped() {
        let own_nothing: OwnCompactionJobFn = Arc::new(|_| Ok(false));
        let f = fixture_with_ownership(CompactorOptions::default(), 0, own_nothing);
        let a = meta_builder().min_time(0).max_time(1000).build();
        let b = meta_builder().min_time(1000).max_time(2000).build();
        put_block(f.inner.as_ref(), &a).await;
        put_block(f.inner.as_ref(), &b).await;

        f.compactor
            .compact(CancellationToken::new(), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(stat(&f, GROUP_COMPACTION_RUNS_STARTED), 0);
        assert_eq!(live_blocks(&f).await.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_expired_time_budget_stops_dispatching() {
        let f = fixture(CompactorOptions::default(), 0);
        let a = meta_builder().min_time(0).max_time(1000).build();
        let b = meta_builder().min_time(1000).max_time(2000).build();
        put_block(f.inner.as_ref(), &a).await;
        put_block(f.inner.as_ref(), &b).await;

        // A one-nanosecond budget expires before the first dispatch.
        f.compactor
            .compact(CancellationToken::new(), Duration::from_nanos(1))
            .await
            .unwrap();

        assert_eq!(stat(&f, GROUP_COMPACTION_RUNS_STARTED), 0);
        assert_eq!(live_blocks(&f).await.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panic_in_job_is_contained() {
        let f = fixture(CompactorOptions::default(), 0);
        f.backend.panic_on_compact.store(true, Ordering::SeqCst);
        let a = meta_builder().min_time(0).max_time(1000).build();
        let b = meta_builder().min_time(1000).max_time(2000).build();
        put_block(f.inner.as_ref(), &a).await;
        put_block(f.inner.as_ref(), &b).await;

        let result = f
            .compactor
            .compact(CancellationToken::new(), Duration::ZERO)
            .await;

        let Err(Error::CompactionFailed(multi)) = result else {
            panic!("expected a compaction failure, got {:?}", result);
        };
        assert_eq!(multi.errors().len(), 1);
        assert!(matches!(
            &multi.errors()[0],
            Error::CompactionJob { .. }
        ));
        assert_eq!(stat(&f, GROUP_COMPACTION_RUNS_FAILED), 1);
        assert!(!is_marked_for_deletion(&f, a.ulid).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocks_from_different_groups_are_not_merged() {
        let f = fixture(CompactorOptions::default(), 0);
        let labels_a = BTreeMap::from([("svc".to_string(), "api".to_string())]);
        let labels_b = BTreeMap::from([("svc".to_string(), "db".to_string())]);
        let a = meta_builder().labels(labels_a).min_time(0).max_time(1000).build();
        let b = meta_builder().labels(labels_b).min_time(0).max_time(1000).build();
        put_block(f.inner.as_ref(), &a).await;
        put_block(f.inner.as_ref(), &b).await;

        f.compactor
            .compact(CancellationToken::new(), Duration::ZERO)
            .await
            .unwrap();

        // One single-block job per group, nothing to merge in either.
        assert_eq!(stat(&f, GROUP_COMPACTIONS), 0);
        assert_eq!(live_blocks(&f).await.len(), 2);
    }

    mod verify {
        use super::*;
        use crate::block::META_FILENAME;

        async fn write_output(dir: &StdPath, meta: &BlockMeta) {
            let bdir = dir.join(meta.ulid.to_string());
            tokio::fs::create_dir_all(&bdir).await.unwrap();
            tokio::fs::write(bdir.join(META_FILENAME), serde_json::to_vec(meta).unwrap())
                .await
                .unwrap();
        }

        #[tokio::test]
        async fn test_outputs_covering_bounds_pass() {
            let dir = tempfile::tempdir().unwrap();
            let first = meta_builder().min_time(0).max_time(500).build();
            let second = meta_builder().min_time(400).max_time(1000).build();
            write_output(dir.path(), &first).await;
            write_output(dir.path(), &second).await;

            verify_compacted_blocks_time_ranges(
                &[first.ulid, Ulid::nil(), second.ulid],
                0,
                1000,
                dir.path(),
            )
            .await
            .unwrap();
        }

        #[tokio::test]
        async fn test_min_time_violation_is_detected() {
            let dir = tempfile::tempdir().unwrap();
            let output = meta_builder().min_time(-1).max_time(1000).build();
            write_output(dir.path(), &output).await;

            let result =
                verify_compacted_blocks_time_ranges(&[output.ulid], 0, 1000, dir.path()).await;
            assert!(matches!(result, Err(Error::InvalidBlockMinTime { .. })));
        }

        #[tokio::test]
        async fn test_max_time_violation_is_detected() {
            let dir = tempfile::tempdir().unwrap();
            let output = meta_builder().min_time(0).max_time(2000).build();
            write_output(dir.path(), &output).await;

            let result =
                verify_compacted_blocks_time_ranges(&[output.ulid], 0, 1000, dir.path()).await;
            assert!(matches!(result, Err(Error::InvalidBlockMaxTime { .. })));
        }

        #[tokio::test]
        async fn test_missing_bound_coverage_is_detected() {
            let dir = tempfile::tempdir().unwrap();
            let output = meta_builder().min_time(100).max_time(900).build();
            write_output(dir.path(), &output).await;

            let result =
                verify_compacted_blocks_time_ranges(&[output.ulid], 0, 1000, dir.path()).await;
            let Err(err) = result else {
                panic!("expected a coverage error");
            };
            assert!(matches!(err, Error::TimeRangeNotCovered { .. }));
            assert_eq!(
                err.to_string(),
                "compacted block(s) do not contain minTime 0 and maxTime 1000 \
                 from the source blocks"
            );
        }
    }
}
