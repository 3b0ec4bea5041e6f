use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};

use futures::stream::StreamExt;
use futures::TryStreamExt;
use log::warn;

use crate::error::Error;

/// Runs `f` over `items` with at most `max_parallel` futures in flight,
/// preserving input order in the output. The first error aborts the
/// remaining work and is returned.
pub(crate) async fn build_concurrent<I, T, F, Fut>(
    items: I,
    max_parallel: usize,
    f: F,
) -> Result<Vec<T>, Error>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    futures::stream::iter(items)
        .map(f)
        .buffered(max_parallel.max(1))
        .try_collect()
        .await
}

/// Renders a panic payload into the message used for job containment.
pub(crate) fn panic_to_err(panic: Box<dyn Any + Send>) -> Error {
    let msg = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    Error::CompactionJobPanic { msg }
}

/// Deletes everything under `root` except the relative paths in `keep` (and
/// their parents). Used to bound scratch disk usage by in-flight work between
/// compaction passes. Individual removal failures are logged and skipped so
/// one undeletable entry cannot wedge the loop.
pub(crate) fn delete_all_except(root: &Path, keep: &HashSet<PathBuf>) {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        // A missing scratch dir means there is nothing to prune.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!("failed to read scratch dir {}: {}", root.display(), e);
            return;
        }
    };

    let keep_parents: HashSet<&Path> = keep.iter().filter_map(|p| p.parent()).collect();

    for entry in entries.flatten() {
        let name = PathBuf::from(entry.file_name());
        let path = entry.path();
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            if keep_parents.contains(name.as_path()) {
                prune_dir(&path, &name, keep);
            } else if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!("failed to remove scratch dir {}: {}", path.display(), e);
            }
        } else if let Err(e) = std::fs::remove_file(&path) {
            warn!("failed to remove scratch file {}: {}", path.display(), e);
        }
    }
}

fn prune_dir(dir: &Path, rel: &Path, keep: &HashSet<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("failed to read scratch dir {}: {}", dir.display(), e);
            return;
        }
    };
    for entry in entries.flatten() {
        let child_rel = rel.join(entry.file_name());
        if keep.contains(&child_rel) {
            continue;
        }
        let path = entry.path();
        let removed = if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = removed {
            warn!("failed to remove scratch entry {}: {}", path.display(), e);
        }
    }
}
