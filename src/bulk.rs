//! Bulk orchestration: enumerate a source set, drive one pipeline per file
//! through a bounded worker pool, tally outcomes, and trip the abort gate
//! on repeated failure.
//!
//! Jobs start in enumeration order; completion order is not guaranteed.
//! Five consecutive failures cancel the remaining jobs and surface the
//! last failure as the run result.

use crate::error::{Error, Result};
use crate::filter::PathFilter;
use crate::meta::normalize_path;
use crate::pipeline::Pipeline;
use crate::progress::{ProgressAggregator, ProgressHandle};
use crate::skip::{SkipLogic, SkipOracle};
use crate::store::ObjectStore;
use futures::StreamExt;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

const MAX_RECENT_ABORTS: u32 = 5;

/// Final tally of a bulk run. A skipped file also counts as completed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkSummary {
    pub completed_files: u64,
    pub completed_bytes: u64,
    pub skipped_files: u64,
    pub skipped_bytes: u64,
    pub aborted_files: u64,
    pub aborted_bytes: u64,
}

impl BulkSummary {
    pub fn any_aborted(&self) -> bool {
        self.aborted_files > 0
    }
}

#[derive(Default)]
struct Counters {
    completed_files: AtomicU64,
    completed_bytes: AtomicU64,
    skipped_files: AtomicU64,
    skipped_bytes: AtomicU64,
    aborted_files: AtomicU64,
    aborted_bytes: AtomicU64,
}

impl Counters {
    fn completed(&self, bytes: u64) {
        self.completed_files.fetch_add(1, Ordering::Relaxed);
        self.completed_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn skipped(&self, bytes: u64) {
        self.skipped_files.fetch_add(1, Ordering::Relaxed);
        self.skipped_bytes.fetch_add(bytes, Ordering::Relaxed);
        // skipped is a flavour of completed
        self.completed(bytes);
    }

    fn aborted(&self, bytes: u64) {
        self.aborted_files.fetch_add(1, Ordering::Relaxed);
        self.aborted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BulkSummary {
        BulkSummary {
            completed_files: self.completed_files.load(Ordering::Relaxed),
            completed_bytes: self.completed_bytes.load(Ordering::Relaxed),
            skipped_files: self.skipped_files.load(Ordering::Relaxed),
            skipped_bytes: self.skipped_bytes.load(Ordering::Relaxed),
            aborted_files: self.aborted_files.load(Ordering::Relaxed),
            aborted_bytes: self.aborted_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Options for one bulk run.
#[derive(Clone)]
pub struct BulkOptions {
    pub concurrent: usize,
    pub policy: SkipLogic,
    pub filter: PathFilter,
    /// Render the 1 Hz status display.
    pub progress: bool,
    /// Suppress per-file verb lines.
    pub quiet: bool,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            concurrent: 4,
            policy: SkipLogic::Stat,
            filter: PathFilter::default(),
            progress: false,
            quiet: true,
        }
    }
}

enum Direction {
    Push,
    Pull,
}

/// Runs many transfers with bounded parallelism.
pub struct BulkOrchestrator {
    pipeline: Pipeline,
    oracle: SkipOracle,
    opts: BulkOptions,
}

impl BulkOrchestrator {
    pub fn new(pipeline: Pipeline, opts: BulkOptions) -> Self {
        let oracle = SkipOracle::new(pipeline.store.clone(), pipeline.meta.clone());
        Self {
            pipeline,
            oracle,
            opts,
        }
    }

    /// Upload a local tree under the remote root.
    pub async fn push(
        &self,
        local_root: &Path,
        s3_root: &str,
        cancel: &CancellationToken,
    ) -> Result<BulkSummary> {
        let files = enumerate_local(local_root, &self.opts.filter)?;
        debug!(files = files.len(), "push enumeration complete");
        self.run(Direction::Push, local_root, s3_root, files, cancel)
            .await
    }

    /// Download the remote tree into a local root.
    pub async fn pull(
        &self,
        s3_root: &str,
        local_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<BulkSummary> {
        let files = self.enumerate_remote(s3_root).await?;
        debug!(files = files.len(), "pull enumeration complete");
        self.run(Direction::Pull, local_root, s3_root, files, cancel)
            .await
    }

    /// Flat listing of the remote tree: logical paths relative to
    /// `s3_root`, filtered.
    pub async fn enumerate_remote(&self, s3_root: &str) -> Result<Vec<(String, u64)>> {
        let base = self.pipeline.meta.data_prefix(s3_root);
        let content_base = if base.ends_with('/') {
            base.clone()
        } else {
            format!("{}/", base)
        };
        let listing = self.pipeline.store.list(&content_base, None).await?;

        let mut files = Vec::new();
        for object in listing.objects {
            let Some(rel) = object.key.strip_prefix(&content_base) else {
                continue;
            };
            if rel.is_empty() || !self.opts.filter.keep(rel) {
                continue;
            }
            files.push((rel.to_string(), object.size));
        }
        Ok(files)
    }

    async fn run(
        &self,
        direction: Direction,
        local_root: &Path,
        s3_root: &str,
        files: Vec<(String, u64)>,
        cancel: &CancellationToken,
    ) -> Result<BulkSummary> {
        let total_bytes: u64 = files.iter().map(|(_, size)| size).sum();
        let aggregator = ProgressAggregator::spawn(self.opts.progress);
        let handle = aggregator.handle();
        handle.set_totals(files.len() as u64, total_bytes);

        let counters = Arc::new(Counters::default());
        let recent_aborts = Arc::new(AtomicU32::new(0));
        let last_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        let s3_root = normalize_path(s3_root);
        let direction = &direction;

        futures::stream::iter(files)
            .map(|(rel, size)| {
                let handle = handle.clone();
                let counters = counters.clone();
                let recent_aborts = recent_aborts.clone();
                let last_error = last_error.clone();
                let cancel = cancel.clone();
                let s3_root = s3_root.clone();
                async move {
                    if cancel.is_cancelled() {
                        return;
                    }
                    self.job(
                        direction, local_root, &s3_root, rel, size, handle, counters,
                        recent_aborts, last_error, cancel,
                    )
                    .await;
                }
            })
            .buffer_unordered(self.opts.concurrent.max(1))
            .collect::<()>()
            .await;

        aggregator.shutdown().await;

        let summary = counters.snapshot();
        let gate_tripped = recent_aborts.load(Ordering::Relaxed) >= MAX_RECENT_ABORTS;
        if gate_tripped || cancel.is_cancelled() {
            return Err(last_error.lock().take().unwrap_or(Error::Cancelled));
        }
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn job(
        &self,
        direction: &Direction,
        local_root: &Path,
        s3_root: &str,
        rel: String,
        size: u64,
        handle: ProgressHandle,
        counters: Arc<Counters>,
        recent_aborts: Arc<AtomicU32>,
        last_error: Arc<Mutex<Option<Error>>>,
        cancel: CancellationToken,
    ) {
        let path = join_logical(s3_root, &rel);
        let local = local_root.join(rel_as_path(&rel));
        let id = handle.start(&rel, size);
        if !self.opts.quiet {
            eprintln!("START {}", rel);
        }

        let work = async {
            let decision = self.oracle.check(&local, &path, self.opts.policy).await?;
            if decision.skip {
                return Ok(true);
            }
            debug!(path, reason = decision.reason, "not skipping");
            let progress = Some(handle.transfer_fn(id));
            match direction {
                Direction::Push => self.pipeline.put_file(&local, &path, progress).await?,
                Direction::Pull => {
                    if let Some(parent) = local.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    self.pipeline.get_to_file(&path, &local, progress).await?
                }
            }
            Ok(false)
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            r = work => r,
        };

        match result {
            Ok(true) => {
                counters.skipped(size);
                recent_aborts.store(0, Ordering::Relaxed);
                handle.skipped(id, size);
                if !self.opts.quiet {
                    eprintln!("SKIP {}", rel);
                }
            }
            Ok(false) => {
                counters.completed(size);
                recent_aborts.store(0, Ordering::Relaxed);
                handle.finished(id);
                if !self.opts.quiet {
                    eprintln!("DONE {}", rel);
                }
            }
            Err(Error::Cancelled) => {
                handle.aborted(id);
            }
            Err(e) => {
                counters.aborted(size);
                handle.aborted(id);
                eprintln!("ABORT {}: {}", rel, e);
                *last_error.lock() = Some(e);
                if recent_aborts.fetch_add(1, Ordering::Relaxed) + 1 >= MAX_RECENT_ABORTS {
                    cancel.cancel();
                }
            }
        }
    }
}

/// Join the remote root and a relative path into one logical path.
pub fn join_logical(root: &str, rel: &str) -> String {
    if root.is_empty() {
        normalize_path(rel)
    } else {
        format!("{}/{}", normalize_path(root), normalize_path(rel))
    }
}

/// A slash-separated relative path as a local path.
fn rel_as_path(rel: &str) -> PathBuf {
    rel.split('/').collect()
}

/// Sorted depth-first walk emitting `(relative path, size)` for regular
/// files that pass the filter. Directory entries are visited in
/// lexicographic order; symlinks are followed only when they resolve to a
/// regular file, so a symlinked directory is never recursed into.
pub fn enumerate_local(root: &Path, filter: &PathFilter) -> Result<Vec<(String, u64)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            Error::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("error walking tree")),
            )
        })?;
        let size = if entry.file_type().is_file() {
            entry.metadata().map(|m| m.len()).unwrap_or(0)
        } else if entry.file_type().is_symlink() {
            // resolve the link by hand: only a target that is a regular
            // file joins the set
            match std::fs::metadata(entry.path()) {
                Ok(m) if m.is_file() => m.len(),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(path = ?entry.path(), "skipping dangling symlink");
                    continue;
                }
                Err(e) => return Err(Error::Io(e)),
            }
        } else {
            continue;
        };
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !filter.keep(&rel) {
            continue;
        }
        files.push((rel, size));
    }
    Ok(files)
}
