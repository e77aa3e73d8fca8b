//! Per-transfer streaming pipeline.
//!
//! One pipeline instance moves one object end to end: parts out for
//! uploads, chunks in for downloads, rolling plaintext MD5 either way,
//! retry and resume policy, and the sidecar writes that must follow a
//! successful content upload.

pub mod compare;
pub mod download;
pub mod parts;
pub mod upload;

use crate::config::Config;
use crate::crypto::CryptoContext;
use crate::error::{Error, Result};
use crate::meta::{self, MetaLayer};
use crate::store::ObjectStore;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;

pub use compare::Divergence;

/// Transfer progression, reported to the progress aggregator and logged.
/// Failures re-enter `Preparing` through `Retrying` while attempts remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Preparing,
    Transferring,
    Verifying,
    Retrying(u32),
    Done,
    Failed,
}

impl TransferState {
    pub fn label(&self) -> &'static str {
        match self {
            TransferState::Idle => "idle",
            TransferState::Preparing => "preparing",
            TransferState::Transferring => "transferring",
            TransferState::Verifying => "verifying",
            TransferState::Retrying(_) => "retrying",
            TransferState::Done => "done",
            TransferState::Failed => "failed",
        }
    }
}

/// Events a transfer posts while it runs.
#[derive(Debug, Clone, Copy)]
pub enum TransferEvent {
    State(TransferState),
    Bytes(u64),
}

/// Progress callback shared with background pump tasks.
pub type ProgressFn = Arc<dyn Fn(TransferEvent) + Send + Sync>;

pub(crate) fn post(progress: &Option<ProgressFn>, event: TransferEvent) {
    if let Some(cb) = progress {
        cb(event);
    }
}

/// Tunables for one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Fixed upload part size.
    pub part_size: u64,
    /// Concurrent part PUTs per upload.
    pub concurrency: usize,
    /// Streaming inactivity window.
    pub stall_timeout: Duration,
    /// Retry budget per transfer.
    pub retries: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_start: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            part_size: 100 * 1024 * 1024,
            concurrency: 4,
            stall_timeout: Duration::from_secs(30),
            retries: 3,
            backoff_start: Duration::from_millis(500),
        }
    }
}

impl From<&Config> for PipelineOptions {
    fn from(config: &Config) -> Self {
        Self {
            part_size: config.part_size,
            concurrency: config.concurrent,
            stall_timeout: Duration::from_secs(config.stall_timeout),
            retries: config.retries,
            backoff_start: Duration::from_millis(500),
        }
    }
}

/// Where downloaded bytes land. `truncate` rewinds for a full restart;
/// `finish` is the terminal end token after the last chunk.
#[async_trait]
pub trait Sink: Send {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
    async fn truncate(&mut self) -> io::Result<()>;
    async fn finish(&mut self) -> io::Result<()>;
}

/// Sink writing to a local file.
pub struct FileSink {
    file: tokio::fs::File,
    path: PathBuf,
}

impl FileSink {
    pub async fn create(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: tokio::fs::File::create(path).await?,
            path: path.to_path_buf(),
        })
    }

    /// Apply the remote `Mtime` to the finished file.
    pub fn set_modified(&self, mtime: SystemTime) -> io::Result<()> {
        let file = std::fs::OpenOptions::new().write(true).open(&self.path)?;
        file.set_modified(mtime)
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes).await
    }

    async fn truncate(&mut self) -> io::Result<()> {
        use tokio::io::AsyncSeekExt;
        self.file.set_len(0).await?;
        self.file.seek(io::SeekFrom::Start(0)).await?;
        Ok(())
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.file.flush().await
    }
}

/// Sink writing to stdout. A stream cannot be rewound, so a mid-transfer
/// restart fails the transfer; stall resume never truncates and still
/// works.
pub struct StdoutSink {
    out: tokio::io::Stdout,
    wrote_any: bool,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            out: tokio::io::stdout(),
            wrote_any: false,
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for StdoutSink {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.wrote_any = true;
        self.out.write_all(bytes).await
    }

    async fn truncate(&mut self) -> io::Result<()> {
        if self.wrote_any {
            return Err(io::Error::other("cannot rewind stream output"));
        }
        Ok(())
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.out.flush().await
    }
}

/// Sink that discards bytes (`md5check` only needs the rolling hash).
#[derive(Default)]
pub struct NullSink;

#[async_trait]
impl Sink for NullSink {
    async fn write(&mut self, _bytes: &[u8]) -> io::Result<()> {
        Ok(())
    }

    async fn truncate(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Buffering sink for tests.
#[derive(Default)]
pub struct VecSink {
    pub data: Vec<u8>,
}

#[async_trait]
impl Sink for VecSink {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    async fn truncate(&mut self) -> io::Result<()> {
        self.data.clear();
        Ok(())
    }

    async fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The transfer engine facade: one store, one key mapping, one set of
/// tunables, shared by every command and by the bulk orchestrator.
#[derive(Clone)]
pub struct Pipeline {
    pub store: Arc<dyn ObjectStore>,
    pub meta: MetaLayer,
    pub opts: PipelineOptions,
    pub crypto: CryptoContext,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        meta: MetaLayer,
        opts: PipelineOptions,
        crypto: CryptoContext,
    ) -> Self {
        Self {
            store,
            meta,
            opts,
            crypto,
        }
    }

    /// Upload a regular file, preserving its mtime.
    pub async fn put_file(
        &self,
        local: &Path,
        path: &str,
        progress: Option<ProgressFn>,
    ) -> Result<()> {
        let file = tokio::fs::File::open(local).await?;
        let mtime = file.metadata().await?.modified().ok();
        upload::put_from_source(self, file, mtime, path, progress).await
    }

    /// Upload from any byte stream (stdin).
    pub async fn put_reader<R>(
        &self,
        reader: R,
        mtime: Option<SystemTime>,
        path: &str,
        progress: Option<ProgressFn>,
    ) -> Result<()>
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
    {
        upload::put_from_source(self, reader, mtime, path, progress).await
    }

    /// Download to a local file, restoring the remote mtime when present.
    pub async fn get_to_file(
        &self,
        path: &str,
        local: &Path,
        progress: Option<ProgressFn>,
    ) -> Result<()> {
        let mut sink = FileSink::create(local).await?;
        let head = download::get_to_sink(self, path, &mut sink, progress).await?;
        if let Some(mtime) = head
            .user_meta
            .get(meta::META_MTIME)
            .and_then(|v| meta::parse_mtime(v))
        {
            sink.set_modified(mtime)?;
        }
        Ok(())
    }

    /// Download to stdout.
    pub async fn get_to_stdout(&self, path: &str, progress: Option<ProgressFn>) -> Result<()> {
        let mut sink = StdoutSink::new();
        download::get_to_sink(self, path, &mut sink, progress).await?;
        Ok(())
    }

    /// Stream the object and verify its plaintext MD5 against the sidecar
    /// without writing anything.
    pub async fn verify_md5(&self, path: &str) -> Result<()> {
        let mut sink = NullSink;
        download::get_to_sink(self, path, &mut sink, None).await?;
        Ok(())
    }

    /// Compare the remote object against a local file.
    pub async fn compare_file(&self, path: &str, local: &Path) -> Result<Option<Divergence>> {
        compare::compare_to_local(self, path, local).await
    }

    /// Delete the content object and every sidecar; no orphans.
    pub async fn remove(&self, path: &str) -> Result<()> {
        let data_key = self.meta.data_key(path);
        match self.store.head(&data_key).await {
            Ok(_) => self.store.delete(&data_key).await?,
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.meta.delete_all_meta(path).await
    }
}
