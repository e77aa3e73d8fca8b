//! Object store abstraction.
//!
//! The transfer engine drives every remote interaction through
//! [`ObjectStore`]; the S3 backend implements it over the AWS SDK and the
//! memory backend provides a hermetic twin for tests. The store never
//! retries; it surfaces classified errors and lets the pipeline decide
//! between resume, restart, and abort.

mod memory;
mod s3;

pub use memory::{GetFault, MemoryStore};
pub use s3::S3Store;

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;

/// One entry from a bucket listing.
#[derive(Debug, Clone)]
pub struct ListedObject {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Result of a (fully paginated) list call.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub objects: Vec<ListedObject>,
    pub common_prefixes: Vec<String>,
}

/// Response metadata for a content object.
#[derive(Debug, Clone, Default)]
pub struct ObjectHead {
    pub content_length: u64,
    pub etag: Option<String>,
    /// User metadata, lowercase keys without the `x-amz-meta-` prefix.
    pub user_meta: HashMap<String, String>,
}

/// Byte range / precondition options for a resumed download.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// `Range: bytes=<n>-` when resuming after a stall.
    pub range_start: Option<u64>,
    /// `If-Match` so a resumed fetch still reads the same object.
    pub if_match: Option<String>,
}

/// A streaming response body plus its header.
pub struct ObjectBody {
    pub head: ObjectHead,
    pub stream: BoxStream<'static, Result<Bytes>>,
}

/// Sequentially polled producer of upload parts. Parts are fully buffered
/// `Bytes` so a failed part PUT can be re-sent without re-reading the
/// source (pipes cannot seek, ciphertext cannot be regenerated).
#[async_trait]
pub trait PartSource: Send {
    async fn next_part(&mut self) -> Result<Option<Bytes>>;
}

#[async_trait]
impl PartSource for std::vec::IntoIter<Bytes> {
    async fn next_part(&mut self) -> Result<Option<Bytes>> {
        Ok(self.next())
    }
}

/// Abstract object store: the five verbs the engine needs, with 404
/// surfaced as [`Error::NotFound`] and streaming bodies guarded by the
/// stall timeout.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List keys under `prefix`, fully paginated. With a delimiter, keys
    /// past the first delimiter occurrence collapse into common prefixes.
    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<Listing>;

    /// Metadata for one object.
    async fn head(&self, key: &str) -> Result<ObjectHead>;

    /// Streaming read of one object.
    async fn get(&self, key: &str, opts: GetOptions) -> Result<ObjectBody>;

    /// Multipart upload of sequentially produced parts; at most
    /// `concurrency` part requests in flight. Returns the ETag.
    async fn put(
        &self,
        key: &str,
        source: &mut dyn PartSource,
        user_meta: &HashMap<String, String>,
        concurrency: usize,
    ) -> Result<String>;

    /// Delete one object. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Wrap a body stream so that a chunk taking longer than `stall` to arrive
/// fails the stream with [`Error::StallTimeout`].
pub(crate) fn stall_guard(
    stream: BoxStream<'static, Result<Bytes>>,
    stall: Duration,
) -> BoxStream<'static, Result<Bytes>> {
    futures::stream::unfold(Some(stream), move |state| async move {
        let mut stream = state?;
        match tokio::time::timeout(stall, stream.next()).await {
            Err(_) => Some((Err(Error::StallTimeout(stall.as_secs())), None)),
            Ok(None) => None,
            Ok(Some(Ok(bytes))) => Some((Ok(bytes), Some(stream))),
            Ok(Some(Err(e))) => Some((Err(e), None)),
        }
    })
    .boxed()
}
