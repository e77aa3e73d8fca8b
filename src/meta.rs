//! Bucket layout and sidecar metadata.
//!
//! A logical path `P` maps to a content object at `data/P` and small
//! sidecar objects at `meta/P/<name>`. The well-known sidecars are
//! `md5sum` (hex lowercase MD5 of the plaintext, newline-terminated) and
//! `cryptokey` (`<scheme>:<hex-iv>\n`, present iff the content is
//! encrypted). The engine never exposes raw object keys.

use crate::error::{Error, Result};
use crate::store::{GetOptions, ObjectStore};
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Sidecar names.
pub const MD5SUM: &str = "md5sum";
pub const CRYPTOKEY: &str = "cryptokey";

/// User-metadata keys on content objects (`x-amz-meta-*` on the wire).
pub const META_MTIME: &str = "mtime";
pub const META_KEYID: &str = "keyid";

/// Collapse repeated slashes and trim edge slashes from a logical path.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|seg| !seg.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Format a source mtime as the `Mtime` header value
/// (`YYYY-MM-DDTHH:MM:SSZ`, UTC, second precision).
pub fn format_mtime(mtime: SystemTime) -> String {
    let secs = mtime
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    match Utc.timestamp_opt(secs as i64, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        _ => String::new(),
    }
}

/// Parse an `Mtime` header value back to a timestamp.
pub fn parse_mtime(value: &str) -> Option<SystemTime> {
    let dt = DateTime::parse_from_rfc3339(value).ok()?;
    Some(UNIX_EPOCH + Duration::from_secs(dt.timestamp().max(0) as u64))
}

/// Key mapping and sidecar operations over an [`ObjectStore`].
#[derive(Clone)]
pub struct MetaLayer {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl MetaLayer {
    /// `prefix` is the key prefix inside the bucket (may be empty).
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: normalize_path(prefix),
        }
    }

    fn join(&self, namespace: &str, path: &str) -> String {
        let mut key = String::new();
        if !self.prefix.is_empty() {
            key.push_str(&self.prefix);
            key.push('/');
        }
        key.push_str(namespace);
        let path = normalize_path(path);
        if !path.is_empty() {
            key.push('/');
            key.push_str(&path);
        }
        key
    }

    /// Object key of the content for logical path `path`.
    pub fn data_key(&self, path: &str) -> String {
        self.join("data", path)
    }

    /// Key prefix of the whole data namespace (for listings). An empty
    /// logical root means the bucket root inside the data namespace.
    pub fn data_prefix(&self, root: &str) -> String {
        let key = self.join("data", root);
        if normalize_path(root).is_empty() {
            format!("{}/", key)
        } else {
            key
        }
    }

    /// Object key of sidecar `name` for logical path `path`.
    pub fn meta_key(&self, path: &str, name: &str) -> String {
        let mut key = self.join("meta", path);
        key.push('/');
        key.push_str(name);
        key
    }

    /// Key prefix under which all sidecars of `path` live.
    pub fn meta_prefix(&self, path: &str) -> String {
        format!("{}/", self.join("meta", path))
    }

    /// Write sidecar `name` with a newline-terminated value.
    pub async fn put_meta(&self, path: &str, name: &str, value: &str) -> Result<()> {
        let key = self.meta_key(path, name);
        let body = format!("{}\n", value);
        let mut parts = vec![bytes::Bytes::from(body)].into_iter();
        self.store
            .put(&key, &mut parts, &HashMap::new(), 1)
            .await?;
        debug!(key, "wrote sidecar");
        Ok(())
    }

    /// Read sidecar `name`, trimmed of its trailing newline. Absence is
    /// [`Error::NotFound`] carrying the sidecar key.
    pub async fn get_meta(&self, path: &str, name: &str) -> Result<String> {
        let key = self.meta_key(path, name);
        let mut body = self.store.get(&key, GetOptions::default()).await?;
        let mut buf = Vec::new();
        while let Some(chunk) = body.stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        let text = String::from_utf8_lossy(&buf);
        Ok(text.trim_end_matches('\n').to_string())
    }

    /// Delete sidecar `name`. HEAD-tests first so a missing sidecar needs
    /// no delete permission; absence is success.
    pub async fn delete_meta(&self, path: &str, name: &str) -> Result<()> {
        let key = self.meta_key(path, name);
        match self.store.head(&key).await {
            Ok(_) => self.store.delete(&key).await,
            Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete every sidecar of `path`.
    pub async fn delete_all_meta(&self, path: &str) -> Result<()> {
        let listing = self.store.list(&self.meta_prefix(path), None).await?;
        for object in listing.objects {
            self.store.delete(&object.key).await?;
        }
        Ok(())
    }
}
