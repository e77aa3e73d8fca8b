//! Skip logic: decide whether the remote copy of a file is already
//! equivalent and the transfer can be left out.

use crate::error::{Error, Result};
use crate::meta::{self, MetaLayer, MD5SUM, META_MTIME};
use crate::store::ObjectStore;
use md5::{Digest, Md5};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Skip policy for a bulk run or single transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SkipLogic {
    /// Never skip (force).
    All,
    /// Skip when size, mtime, and sidecar presence all line up.
    #[default]
    Stat,
    /// `Stat`, plus the local MD5 must equal the remote sidecar.
    Md5sum,
}

/// Outcome of a skip check. Carries the remote md5 when it was fetched so
/// chained callers need no extra round-trip.
#[derive(Debug, Clone)]
pub struct SkipDecision {
    pub skip: bool,
    pub remote_md5: Option<String>,
    /// Reason for not skipping, for `-d` diagnostics.
    pub reason: &'static str,
}

impl SkipDecision {
    fn transfer(reason: &'static str) -> Self {
        Self {
            skip: false,
            remote_md5: None,
            reason,
        }
    }
}

/// Applies a [`SkipLogic`] to one (local file, remote path) pair.
pub struct SkipOracle {
    store: Arc<dyn ObjectStore>,
    meta: MetaLayer,
}

impl SkipOracle {
    pub fn new(store: Arc<dyn ObjectStore>, meta: MetaLayer) -> Self {
        Self { store, meta }
    }

    /// Check whether `local` and the remote object at `path` are already
    /// equivalent under `policy`. Any 404 along the way means "transfer".
    pub async fn check(&self, local: &Path, path: &str, policy: SkipLogic) -> Result<SkipDecision> {
        if policy == SkipLogic::All {
            return Ok(SkipDecision::transfer("forced"));
        }

        let local_meta = match tokio::fs::metadata(local).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(SkipDecision::transfer("local path is not a regular file")),
            Err(_) => return Ok(SkipDecision::transfer("local file missing")),
        };

        let head = match self.store.head(&self.meta.data_key(path)).await {
            Ok(h) => h,
            Err(Error::NotFound(_)) => return Ok(SkipDecision::transfer("no remote object")),
            Err(e) => return Err(e),
        };

        if head.content_length != local_meta.len() {
            return Ok(SkipDecision::transfer("size differs"));
        }

        let remote_md5 = match self.meta.get_meta(path, MD5SUM).await {
            Ok(v) => v,
            Err(Error::NotFound(_)) => return Ok(SkipDecision::transfer("no md5sum sidecar")),
            Err(e) => return Err(e),
        };

        // a content object without an Mtime header never matches
        let remote_mtime = head
            .user_meta
            .get(META_MTIME)
            .and_then(|v| meta::parse_mtime(v));
        let local_secs = local_meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        match remote_mtime {
            Some(t)
                if t.duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::ZERO)
                    .as_secs()
                    == local_secs => {}
            Some(_) => {
                return Ok(SkipDecision {
                    skip: false,
                    remote_md5: Some(remote_md5),
                    reason: "mtime differs",
                })
            }
            None => {
                return Ok(SkipDecision {
                    skip: false,
                    remote_md5: Some(remote_md5),
                    reason: "no Mtime header",
                })
            }
        }

        if policy == SkipLogic::Md5sum {
            let local_md5 = file_md5(local).await?;
            if local_md5 != remote_md5 {
                debug!(path, local = %local_md5, remote = %remote_md5, "md5 differs");
                return Ok(SkipDecision {
                    skip: false,
                    remote_md5: Some(remote_md5),
                    reason: "md5 differs",
                });
            }
        }

        Ok(SkipDecision {
            skip: true,
            remote_md5: Some(remote_md5),
            reason: "up to date",
        })
    }
}

/// Streaming in-process MD5 of a local file.
pub async fn file_md5(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut ctx = Md5::new();
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        ctx.update(&buf[..n]);
    }
    Ok(hex::encode(ctx.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::HashMap;
    use std::time::SystemTime;

    fn write_local(dir: &Path, name: &str, content: &[u8], mtime: SystemTime) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.set_modified(mtime).unwrap();
        path
    }

    fn oracle(store: Arc<MemoryStore>) -> SkipOracle {
        let meta = MetaLayer::new(store.clone(), "");
        SkipOracle::new(store, meta)
    }

    fn mtime_meta(t: SystemTime) -> HashMap<String, String> {
        HashMap::from([(META_MTIME.to_string(), meta::format_mtime(t))])
    }

    #[tokio::test]
    async fn test_all_policy_never_skips() {
        let store = Arc::new(MemoryStore::new());
        let oracle = oracle(store);
        let decision = oracle
            .check(Path::new("/nonexistent"), "k", SkipLogic::All)
            .await
            .unwrap();
        assert!(!decision.skip);
        assert_eq!(decision.reason, "forced");
    }

    #[tokio::test]
    async fn test_stat_skips_when_everything_matches() {
        let dir = tempfile::tempdir().unwrap();
        let t = UNIX_EPOCH + Duration::from_secs(1380896764);
        let local = write_local(dir.path(), "f", b"content", t);

        let store = Arc::new(MemoryStore::new());
        store.insert("data/f", b"content", mtime_meta(t));
        store.insert("meta/f/md5sum", b"ignored-by-stat\n", HashMap::new());

        let decision = oracle(store)
            .check(&local, "f", SkipLogic::Stat)
            .await
            .unwrap();
        assert!(decision.skip);
        assert_eq!(decision.remote_md5.as_deref(), Some("ignored-by-stat"));
    }

    #[tokio::test]
    async fn test_stat_requires_md5sum_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let t = UNIX_EPOCH + Duration::from_secs(1380896764);
        let local = write_local(dir.path(), "f", b"content", t);

        let store = Arc::new(MemoryStore::new());
        store.insert("data/f", b"content", mtime_meta(t));

        let decision = oracle(store)
            .check(&local, "f", SkipLogic::Stat)
            .await
            .unwrap();
        assert!(!decision.skip);
        assert_eq!(decision.reason, "no md5sum sidecar");
    }

    #[tokio::test]
    async fn test_stat_missing_mtime_header_means_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let t = UNIX_EPOCH + Duration::from_secs(1380896764);
        let local = write_local(dir.path(), "f", b"content", t);

        let store = Arc::new(MemoryStore::new());
        store.insert("data/f", b"content", HashMap::new());
        store.insert("meta/f/md5sum", b"aa\n", HashMap::new());

        let decision = oracle(store)
            .check(&local, "f", SkipLogic::Stat)
            .await
            .unwrap();
        assert!(!decision.skip);
        assert_eq!(decision.reason, "no Mtime header");
    }

    #[tokio::test]
    async fn test_stat_size_mismatch_means_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let t = UNIX_EPOCH + Duration::from_secs(1380896764);
        let local = write_local(dir.path(), "f", b"content", t);

        let store = Arc::new(MemoryStore::new());
        store.insert("data/f", b"different length", mtime_meta(t));
        store.insert("meta/f/md5sum", b"aa\n", HashMap::new());

        let decision = oracle(store)
            .check(&local, "f", SkipLogic::Stat)
            .await
            .unwrap();
        assert!(!decision.skip);
        assert_eq!(decision.reason, "size differs");
    }

    #[tokio::test]
    async fn test_md5sum_policy_detects_content_change() {
        let dir = tempfile::tempdir().unwrap();
        let t = UNIX_EPOCH + Duration::from_secs(1380896764);
        // same size and mtime as the remote, different content
        let local = write_local(dir.path(), "f", b"content", t);

        let store = Arc::new(MemoryStore::new());
        store.insert("data/f", b"content", mtime_meta(t));
        store.insert(
            "meta/f/md5sum",
            b"00000000000000000000000000000000\n",
            HashMap::new(),
        );

        let decision = oracle(store)
            .check(&local, "f", SkipLogic::Md5sum)
            .await
            .unwrap();
        assert!(!decision.skip);
        assert_eq!(decision.reason, "md5 differs");
    }

    #[tokio::test]
    async fn test_md5sum_policy_skips_when_hash_matches() {
        let dir = tempfile::tempdir().unwrap();
        let t = UNIX_EPOCH + Duration::from_secs(1380896764);
        let local = write_local(dir.path(), "f", b"content", t);

        let md5 = hex::encode(Md5::digest(b"content"));
        let store = Arc::new(MemoryStore::new());
        store.insert("data/f", b"content", mtime_meta(t));
        store.insert(
            "meta/f/md5sum",
            format!("{}\n", md5).as_bytes(),
            HashMap::new(),
        );

        let decision = oracle(store)
            .check(&local, "f", SkipLogic::Md5sum)
            .await
            .unwrap();
        assert!(decision.skip);
        assert_eq!(decision.remote_md5.as_deref(), Some(md5.as_str()));
    }
}
