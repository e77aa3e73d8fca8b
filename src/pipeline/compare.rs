//! Compare path: stream the remote object against a local file and report
//! the first divergence. Checks run cheapest-first: size, then mtime, then
//! a byte-for-byte stream comparison. Retries follow the download rules.

use super::Pipeline;
use crate::crypto::GpgDecryptor;
use crate::error::{Error, Result};
use crate::meta::{self, META_KEYID, META_MTIME};
use crate::store::{GetOptions, ObjectStore};
use futures::StreamExt;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};
use tokio::io::AsyncReadExt;
use tracing::warn;

/// The first difference found between remote and local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divergence {
    /// Content-Length differs from the local file size.
    Size { remote: u64, local: u64 },
    /// The `Mtime` header differs from the local mtime (second precision).
    Mtime,
    /// Bodies differ, first at this plaintext offset.
    Bytes { offset: u64 },
}

impl std::fmt::Display for Divergence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Divergence::Size { remote, local } => {
                write!(f, "size differs (remote {}, local {})", remote, local)
            }
            Divergence::Mtime => write!(f, "mtime differs"),
            Divergence::Bytes { offset } => write!(f, "content differs at byte {}", offset),
        }
    }
}

/// Compare the remote object at `path` with the local file.
/// `Ok(None)` means identical.
pub async fn compare_to_local(
    pipe: &Pipeline,
    path: &str,
    local: &Path,
) -> Result<Option<Divergence>> {
    let mut attempt = 0u32;
    let mut backoff = pipe.opts.backoff_start;
    loop {
        match attempt_compare(pipe, path, local).await {
            Ok(result) => return Ok(result),
            Err(e) if e.retriable() && attempt < pipe.opts.retries => {
                attempt += 1;
                warn!(path, attempt, error = %e, "compare failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn attempt_compare(pipe: &Pipeline, path: &str, local: &Path) -> Result<Option<Divergence>> {
    let local_meta = tokio::fs::metadata(local).await?;
    let data_key = pipe.meta.data_key(path);
    let body = pipe.store.get(&data_key, GetOptions::default()).await?;
    let head = body.head;
    let encrypted = head.user_meta.contains_key(META_KEYID);

    // Content-Length is ciphertext length for encrypted objects, so the
    // size short-circuit only applies to plaintext ones.
    if !encrypted && head.content_length != local_meta.len() {
        return Ok(Some(Divergence::Size {
            remote: head.content_length,
            local: local_meta.len(),
        }));
    }

    if let Some(remote_mtime) = head.user_meta.get(META_MTIME).and_then(|v| meta::parse_mtime(v)) {
        let local_secs = local_meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let remote_secs = remote_mtime
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        if remote_secs != local_secs {
            return Ok(Some(Divergence::Mtime));
        }
    }

    let mut file = tokio::fs::File::open(local).await?;
    if encrypted {
        let mut decryptor = GpgDecryptor::spawn(body.stream, pipe.crypto.agent.as_deref(), None)?;
        let mut plaintext = decryptor.take_stdout();
        let result = diverging_offset(&mut plaintext, &mut file).await?;
        decryptor.finish().await?;
        Ok(result.map(|offset| Divergence::Bytes { offset }))
    } else {
        let mut remote = tokio_util::io::StreamReader::new(
            body.stream
                .map(|r| r.map_err(|e| std::io::Error::other(e.to_string()))),
        );
        let result = diverging_offset(&mut remote, &mut file).await?;
        Ok(result.map(|offset| Divergence::Bytes { offset }))
    }
}

/// First offset at which the two streams differ, or `None` when they are
/// byte-for-byte identical including length.
async fn diverging_offset<A, B>(a: &mut A, b: &mut B) -> Result<Option<u64>>
where
    A: tokio::io::AsyncRead + Unpin,
    B: tokio::io::AsyncRead + Unpin,
{
    let mut buf_a = vec![0u8; 64 * 1024];
    let mut buf_b = vec![0u8; 64 * 1024];
    let mut offset = 0u64;

    loop {
        let n_a = read_full(a, &mut buf_a).await?;
        let n_b = read_full(b, &mut buf_b).await?;
        let common = n_a.min(n_b);
        for i in 0..common {
            if buf_a[i] != buf_b[i] {
                return Ok(Some(offset + i as u64));
            }
        }
        if n_a != n_b {
            return Ok(Some(offset + common as u64));
        }
        if n_a == 0 {
            return Ok(None);
        }
        offset += n_a as u64;
    }
}

/// Read until the buffer is full or EOF.
async fn read_full<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_diverging_offset_identical() {
        let a = b"same bytes".as_slice();
        let b = b"same bytes".as_slice();
        assert_eq!(
            diverging_offset(&mut { a }, &mut { b }).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_diverging_offset_middle() {
        let a = b"same Xytes".as_slice();
        let b = b"same bytes".as_slice();
        assert_eq!(
            diverging_offset(&mut { a }, &mut { b }).await.unwrap(),
            Some(5)
        );
    }

    #[tokio::test]
    async fn test_diverging_offset_length() {
        let a = b"short".as_slice();
        let b = b"short and more".as_slice();
        assert_eq!(
            diverging_offset(&mut { a }, &mut { b }).await.unwrap(),
            Some(5)
        );
    }
}
