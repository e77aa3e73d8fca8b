//! Part producers for uploads.
//!
//! Parts are produced sequentially and fully buffered: pipes cannot be
//! reopened and ciphertext cannot be regenerated, and a buffered `Bytes`
//! re-send is what a per-part retry needs. A zero-byte source still emits
//! exactly one empty part, because S3 rejects multipart uploads with no
//! parts.

use crate::error::Result;
use crate::pipeline::{post, ProgressFn, TransferEvent};
use crate::store::PartSource;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Shared rolling MD5 context. The producer side feeds it as plaintext
/// bytes leave the source; the upload finalises it for the sidecar.
#[derive(Clone, Default)]
pub struct Md5Tap {
    ctx: Arc<Mutex<Md5>>,
}

impl Md5Tap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, bytes: &[u8]) {
        self.ctx.lock().update(bytes);
    }

    /// Hex digest of everything fed so far.
    pub fn hex_digest(&self) -> String {
        hex::encode(self.ctx.lock().clone().finalize())
    }
}

/// Fixed-size parts from any byte stream (regular file, stdin pipe). The
/// reader is consumed sequentially; each part is read to `part_size`
/// before it is handed out, so the last part may be short.
pub struct ReaderParts<R> {
    reader: R,
    part_size: usize,
    tap: Option<Md5Tap>,
    emitted_any: bool,
    eof: bool,
}

impl<R: AsyncRead + Send + Unpin> ReaderParts<R> {
    pub fn new(reader: R, part_size: usize, tap: Option<Md5Tap>) -> Self {
        Self {
            reader,
            part_size: part_size.max(1),
            tap,
            emitted_any: false,
            eof: false,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin> PartSource for ReaderParts<R> {
    async fn next_part(&mut self) -> Result<Option<Bytes>> {
        if self.eof {
            return Ok(None);
        }

        let mut buf = BytesMut::with_capacity(self.part_size.min(4 * 1024 * 1024));
        while buf.len() < self.part_size {
            let n = (&mut self.reader)
                .take((self.part_size - buf.len()) as u64)
                .read_buf(&mut buf)
                .await?;
            if n == 0 {
                self.eof = true;
                break;
            }
        }

        if buf.is_empty() && self.emitted_any {
            return Ok(None);
        }

        // an empty buffer here is the zero-byte source: one empty part
        self.emitted_any = true;
        let part = buf.freeze();
        if let Some(tap) = &self.tap {
            tap.update(&part);
        }
        Ok(Some(part))
    }
}

/// Byte-counting reader: posts source-side progress as plaintext flows
/// into the part producer (or into gpg's stdin for encrypted uploads).
pub struct CountingReader<R> {
    inner: R,
    progress: Option<ProgressFn>,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R, progress: Option<ProgressFn>) -> Self {
        Self { inner, progress }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = buf.filled().len() - before;
            if n > 0 {
                post(&self.progress, TransferEvent::Bytes(n as u64));
            }
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parts_of(data: &[u8], part_size: usize) -> (Vec<Bytes>, String) {
        let tap = Md5Tap::new();
        let mut source = ReaderParts::new(data, part_size, Some(tap.clone()));
        let mut parts = Vec::new();
        while let Some(part) = source.next_part().await.unwrap() {
            parts.push(part);
        }
        (parts, tap.hex_digest())
    }

    #[tokio::test]
    async fn test_exact_multiple_of_part_size() {
        let (parts, _) = parts_of(&[7u8; 8], 4).await;
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 4);
        assert_eq!(parts[1].len(), 4);
    }

    #[tokio::test]
    async fn test_one_byte_over_threshold_makes_two_parts() {
        let (parts, _) = parts_of(&[1u8; 5], 4).await;
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].len(), 1);
    }

    #[tokio::test]
    async fn test_zero_byte_source_emits_one_empty_part() {
        let (parts, digest) = parts_of(b"", 4).await;
        assert_eq!(parts.len(), 1);
        assert!(parts[0].is_empty());
        // MD5 of the empty string
        assert_eq!(digest, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[tokio::test]
    async fn test_tap_digest_covers_all_parts() {
        let (parts, digest) = parts_of(b"The value of key-1", 7).await;
        assert_eq!(parts.len(), 3);
        assert_eq!(digest, "e28cbeebcc243df62a59d90ddfe4b3e8");
    }
}
