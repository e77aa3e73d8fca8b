//! Download path: sidecar + body combined, decrypt, verify, retry, resume.
//!
//! The `md5sum` sidecar and the content object are both required; either
//! missing fails the whole operation as `not_found`. A stalled plaintext
//! stream resumes with `Range`/`If-Match` from the current offset; any
//! other retriable failure truncates the sink and restarts the whole
//! attempt, sidecar fetch included, with exponential backoff.

use super::{post, Pipeline, ProgressFn, Sink, TransferEvent, TransferState};
use crate::crypto::GpgDecryptor;
use crate::error::{Error, Result};
use crate::meta::{META_KEYID, MD5SUM};
use crate::store::{GetOptions, ObjectHead, ObjectStore};
use futures::StreamExt;
use md5::{Digest, Md5};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// Download one object into `sink`, verifying the plaintext MD5 against
/// the sidecar. Returns the response header of the (first) successful GET
/// so the caller can restore the mtime.
pub async fn get_to_sink(
    pipe: &Pipeline,
    path: &str,
    sink: &mut dyn Sink,
    progress: Option<ProgressFn>,
) -> Result<ObjectHead> {
    post(&progress, TransferEvent::State(TransferState::Preparing));

    let mut attempt = 0u32;
    let mut backoff = pipe.opts.backoff_start;
    loop {
        post(&progress, TransferEvent::State(TransferState::Transferring));
        // both halves of the operation retry together
        let result = match pipe.meta.get_meta(path, MD5SUM).await {
            Ok(expected) => attempt_download(pipe, path, &expected, sink, &progress).await,
            Err(e) if e.is_not_found() => Err(Error::NotFound(path.to_string())),
            Err(e) => Err(e),
        };
        match result {
            Ok(head) => {
                post(&progress, TransferEvent::State(TransferState::Done));
                return Ok(head);
            }
            Err(e) if e.retriable() && attempt < pipe.opts.retries => {
                attempt += 1;
                warn!(path, attempt, error = %e, "download failed, retrying");
                post(&progress, TransferEvent::State(TransferState::Retrying(attempt)));
                sink.truncate().await?;
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                post(&progress, TransferEvent::State(TransferState::Failed));
                return Err(e.in_phase("get_file"));
            }
        }
    }
}

/// One full attempt, including stall resumes for plaintext streams.
async fn attempt_download(
    pipe: &Pipeline,
    path: &str,
    expected: &str,
    sink: &mut dyn Sink,
    progress: &Option<ProgressFn>,
) -> Result<ObjectHead> {
    let data_key = pipe.meta.data_key(path);
    let mut md5 = Md5::new();
    let mut written = 0u64;
    let mut first_head: Option<ObjectHead> = None;
    let mut last_stall_at: Option<u64> = None;

    loop {
        let opts = GetOptions {
            range_start: (written > 0).then_some(written),
            // a resumed fetch must still be reading the same object
            if_match: first_head.as_ref().and_then(|h| h.etag.clone()),
        };
        let resumed = opts.range_start.is_some();
        let body = pipe.store.get(&data_key, opts).await.map_err(|e| {
            if let Error::NotFound(_) = e {
                Error::NotFound(path.to_string())
            } else {
                e
            }
        })?;

        let head = body.head;
        let encrypted = head.user_meta.contains_key(META_KEYID);
        if first_head.is_none() {
            first_head = Some(head);
        }

        if encrypted {
            // gpg state cannot be re-entered mid-cipher, so encrypted
            // bodies never resume; a stall surfaces through finish() and
            // restarts the attempt from zero.
            let cb = progress.clone();
            let wire_progress: Option<Arc<dyn Fn(u64) + Send + Sync>> = cb.map(|cb| {
                Arc::new(move |n: u64| cb(TransferEvent::Bytes(n)))
                    as Arc<dyn Fn(u64) + Send + Sync>
            });
            let mut decryptor =
                GpgDecryptor::spawn(body.stream, pipe.crypto.agent.as_deref(), wire_progress)?;
            let mut plaintext = decryptor.take_stdout();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = plaintext.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                md5.update(&buf[..n]);
                sink.write(&buf[..n]).await?;
            }
            decryptor.finish().await?;
            break;
        }

        let mut stream = body.stream;
        let mut stalled = false;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    md5.update(&bytes);
                    sink.write(&bytes).await?;
                    written += bytes.len() as u64;
                    post(progress, TransferEvent::Bytes(bytes.len() as u64));
                }
                Err(e) if e.is_stall() => {
                    stalled = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        if stalled {
            // a stall after the final byte needs no resume; the MD5 check
            // below decides whether the object is whole
            if let Some(head) = &first_head {
                if written >= head.content_length {
                    break;
                }
            }
            // a stall that moved no bytes since the last one is handed to
            // the outer retry loop instead of resuming forever
            if last_stall_at == Some(written) {
                return Err(Error::StallTimeout(pipe.opts.stall_timeout.as_secs()));
            }
            last_stall_at = Some(written);
            debug!(path, offset = written, resumed, "stall, resuming with range");
            continue;
        }
        break;
    }

    post(progress, TransferEvent::State(TransferState::Verifying));
    sink.finish().await?;

    let got = hex::encode(md5.finalize());
    if got != expected {
        return Err(Error::Md5Mismatch {
            path: path.to_string(),
            expected: expected.to_string(),
            got,
        });
    }

    // first_head is always set once a GET succeeded
    Ok(first_head.unwrap_or_default())
}
