//! Upload path: source bytes → parts → content object → sidecars.
//!
//! The sidecar writes happen strictly after the content PUT succeeds; a
//! failed content PUT leaves no sidecar behind. Failures carry the phase
//! they occurred in (`put_parts` or `put_meta`).

use super::parts::{CountingReader, Md5Tap, ReaderParts};
use super::{post, Pipeline, ProgressFn, TransferEvent, TransferState};
use crate::crypto::GpgEncryptParts;
use crate::error::Result;
use crate::meta::{self, CRYPTOKEY, MD5SUM};
use crate::store::ObjectStore;
use std::collections::HashMap;
use std::time::SystemTime;
use tokio::io::AsyncRead;
use tracing::{debug, info};

/// Sidecar value marking the GPG scheme (no caller-visible IV).
const GPG_CRYPTOKEY: &str = "gpg:";

/// Upload one object from a sequential byte source.
pub async fn put_from_source<R>(
    pipe: &Pipeline,
    reader: R,
    mtime: Option<SystemTime>,
    path: &str,
    progress: Option<ProgressFn>,
) -> Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    post(&progress, TransferEvent::State(TransferState::Preparing));

    let keyid = pipe.crypto.keyid.clone();
    let mut user_meta = HashMap::new();
    if let Some(t) = mtime {
        user_meta.insert(meta::META_MTIME.to_string(), meta::format_mtime(t));
    }
    if let Some(k) = &keyid {
        user_meta.insert(meta::META_KEYID.to_string(), k.clone());
    }

    let tap = Md5Tap::new();
    let data_key = pipe.meta.data_key(path);
    let part_size = pipe.opts.part_size as usize;
    let reader = CountingReader::new(reader, progress.clone());

    post(&progress, TransferEvent::State(TransferState::Transferring));

    let etag = match &keyid {
        Some(keyid) => {
            let mut source = GpgEncryptParts::spawn(reader, keyid, part_size, tap.clone())?;
            pipe.store
                .put(&data_key, &mut source, &user_meta, pipe.opts.concurrency)
                .await
        }
        None => {
            let mut source = ReaderParts::new(reader, part_size, Some(tap.clone()));
            pipe.store
                .put(&data_key, &mut source, &user_meta, pipe.opts.concurrency)
                .await
        }
    }
    .map_err(|e| {
        post(&progress, TransferEvent::State(TransferState::Failed));
        e.in_phase("put_parts")
    })?;

    let md5 = tap.hex_digest();
    debug!(path, etag, md5, "content object stored");

    let sidecars = async {
        pipe.meta.put_meta(path, MD5SUM, &md5).await?;
        if keyid.is_some() {
            pipe.meta.put_meta(path, CRYPTOKEY, GPG_CRYPTOKEY).await
        } else {
            // a plaintext overwrite of a formerly encrypted object must not
            // leave a stale cryptokey behind
            pipe.meta.delete_meta(path, CRYPTOKEY).await
        }
    };
    if let Err(e) = sidecars.await {
        post(&progress, TransferEvent::State(TransferState::Failed));
        return Err(e.in_phase("put_meta"));
    }

    post(&progress, TransferEvent::State(TransferState::Done));
    info!(path, encrypted = keyid.is_some(), "upload complete");
    Ok(())
}
