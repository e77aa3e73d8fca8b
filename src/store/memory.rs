//! In-memory object store.
//!
//! Hermetic twin of the S3 backend for tests and demos. Supports scripted
//! per-key get faults (corrupt body, stall after N bytes, transient 500)
//! and records the options of every get so resume behaviour can be
//! asserted.

use super::{GetOptions, ListedObject, Listing, ObjectBody, ObjectHead, ObjectStore, PartSource};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};

const CHUNK: usize = 64 * 1024;

/// A scripted failure applied to the next get of a key.
#[derive(Debug, Clone)]
pub enum GetFault {
    /// Serve the body upper-cased; the plaintext MD5 will not match.
    CorruptUppercase,
    /// Emit the first `n` bytes of the requested range, then stall.
    StallAfter(usize),
    /// Fail immediately with an HTTP 500.
    Http500,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    user_meta: HashMap<String, String>,
    last_modified: DateTime<Utc>,
}

/// Recorded options of one get call.
#[derive(Debug, Clone)]
pub struct GetRecord {
    pub key: String,
    pub range_start: Option<u64>,
    pub if_match: Option<String>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    faults: HashMap<String, VecDeque<GetFault>>,
    gets: Vec<GetRecord>,
    deletes: Vec<String>,
}

/// In-memory [`ObjectStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fault for the next get(s) of `key`.
    pub fn push_get_fault(&self, key: &str, fault: GetFault) {
        self.inner
            .lock()
            .faults
            .entry(key.to_string())
            .or_default()
            .push_back(fault);
    }

    /// All get calls observed so far for `key`, in order.
    pub fn recorded_gets(&self, key: &str) -> Vec<GetRecord> {
        self.inner
            .lock()
            .gets
            .iter()
            .filter(|r| r.key == key)
            .cloned()
            .collect()
    }

    /// All delete calls observed so far, in order.
    pub fn recorded_deletes(&self) -> Vec<String> {
        self.inner.lock().deletes.clone()
    }

    /// Direct insertion for test setup, bypassing the put path.
    pub fn insert(&self, key: &str, data: &[u8], user_meta: HashMap<String, String>) {
        let data = Bytes::copy_from_slice(data);
        let etag = format!("\"{}\"", hex::encode(Md5::digest(&data)));
        self.inner.lock().objects.insert(
            key.to_string(),
            StoredObject {
                data,
                etag,
                user_meta,
                last_modified: Utc::now(),
            },
        );
    }

    /// Raw bytes currently stored under `key`, if any.
    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.inner.lock().objects.get(key).map(|o| o.data.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().objects.contains_key(key)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<Listing> {
        let inner = self.inner.lock();
        let mut listing = Listing::default();
        let mut seen_prefixes = std::collections::BTreeSet::new();

        for (key, obj) in inner.objects.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(d) = delimiter {
                let rest = &key[prefix.len()..];
                if let Some(idx) = rest.find(d) {
                    let common = format!("{}{}{}", prefix, &rest[..idx], d);
                    if seen_prefixes.insert(common.clone()) {
                        listing.common_prefixes.push(common);
                    }
                    continue;
                }
            }
            listing.objects.push(ListedObject {
                key: key.clone(),
                size: obj.data.len() as u64,
                last_modified: Some(obj.last_modified),
            });
        }
        Ok(listing)
    }

    async fn head(&self, key: &str) -> Result<ObjectHead> {
        let inner = self.inner.lock();
        let obj = inner
            .objects
            .get(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        Ok(ObjectHead {
            content_length: obj.data.len() as u64,
            etag: Some(obj.etag.clone()),
            user_meta: obj.user_meta.clone(),
        })
    }

    async fn get(&self, key: &str, opts: GetOptions) -> Result<ObjectBody> {
        let (obj, fault) = {
            let mut inner = self.inner.lock();
            inner.gets.push(GetRecord {
                key: key.to_string(),
                range_start: opts.range_start,
                if_match: opts.if_match.clone(),
            });
            let obj = inner
                .objects
                .get(key)
                .cloned()
                .ok_or_else(|| Error::NotFound(key.to_string()))?;
            let fault = inner
                .faults
                .get_mut(key)
                .and_then(|queue| queue.pop_front());
            (obj, fault)
        };

        if let Some(GetFault::Http500) = fault {
            return Err(Error::http(500, "injected server error"));
        }
        if let Some(expected) = opts.if_match.as_deref() {
            if expected != obj.etag {
                return Err(Error::http(412, "precondition failed"));
            }
        }

        let start = opts.range_start.unwrap_or(0) as usize;
        if start > obj.data.len() {
            return Err(Error::http(416, "range not satisfiable"));
        }
        let mut body = obj.data.slice(start..);
        if let Some(GetFault::CorruptUppercase) = fault {
            body = Bytes::from(body.to_ascii_uppercase());
        }
        let stall_after = match fault {
            Some(GetFault::StallAfter(n)) => Some(n.min(body.len())),
            _ => None,
        };

        let head = ObjectHead {
            content_length: body.len() as u64,
            etag: Some(obj.etag.clone()),
            user_meta: obj.user_meta.clone(),
        };

        let serve = match stall_after {
            Some(n) => body.slice(..n),
            None => body,
        };
        let chunks: Vec<Result<Bytes>> = serve
            .chunks(CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .chain(stall_after.map(|_| Err(Error::StallTimeout(30))))
            .collect();

        Ok(ObjectBody {
            head,
            stream: futures::stream::iter(chunks).boxed(),
        })
    }

    async fn put(
        &self,
        key: &str,
        source: &mut dyn PartSource,
        user_meta: &HashMap<String, String>,
        _concurrency: usize,
    ) -> Result<String> {
        let mut data = Vec::new();
        let mut part_md5s = Vec::new();
        let mut parts = 0usize;
        while let Some(part) = source.next_part().await? {
            part_md5s.extend_from_slice(&Md5::digest(&part));
            data.extend_from_slice(&part);
            parts += 1;
        }

        // S3 multipart ETag shape: MD5 of concatenated part MD5s, dash, count
        let etag = if parts > 1 {
            format!("\"{}-{}\"", hex::encode(Md5::digest(&part_md5s)), parts)
        } else {
            format!("\"{}\"", hex::encode(Md5::digest(&data)))
        };

        self.inner.lock().objects.insert(
            key.to_string(),
            StoredObject {
                data: Bytes::from(data),
                etag: etag.clone(),
                user_meta: user_meta.clone(),
                last_modified: Utc::now(),
            },
        );
        Ok(etag)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.deletes.push(key.to_string());
        inner.objects.remove(key);
        Ok(())
    }
}
