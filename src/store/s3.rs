//! S3 object store backend over the AWS SDK.
//!
//! The SDK owns the HTTP transport and request signing; this backend owns
//! classification (404 vs auth vs retriable), pagination, multipart
//! assembly, and the stall guard on streaming bodies. SDK-level retries are
//! disabled; retry policy belongs to the transfer pipeline.

use super::{
    stall_guard, GetOptions, ListedObject, Listing, ObjectBody, ObjectHead, ObjectStore, PartSource,
};
use crate::config::Config;
use crate::error::{Error, Result};
use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use bytes::Bytes;
use futures::stream::FuturesOrdered;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// S3 backend bound to one bucket.
pub struct S3Store {
    client: Client,
    bucket: String,
    stall_timeout: Duration,
}

impl S3Store {
    /// Build a client from configuration. Credentials must already have
    /// been validated; the region, endpoint, and path-style settings allow
    /// S3-compatible services.
    pub async fn new(config: &Config) -> Result<Self> {
        let (bucket, _) = config.bucket_and_prefix()?;

        let credentials = Credentials::new(
            config.access_key.clone().unwrap_or_default(),
            config.secret_key.clone().unwrap_or_default(),
            None,
            None,
            "sfs3-config",
        );

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .retry_config(RetryConfig::disabled())
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(Duration::from_secs(config.timeout))
                    .build(),
            );

        if let Some(ref endpoint) = config.endpoint {
            loader = loader.endpoint_url(endpoint);
        } else if !config.ssl {
            loader = loader.endpoint_url("http://s3.amazonaws.com");
        }

        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        debug!(bucket, "S3Store initialized");

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket,
            stall_timeout: Duration::from_secs(config.stall_timeout),
        })
    }
}

/// Map an SDK error to an engine error, keeping 404 distinct and folding
/// dispatch/timeout failures into the retriable transport kind.
fn classify<E>(err: SdkError<E, HttpResponse>, key: &str) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            if status == 404 {
                Error::NotFound(key.to_string())
            } else {
                Error::http(status, ctx.err().to_string())
            }
        }
        _ => Error::Transport(err.to_string()),
    }
}

/// Upload one part. Free function so concurrent part requests can own
/// their captures; the `Client` is internally reference-counted.
async fn send_part(
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    part_number: i32,
    data: Bytes,
) -> Result<CompletedPart> {
    let size = data.len();
    let out = client
        .upload_part()
        .bucket(&bucket)
        .key(&key)
        .upload_id(&upload_id)
        .part_number(part_number)
        .body(ByteStream::from(data))
        .send()
        .await
        .map_err(|e| classify(e, &key))?;

    debug!(key, part_number, size, "uploaded part");

    Ok(CompletedPart::builder()
        .set_e_tag(out.e_tag)
        .part_number(part_number)
        .build())
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<Listing> {
        let mut listing = Listing::default();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .max_keys(1000);
            if let Some(d) = delimiter {
                request = request.delimiter(d);
            }
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|e| classify(e, prefix))?;

            for object in response.contents.unwrap_or_default() {
                let Some(key) = object.key else { continue };
                listing.objects.push(ListedObject {
                    key,
                    size: object.size.unwrap_or(0).max(0) as u64,
                    last_modified: object
                        .last_modified
                        .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), 0)),
                });
            }
            for cp in response.common_prefixes.unwrap_or_default() {
                if let Some(p) = cp.prefix {
                    listing.common_prefixes.push(p);
                }
            }

            if response.is_truncated.unwrap_or(false) {
                continuation_token = response.next_continuation_token;
            } else {
                break;
            }
        }

        debug!(
            prefix,
            objects = listing.objects.len(),
            "listed bucket prefix"
        );
        Ok(listing)
    }

    async fn head(&self, key: &str) -> Result<ObjectHead> {
        let out = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, key))?;

        Ok(ObjectHead {
            content_length: out.content_length.unwrap_or(0).max(0) as u64,
            etag: out.e_tag,
            user_meta: out.metadata.unwrap_or_default(),
        })
    }

    async fn get(&self, key: &str, opts: GetOptions) -> Result<ObjectBody> {
        let mut request = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some(start) = opts.range_start {
            request = request.range(format!("bytes={}-", start));
        }
        if let Some(etag) = opts.if_match {
            request = request.if_match(etag);
        }

        let out = request.send().await.map_err(|e| classify(e, key))?;

        let head = ObjectHead {
            content_length: out.content_length.unwrap_or(0).max(0) as u64,
            etag: out.e_tag.clone(),
            user_meta: out.metadata.clone().unwrap_or_default(),
        };

        let raw = futures::stream::unfold(Some(out.body), |state| async move {
            let mut body = state?;
            match body.try_next().await {
                Ok(Some(bytes)) => Some((Ok(bytes), Some(body))),
                Ok(None) => None,
                Err(e) => Some((Err(Error::Transport(e.to_string())), None)),
            }
        })
        .boxed();

        Ok(ObjectBody {
            head,
            stream: stall_guard(raw, self.stall_timeout),
        })
    }

    async fn put(
        &self,
        key: &str,
        source: &mut dyn PartSource,
        user_meta: &HashMap<String, String>,
        concurrency: usize,
    ) -> Result<String> {
        let meta = (!user_meta.is_empty()).then(|| user_meta.clone());

        // One-part uploads (including the empty-object case) go through a
        // plain PUT; S3 rejects zero-part multiparts and multipart overhead
        // buys nothing below the part size.
        let first = source.next_part().await?.unwrap_or_default();
        let second = match source.next_part().await? {
            Some(part) => part,
            None => {
                let out = self
                    .client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .set_metadata(meta)
                    .body(ByteStream::from(first))
                    .send()
                    .await
                    .map_err(|e| classify(e, key))?;
                return Ok(out.e_tag.unwrap_or_default());
            }
        };

        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_metadata(meta)
            .send()
            .await
            .map_err(|e| classify(e, key))?;
        let upload_id = create
            .upload_id
            .ok_or_else(|| Error::Transport("no upload id returned".to_string()))?;

        match self
            .put_parts(key, &upload_id, [first, second], source, concurrency)
            .await
        {
            Ok(etag) => Ok(etag),
            Err(e) => {
                // Leave no half-assembled upload behind; the original error
                // is the one worth reporting.
                let _ = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                Err(e)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, key))?;
        debug!(key, "deleted object");
        Ok(())
    }
}

impl S3Store {
    /// Drive the part loop: the source is polled sequentially, up to
    /// `concurrency` part PUTs are in flight, and completions are collected
    /// in part order.
    async fn put_parts(
        &self,
        key: &str,
        upload_id: &str,
        head: [Bytes; 2],
        source: &mut dyn PartSource,
        concurrency: usize,
    ) -> Result<String> {
        let concurrency = concurrency.max(1);
        let mut pending: std::collections::VecDeque<Bytes> = head.into_iter().collect();
        let mut in_flight = FuturesOrdered::new();
        let mut completed: Vec<CompletedPart> = Vec::new();
        let mut part_number = 0i32;
        let mut exhausted = false;

        loop {
            while in_flight.len() < concurrency && !(exhausted && pending.is_empty()) {
                let data = match pending.pop_front() {
                    Some(d) => d,
                    None => match source.next_part().await? {
                        Some(d) => d,
                        None => {
                            exhausted = true;
                            continue;
                        }
                    },
                };
                part_number += 1;
                in_flight.push_back(send_part(
                    self.client.clone(),
                    self.bucket.clone(),
                    key.to_string(),
                    upload_id.to_string(),
                    part_number,
                    data,
                ));
            }

            match in_flight.next().await {
                Some(part) => completed.push(part?),
                None => break,
            }
        }

        let out = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify(e, key))?;

        Ok(out.e_tag.unwrap_or_default())
    }
}
