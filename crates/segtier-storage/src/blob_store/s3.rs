//! AWS S3 implementation of BlobStore
//!
//! Uploads map onto S3 multipart uploads: `write` buffers and ships parts,
//! `commit` completes the multipart upload and `abort` aborts it.

use super::{validate_key, BlobStore, ByteStream, ObjectInfo, Upload};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream as S3Body;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use aws_sdk_s3::{Client, Config};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::StreamExt;
use segtier_core::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// S3 rejects non-final parts smaller than 5 MiB.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Where the cold bucket lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    pub region: String,
    /// Endpoint override; `None` talks to AWS with ambient credentials.
    pub endpoint: Option<S3Endpoint>,
}

/// S3-compatible endpoint reached with static credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Endpoint {
    pub url: String,
    pub access_key: String,
    pub secret_key: String,
}

impl S3Config {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            endpoint: None,
        }
    }

    /// Use a non-AWS endpoint. Addressing switches to path style.
    pub fn with_endpoint(
        mut self,
        url: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        self.endpoint = Some(S3Endpoint {
            url: url.into(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        });
        self
    }
}

/// Cold tier on S3; uploads are multipart uploads.
pub struct S3BlobStore {
    client: Client,
    region: String,
}

impl S3BlobStore {
    /// Build the client. No request is made until the first operation.
    pub async fn new(config: S3Config) -> CoreResult<Self> {
        let region = aws_sdk_s3::config::Region::new(config.region.clone());
        let client = match &config.endpoint {
            Some(endpoint) => {
                let creds = Credentials::new(
                    &endpoint.access_key,
                    &endpoint.secret_key,
                    None,
                    None,
                    "segtier-static",
                );
                let s3_config = Config::builder()
                    .endpoint_url(&endpoint.url)
                    .credentials_provider(creds)
                    .region(region)
                    .force_path_style(true)
                    .behavior_version(BehaviorVersion::latest())
                    .build();
                Client::from_conf(s3_config)
            }
            None => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                Client::new(&shared)
            }
        };

        Ok(Self {
            client,
            region: config.region,
        })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn ensure_bucket(&self, bucket: &str) -> CoreResult<()> {
        if self.client.head_bucket().bucket(bucket).send().await.is_ok() {
            return Ok(());
        }

        let mut request = self.client.create_bucket().bucket(bucket);
        // us-east-1 rejects an explicit location constraint.
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_bucket_already_owned_by_you()) =>
            {
                Ok(())
            }
            Err(e) => Err(CoreError::StorageError(format!(
                "S3 create bucket failed: {}",
                e
            ))),
        }
    }

    async fn upload_object(&self, bucket: &str, key: &str) -> CoreResult<Box<dyn Upload>> {
        validate_key(key)?;

        let resp = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type("application/gzip")
            .send()
            .await
            .map_err(|e| CoreError::StorageError(format!("S3 create upload failed: {}", e)))?;

        let upload_id = resp
            .upload_id()
            .ok_or_else(|| CoreError::StorageError("S3 returned no upload id".to_string()))?
            .to_string();

        Ok(Box::new(S3Upload {
            client: self.client.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id,
            buffer: BytesMut::new(),
            parts: Vec::new(),
            finished: false,
        }))
    }

    async fn download_object(&self, bucket: &str, key: &str) -> CoreResult<ByteStream> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    CoreError::not_found("object", key)
                } else {
                    CoreError::StorageError(format!("S3 get failed: {}", e))
                }
            })?;

        let stream = futures::stream::try_unfold(resp.body, |mut body| async move {
            match body.try_next().await {
                Ok(Some(chunk)) => Ok(Some((chunk, body))),
                Ok(None) => Ok(None),
                Err(e) => Err(CoreError::StorageError(format!("S3 read failed: {}", e))),
            }
        });
        Ok(stream.boxed())
    }

    async fn list_objects(&self, bucket: &str) -> CoreResult<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| CoreError::StorageError(format!("S3 list failed: {}", e)))?;

            objects.extend(resp.contents().iter().filter_map(|obj| {
                let key = obj.key()?.to_string();
                let last_modified = obj
                    .last_modified()
                    .and_then(|dt| chrono::DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
                    .unwrap_or_else(Utc::now);

                Some(ObjectInfo {
                    key,
                    size_bytes: obj.size().unwrap_or(0).max(0) as u64,
                    last_modified,
                })
            }));

            match resp.next_continuation_token() {
                Some(token) if resp.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(objects)
    }

    async fn close(&self) -> CoreResult<()> {
        Ok(())
    }
}

struct S3Upload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    buffer: BytesMut,
    parts: Vec<CompletedPart>,
    finished: bool,
}

impl S3Upload {
    fn ensure_open(&self) -> CoreResult<()> {
        if self.finished {
            return Err(CoreError::already_finished(&self.key));
        }
        Ok(())
    }

    async fn upload_part(&mut self, data: Bytes) -> CoreResult<()> {
        let part_number = self.parts.len() as i32 + 1;
        let resp = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .body(S3Body::from(data))
            .send()
            .await
            .map_err(|e| CoreError::StorageError(format!("S3 upload part failed: {}", e)))?;

        self.parts.push(
            CompletedPart::builder()
                .set_e_tag(resp.e_tag().map(str::to_string))
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }
}

#[async_trait]
impl Upload for S3Upload {
    fn key(&self) -> &str {
        &self.key
    }

    async fn write(&mut self, chunk: Bytes) -> CoreResult<()> {
        self.ensure_open()?;
        self.buffer.extend_from_slice(&chunk);
        while self.buffer.len() >= MIN_PART_SIZE {
            let part = self.buffer.split_to(MIN_PART_SIZE).freeze();
            self.upload_part(part).await?;
        }
        Ok(())
    }

    async fn commit(&mut self) -> CoreResult<()> {
        self.ensure_open()?;

        // The final part may be short (or empty for an empty object).
        if !self.buffer.is_empty() || self.parts.is_empty() {
            let part = self.buffer.split().freeze();
            self.upload_part(part).await?;
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(self.parts.clone()))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| CoreError::StorageError(format!("S3 complete upload failed: {}", e)))?;

        self.finished = true;
        tracing::debug!(key = %self.key, parts = self.parts.len(), "S3 upload completed");
        Ok(())
    }

    async fn abort(&mut self) -> CoreResult<()> {
        self.ensure_open()?;

        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
            .map_err(|e| CoreError::StorageError(format!("S3 abort upload failed: {}", e)))?;

        self.finished = true;
        self.buffer.clear();
        Ok(())
    }
}
