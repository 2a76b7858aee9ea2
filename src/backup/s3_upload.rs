// housekeeper/src/backup/s3_upload.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use bytes::{Bytes, BytesMut};
use s3::config::Region;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::RemoteConfig;
use crate::errors::HousekeeperError;

/// S3 rejects non-final parts smaller than 5 MiB.
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Remote destination that accepts one object as a stream of chunks of unknown total size.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads everything received on `chunks` as object `name` until the sender side is
    /// dropped. On error the receiver is dropped, so pending senders observe a closed channel.
    async fn put_stream(&self, name: &str, chunks: mpsc::Receiver<Bytes>) -> Result<()>;
}

/// S3-compatible bucket (AWS, DigitalOcean Spaces, MinIO, ...).
pub struct S3Store {
    client: s3::Client,
    remote: RemoteConfig,
}

impl S3Store {
    pub async fn connect(remote: &RemoteConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(remote.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &remote.access_key_id,
                &remote.secret_access_key,
                None,
                None,
                "Static",
            ));
        if !remote.endpoint_url.is_empty() {
            loader = loader.endpoint_url(&remote.endpoint_url);
        }
        let sdk_config = loader.load().await;

        // custom endpoints are mostly self-hosted and rarely support virtual hosted buckets
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(!remote.endpoint_url.is_empty())
            .build();

        info!(bucket = %remote.bucket_name, region = %remote.region, "S3 client configured");
        Ok(Self {
            client: s3::Client::from_conf(s3_config),
            remote: remote.clone(),
        })
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        mut chunks: mpsc::Receiver<Bytes>,
    ) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut buffer = BytesMut::with_capacity(PART_SIZE);

        while let Some(chunk) = chunks.recv().await {
            buffer.extend_from_slice(&chunk);
            if buffer.len() >= PART_SIZE {
                let part = buffer.split().freeze();
                parts.push(self.upload_part(key, upload_id, parts.len() + 1, part).await?);
            }
        }
        if !buffer.is_empty() || parts.is_empty() {
            let part = buffer.split().freeze();
            parts.push(self.upload_part(key, upload_id, parts.len() + 1, part).await?);
        }
        Ok(parts)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: usize,
        data: Bytes,
    ) -> Result<CompletedPart> {
        let size = data.len();
        let response = self
            .client
            .upload_part()
            .bucket(&self.remote.bucket_name)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|| format!("Failed to upload part {} of {}", part_number, key))?;

        let etag = response
            .e_tag()
            .with_context(|| format!("No ETag returned for part {} of {}", part_number, key))?;
        debug!(key = %key, part_number, size, "Uploaded part");

        Ok(CompletedPart::builder()
            .part_number(part_number as i32)
            .e_tag(etag)
            .build())
    }

    async fn abort(&self, key: &str, upload_id: &str) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.remote.bucket_name)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;
        match result {
            Ok(_) => warn!(key = %key, upload_id = %upload_id, "Aborted multipart upload"),
            Err(e) => warn!(key = %key, error = %e, "Failed to abort multipart upload"),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_stream(&self, name: &str, chunks: mpsc::Receiver<Bytes>) -> Result<()> {
        let key = self.remote.object_key(name);
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.remote.bucket_name)
            .key(&key)
            .send()
            .await
            .with_context(|| {
                format!(
                    "Failed to start upload to S3 bucket {} with key {}",
                    self.remote.bucket_name, key
                )
            })?;
        let upload_id = response
            .upload_id()
            .ok_or_else(|| HousekeeperError::Upload(format!("no upload ID returned for {}", key)))?
            .to_string();
        debug!(key = %key, upload_id = %upload_id, "Started multipart upload");

        let parts = match self.upload_parts(&key, &upload_id, chunks).await {
            Ok(parts) => parts,
            Err(e) => {
                self.abort(&key, &upload_id).await;
                return Err(e);
            }
        };
        let part_count = parts.len();

        let completed = self
            .client
            .complete_multipart_upload()
            .bucket(&self.remote.bucket_name)
            .key(&key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await;
        if let Err(e) = completed {
            self.abort(&key, &upload_id).await;
            return Err(e).with_context(|| {
                format!(
                    "Failed to complete upload to S3 bucket {} with key {}",
                    self.remote.bucket_name, key
                )
            });
        }

        info!(bucket = %self.remote.bucket_name, key = %key, parts = part_count, "Upload finished");
        Ok(())
    }
}
