// cacti/src/backup/s3_upload.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::{ByteStream, Length};
use s3::types::{CompletedMultipartUpload, CompletedPart, ObjectCannedAcl, ServerSideEncryption};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::{StorageConfig, UploadTarget};
use crate::errors::BackupError;

/// One object write: a local file streamed to `bucket/key`.
#[derive(Debug, Clone, Copy)]
pub struct PutObject<'a> {
    pub target: UploadTarget<'a>,
    pub key: &'a str,
    pub file: &'a Path,
}

/// Confirmation returned once the storage service acknowledged a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub bucket: String,
    pub key: String,
    pub location: String,
    pub e_tag: Option<String>,
}

/// Object storage the upload stage writes to. Objects are written private and encrypted at rest.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, request: PutObject<'_>) -> Result<UploadReceipt>;
}

/// S3 or any S3-compatible service (DigitalOcean Spaces, MinIO, ...).
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    region: String,
    endpoint_url: Option<String>,
}

impl S3ObjectStore {
    pub fn new(region: impl Into<String>, endpoint_url: Option<String>) -> Self {
        Self {
            region: region.into(),
            endpoint_url,
        }
    }

    pub fn from_config(storage: &StorageConfig) -> Self {
        Self::new(storage.region.clone(), storage.endpoint_url.clone())
    }

    async fn client(&self, target: &UploadTarget<'_>) -> s3::Client {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                target.access_key_id,
                target.secret_access_key,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        if let Some(endpoint) = &self.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        s3::Client::new(&sdk_config)
    }
}

/// Files at or above this size are sent as a multipart upload.
pub const MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;
/// Size of every multipart part except possibly the last.
pub const PART_SIZE: u64 = 64 * 1024 * 1024;

/// One slice of a file sent as a single multipart part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub number: i32,
    pub offset: u64,
    pub length: u64,
}

/// Splits `total` bytes into consecutive `part_size` slices, numbered from 1.
pub fn plan_parts(total: u64, part_size: u64) -> Vec<PartRange> {
    let part_size = part_size.max(1);
    let mut parts = Vec::new();
    let mut offset = 0;
    let mut number = 1;
    while offset < total {
        let length = part_size.min(total - offset);
        parts.push(PartRange {
            number,
            offset,
            length,
        });
        offset += length;
        number += 1;
    }
    parts
}

impl S3ObjectStore {
    fn location(&self, request: &PutObject<'_>) -> String {
        match &self.endpoint_url {
            Some(endpoint) => format!(
                "{}/{}/{}",
                endpoint.trim_end_matches('/'),
                request.target.bucket_name,
                request.key
            ),
            None => format!("s3://{}/{}", request.target.bucket_name, request.key),
        }
    }

    async fn put_single(&self, client: &s3::Client, request: &PutObject<'_>) -> Result<Option<String>> {
        let body = ByteStream::from_path(request.file)
            .await
            .with_context(|| {
                format!(
                    "Failed to create ByteStream from file: {}",
                    request.file.display()
                )
            })?;

        let output = client
            .put_object()
            .bucket(request.target.bucket_name)
            .key(request.key)
            .acl(ObjectCannedAcl::Private)
            .server_side_encryption(ServerSideEncryption::Aes256)
            .body(body)
            .send()
            .await
            .with_context(|| {
                format!(
                    "Failed to upload file {} to S3 bucket {} with key {}",
                    request.file.display(),
                    request.target.bucket_name,
                    request.key
                )
            })?;
        Ok(output.e_tag().map(str::to_string))
    }

    async fn put_multipart(
        &self,
        client: &s3::Client,
        request: &PutObject<'_>,
        size: u64,
    ) -> Result<Option<String>> {
        let created = client
            .create_multipart_upload()
            .bucket(request.target.bucket_name)
            .key(request.key)
            .acl(ObjectCannedAcl::Private)
            .server_side_encryption(ServerSideEncryption::Aes256)
            .send()
            .await
            .with_context(|| {
                format!(
                    "Failed to start multipart upload to S3 bucket {} with key {}",
                    request.target.bucket_name, request.key
                )
            })?;
        let upload_id = created
            .upload_id()
            .context("S3 did not return a multipart upload id")?
            .to_string();

        match self.send_parts(client, request, &upload_id, size).await {
            Ok(e_tag) => Ok(e_tag),
            Err(e) => {
                if let Err(abort) = client
                    .abort_multipart_upload()
                    .bucket(request.target.bucket_name)
                    .key(request.key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = request.key,
                        upload_id = %upload_id,
                        error = %abort,
                        "failed to abort multipart upload, parts may be left behind"
                    );
                }
                Err(e)
            }
        }
    }

    async fn send_parts(
        &self,
        client: &s3::Client,
        request: &PutObject<'_>,
        upload_id: &str,
        size: u64,
    ) -> Result<Option<String>> {
        let mut completed = Vec::new();
        for part in plan_parts(size, PART_SIZE) {
            let body = ByteStream::read_from()
                .path(request.file)
                .offset(part.offset)
                .length(Length::Exact(part.length))
                .build()
                .await
                .with_context(|| {
                    format!(
                        "Failed to read part {} of {}",
                        part.number,
                        request.file.display()
                    )
                })?;
            let output = client
                .upload_part()
                .bucket(request.target.bucket_name)
                .key(request.key)
                .upload_id(upload_id)
                .part_number(part.number)
                .body(body)
                .send()
                .await
                .with_context(|| format!("Failed to upload part {} of {}", part.number, request.key))?;
            debug!(key = request.key, part = part.number, "uploaded part");
            completed.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .part_number(part.number)
                    .build(),
            );
        }

        let output = client
            .complete_multipart_upload()
            .bucket(request.target.bucket_name)
            .key(request.key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .with_context(|| format!("Failed to complete multipart upload of {}", request.key))?;
        Ok(output.e_tag().map(str::to_string))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, request: PutObject<'_>) -> Result<UploadReceipt> {
        let client = self.client(&request.target).await;
        let size = tokio::fs::metadata(request.file)
            .await
            .with_context(|| format!("Failed to stat {}", request.file.display()))?
            .len();

        let e_tag = if size >= MULTIPART_THRESHOLD {
            info!(key = request.key, size, "using multipart upload");
            self.put_multipart(&client, &request, size).await?
        } else {
            self.put_single(&client, &request).await?
        };

        Ok(UploadReceipt {
            bucket: request.target.bucket_name.to_string(),
            key: request.key.to_string(),
            location: self.location(&request),
            e_tag,
        })
    }
}

/// `<base directory><task directory>/<file base name>`.
pub fn storage_key(base_directory: &str, task_directory: &str, file: &Path) -> String {
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}{}/{}", base_directory, task_directory, file_name)
}

/// Streams finished snapshots to object storage and removes them locally once stored.
pub struct UploadStage<'a> {
    storage: &'a StorageConfig,
    base_directory: &'a str,
    store: &'a dyn ObjectStore,
}

impl<'a> UploadStage<'a> {
    pub fn new(storage: &'a StorageConfig, base_directory: &'a str, store: &'a dyn ObjectStore) -> Self {
        Self {
            storage,
            base_directory,
            store,
        }
    }

    /// Uploads `file` under `task_directory`.
    ///
    /// The local file is deleted only after the store acknowledged the write; any
    /// failure leaves it in place.
    pub async fn upload(&self, task_directory: &str, file: &Path) -> crate::errors::Result<UploadReceipt> {
        let target = self.storage.upload_target()?;
        let key = storage_key(self.base_directory, task_directory, file);
        info!(
            file = %file.display(),
            bucket = target.bucket_name,
            key = %key,
            "uploading snapshot"
        );

        let receipt = self
            .store
            .put_object(PutObject {
                target,
                key: &key,
                file,
            })
            .await
            .map_err(|e| BackupError::UploadFailed {
                file: file.to_path_buf(),
                key: key.clone(),
                detail: format!("{:#}", e),
            })?;

        if let Err(e) = tokio::fs::remove_file(file).await {
            warn!(
                file = %file.display(),
                error = %e,
                "uploaded snapshot could not be removed locally"
            );
        }
        info!(
            bucket = %receipt.bucket,
            location = %receipt.location,
            e_tag = ?receipt.e_tag,
            "✅ snapshot uploaded"
        );
        Ok(receipt)
    }
}
