use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use uuid::Uuid;

use crate::config::AppConfig;

pub const SNAPSHOT_CONTENT_TYPE: &str = "application/octet-stream";

/// Storage key for a snapshot of `document_id` taken at `seq`.
pub fn snapshot_key(document_id: Uuid, seq: i64) -> String {
    format!("docs/{document_id}/snapshots/{seq}.bin")
}

#[async_trait]
pub trait ObjectStorage: Send + Sync + 'static {
    async fn put_object(&self, key: &str, bytes: Vec<u8>, content_type: Option<String>)
        -> Result<()>;

    /// Returns `Ok(None)` when the key does not exist; `Err` is reserved for
    /// transport or configuration failures.
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn delete_object(&self, key: &str) -> Result<()>;
}

pub struct S3Storage {
    client: S3Client,
    bucket: String,
}

impl S3Storage {
    /// Builds a client for the configured bucket. Static credentials take
    /// precedence over the ambient AWS chain; a custom endpoint (MinIO
    /// style) switches the client to path-style addressing, since
    /// virtual-hosted bucket DNS rarely exists there.
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let bucket = config
            .blob_bucket
            .clone()
            .context("BLOB_BUCKET is not configured")?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.blob_region.clone()));
        if let (Some(key_id), Some(secret)) = (
            &config.blob_access_key_id,
            &config.blob_secret_access_key,
        ) {
            loader = loader
                .credentials_provider(Credentials::new(
                    key_id.clone(),
                    secret.clone(),
                    None,
                    None,
                    "coderoom-config",
                ));
        }
        let shared = loader.load().await;

        let mut builder = S3ConfigBuilder::from(&shared);
        if let Some(endpoint) = &config.blob_endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: S3Client::from_conf(builder.build()),
            bucket,
        })
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
    ) -> Result<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes));

        if let Some(content_type) = content_type {
            request = request.content_type(content_type);
        }

        request
            .send()
            .await
            .context("failed to upload object to blob storage")?;

        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|service| service.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Ok(None);
                }
                return Err(err).context("failed to download object from blob storage");
            }
        };

        let bytes = response
            .body
            .collect()
            .await
            .context("failed to read object stream")?
            .into_bytes()
            .to_vec();

        Ok(Some(bytes))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("failed to delete object from blob storage")?;
        Ok(())
    }
}
