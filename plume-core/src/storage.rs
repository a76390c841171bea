use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{primitives::ByteStream, Client as S3Client};
use secrecy::ExposeSecret;

use crate::StorageConfig;

/// Put-only view of a bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `body` under `key` and returns the object's public URL.
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<String>;
}

/// Opens an [`ObjectStore`] with the credentials of one job.
#[async_trait]
pub trait StorageConnector: Send + Sync {
    async fn connect(&self, config: &StorageConfig) -> Result<Box<dyn ObjectStore>>;
}

/// Virtual-hosted style URL of an S3 object.
pub fn object_url(bucket: &str, region: &str, key: &str) -> String {
    format!("https://{bucket}.s3.{region}.amazonaws.com/{key}")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct S3Connector;

#[async_trait]
impl StorageConnector for S3Connector {
    async fn connect(&self, config: &StorageConfig) -> Result<Box<dyn ObjectStore>> {
        let credentials = aws_credential_types::Credentials::new(
            config.access_key_id.expose_secret(),
            config.secret_access_key.expose_secret(),
            None, // session token
            None, // expiry
            "plume-job",
        );
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        tracing::debug!(bucket = %config.bucket, region = %config.region, "S3 client ready");
        Ok(Box::new(S3Store {
            client: S3Client::new(&aws_config),
            bucket: config.bucket.clone(),
            region: config.region.clone(),
        }))
    }
}

pub struct S3Store {
    client: S3Client,
    bucket: String,
    region: String,
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<String> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .with_context(|| format!("failed to upload '{key}' to bucket '{}'", self.bucket))?;

        Ok(object_url(&self.bucket, &self.region, key))
    }
}
