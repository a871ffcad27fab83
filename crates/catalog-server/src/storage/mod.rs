use anyhow::{anyhow, Context, Result};
use aws_sdk_s3::{
    config::{Credentials, Region},
    presigning::PresigningConfig,
    primitives::ByteStream,
    Client,
};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub mod config;

/// S3-compatible object storage for catalog uploads
#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
    upload_prefix: String,
    presign_expiry: Duration,
}

impl Storage {
    pub async fn new(config: config::StorageConfig) -> Result<Self> {
        debug!(bucket = %config.bucket, endpoint = ?config.endpoint, "Initializing storage");

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "catalog-storage",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("Storage client initialized for bucket: {}", config.bucket);

        Ok(Self {
            client,
            bucket: config.bucket,
            upload_prefix: config.upload_prefix,
            presign_expiry: Duration::from_secs(config.presign_expiry_secs),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Object key a client uploads the CSV for `job_id` to.
    pub fn upload_key(&self, job_id: Uuid) -> String {
        build_upload_key(&self.upload_prefix, job_id)
    }

    #[instrument(skip(self))]
    pub async fn download_stream(&self, key: &str) -> Result<ByteStream> {
        debug!("Getting stream from s3://{}/{}", self.bucket, key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context(format!("Failed to get stream from S3: {}", key))?;

        Ok(response.body)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<()> {
        debug!("Deleting s3://{}/{}", self.bucket, key);

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context(format!("Failed to delete from S3: {}", key))?;

        info!("Deleted s3://{}/{}", self.bucket, key);

        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let message = e.to_string();
                if message.contains("NotFound") || message.contains("404") {
                    Ok(false)
                } else {
                    Err(anyhow!("Failed to check S3 object existence: {}", message))
                }
            },
        }
    }

    /// Presigned PUT URL the client uploads the CSV body to.
    #[instrument(skip(self))]
    pub async fn presigned_upload_url(&self, key: &str) -> Result<String> {
        let presigning_config = PresigningConfig::expires_in(self.presign_expiry)
            .context("Failed to create presigning config")?;

        let presigned_request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("text/csv")
            .presigned(presigning_config)
            .await
            .context("Failed to generate presigned upload URL")?;

        Ok(presigned_request.uri().to_string())
    }

    pub fn presign_expiry(&self) -> Duration {
        self.presign_expiry
    }
}

fn build_upload_key(prefix: &str, job_id: Uuid) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}.csv", job_id)
    } else {
        format!("{}/{}.csv", prefix, job_id)
    }
}
