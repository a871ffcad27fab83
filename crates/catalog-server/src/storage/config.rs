use serde::{Deserialize, Serialize};
use std::env;

/// Presigned upload URLs stay valid this long by default.
pub const DEFAULT_PRESIGN_EXPIRY_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
    /// Key prefix for staged catalog uploads
    pub upload_prefix: String,
    pub presign_expiry_secs: u64,
}

impl StorageConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bucket = env::var("S3_BUCKET")
            .map_err(|_| anyhow::anyhow!("S3_BUCKET must be set to enable remote uploads"))?;

        Ok(Self {
            endpoint: env::var("S3_ENDPOINT").ok(),
            region: env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            bucket,
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .unwrap_or_else(|_| "minioadmin".to_string()),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .unwrap_or_else(|_| "minioadmin".to_string()),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            upload_prefix: env::var("S3_UPLOAD_PREFIX").unwrap_or_else(|_| "uploads".to_string()),
            presign_expiry_secs: env::var("S3_PRESIGN_EXPIRY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PRESIGN_EXPIRY_SECS),
        })
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: "us-east-1".to_string(),
            bucket: bucket.into(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: true,
            upload_prefix: "uploads".to_string(),
            presign_expiry_secs: DEFAULT_PRESIGN_EXPIRY_SECS,
        }
    }
}
