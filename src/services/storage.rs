use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::collections::BTreeMap;

/// Key/value object storage the publisher writes artifacts into.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key`, overwriting any previous object, and return
    /// its durable locator.
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String, StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Locator an object stored under `key` will have.
    fn locator(&self, key: &str) -> String;
}

/// S3-compatible object storage (AWS, R2, MinIO).
pub struct S3ObjectStore {
    bucket: Box<Bucket>,
}

impl S3ObjectStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self { bucket })
    }

    pub fn bucket_name(&self) -> String {
        self.bucket.name()
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String, StorageError> {
        // Per-object metadata travels as headers, so each upload gets its own bucket handle.
        let mut bucket = self.bucket.clone();
        for (name, value) in attributes {
            bucket.add_header(&format!("x-amz-meta-{name}"), value);
        }

        let response = bucket
            .put_object_with_content_type(key, &data, content_type)
            .await?;
        check_status(response.status_code())?;

        Ok(self.locator(key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await?;
        if response.status_code() == 404 {
            return Err(StorageError::NotFound(key.to_string()));
        }
        check_status(response.status_code())?;
        Ok(response.to_vec())
    }

    fn locator(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket.name(), key)
    }
}

fn check_status(status: u16) -> Result<(), StorageError> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(StorageError::Status(status))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Storage configuration error: {0}")]
    Config(String),

    #[error("Object store returned HTTP {0}")]
    Status(u16),

    #[error("Object not found: {0}")]
    NotFound(String),
}
