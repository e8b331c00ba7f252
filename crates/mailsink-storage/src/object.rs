//! Object store client
//!
//! A thin wrapper over an S3-compatible endpoint (MinIO in the default
//! deployment) with the four capabilities the pipeline needs: ensure-bucket,
//! streaming put with a content type, get, and presigned GET links.

use mailsink_common::config::ObjectStoreConfig;
use mailsink_common::{Error, Result};
use s3::creds::Credentials;
use s3::{Bucket, BucketConfiguration, Region};
use tokio::io::AsyncRead;
use tracing::info;

pub struct ObjectStore {
    bucket: Box<Bucket>,
    bucket_name: String,
    region: Region,
    credentials: Credentials,
}

impl ObjectStore {
    pub fn new(config: &ObjectStoreConfig) -> Result<Self> {
        let endpoint = if config.endpoint.contains("://") {
            config.endpoint.clone()
        } else {
            let scheme = if config.secure { "https" } else { "http" };
            format!("{}://{}", scheme, config.endpoint)
        };
        let region = Region::Custom {
            region: "us-east-1".to_string(),
            endpoint,
        };
        let credentials = Credentials::new(
            Some(&config.access_key),
            Some(&config.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| Error::ObjectStore(format!("credentials: {}", e)))?;

        let bucket = Bucket::new(&config.bucket, region.clone(), credentials.clone())
            .map_err(|e| Error::ObjectStore(format!("bucket {}: {}", config.bucket, e)))?
            .with_path_style();

        Ok(Self {
            bucket,
            bucket_name: config.bucket.clone(),
            region,
            credentials,
        })
    }

    /// Create the bucket if it does not exist yet.
    pub async fn ensure_bucket(&self) -> Result<()> {
        let exists = self
            .bucket
            .exists()
            .await
            .map_err(|e| Error::ObjectStore(format!("head bucket {}: {}", self.bucket_name, e)))?;
        if exists {
            return Ok(());
        }
        Bucket::create_with_path_style(
            &self.bucket_name,
            self.region.clone(),
            self.credentials.clone(),
            BucketConfiguration::default(),
        )
        .await
        .map_err(|e| Error::ObjectStore(format!("create bucket {}: {}", self.bucket_name, e)))?;

        info!(bucket = %self.bucket_name, "bucket created");
        Ok(())
    }

    /// Stream an object into the store under `key`.
    pub async fn put(
        &self,
        key: &str,
        body: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
    ) -> Result<()> {
        let mut reader = &mut *body;
        let response = self
            .bucket
            .put_object_stream_with_content_type(&mut reader, key, content_type)
            .await
            .map_err(|e| Error::ObjectStore(format!("put {}: {}", key, e)))?;

        match response.status_code() {
            200..=299 => Ok(()),
            code => Err(Error::ObjectStore(format!("put {}: status {}", key, code))),
        }
    }

    /// Fetch a whole object.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .bucket
            .get_object(key)
            .await
            .map_err(|e| Error::ObjectStore(format!("get {}: {}", key, e)))?;

        match response.status_code() {
            200..=299 => Ok(response.to_vec()),
            404 => Err(Error::NotFound(format!("object {}", key))),
            code => Err(Error::ObjectStore(format!("get {}: status {}", key, code))),
        }
    }

    /// Produce a presigned GET URL valid for `expiry_secs`.
    pub async fn presign_get(&self, key: &str, expiry_secs: u32) -> Result<String> {
        self.bucket
            .presign_get(key, expiry_secs, None)
            .await
            .map_err(|e| Error::ObjectStore(format!("presign {}: {}", key, e)))
    }
}
