use aws_sdk_s3::Client;
use aws_smithy_types::byte_stream::ByteStream;
use strata_core::Snapshot;

use super::{BoxFuture, CheckpointStore};
use crate::codec;
use crate::error::StorageError;

/// Checkpoint kept as a single S3 object.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
    key: String,
}

impl S3Store {
    pub fn new(client: Client, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Raw checkpoint bytes, or `None` if the object does not exist yet.
    async fn fetch(&self) -> Result<Option<Vec<u8>>, StorageError> {
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                let err = e.into_service_error();
                if err.is_no_such_key() {
                    tracing::debug!(bucket = %self.bucket, key = %self.key, "no checkpoint in S3");
                    return Ok(None);
                }
                return Err(StorageError::GetObject(err.to_string()));
            }
        };

        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| StorageError::GetObject(e.to_string()))?
            .into_bytes()
            .to_vec();
        Ok(Some(body))
    }

    pub(crate) async fn upload(&self, bytes: Vec<u8>) -> Result<(), StorageError> {
        let resp = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .content_type("application/json")
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StorageError::PutObject(e.into_service_error().to_string()))?;

        tracing::debug!(
            bucket = %self.bucket,
            key = %self.key,
            etag = resp.e_tag().unwrap_or_default(),
            "checkpoint uploaded"
        );
        Ok(())
    }
}

impl CheckpointStore for S3Store {
    fn load(&self) -> BoxFuture<'_, Result<Option<Snapshot>, StorageError>> {
        Box::pin(async move {
            match self.fetch().await? {
                Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
                None => Ok(None),
            }
        })
    }

    fn save<'a>(&'a self, snapshot: &'a Snapshot) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let bytes = codec::encode(snapshot)?;
            self.upload(bytes).await
        })
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}
