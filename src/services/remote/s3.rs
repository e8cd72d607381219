//! S3-compatible remote backend built on the AWS SDK.

use super::{CompletedPart, MultipartClient, ObjectReader, RemoteError, RemoteResult};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{
    Client,
    config::Credentials,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart},
};
use bytes::Bytes;
use tracing::error;

/// Connection settings for an S3-compatible endpoint.
#[derive(Clone, Debug)]
pub struct S3Settings {
    /// Custom endpoint for S3-compatible providers (MinIO, Yandex, R2...).
    pub endpoint_url: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
}

impl S3Client {
    /// Build a client from explicit settings.
    ///
    /// Static credentials are used when both keys are set; otherwise the
    /// default AWS credential chain applies.
    pub async fn new(settings: S3Settings) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));

        if let (Some(access_key), Some(secret_key)) =
            (&settings.access_key_id, &settings.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "file-store",
            ));
        }

        let sdk_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &settings.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket,
        }
    }
}

#[async_trait]
impl MultipartClient for S3Client {
    async fn create_multipart_upload(&self, key: &str) -> RemoteResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| {
                let service_err = e.into_service_error();
                error!(bucket = %self.bucket, key, error = %service_err, "CreateMultipartUpload failed");
                RemoteError::protocol("CreateMultipartUpload", key, service_err)
            })?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| RemoteError::protocol("CreateMultipartUpload", key, "no upload id returned"))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> RemoteResult<String> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                let service_err = e.into_service_error();
                error!(bucket = %self.bucket, key, part_number, error = %service_err, "UploadPart failed");
                RemoteError::protocol("UploadPart", key, service_err)
            })?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| RemoteError::protocol("UploadPart", key, "no ETag returned"))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> RemoteResult<()> {
        let parts = parts
            .iter()
            .map(|p| {
                S3CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect::<Vec<_>>();
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| {
                let service_err = e.into_service_error();
                error!(bucket = %self.bucket, key, error = %service_err, "CompleteMultipartUpload failed");
                RemoteError::protocol("CompleteMultipartUpload", key, service_err)
            })?;

        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> RemoteResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| RemoteError::protocol("AbortMultipartUpload", key, e.into_service_error()))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> RemoteResult<ObjectReader> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let not_found_status = e
                    .raw_response()
                    .is_some_and(|raw| raw.status().as_u16() == 404);
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() || not_found_status {
                    RemoteError::NotFound(key.to_string())
                } else {
                    error!(bucket = %self.bucket, key, error = %service_err, "GetObject failed");
                    RemoteError::protocol("GetObject", key, service_err)
                }
            })?;

        Ok(Box::pin(output.body.into_async_read()))
    }
}
