use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bucketcache_protocol::{CredentialsSource, ObjectPath};
use tokio::io::AsyncReadExt;

use crate::{ObjectReader, ObjectStore, StorageError, StoreFuture};

/// Bodies up to this size go out as a single `PutObject`; larger ones are
/// split into parts of this size.
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Object store backed by Amazon S3 or an S3-compatible endpoint.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    /// Wraps an already configured client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Loads SDK configuration and builds a client.
    ///
    /// A custom endpoint switches to path-style addressing.
    pub async fn connect(
        region: Option<String>,
        credentials: &CredentialsSource,
        endpoint_url: Option<String>,
    ) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        match credentials {
            CredentialsSource::Default => {}
            CredentialsSource::Profile { name } => {
                loader = loader.profile_name(name);
            }
            CredentialsSource::Static {
                access_key_id,
                secret_access_key,
                session_token,
            } => {
                loader = loader.credentials_provider(Credentials::new(
                    access_key_id,
                    secret_access_key,
                    session_token.clone(),
                    None,
                    "bucketcache",
                ));
            }
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self::new(Client::from_conf(builder.build()))
    }

    async fn put_single(&self, path: &ObjectPath, data: Vec<u8>) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(path.bucket())
            .key(path.key())
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| s3_error("PutObject", path, e))?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        path: &ObjectPath,
        first: Vec<u8>,
        body: &mut ObjectReader,
    ) -> Result<(), StorageError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(path.bucket())
            .key(path.key())
            .send()
            .await
            .map_err(|e| s3_error("CreateMultipartUpload", path, e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::S3 {
                operation: "CreateMultipartUpload",
                path: path.to_string(),
                message: "response carried no upload id".into(),
            })?
            .to_string();

        match self.upload_parts(path, &upload_id, first, body).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(path.bucket())
                    .key(path.key())
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| s3_error("CompleteMultipartUpload", path, e))?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(path.bucket())
                    .key(path.key())
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(
                        %path,
                        error = %DisplayErrorContext(&abort),
                        "failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        path: &ObjectPath,
        upload_id: &str,
        first: Vec<u8>,
        body: &mut ObjectReader,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let mut parts = Vec::new();
        let mut data = first;
        let mut part_number: i32 = 1;
        while !data.is_empty() {
            let uploaded = self
                .client
                .upload_part()
                .bucket(path.bucket())
                .key(path.key())
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| s3_error("UploadPart", path, e))?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            tracing::trace!(%path, part_number, "uploaded part");
            part_number += 1;
            data = read_part(body).await?;
        }
        Ok(parts)
    }
}

/// Reads up to [`PART_SIZE`] bytes. A short read means the body is exhausted.
async fn read_part(body: &mut ObjectReader) -> Result<Vec<u8>, StorageError> {
    let mut buf = Vec::with_capacity(PART_SIZE);
    body.take(PART_SIZE as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}

fn s3_error<E>(operation: &'static str, path: &ObjectPath, err: E) -> StorageError
where
    E: std::error::Error,
{
    StorageError::S3 {
        operation,
        path: path.to_string(),
        message: DisplayErrorContext(err).to_string(),
    }
}

impl ObjectStore for S3Store {
    fn put<'a>(&'a self, path: &'a ObjectPath, mut body: ObjectReader) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let first = read_part(&mut body).await?;
            if first.len() < PART_SIZE {
                let bytes = first.len();
                self.put_single(path, first).await?;
                tracing::debug!(%path, bytes, "stored object");
            } else {
                self.put_multipart(path, first, &mut body).await?;
                tracing::debug!(%path, "stored object via multipart upload");
            }
            Ok(())
        })
    }

    fn get<'a>(&'a self, path: &'a ObjectPath) -> StoreFuture<'a, Option<ObjectReader>> {
        Box::pin(async move {
            match self
                .client
                .get_object()
                .bucket(path.bucket())
                .key(path.key())
                .send()
                .await
            {
                Ok(object) => Ok(Some(Box::pin(object.body.into_async_read()) as ObjectReader)),
                Err(e) => {
                    let service = e.into_service_error();
                    if service.is_no_such_key() {
                        Ok(None)
                    } else {
                        Err(s3_error("GetObject", path, service))
                    }
                }
            }
        })
    }

    fn head<'a>(&'a self, path: &'a ObjectPath) -> StoreFuture<'a, Option<u64>> {
        Box::pin(async move {
            match self
                .client
                .head_object()
                .bucket(path.bucket())
                .key(path.key())
                .send()
                .await
            {
                Ok(head) => Ok(Some(
                    head.content_length()
                        .and_then(|len| u64::try_from(len).ok())
                        .unwrap_or(0),
                )),
                Err(e) => {
                    let service = e.into_service_error();
                    if service.is_not_found() {
                        Ok(None)
                    } else {
                        Err(s3_error("HeadObject", path, service))
                    }
                }
            }
        })
    }
}
