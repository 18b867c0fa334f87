//! Native AWS S3 direct transport
//!
//! Turns a credential lease into an S3 client using the lease's session
//! credentials, and drives the SDK's async API from the engine's blocking
//! workers through a shared tokio runtime. Supports S3-compatible endpoints
//! (MinIO, Wasabi, etc.).
//!
//! Remote ids have the form `bucket/key`. The whole-object digest is stored
//! as user metadata so downloads can verify against it.

use crate::chunk::ByteRange;
use crate::error::{Result, TransferError};
use crate::hash::Digest;
use crate::transport::lease::CredentialLease;
use crate::transport::traits::{
    DirectConnector, ObjectMetadata, PartToken, RemoteId, Transport, TransportKind,
    UploadSessionToken,
};
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// User metadata key holding the content digest
const DIGEST_METADATA_KEY: &str = "bulkxfer-digest";

/// Lease field names understood by the connector
pub const LEASE_ACCESS_KEY_ID: &str = "access_key_id";
/// Secret key lease field
pub const LEASE_SECRET_ACCESS_KEY: &str = "secret_access_key";
/// Session token lease field
pub const LEASE_SESSION_TOKEN: &str = "session_token";

/// Configuration for the native S3 connector.
#[derive(Debug, Clone)]
pub struct NativeS3Config {
    /// AWS region (e.g., "us-east-1")
    pub region: String,
    /// Custom endpoint URL for S3-compatible services (MinIO, Wasabi)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for some S3-compatible services)
    pub force_path_style: bool,
    /// Buckets reachable directly; empty means all
    pub buckets: Vec<String>,
}

impl Default for NativeS3Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: None,
            force_path_style: false,
            buckets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct ObjectLocation {
    bucket: String,
    key: String,
}

impl ObjectLocation {
    fn parse(remote: &RemoteId) -> Result<Self> {
        match remote.as_str().split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok(Self {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            _ => Err(TransferError::precondition(format!(
                "'{}' is not a bucket/key remote",
                remote
            ))),
        }
    }
}

/// Direct connector producing lease-bound S3 transports
pub struct NativeS3Connector {
    config: NativeS3Config,
    runtime: Arc<tokio::runtime::Runtime>,
    uploads: Arc<Mutex<HashMap<String, ObjectLocation>>>,
}

impl NativeS3Connector {
    /// Create a connector with its own runtime
    pub fn new(config: NativeS3Config) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("bulkxfer-s3")
            .build()
            .map_err(|e| TransferError::config(format!("failed to start S3 runtime: {e}")))?;

        Ok(Self {
            config,
            runtime: Arc::new(runtime),
            uploads: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

impl DirectConnector for NativeS3Connector {
    fn supports_direct(&self, remote: &RemoteId) -> bool {
        match ObjectLocation::parse(remote) {
            Ok(location) => {
                self.config.buckets.is_empty() || self.config.buckets.contains(&location.bucket)
            }
            Err(_) => false,
        }
    }

    fn connect(&self, lease: &CredentialLease) -> Result<Arc<dyn Transport>> {
        let field = |name: &str| {
            lease.field(name).map(str::to_string).ok_or_else(|| {
                TransferError::CredentialRejected(format!("lease is missing '{name}'"))
            })
        };
        let key_id = field(LEASE_ACCESS_KEY_ID)?;
        let secret = field(LEASE_SECRET_ACCESS_KEY)?;
        let session_token = lease.field(LEASE_SESSION_TOKEN).map(str::to_string);
        let expiry = SystemTime::from(lease.expires_at);

        let creds = aws_credential_types::Credentials::new(
            key_id,
            secret,
            session_token,
            Some(expiry),
            "bulkxfer-lease",
        );

        let mut aws_config_builder = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(self.config.region.clone()))
            .credentials_provider(creds);

        // Set custom endpoint for S3-compatible services
        if let Some(ref endpoint) = self.config.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = self.runtime.block_on(aws_config_builder.load());

        let mut s3_config = aws_sdk_s3::config::Builder::from(&aws_config);
        if self.config.force_path_style {
            s3_config = s3_config.force_path_style(true);
        }

        Ok(Arc::new(NativeS3Transport {
            client: aws_sdk_s3::Client::from_conf(s3_config.build()),
            runtime: Arc::clone(&self.runtime),
            uploads: Arc::clone(&self.uploads),
        }))
    }
}

/// S3 transport bound to one set of session credentials
struct NativeS3Transport {
    client: aws_sdk_s3::Client,
    runtime: Arc<tokio::runtime::Runtime>,
    uploads: Arc<Mutex<HashMap<String, ObjectLocation>>>,
}

impl NativeS3Transport {
    fn upload_location(&self, session: &UploadSessionToken) -> Result<ObjectLocation> {
        self.uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&session.0)
            .cloned()
            .ok_or_else(|| TransferError::Client {
                status: 404,
                message: format!("unknown upload '{}'", session),
            })
    }
}

impl Transport for NativeS3Transport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn open_upload(&self, remote: &RemoteId) -> Result<UploadSessionToken> {
        let location = ObjectLocation::parse(remote)?;
        let create = self
            .runtime
            .block_on(
                self.client
                    .create_multipart_upload()
                    .bucket(&location.bucket)
                    .key(&location.key)
                    .send(),
            )
            .map_err(|e| map_sdk_error("create_multipart_upload", e))?;

        let upload_id = create
            .upload_id()
            .ok_or_else(|| TransferError::Server {
                status: 500,
                message: "Missing upload_id".to_string(),
            })?
            .to_string();

        self.uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(upload_id.clone(), location);
        Ok(UploadSessionToken(upload_id))
    }

    fn put_part(
        &self,
        session: &UploadSessionToken,
        index: usize,
        data: &[u8],
        _digest: &Digest,
    ) -> Result<PartToken> {
        let location = self.upload_location(session)?;
        let upload_part = self
            .runtime
            .block_on(
                self.client
                    .upload_part()
                    .bucket(&location.bucket)
                    .key(&location.key)
                    .upload_id(&session.0)
                    .part_number(part_number(index)?)
                    .body(ByteStream::from(data.to_vec()))
                    .send(),
            )
            .map_err(|e| map_sdk_error("upload_part", e))?;

        Ok(PartToken {
            index,
            etag: upload_part.e_tag().unwrap_or_default().to_string(),
        })
    }

    fn complete_upload(
        &self,
        session: &UploadSessionToken,
        _remote: &RemoteId,
        parts: &[PartToken],
        digest: &Digest,
    ) -> Result<()> {
        let location = self.upload_location(session)?;
        let completed_parts = parts
            .iter()
            .map(|token| {
                Ok(CompletedPart::builder()
                    .part_number(part_number(token.index)?)
                    .e_tag(&token.etag)
                    .build())
            })
            .collect::<Result<Vec<_>>>()?;

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.runtime
            .block_on(
                self.client
                    .complete_multipart_upload()
                    .bucket(&location.bucket)
                    .key(&location.key)
                    .upload_id(&session.0)
                    .multipart_upload(completed)
                    .send(),
            )
            .map_err(|e| map_sdk_error("complete_multipart_upload", e))?;

        // multipart uploads cannot carry metadata at completion; copy it in place
        self.runtime
            .block_on(
                self.client
                    .copy_object()
                    .bucket(&location.bucket)
                    .key(&location.key)
                    .copy_source(format!("{}/{}", location.bucket, location.key))
                    .metadata(DIGEST_METADATA_KEY, digest.to_string())
                    .metadata_directive(aws_sdk_s3::types::MetadataDirective::Replace)
                    .send(),
            )
            .map_err(|e| map_sdk_error("copy_object", e))?;

        self.uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session.0);
        Ok(())
    }

    fn abort_upload(&self, session: &UploadSessionToken, _remote: &RemoteId) -> Result<()> {
        let location = self.upload_location(session)?;
        self.runtime
            .block_on(
                self.client
                    .abort_multipart_upload()
                    .bucket(&location.bucket)
                    .key(&location.key)
                    .upload_id(&session.0)
                    .send(),
            )
            .map_err(|e| map_sdk_error("abort_multipart_upload", e))?;

        self.uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session.0);
        Ok(())
    }

    fn put_object(&self, remote: &RemoteId, data: &[u8], digest: &Digest) -> Result<()> {
        let location = ObjectLocation::parse(remote)?;
        self.runtime
            .block_on(
                self.client
                    .put_object()
                    .bucket(&location.bucket)
                    .key(&location.key)
                    .metadata(DIGEST_METADATA_KEY, digest.to_string())
                    .body(ByteStream::from(data.to_vec()))
                    .send(),
            )
            .map_err(|e| map_sdk_error("put_object", e))?;
        Ok(())
    }

    fn get_object_metadata(&self, remote: &RemoteId) -> Result<ObjectMetadata> {
        let location = ObjectLocation::parse(remote)?;
        let head = self
            .runtime
            .block_on(
                self.client
                    .head_object()
                    .bucket(&location.bucket)
                    .key(&location.key)
                    .send(),
            )
            .map_err(|e| map_sdk_error("head_object", e))?;

        let size = head.content_length().unwrap_or_default().max(0) as u64;
        let digest = head
            .metadata()
            .and_then(|m| m.get(DIGEST_METADATA_KEY))
            .and_then(|value| Digest::parse(value));
        if digest.is_none() {
            tracing::debug!("{} carries no {} metadata", remote, DIGEST_METADATA_KEY);
        }

        Ok(ObjectMetadata { size, digest })
    }

    fn get_range(&self, remote: &RemoteId, range: ByteRange) -> Result<Vec<u8>> {
        let location = ObjectLocation::parse(remote)?;
        self.runtime.block_on(async {
            let resp = self
                .client
                .get_object()
                .bucket(&location.bucket)
                .key(&location.key)
                .range(range.to_http_header())
                .send()
                .await
                .map_err(|e| map_sdk_error("get_object", e))?;

            let body = resp
                .body
                .collect()
                .await
                .map_err(|e| TransferError::Network(format!("S3 body read failed: {}", e)))?;
            Ok(body.into_bytes().to_vec())
        })
    }
}

fn part_number(index: usize) -> Result<i32> {
    i32::try_from(index + 1)
        .map_err(|_| TransferError::precondition(format!("part index {index} out of range")))
}

/// Map an SDK failure onto the engine's error classes
fn map_sdk_error<E>(operation: &str, err: SdkError<E, HttpResponse>) -> TransferError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let context = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            TransferError::Network(format!("S3 {operation} failed: {context}"))
        }
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            let code = service.err().code().unwrap_or_default();
            let message = format!("S3 {operation} failed: {context}");

            match (status, code) {
                (429, _) | (_, "SlowDown") => TransferError::RateLimited {
                    retry_after: retry_after(service.raw()),
                    message,
                },
                (401 | 403, _) | (_, "ExpiredToken" | "InvalidAccessKeyId" | "InvalidToken") => {
                    TransferError::CredentialRejected(message)
                }
                (500.., _) => TransferError::Server { status, message },
                _ => TransferError::Client { status, message },
            }
        }
        _ => TransferError::Client {
            status: 400,
            message: format!("S3 {operation} failed: {context}"),
        },
    }
}

fn retry_after(response: &HttpResponse) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NativeS3Config::default();
        assert_eq!(config.region, "us-east-1");
        assert!(!config.force_path_style);
        assert!(config.buckets.is_empty());
    }

    #[test]
    fn test_remote_parsing() {
        let location = ObjectLocation::parse(&RemoteId::new("bucket/dir/file.bin")).unwrap();
        assert_eq!(location.bucket, "bucket");
        assert_eq!(location.key, "dir/file.bin");
        assert!(ObjectLocation::parse(&RemoteId::new("no-key")).is_err());
        assert!(ObjectLocation::parse(&RemoteId::new("/key")).is_err());
    }

    #[test]
    fn test_supports_direct_filters_buckets() {
        let connector = NativeS3Connector::new(NativeS3Config {
            buckets: vec!["allowed".to_string()],
            ..Default::default()
        })
        .unwrap();
        assert!(connector.supports_direct(&RemoteId::new("allowed/x")));
        assert!(!connector.supports_direct(&RemoteId::new("other/x")));
        assert!(!connector.supports_direct(&RemoteId::new("malformed")));
    }

    #[test]
    fn test_connect_requires_credentials() {
        let connector = NativeS3Connector::new(NativeS3Config::default()).unwrap();
        let lease = CredentialLease::new(
            crate::transport::LeaseScope::Read,
            "s3",
            chrono::Utc::now() + chrono::Duration::minutes(5),
        );
        assert!(connector.connect(&lease).unwrap_err().is_credential_rejection());
    }

    #[test]
    fn test_part_numbers_are_one_based() {
        assert_eq!(part_number(0).unwrap(), 1);
        assert_eq!(part_number(9_999).unwrap(), 10_000);
    }
}
