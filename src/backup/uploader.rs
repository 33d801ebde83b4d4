//! Remote snapshot uploader (C8), shelling out to the `aws` CLI exactly as
//! spec.md §4.8 describes the repository's own POC uploader doing. Avoids
//! taking on an AWS SDK dependency the teacher never carried.

use std::path::Path;

use tokio::process::Command;
use tracing::instrument;

use crate::config::S3Config;
use crate::error::UploadError;
use crate::shutdown::Shutdown;

/// Opaque `upload(local_path)` contract from spec.md §4.8. Any implementation
/// satisfying this trait is an acceptable remote uploader.
#[async_trait::async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, local_path: &Path, shutdown: &Shutdown) -> Result<(), UploadError>;
}

/// Uploads via `aws s3 cp`, cancellable through `shutdown` so `stop()` always
/// returns within the grace deadline even if the CLI is hung (spec.md §4.8).
#[derive(Debug, Clone)]
pub struct S3CliUploader {
    bucket_url: String,
    s3: S3Config,
}

impl S3CliUploader {
    /// Constructs an uploader. Requires `bucket_url` of scheme
    /// `s3://bucket[/prefix]` plus access/secret credentials, per spec.md §4.8.
    pub fn new(bucket_url: String, s3: S3Config) -> Result<Self, UploadError> {
        if !bucket_url.starts_with("s3://") {
            return Err(UploadError::Config(format!("bucket url must start with s3://, got {bucket_url}")));
        }
        if s3.access_key.is_none() || s3.secret_key.is_none() {
            return Err(UploadError::Config("access-key and secret-key are required".to_string()));
        }
        Ok(Self { bucket_url, s3 })
    }
}

#[async_trait::async_trait]
impl Uploader for S3CliUploader {
    #[instrument(name = "uploader::upload", skip_all, level = "info")]
    async fn upload(&self, local_path: &Path, shutdown: &Shutdown) -> Result<(), UploadError> {
        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| UploadError::Config("snapshot path has no file name".to_string()))?;
        let destination = format!("{}/{}", self.bucket_url.trim_end_matches('/'), file_name);

        let mut command = Command::new("aws");
        command.arg("s3").arg("cp").arg(local_path).arg(&destination);
        if let Some(endpoint) = &self.s3.endpoint {
            command.arg("--endpoint-url").arg(endpoint);
        }
        if let Some(region) = &self.s3.region {
            command.env("AWS_DEFAULT_REGION", region);
        }
        if let Some(access_key) = &self.s3.access_key {
            command.env("AWS_ACCESS_KEY_ID", access_key);
        }
        if let Some(secret_key) = &self.s3.secret_key {
            command.env("AWS_SECRET_ACCESS_KEY", secret_key);
        }
        if let Some(session_token) = &self.s3.session_token {
            command.env("AWS_SESSION_TOKEN", session_token);
        }
        if !self.s3.use_ssl {
            command.env("AWS_CA_BUNDLE", "");
        }

        tracing::info!(destination, "uploading snapshot");
        let mut child = command.spawn().map_err(UploadError::Io)?;

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(UploadError::Io)?;
                if status.success() {
                    Ok(())
                } else {
                    Err(UploadError::CommandFailed(format!("aws s3 cp exited with {status}")))
                }
            }
            () = shutdown.wait_for_shutdown() => {
                tracing::warn!("shutdown received mid-upload, killing aws CLI child process");
                let _ = child.kill().await;
                Err(UploadError::CommandFailed("upload cancelled by shutdown".to_string()))
            }
        }
    }
}
