//! Runner agent package acquisition
//!
//! The installed package is deleted before a new one is fetched, so a failed
//! refresh leaves nothing behind rather than an outdated binary. A download is
//! only moved onto the install path once its SHA-256 digest matches and it
//! reads as a valid archive.

mod archive;

use crate::clients::{ClientError, RegistrationService, RunnerApplication};
use crate::config::GithubPath;
use crate::retry::RetryPolicy;
use crate::{FleetError, Result};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter};

/// Download chunk size (128 KiB).
pub const DOWNLOAD_CHUNK_SIZE: usize = 128 * 1024;

/// Fetches and verifies the runner agent package.
pub struct BinaryAcquirer {
    http: reqwest::Client,
    registry: Arc<dyn RegistrationService>,
    path: GithubPath,
    install_path: PathBuf,
    retry: RetryPolicy,
}

impl BinaryAcquirer {
    pub fn new(
        http: reqwest::Client,
        registry: Arc<dyn RegistrationService>,
        path: GithubPath,
        install_path: impl Into<PathBuf>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http,
            registry,
            path,
            install_path: install_path.into(),
            retry,
        }
    }

    pub fn install_path(&self) -> &Path {
        &self.install_path
    }

    /// Whether a verified package is currently installed.
    pub async fn is_installed(&self) -> bool {
        tokio::fs::metadata(&self.install_path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    /// Find the package published for exactly `os_name`/`arch_name`.
    pub async fn select_candidate(&self, os_name: &str, arch_name: &str) -> Result<RunnerApplication> {
        let registry = &self.registry;
        let path = &self.path;
        let applications = self
            .retry
            .run(
                "runner application listing",
                || async move {
                    match path {
                        GithubPath::Repo(repo) => registry.list_runner_applications_for_repo(repo).await,
                        GithubPath::Org(org) => registry.list_runner_applications_for_org(org).await,
                    }
                },
                ClientError::is_retryable,
            )
            .await?;
        tracing::debug!("Response of runner binary list: {:?}", applications);

        applications
            .into_iter()
            .find(|app| app.os == os_name && app.architecture == arch_name)
            .ok_or_else(|| {
                FleetError::BinaryNotFound(format!(
                    "no runner binary published for {} {}",
                    os_name, arch_name
                ))
            })
    }

    /// Replace the installed package with `candidate`.
    ///
    /// Only network failures are retried. A digest mismatch or a corrupt
    /// archive is returned straight away.
    pub async fn refresh(&self, candidate: &RunnerApplication) -> Result<()> {
        self.retry
            .run(
                "runner binary download",
                || self.download_and_verify(candidate),
                |err| matches!(err, FleetError::BinaryDownload(_)),
            )
            .await
    }

    async fn download_and_verify(&self, candidate: &RunnerApplication) -> Result<()> {
        tracing::info!("Downloading runner binary from: {}", candidate.download_url);

        // Old binaries may carry security flaws; never leave one around.
        match tokio::fs::remove_file(&self.install_path).await {
            Ok(()) => tracing::debug!("Removed previous runner binary"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::error!("Unable to remove runner binary {}: {}", self.install_path.display(), err);
                return Err(FleetError::BinaryIo(format!(
                    "remove {}: {}",
                    self.install_path.display(),
                    err
                )));
            }
        }

        let expected = match candidate.sha256_checksum.as_deref().map(str::trim) {
            Some(checksum) if !checksum.is_empty() => checksum,
            _ => {
                tracing::error!("Checksum for runner binary is not found, unable to verify download.");
                return Err(FleetError::BinaryIntegrity(
                    "no checksum published for runner binary".to_string(),
                ));
            }
        };

        let partial = self.partial_path();
        match self.fetch_verified(&candidate.download_url, expected, &partial).await {
            Ok(()) => {
                tokio::fs::rename(&partial, &self.install_path)
                    .await
                    .map_err(|e| {
                        FleetError::BinaryIo(format!("install {}: {}", self.install_path.display(), e))
                    })?;
                tracing::info!("Validated newly downloaded runner binary and enabled it.");
                Ok(())
            }
            Err(err) => {
                if let Err(e) = tokio::fs::remove_file(&partial).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("Unable to remove partial download {}: {}", partial.display(), e);
                    }
                }
                Err(err)
            }
        }
    }

    async fn fetch_verified(&self, url: &str, expected: &str, dest: &Path) -> Result<()> {
        let digest = self.download(url, dest).await?;
        tracing::info!("Finished download of runner binary.");

        if !digest.eq_ignore_ascii_case(expected) {
            tracing::error!(
                "Expected hash of runner binary ({}) doesn't match the calculated hash ({})",
                expected,
                digest
            );
            return Err(FleetError::BinaryIntegrity(format!(
                "checksum mismatch: expected {}, got {}",
                expected, digest
            )));
        }

        archive::validate(dest).await
    }

    /// Stream `url` into `dest`, returning the hex SHA-256 of the bytes written.
    async fn download(&self, url: &str, dest: &Path) -> Result<String> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| FleetError::BinaryDownload(e.to_string()))?;
        tracing::info!(
            "Download of runner binary from {} return status code: {}",
            url,
            response.status()
        );

        let file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| FleetError::BinaryIo(format!("create {}: {}", dest.display(), e)))?;
        let mut writer = BufWriter::with_capacity(DOWNLOAD_CHUNK_SIZE, file);
        let mut hasher = Sha256::new();
        let write_err = |e: std::io::Error| FleetError::BinaryIo(format!("write {}: {}", dest.display(), e));

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FleetError::BinaryDownload(e.to_string()))?;
            hasher.update(&chunk);
            writer.write_all(&chunk).await.map_err(write_err)?;
        }
        writer.flush().await.map_err(write_err)?;
        writer.get_ref().sync_all().await.map_err(write_err)?;

        Ok(format!("{:x}", hasher.finalize()))
    }

    fn partial_path(&self) -> PathBuf {
        let mut name = self
            .install_path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".part");
        self.install_path.with_file_name(name)
    }
}
