//! Collaborator seams
//!
//! The registration service (GitHub) and the virtualization host (LXD) are
//! reached through these traits. Concrete wire clients live with whoever
//! embeds the manager; this crate only relies on the operations below.

#[cfg(test)]
pub(crate) mod mock;

use crate::config::{GithubOrg, GithubRepo, VmResources};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
}

impl ClientError {
    /// Transport failures and server-side errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Api { status, .. } => *status >= 500,
            ClientError::NotFound(_) | ClientError::Unauthorized(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// A downloadable runner agent package.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunnerApplication {
    pub os: String,
    pub architecture: String,
    pub download_url: String,
    pub filename: String,
    #[serde(default)]
    pub sha256_checksum: Option<String>,
}

/// Runner status as reported by the registration service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerRemoteStatus {
    Online,
    Offline,
}

impl std::fmt::Display for RunnerRemoteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerRemoteStatus::Online => write!(f, "online"),
            RunnerRemoteStatus::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunnerLabel {
    #[serde(default)]
    pub id: Option<u64>,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

/// A runner registration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SelfHostedRunner {
    pub id: u64,
    pub name: String,
    pub status: RunnerRemoteStatus,
    pub busy: bool,
    #[serde(default)]
    pub labels: Vec<RunnerLabel>,
}

/// Opaque handle the virtualization host uses to address an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceHandle(pub String);

impl std::fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Running,
    Stopped,
    Other(String),
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Stopped => write!(f, "stopped"),
            InstanceStatus::Other(status) => write!(f, "{}", status),
        }
    }
}

/// A compute instance on the virtualization host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub name: String,
    pub handle: InstanceHandle,
    pub status: InstanceStatus,
}

/// Parameters for provisioning an instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub image: String,
    pub resources: VmResources,
    pub storage_path: PathBuf,
}

/// Result of a command executed inside an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Remote registration service for runners.
#[async_trait]
pub trait RegistrationService: Send + Sync {
    async fn list_runner_applications_for_repo(
        &self,
        repo: &GithubRepo,
    ) -> ClientResult<Vec<RunnerApplication>>;

    async fn list_runner_applications_for_org(
        &self,
        org: &GithubOrg,
    ) -> ClientResult<Vec<RunnerApplication>>;

    async fn list_runners_for_repo(&self, repo: &GithubRepo) -> ClientResult<Vec<SelfHostedRunner>>;

    async fn list_runners_for_org(&self, org: &GithubOrg) -> ClientResult<Vec<SelfHostedRunner>>;

    async fn create_registration_token_for_repo(&self, repo: &GithubRepo) -> ClientResult<String>;

    async fn create_registration_token_for_org(&self, org: &GithubOrg) -> ClientResult<String>;

    async fn create_remove_token_for_repo(&self, repo: &GithubRepo) -> ClientResult<String>;

    async fn create_remove_token_for_org(&self, org: &GithubOrg) -> ClientResult<String>;

    async fn delete_runner_from_repo(&self, repo: &GithubRepo, runner_id: u64) -> ClientResult<()>;

    async fn delete_runner_from_org(&self, org: &GithubOrg, runner_id: u64) -> ClientResult<()>;
}

/// Virtualization host owning the runner instances.
#[async_trait]
pub trait VirtualizationHost: Send + Sync {
    async fn list_instances(&self) -> ClientResult<Vec<Instance>>;

    async fn create_instance(&self, spec: &InstanceSpec) -> ClientResult<InstanceHandle>;

    async fn start_instance(&self, handle: &InstanceHandle) -> ClientResult<()>;

    async fn push_file(
        &self,
        handle: &InstanceHandle,
        source: &Path,
        destination: &str,
    ) -> ClientResult<()>;

    /// Run `command` inside the instance with exactly `env` added to its environment.
    async fn execute(
        &self,
        handle: &InstanceHandle,
        command: &[String],
        env: &[(String, String)],
    ) -> ClientResult<ExecOutput>;

    /// Delete an instance. Reports [`ClientError::NotFound`] if it is already gone.
    async fn delete_instance(&self, handle: &InstanceHandle) -> ClientResult<()>;
}

/// Clients shared by the manager and every runner it builds.
#[derive(Clone)]
pub struct RunnerClients {
    pub registry: Arc<dyn RegistrationService>,
    pub host: Arc<dyn VirtualizationHost>,
}

impl RunnerClients {
    pub fn new(registry: Arc<dyn RegistrationService>, host: Arc<dyn VirtualizationHost>) -> Self {
        Self { registry, host }
    }
}
