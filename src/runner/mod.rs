//! Runner entity
//!
//! A `Runner` is the merged view of one runner name across the virtualization
//! host and the registration service. It is rebuilt on every query and owns
//! the create/remove operations for that single runner.

mod lifecycle;

pub use lifecycle::*;

use crate::clients::{Instance, RunnerClients, RunnerRemoteStatus, SelfHostedRunner};
use crate::config::{GithubPath, ProxySetting};
use crate::retry::RetryPolicy;
use std::path::PathBuf;
use std::time::Duration;

/// Creation parameters bound to one runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub app_name: String,
    pub path: GithubPath,
    pub proxies: ProxySetting,
    pub instance_storage_path: PathBuf,
    pub name: String,
}

/// Status of a runner merged from both sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerStatus {
    /// Id assigned by the registration service.
    pub registration_id: Option<u64>,
    /// The compute instance exists.
    pub exists: bool,
    /// A provisioned instance counts as running.
    pub running: bool,
    /// Registered and reported online.
    pub online: bool,
    /// `None` when the runner is not registered.
    pub busy: Option<bool>,
}

impl RunnerStatus {
    pub fn from_sources(local: Option<&Instance>, remote: Option<&SelfHostedRunner>) -> Self {
        Self {
            registration_id: remote.map(|r| r.id),
            exists: local.is_some(),
            running: local.is_some(),
            online: remote.is_some_and(|r| r.status == RunnerRemoteStatus::Online),
            busy: remote.map(|r| r.busy),
        }
    }

    /// Counts toward the target quantity.
    pub fn is_online(&self) -> bool {
        self.exists && self.online
    }

    /// Cleanup candidate: never registered, lost its instance, or went offline.
    pub fn is_offline(&self) -> bool {
        !self.online
    }

    pub fn is_idle(&self) -> bool {
        self.is_online() && self.busy != Some(true)
    }

    pub fn is_busy(&self) -> bool {
        self.is_online() && self.busy == Some(true)
    }
}

/// Readiness probing for freshly started instances.
const DEFAULT_READINESS_ATTEMPTS: u32 = 10;
const DEFAULT_READINESS_DELAY: Duration = Duration::from_secs(10);

/// One runner and the clients needed to act on it.
pub struct Runner {
    clients: RunnerClients,
    pub config: RunnerConfig,
    pub status: RunnerStatus,
    instance: Option<Instance>,
    readiness: RetryPolicy,
}

impl Runner {
    pub fn new(
        clients: RunnerClients,
        config: RunnerConfig,
        status: RunnerStatus,
        instance: Option<Instance>,
    ) -> Self {
        Self {
            clients,
            config,
            status,
            instance,
            readiness: RetryPolicy::new(DEFAULT_READINESS_ATTEMPTS, DEFAULT_READINESS_DELAY),
        }
    }

    /// Override how long `create` waits for the instance to answer.
    pub fn with_readiness_retry(mut self, policy: RetryPolicy) -> Self {
        self.readiness = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn instance(&self) -> Option<&Instance> {
        self.instance.as_ref()
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("name", &self.config.name)
            .field("status", &self.status)
            .field("instance", &self.instance)
            .finish()
    }
}
