//! Runner manager: reconciles the fleet against a target quantity.
//!
//! A manager instance is meant to be driven by an external scheduler that
//! never overlaps two passes on the same fleet. Nothing here locks; two
//! concurrent passes could both try to grow the fleet.

use crate::binary::BinaryAcquirer;
use crate::clients::{RunnerClients, RunnerRemoteStatus};
use crate::config::{ManagerConfig, VmResources};
use crate::runner::{Runner, RunnerConfig, RunnerStatus};
use crate::token::TokenBroker;
use crate::view::RunnerView;
use crate::{FleetError, Result};
use uuid::Uuid;

/// Registration-side summary of a runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerInfo {
    pub name: String,
    pub status: RunnerRemoteStatus,
}

/// Manages one fleet of runners according to its configuration.
pub struct RunnerManager {
    config: ManagerConfig,
    clients: RunnerClients,
    view: RunnerView,
    tokens: TokenBroker,
    binary: BinaryAcquirer,
}

impl RunnerManager {
    /// Build a manager whose outbound HTTP client honours the configured proxies.
    pub fn new(config: ManagerConfig, clients: RunnerClients) -> Result<Self> {
        let http = config.proxies.http_client()?;
        Ok(Self::with_http_client(config, clients, http))
    }

    pub fn with_http_client(
        config: ManagerConfig,
        clients: RunnerClients,
        http: reqwest::Client,
    ) -> Self {
        let network_retry = config.network_retry.policy();
        let view = RunnerView::new(config.clone(), clients.clone());
        let tokens = TokenBroker::new(clients.registry.clone(), config.path.clone(), network_retry);
        let binary = BinaryAcquirer::new(
            http,
            clients.registry.clone(),
            config.path.clone(),
            config.runner_bin_path.clone(),
            network_retry,
        );
        Self {
            config,
            clients,
            view,
            tokens,
            binary,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn fleet_prefix(&self) -> String {
        self.config.fleet_prefix()
    }

    pub fn binary(&self) -> &BinaryAcquirer {
        &self.binary
    }

    /// Fetch the latest agent package for `os_name`/`arch_name` and install it.
    ///
    /// Must not run while a reconcile pass is creating runners.
    pub async fn update_runner_bin(&self, os_name: &str, arch_name: &str) -> Result<()> {
        let candidate = self.binary.select_candidate(os_name, arch_name).await?;
        self.binary.refresh(&candidate).await
    }

    /// Current runners, merged from both sources.
    pub async fn runners(&self) -> Result<Vec<Runner>> {
        self.view.list().await
    }

    /// Registration-side information on this fleet's runners.
    pub async fn github_info(&self) -> Result<Vec<RunnerInfo>> {
        Ok(self
            .view
            .remote_runners()
            .await?
            .into_values()
            .map(|runner| RunnerInfo {
                name: runner.name,
                status: runner.status,
            })
            .collect())
    }

    /// Bring the number of online runners toward `quantity`.
    ///
    /// Offline runners are always cleaned up first. Returns the difference
    /// between the target and the online count at the start of the pass;
    /// individual removals may still have failed.
    pub async fn reconcile(&self, quantity: u32, resources: &VmResources) -> Result<i64> {
        let runners = self.view.list().await?;
        let local_count = runners.iter().filter(|r| r.status.exists).count();
        let (online, rest): (Vec<Runner>, Vec<Runner>) =
            runners.into_iter().partition(|r| r.status.is_online());
        let offline: Vec<Runner> = rest.into_iter().filter(|r| r.status.is_offline()).collect();

        tracing::info!(
            "Expected runner count: {}, Online runner count: {}, Offline runner count: {}, Instance count: {}",
            quantity,
            online.len(),
            offline.len(),
            local_count
        );

        if !offline.is_empty() {
            tracing::info!("Cleaning up offline runners.");
            let removal_token = self.tokens.removal_token().await?;
            self.remove_each(offline, &removal_token).await;
        }

        let delta = i64::from(quantity) - online.len() as i64;
        if delta > 0 {
            self.grow(delta, resources).await?;
        } else if delta < 0 {
            let idle: Vec<Runner> = online.into_iter().filter(|r| r.status.is_idle()).collect();
            let offset = usize::try_from(-delta).unwrap_or(usize::MAX).min(idle.len());
            if offset == 0 {
                tracing::info!("There are no idle runners to remove.");
            } else {
                tracing::info!("Removing {} idle runner(s).", offset);
                let removal_token = self.tokens.removal_token().await?;
                self.remove_each(idle.into_iter().take(offset), &removal_token)
                    .await;
            }
        } else {
            tracing::info!("No changes to number of runners needed.");
        }

        Ok(delta)
    }

    /// Create `count` runners, stopping at the first failure.
    async fn grow(&self, count: i64, resources: &VmResources) -> Result<()> {
        if !self.binary.is_installed().await {
            return Err(FleetError::RunnerCreate(format!(
                "missing runner binary at {}",
                self.binary.install_path().display()
            )));
        }

        tracing::info!("Getting registration token for runners.");
        let registration_token = self.tokens.registration_token().await?;
        let removal_token = self.tokens.removal_token().await?;

        tracing::info!("Adding {} additional runner(s).", count);
        for _ in 0..count {
            let mut runner = self.new_runner();
            match runner
                .create(
                    &self.config.image,
                    resources,
                    self.binary.install_path(),
                    &registration_token,
                )
                .await
            {
                Ok(()) => tracing::info!("Created runner: {}", runner.name()),
                Err(err) => {
                    tracing::error!("Unable to create runner {}: {}", runner.name(), err);
                    if let Err(cleanup) = runner.remove(&removal_token).await {
                        tracing::error!("Unable to clean up runner {}: {}", runner.name(), cleanup);
                        return Err(FleetError::RunnerCreateCleanup {
                            error: Box::new(err),
                            cleanup: Box::new(cleanup),
                        });
                    }
                    tracing::info!("Cleaned up runner: {}", runner.name());
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Remove every Online and Offline runner, keeping busy ones unless
    /// `flush_busy` is set.
    ///
    /// A registration that is online without a local instance is neither
    /// and is never touched. Returns how many removals were attempted.
    pub async fn flush(&self, flush_busy: bool) -> Result<usize> {
        let runners: Vec<Runner> = self
            .view
            .list()
            .await?
            .into_iter()
            .filter(|r| r.status.is_online() || r.status.is_offline())
            .filter(|r| flush_busy || !r.status.is_busy())
            .collect();

        tracing::info!("Removing {} existing runner(s)", runners.len());
        if runners.is_empty() {
            return Ok(0);
        }

        let removal_token = self.tokens.removal_token().await?;
        Ok(self.remove_each(runners, &removal_token).await)
    }

    /// Best-effort removal: failures are logged and the batch continues.
    async fn remove_each(
        &self,
        runners: impl IntoIterator<Item = Runner>,
        removal_token: &str,
    ) -> usize {
        let mut attempted = 0;
        for mut runner in runners {
            attempted += 1;
            match runner.remove(removal_token).await {
                Ok(()) => tracing::info!("Removed runner: {}", runner.name()),
                Err(err) => tracing::error!("Failed to remove runner {}: {}", runner.name(), err),
            }
        }
        attempted
    }

    fn new_runner(&self) -> Runner {
        let config = RunnerConfig {
            app_name: self.config.app_name.clone(),
            path: self.config.path.clone(),
            proxies: self.config.proxies.clone(),
            instance_storage_path: self.config.instance_storage_path.clone(),
            name: format!("{}{}", self.fleet_prefix(), Uuid::new_v4()),
        };
        Runner::new(self.clients.clone(), config, RunnerStatus::default(), None)
            .with_readiness_retry(self.config.readiness_retry.policy())
    }
}
