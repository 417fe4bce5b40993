//! Merged runner view
//!
//! Joins the instances on the virtualization host with the registrations on
//! the CI service by runner name. Only names carrying this manager's fleet
//! prefix are considered.

use crate::clients::{Instance, RunnerClients, SelfHostedRunner};
use crate::config::{GithubPath, ManagerConfig};
use crate::retry::RetryPolicy;
use crate::runner::{Runner, RunnerConfig, RunnerStatus};
use crate::Result;
use std::collections::{BTreeMap, BTreeSet};

pub struct RunnerView {
    config: ManagerConfig,
    clients: RunnerClients,
}

impl RunnerView {
    pub fn new(config: ManagerConfig, clients: RunnerClients) -> Self {
        Self { config, clients }
    }

    /// Every runner known to either side, ordered by name.
    pub async fn list(&self) -> Result<Vec<Runner>> {
        let remote = self.remote_runners().await?;
        let local = self.local_instances().await?;

        let names: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
        Ok(names
            .into_iter()
            .map(|name| self.build_runner(name, local.get(name), remote.get(name)))
            .collect())
    }

    /// Registrations owned by this manager, keyed by name.
    pub async fn remote_runners(&self) -> Result<BTreeMap<String, SelfHostedRunner>> {
        let registry = &self.clients.registry;
        let runners = match &self.config.path {
            GithubPath::Repo(repo) => registry.list_runners_for_repo(repo).await?,
            GithubPath::Org(org) => registry.list_runners_for_org(org).await?,
        };
        tracing::debug!("Runners found on {}: {}", self.config.path, runners.len());

        let prefix = self.config.fleet_prefix();
        Ok(runners
            .into_iter()
            .filter(|runner| runner.name.starts_with(&prefix))
            .map(|runner| (runner.name.clone(), runner))
            .collect())
    }

    /// Instances owned by this manager, keyed by name.
    pub async fn local_instances(&self) -> Result<BTreeMap<String, Instance>> {
        let prefix = self.config.fleet_prefix();
        Ok(self
            .clients
            .host
            .list_instances()
            .await?
            .into_iter()
            .filter(|instance| instance.name.starts_with(&prefix))
            .map(|instance| (instance.name.clone(), instance))
            .collect())
    }

    fn build_runner(
        &self,
        name: &str,
        local: Option<&Instance>,
        remote: Option<&SelfHostedRunner>,
    ) -> Runner {
        tracing::debug!(
            "Found runner {} with registration [status: {:?}, busy: {:?}, labels: {:?}] and instance [status: {:?}]",
            name,
            remote.map(|r| r.status),
            remote.map(|r| r.busy),
            remote.map(|r| r.labels.iter().map(|l| l.name.as_str()).collect::<Vec<_>>()),
            local.map(|i| i.status.to_string())
        );

        let config = RunnerConfig {
            app_name: self.config.app_name.clone(),
            path: self.config.path.clone(),
            proxies: self.config.proxies.clone(),
            instance_storage_path: self.config.instance_storage_path.clone(),
            name: name.to_string(),
        };
        Runner::new(
            self.clients.clone(),
            config,
            RunnerStatus::from_sources(local, remote),
            local.cloned(),
        )
        .with_readiness_retry(self.readiness_retry())
    }

    fn readiness_retry(&self) -> RetryPolicy {
        self.config.readiness_retry.policy()
    }
}
