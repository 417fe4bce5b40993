//! Runner manager configuration.

use crate::retry::RetryPolicy;
use crate::{FleetError, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Where the runner agent package is installed on the manager host.
pub const DEFAULT_RUNNER_BIN_PATH: &str = "/home/ubuntu/github-runner-app";

/// Base URL used to build registration URLs for runners.
const GITHUB_URL: &str = "https://github.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubRepo {
    pub owner: String,
    pub repo: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubOrg {
    pub org: String,
}

/// Registration target: a single repository or a whole organization.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum GithubPath {
    Repo(GithubRepo),
    Org(GithubOrg),
}

impl GithubPath {
    /// URL runners register against.
    pub fn url(&self) -> String {
        format!("{}/{}", GITHUB_URL, self)
    }
}

impl FromStr for GithubPath {
    type Err = FleetError;

    /// Parses `owner/repo` into a repository path and a bare name into an organization.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.split_once('/') {
            Some((owner, repo)) => {
                if owner.is_empty() || repo.is_empty() || repo.contains('/') {
                    return Err(FleetError::Config(format!(
                        "invalid repository path '{}', expected '<owner>/<repo>'",
                        s
                    )));
                }
                Ok(GithubPath::Repo(GithubRepo {
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                }))
            }
            None if s.is_empty() => Err(FleetError::Config(
                "path must name a repository or an organization".to_string(),
            )),
            None => Ok(GithubPath::Org(GithubOrg { org: s.to_string() })),
        }
    }
}

impl TryFrom<String> for GithubPath {
    type Error = FleetError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl std::fmt::Display for GithubPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GithubPath::Repo(GithubRepo { owner, repo }) => write!(f, "{}/{}", owner, repo),
            GithubPath::Org(GithubOrg { org }) => write!(f, "{}", org),
        }
    }
}

/// Proxy settings for outbound traffic.
///
/// Never written into the process environment. The manager's HTTP client is
/// configured through [`ProxySetting::apply`], and commands run inside runner
/// instances receive [`ProxySetting::env`] as their own environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProxySetting {
    pub no_proxy: Option<String>,
    pub http: Option<String>,
    pub https: Option<String>,
}

impl ProxySetting {
    pub fn is_empty(&self) -> bool {
        self.no_proxy.is_none() && self.http.is_none() && self.https.is_none()
    }

    /// Environment variables for a command that must go through the proxy.
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Some(no_proxy) = &self.no_proxy {
            env.push(("NO_PROXY".to_string(), no_proxy.clone()));
        }
        if let Some(http) = &self.http {
            env.push(("HTTP_PROXY".to_string(), http.clone()));
        }
        if let Some(https) = &self.https {
            env.push(("HTTPS_PROXY".to_string(), https.clone()));
        }
        env
    }

    /// Configure a client builder with exactly these proxies, ignoring the
    /// process environment.
    pub fn apply(&self, builder: reqwest::ClientBuilder) -> Result<reqwest::ClientBuilder> {
        let mut builder = builder.no_proxy();
        let no_proxy = self
            .no_proxy
            .as_deref()
            .and_then(reqwest::NoProxy::from_string);

        if let Some(http) = &self.http {
            builder = builder.proxy(reqwest::Proxy::http(http)?.no_proxy(no_proxy.clone()));
        }
        if let Some(https) = &self.https {
            builder = builder.proxy(reqwest::Proxy::https(https)?.no_proxy(no_proxy));
        }
        Ok(builder)
    }

    /// Build the HTTP client used for outbound downloads.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        let builder = reqwest::Client::builder().user_agent(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        ));
        Ok(self.apply(builder)?.build()?)
    }
}

/// Resources for a runner's virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VmResources {
    pub cpu: u32,
    /// Memory size with unit, e.g. `8GiB`.
    pub memory: String,
    /// Root disk size with unit, e.g. `20GiB`.
    pub disk: String,
}

impl Default for VmResources {
    fn default() -> Self {
        Self {
            cpu: 2,
            memory: "7GiB".to_string(),
            disk: "10GiB".to_string(),
        }
    }
}

/// Attempts and fixed delay for a retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetrySettings {
    pub attempts: u32,
    pub delay_secs: u64,
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.attempts, Duration::from_secs(self.delay_secs))
    }
}

fn default_network_retry() -> RetrySettings {
    RetrySettings {
        attempts: 5,
        delay_secs: 30,
    }
}

fn default_readiness_retry() -> RetrySettings {
    RetrySettings {
        attempts: 10,
        delay_secs: 10,
    }
}

fn default_runner_bin_path() -> PathBuf {
    PathBuf::from(DEFAULT_RUNNER_BIN_PATH)
}

/// Configuration of one runner manager.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Name of the set of runners.
    pub app_name: String,
    /// Unit number of the set of runners.
    pub unit: u32,
    pub path: GithubPath,
    /// Personal access token for the registration service. Not read here;
    /// the embedder uses it to build the `RegistrationService` client.
    pub token: String,
    /// Image the runner instances boot from.
    pub image: String,
    /// Storage location for runner instances on the virtualization host.
    pub instance_storage_path: PathBuf,
    #[serde(default)]
    pub proxies: ProxySetting,
    #[serde(default = "default_runner_bin_path")]
    pub runner_bin_path: PathBuf,
    /// Retry for token issuance and runner binary download.
    #[serde(default = "default_network_retry")]
    pub network_retry: RetrySettings,
    /// Retry while waiting for a new instance to come up.
    #[serde(default = "default_readiness_retry")]
    pub readiness_retry: RetrySettings,
}

impl ManagerConfig {
    pub fn new(
        app_name: impl Into<String>,
        unit: u32,
        path: GithubPath,
        token: impl Into<String>,
        image: impl Into<String>,
        instance_storage_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            unit,
            path,
            token: token.into(),
            image: image.into(),
            instance_storage_path: instance_storage_path.into(),
            proxies: ProxySetting::default(),
            runner_bin_path: default_runner_bin_path(),
            network_retry: default_network_retry(),
            readiness_retry: default_readiness_retry(),
        }
    }

    /// `<app_name>-<unit>`, shared by every runner this manager owns.
    pub fn instance_name(&self) -> String {
        format!("{}-{}", self.app_name, self.unit)
    }

    /// Name prefix of owned runners, including the separating dash.
    pub fn fleet_prefix(&self) -> String {
        format!("{}-", self.instance_name())
    }
}
