//! Runner create/remove

use super::Runner;
use crate::clients::{ClientError, ExecOutput, Instance, InstanceHandle, InstanceSpec, InstanceStatus};
use crate::config::{GithubPath, VmResources};
use crate::{FleetError, Result};
use std::path::Path;

/// Where the agent package is pushed inside the instance.
pub const INSTANCE_RUNNER_BINARY: &str = "/home/ubuntu/github-runner-app";
/// Directory the agent package is unpacked into.
pub const INSTANCE_RUNNER_DIR: &str = "/home/ubuntu/github-runner";

const RUNNER_USER: &str = "ubuntu";
const READINESS_PROBE: &str = "/usr/bin/who";

fn config_script() -> String {
    format!("{}/config.sh", INSTANCE_RUNNER_DIR)
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn as_user(command: &[&str]) -> Vec<String> {
    ["/usr/bin/sudo", "-E", "-u", RUNNER_USER]
        .iter()
        .chain(command)
        .map(|s| s.to_string())
        .collect()
}

impl Runner {
    /// Provision the instance, install the agent, register it and start it.
    ///
    /// On failure the instance may be left half-provisioned; the caller is
    /// expected to [`Runner::remove`] this runner.
    pub async fn create(
        &mut self,
        image: &str,
        resources: &VmResources,
        binary_path: &Path,
        registration_token: &str,
    ) -> Result<()> {
        tracing::info!("Creating runner: {}", self.config.name);
        self.provision(image, resources, binary_path, registration_token)
            .await
            .map_err(|err| match err {
                FleetError::RunnerCreate(_) => err,
                other => FleetError::RunnerCreate(format!("{}: {}", self.config.name, other)),
            })
    }

    async fn provision(
        &mut self,
        image: &str,
        resources: &VmResources,
        binary_path: &Path,
        registration_token: &str,
    ) -> Result<()> {
        let host = self.clients.host.clone();
        let spec = InstanceSpec {
            name: self.config.name.clone(),
            image: image.to_string(),
            resources: resources.clone(),
            storage_path: self.config.instance_storage_path.clone(),
        };

        let handle = host.create_instance(&spec).await?;
        // Recorded before anything else can fail so cleanup reaches the instance.
        self.instance = Some(Instance {
            name: self.config.name.clone(),
            handle: handle.clone(),
            status: InstanceStatus::Stopped,
        });
        self.status.exists = true;
        self.status.running = true;

        host.start_instance(&handle).await?;
        self.wait_until_ready(&handle).await?;

        tracing::debug!("Installing runner binary on {}", self.config.name);
        host.push_file(&handle, binary_path, INSTANCE_RUNNER_BINARY)
            .await?;
        let owner = format!("{}:{}", RUNNER_USER, RUNNER_USER);
        self.run(&handle, "mkdir", &strings(&["/usr/bin/mkdir", "-p", INSTANCE_RUNNER_DIR]), &[])
            .await?;
        self.run(
            &handle,
            "unpack",
            &strings(&[
                "/usr/bin/tar",
                "-xzf",
                INSTANCE_RUNNER_BINARY,
                "-C",
                INSTANCE_RUNNER_DIR,
            ]),
            &[],
        )
        .await?;
        self.run(
            &handle,
            "chown",
            &strings(&["/usr/bin/chown", "-R", owner.as_str(), INSTANCE_RUNNER_DIR]),
            &[],
        )
        .await?;

        tracing::debug!("Registering runner {} to {}", self.config.name, self.config.path);
        let env = self.config.proxies.env();
        let url = self.config.path.url();
        let script = config_script();
        let register = as_user(&[
            script.as_str(),
            "--url",
            url.as_str(),
            "--token",
            registration_token,
            "--ephemeral",
            "--unattended",
            "--labels",
            self.config.app_name.as_str(),
            "--name",
            self.config.name.as_str(),
        ]);
        self.run(&handle, "register", &register, &env).await?;

        let start = format!(
            "cd {} && /usr/bin/nohup ./run.sh > run.log 2>&1 &",
            INSTANCE_RUNNER_DIR
        );
        self.run(&handle, "start", &as_user(&["/usr/bin/sh", "-c", start.as_str()]), &env)
            .await?;

        if let Some(instance) = self.instance.as_mut() {
            instance.status = InstanceStatus::Running;
        }
        Ok(())
    }

    async fn wait_until_ready(&self, handle: &InstanceHandle) -> Result<()> {
        let host = &self.clients.host;
        let probe = strings(&[READINESS_PROBE]);
        let probe = probe.as_slice();
        self.readiness
            .run(
                "instance readiness probe",
                || async move {
                    match host.execute(handle, probe, &[]).await {
                        Ok(output) if output.success() => Ok(()),
                        Ok(output) => Err(ClientError::Transport(format!(
                            "probe exited with {}",
                            output.exit_code
                        ))),
                        Err(err) => Err(err),
                    }
                },
                |_| true,
            )
            .await?;
        Ok(())
    }

    /// Run one bootstrap step. Only the step name is reported on failure: the
    /// command line can carry a token.
    async fn run(
        &self,
        handle: &InstanceHandle,
        step: &str,
        command: &[String],
        env: &[(String, String)],
    ) -> Result<ExecOutput> {
        let output = self.clients.host.execute(handle, command, env).await?;
        if !output.success() {
            return Err(FleetError::RunnerCreate(format!(
                "{}: {} step exited with {}: {}",
                self.config.name,
                step,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    /// Deregister the runner and tear down its instance.
    ///
    /// Either side may already be gone. A genuine failure on one side does not
    /// stop the other side from being cleaned; the first failure is returned.
    pub async fn remove(&mut self, removal_token: &str) -> Result<()> {
        tracing::info!("Removing runner: {}", self.config.name);
        let mut failures = Vec::new();
        let handle = self.instance.as_ref().map(|instance| instance.handle.clone());

        if let Some(handle) = &handle {
            let script = config_script();
            let command = as_user(&[script.as_str(), "remove", "--token", removal_token]);
            match self
                .clients
                .host
                .execute(handle, &command, &self.config.proxies.env())
                .await
            {
                Ok(output) if output.success() => {
                    tracing::debug!("Runner {} deregistered itself", self.config.name)
                }
                Ok(output) => tracing::warn!(
                    "Runner {} deregistration exited with {}: {}",
                    self.config.name,
                    output.exit_code,
                    output.stderr.trim()
                ),
                Err(err) => tracing::warn!(
                    "Unable to run deregistration on runner {}: {}",
                    self.config.name,
                    err
                ),
            }
        }

        if let Some(runner_id) = self.status.registration_id {
            let registry = &self.clients.registry;
            let result = match &self.config.path {
                GithubPath::Repo(repo) => registry.delete_runner_from_repo(repo, runner_id).await,
                GithubPath::Org(org) => registry.delete_runner_from_org(org, runner_id).await,
            };
            let deregistered = match result {
                Ok(()) => true,
                Err(err) if err.is_not_found() => {
                    tracing::debug!("Registration {} of {} already gone", runner_id, self.config.name);
                    true
                }
                Err(err) => {
                    failures.push(format!("deregister id {}: {}", runner_id, err));
                    false
                }
            };
            if deregistered {
                self.status.registration_id = None;
                self.status.online = false;
                self.status.busy = None;
            }
        }

        if let Some(handle) = &handle {
            let deleted = match self.clients.host.delete_instance(handle).await {
                Ok(()) => true,
                Err(err) if err.is_not_found() => {
                    tracing::debug!("Instance {} already gone", handle);
                    true
                }
                Err(err) => {
                    failures.push(format!("delete instance {}: {}", handle, err));
                    false
                }
            };
            if deleted {
                self.instance = None;
                self.status.exists = false;
                self.status.running = false;
            }
        }

        match failures.into_iter().next() {
            None => Ok(()),
            Some(failure) => Err(FleetError::RunnerRemove(format!(
                "{}: {}",
                self.config.name, failure
            ))),
        }
    }
}
