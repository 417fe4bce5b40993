//! In-memory collaborators for tests.
//!
//! `MockRegistry` and `MockHost` keep just enough state to answer listing
//! calls, record every mutation, and fail on demand.

use super::{
    ClientError, ClientResult, ExecOutput, Instance, InstanceHandle, InstanceSpec, InstanceStatus,
    RegistrationService, RunnerApplication, RunnerClients, RunnerRemoteStatus, SelfHostedRunner,
    VirtualizationHost,
};
use crate::config::{GithubOrg, GithubPath, GithubRepo, ManagerConfig, RetrySettings};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Config with zero retry delays so tests never sleep.
pub fn test_config(path: &str) -> ManagerConfig {
    let mut config = ManagerConfig::new(
        "runners",
        0,
        path.parse::<GithubPath>().unwrap(),
        "ghp_test",
        "jammy",
        "/var/lib/runners",
    );
    config.network_retry = RetrySettings {
        attempts: 2,
        delay_secs: 0,
    };
    config.readiness_retry = RetrySettings {
        attempts: 3,
        delay_secs: 0,
    };
    config
}

pub fn clients(registry: &Arc<MockRegistry>, host: &Arc<MockHost>) -> RunnerClients {
    RunnerClients::new(registry.clone(), host.clone())
}

#[derive(Default)]
struct RegistryState {
    applications: Vec<RunnerApplication>,
    runners: Vec<SelfHostedRunner>,
    failing_token_calls: u32,
    registration_tokens: u32,
    remove_tokens: u32,
    deleted: Vec<u64>,
    failing_deletes: HashSet<u64>,
    dispatch: Vec<&'static str>,
}

#[derive(Default)]
pub struct MockRegistry {
    state: Mutex<RegistryState>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_runner(&self, id: u64, name: &str, online: bool, busy: bool) {
        let status = if online {
            RunnerRemoteStatus::Online
        } else {
            RunnerRemoteStatus::Offline
        };
        self.state.lock().unwrap().runners.push(SelfHostedRunner {
            id,
            name: name.to_string(),
            status,
            busy,
            labels: Vec::new(),
        });
    }

    pub fn add_application(&self, os: &str, arch: &str, url: &str, checksum: Option<&str>) {
        self.state
            .lock()
            .unwrap()
            .applications
            .push(RunnerApplication {
                os: os.to_string(),
                architecture: arch.to_string(),
                download_url: url.to_string(),
                filename: "actions-runner.tar.gz".to_string(),
                sha256_checksum: checksum.map(str::to_string),
            });
    }

    /// Fail the next `count` token requests with a transport error.
    pub fn fail_token_calls(&self, count: u32) {
        self.state.lock().unwrap().failing_token_calls = count;
    }

    pub fn fail_delete(&self, id: u64) {
        self.state.lock().unwrap().failing_deletes.insert(id);
    }

    pub fn registration_tokens(&self) -> u32 {
        self.state.lock().unwrap().registration_tokens
    }

    pub fn remove_tokens(&self) -> u32 {
        self.state.lock().unwrap().remove_tokens
    }

    pub fn deleted(&self) -> Vec<u64> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn runner_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.runners.iter().map(|r| r.name.clone()).collect()
    }

    /// Which path variant ("repo" or "org") each call was dispatched to.
    pub fn dispatch(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().dispatch.clone()
    }

    fn issue_token(&self, kind: &'static str, removal: bool) -> ClientResult<String> {
        let mut state = self.state.lock().unwrap();
        state.dispatch.push(kind);
        if state.failing_token_calls > 0 {
            state.failing_token_calls -= 1;
            return Err(ClientError::Transport("connection reset".to_string()));
        }
        if removal {
            state.remove_tokens += 1;
            Ok(format!("remove-token-{}", state.remove_tokens))
        } else {
            state.registration_tokens += 1;
            Ok(format!("registration-token-{}", state.registration_tokens))
        }
    }

    fn applications(&self, kind: &'static str) -> ClientResult<Vec<RunnerApplication>> {
        let mut state = self.state.lock().unwrap();
        state.dispatch.push(kind);
        Ok(state.applications.clone())
    }

    fn runners(&self, kind: &'static str) -> ClientResult<Vec<SelfHostedRunner>> {
        let mut state = self.state.lock().unwrap();
        state.dispatch.push(kind);
        Ok(state.runners.clone())
    }

    fn delete(&self, kind: &'static str, runner_id: u64) -> ClientResult<()> {
        let mut state = self.state.lock().unwrap();
        state.dispatch.push(kind);
        if state.failing_deletes.contains(&runner_id) {
            return Err(ClientError::Api {
                status: 500,
                message: "internal error".to_string(),
            });
        }
        let before = state.runners.len();
        state.runners.retain(|r| r.id != runner_id);
        if state.runners.len() == before {
            return Err(ClientError::NotFound(format!("runner {}", runner_id)));
        }
        state.deleted.push(runner_id);
        Ok(())
    }
}

#[async_trait]
impl RegistrationService for MockRegistry {
    async fn list_runner_applications_for_repo(
        &self,
        _repo: &GithubRepo,
    ) -> ClientResult<Vec<RunnerApplication>> {
        self.applications("repo")
    }

    async fn list_runner_applications_for_org(
        &self,
        _org: &GithubOrg,
    ) -> ClientResult<Vec<RunnerApplication>> {
        self.applications("org")
    }

    async fn list_runners_for_repo(&self, _repo: &GithubRepo) -> ClientResult<Vec<SelfHostedRunner>> {
        self.runners("repo")
    }

    async fn list_runners_for_org(&self, _org: &GithubOrg) -> ClientResult<Vec<SelfHostedRunner>> {
        self.runners("org")
    }

    async fn create_registration_token_for_repo(&self, _repo: &GithubRepo) -> ClientResult<String> {
        self.issue_token("repo", false)
    }

    async fn create_registration_token_for_org(&self, _org: &GithubOrg) -> ClientResult<String> {
        self.issue_token("org", false)
    }

    async fn create_remove_token_for_repo(&self, _repo: &GithubRepo) -> ClientResult<String> {
        self.issue_token("repo", true)
    }

    async fn create_remove_token_for_org(&self, _org: &GithubOrg) -> ClientResult<String> {
        self.issue_token("org", true)
    }

    async fn delete_runner_from_repo(&self, _repo: &GithubRepo, runner_id: u64) -> ClientResult<()> {
        self.delete("repo", runner_id)
    }

    async fn delete_runner_from_org(&self, _org: &GithubOrg, runner_id: u64) -> ClientResult<()> {
        self.delete("org", runner_id)
    }
}

/// A command run inside an instance.
#[derive(Debug, Clone)]
pub struct ExecutedCommand {
    pub instance: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Default)]
struct HostState {
    instances: BTreeMap<String, Instance>,
    create_calls: u32,
    fail_create_on: Option<u32>,
    fail_push_on: Option<u32>,
    fail_cleanup_delete: bool,
    poisoned: HashSet<String>,
    failing_deletes: HashSet<String>,
    failing_probes: u32,
    created: Vec<String>,
    deleted: Vec<String>,
    pushed: Vec<(String, PathBuf, String)>,
    executed: Vec<ExecutedCommand>,
}

#[derive(Default)]
pub struct MockHost {
    state: Mutex<HostState>,
}

fn handle_for(name: &str) -> InstanceHandle {
    InstanceHandle(format!("lxd:{}", name))
}

fn name_of(handle: &InstanceHandle) -> String {
    handle.0.trim_start_matches("lxd:").to_string()
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_instance(&self, name: &str) {
        self.state.lock().unwrap().instances.insert(
            name.to_string(),
            Instance {
                name: name.to_string(),
                handle: handle_for(name),
                status: InstanceStatus::Running,
            },
        );
    }

    /// Make the `n`-th (1-based) `create_instance` call fail.
    pub fn fail_create_on(&self, n: u32) {
        self.state.lock().unwrap().fail_create_on = Some(n);
    }

    /// Make pushing the agent package into the `n`-th created instance fail.
    pub fn fail_push_on(&self, n: u32) {
        self.state.lock().unwrap().fail_push_on = Some(n);
    }

    /// Also fail deleting the instance whose push failed.
    pub fn fail_cleanup_delete(&self) {
        self.state.lock().unwrap().fail_cleanup_delete = true;
    }

    pub fn fail_delete(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_deletes
            .insert(name.to_string());
    }

    /// Fail the next `count` readiness probes.
    pub fn fail_probes(&self, count: u32) {
        self.state.lock().unwrap().failing_probes = count;
    }

    pub fn instance_names(&self) -> Vec<String> {
        self.state.lock().unwrap().instances.keys().cloned().collect()
    }

    pub fn create_calls(&self) -> u32 {
        self.state.lock().unwrap().create_calls
    }

    pub fn created(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn pushed(&self) -> Vec<(String, PathBuf, String)> {
        self.state.lock().unwrap().pushed.clone()
    }

    pub fn executed(&self) -> Vec<ExecutedCommand> {
        self.state.lock().unwrap().executed.clone()
    }
}

#[async_trait]
impl VirtualizationHost for MockHost {
    async fn list_instances(&self) -> ClientResult<Vec<Instance>> {
        Ok(self.state.lock().unwrap().instances.values().cloned().collect())
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> ClientResult<InstanceHandle> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        let call = state.create_calls;
        if state.fail_create_on == Some(call) {
            return Err(ClientError::Api {
                status: 500,
                message: "storage pool exhausted".to_string(),
            });
        }
        if state.fail_push_on == Some(call) {
            state.poisoned.insert(spec.name.clone());
            if state.fail_cleanup_delete {
                state.failing_deletes.insert(spec.name.clone());
            }
        }
        state.instances.insert(
            spec.name.clone(),
            Instance {
                name: spec.name.clone(),
                handle: handle_for(&spec.name),
                status: InstanceStatus::Stopped,
            },
        );
        state.created.push(spec.name.clone());
        Ok(handle_for(&spec.name))
    }

    async fn start_instance(&self, handle: &InstanceHandle) -> ClientResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.instances.get_mut(&name_of(handle)) {
            Some(instance) => {
                instance.status = InstanceStatus::Running;
                Ok(())
            }
            None => Err(ClientError::NotFound(handle.to_string())),
        }
    }

    async fn push_file(
        &self,
        handle: &InstanceHandle,
        source: &Path,
        destination: &str,
    ) -> ClientResult<()> {
        let mut state = self.state.lock().unwrap();
        let name = name_of(handle);
        if state.poisoned.contains(&name) {
            return Err(ClientError::Transport("push interrupted".to_string()));
        }
        state
            .pushed
            .push((name, source.to_path_buf(), destination.to_string()));
        Ok(())
    }

    async fn execute(
        &self,
        handle: &InstanceHandle,
        command: &[String],
        env: &[(String, String)],
    ) -> ClientResult<ExecOutput> {
        let mut state = self.state.lock().unwrap();
        let name = name_of(handle);
        if !state.instances.contains_key(&name) {
            return Err(ClientError::NotFound(handle.to_string()));
        }
        state.executed.push(ExecutedCommand {
            instance: name,
            command: command.to_vec(),
            env: env.to_vec(),
        });
        if command.first().map(String::as_str) == Some("/usr/bin/who") && state.failing_probes > 0
        {
            state.failing_probes -= 1;
            return Ok(ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "not ready".to_string(),
            });
        }
        Ok(ExecOutput::default())
    }

    async fn delete_instance(&self, handle: &InstanceHandle) -> ClientResult<()> {
        let mut state = self.state.lock().unwrap();
        let name = name_of(handle);
        if state.failing_deletes.contains(&name) {
            return Err(ClientError::Api {
                status: 500,
                message: "instance is locked".to_string(),
            });
        }
        match state.instances.remove(&name) {
            Some(_) => {
                state.deleted.push(name);
                Ok(())
            }
            None => Err(ClientError::NotFound(handle.to_string())),
        }
    }
}
