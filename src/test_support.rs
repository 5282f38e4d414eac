//! Shared fixtures for the inline test modules: a scripted transport that
//! records every remote command, an in-memory deployment store, and small
//! builders for servers and deployments.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;

use crate::config::CoreConfig;
use crate::model::{
    Deployment, DeploymentStatus, PortMapping, Server, Snapshot, VolumeMapping,
};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::services::transport::{CommandResult, CommandTransport};
use crate::store::DeploymentStore;

/// Config rooted in a throwaway directory. The directory is intentionally
/// leaked for the lifetime of the test process.
pub fn test_config() -> CoreConfig {
    let root = tempfile::tempdir().expect("create temp dir").keep();
    CoreConfig {
        ssh_connect_timeout: Duration::from_secs(2),
        ssh_channel_ceiling: 8,
        pool_idle_timeout: Duration::from_secs(300),
        pool_reap_interval: Duration::from_secs(60),
        backup_storage_path: root.join("snapshots"),
        backup_quota_bytes: 0,
        transfer_tmp_path: root.join("tmp"),
        docker_volume_root: PathBuf::from("/var/lib/docker/volumes"),
    }
}

pub fn test_server(id: &str) -> Server {
    Server {
        id: id.to_string(),
        host: format!("{id}.example"),
        port: 22,
        username: "deploy".to_string(),
        private_key_path: PathBuf::from("/keys/id_ed25519"),
    }
}

/// Deployment named `app-1` with one port mapping and the given volumes.
/// Each volume is a `(host, container)` pair; absolute hosts are binds.
pub fn test_deployment(id: &str, server_id: &str, volumes: &[(&str, &str)]) -> Deployment {
    Deployment {
        id: id.to_string(),
        app_id: "app".to_string(),
        server_id: server_id.to_string(),
        container_id: "c0ffee".to_string(),
        container_name: "app-1".to_string(),
        image: "app:latest".to_string(),
        volumes: volumes
            .iter()
            .map(|(host, container)| VolumeMapping {
                host: host.to_string(),
                container: container.to_string(),
            })
            .collect(),
        ports: vec![PortMapping {
            host_port: 8080,
            container_port: 80,
        }],
        env: vec!["RUST_LOG=info".to_string()],
        restart_policy: None,
        network_mode: None,
        extra_args: Vec::new(),
        command: None,
        status: DeploymentStatus::Running,
    }
}

struct ScriptedResponse {
    pattern: String,
    result: CommandResult,
}

/// Transport double: records every command and transfer, answers exit 0 with
/// empty output unless a scripted response matches, and can flip a
/// cancellation token when a given command shows up.
#[derive(Default)]
pub struct ScriptedTransport {
    commands: Mutex<Vec<String>>,
    responses: Mutex<Vec<ScriptedResponse>>,
    uploads: Mutex<Vec<(PathBuf, String)>>,
    downloads: Mutex<Vec<(String, PathBuf)>>,
    cancel_triggers: Mutex<Vec<(String, CancellationToken)>>,
    download_failure: Mutex<Option<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the result for any command containing `pattern`. Later
    /// registrations win over earlier ones.
    pub fn respond_with(&self, pattern: &str, exit_code: i32, stdout: &str, stderr: &str) {
        self.responses.lock().unwrap().push(ScriptedResponse {
            pattern: pattern.to_string(),
            result: CommandResult {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                exit_code,
            },
        });
    }

    /// Make every subsequent download fail with the given message.
    pub fn fail_downloads_with(&self, message: &str) {
        *self.download_failure.lock().unwrap() = Some(message.to_string());
    }

    /// Cancel `token` the first time a command containing `pattern` runs.
    pub fn cancel_when_seen(&self, pattern: &str, token: CancellationToken) {
        self.cancel_triggers
            .lock()
            .unwrap()
            .push((pattern.to_string(), token));
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn saw_command(&self, command: &str) -> bool {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .any(|seen| seen == command)
    }

    pub fn saw_command_containing(&self, fragment: &str) -> bool {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .any(|seen| seen.contains(fragment))
    }

    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn downloads(&self) -> Vec<(String, PathBuf)> {
        self.downloads.lock().unwrap().clone()
    }
}

impl CommandTransport for ScriptedTransport {
    fn exec(&self, _server: &Server, command: &str) -> Result<CommandResult> {
        self.commands.lock().unwrap().push(command.to_string());
        for (pattern, token) in self.cancel_triggers.lock().unwrap().iter() {
            if command.contains(pattern.as_str()) {
                token.cancel();
            }
        }
        let responses = self.responses.lock().unwrap();
        let scripted = responses
            .iter()
            .rev()
            .find(|response| command.contains(response.pattern.as_str()));
        Ok(match scripted {
            Some(response) => response.result.clone(),
            None => CommandResult {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            },
        })
    }

    fn exec_sequence(&self, server: &Server, commands: &[String]) -> Result<Vec<CommandResult>> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            match self.exec(server, command) {
                Ok(result) => results.push(result),
                Err(err) => results.push(CommandResult {
                    stdout: String::new(),
                    stderr: format!("{err:#}"),
                    exit_code: -1,
                }),
            }
        }
        Ok(results)
    }

    fn upload(&self, _server: &Server, local: &Path, remote: &str) -> Result<()> {
        self.uploads
            .lock()
            .unwrap()
            .push((local.to_path_buf(), remote.to_string()));
        Ok(())
    }

    fn download(&self, _server: &Server, remote: &str, local: &Path) -> Result<()> {
        if let Some(message) = self.download_failure.lock().unwrap().as_deref() {
            bail!("{message}");
        }
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local, b"scripted archive")?;
        self.downloads
            .lock()
            .unwrap()
            .push((remote.to_string(), local.to_path_buf()));
        Ok(())
    }
}

#[derive(Default)]
struct MemoryStoreInner {
    deployments: HashMap<String, Deployment>,
    status_history: HashMap<String, Vec<DeploymentStatus>>,
    snapshots: Vec<Snapshot>,
}

/// In-memory [`DeploymentStore`] that keeps a per-deployment status history
/// so tests can assert on transitions, not just the end state.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_deployment(&self, deployment: Deployment) {
        self.inner
            .lock()
            .unwrap()
            .deployments
            .insert(deployment.id.clone(), deployment);
    }

    pub fn deployment(&self, id: &str) -> Option<Deployment> {
        self.inner.lock().unwrap().deployments.get(id).cloned()
    }

    pub fn deployment_count(&self) -> usize {
        self.inner.lock().unwrap().deployments.len()
    }

    pub fn status_of(&self, id: &str) -> Option<DeploymentStatus> {
        self.inner
            .lock()
            .unwrap()
            .deployments
            .get(id)
            .map(|deployment| deployment.status)
    }

    /// Statuses written through `set_status`, in order. The seeded status is
    /// not part of the history.
    pub fn status_history(&self, id: &str) -> Vec<DeploymentStatus> {
        self.inner
            .lock()
            .unwrap()
            .status_history
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.inner.lock().unwrap().snapshots.clone()
    }
}

impl DeploymentStore for MemoryStore {
    fn set_status(&self, deployment_id: &str, status: DeploymentStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(deployment) = inner.deployments.get_mut(deployment_id) else {
            bail!("unknown deployment {deployment_id}");
        };
        deployment.status = status;
        inner
            .status_history
            .entry(deployment_id.to_string())
            .or_default()
            .push(status);
        Ok(())
    }

    fn insert_deployment(&self, deployment: &Deployment) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.deployments.contains_key(&deployment.id) {
            bail!("deployment {} already exists", deployment.id);
        }
        inner
            .deployments
            .insert(deployment.id.clone(), deployment.clone());
        Ok(())
    }

    fn remove_deployment(&self, deployment_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.deployments.remove(deployment_id).is_none() {
            bail!("unknown deployment {deployment_id}");
        }
        Ok(())
    }

    fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.inner.lock().unwrap().snapshots.push(snapshot.clone());
        Ok(())
    }

    fn update_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(stored) = inner
            .snapshots
            .iter_mut()
            .find(|stored| stored.id == snapshot.id)
        else {
            bail!("unknown snapshot {}", snapshot.id);
        };
        *stored = snapshot.clone();
        Ok(())
    }
}

/// Progress sink that keeps every event for assertions.
#[derive(Default)]
pub struct CollectingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressSink for CollectingProgress {
    fn report(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}
