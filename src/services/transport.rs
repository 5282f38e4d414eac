mod elevate;
mod exec;
mod pool;
mod sftp;
mod shell;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use crate::config::CoreConfig;
use crate::model::Server;

pub use elevate::{elevate, needs_elevation, shell_quote};
pub use exec::{CommandResult, ProbeResult, ProbeStatus};
pub use pool::{PoolConnectionStats, PoolStats, PooledConnection};
pub use shell::ShellSession;

use pool::PoolEntry;

/// Everything the orchestrators need from the remote-execution fabric.
/// `SshPool` is the production implementation; tests substitute a scripted
/// one.
pub trait CommandTransport: Send + Sync {
    fn exec(&self, server: &Server, command: &str) -> Result<CommandResult>;

    fn exec_sequence(&self, server: &Server, commands: &[String]) -> Result<Vec<CommandResult>>;

    fn upload(&self, server: &Server, local: &Path, remote: &str) -> Result<()>;

    fn download(&self, server: &Server, remote: &str, local: &Path) -> Result<()>;
}

/// Pooled SSH transport. Long-lived connections are keyed by `user@host`,
/// shared across calls, recycled when their channel budget is spent and
/// reaped once idle. The entry map is the only shared mutable state; every
/// read-check-mutate on it happens inside one critical section.
#[derive(Clone)]
pub struct SshPool {
    connect_timeout: Duration,
    channel_ceiling: u32,
    idle_timeout: Duration,
    reap_interval: Duration,
    entries: Arc<Mutex<HashMap<String, PoolEntry>>>,
}

impl SshPool {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            connect_timeout: config.ssh_connect_timeout,
            channel_ceiling: config.ssh_channel_ceiling,
            idle_timeout: config.pool_idle_timeout,
            reap_interval: config.pool_reap_interval,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl CommandTransport for SshPool {
    fn exec(&self, server: &Server, command: &str) -> Result<CommandResult> {
        SshPool::exec(self, server, command)
    }

    fn exec_sequence(&self, server: &Server, commands: &[String]) -> Result<Vec<CommandResult>> {
        SshPool::exec_sequence(self, server, commands)
    }

    fn upload(&self, server: &Server, local: &Path, remote: &str) -> Result<()> {
        SshPool::upload(self, server, local, remote)
    }

    fn download(&self, server: &Server, remote: &str, local: &Path) -> Result<()> {
        SshPool::download(self, server, remote, local)
    }
}
