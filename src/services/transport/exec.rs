use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use ssh2::Session;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::model::Server;

use super::pool::lock_unpoisoned;
use super::SshPool;

/// Captured output of one remote command. A non-zero exit code is data, not
/// an error; callers decide what it means.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub status: ProbeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub(super) fn run_channel_command(session: &Session, command: &str) -> Result<CommandResult> {
    let mut channel = session
        .channel_session()
        .context("failed to open SSH channel")?;
    channel
        .exec(command)
        .with_context(|| format!("failed to exec {command}"))?;
    let mut stdout = String::new();
    channel.read_to_string(&mut stdout).ok();
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr).ok();
    channel.wait_close().ok();
    let exit_code = channel.exit_status().unwrap_or(-1);
    Ok(CommandResult {
        stdout,
        stderr,
        exit_code,
    })
}

impl SshPool {
    /// Run one shell command over a pooled connection. Every acquire is
    /// matched by exactly one release, on success and on error alike; a
    /// transport-level failure additionally evicts the connection so the
    /// next caller reconnects.
    pub fn exec(&self, server: &Server, command: &str) -> Result<CommandResult> {
        let conn = self.acquire(server)?;
        let result = {
            let session = lock_unpoisoned(&conn.session);
            run_channel_command(&session, command)
        };
        self.release(&conn.key);
        match result {
            Ok(result) => Ok(result),
            Err(err) => {
                self.force_close(&conn.key);
                Err(err).with_context(|| format!("transport failure on {}", conn.key))
            }
        }
    }

    /// Run commands strictly in order. A transport failure on one command is
    /// captured as `{stdout: "", stderr: <message>, exit_code: -1}` and the
    /// sequence continues; callers needing short-circuit behavior implement
    /// it themselves.
    pub fn exec_sequence(
        &self,
        server: &Server,
        commands: &[String],
    ) -> Result<Vec<CommandResult>> {
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

    /// Standalone reachability probe. Opens its own connection with its own
    /// timeout and never touches the pool.
    pub fn test_connection(
        &self,
        host: &str,
        port: u16,
        username: &str,
        private_key_path: &std::path::Path,
    ) -> ProbeResult {
        match probe(host, port, username, private_key_path, self.connect_timeout) {
            Ok(()) => ProbeResult {
                status: ProbeStatus::Online,
                error: None,
            },
            Err(err) => ProbeResult {
                status: ProbeStatus::Offline,
                error: Some(format!("{err:#}")),
            },
        }
    }
}

fn probe(
    host: &str,
    port: u16,
    username: &str,
    private_key_path: &std::path::Path,
    timeout: Duration,
) -> Result<()> {
    let address = format!("{host}:{port}");
    let addr = address
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {address}"))?
        .next()
        .ok_or_else(|| anyhow!("no address resolved for {address}"))?;
    let tcp = TcpStream::connect_timeout(&addr, timeout)
        .with_context(|| format!("failed to open TCP connection to {address}"))?;
    tcp.set_read_timeout(Some(timeout)).ok();
    tcp.set_write_timeout(Some(timeout)).ok();

    let mut session = Session::new().context("failed to create SSH session")?;
    session.set_tcp_stream(tcp);
    session.handshake().context("SSH handshake failed")?;
    session
        .userauth_pubkey_file(username, None, private_key_path, None)
        .context("SSH key authentication failed")?;
    if !session.authenticated() {
        return Err(anyhow!("SSH authentication failed"));
    }
    session.disconnect(None, "probe complete", None).ok();
    Ok(())
}
