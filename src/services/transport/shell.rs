use anyhow::{anyhow, Context, Result};
use ssh2::{Channel, Session};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use crate::model::Server;

use super::SshPool;

/// Dedicated PTY-backed terminal session. Deliberately outside the pool's
/// reuse policy: its lifetime is user-driven, not request-driven, so the
/// caller owns resize, input forwarding and close until disconnect.
pub struct ShellSession {
    session: Session,
    channel: Channel,
}

impl ShellSession {
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.channel
            .write_all(data)
            .context("failed to write to shell channel")?;
        self.channel.flush().ok();
        Ok(())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let read = self
            .channel
            .read(buf)
            .context("failed to read from shell channel")?;
        Ok(read)
    }

    pub fn resize(&mut self, cols: u32, rows: u32) -> Result<()> {
        self.channel
            .request_pty_size(cols, rows, None, None)
            .context("failed to resize PTY")?;
        Ok(())
    }

    pub fn is_eof(&self) -> bool {
        self.channel.eof()
    }

    pub fn close(&mut self) {
        self.channel.send_eof().ok();
        self.channel.close().ok();
        self.channel.wait_close().ok();
        self.session
            .disconnect(None, "shell session closed", None)
            .ok();
    }
}

impl SshPool {
    /// Open an interactive shell on a dedicated, unpooled connection.
    pub fn open_shell(&self, server: &Server) -> Result<ShellSession> {
        let address = server.address();
        let addr = address
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve {address}"))?
            .next()
            .ok_or_else(|| anyhow!("no address resolved for {address}"))?;
        let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .with_context(|| format!("failed to open TCP connection to {address}"))?;

        let mut session = Session::new().context("failed to create SSH session")?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .with_context(|| format!("SSH handshake with {address} failed"))?;
        session
            .userauth_pubkey_file(&server.username, None, &server.private_key_path, None)
            .context("SSH key authentication failed")?;
        if !session.authenticated() {
            return Err(anyhow!(
                "SSH authentication failed for {}",
                server.pool_key()
            ));
        }

        let mut channel = session
            .channel_session()
            .context("failed to open shell channel")?;
        channel
            .request_pty("xterm-256color", None, Some((80, 24, 0, 0)))
            .context("failed to request PTY")?;
        channel.shell().context("failed to start remote shell")?;

        Ok(ShellSession { session, channel })
    }
}
