use anyhow::{Context, Result};
use ssh2::Session;
use std::fs;
use std::path::Path;

use crate::model::Server;

use super::pool::lock_unpoisoned;
use super::SshPool;

fn sftp_upload(session: &Session, local: &Path, remote: &str) -> Result<()> {
    let sftp = session.sftp().context("SFTP unavailable")?;
    let mut local_file = fs::File::open(local)
        .with_context(|| format!("failed to open {}", local.display()))?;
    let mut remote_file = sftp
        .create(Path::new(remote))
        .with_context(|| format!("failed to create remote file {remote}"))?;
    std::io::copy(&mut local_file, &mut remote_file)
        .with_context(|| format!("failed to upload {} to {remote}", local.display()))?;
    Ok(())
}

fn sftp_download(session: &Session, remote: &str, local: &Path) -> Result<()> {
    let sftp = session.sftp().context("SFTP unavailable")?;
    let mut remote_file = sftp
        .open(Path::new(remote))
        .with_context(|| format!("failed to open remote file {remote}"))?;
    if let Some(parent) = local.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let mut local_file = fs::File::create(local)
        .with_context(|| format!("failed to create {}", local.display()))?;
    std::io::copy(&mut remote_file, &mut local_file)
        .with_context(|| format!("failed to download {remote} to {}", local.display()))?;
    Ok(())
}

impl SshPool {
    /// Copy a local file to the remote host over a pooled connection. Same
    /// release-always discipline as `exec`.
    pub fn upload(&self, server: &Server, local: &Path, remote: &str) -> Result<()> {
        let conn = self.acquire(server)?;
        let result = {
            let session = lock_unpoisoned(&conn.session);
            sftp_upload(&session, local, remote)
        };
        self.release(&conn.key);
        result.map_err(|err| {
            self.force_close(&conn.key);
            err.context(format!("transport failure on {}", conn.key))
        })
    }

    /// Copy a remote file into local storage over a pooled connection.
    pub fn download(&self, server: &Server, remote: &str, local: &Path) -> Result<()> {
        let conn = self.acquire(server)?;
        let result = {
            let session = lock_unpoisoned(&conn.session);
            sftp_download(&session, remote, local)
        };
        self.release(&conn.key);
        result.map_err(|err| {
            self.force_close(&conn.key);
            err.context(format!("transport failure on {}", conn.key))
        })
    }
}
