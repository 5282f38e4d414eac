use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Bounded timeout for establishing a new SSH connection.
    pub ssh_connect_timeout: Duration,
    /// Channels multiplexed over one pooled connection before it is recycled.
    pub ssh_channel_ceiling: u32,
    /// Idle time after which a zero-ref pooled connection is reaped.
    pub pool_idle_timeout: Duration,
    /// Interval between reaper passes.
    pub pool_reap_interval: Duration,
    /// Local directory holding completed snapshot archives.
    pub backup_storage_path: PathBuf,
    /// Storage ceiling for the backup directory in bytes; 0 disables the quota.
    pub backup_quota_bytes: u64,
    /// Local scratch directory for in-flight transfer archives.
    pub transfer_tmp_path: PathBuf,
    /// Fallback root for named Docker volumes when driver inspection fails.
    pub docker_volume_root: PathBuf,
}

impl CoreConfig {
    pub fn from_env() -> Result<Self> {
        let data_root_value =
            env_string("FLEET_DATA_ROOT", "/var/lib/fleet-dashboard");
        let data_root = PathBuf::from(data_root_value);
        if data_root.as_os_str().is_empty() {
            anyhow::bail!("FLEET_DATA_ROOT resolved to an empty path");
        }
        let backup_default = data_root.join("storage/snapshots");
        let tmp_default = data_root.join("storage/tmp");

        let mut config = Self {
            ssh_connect_timeout: Duration::from_secs(
                env_u64("FLEET_SSH_CONNECT_TIMEOUT_SECONDS", 10).clamp(1, 120),
            ),
            ssh_channel_ceiling: env_u32("FLEET_SSH_CHANNEL_CEILING", 8).max(1),
            pool_idle_timeout: Duration::from_secs(
                env_u64("FLEET_POOL_IDLE_TIMEOUT_SECONDS", 300).max(1),
            ),
            pool_reap_interval: Duration::from_secs(
                env_u64("FLEET_POOL_REAP_INTERVAL_SECONDS", 60).clamp(1, 3600),
            ),
            backup_storage_path: env_path(
                "FLEET_BACKUP_STORAGE_PATH",
                &backup_default.to_string_lossy(),
            )?,
            backup_quota_bytes: env_u64("FLEET_BACKUP_QUOTA_BYTES", 0),
            transfer_tmp_path: env_path(
                "FLEET_TRANSFER_TMP_PATH",
                &tmp_default.to_string_lossy(),
            )?,
            docker_volume_root: env_path(
                "FLEET_DOCKER_VOLUME_ROOT",
                "/var/lib/docker/volumes",
            )?,
        };

        config.validate_paths()?;
        Ok(config)
    }

    fn validate_paths(&mut self) -> Result<()> {
        self.backup_storage_path = validate_absolute_path(
            self.backup_storage_path.clone(),
            "FLEET_BACKUP_STORAGE_PATH",
        )?;
        self.transfer_tmp_path =
            validate_absolute_path(self.transfer_tmp_path.clone(), "FLEET_TRANSFER_TMP_PATH")?;
        self.docker_volume_root =
            validate_absolute_path(self.docker_volume_root.clone(), "FLEET_DOCKER_VOLUME_ROOT")?;
        Ok(())
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_path(key: &str, default: &str) -> Result<PathBuf> {
    let value = env_optional_string(key).unwrap_or_else(|| default.to_string());
    let path = PathBuf::from(value);
    if path.as_os_str().is_empty() {
        anyhow::bail!("{key} resolved to an empty path");
    }
    Ok(path)
}

fn validate_absolute_path(path: PathBuf, label: &str) -> Result<PathBuf> {
    if !path.is_absolute() {
        anyhow::bail!("{label} must be an absolute path");
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            anyhow::bail!("{label} must not contain '..' segments");
        }
    }
    Ok(path)
}

/// Recursive size of a directory in bytes. Missing directories count as zero.
pub fn directory_size_bytes(path: &Path) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }
    let mut total = 0u64;
    let entries = std::fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?;
    for entry in entries {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total = total.saturating_add(directory_size_bytes(&entry.path())?);
        } else {
            total = total.saturating_add(metadata.len());
        }
    }
    Ok(total)
}
