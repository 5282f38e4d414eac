use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// SSH endpoint descriptor resolved by the persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub private_key_path: PathBuf,
}

fn default_ssh_port() -> u16 {
    22
}

impl Server {
    /// Pool key for this endpoint. Connections are shared per user+host only.
    pub fn pool_key(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One volume attached to a deployment. `host` is either an absolute bind
/// path or the name of a Docker-managed volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMapping {
    pub host: String,
    pub container: String,
}

impl VolumeMapping {
    pub fn is_bind_mount(&self) -> bool {
        self.host.starts_with('/')
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Running,
    Stopped,
    Snapshotting,
    Restoring,
    Migrating,
}

/// One application container on a specific server, as resolved by the
/// persistence layer. The container configuration fields are carried so a
/// migration can recreate the container with merged settings on the target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub app_id: String,
    pub server_id: String,
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    #[serde(default)]
    pub volumes: Vec<VolumeMapping>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub restart_policy: Option<String>,
    #[serde(default)]
    pub network_mode: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub command: Option<String>,
    pub status: DeploymentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Creating,
    Complete,
    Failed,
}

/// Local archive of one deployment's volumes. Created in `creating` state at
/// pipeline start and finalized to `complete` (with its size) or `failed`;
/// never left partially visible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub deployment_id: String,
    pub server_id: String,
    pub archive_filename: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub notes: Option<String>,
    pub status: SnapshotStatus,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_key_is_user_at_host() {
        let server = Server {
            id: "srv-1".to_string(),
            host: "10.0.0.5".to_string(),
            port: 22,
            username: "deploy".to_string(),
            private_key_path: PathBuf::from("/keys/id_ed25519"),
        };
        assert_eq!(server.pool_key(), "deploy@10.0.0.5");
        assert_eq!(server.address(), "10.0.0.5:22");
    }

    #[test]
    fn bind_mounts_are_absolute_paths() {
        let bind = VolumeMapping {
            host: "/data".to_string(),
            container: "/app/data".to_string(),
        };
        let named = VolumeMapping {
            host: "app_data".to_string(),
            container: "/app/data".to_string(),
        };
        assert!(bind.is_bind_mount());
        assert!(!named.is_bind_mount());
    }

    #[test]
    fn status_serializes_lowercase() {
        let status = serde_json::to_string(&DeploymentStatus::Migrating).unwrap();
        assert_eq!(status, "\"migrating\"");
        let status = serde_json::to_string(&SnapshotStatus::Creating).unwrap();
        assert_eq!(status, "\"creating\"");
    }
}
