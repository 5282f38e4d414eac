use serde::{Deserialize, Serialize};

use crate::model::{Deployment, Server, Snapshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub deployment: Deployment,
    pub server: Server,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub deployment: Deployment,
    pub server: Server,
    pub snapshot: Snapshot,
}
