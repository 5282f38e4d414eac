use serde::{Deserialize, Serialize};

use crate::model::{Deployment, PortMapping, Server};

pub(super) const STAGE_STOP: &str = "Stop container";
pub(super) const STAGE_ARCHIVE: &str = "Archive volumes";
pub(super) const STAGE_DOWNLOAD: &str = "Download archive";
pub(super) const STAGE_PREPARE: &str = "Prepare target";
pub(super) const STAGE_UPLOAD: &str = "Upload and extract";
pub(super) const STAGE_CREATE: &str = "Create container";
pub(super) const STAGE_FINALIZE: &str = "Finalize";

/// Stage names in execution order, for callers that render progress.
pub const STAGE_NAMES: [&str; 7] = [
    STAGE_STOP,
    STAGE_ARCHIVE,
    STAGE_DOWNLOAD,
    STAGE_PREPARE,
    STAGE_UPLOAD,
    STAGE_CREATE,
    STAGE_FINALIZE,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub deployment: Deployment,
    pub source_server: Server,
    pub target_server: Server,
    pub new_container_name: String,
    /// Overrides the source port mappings on the target when set.
    #[serde(default)]
    pub new_port_mappings: Option<Vec<PortMapping>>,
    /// Remove the source container and deployment record on success instead
    /// of restarting it.
    pub delete_original: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationOutcome {
    pub new_deployment_id: String,
}
