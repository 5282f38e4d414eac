use anyhow::Result;

use crate::model::{Deployment, DeploymentStatus, Snapshot};

/// Seam to the persistence collaborator. The orchestrators are the sole
/// writers of the transient statuses (`migrating`, `snapshotting`,
/// `restoring`); everything else about deployment CRUD lives outside the
/// core. Implementations must be safe to call from blocking worker threads.
pub trait DeploymentStore: Send + Sync {
    fn set_status(&self, deployment_id: &str, status: DeploymentStatus) -> Result<()>;

    fn insert_deployment(&self, deployment: &Deployment) -> Result<()>;

    fn remove_deployment(&self, deployment_id: &str) -> Result<()>;

    fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    fn update_snapshot(&self, snapshot: &Snapshot) -> Result<()>;
}
