mod runner;
mod types;

use std::sync::Arc;

pub use types::{RestoreRequest, SnapshotRequest};

use crate::config::CoreConfig;
use crate::store::DeploymentStore;

use super::transport::CommandTransport;

/// Volume snapshot pipelines: archive a deployment's volumes into local
/// backup storage, and restore such an archive in place. Synchronous like the
/// migration pipeline; callers drive it from a blocking worker.
pub struct SnapshotService {
    transport: Arc<dyn CommandTransport>,
    store: Arc<dyn DeploymentStore>,
    config: CoreConfig,
}

impl SnapshotService {
    pub fn new(
        transport: Arc<dyn CommandTransport>,
        store: Arc<dyn DeploymentStore>,
        config: CoreConfig,
    ) -> Self {
        Self {
            transport,
            store,
            config,
        }
    }
}
