mod runner;
mod types;

use std::sync::Arc;

pub use types::{MigrationOutcome, MigrationRequest, STAGE_NAMES};

use crate::config::CoreConfig;
use crate::store::DeploymentStore;

use super::transport::CommandTransport;

/// Seven-stage pipeline relocating or duplicating a deployment (container
/// plus volumes) across two servers. Built entirely on the command transport
/// and the SFTP file-transfer primitive; runs synchronously, so callers
/// drive it from a blocking worker.
pub struct MigrationService {
    transport: Arc<dyn CommandTransport>,
    store: Arc<dyn DeploymentStore>,
    config: CoreConfig,
}

impl MigrationService {
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
