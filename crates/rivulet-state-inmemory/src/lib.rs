//! In-memory state store implementation for Rivulet
//!
//! This crate provides in-memory implementations of the repository
//! interfaces defined in the rivulet-core crate. It is primarily useful for
//! development, testing, and simple deployments where persistence is not required.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as SyncRwLock};
use tokio::sync::RwLock;
use tracing::debug;

pub mod repositories;
pub use repositories::{
    InMemoryProcessDefinitionRepository,
    DefinitionVersions,
    InMemoryProcessInstanceRepository,
    StoredInstance,
};

use rivulet_core::{
    domain::repository::{ProcessDefinitionRepository, ProcessInstanceRepository},
    EngineConfig,
    RuntimeInterface,
};

/// Provider for in-memory state store repositories
///
/// Repositories created from the same provider share their storage.
#[derive(Clone, Default)]
pub struct InMemoryStateStoreProvider {
    // Serialized instance snapshots keyed by instance id
    instances: Arc<RwLock<HashMap<String, StoredInstance>>>,

    // Deployed definitions, every version
    definitions: Arc<SyncRwLock<DefinitionVersions>>,
}

impl InMemoryStateStoreProvider {
    /// Create a new in-memory state store provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Create repositories for use with RuntimeInterface
    pub fn create_repositories(&self) -> (
        Arc<dyn ProcessInstanceRepository>,
        Arc<dyn ProcessDefinitionRepository>,
    ) {
        let instance_repo = Arc::new(InMemoryProcessInstanceRepository::new(
            self.instances.clone(),
        ));

        let definition_repo = Arc::new(InMemoryProcessDefinitionRepository::new(
            self.definitions.clone(),
        ));

        (instance_repo, definition_repo)
    }

    /// Build a runtime interface over this provider's repositories
    pub fn create_runtime(&self, config: EngineConfig) -> RuntimeInterface {
        let (instance_repo, definition_repo) = self.create_repositories();
        debug!(
            max_propagation_steps = config.max_propagation_steps,
            "Creating in-memory runtime"
        );
        RuntimeInterface::new(instance_repo, definition_repo).with_config(config)
    }
}
