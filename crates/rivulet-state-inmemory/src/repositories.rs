use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock as SyncRwLock};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use async_trait::async_trait;

use rivulet_core::{
    CoreError,
    ProcessDefinition,
    ProcessId,
    ProcessInstance,
    ProcessInstanceId,
    domain::repository::{ProcessDefinitionRepository, ProcessInstanceRepository},
};

/// Serialized snapshot of one process instance
#[derive(Debug, Clone)]
pub struct StoredInstance {
    /// Definition the instance belongs to
    pub process_id: ProcessId,
    /// JSON snapshot
    pub snapshot: String,
}

/// In-memory implementation of the ProcessInstanceRepository
///
/// Instances are stored as serialized snapshots, so every load yields an
/// independent copy and collaborators have to be attached by the caller.
pub struct InMemoryProcessInstanceRepository {
    instances: Arc<RwLock<HashMap<String, StoredInstance>>>,
}

impl InMemoryProcessInstanceRepository {
    /// Create a new in-memory process instance repository
    pub fn new(instances: Arc<RwLock<HashMap<String, StoredInstance>>>) -> Self {
        Self { instances }
    }
}

#[async_trait]
impl ProcessInstanceRepository for InMemoryProcessInstanceRepository {
    async fn find_by_id(&self, id: &ProcessInstanceId) -> Result<Option<ProcessInstance>, CoreError> {
        let instances = self.instances.read().await;
        match instances.get(id.as_str()) {
            Some(stored) => {
                let instance = ProcessInstance::deserialize(&stored.snapshot).map_err(|e| {
                    warn!(process_instance_id = %id, error = %e, "Stored snapshot is unreadable");
                    CoreError::StateStoreError(format!("Failed to restore instance {}: {}", id, e))
                })?;
                Ok(Some(instance))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, instance: &ProcessInstance) -> Result<(), CoreError> {
        let snapshot = instance.serialize()?;
        debug!(
            process_instance_id = %instance.id(),
            bytes = snapshot.len(),
            "Saving process instance snapshot"
        );
        let mut instances = self.instances.write().await;
        instances.insert(
            instance.id().to_string(),
            StoredInstance {
                process_id: instance.process_id().clone(),
                snapshot,
            },
        );
        Ok(())
    }

    async fn delete(&self, id: &ProcessInstanceId) -> Result<(), CoreError> {
        let mut instances = self.instances.write().await;
        instances.remove(id.as_str());
        Ok(())
    }

    async fn find_all_for_process(&self, process_id: &ProcessId) -> Result<Vec<ProcessInstanceId>, CoreError> {
        let instances = self.instances.read().await;

        let mut matching: Vec<ProcessInstanceId> = instances
            .iter()
            .filter(|(_, stored)| &stored.process_id == process_id)
            .map(|(id, _)| ProcessInstanceId::new(id.clone()))
            .collect();
        matching.sort();

        Ok(matching)
    }
}

/// Every stored version of every definition
pub type DefinitionVersions = HashMap<ProcessId, BTreeMap<u32, ProcessDefinition>>;

/// In-memory implementation of the ProcessDefinitionRepository
///
/// Definition lookups happen in the middle of token propagation, which is
/// synchronous, so this store sits behind a blocking lock.
pub struct InMemoryProcessDefinitionRepository {
    definitions: Arc<SyncRwLock<DefinitionVersions>>,
}

impl InMemoryProcessDefinitionRepository {
    /// Create a new in-memory process definition repository
    pub fn new(definitions: Arc<SyncRwLock<DefinitionVersions>>) -> Self {
        Self { definitions }
    }

    /// Every deployed process identifier
    pub fn list_definitions(&self) -> Vec<ProcessId> {
        let definitions = self.definitions.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<ProcessId> = definitions.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl ProcessDefinitionRepository for InMemoryProcessDefinitionRepository {
    fn get_latest_by_id(&self, id: &ProcessId) -> Option<ProcessDefinition> {
        let definitions = self.definitions.read().unwrap_or_else(PoisonError::into_inner);
        definitions
            .get(id)
            .and_then(|versions| versions.values().next_back().cloned())
    }

    fn get_by_id_and_version(&self, id: &ProcessId, version: u32) -> Option<ProcessDefinition> {
        let definitions = self.definitions.read().unwrap_or_else(PoisonError::into_inner);
        definitions
            .get(id)
            .and_then(|versions| versions.get(&version).cloned())
    }

    fn add(&self, definition: ProcessDefinition) -> Result<(), CoreError> {
        definition.validate()?;

        let mut definitions = self.definitions.write().unwrap_or_else(PoisonError::into_inner);
        let versions = definitions.entry(definition.id().clone()).or_default();
        if versions.contains_key(&definition.version()) {
            return Err(CoreError::Logic(format!(
                "Process definition {} version {} already exists",
                definition.id(),
                definition.version()
            )));
        }

        debug!(
            process_id = %definition.id(),
            version = definition.version(),
            "Storing process definition"
        );
        versions.insert(definition.version(), definition);
        Ok(())
    }

    fn find_by_name(&self, name: &str) -> Vec<ProcessDefinition> {
        let definitions = self.definitions.read().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<ProcessDefinition> = definitions
            .values()
            .filter_map(|versions| {
                versions
                    .values()
                    .rev()
                    .find(|definition| definition.name() == Some(name))
                    .cloned()
            })
            .collect();
        found.sort_by(|a, b| a.id().cmp(b.id()));
        found
    }
}
