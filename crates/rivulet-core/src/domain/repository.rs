//! Repository traits for the Rivulet core
//!
//! This module defines the repository traits used by the engine and the
//! runtime interface. External crates implement them to provide different
//! persistence mechanisms.

use async_trait::async_trait;

use super::process_definition::ProcessDefinition;
use super::process_instance::ProcessInstance;
use crate::types::{ProcessId, ProcessInstanceId};
use crate::CoreError;

/// Versioned store of process definitions
///
/// Lookups are synchronous: call activities resolve their called process
/// in the middle of token propagation.
pub trait ProcessDefinitionRepository: Send + Sync {
    /// Highest version of the definition
    fn get_latest_by_id(&self, id: &ProcessId) -> Option<ProcessDefinition>;

    /// A specific version of the definition
    fn get_by_id_and_version(&self, id: &ProcessId, version: u32) -> Option<ProcessDefinition>;

    /// Register a definition; rejects invalid definitions and duplicate versions
    fn add(&self, definition: ProcessDefinition) -> Result<(), CoreError>;

    /// Latest versions of every definition carrying `name`
    fn find_by_name(&self, name: &str) -> Vec<ProcessDefinition>;
}

/// Repository for process instances
#[async_trait]
pub trait ProcessInstanceRepository: Send + Sync {
    /// Find a process instance by ID
    async fn find_by_id(&self, id: &ProcessInstanceId)
        -> Result<Option<ProcessInstance>, CoreError>;

    /// Save a process instance
    async fn save(&self, instance: &ProcessInstance) -> Result<(), CoreError>;

    /// Delete a process instance
    async fn delete(&self, id: &ProcessInstanceId) -> Result<(), CoreError>;

    /// Find all instances of a process definition
    async fn find_all_for_process(
        &self,
        process_id: &ProcessId,
    ) -> Result<Vec<ProcessInstanceId>, CoreError>;
}

/// Memory implementations for testing
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use dashmap::DashMap;
    use std::sync::Arc;

    /// In-memory definition repository backed by a concurrent map
    pub struct MemoryProcessDefinitionRepository {
        definitions: Arc<DashMap<ProcessId, Vec<ProcessDefinition>>>,
    }

    impl MemoryProcessDefinitionRepository {
        /// Create an empty repository
        pub fn new() -> Self {
            Self {
                definitions: Arc::new(DashMap::with_capacity(16)),
            }
        }
    }

    impl Default for MemoryProcessDefinitionRepository {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ProcessDefinitionRepository for MemoryProcessDefinitionRepository {
        fn get_latest_by_id(&self, id: &ProcessId) -> Option<ProcessDefinition> {
            self.definitions
                .get(id)
                .and_then(|versions| versions.iter().max_by_key(|d| d.version()).cloned())
        }

        fn get_by_id_and_version(&self, id: &ProcessId, version: u32) -> Option<ProcessDefinition> {
            self.definitions.get(id).and_then(|versions| {
                versions
                    .iter()
                    .find(|definition| definition.version() == version)
                    .cloned()
            })
        }

        fn add(&self, definition: ProcessDefinition) -> Result<(), CoreError> {
            definition.validate()?;
            let mut versions = self.definitions.entry(definition.id().clone()).or_default();
            if versions.iter().any(|d| d.version() == definition.version()) {
                return Err(CoreError::Logic(format!(
                    "Process definition {} version {} already exists",
                    definition.id(),
                    definition.version()
                )));
            }
            versions.push(definition);
            Ok(())
        }

        fn find_by_name(&self, name: &str) -> Vec<ProcessDefinition> {
            let mut found: Vec<ProcessDefinition> = self
                .definitions
                .iter()
                .filter_map(|entry| {
                    entry
                        .value()
                        .iter()
                        .filter(|d| d.name() == Some(name))
                        .max_by_key(|d| d.version())
                        .cloned()
                })
                .collect();
            found.sort_by(|a, b| a.id().cmp(b.id()));
            found
        }
    }

    /// In-memory instance repository keeping live clones
    pub struct MemoryProcessInstanceRepository {
        instances: Arc<DashMap<ProcessInstanceId, ProcessInstance>>,
    }

    impl MemoryProcessInstanceRepository {
        /// Create an empty repository
        pub fn new() -> Self {
            Self {
                instances: Arc::new(DashMap::with_capacity(64)),
            }
        }
    }

    impl Default for MemoryProcessInstanceRepository {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ProcessInstanceRepository for MemoryProcessInstanceRepository {
        async fn find_by_id(
            &self,
            id: &ProcessInstanceId,
        ) -> Result<Option<ProcessInstance>, CoreError> {
            Ok(self.instances.get(id).map(|instance| instance.clone()))
        }

        async fn save(&self, instance: &ProcessInstance) -> Result<(), CoreError> {
            self.instances.insert(instance.id().clone(), instance.clone());
            Ok(())
        }

        async fn delete(&self, id: &ProcessInstanceId) -> Result<(), CoreError> {
            self.instances.remove(id);
            Ok(())
        }

        async fn find_all_for_process(
            &self,
            process_id: &ProcessId,
        ) -> Result<Vec<ProcessInstanceId>, CoreError> {
            let mut ids: Vec<ProcessInstanceId> = self
                .instances
                .iter()
                .filter(|entry| entry.value().process_id() == process_id)
                .map(|entry| entry.key().clone())
                .collect();
            ids.sort();
            Ok(ids)
        }
    }
}
