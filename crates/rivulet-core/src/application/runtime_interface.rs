use crate::{
    application::process::{EventContext, Process, WorkItemContext},
    config::EngineConfig,
    domain::events::DomainEvent,
    domain::operation::Collaborators,
    domain::process_definition::ProcessDefinition,
    domain::process_instance::{ProcessInstance, ProcessInstanceState},
    domain::repository::{ProcessDefinitionRepository, ProcessInstanceRepository},
    types::{FlowObjectId, ProcessId, ProcessInstanceId},
    CoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Summary information about a process instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInstanceSummary {
    /// Process instance ID
    pub id: ProcessInstanceId,

    /// Process definition ID
    pub process_id: ProcessId,

    /// Process definition version
    pub version: u32,

    /// Current state
    pub state: ProcessInstanceState,

    /// Whether the instance is suspended
    pub suspended: bool,

    /// Start timestamp
    pub started_at: Option<DateTime<Utc>>,

    /// End timestamp
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<&ProcessInstance> for ProcessInstanceSummary {
    fn from(instance: &ProcessInstance) -> Self {
        Self {
            id: instance.id().clone(),
            process_id: instance.process_id().clone(),
            version: instance.version(),
            state: instance.state(),
            suspended: instance.is_suspended(),
            started_at: instance.started_at(),
            ended_at: instance.ended_at(),
        }
    }
}

/// Receives the domain events raised by an operation once it is saved
#[async_trait]
pub trait DomainEventHandler: Send + Sync {
    /// Handle a domain event
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError>;
}

/// The main API provided by Rivulet to external systems
///
/// Every mutating call loads the instance from the instance repository,
/// attaches the runtime collaborators, applies exactly one engine operation
/// and saves the instance back. Failed operations are not saved. Callers
/// must not run two mutations on the same instance concurrently.
#[derive(Clone)]
pub struct RuntimeInterface {
    instance_repository: Arc<dyn ProcessInstanceRepository>,
    definition_repository: Arc<dyn ProcessDefinitionRepository>,
    collaborators: Collaborators,
    config: EngineConfig,
    event_handler: Option<Arc<dyn DomainEventHandler>>,
}

impl RuntimeInterface {
    /// Create a new runtime interface with default collaborators
    pub fn new(
        instance_repository: Arc<dyn ProcessInstanceRepository>,
        definition_repository: Arc<dyn ProcessDefinitionRepository>,
    ) -> Self {
        let collaborators =
            Collaborators::default().with_definition_repository(definition_repository.clone());
        Self {
            instance_repository,
            definition_repository,
            collaborators,
            config: EngineConfig::default(),
            event_handler: None,
        }
    }

    /// Use `collaborators` for every instance
    ///
    /// The interface's definition repository is attached unless the
    /// collaborators bring their own.
    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = match collaborators.definition_repository {
            Some(_) => collaborators,
            None => collaborators.with_definition_repository(self.definition_repository.clone()),
        };
        self
    }

    /// Use `config` for every instance
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Dispatch domain events to `handler`
    pub fn with_event_handler(mut self, handler: Arc<dyn DomainEventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Deploy a process definition
    pub async fn deploy_definition(&self, definition: ProcessDefinition) -> Result<(), CoreError> {
        let id = definition.id().clone();
        let version = definition.version();
        self.definition_repository.add(definition)?;
        info!(process_id = %id, version, "Process definition deployed");
        Ok(())
    }

    /// Create an instance of the latest version of `process_id`
    pub async fn create_instance(
        &self,
        process_id: &ProcessId,
    ) -> Result<ProcessInstanceId, CoreError> {
        let definition = self
            .definition_repository
            .get_latest_by_id(process_id)
            .ok_or_else(|| CoreError::ProcessDefinitionNotFound(process_id.to_string()))?;

        let instance =
            definition.create_process_instance_with(self.collaborators.clone(), self.config.clone());
        let id = instance.id().clone();
        self.instance_repository.save(&instance).await?;
        info!(
            process_instance_id = %id,
            process_id = %process_id,
            version = definition.version(),
            "Process instance created"
        );
        Ok(id)
    }

    /// Create an instance of `process_id` and start it in one call
    pub async fn create_and_start(
        &self,
        process_id: &ProcessId,
        context: EventContext,
    ) -> Result<ProcessInstanceId, CoreError> {
        let id = self.create_instance(process_id).await?;
        self.start_instance(&id, context).await?;
        Ok(id)
    }

    /// Start an instance
    pub async fn start_instance(
        &self,
        id: &ProcessInstanceId,
        context: EventContext,
    ) -> Result<(), CoreError> {
        self.apply(id, "start", |process| process.start(context)).await
    }

    /// Allocate a work item
    pub async fn allocate_work_item(
        &self,
        id: &ProcessInstanceId,
        context: WorkItemContext,
    ) -> Result<(), CoreError> {
        self.apply(id, "allocate", |process| process.allocate_work_item(context))
            .await
    }

    /// Start a work item
    pub async fn start_work_item(
        &self,
        id: &ProcessInstanceId,
        context: WorkItemContext,
    ) -> Result<(), CoreError> {
        self.apply(id, "start work item", |process| process.start_work_item(context))
            .await
    }

    /// Complete a work item
    pub async fn complete_work_item(
        &self,
        id: &ProcessInstanceId,
        context: WorkItemContext,
    ) -> Result<(), CoreError> {
        self.apply(id, "complete", |process| process.complete_work_item(context))
            .await
    }

    /// Trigger an intermediate catch event or a boundary event
    pub async fn trigger_event(
        &self,
        id: &ProcessInstanceId,
        context: EventContext,
    ) -> Result<(), CoreError> {
        self.apply(id, "trigger", |process| process.trigger(context)).await
    }

    /// Complete the work item of a sub-process or call activity whose child has ended
    ///
    /// Work items inside the child are driven through the work item calls
    /// with a context scoped by [`WorkItemContext::within`].
    pub async fn complete_sub_process(
        &self,
        id: &ProcessInstanceId,
        activity: &FlowObjectId,
    ) -> Result<(), CoreError> {
        let context = WorkItemContext::new(activity.clone());
        self.apply(id, "complete", |process| process.complete_work_item(context))
            .await
    }

    /// Cancel an instance
    pub async fn cancel_instance(&self, id: &ProcessInstanceId) -> Result<(), CoreError> {
        self.apply(id, "cancel", |process| process.instance_mut().cancel())
            .await
    }

    /// Suspend an instance
    pub async fn suspend_instance(&self, id: &ProcessInstanceId) -> Result<(), CoreError> {
        self.apply(id, "suspend", |process| process.instance_mut().suspend())
            .await
    }

    /// Resume a suspended instance
    pub async fn resume_instance(&self, id: &ProcessInstanceId) -> Result<(), CoreError> {
        self.apply(id, "resume", |process| process.instance_mut().resume())
            .await
    }

    /// Load an instance with the runtime collaborators attached
    pub async fn get_instance(
        &self,
        id: &ProcessInstanceId,
    ) -> Result<Option<ProcessInstance>, CoreError> {
        Ok(self
            .instance_repository
            .find_by_id(id)
            .await?
            .map(|instance| self.prepare(instance)))
    }

    /// Summaries of every instance of `process_id`
    pub async fn list_instances(
        &self,
        process_id: &ProcessId,
    ) -> Result<Vec<ProcessInstanceSummary>, CoreError> {
        let ids = self.instance_repository.find_all_for_process(process_id).await?;
        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(instance) = self.instance_repository.find_by_id(&id).await? {
                summaries.push(ProcessInstanceSummary::from(&instance));
            }
        }
        Ok(summaries)
    }

    /// Delete an instance
    pub async fn delete_instance(&self, id: &ProcessInstanceId) -> Result<(), CoreError> {
        self.instance_repository.delete(id).await?;
        debug!(process_instance_id = %id, "Process instance deleted");
        Ok(())
    }

    fn prepare(&self, mut instance: ProcessInstance) -> ProcessInstance {
        instance.attach_collaborators(self.collaborators.clone());
        instance.set_config(self.config.clone());
        instance
    }

    async fn apply(
        &self,
        id: &ProcessInstanceId,
        operation: &str,
        action: impl FnOnce(&mut Process) -> Result<(), CoreError>,
    ) -> Result<(), CoreError> {
        let instance = self
            .instance_repository
            .find_by_id(id)
            .await?
            .ok_or_else(|| CoreError::ProcessInstanceNotFound(id.to_string()))?;

        let mut process = Process::new(self.prepare(instance));
        if let Err(e) = action(&mut process) {
            warn!(process_instance_id = %id, operation, error = %e, "Operation rejected");
            return Err(e);
        }

        let mut instance = process.into_instance();
        self.instance_repository.save(&instance).await?;
        self.handle_events(&mut instance).await
    }

    async fn handle_events(&self, instance: &mut ProcessInstance) -> Result<(), CoreError> {
        let events = instance.take_events();
        if let Some(handler) = &self.event_handler {
            for event in events {
                handler.handle_event(event).await?;
            }
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "testing"))]
mod tests {
    use super::*;
    use crate::domain::flow_object::FlowObjectConfig;
    use crate::domain::process_definition::ProcessDefinitionBuilder;
    use crate::domain::repository::memory::{
        MemoryProcessDefinitionRepository, MemoryProcessInstanceRepository,
    };
    use crate::domain::role::{Participant, Role, SimpleParticipant};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl DomainEventHandler for RecordingHandler {
        async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError> {
            self.seen
                .lock()
                .map_err(|e| CoreError::Other(e.to_string()))?
                .push(event.event_type());
            Ok(())
        }
    }

    fn runtime() -> (RuntimeInterface, Arc<RecordingHandler>) {
        let handler = Arc::new(RecordingHandler::default());
        let runtime = RuntimeInterface::new(
            Arc::new(MemoryProcessInstanceRepository::new()),
            Arc::new(MemoryProcessDefinitionRepository::new()),
        )
        .with_event_handler(handler.clone());
        (runtime, handler)
    }

    fn review() -> ProcessDefinition {
        ProcessDefinitionBuilder::new("review")
            .role(Role::new("clerk", None))
            .flow_object(FlowObjectConfig::start_event("start"))
            .flow_object(FlowObjectConfig::task("check", "clerk"))
            .flow_object(FlowObjectConfig::end_event("end"))
            .flow("f1", "start", "check")
            .flow("f2", "check", "end")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_runtime_drives_instance_through_repository() {
        let (runtime, handler) = runtime();
        runtime.deploy_definition(review()).await.unwrap();

        let id = runtime
            .create_and_start(&ProcessId::new("review"), EventContext::new("start"))
            .await
            .unwrap();

        let clerk: Arc<dyn Participant> = Arc::new(SimpleParticipant::new("alice", ["clerk"]));
        let context = WorkItemContext::new("check").with_participant(clerk);
        runtime.allocate_work_item(&id, context.clone()).await.unwrap();
        runtime.start_work_item(&id, context.clone()).await.unwrap();
        runtime.complete_work_item(&id, context).await.unwrap();

        let instance = runtime.get_instance(&id).await.unwrap().unwrap();
        assert!(instance.is_ended());

        let summaries = runtime.list_instances(&ProcessId::new("review")).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].state, ProcessInstanceState::Ended);

        let seen = handler.seen.lock().unwrap().clone();
        assert_eq!(seen.first(), Some(&"process_instance.started"));
        assert_eq!(seen.last(), Some(&"process_instance.ended"));
    }

    #[tokio::test]
    async fn test_rejected_operation_is_not_saved() {
        let (runtime, _) = runtime();
        runtime.deploy_definition(review()).await.unwrap();
        let id = runtime
            .create_and_start(&ProcessId::new("review"), EventContext::new("start"))
            .await
            .unwrap();

        let outsider: Arc<dyn Participant> = Arc::new(SimpleParticipant::new("eve", ["guest"]));
        let err = runtime
            .allocate_work_item(&id, WorkItemContext::new("check").with_participant(outsider))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AccessDenied { .. }));

        runtime.suspend_instance(&id).await.unwrap();
        assert!(runtime.get_instance(&id).await.unwrap().unwrap().is_suspended());
        runtime.cancel_instance(&id).await.unwrap();
        assert!(runtime.get_instance(&id).await.unwrap().unwrap().is_failed());
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let (runtime, _) = runtime();
        assert_eq!(
            runtime.create_instance(&ProcessId::new("ghost")).await.unwrap_err(),
            CoreError::ProcessDefinitionNotFound("ghost".to_string())
        );

        let id = ProcessInstanceId::new("missing");
        assert!(matches!(
            runtime.cancel_instance(&id).await,
            Err(CoreError::ProcessInstanceNotFound(_))
        ));
        assert!(runtime.get_instance(&id).await.unwrap().is_none());
    }
}
