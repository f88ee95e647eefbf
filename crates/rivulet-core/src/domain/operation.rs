//! Pluggable collaborators the engine calls into
//!
//! None of them are part of the persisted state of an instance: they are
//! bundled in [`Collaborators`], attached when an instance is created or
//! loaded, and inherited by every child instance.

use crate::domain::condition::{ExpressionEvaluator, JmesPathEvaluator};
use crate::domain::flow_object::FlowObject;
use crate::domain::process_instance::ProcessInstance;
use crate::domain::repository::ProcessDefinitionRepository;
use crate::domain::role::Participant;
use crate::domain::work_item::{WorkItem, WorkItemsCollection};
use crate::CoreError;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Executes the side effect of service and send tasks
#[cfg_attr(test, mockall::automock)]
pub trait OperationRunner: Send + Sync {
    /// Participant the engine records as performing the operational task
    fn provide_participant(
        &self,
        node: &FlowObject,
        instance: &ProcessInstance,
    ) -> Result<Arc<dyn Participant>, CoreError>;

    /// Run the task; an error aborts the engine operation that triggered it
    fn run(&self, node: &FlowObject, work_item: &WorkItem) -> Result<(), CoreError>;
}

/// Supplies per-instance data to multi-instance activities
#[cfg_attr(test, mockall::automock)]
pub trait DataProvider: Send + Sync {
    /// One data context per concurrently created work item
    fn get_parallel_instances_data(&self, node: &FlowObject) -> Result<Vec<Value>, CoreError>;

    /// Data context of the next sequential work item, `None` once exhausted
    fn get_sequential_instance_data(&self, node: &FlowObject) -> Result<Option<Value>, CoreError>;

    /// Called once every instance of the activity has finished
    fn merge_instances_data(
        &self,
        node: &FlowObject,
        work_items: &WorkItemsCollection,
    ) -> Result<(), CoreError>;
}

/// Collaborators attached to a process instance
#[derive(Clone)]
pub struct Collaborators {
    /// Evaluates sequence-flow conditions
    pub expression_evaluator: Arc<dyn ExpressionEvaluator>,

    /// Runs service and send tasks
    pub operation_runner: Option<Arc<dyn OperationRunner>>,

    /// Feeds multi-instance activities
    pub data_provider: Option<Arc<dyn DataProvider>>,

    /// Resolves called processes
    pub definition_repository: Option<Arc<dyn ProcessDefinitionRepository>>,
}

impl Collaborators {
    /// JMESPath conditions and nothing else
    pub fn new() -> Self {
        Self {
            expression_evaluator: Arc::new(JmesPathEvaluator),
            operation_runner: None,
            data_provider: None,
            definition_repository: None,
        }
    }

    /// Replace the expression evaluator
    pub fn with_expression_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.expression_evaluator = evaluator;
        self
    }

    /// Attach an operation runner
    pub fn with_operation_runner(mut self, runner: Arc<dyn OperationRunner>) -> Self {
        self.operation_runner = Some(runner);
        self
    }

    /// Attach a data provider
    pub fn with_data_provider(mut self, provider: Arc<dyn DataProvider>) -> Self {
        self.data_provider = Some(provider);
        self
    }

    /// Attach a definition repository
    pub fn with_definition_repository(
        mut self,
        repository: Arc<dyn ProcessDefinitionRepository>,
    ) -> Self {
        self.definition_repository = Some(repository);
        self
    }

    pub(crate) fn runner(&self, node: &FlowObject) -> Result<&Arc<dyn OperationRunner>, CoreError> {
        self.operation_runner.as_ref().ok_or_else(|| {
            CoreError::Logic(format!("No operation runner attached for {}", node.id()))
        })
    }

    pub(crate) fn provider(&self, node: &FlowObject) -> Result<&Arc<dyn DataProvider>, CoreError> {
        self.data_provider.as_ref().ok_or_else(|| {
            CoreError::Logic(format!("No data provider attached for {}", node.id()))
        })
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("operation_runner", &self.operation_runner.is_some())
            .field("data_provider", &self.data_provider.is_some())
            .field("definition_repository", &self.definition_repository.is_some())
            .finish_non_exhaustive()
    }
}
