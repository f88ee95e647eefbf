//! Application-facing façade over a process instance
//!
//! External requests arrive as contexts: an [`EventContext`] names the event
//! to fire, a [`WorkItemContext`] names the activity, the acting participant
//! and optional process data to merge before the operation runs. A work item
//! context can also point into a running sub-process or call activity.

use crate::domain::flow_object::NodeKind;
use crate::domain::process_instance::ProcessInstance;
use crate::domain::role::Participant;
use crate::types::FlowObjectId;
use crate::CoreError;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Request to fire an event
#[derive(Debug, Clone)]
pub struct EventContext {
    /// Event to fire
    pub event: FlowObjectId,

    /// Top-level keys merged into the process data first
    pub process_data: Option<Value>,
}

impl EventContext {
    /// Fire `event` without touching the process data
    pub fn new(event: impl Into<FlowObjectId>) -> Self {
        Self {
            event: event.into(),
            process_data: None,
        }
    }

    /// Merge `data` into the process data before firing
    pub fn with_process_data(mut self, data: Value) -> Self {
        self.process_data = Some(data);
        self
    }
}

/// Request to act on the work item of an activity
#[derive(Clone)]
pub struct WorkItemContext {
    /// Target activity
    pub activity: FlowObjectId,

    /// Acting participant; required for allocation
    pub participant: Option<Arc<dyn Participant>>,

    /// Top-level keys merged into the process data first
    pub process_data: Option<Value>,

    /// Sub-process and call activities leading from the root instance to
    /// the instance owning `activity`, outermost first
    pub scope: Vec<FlowObjectId>,
}

impl WorkItemContext {
    /// Act on `activity` anonymously
    pub fn new(activity: impl Into<FlowObjectId>) -> Self {
        Self {
            activity: activity.into(),
            participant: None,
            process_data: None,
            scope: Vec::new(),
        }
    }

    /// Descend into the child instance run by `activity`
    ///
    /// Calls nest: `within("outer").within("inner")` targets the instance
    /// started by `inner` inside the child of `outer`.
    pub fn within(mut self, activity: impl Into<FlowObjectId>) -> Self {
        self.scope.push(activity.into());
        self
    }

    /// Act as `participant`
    pub fn with_participant(mut self, participant: Arc<dyn Participant>) -> Self {
        self.participant = Some(participant);
        self
    }

    /// Merge `data` into the process data before acting
    pub fn with_process_data(mut self, data: Value) -> Self {
        self.process_data = Some(data);
        self
    }
}

impl std::fmt::Debug for WorkItemContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItemContext")
            .field("activity", &self.activity)
            .field("participant", &self.participant.as_ref().map(|p| p.id()))
            .field("process_data", &self.process_data)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Drives one process instance on behalf of external callers
#[derive(Debug)]
pub struct Process {
    instance: ProcessInstance,
}

impl Process {
    /// Wrap an instance
    pub fn new(instance: ProcessInstance) -> Self {
        Self { instance }
    }

    /// The wrapped instance
    pub fn instance(&self) -> &ProcessInstance {
        &self.instance
    }

    /// Mutable access to the wrapped instance
    pub fn instance_mut(&mut self) -> &mut ProcessInstance {
        &mut self.instance
    }

    /// Unwrap the instance
    pub fn into_instance(self) -> ProcessInstance {
        self.instance
    }

    /// Start the instance at the context's event
    pub fn start(&mut self, context: EventContext) -> Result<(), CoreError> {
        let event = context.event;
        self.with_data(&[], context.process_data, |instance| instance.start(&event))
    }

    /// Fire the context's event; intermediate catch or boundary
    pub fn trigger(&mut self, context: EventContext) -> Result<(), CoreError> {
        let event = context.event;
        self.with_data(&[], context.process_data, |instance| {
            let is_boundary = matches!(
                instance.flow_objects().require(&event)?.kind(),
                NodeKind::BoundaryEvent { .. }
            );
            if is_boundary {
                instance.trigger_boundary_event(&event)
            } else {
                instance.trigger_intermediate_event(&event)
            }
        })
    }

    /// Allocate the activity's work item to the context's participant
    pub fn allocate_work_item(&mut self, context: WorkItemContext) -> Result<(), CoreError> {
        let participant = context.participant.ok_or_else(|| {
            CoreError::Logic(format!(
                "Allocating a work item of {} requires a participant",
                context.activity
            ))
        })?;
        let activity = context.activity;
        self.with_data(&context.scope, context.process_data, |instance| {
            instance.allocate_work_item(&activity, participant.as_ref())
        })
    }

    /// Start the activity's allocated work item
    pub fn start_work_item(&mut self, context: WorkItemContext) -> Result<(), CoreError> {
        let activity = context.activity;
        let participant = context.participant;
        self.with_data(&context.scope, context.process_data, |instance| {
            instance.start_work_item(&activity, participant.as_deref())
        })
    }

    /// Complete the activity's started work item
    pub fn complete_work_item(&mut self, context: WorkItemContext) -> Result<(), CoreError> {
        let activity = context.activity;
        let participant = context.participant;
        self.with_data(&context.scope, context.process_data, |instance| {
            instance.complete_work_item(&activity, participant.as_deref())
        })
    }

    /// Resolve `scope`, merge `data` into that instance, run `operation`,
    /// and put the old data back if it fails
    fn with_data(
        &mut self,
        scope: &[FlowObjectId],
        data: Option<Value>,
        operation: impl FnOnce(&mut ProcessInstance) -> Result<(), CoreError>,
    ) -> Result<(), CoreError> {
        let instance = self.instance.scoped_instance_mut(scope)?;
        let Some(data) = data else {
            return operation(instance);
        };

        let previous = instance.process_data().clone();
        let merged = merge_data(previous.clone(), data);
        debug!(process_instance_id = %instance.id(), "Process data merged");
        instance.set_process_data(merged);

        let result = operation(&mut *instance);
        if result.is_err() {
            instance.set_process_data(previous);
        }
        result
    }
}

/// Shallow merge: top-level keys of `update` replace those of `base`
fn merge_data(base: Value, update: Value) -> Value {
    match (base, update) {
        (Value::Object(mut base), Value::Object(update)) => {
            base.extend(update);
            Value::Object(base)
        }
        (Value::Null, Value::Object(update)) => Value::Object(update),
        (_, update @ Value::Object(_)) => update,
        (base, _) => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow_object::FlowObjectConfig;
    use crate::domain::process_definition::{ProcessDefinition, ProcessDefinitionBuilder};
    use crate::domain::role::{Role, SimpleParticipant};
    use serde_json::{json, Map};

    fn approval() -> ProcessDefinition {
        ProcessDefinitionBuilder::new("approval")
            .role(Role::new("manager", None))
            .flow_object(FlowObjectConfig::start_event("start"))
            .flow_object(FlowObjectConfig::task("approve", "manager"))
            .flow_object(FlowObjectConfig::exclusive_gateway("decision"))
            .flow_object(FlowObjectConfig::end_event("approved"))
            .flow_object(FlowObjectConfig::end_event("rejected"))
            .flow("f1", "start", "approve")
            .flow("f2", "approve", "decision")
            .conditional_flow("f3", "decision", "approved", "approved == `true`")
            .conditional_flow("f4", "decision", "rejected", "approved == `false`")
            .build()
            .unwrap()
    }

    fn manager() -> Arc<dyn Participant> {
        Arc::new(SimpleParticipant::new("carol", ["manager"]))
    }

    #[test]
    fn test_contexts_drive_the_instance() {
        let mut process = Process::new(approval().create_process_instance());
        process
            .start(EventContext::new("start").with_process_data(json!({"requester": "dave"})))
            .unwrap();

        let context = WorkItemContext::new("approve").with_participant(manager());
        process.allocate_work_item(context.clone()).unwrap();
        process.start_work_item(context.clone()).unwrap();
        process
            .complete_work_item(context.with_process_data(json!({"approved": true})))
            .unwrap();

        let instance = process.into_instance();
        assert!(instance.is_ended());
        assert_eq!(
            instance.process_data(),
            &json!({"requester": "dave", "approved": true})
        );
    }

    #[test]
    fn test_failed_operation_keeps_previous_data() {
        let mut process = Process::new(approval().create_process_instance());
        process.start(EventContext::new("start")).unwrap();
        let context = WorkItemContext::new("approve").with_participant(manager());
        process.allocate_work_item(context.clone()).unwrap();
        process.start_work_item(context.clone()).unwrap();

        let err = process
            .complete_work_item(context.with_process_data(json!({"approved": "maybe"})))
            .unwrap_err();
        assert!(matches!(err, CoreError::SequenceFlowNotSelected { .. }));
        assert_eq!(process.instance().process_data(), &json!({}));
    }

    fn reviewed_approval() -> ProcessDefinition {
        ProcessDefinitionBuilder::new("reviewed_approval")
            .role(Role::new("manager", None))
            .flow_object(FlowObjectConfig::start_event("start"))
            .flow_object(FlowObjectConfig::sub_process("review", "manager", approval()))
            .flow_object(FlowObjectConfig::end_event("end"))
            .flow("f1", "start", "review")
            .flow("f2", "review", "end")
            .build()
            .unwrap()
    }

    #[test]
    fn test_scoped_context_reaches_child_work_items() {
        let mut process = Process::new(reviewed_approval().create_process_instance());
        process.start(EventContext::new("start")).unwrap();
        let review = WorkItemContext::new("review").with_participant(manager());
        process.allocate_work_item(review.clone()).unwrap();
        process.start_work_item(review.clone()).unwrap();

        let approve = WorkItemContext::new("approve")
            .with_participant(manager())
            .within("review");
        process.allocate_work_item(approve.clone()).unwrap();
        process.start_work_item(approve.clone()).unwrap();
        process
            .complete_work_item(approve.with_process_data(json!({"approved": true})))
            .unwrap();

        let child = process.instance().sub_process(&FlowObjectId::new("review")).unwrap();
        assert!(child.is_ended());
        assert_eq!(child.process_data(), &json!({"approved": true}));
        // Data merged into the child stays in the child
        assert_eq!(process.instance().process_data(), &json!({}));

        // Child events are drained along with the parent's
        let types: Vec<&str> = process
            .instance_mut()
            .take_events()
            .iter()
            .map(|event| event.event_type())
            .collect();
        assert_eq!(types.iter().filter(|t| **t == "process_instance.started").count(), 2);
        assert_eq!(types.iter().filter(|t| **t == "process_instance.ended").count(), 1);

        process.complete_work_item(review).unwrap();
        assert!(process.instance().is_ended());
    }

    #[test]
    fn test_scope_must_name_a_running_child() {
        let mut process = Process::new(reviewed_approval().create_process_instance());
        process.start(EventContext::new("start")).unwrap();

        // The review work item exists but has not started its child yet
        let err = process
            .allocate_work_item(
                WorkItemContext::new("approve")
                    .with_participant(manager())
                    .within("review"),
            )
            .unwrap_err();
        assert_eq!(err, CoreError::unexpected_state("review", "enter sub-process"));

        let err = process
            .allocate_work_item(
                WorkItemContext::new("approve")
                    .with_participant(manager())
                    .within("end"),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::UnexpectedActivity { .. }));
    }

    #[test]
    fn test_allocation_requires_participant() {
        let mut process = Process::new(approval().create_process_instance());
        process.start(EventContext::new("start")).unwrap();

        assert!(matches!(
            process.allocate_work_item(WorkItemContext::new("approve")),
            Err(CoreError::Logic(_))
        ));
    }

    #[test]
    fn test_merge_data() {
        assert_eq!(
            merge_data(json!({"a": 1, "b": 1}), json!({"b": 2})),
            json!({"a": 1, "b": 2})
        );
        assert_eq!(merge_data(Value::Null, json!({"a": 1})), json!({"a": 1}));
        assert_eq!(merge_data(json!({"a": 1}), json!(3)), json!({"a": 1}));
        assert_eq!(merge_data(Value::Object(Map::new()), json!({})), json!({}));
    }
}
