//! Flow objects: the nodes of a process graph
//!
//! Every node kind is one variant of [`NodeKind`]. The configuration part of
//! a node ([`FlowObjectConfig`]) is an immutable template owned by the
//! process definition; [`FlowObject`] is the live copy owned by one process
//! instance, carrying its lifecycle state, the tokens resting on it and, for
//! activities, the work items created so far.

use crate::domain::process_definition::ProcessDefinition;
use crate::domain::work_item::WorkItemsCollection;
use crate::types::{FlowObjectId, ProcessId, RoleId, SequenceFlowId, TokenId};
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind-specific configuration of a flow object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry point of a process
    StartEvent,
    /// Terminal node; consumes the token that reaches it
    EndEvent,
    /// Holds its token until the event is triggered
    IntermediateCatchEvent,
    /// Event attached to an activity, fired while the activity is running
    BoundaryEvent {
        /// Activity the event is attached to
        attached_to: FlowObjectId,
        /// Whether firing the event cancels the activity
        #[serde(default = "default_cancel_activity")]
        cancel_activity: bool,
    },
    /// User task performed by a participant
    Task,
    /// Task executed by the operation runner
    ServiceTask {
        /// Operation name handed to the runner
        operation: String,
    },
    /// Task that sends a message through the operation runner
    SendTask {
        /// Message name handed to the runner
        message: String,
    },
    /// Embedded sub-process; every work item runs a fresh child instance
    SubProcess {
        /// Definition of the embedded process
        definition: Box<ProcessDefinition>,
    },
    /// Call of a separately deployed process, resolved through the definition repository
    CallActivity {
        /// Identifier of the called process
        called_process: ProcessId,
    },
    /// Routes the token along the first matching flow
    ExclusiveGateway,
    /// Forks along every outgoing flow and joins every incoming flow
    ParallelGateway,
    /// Forks along every matching flow and joins the branches that can still arrive
    InclusiveGateway,
}

fn default_cancel_activity() -> bool {
    true
}

impl NodeKind {
    /// Whether the node is an activity (creates work items)
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            NodeKind::Task
                | NodeKind::ServiceTask { .. }
                | NodeKind::SendTask { .. }
                | NodeKind::SubProcess { .. }
                | NodeKind::CallActivity { .. }
        )
    }

    /// Whether work items of the node are executed by the operation runner
    pub fn is_operational(&self) -> bool {
        matches!(self, NodeKind::ServiceTask { .. } | NodeKind::SendTask { .. })
    }

    /// Whether work items of the node run a child process instance
    pub fn is_process_task(&self) -> bool {
        matches!(self, NodeKind::SubProcess { .. } | NodeKind::CallActivity { .. })
    }

    /// Whether the node is a gateway
    pub fn is_gateway(&self) -> bool {
        matches!(
            self,
            NodeKind::ExclusiveGateway | NodeKind::ParallelGateway | NodeKind::InclusiveGateway
        )
    }

    /// Whether the node may hold more than one token at a time
    ///
    /// Joining gateways queue tokens until their join condition holds;
    /// every other node holds at most one.
    pub fn queues_tokens(&self) -> bool {
        matches!(self, NodeKind::ParallelGateway | NodeKind::InclusiveGateway)
    }

    /// Whether every matching outgoing flow is taken rather than the first one
    pub fn selects_all_matching(&self) -> bool {
        self.queues_tokens()
    }

    /// Short name of the kind, used in log output
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::StartEvent => "start_event",
            NodeKind::EndEvent => "end_event",
            NodeKind::IntermediateCatchEvent => "intermediate_catch_event",
            NodeKind::BoundaryEvent { .. } => "boundary_event",
            NodeKind::Task => "task",
            NodeKind::ServiceTask { .. } => "service_task",
            NodeKind::SendTask { .. } => "send_task",
            NodeKind::SubProcess { .. } => "sub_process",
            NodeKind::CallActivity { .. } => "call_activity",
            NodeKind::ExclusiveGateway => "exclusive_gateway",
            NodeKind::ParallelGateway => "parallel_gateway",
            NodeKind::InclusiveGateway => "inclusive_gateway",
        }
    }
}

/// Multi-instance loop characteristics of an activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiInstanceLoop {
    /// Run instances one after the other instead of all at once
    #[serde(default)]
    pub sequential: bool,

    /// Condition checked after each completed instance; when true the
    /// remaining instances are cancelled
    #[serde(default)]
    pub completion_condition: Option<String>,
}

impl MultiInstanceLoop {
    /// All instances are created at once
    pub fn parallel() -> Self {
        Self {
            sequential: false,
            completion_condition: None,
        }
    }

    /// Instances are created one after the other
    pub fn sequential() -> Self {
        Self {
            sequential: true,
            completion_condition: None,
        }
    }

    /// Stop early once `condition` holds
    pub fn with_completion_condition(mut self, condition: impl Into<String>) -> Self {
        self.completion_condition = Some(condition.into());
        self
    }
}

/// Immutable template of a flow object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowObjectConfig {
    /// Flow object identifier
    pub id: FlowObjectId,

    /// Display name
    #[serde(default)]
    pub name: Option<String>,

    /// Role a participant must hold to act on the node
    #[serde(default)]
    pub role: Option<RoleId>,

    /// Flow taken when no conditioned flow matches
    #[serde(default)]
    pub default_flow: Option<SequenceFlowId>,

    /// Node kind
    pub kind: NodeKind,

    /// Multi-instance characteristics (activities only)
    #[serde(default)]
    pub multi_instance: Option<MultiInstanceLoop>,
}

impl FlowObjectConfig {
    /// Template of the given kind
    pub fn new(id: impl Into<FlowObjectId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            role: None,
            default_flow: None,
            kind,
            multi_instance: None,
        }
    }

    /// Start event
    pub fn start_event(id: impl Into<FlowObjectId>) -> Self {
        Self::new(id, NodeKind::StartEvent)
    }

    /// End event
    pub fn end_event(id: impl Into<FlowObjectId>) -> Self {
        Self::new(id, NodeKind::EndEvent)
    }

    /// Intermediate catch event
    pub fn intermediate_catch_event(id: impl Into<FlowObjectId>) -> Self {
        Self::new(id, NodeKind::IntermediateCatchEvent)
    }

    /// Boundary event attached to `activity`
    pub fn boundary_event(
        id: impl Into<FlowObjectId>,
        activity: impl Into<FlowObjectId>,
        cancel_activity: bool,
    ) -> Self {
        Self::new(
            id,
            NodeKind::BoundaryEvent {
                attached_to: activity.into(),
                cancel_activity,
            },
        )
    }

    /// User task requiring `role`
    pub fn task(id: impl Into<FlowObjectId>, role: impl Into<RoleId>) -> Self {
        Self::new(id, NodeKind::Task).with_role(role)
    }

    /// Service task requiring `role`
    pub fn service_task(
        id: impl Into<FlowObjectId>,
        role: impl Into<RoleId>,
        operation: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            NodeKind::ServiceTask {
                operation: operation.into(),
            },
        )
        .with_role(role)
    }

    /// Send task requiring `role`
    pub fn send_task(
        id: impl Into<FlowObjectId>,
        role: impl Into<RoleId>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            NodeKind::SendTask {
                message: message.into(),
            },
        )
        .with_role(role)
    }

    /// Embedded sub-process requiring `role`
    pub fn sub_process(
        id: impl Into<FlowObjectId>,
        role: impl Into<RoleId>,
        definition: ProcessDefinition,
    ) -> Self {
        Self::new(
            id,
            NodeKind::SubProcess {
                definition: Box::new(definition),
            },
        )
        .with_role(role)
    }

    /// Call activity requiring `role`
    pub fn call_activity(
        id: impl Into<FlowObjectId>,
        role: impl Into<RoleId>,
        called_process: impl Into<ProcessId>,
    ) -> Self {
        Self::new(
            id,
            NodeKind::CallActivity {
                called_process: called_process.into(),
            },
        )
        .with_role(role)
    }

    /// Exclusive gateway
    pub fn exclusive_gateway(id: impl Into<FlowObjectId>) -> Self {
        Self::new(id, NodeKind::ExclusiveGateway)
    }

    /// Parallel gateway
    pub fn parallel_gateway(id: impl Into<FlowObjectId>) -> Self {
        Self::new(id, NodeKind::ParallelGateway)
    }

    /// Inclusive gateway
    pub fn inclusive_gateway(id: impl Into<FlowObjectId>) -> Self {
        Self::new(id, NodeKind::InclusiveGateway)
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the required role
    pub fn with_role(mut self, role: impl Into<RoleId>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Set the default flow
    pub fn with_default_flow(mut self, flow: impl Into<SequenceFlowId>) -> Self {
        self.default_flow = Some(flow.into());
        self
    }

    /// Turn the activity into a multi-instance activity
    pub fn with_multi_instance(mut self, characteristics: MultiInstanceLoop) -> Self {
        self.multi_instance = Some(characteristics);
        self
    }
}

/// Lifecycle state of a live flow object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowObjectState {
    /// No token has reached the node yet
    Inactive,
    /// A token is attached, nothing happened yet
    Ready,
    /// Work is in progress or the node is waiting for a trigger
    Active,
    /// The node handed its token on
    Closed,
    /// The node was cancelled
    Failed,
}

/// Live flow object owned by one process instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowObject {
    id: FlowObjectId,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    role: Option<RoleId>,
    #[serde(default)]
    default_flow: Option<SequenceFlowId>,
    kind: NodeKind,
    #[serde(default)]
    multi_instance: Option<MultiInstanceLoop>,
    state: FlowObjectState,
    tokens: Vec<TokenId>,
    #[serde(default)]
    work_items: WorkItemsCollection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resolved_call: Option<Box<ProcessDefinition>>,
}

impl FlowObject {
    /// Instantiate a live flow object from its template
    pub fn from_config(config: &FlowObjectConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            role: config.role.clone(),
            default_flow: config.default_flow.clone(),
            kind: config.kind.clone(),
            multi_instance: config.multi_instance.clone(),
            state: FlowObjectState::Inactive,
            tokens: Vec::new(),
            work_items: WorkItemsCollection::new(),
            resolved_call: None,
        }
    }

    /// Flow object identifier
    pub fn id(&self) -> &FlowObjectId {
        &self.id
    }

    /// Display name
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Required role
    pub fn role(&self) -> Option<&RoleId> {
        self.role.as_ref()
    }

    /// Default flow
    pub fn default_flow(&self) -> Option<&SequenceFlowId> {
        self.default_flow.as_ref()
    }

    /// Node kind
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Multi-instance characteristics
    pub fn multi_instance(&self) -> Option<&MultiInstanceLoop> {
        self.multi_instance.as_ref()
    }

    /// Lifecycle state
    pub fn state(&self) -> FlowObjectState {
        self.state
    }

    /// Tokens resting on the node, oldest first
    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    /// Whether at least one token rests on the node
    pub fn has_token(&self) -> bool {
        !self.tokens.is_empty()
    }

    /// Work items created by the node
    pub fn work_items(&self) -> &WorkItemsCollection {
        &self.work_items
    }

    pub(crate) fn work_items_mut(&mut self) -> &mut WorkItemsCollection {
        &mut self.work_items
    }

    pub(crate) fn set_state(&mut self, state: FlowObjectState) {
        self.state = state;
    }

    pub(crate) fn resolved_call(&self) -> Option<&ProcessDefinition> {
        self.resolved_call.as_deref()
    }

    pub(crate) fn cache_resolved_call(&mut self, definition: ProcessDefinition) {
        self.resolved_call = Some(Box::new(definition));
    }

    /// Attach a token, enforcing the single-token capacity of the node
    pub fn attach_token(&mut self, token: TokenId) -> Result<(), CoreError> {
        if !self.kind.queues_tokens() && !self.tokens.is_empty() {
            return Err(CoreError::Logic(format!(
                "{} {} already holds a token, cannot attach {}",
                self.kind.name(),
                self.id,
                token
            )));
        }
        self.tokens.push(token);
        if self.state != FlowObjectState::Active {
            self.state = FlowObjectState::Ready;
        }
        Ok(())
    }

    /// Detach a token; returns whether the token was attached
    pub fn detach_token(&mut self, token: TokenId) -> bool {
        match self.tokens.iter().position(|&t| t == token) {
            Some(position) => {
                self.tokens.remove(position);
                true
            }
            None => false,
        }
    }

    /// Detach every token
    pub(crate) fn detach_all(&mut self) -> Vec<TokenId> {
        std::mem::take(&mut self.tokens)
    }
}

/// Live flow objects of one process instance, in declaration order
#[derive(Debug, Clone, Default)]
pub struct FlowObjectCollection {
    objects: Vec<FlowObject>,
    index: HashMap<FlowObjectId, usize>,
}

impl FlowObjectCollection {
    /// Index a list of flow objects
    pub fn new(objects: Vec<FlowObject>) -> Self {
        let index = objects
            .iter()
            .enumerate()
            .map(|(position, object)| (object.id.clone(), position))
            .collect();
        Self { objects, index }
    }

    /// Look up a flow object
    pub fn get(&self, id: &FlowObjectId) -> Option<&FlowObject> {
        self.index.get(id).map(|&position| &self.objects[position])
    }

    /// Look up a flow object mutably
    pub fn get_mut(&mut self, id: &FlowObjectId) -> Option<&mut FlowObject> {
        match self.index.get(id) {
            Some(&position) => self.objects.get_mut(position),
            None => None,
        }
    }

    /// Look up a flow object or fail with [`CoreError::FlowObjectNotFound`]
    pub fn require(&self, id: &FlowObjectId) -> Result<&FlowObject, CoreError> {
        self.get(id)
            .ok_or_else(|| CoreError::FlowObjectNotFound(id.to_string()))
    }

    /// Mutable variant of [`FlowObjectCollection::require`]
    pub fn require_mut(&mut self, id: &FlowObjectId) -> Result<&mut FlowObject, CoreError> {
        self.get_mut(id)
            .ok_or_else(|| CoreError::FlowObjectNotFound(id.to_string()))
    }

    /// Iterate in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &FlowObject> {
        self.objects.iter()
    }

    /// Mutable iteration in declaration order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FlowObject> {
        self.objects.iter_mut()
    }

    /// Number of flow objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the collection is empty
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Clone the flow objects out as a plain list
    pub fn to_vec(&self) -> Vec<FlowObject> {
        self.objects.clone()
    }
}
