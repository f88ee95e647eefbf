//! Process instances: live executions of a process definition
//!
//! An instance owns its flow objects, sequence flows, roles and tokens.
//! Every public mutating operation validates before it mutates, then runs
//! token propagation to a fixed point: tokens come to rest on activities
//! waiting for work, on catch events waiting for a trigger, on joins
//! waiting for their other branches, or are consumed by end events. The
//! instance ends when no token is left.
//!
//! Propagation is a worklist of signals rather than recursion between
//! flow objects. A token arriving at a node is attached and the node runs
//! immediately; passthrough nodes (start, boundary and intermediate events,
//! exclusive gateways) hand the token on in the same step, so they never
//! hold more than one token at a time. Inclusive joins whose remaining
//! branches can no longer deliver a token are fired once the worklist has
//! drained.
//!
//! Operations are transactional: a failing operation restores the
//! instance to the state it had before the call.

use crate::config::EngineConfig;
use crate::domain::events::{
    DomainEvent, GatewayFired, ProcessInstanceCancelled, ProcessInstanceEnded,
    ProcessInstanceStarted, TokenFlowed, WorkItemCreated, WorkItemStateChanged,
};
use crate::domain::flow_object::{FlowObject, FlowObjectCollection, FlowObjectState, NodeKind};
use crate::domain::gateway;
use crate::domain::operation::Collaborators;
use crate::domain::process_definition::ProcessDefinition;
use crate::domain::role::{Participant, ParticipantRef, RoleCollection};
use crate::domain::sequence_flow::ConnectingObjectCollection;
use crate::domain::snapshot::{ProcessInstanceSnapshot, SNAPSHOT_FORMAT_VERSION};
use crate::domain::token::{Token, TokenRegistry};
use crate::domain::work_item::{WorkItem, WorkItemState, WorkItemsCollection};
use crate::types::{FlowObjectId, ProcessId, ProcessInstanceId, SequenceFlowId, TokenId};
use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle state of a process instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessInstanceState {
    /// Created, no start event fired yet
    NotStarted,
    /// At least one token is alive
    Running,
    /// Every token was consumed by an end event
    Ended,
    /// Cancelled
    Failed,
}

/// Entry of the activity log: a work item created by an activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLogEntry {
    /// Activity that created the work item
    pub activity: FlowObjectId,

    /// Position of the work item within the activity
    pub work_item: usize,
}

/// Resolved view of an [`ActivityLogEntry`]
#[derive(Debug, Clone, Copy)]
pub struct ActivityLogView<'a> {
    /// Activity that created the work item
    pub activity: &'a FlowObject,

    /// The work item
    pub work_item: &'a WorkItem,
}

enum Signal {
    Arrive { token: TokenId, node: FlowObjectId },
    AutoRun { activity: FlowObjectId, work_item: usize },
}

enum Behaviour {
    Passthrough,
    Terminate,
    Wait,
    ParallelJoin,
    InclusiveJoin,
    Work,
}

enum SubProcessSource {
    Embedded(ProcessDefinition),
    Resolved(ProcessDefinition),
    Call(ProcessId),
}

/// Live, stateful execution of a process definition
#[derive(Debug, Serialize, Deserialize)]
#[serde(into = "ProcessInstanceSnapshot", try_from = "ProcessInstanceSnapshot")]
pub struct ProcessInstance {
    id: ProcessInstanceId,
    process_id: ProcessId,
    version: u32,
    name: Option<String>,
    state: ProcessInstanceState,
    suspended: bool,
    roles: RoleCollection,
    flow_objects: FlowObjectCollection,
    sequence_flows: ConnectingObjectCollection,
    tokens: TokenRegistry,
    process_data: Value,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    activity_log: Vec<ActivityLogEntry>,
    collaborators: Collaborators,
    config: EngineConfig,
    events: Vec<Box<dyn DomainEvent>>,
}

impl Clone for ProcessInstance {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            process_id: self.process_id.clone(),
            version: self.version,
            name: self.name.clone(),
            state: self.state,
            suspended: self.suspended,
            roles: self.roles.clone(),
            flow_objects: self.flow_objects.clone(),
            sequence_flows: self.sequence_flows.clone(),
            tokens: self.tokens.clone(),
            process_data: self.process_data.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            activity_log: self.activity_log.clone(),
            collaborators: self.collaborators.clone(),
            config: self.config.clone(),
            // Events are not cloned
            events: Vec::new(),
        }
    }
}

fn check_role(node: &FlowObject, participant: &dyn Participant) -> Result<(), CoreError> {
    match node.role() {
        Some(role) if !participant.has_role(role) => Err(CoreError::AccessDenied {
            activity: node.id().to_string(),
            participant: participant.id().to_string(),
        }),
        _ => Ok(()),
    }
}

impl ProcessInstance {
    pub(crate) fn new(
        definition: &ProcessDefinition,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> Self {
        let flow_objects = definition
            .flow_objects()
            .iter()
            .map(FlowObject::from_config)
            .collect();

        Self {
            id: ProcessInstanceId::generate(),
            process_id: definition.id().clone(),
            version: definition.version(),
            name: definition.name().map(str::to_string),
            state: ProcessInstanceState::NotStarted,
            suspended: false,
            roles: RoleCollection::new(definition.roles().to_vec()),
            flow_objects: FlowObjectCollection::new(flow_objects),
            sequence_flows: ConnectingObjectCollection::new(definition.sequence_flows().to_vec()),
            tokens: TokenRegistry::new(),
            process_data: Value::Object(Map::new()),
            started_at: None,
            ended_at: None,
            activity_log: Vec::new(),
            collaborators,
            config,
            events: Vec::new(),
        }
    }

    // ---------------------------------------------------------------------
    // Public operations
    // ---------------------------------------------------------------------

    /// Fire `start_event`: stamp the start time and propagate the first token
    pub fn start(&mut self, start_event: &FlowObjectId) -> Result<(), CoreError> {
        self.transact("start", |instance| {
            if instance.suspended || instance.state != ProcessInstanceState::NotStarted {
                return Err(CoreError::unexpected_state(instance.id.as_str(), "start"));
            }
            let node = instance.flow_objects.require(start_event)?;
            if node.kind() != &NodeKind::StartEvent {
                return Err(CoreError::Logic(format!(
                    "{} is not a start event",
                    start_event
                )));
            }

            let now = Utc::now();
            instance.state = ProcessInstanceState::Running;
            instance.started_at = Some(now);
            info!(
                process_instance_id = %instance.id,
                process_id = %instance.process_id,
                start_event = %start_event,
                "Process instance started"
            );
            instance.record(ProcessInstanceStarted {
                process_instance_id: instance.id.clone(),
                process_id: instance.process_id.clone(),
                start_event: start_event.clone(),
                timestamp: now,
            });

            let token = instance.tokens.issue(start_event.clone(), None, None);
            let mut queue = VecDeque::new();
            queue.push_back(Signal::Arrive {
                token,
                node: start_event.clone(),
            });
            instance.propagate(queue)
        })
    }

    /// Allocate the first created work item of `activity` to `participant`
    pub fn allocate_work_item(
        &mut self,
        activity: &FlowObjectId,
        participant: &dyn Participant,
    ) -> Result<(), CoreError> {
        self.transact("allocate", |instance| {
            let index = instance.locate_work_item(
                activity,
                Some(participant),
                WorkItemState::Created,
                "allocate",
            )?;
            instance
                .work_item_mut(activity, index)?
                .allocate(activity, ParticipantRef::of(participant))?;
            instance.record_work_item_state(activity, index, WorkItemState::Allocated);
            Ok(())
        })
    }

    /// Start the first allocated work item of `activity`
    ///
    /// For sub-processes and call activities this creates and starts the
    /// child instance. A child that ends right away completes the work item.
    pub fn start_work_item(
        &mut self,
        activity: &FlowObjectId,
        participant: Option<&dyn Participant>,
    ) -> Result<(), CoreError> {
        self.transact("start", |instance| {
            let index = instance.locate_work_item(
                activity,
                participant,
                WorkItemState::Allocated,
                "start",
            )?;
            instance.work_item_mut(activity, index)?.start(activity)?;
            instance.record_work_item_state(activity, index, WorkItemState::Started);

            if instance.flow_objects.require(activity)?.kind().is_process_task() {
                let child_ended = instance.start_sub_process(activity, index)?;
                if child_ended {
                    debug!(
                        process_instance_id = %instance.id,
                        activity = %activity,
                        "Sub-process ended immediately"
                    );
                    return instance.complete_and_advance(activity, index, None);
                }
            }
            Ok(())
        })
    }

    /// Complete the first started work item of `activity` and advance
    ///
    /// Without an explicit participant the allocated participant is recorded.
    /// Work items running a child instance can only complete once the child
    /// has ended.
    pub fn complete_work_item(
        &mut self,
        activity: &FlowObjectId,
        participant: Option<&dyn Participant>,
    ) -> Result<(), CoreError> {
        self.transact("complete", |instance| {
            let index = instance.locate_work_item(
                activity,
                participant,
                WorkItemState::Started,
                "complete",
            )?;
            let node = instance.flow_objects.require(activity)?;
            if node.kind().is_process_task() {
                let child_ended = node
                    .work_items()
                    .get(index)
                    .and_then(WorkItem::sub_process)
                    .map_or(false, ProcessInstance::is_ended);
                if !child_ended {
                    return Err(CoreError::unexpected_state(activity.as_str(), "complete"));
                }
            }
            instance.complete_and_advance(activity, index, participant.map(ParticipantRef::of))
        })
    }

    /// Release the token waiting on an intermediate catch event
    pub fn trigger_intermediate_event(&mut self, event: &FlowObjectId) -> Result<(), CoreError> {
        self.transact("trigger", |instance| {
            instance.ensure_running("trigger")?;
            let node = instance.flow_objects.require(event)?;
            if node.kind() != &NodeKind::IntermediateCatchEvent {
                return Err(CoreError::Logic(format!(
                    "{} is not an intermediate catch event",
                    event
                )));
            }
            if !node.has_token() {
                return Err(instance.unexpected_activity(event));
            }
            let consumed = node.tokens().to_vec();
            debug!(process_instance_id = %instance.id, event = %event, "Intermediate event triggered");

            let mut queue = VecDeque::new();
            instance.leave(event, consumed, &mut queue)?;
            instance.propagate(queue)
        })
    }

    /// Fire a boundary event while its activity is running
    ///
    /// An interrupting event cancels the activity's active work items and
    /// withdraws its token before the event's own token is propagated.
    pub fn trigger_boundary_event(&mut self, event: &FlowObjectId) -> Result<(), CoreError> {
        self.transact("trigger", |instance| {
            instance.ensure_running("trigger")?;
            let (activity, interrupting) = match instance.flow_objects.require(event)?.kind() {
                NodeKind::BoundaryEvent {
                    attached_to,
                    cancel_activity,
                } => (attached_to.clone(), *cancel_activity),
                _ => {
                    return Err(CoreError::Logic(format!("{} is not a boundary event", event)));
                }
            };
            if !instance.flow_objects.require(&activity)?.has_token() {
                return Err(instance.unexpected_activity(&activity));
            }

            if interrupting {
                instance.cancel_work_items(&activity)?;
                let node = instance.flow_objects.require_mut(&activity)?;
                let withdrawn = node.detach_all();
                node.set_state(FlowObjectState::Failed);
                for token in withdrawn {
                    instance.tokens.remove(token);
                }
                warn!(
                    process_instance_id = %instance.id,
                    activity = %activity,
                    event = %event,
                    "Activity interrupted by boundary event"
                );
            }

            let token = instance
                .tokens
                .issue(event.clone(), Some(activity.clone()), None);
            let mut queue = VecDeque::new();
            queue.push_back(Signal::Arrive {
                token,
                node: event.clone(),
            });
            instance.propagate(queue)
        })
    }

    /// Cancel the whole instance
    ///
    /// Active work items are cancelled (cascading into child instances),
    /// every token is withdrawn and the instance is marked failed. Cancelling
    /// an instance that already ended or failed does nothing.
    pub fn cancel(&mut self) -> Result<(), CoreError> {
        if matches!(
            self.state,
            ProcessInstanceState::Ended | ProcessInstanceState::Failed
        ) {
            return Ok(());
        }

        self.transact("cancel", |instance| {
            let ids: Vec<FlowObjectId> = instance
                .flow_objects
                .iter()
                .map(|node| node.id().clone())
                .collect();
            for id in &ids {
                instance.cancel_work_items(id)?;
                let node = instance.flow_objects.require_mut(id)?;
                node.detach_all();
                if matches!(
                    node.state(),
                    FlowObjectState::Inactive | FlowObjectState::Ready | FlowObjectState::Active
                ) {
                    node.set_state(FlowObjectState::Failed);
                }
            }

            let now = Utc::now();
            instance.tokens = TokenRegistry::restore(Vec::new(), instance.tokens.next_id());
            instance.state = ProcessInstanceState::Failed;
            instance.suspended = false;
            instance.ended_at = Some(now);
            warn!(process_instance_id = %instance.id, "Process instance cancelled");
            instance.record(ProcessInstanceCancelled {
                process_instance_id: instance.id.clone(),
                timestamp: now,
            });
            Ok(())
        })
    }

    /// Suspend a running instance; flow operations fail until resumed
    pub fn suspend(&mut self) -> Result<(), CoreError> {
        self.ensure_running("suspend")?;
        self.suspended = true;
        info!(process_instance_id = %self.id, "Process instance suspended");
        Ok(())
    }

    /// Resume a suspended instance
    pub fn resume(&mut self) -> Result<(), CoreError> {
        if !self.suspended {
            return Err(CoreError::unexpected_state(self.id.as_str(), "resume"));
        }
        self.suspended = false;
        info!(process_instance_id = %self.id, "Process instance resumed");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Instance identifier
    pub fn id(&self) -> &ProcessInstanceId {
        &self.id
    }

    /// Identifier of the definition the instance was created from
    pub fn process_id(&self) -> &ProcessId {
        &self.process_id
    }

    /// Version of the definition the instance was created from
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Display name of the definition
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Lifecycle state
    pub fn state(&self) -> ProcessInstanceState {
        self.state
    }

    /// Whether a start event fired
    pub fn is_started(&self) -> bool {
        self.state != ProcessInstanceState::NotStarted
    }

    /// Whether every token reached an end event
    pub fn is_ended(&self) -> bool {
        self.state == ProcessInstanceState::Ended
    }

    /// Whether the instance was cancelled
    pub fn is_failed(&self) -> bool {
        self.state == ProcessInstanceState::Failed
    }

    /// Whether the instance is suspended
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Start timestamp
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// End (or cancellation) timestamp
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Roles of the instance
    pub fn roles(&self) -> &RoleCollection {
        &self.roles
    }

    /// Live flow objects
    pub fn flow_objects(&self) -> &FlowObjectCollection {
        &self.flow_objects
    }

    /// Look up one flow object
    pub fn flow_object(&self, id: &FlowObjectId) -> Option<&FlowObject> {
        self.flow_objects.get(id)
    }

    /// Sequence flows
    pub fn sequence_flows(&self) -> &ConnectingObjectCollection {
        &self.sequence_flows
    }

    /// Flow objects currently holding a token, in declaration order
    pub fn get_current_flow_objects(&self) -> Vec<&FlowObject> {
        self.flow_objects.iter().filter(|node| node.has_token()).collect()
    }

    /// Live tokens, excluding tokens resting on end events
    pub fn get_active_tokens(&self) -> Vec<&Token> {
        self.tokens
            .iter()
            .filter(|token| {
                self.flow_objects
                    .get(&token.current)
                    .map_or(true, |node| node.kind() != &NodeKind::EndEvent)
            })
            .collect()
    }

    /// Work items created by `activity`
    pub fn get_work_items(&self, activity: &FlowObjectId) -> Result<&WorkItemsCollection, CoreError> {
        Ok(self.flow_objects.require(activity)?.work_items())
    }

    /// Every work item ever created, in creation order
    pub fn get_activity_log(&self) -> Vec<ActivityLogView<'_>> {
        self.activity_log
            .iter()
            .filter_map(|entry| {
                let activity = self.flow_objects.get(&entry.activity)?;
                let work_item = activity.work_items().get(entry.work_item)?;
                Some(ActivityLogView {
                    activity,
                    work_item,
                })
            })
            .collect()
    }

    /// Raw activity log entries
    pub fn activity_log_entries(&self) -> &[ActivityLogEntry] {
        &self.activity_log
    }

    /// Child instance of the most recent work item of `activity` that runs one
    pub fn sub_process(&self, activity: &FlowObjectId) -> Option<&ProcessInstance> {
        self.flow_objects
            .get(activity)?
            .work_items()
            .iter()
            .rev()
            .find_map(WorkItem::sub_process)
    }

    /// Mutable variant of [`ProcessInstance::sub_process`]
    pub fn sub_process_mut(&mut self, activity: &FlowObjectId) -> Option<&mut ProcessInstance> {
        self.flow_objects
            .get_mut(activity)?
            .work_items_mut()
            .iter_mut()
            .rev()
            .find_map(WorkItem::sub_process_mut)
    }

    /// Resolve a chain of sub-process and call activities to the child
    /// instance at its end; an empty scope is the instance itself
    ///
    /// Every instance along the way must be running and every activity must
    /// hold a token and a child instance.
    pub fn scoped_instance_mut(
        &mut self,
        scope: &[FlowObjectId],
    ) -> Result<&mut ProcessInstance, CoreError> {
        let Some((activity, rest)) = scope.split_first() else {
            return Ok(self);
        };
        self.ensure_running("enter sub-process")?;
        if !self.flow_objects.require(activity)?.has_token() {
            return Err(self.unexpected_activity(activity));
        }
        let child = self
            .sub_process_mut(activity)
            .ok_or_else(|| CoreError::unexpected_state(activity.as_str(), "enter sub-process"))?;
        child.scoped_instance_mut(rest)
    }

    /// Process data consulted by condition evaluation
    pub fn process_data(&self) -> &Value {
        &self.process_data
    }

    /// Replace the process data
    pub fn set_process_data(&mut self, data: Value) {
        self.process_data = data;
    }

    /// Set one top-level process variable
    pub fn set_process_variable(&mut self, key: impl Into<String>, value: Value) {
        if !self.process_data.is_object() {
            self.process_data = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.process_data {
            map.insert(key.into(), value);
        }
    }

    /// Collaborators attached to the instance
    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Attach collaborators to the instance and every child instance
    pub fn attach_collaborators(&mut self, collaborators: Collaborators) {
        for node in self.flow_objects.iter_mut() {
            for item in node.work_items_mut().iter_mut() {
                if let Some(child) = item.sub_process_mut() {
                    child.attach_collaborators(collaborators.clone());
                }
            }
        }
        self.collaborators = collaborators;
    }

    /// Engine configuration of the instance
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Replace the engine configuration of the instance and every child instance
    pub fn set_config(&mut self, config: EngineConfig) {
        for node in self.flow_objects.iter_mut() {
            for item in node.work_items_mut().iter_mut() {
                if let Some(child) = item.sub_process_mut() {
                    child.set_config(config.clone());
                }
            }
        }
        self.config = config;
    }

    /// Take all recorded events, followed by those of child instances
    pub fn take_events(&mut self) -> Vec<Box<dyn DomainEvent>> {
        let mut events = std::mem::take(&mut self.events);
        for node in self.flow_objects.iter_mut() {
            for item in node.work_items_mut().iter_mut() {
                if let Some(child) = item.sub_process_mut() {
                    events.extend(child.take_events());
                }
            }
        }
        events
    }

    // ---------------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------------

    /// Capture the complete persisted state
    pub fn to_snapshot(&self) -> ProcessInstanceSnapshot {
        ProcessInstanceSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            id: self.id.clone(),
            process_id: self.process_id.clone(),
            version: self.version,
            name: self.name.clone(),
            state: self.state,
            suspended: self.suspended,
            roles: self.roles.to_vec(),
            flow_objects: self.flow_objects.to_vec(),
            sequence_flows: self.sequence_flows.to_vec(),
            tokens: self.tokens.iter().cloned().collect(),
            next_token_id: self.tokens.next_id(),
            process_data: self.process_data.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            activity_log: self.activity_log.clone(),
        }
    }

    /// Rebuild an instance from a snapshot
    ///
    /// The restored instance carries default collaborators and
    /// configuration; attach the real ones before driving it further.
    pub fn from_snapshot(snapshot: ProcessInstanceSnapshot) -> Result<Self, CoreError> {
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(CoreError::SerializationError(format!(
                "Unsupported snapshot format version {}",
                snapshot.format_version
            )));
        }

        let flow_objects = FlowObjectCollection::new(snapshot.flow_objects);
        let tokens = TokenRegistry::restore(snapshot.tokens, snapshot.next_token_id);

        for token in tokens.iter() {
            let attached = flow_objects
                .get(&token.current)
                .map_or(false, |node| node.tokens().contains(&token.id));
            if !attached {
                return Err(CoreError::SerializationError(format!(
                    "{} is not attached to {}",
                    token.id, token.current
                )));
            }
        }
        let mut seen = HashSet::new();
        for node in flow_objects.iter() {
            for &token in node.tokens() {
                if tokens.get(token).is_none() || !seen.insert(token) {
                    return Err(CoreError::SerializationError(format!(
                        "{} holds unknown or duplicated {}",
                        node.id(),
                        token
                    )));
                }
            }
        }
        for entry in &snapshot.activity_log {
            let known = flow_objects
                .get(&entry.activity)
                .map_or(false, |node| node.work_items().get(entry.work_item).is_some());
            if !known {
                return Err(CoreError::SerializationError(format!(
                    "Activity log references unknown work item {} of {}",
                    entry.work_item, entry.activity
                )));
            }
        }

        Ok(Self {
            id: snapshot.id,
            process_id: snapshot.process_id,
            version: snapshot.version,
            name: snapshot.name,
            state: snapshot.state,
            suspended: snapshot.suspended,
            roles: RoleCollection::new(snapshot.roles),
            flow_objects,
            sequence_flows: ConnectingObjectCollection::new(snapshot.sequence_flows),
            tokens,
            process_data: snapshot.process_data,
            started_at: snapshot.started_at,
            ended_at: snapshot.ended_at,
            activity_log: snapshot.activity_log,
            collaborators: Collaborators::default(),
            config: EngineConfig::default(),
            events: Vec::new(),
        })
    }

    /// Serialize the instance to JSON
    pub fn serialize(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(&self.to_snapshot())?)
    }

    /// Deserialize an instance from JSON produced by [`ProcessInstance::serialize`]
    pub fn deserialize(data: &str) -> Result<Self, CoreError> {
        let snapshot: ProcessInstanceSnapshot = serde_json::from_str(data)?;
        Self::from_snapshot(snapshot)
    }

    // ---------------------------------------------------------------------
    // Propagation
    // ---------------------------------------------------------------------

    fn transact<T>(
        &mut self,
        operation: &str,
        apply: impl FnOnce(&mut Self) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let checkpoint = self.clone();
        let recorded = self.events.len();
        match apply(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(
                    process_instance_id = %self.id,
                    operation,
                    error = %err,
                    "Operation failed, instance restored"
                );
                let mut events = std::mem::take(&mut self.events);
                events.truncate(recorded);
                *self = checkpoint;
                self.events = events;
                Err(err)
            }
        }
    }

    fn propagate(&mut self, mut queue: VecDeque<Signal>) -> Result<(), CoreError> {
        let mut steps = 0usize;
        loop {
            while let Some(signal) = queue.pop_front() {
                steps += 1;
                if steps > self.config.max_propagation_steps {
                    return Err(CoreError::Logic(format!(
                        "Propagation in process instance {} exceeded {} steps",
                        self.id, self.config.max_propagation_steps
                    )));
                }
                match signal {
                    Signal::Arrive { token, node } => self.arrive(token, &node, &mut queue)?,
                    Signal::AutoRun {
                        activity,
                        work_item,
                    } => self.auto_run(&activity, work_item, &mut queue)?,
                }
            }

            match self.settled_inclusive_join() {
                Some((join, consumed)) => {
                    debug!(
                        process_instance_id = %self.id,
                        gateway = %join,
                        "No further token can reach inclusive gateway"
                    );
                    self.leave(&join, consumed, &mut queue)?;
                }
                None => break,
            }
        }

        if self.state == ProcessInstanceState::Running && self.tokens.is_empty() {
            let now = Utc::now();
            self.state = ProcessInstanceState::Ended;
            self.ended_at = Some(now);
            info!(process_instance_id = %self.id, "Process instance ended");
            self.record(ProcessInstanceEnded {
                process_instance_id: self.id.clone(),
                timestamp: now,
            });
        }
        Ok(())
    }

    fn settled_inclusive_join(&self) -> Option<(FlowObjectId, Vec<TokenId>)> {
        self.flow_objects
            .iter()
            .filter(|node| node.kind() == &NodeKind::InclusiveGateway && node.has_token())
            .find_map(|node| {
                gateway::inclusive_join_settled(
                    node,
                    &self.flow_objects,
                    &self.sequence_flows,
                    &self.tokens,
                )
                .map(|consumed| (node.id().clone(), consumed))
            })
    }

    fn arrive(
        &mut self,
        token: TokenId,
        node_id: &FlowObjectId,
        queue: &mut VecDeque<Signal>,
    ) -> Result<(), CoreError> {
        let node = self.flow_objects.require_mut(node_id)?;
        node.attach_token(token)?;

        let behaviour = match node.kind() {
            NodeKind::StartEvent | NodeKind::BoundaryEvent { .. } | NodeKind::ExclusiveGateway => {
                Behaviour::Passthrough
            }
            NodeKind::EndEvent => Behaviour::Terminate,
            NodeKind::IntermediateCatchEvent => Behaviour::Wait,
            NodeKind::ParallelGateway => Behaviour::ParallelJoin,
            NodeKind::InclusiveGateway => Behaviour::InclusiveJoin,
            _ => Behaviour::Work,
        };

        match behaviour {
            Behaviour::Passthrough => self.leave(node_id, vec![token], queue),
            Behaviour::Terminate => {
                node.detach_token(token);
                node.set_state(FlowObjectState::Closed);
                self.tokens.remove(token);
                debug!(
                    process_instance_id = %self.id,
                    token = %token,
                    end_event = %node_id,
                    "Token consumed by end event"
                );
                Ok(())
            }
            Behaviour::Wait => {
                node.set_state(FlowObjectState::Active);
                debug!(
                    process_instance_id = %self.id,
                    event = %node_id,
                    "Token waiting for event trigger"
                );
                Ok(())
            }
            Behaviour::ParallelJoin | Behaviour::InclusiveJoin => {
                let node = self.flow_objects.require(node_id)?;
                let ready = match behaviour {
                    Behaviour::ParallelJoin => {
                        gateway::parallel_join(node, &self.sequence_flows, &self.tokens)
                    }
                    _ => gateway::inclusive_join_complete(node, &self.sequence_flows, &self.tokens),
                };
                match ready {
                    Some(consumed) => self.leave(node_id, consumed, queue),
                    None => {
                        self.flow_objects
                            .require_mut(node_id)?
                            .set_state(FlowObjectState::Active);
                        debug!(
                            process_instance_id = %self.id,
                            gateway = %node_id,
                            "Join waiting for other branches"
                        );
                        Ok(())
                    }
                }
            }
            Behaviour::Work => self.create_work(node_id, queue),
        }
    }

    /// Hand the consumed tokens of `node_id` on along the selected outgoing flows
    fn leave(
        &mut self,
        node_id: &FlowObjectId,
        consumed: Vec<TokenId>,
        queue: &mut VecDeque<Signal>,
    ) -> Result<(), CoreError> {
        let node = self.flow_objects.require(node_id)?;
        let selected: Vec<(SequenceFlowId, FlowObjectId)> = match gateway::select_outgoing(
            node,
            &self.sequence_flows,
            self.collaborators.expression_evaluator.as_ref(),
            &self.process_data,
        ) {
            Ok(flows) => flows
                .into_iter()
                .map(|flow| (flow.id.clone(), flow.destination.clone()))
                .collect(),
            Err(err) => {
                warn!(
                    process_instance_id = %self.id,
                    flow_object = %node_id,
                    error = %err,
                    "Outgoing flow selection failed"
                );
                return Err(err);
            }
        };
        let is_gateway = node.kind().is_gateway();

        let node = self.flow_objects.require_mut(node_id)?;
        for token in &consumed {
            node.detach_token(*token);
        }
        node.set_state(if node.has_token() {
            FlowObjectState::Active
        } else {
            FlowObjectState::Closed
        });

        if is_gateway {
            self.record(GatewayFired {
                process_instance_id: self.id.clone(),
                gateway: node_id.clone(),
                consumed: consumed.len(),
                selected: selected.iter().map(|(flow, _)| flow.clone()).collect(),
                timestamp: Utc::now(),
            });
        }

        if let ([token], [(via, destination)]) = (consumed.as_slice(), selected.as_slice()) {
            self.tokens.flow(*token, destination.clone(), Some(via.clone()))?;
            self.record_flow(*token, node_id, destination, via);
            queue.push_back(Signal::Arrive {
                token: *token,
                node: destination.clone(),
            });
            return Ok(());
        }

        for token in consumed {
            self.tokens.remove(token);
        }
        for (via, destination) in selected {
            let token =
                self.tokens
                    .issue(destination.clone(), Some(node_id.clone()), Some(via.clone()));
            self.record_flow(token, node_id, &destination, &via);
            queue.push_back(Signal::Arrive {
                token,
                node: destination,
            });
        }
        Ok(())
    }

    fn create_work(
        &mut self,
        activity: &FlowObjectId,
        queue: &mut VecDeque<Signal>,
    ) -> Result<(), CoreError> {
        let node = self.flow_objects.require(activity)?;
        let contexts: Vec<Option<Value>> = match node.multi_instance() {
            None => vec![None],
            Some(characteristics) if characteristics.sequential => self
                .collaborators
                .provider(node)?
                .get_sequential_instance_data(node)?
                .into_iter()
                .map(Some)
                .collect(),
            Some(_) => self
                .collaborators
                .provider(node)?
                .get_parallel_instances_data(node)?
                .into_iter()
                .map(Some)
                .collect(),
        };

        if contexts.is_empty() {
            debug!(
                process_instance_id = %self.id,
                activity = %activity,
                "Multi-instance activity has no instances"
            );
            return self.finish_activity(activity, queue);
        }

        self.flow_objects
            .require_mut(activity)?
            .set_state(FlowObjectState::Active);
        for data in contexts {
            self.create_work_item(activity, data, queue)?;
        }
        Ok(())
    }

    fn create_work_item(
        &mut self,
        activity: &FlowObjectId,
        data: Option<Value>,
        queue: &mut VecDeque<Signal>,
    ) -> Result<(), CoreError> {
        let node = self.flow_objects.require_mut(activity)?;
        let index = node.work_items_mut().push(WorkItem::new(data));
        let operational = node.kind().is_operational();

        self.activity_log.push(ActivityLogEntry {
            activity: activity.clone(),
            work_item: index,
        });
        debug!(
            process_instance_id = %self.id,
            activity = %activity,
            work_item = index,
            "Work item created"
        );
        self.record(WorkItemCreated {
            process_instance_id: self.id.clone(),
            activity: activity.clone(),
            work_item: index,
            timestamp: Utc::now(),
        });

        if operational {
            queue.push_back(Signal::AutoRun {
                activity: activity.clone(),
                work_item: index,
            });
        }
        Ok(())
    }

    /// Allocate, start, run and complete a service or send task work item
    fn auto_run(
        &mut self,
        activity: &FlowObjectId,
        index: usize,
        queue: &mut VecDeque<Signal>,
    ) -> Result<(), CoreError> {
        let node = self.flow_objects.require(activity)?;
        let pending = node
            .work_items()
            .get(index)
            .map_or(false, |item| item.state() == WorkItemState::Created);
        if !pending {
            return Ok(());
        }

        let runner = Arc::clone(self.collaborators.runner(node)?);
        let participant = runner.provide_participant(node, self)?;
        check_role(node, participant.as_ref())?;

        let item = self.work_item_mut(activity, index)?;
        item.allocate(activity, ParticipantRef::of(participant.as_ref()))?;
        item.start(activity)?;
        self.record_work_item_state(activity, index, WorkItemState::Allocated);
        self.record_work_item_state(activity, index, WorkItemState::Started);

        let node = self.flow_objects.require(activity)?;
        let item = node.work_items().get(index).ok_or_else(|| {
            CoreError::unexpected_state(activity.as_str(), "run")
        })?;
        runner.run(node, item)?;
        debug!(
            process_instance_id = %self.id,
            activity = %activity,
            operation = node.kind().name(),
            "Operational task ran"
        );

        self.work_item_mut(activity, index)?.complete(activity, None)?;
        self.record_work_item_state(activity, index, WorkItemState::Ended);
        self.after_work_item_completed(activity, queue)
    }

    fn complete_and_advance(
        &mut self,
        activity: &FlowObjectId,
        index: usize,
        participant: Option<ParticipantRef>,
    ) -> Result<(), CoreError> {
        self.work_item_mut(activity, index)?
            .complete(activity, participant)?;
        self.record_work_item_state(activity, index, WorkItemState::Ended);

        let mut queue = VecDeque::new();
        self.after_work_item_completed(activity, &mut queue)?;
        self.propagate(queue)
    }

    fn after_work_item_completed(
        &mut self,
        activity: &FlowObjectId,
        queue: &mut VecDeque<Signal>,
    ) -> Result<(), CoreError> {
        let node = self.flow_objects.require(activity)?;
        let Some(characteristics) = node.multi_instance().cloned() else {
            return self.finish_activity(activity, queue);
        };

        if let Some(condition) = &characteristics.completion_condition {
            if self
                .collaborators
                .expression_evaluator
                .evaluate(condition, &self.process_data)?
            {
                debug!(
                    process_instance_id = %self.id,
                    activity = %activity,
                    "Completion condition met"
                );
                self.cancel_work_items(activity)?;
                return self.finish_activity(activity, queue);
            }
        }

        if node.work_items().has_active() {
            return Ok(());
        }

        if characteristics.sequential {
            let next = self
                .collaborators
                .provider(node)?
                .get_sequential_instance_data(node)?;
            if let Some(data) = next {
                return self.create_work_item(activity, Some(data), queue);
            }
        }

        self.finish_activity(activity, queue)
    }

    fn finish_activity(
        &mut self,
        activity: &FlowObjectId,
        queue: &mut VecDeque<Signal>,
    ) -> Result<(), CoreError> {
        let node = self.flow_objects.require(activity)?;
        if node.multi_instance().is_some() {
            self.collaborators
                .provider(node)?
                .merge_instances_data(node, node.work_items())?;
        }
        let consumed = node.tokens().to_vec();
        self.leave(activity, consumed, queue)
    }

    fn cancel_work_items(&mut self, activity: &FlowObjectId) -> Result<(), CoreError> {
        let node = self.flow_objects.require_mut(activity)?;
        let active = node.work_items().active_positions();
        for &index in &active {
            if let Some(item) = node.work_items_mut().get_mut(index) {
                item.cancel(activity)?;
            }
        }
        for index in active {
            warn!(
                process_instance_id = %self.id,
                activity = %activity,
                work_item = index,
                "Work item cancelled"
            );
            self.record_work_item_state(activity, index, WorkItemState::Cancelled);
        }
        Ok(())
    }

    fn start_sub_process(&mut self, activity: &FlowObjectId, index: usize) -> Result<bool, CoreError> {
        let source = match self.flow_objects.require(activity)?.kind() {
            NodeKind::SubProcess { definition } => SubProcessSource::Embedded((**definition).clone()),
            NodeKind::CallActivity { called_process } => {
                match self.flow_objects.require(activity)?.resolved_call() {
                    Some(resolved) => SubProcessSource::Resolved(resolved.clone()),
                    None => SubProcessSource::Call(called_process.clone()),
                }
            }
            _ => return Err(CoreError::Logic(format!("{} does not run a process", activity))),
        };

        let definition = match source {
            SubProcessSource::Embedded(definition) | SubProcessSource::Resolved(definition) => {
                definition
            }
            SubProcessSource::Call(called_process) => {
                let repository =
                    self.collaborators.definition_repository.as_ref().ok_or_else(|| {
                        CoreError::Logic(format!(
                            "No definition repository attached to resolve {}",
                            called_process
                        ))
                    })?;
                let definition = repository
                    .get_latest_by_id(&called_process)
                    .ok_or_else(|| CoreError::ProcessDefinitionNotFound(called_process.to_string()))?;
                debug!(
                    process_instance_id = %self.id,
                    activity = %activity,
                    called_process = %called_process,
                    version = definition.version(),
                    "Called process resolved"
                );
                self.flow_objects
                    .require_mut(activity)?
                    .cache_resolved_call(definition.clone());
                definition
            }
        };

        let start_event = definition.default_start_event().cloned().ok_or_else(|| {
            CoreError::Logic(format!("Process {} has no start event", definition.id()))
        })?;
        let mut child =
            definition.create_process_instance_with(self.collaborators.clone(), self.config.clone());
        child.process_data = self.process_data.clone();
        child.start(&start_event)?;
        debug!(
            process_instance_id = %self.id,
            activity = %activity,
            child_instance_id = %child.id,
            "Sub-process started"
        );

        let ended = child.is_ended();
        self.work_item_mut(activity, index)?.attach_sub_process(child);
        Ok(ended)
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn ensure_running(&self, operation: &str) -> Result<(), CoreError> {
        if self.suspended || self.state != ProcessInstanceState::Running {
            return Err(CoreError::unexpected_state(self.id.as_str(), operation));
        }
        Ok(())
    }

    fn unexpected_activity(&self, actual: &FlowObjectId) -> CoreError {
        let expected: Vec<&str> = self
            .get_current_flow_objects()
            .iter()
            .map(|node| node.id().as_str())
            .collect();
        CoreError::UnexpectedActivity {
            expected: expected.join(", "),
            actual: actual.to_string(),
        }
    }

    /// Validate a work-item operation and find the work item it applies to
    ///
    /// Checks, in order: the instance is running, the activity exists and
    /// holds a token, the participant holds the activity's role, and a work
    /// item is in the state the operation requires.
    fn locate_work_item(
        &self,
        activity: &FlowObjectId,
        participant: Option<&dyn Participant>,
        required: WorkItemState,
        operation: &str,
    ) -> Result<usize, CoreError> {
        self.ensure_running(operation)?;
        let node = self.flow_objects.require(activity)?;
        if !node.has_token() {
            return Err(self.unexpected_activity(activity));
        }
        if !node.kind().is_activity() {
            return Err(CoreError::unexpected_state(activity.as_str(), operation));
        }
        if let Some(participant) = participant {
            check_role(node, participant)?;
        }
        node.work_items()
            .position_in_state(required)
            .ok_or_else(|| CoreError::unexpected_state(activity.as_str(), operation))
    }

    fn work_item_mut(
        &mut self,
        activity: &FlowObjectId,
        index: usize,
    ) -> Result<&mut WorkItem, CoreError> {
        self.flow_objects
            .require_mut(activity)?
            .work_items_mut()
            .get_mut(index)
            .ok_or_else(|| CoreError::unexpected_state(activity.as_str(), "locate work item"))
    }

    fn record(&mut self, event: impl DomainEvent + 'static) {
        if self.config.record_events {
            self.events.push(Box::new(event));
        }
    }

    fn record_flow(
        &mut self,
        token: TokenId,
        from: &FlowObjectId,
        to: &FlowObjectId,
        via: &SequenceFlowId,
    ) {
        debug!(
            process_instance_id = %self.id,
            token = %token,
            from = %from,
            to = %to,
            sequence_flow = %via,
            "Token flowed"
        );
        self.record(TokenFlowed {
            process_instance_id: self.id.clone(),
            token_id: token,
            from: from.clone(),
            to: to.clone(),
            sequence_flow: via.clone(),
            timestamp: Utc::now(),
        });
    }

    fn record_work_item_state(&mut self, activity: &FlowObjectId, index: usize, state: WorkItemState) {
        debug!(
            process_instance_id = %self.id,
            activity = %activity,
            work_item = index,
            state = ?state,
            "Work item state changed"
        );
        self.record(WorkItemStateChanged {
            process_instance_id: self.id.clone(),
            activity: activity.clone(),
            work_item: index,
            state,
            timestamp: Utc::now(),
        });
    }
}

impl From<ProcessInstance> for ProcessInstanceSnapshot {
    fn from(instance: ProcessInstance) -> Self {
        instance.to_snapshot()
    }
}

impl TryFrom<ProcessInstanceSnapshot> for ProcessInstance {
    type Error = CoreError;

    fn try_from(snapshot: ProcessInstanceSnapshot) -> Result<Self, Self::Error> {
        ProcessInstance::from_snapshot(snapshot)
    }
}
