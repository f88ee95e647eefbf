use crate::domain::work_item::WorkItemState;
use crate::types::{FlowObjectId, ProcessId, ProcessInstanceId, SequenceFlowId, TokenId};
use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Domain event trait for all events raised by a process instance
pub trait DomainEvent: Debug + Send + Sync {
    /// Returns the type of the event as a string
    fn event_type(&self) -> &'static str;

    /// Returns the process instance ID this event is associated with
    fn process_instance_id(&self) -> &ProcessInstanceId;

    /// Returns the timestamp when the event occurred
    fn timestamp(&self) -> DateTime<Utc>;
}

macro_rules! domain_event {
    ($name:ident, $event_type:literal) => {
        impl DomainEvent for $name {
            fn event_type(&self) -> &'static str {
                $event_type
            }

            fn process_instance_id(&self) -> &ProcessInstanceId {
                &self.process_instance_id
            }

            fn timestamp(&self) -> DateTime<Utc> {
                self.timestamp
            }
        }
    };
}

/// Event: Process instance started
#[derive(Debug)]
pub struct ProcessInstanceStarted {
    /// The unique identifier of the process instance
    pub process_instance_id: ProcessInstanceId,

    /// The identifier of the process definition
    pub process_id: ProcessId,

    /// The start event that received the first token
    pub start_event: FlowObjectId,

    /// The timestamp when the instance started
    pub timestamp: DateTime<Utc>,
}

domain_event!(ProcessInstanceStarted, "process_instance.started");

/// Event: Process instance ended because no token remains
#[derive(Debug)]
pub struct ProcessInstanceEnded {
    /// The unique identifier of the process instance
    pub process_instance_id: ProcessInstanceId,

    /// The timestamp when the instance ended
    pub timestamp: DateTime<Utc>,
}

domain_event!(ProcessInstanceEnded, "process_instance.ended");

/// Event: Process instance cancelled
#[derive(Debug)]
pub struct ProcessInstanceCancelled {
    /// The unique identifier of the process instance
    pub process_instance_id: ProcessInstanceId,

    /// The timestamp when the instance was cancelled
    pub timestamp: DateTime<Utc>,
}

domain_event!(ProcessInstanceCancelled, "process_instance.cancelled");

/// Event: A token moved along a sequence flow
#[derive(Debug)]
pub struct TokenFlowed {
    /// The unique identifier of the process instance
    pub process_instance_id: ProcessInstanceId,

    /// The token that arrived
    pub token_id: TokenId,

    /// Flow object the token left
    pub from: FlowObjectId,

    /// Flow object the token reached
    pub to: FlowObjectId,

    /// Sequence flow that was taken
    pub sequence_flow: SequenceFlowId,

    /// The timestamp of the movement
    pub timestamp: DateTime<Utc>,
}

domain_event!(TokenFlowed, "token.flowed");

/// Event: An activity created a work item
#[derive(Debug)]
pub struct WorkItemCreated {
    /// The unique identifier of the process instance
    pub process_instance_id: ProcessInstanceId,

    /// The activity owning the work item
    pub activity: FlowObjectId,

    /// Position of the work item within the activity
    pub work_item: usize,

    /// The timestamp when the work item was created
    pub timestamp: DateTime<Utc>,
}

domain_event!(WorkItemCreated, "work_item.created");

/// Event: A work item changed state
#[derive(Debug)]
pub struct WorkItemStateChanged {
    /// The unique identifier of the process instance
    pub process_instance_id: ProcessInstanceId,

    /// The activity owning the work item
    pub activity: FlowObjectId,

    /// Position of the work item within the activity
    pub work_item: usize,

    /// State the work item moved into
    pub state: WorkItemState,

    /// The timestamp of the transition
    pub timestamp: DateTime<Utc>,
}

domain_event!(WorkItemStateChanged, "work_item.state_changed");

/// Event: A gateway consumed its incoming tokens and emitted outgoing ones
#[derive(Debug)]
pub struct GatewayFired {
    /// The unique identifier of the process instance
    pub process_instance_id: ProcessInstanceId,

    /// The gateway that fired
    pub gateway: FlowObjectId,

    /// Number of tokens consumed
    pub consumed: usize,

    /// Sequence flows selected for outgoing tokens
    pub selected: Vec<SequenceFlowId>,

    /// The timestamp of the firing
    pub timestamp: DateTime<Utc>,
}

domain_event!(GatewayFired, "gateway.fired");
