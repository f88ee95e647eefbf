//! Work items: one execution attempt of an activity
//!
//! A work item walks `created → allocated → started → ended`, or drops
//! into `cancelled` from any state before `ended`. Every transition stamps
//! its timestamp. Work items are never removed; they form the audit trail
//! of the activity.

use crate::domain::process_instance::ProcessInstance;
use crate::domain::role::ParticipantRef;
use crate::types::FlowObjectId;
use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Work item lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    /// Created when the token arrived, nobody assigned yet
    Created,
    /// Assigned to a participant
    Allocated,
    /// Participant is working on it
    Started,
    /// Finished
    Ended,
    /// Withdrawn before it finished
    Cancelled,
}

impl WorkItemState {
    /// Whether no further transition is possible
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkItemState::Ended | WorkItemState::Cancelled)
    }
}

/// How a work item finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndResult {
    /// Completed normally
    Completion,
    /// Cancelled
    Cancellation,
}

/// One execution attempt of an activity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    state: WorkItemState,
    participant: Option<ParticipantRef>,
    created_at: DateTime<Utc>,
    allocated_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    end_participant: Option<ParticipantRef>,
    end_result: Option<EndResult>,
    data: Option<Value>,
    sub_process: Option<Box<ProcessInstance>>,
}

impl WorkItem {
    /// Create a work item in the `created` state
    pub fn new(data: Option<Value>) -> Self {
        Self {
            state: WorkItemState::Created,
            participant: None,
            created_at: Utc::now(),
            allocated_at: None,
            started_at: None,
            ended_at: None,
            end_participant: None,
            end_result: None,
            data,
            sub_process: None,
        }
    }

    /// Assign the work item; requires `created`
    pub fn allocate(
        &mut self,
        activity: &FlowObjectId,
        participant: ParticipantRef,
    ) -> Result<(), CoreError> {
        self.expect(WorkItemState::Created, activity, "allocate")?;
        self.participant = Some(participant);
        self.allocated_at = Some(Utc::now());
        self.state = WorkItemState::Allocated;
        Ok(())
    }

    /// Begin work; requires `allocated`
    pub fn start(&mut self, activity: &FlowObjectId) -> Result<(), CoreError> {
        self.expect(WorkItemState::Allocated, activity, "start")?;
        self.started_at = Some(Utc::now());
        self.state = WorkItemState::Started;
        Ok(())
    }

    /// Finish work; requires `started`
    ///
    /// Without an explicit participant the allocated participant is recorded
    /// as the one who completed the item.
    pub fn complete(
        &mut self,
        activity: &FlowObjectId,
        participant: Option<ParticipantRef>,
    ) -> Result<(), CoreError> {
        self.expect(WorkItemState::Started, activity, "complete")?;
        self.end_participant = participant.or_else(|| self.participant.clone());
        self.ended_at = Some(Utc::now());
        self.end_result = Some(EndResult::Completion);
        self.state = WorkItemState::Ended;
        Ok(())
    }

    /// Withdraw the work item from any non-terminal state
    ///
    /// A running sub-process owned by this item is cancelled with it.
    pub fn cancel(&mut self, activity: &FlowObjectId) -> Result<(), CoreError> {
        if self.state.is_terminal() {
            return Err(CoreError::unexpected_state(activity.as_str(), "cancel"));
        }
        if let Some(child) = self.sub_process.as_deref_mut() {
            if !child.is_ended() {
                child.cancel()?;
            }
        }
        self.ended_at = Some(Utc::now());
        self.end_result = Some(EndResult::Cancellation);
        self.state = WorkItemState::Cancelled;
        Ok(())
    }

    fn expect(
        &self,
        expected: WorkItemState,
        activity: &FlowObjectId,
        operation: &str,
    ) -> Result<(), CoreError> {
        if self.state != expected {
            return Err(CoreError::unexpected_state(activity.as_str(), operation));
        }
        Ok(())
    }

    /// Current state
    #[inline]
    pub fn state(&self) -> WorkItemState {
        self.state
    }

    /// Whether the item can still make progress
    #[inline]
    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Participant the item was allocated to
    pub fn participant(&self) -> Option<&ParticipantRef> {
        self.participant.as_ref()
    }

    /// Participant recorded when the item ended
    pub fn end_participant(&self) -> Option<&ParticipantRef> {
        self.end_participant.as_ref()
    }

    /// How the item ended
    pub fn end_result(&self) -> Option<EndResult> {
        self.end_result
    }

    /// Creation timestamp
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Allocation timestamp
    pub fn allocated_at(&self) -> Option<DateTime<Utc>> {
        self.allocated_at
    }

    /// Start timestamp
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// End timestamp (completion or cancellation)
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Per-instance data supplied by the data provider of a multi-instance activity
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Sub-process instance run by this item
    pub fn sub_process(&self) -> Option<&ProcessInstance> {
        self.sub_process.as_deref()
    }

    /// Mutable access to the sub-process instance run by this item
    pub fn sub_process_mut(&mut self) -> Option<&mut ProcessInstance> {
        self.sub_process.as_deref_mut()
    }

    pub(crate) fn attach_sub_process(&mut self, instance: ProcessInstance) {
        self.sub_process = Some(Box::new(instance));
    }
}

/// Ordered work items of one activity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemsCollection {
    items: Vec<WorkItem>,
}

impl WorkItemsCollection {
    /// Create an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a work item, returning its position
    pub fn push(&mut self, item: WorkItem) -> usize {
        self.items.push(item);
        self.items.len() - 1
    }

    /// Work item at `index`
    pub fn get(&self, index: usize) -> Option<&WorkItem> {
        self.items.get(index)
    }

    /// Mutable work item at `index`
    pub fn get_mut(&mut self, index: usize) -> Option<&mut WorkItem> {
        self.items.get_mut(index)
    }

    /// Most recently created work item
    pub fn last(&self) -> Option<&WorkItem> {
        self.items.last()
    }

    /// Position of the first active work item in `state`
    pub fn position_in_state(&self, state: WorkItemState) -> Option<usize> {
        self.items.iter().position(|item| item.state == state)
    }

    /// Positions of every active work item
    pub fn active_positions(&self) -> Vec<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.is_active())
            .map(|(index, _)| index)
            .collect()
    }

    /// Active work items
    pub fn active(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.iter().filter(|item| item.is_active())
    }

    /// Work items that ended normally
    pub fn completed(&self) -> impl Iterator<Item = &WorkItem> {
        self.items
            .iter()
            .filter(|item| item.state == WorkItemState::Ended)
    }

    /// Whether any work item is still active
    pub fn has_active(&self) -> bool {
        self.items.iter().any(WorkItem::is_active)
    }

    /// Iterate over all work items in creation order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &WorkItem> {
        self.items.iter()
    }

    /// Mutable iteration over all work items
    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut WorkItem> {
        self.items.iter_mut()
    }

    /// Number of work items ever created
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no work item was ever created
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
