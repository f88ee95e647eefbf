//! Persisted form of a process instance
//!
//! A snapshot captures everything needed to resume an instance: identity,
//! lifecycle, the flow objects with their tokens and work items (child
//! instances nested inside them), token bookkeeping, process data and the
//! activity log. Collaborators and engine configuration are runtime
//! attachments and are not part of it.

use crate::domain::flow_object::FlowObject;
use crate::domain::process_instance::{ActivityLogEntry, ProcessInstanceState};
use crate::domain::role::Role;
use crate::domain::sequence_flow::SequenceFlow;
use crate::domain::token::Token;
use crate::types::{ProcessId, ProcessInstanceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current snapshot layout
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Serializable state of a process instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInstanceSnapshot {
    /// Layout version, checked on restore
    pub format_version: u32,

    /// Instance identifier
    pub id: ProcessInstanceId,

    /// Definition identifier
    pub process_id: ProcessId,

    /// Definition version
    pub version: u32,

    /// Definition display name
    #[serde(default)]
    pub name: Option<String>,

    /// Lifecycle state
    pub state: ProcessInstanceState,

    /// Suspension flag
    #[serde(default)]
    pub suspended: bool,

    /// Roles
    #[serde(default)]
    pub roles: Vec<Role>,

    /// Flow objects with tokens, state and work items
    pub flow_objects: Vec<FlowObject>,

    /// Sequence flows
    pub sequence_flows: Vec<SequenceFlow>,

    /// Live tokens
    #[serde(default)]
    pub tokens: Vec<Token>,

    /// Identifier the next issued token receives
    pub next_token_id: u64,

    /// Process data
    #[serde(default)]
    pub process_data: Value,

    /// Start timestamp
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    /// End timestamp
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,

    /// Work items in creation order
    #[serde(default)]
    pub activity_log: Vec<ActivityLogEntry>,
}
