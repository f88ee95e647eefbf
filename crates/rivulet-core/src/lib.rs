//!
//! Rivulet Core - BPMN token-flow execution engine
//!
//! This crate defines the process model (definitions, flow objects, sequence
//! flows, roles), the engine that moves tokens through a live process
//! instance, and the repository interfaces persistence crates implement.
//!
//! A process instance is driven synchronously: every operation runs token
//! propagation to a fixed point before it returns. Waiting for a human task
//! is simply the caller not having called the next operation yet.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - process model, engine and rules
pub mod domain;

/// Application services - façade and runtime interface
pub mod application;

/// Identifier types
pub mod types;

/// Error types
pub mod error;

/// Engine configuration
pub mod config;

// Re-export key types
pub use config::EngineConfig;
pub use error::CoreError;
pub use types::{
    FlowObjectId, ParticipantId, ProcessId, ProcessInstanceId, RoleId, SequenceFlowId, TokenId,
};

// Application interfaces
pub use application::process::{EventContext, Process, WorkItemContext};
pub use application::runtime_interface::{
    DomainEventHandler, ProcessInstanceSummary, RuntimeInterface,
};

// Re-export main API types for easy use
pub use domain::condition::{ExpressionEvaluator, JmesPathEvaluator};
pub use domain::events::DomainEvent;
pub use domain::flow_object::{
    FlowObject, FlowObjectConfig, FlowObjectState, MultiInstanceLoop, NodeKind,
};
pub use domain::operation::{Collaborators, DataProvider, OperationRunner};
pub use domain::process_definition::{ProcessDefinition, ProcessDefinitionBuilder};
pub use domain::process_instance::{
    ActivityLogEntry, ActivityLogView, ProcessInstance, ProcessInstanceState,
};
pub use domain::repository::{ProcessDefinitionRepository, ProcessInstanceRepository};
pub use domain::role::{Participant, ParticipantRef, Role, SimpleParticipant};
pub use domain::sequence_flow::SequenceFlow;
pub use domain::snapshot::ProcessInstanceSnapshot;
pub use domain::token::Token;
pub use domain::work_item::{EndResult, WorkItem, WorkItemState, WorkItemsCollection};
