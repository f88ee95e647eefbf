/// Tokens and the per-instance token registry
pub mod token;

/// Roles and participants
pub mod role;

/// Work items and their lifecycle
pub mod work_item;

/// Sequence flows
pub mod sequence_flow;

/// Flow objects and node kinds
pub mod flow_object;

/// Condition evaluation
pub mod condition;

/// Routing and join rules
pub mod gateway;

/// Pluggable collaborators (operation runner, data provider)
pub mod operation;

/// Domain events
pub mod events;

/// Repository interfaces
pub mod repository;

/// Process definitions
pub mod process_definition;

/// Process instances and the token-flow engine
pub mod process_instance;

/// Persisted form of process instances
pub mod snapshot;
