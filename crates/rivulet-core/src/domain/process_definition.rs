//! Process definitions: validated, versioned blueprints of a process graph

use crate::config::EngineConfig;
use crate::domain::flow_object::{FlowObjectConfig, NodeKind};
use crate::domain::operation::Collaborators;
use crate::domain::process_instance::ProcessInstance;
use crate::domain::role::Role;
use crate::domain::sequence_flow::SequenceFlow;
use crate::types::{FlowObjectId, ProcessId};
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Immutable template from which process instances are created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDefinition {
    id: ProcessId,
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    roles: Vec<Role>,
    flow_objects: Vec<FlowObjectConfig>,
    sequence_flows: Vec<SequenceFlow>,
}

fn default_version() -> u32 {
    1
}

impl ProcessDefinition {
    /// Process identifier
    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    /// Definition version
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Display name
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Declared roles
    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    /// Flow object templates in declaration order
    pub fn flow_objects(&self) -> &[FlowObjectConfig] {
        &self.flow_objects
    }

    /// Sequence flows in declaration order
    pub fn sequence_flows(&self) -> &[SequenceFlow] {
        &self.sequence_flows
    }

    /// First declared start event
    pub fn default_start_event(&self) -> Option<&FlowObjectId> {
        self.flow_objects
            .iter()
            .find(|config| config.kind == NodeKind::StartEvent)
            .map(|config| &config.id)
    }

    /// Fresh instance with the default collaborators and configuration
    pub fn create_process_instance(&self) -> ProcessInstance {
        self.create_process_instance_with(Collaborators::default(), EngineConfig::default())
    }

    /// Fresh instance with the given collaborators and configuration
    ///
    /// Every call deep-copies the templates, so instances never share state.
    pub fn create_process_instance_with(
        &self,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> ProcessInstance {
        ProcessInstance::new(self, collaborators, config)
    }

    /// Check the structural integrity of the definition
    pub fn validate(&self) -> Result<(), CoreError> {
        let fail = |message: String| -> Result<(), CoreError> {
            Err(CoreError::Logic(format!("Process {}: {}", self.id, message)))
        };

        let mut role_ids = HashSet::new();
        for role in &self.roles {
            if !role_ids.insert(&role.id) {
                return fail(format!("duplicate role {}", role.id));
            }
        }

        let mut node_ids = HashSet::new();
        for node in &self.flow_objects {
            if !node_ids.insert(&node.id) {
                return fail(format!("duplicate flow object {}", node.id));
            }
        }

        let mut flow_ids = HashSet::new();
        for flow in &self.sequence_flows {
            if !flow_ids.insert(&flow.id) {
                return fail(format!("duplicate sequence flow {}", flow.id));
            }
            for end in [&flow.source, &flow.destination] {
                if !node_ids.contains(end) {
                    return fail(format!(
                        "sequence flow {} references unknown flow object {}",
                        flow.id, end
                    ));
                }
            }
        }

        if !self
            .flow_objects
            .iter()
            .any(|node| node.kind == NodeKind::StartEvent)
        {
            return fail("no start event".to_string());
        }

        for node in &self.flow_objects {
            let outgoing = self
                .sequence_flows
                .iter()
                .filter(|flow| flow.source == node.id)
                .count();
            let incoming = self
                .sequence_flows
                .iter()
                .filter(|flow| flow.destination == node.id)
                .count();

            match &node.role {
                Some(role) if !role_ids.contains(role) => {
                    return fail(format!("{} requires unknown role {}", node.id, role));
                }
                None if node.kind.is_activity() => {
                    return fail(format!("activity {} has no role", node.id));
                }
                _ => {}
            }

            if let Some(default) = &node.default_flow {
                match self.sequence_flows.iter().find(|flow| &flow.id == default) {
                    None => {
                        return fail(format!("{} has unknown default flow {}", node.id, default));
                    }
                    Some(flow) if flow.source != node.id => {
                        return fail(format!(
                            "default flow {} does not leave {}",
                            default, node.id
                        ));
                    }
                    Some(flow) if flow.condition.is_some() => {
                        return fail(format!("default flow {} carries a condition", default));
                    }
                    Some(_) => {}
                }
            }

            if node.multi_instance.is_some() && !node.kind.is_activity() {
                return fail(format!("{} is not an activity but loops", node.id));
            }

            match &node.kind {
                NodeKind::StartEvent if incoming > 0 => {
                    return fail(format!("start event {} has incoming flows", node.id));
                }
                NodeKind::EndEvent if outgoing > 0 => {
                    return fail(format!("end event {} has outgoing flows", node.id));
                }
                NodeKind::BoundaryEvent { attached_to, .. } => {
                    let attached_is_activity = self
                        .flow_objects
                        .iter()
                        .any(|other| &other.id == attached_to && other.kind.is_activity());
                    if !attached_is_activity {
                        return fail(format!(
                            "boundary event {} is attached to {} which is not an activity",
                            node.id, attached_to
                        ));
                    }
                    if incoming > 0 {
                        return fail(format!("boundary event {} has incoming flows", node.id));
                    }
                }
                NodeKind::SubProcess { definition } => definition.validate()?,
                _ => {}
            }

            if node.kind != NodeKind::EndEvent && outgoing == 0 {
                return fail(format!("{} has no outgoing flow", node.id));
            }
        }

        Ok(())
    }
}

/// Assembles and validates a [`ProcessDefinition`]
#[derive(Debug, Clone)]
pub struct ProcessDefinitionBuilder {
    definition: ProcessDefinition,
}

impl ProcessDefinitionBuilder {
    /// Start a definition with version 1
    pub fn new(id: impl Into<ProcessId>) -> Self {
        Self {
            definition: ProcessDefinition {
                id: id.into(),
                version: default_version(),
                name: None,
                roles: Vec::new(),
                flow_objects: Vec::new(),
                sequence_flows: Vec::new(),
            },
        }
    }

    /// Set the version
    pub fn version(mut self, version: u32) -> Self {
        self.definition.version = version;
        self
    }

    /// Set the display name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.definition.name = Some(name.into());
        self
    }

    /// Declare a role
    pub fn role(mut self, role: Role) -> Self {
        self.definition.roles.push(role);
        self
    }

    /// Add a flow object
    pub fn flow_object(mut self, config: FlowObjectConfig) -> Self {
        self.definition.flow_objects.push(config);
        self
    }

    /// Add a sequence flow
    pub fn sequence_flow(mut self, flow: SequenceFlow) -> Self {
        self.definition.sequence_flows.push(flow);
        self
    }

    /// Shorthand for an unconditioned sequence flow
    pub fn flow(self, id: &str, source: &str, destination: &str) -> Self {
        self.sequence_flow(SequenceFlow::new(id, source, destination))
    }

    /// Shorthand for a conditioned sequence flow
    pub fn conditional_flow(self, id: &str, source: &str, destination: &str, condition: &str) -> Self {
        self.sequence_flow(SequenceFlow::new(id, source, destination).with_condition(condition))
    }

    /// Validate and return the definition
    pub fn build(self) -> Result<ProcessDefinition, CoreError> {
        self.definition.validate()?;
        Ok(self.definition)
    }
}
