//! Sequence flows and their indexed collection

use crate::types::{FlowObjectId, SequenceFlowId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Directed, optionally conditioned edge between two flow objects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceFlow {
    /// Flow identifier
    pub id: SequenceFlowId,

    /// Flow object the edge leaves
    pub source: FlowObjectId,

    /// Flow object the edge enters
    pub destination: FlowObjectId,

    /// Display name
    #[serde(default)]
    pub name: Option<String>,

    /// Condition expression; an unconditioned flow is always taken
    #[serde(default)]
    pub condition: Option<String>,
}

impl SequenceFlow {
    /// Create an unconditioned flow
    pub fn new(
        id: impl Into<SequenceFlowId>,
        source: impl Into<FlowObjectId>,
        destination: impl Into<FlowObjectId>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            destination: destination.into(),
            name: None,
            condition: None,
        }
    }

    /// Attach a condition expression
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Attach a display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Sequence flows indexed by id, source and destination
#[derive(Debug, Clone, Default)]
pub struct ConnectingObjectCollection {
    flows: Vec<SequenceFlow>,
    by_id: HashMap<SequenceFlowId, usize>,
    by_source: HashMap<FlowObjectId, Vec<usize>>,
    by_destination: HashMap<FlowObjectId, Vec<usize>>,
}

impl ConnectingObjectCollection {
    /// Index a list of flows; declaration order is kept for every lookup
    pub fn new(flows: Vec<SequenceFlow>) -> Self {
        let mut by_id = HashMap::with_capacity(flows.len());
        let mut by_source: HashMap<FlowObjectId, Vec<usize>> = HashMap::new();
        let mut by_destination: HashMap<FlowObjectId, Vec<usize>> = HashMap::new();

        for (index, flow) in flows.iter().enumerate() {
            by_id.insert(flow.id.clone(), index);
            by_source.entry(flow.source.clone()).or_default().push(index);
            by_destination
                .entry(flow.destination.clone())
                .or_default()
                .push(index);
        }

        Self {
            flows,
            by_id,
            by_source,
            by_destination,
        }
    }

    /// Look up a flow by id
    pub fn get(&self, id: &SequenceFlowId) -> Option<&SequenceFlow> {
        self.by_id.get(id).map(|&index| &self.flows[index])
    }

    /// Flows leaving `source`, in declaration order
    pub fn outgoing(&self, source: &FlowObjectId) -> Vec<&SequenceFlow> {
        self.lookup(&self.by_source, source)
    }

    /// Flows entering `destination`, in declaration order
    pub fn incoming(&self, destination: &FlowObjectId) -> Vec<&SequenceFlow> {
        self.lookup(&self.by_destination, destination)
    }

    fn lookup<'a>(
        &'a self,
        index: &HashMap<FlowObjectId, Vec<usize>>,
        key: &FlowObjectId,
    ) -> Vec<&'a SequenceFlow> {
        index
            .get(key)
            .map(|positions| positions.iter().map(|&i| &self.flows[i]).collect())
            .unwrap_or_default()
    }

    /// Iterate over all flows in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &SequenceFlow> {
        self.flows.iter()
    }

    /// Number of flows
    #[inline]
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Whether the collection is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Clone the flows out as a plain list
    pub fn to_vec(&self) -> Vec<SequenceFlow> {
        self.flows.clone()
    }
}
