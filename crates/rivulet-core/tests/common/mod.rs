#![allow(dead_code)]

use rivulet_core::{FlowObjectId, Participant, ProcessInstance, SimpleParticipant};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn id(value: &str) -> FlowObjectId {
    FlowObjectId::new(value)
}

pub fn participant(name: &str, roles: &[&str]) -> Arc<dyn Participant> {
    Arc::new(SimpleParticipant::new(name, roles.iter().copied()))
}

/// Allocate, start and complete the pending work item of `activity` as `who`
pub fn work(instance: &mut ProcessInstance, activity: &str, who: &Arc<dyn Participant>) {
    instance
        .allocate_work_item(&id(activity), who.as_ref())
        .unwrap_or_else(|e| panic!("allocate {}: {}", activity, e));
    instance
        .start_work_item(&id(activity), Some(who.as_ref()))
        .unwrap_or_else(|e| panic!("start {}: {}", activity, e));
    instance
        .complete_work_item(&id(activity), None)
        .unwrap_or_else(|e| panic!("complete {}: {}", activity, e));
}

pub fn current(instance: &ProcessInstance) -> Vec<String> {
    instance
        .get_current_flow_objects()
        .iter()
        .map(|node| node.id().to_string())
        .collect()
}
