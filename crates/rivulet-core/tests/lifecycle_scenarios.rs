mod common;

use common::{current, id, init_tracing, participant, work};
use pretty_assertions::assert_eq;
use rivulet_core::domain::repository::memory::MemoryProcessDefinitionRepository;
use rivulet_core::{
    Collaborators, CoreError, EngineConfig, FlowObject, FlowObjectConfig, FlowObjectState,
    OperationRunner, Participant, ProcessDefinition, ProcessDefinitionBuilder,
    ProcessDefinitionRepository, ProcessInstance, Role, WorkItem, WorkItemState,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn inner_review() -> ProcessDefinition {
    ProcessDefinitionBuilder::new("inner_review")
        .role(Role::new("clerk", None))
        .flow_object(FlowObjectConfig::start_event("start"))
        .flow_object(FlowObjectConfig::task("inspect", "clerk"))
        .flow_object(FlowObjectConfig::end_event("end"))
        .flow("f1", "start", "inspect")
        .flow("f2", "inspect", "end")
        .build()
        .unwrap()
}

fn with_sub_process() -> ProcessDefinition {
    ProcessDefinitionBuilder::new("outer")
        .role(Role::new("clerk", None))
        .flow_object(FlowObjectConfig::start_event("start"))
        .flow_object(FlowObjectConfig::sub_process("review", "clerk", inner_review()))
        .flow_object(FlowObjectConfig::end_event("end"))
        .flow("f1", "start", "review")
        .flow("f2", "review", "end")
        .build()
        .unwrap()
}

fn start_review(instance: &mut ProcessInstance, who: &Arc<dyn Participant>) {
    instance.start(&id("start")).unwrap();
    instance.allocate_work_item(&id("review"), who.as_ref()).unwrap();
    instance
        .start_work_item(&id("review"), Some(who.as_ref()))
        .unwrap();
}

#[test]
fn sub_process_runs_as_child_instance() {
    init_tracing();
    let clerk = participant("alice", &["clerk"]);
    let mut instance = with_sub_process().create_process_instance();
    start_review(&mut instance, &clerk);

    let child = instance.sub_process(&id("review")).unwrap();
    assert_ne!(child.id(), instance.id());
    assert_eq!(current(child), vec!["inspect"]);

    let err = instance.complete_work_item(&id("review"), None).unwrap_err();
    assert_eq!(err, CoreError::unexpected_state("review", "complete"));

    work(instance.sub_process_mut(&id("review")).unwrap(), "inspect", &clerk);
    assert!(instance.sub_process(&id("review")).unwrap().is_ended());

    instance.complete_work_item(&id("review"), None).unwrap();
    assert!(instance.is_ended());
}

#[test]
fn cancelling_parent_cascades_into_child() {
    let clerk = participant("alice", &["clerk"]);
    let mut instance = with_sub_process().create_process_instance();
    start_review(&mut instance, &clerk);

    instance.cancel().unwrap();

    assert!(instance.is_failed());
    let child = instance.sub_process(&id("review")).unwrap();
    assert!(child.is_failed());
    assert_eq!(
        child.get_work_items(&id("inspect")).unwrap().get(0).unwrap().state(),
        WorkItemState::Cancelled
    );
}

fn calling(called: &str) -> ProcessDefinition {
    ProcessDefinitionBuilder::new("order")
        .role(Role::new("clerk", None))
        .flow_object(FlowObjectConfig::start_event("start"))
        .flow_object(FlowObjectConfig::call_activity("bill", "clerk", called))
        .flow_object(FlowObjectConfig::end_event("end"))
        .flow("f1", "start", "bill")
        .flow("f2", "bill", "end")
        .build()
        .unwrap()
}

fn billing(version: u32, with_task: bool) -> ProcessDefinition {
    let builder = ProcessDefinitionBuilder::new("billing")
        .version(version)
        .role(Role::new("clerk", None))
        .flow_object(FlowObjectConfig::start_event("start"))
        .flow_object(FlowObjectConfig::end_event("end"));
    if with_task {
        builder
            .flow_object(FlowObjectConfig::task("invoice", "clerk"))
            .flow("f1", "start", "invoice")
            .flow("f2", "invoice", "end")
            .build()
            .unwrap()
    } else {
        builder.flow("f1", "start", "end").build().unwrap()
    }
}

#[test]
fn call_activity_resolves_latest_definition() {
    let repository = Arc::new(MemoryProcessDefinitionRepository::new());
    repository.add(billing(1, true)).unwrap();
    repository.add(billing(2, false)).unwrap();

    let collaborators = Collaborators::default().with_definition_repository(repository);
    let clerk = participant("alice", &["clerk"]);
    let mut instance =
        calling("billing").create_process_instance_with(collaborators, EngineConfig::default());
    instance.start(&id("start")).unwrap();
    instance.allocate_work_item(&id("bill"), clerk.as_ref()).unwrap();
    instance.start_work_item(&id("bill"), None).unwrap();

    // Version 2 ends immediately, which completes the call
    assert!(instance.is_ended());
    let child = instance.sub_process(&id("bill")).unwrap();
    assert_eq!(child.version(), 2);
    let item = instance.get_work_items(&id("bill")).unwrap().get(0).unwrap();
    assert_eq!(item.state(), WorkItemState::Ended);
}

#[test]
fn call_activity_with_unknown_process_fails_cleanly() {
    let repository = Arc::new(MemoryProcessDefinitionRepository::new());
    let collaborators = Collaborators::default().with_definition_repository(repository);
    let clerk = participant("alice", &["clerk"]);
    let mut instance =
        calling("ghost").create_process_instance_with(collaborators, EngineConfig::default());
    instance.start(&id("start")).unwrap();
    instance.allocate_work_item(&id("bill"), clerk.as_ref()).unwrap();

    let err = instance.start_work_item(&id("bill"), None).unwrap_err();
    assert_eq!(err, CoreError::ProcessDefinitionNotFound("ghost".to_string()));
    let item = instance.get_work_items(&id("bill")).unwrap().get(0).unwrap();
    assert_eq!(item.state(), WorkItemState::Allocated);
    assert!(item.sub_process().is_none());
}

fn guarded(interrupting: bool) -> ProcessDefinition {
    ProcessDefinitionBuilder::new("guarded")
        .role(Role::new("clerk", None))
        .flow_object(FlowObjectConfig::start_event("start"))
        .flow_object(FlowObjectConfig::task("work", "clerk"))
        .flow_object(FlowObjectConfig::boundary_event("deadline", "work", interrupting))
        .flow_object(FlowObjectConfig::task("escalate", "clerk"))
        .flow_object(FlowObjectConfig::end_event("done"))
        .flow_object(FlowObjectConfig::end_event("escalated"))
        .flow("f1", "start", "work")
        .flow("f2", "work", "done")
        .flow("f3", "deadline", "escalate")
        .flow("f4", "escalate", "escalated")
        .build()
        .unwrap()
}

#[test]
fn interrupting_boundary_event_cancels_activity() {
    let clerk = participant("alice", &["clerk"]);
    let mut instance = guarded(true).create_process_instance();
    instance.start(&id("start")).unwrap();
    instance.allocate_work_item(&id("work"), clerk.as_ref()).unwrap();

    instance.trigger_boundary_event(&id("deadline")).unwrap();

    assert_eq!(current(&instance), vec!["escalate"]);
    let work_node = instance.flow_object(&id("work")).unwrap();
    assert_eq!(work_node.state(), FlowObjectState::Failed);
    assert_eq!(
        work_node.work_items().get(0).unwrap().state(),
        WorkItemState::Cancelled
    );

    work(&mut instance, "escalate", &clerk);
    assert!(instance.is_ended());
}

#[test]
fn non_interrupting_boundary_event_forks() {
    let clerk = participant("alice", &["clerk"]);
    let mut instance = guarded(false).create_process_instance();
    instance.start(&id("start")).unwrap();

    instance.trigger_boundary_event(&id("deadline")).unwrap();
    assert_eq!(current(&instance), vec!["work", "escalate"]);

    work(&mut instance, "escalate", &clerk);
    assert!(!instance.is_ended());
    work(&mut instance, "work", &clerk);
    assert!(instance.is_ended());
}

#[test]
fn boundary_event_requires_running_activity() {
    let clerk = participant("alice", &["clerk"]);
    let mut instance = guarded(true).create_process_instance();
    instance.start(&id("start")).unwrap();
    work(&mut instance, "work", &clerk);

    let mut other = guarded(true).create_process_instance();
    assert!(other.trigger_boundary_event(&id("deadline")).is_err());
    assert!(instance.trigger_boundary_event(&id("deadline")).is_err());
}

struct CountingRunner {
    runs: AtomicUsize,
}

impl OperationRunner for CountingRunner {
    fn provide_participant(
        &self,
        _node: &FlowObject,
        _instance: &ProcessInstance,
    ) -> Result<Arc<dyn Participant>, CoreError> {
        Ok(participant("mailer", &["system"]))
    }

    fn run(&self, node: &FlowObject, work_item: &WorkItem) -> Result<(), CoreError> {
        assert_eq!(work_item.state(), WorkItemState::Started);
        if node.id().as_str() == "notify" {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[test]
fn operational_tasks_run_without_external_calls() {
    let definition = ProcessDefinitionBuilder::new("notify")
        .role(Role::new("clerk", None))
        .role(Role::new("system", None))
        .flow_object(FlowObjectConfig::start_event("start"))
        .flow_object(FlowObjectConfig::task("approve", "clerk"))
        .flow_object(FlowObjectConfig::send_task("notify", "system", "approved"))
        .flow_object(FlowObjectConfig::service_task("archive", "system", "archive"))
        .flow_object(FlowObjectConfig::end_event("end"))
        .flow("f1", "start", "approve")
        .flow("f2", "approve", "notify")
        .flow("f3", "notify", "archive")
        .flow("f4", "archive", "end")
        .build()
        .unwrap();
    let runner = Arc::new(CountingRunner {
        runs: AtomicUsize::new(0),
    });
    let collaborators = Collaborators::default().with_operation_runner(runner.clone());
    let mut instance =
        definition.create_process_instance_with(collaborators, EngineConfig::default());

    instance.start(&id("start")).unwrap();
    work(&mut instance, "approve", &participant("alice", &["clerk"]));

    assert!(instance.is_ended());
    assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
    let archived = instance.get_work_items(&id("archive")).unwrap().get(0).unwrap();
    assert_eq!(archived.end_participant().unwrap().id.as_str(), "mailer");
}

#[test]
fn intermediate_event_holds_token_until_triggered() {
    let definition = ProcessDefinitionBuilder::new("payment")
        .flow_object(FlowObjectConfig::start_event("start"))
        .flow_object(FlowObjectConfig::intermediate_catch_event("paid"))
        .flow_object(FlowObjectConfig::end_event("end"))
        .flow("f1", "start", "paid")
        .flow("f2", "paid", "end")
        .build()
        .unwrap();
    let mut instance = definition.create_process_instance();
    instance.start(&id("start")).unwrap();

    assert_eq!(current(&instance), vec!["paid"]);
    assert_eq!(
        instance.flow_object(&id("paid")).unwrap().state(),
        FlowObjectState::Active
    );

    instance.suspend().unwrap();
    assert!(instance.trigger_intermediate_event(&id("paid")).is_err());
    instance.resume().unwrap();

    instance.trigger_intermediate_event(&id("paid")).unwrap();
    assert!(instance.is_ended());
}

#[test]
fn snapshot_round_trip_mid_execution() {
    let clerk = participant("alice", &["clerk"]);
    let mut instance = with_sub_process().create_process_instance();
    instance.set_process_variable("case", json!({"number": 42, "tags": ["urgent"]}));
    start_review(&mut instance, &clerk);

    let serialized = instance.serialize().unwrap();
    let mut restored = ProcessInstance::deserialize(&serialized).unwrap();
    assert_eq!(restored.serialize().unwrap(), serialized);
    assert_eq!(restored.process_data(), instance.process_data());
    assert_eq!(current(&restored), vec!["review"]);

    work(restored.sub_process_mut(&id("review")).unwrap(), "inspect", &clerk);
    restored.complete_work_item(&id("review"), None).unwrap();
    assert!(restored.is_ended());
    assert!(!instance.is_ended());
}

fn repeated_billing() -> ProcessDefinition {
    ProcessDefinitionBuilder::new("repeated_billing")
        .role(Role::new("clerk", None))
        .flow_object(FlowObjectConfig::start_event("start"))
        .flow_object(FlowObjectConfig::call_activity("bill", "clerk", "billing"))
        .flow_object(FlowObjectConfig::exclusive_gateway("more").with_default_flow("done"))
        .flow_object(FlowObjectConfig::end_event("end"))
        .flow("f1", "start", "bill")
        .flow("f2", "bill", "more")
        .conditional_flow("again", "more", "bill", "more == `true`")
        .flow("done", "more", "end")
        .build()
        .unwrap()
}

#[test]
fn resolved_call_survives_snapshot_round_trip() {
    init_tracing();
    let repository = Arc::new(MemoryProcessDefinitionRepository::new());
    repository.add(billing(1, true)).unwrap();

    let collaborators = Collaborators::default().with_definition_repository(repository.clone());
    let clerk = participant("alice", &["clerk"]);
    let mut instance = repeated_billing()
        .create_process_instance_with(collaborators.clone(), EngineConfig::default());
    instance.set_process_variable("more", json!(true));
    instance.start(&id("start")).unwrap();

    // First call resolves version 1 and runs its invoice task
    instance.allocate_work_item(&id("bill"), clerk.as_ref()).unwrap();
    instance.start_work_item(&id("bill"), None).unwrap();
    let child = instance.sub_process_mut(&id("bill")).unwrap();
    assert_eq!(child.version(), 1);
    work(child, "invoice", &clerk);
    instance.set_process_variable("more", json!(false));
    instance.complete_work_item(&id("bill"), None).unwrap();
    assert_eq!(current(&instance), vec!["bill"]);

    // A newer version is deployed while the instance is parked
    repository.add(billing(2, false)).unwrap();

    let mut restored = ProcessInstance::deserialize(&instance.serialize().unwrap()).unwrap();
    restored.attach_collaborators(collaborators);
    assert_eq!(restored.serialize().unwrap(), instance.serialize().unwrap());

    restored.allocate_work_item(&id("bill"), clerk.as_ref()).unwrap();
    restored.start_work_item(&id("bill"), None).unwrap();
    let child = restored.sub_process(&id("bill")).unwrap();
    assert_eq!(child.version(), 1);
    assert_eq!(current(child), vec!["invoice"]);
    assert_eq!(restored.get_work_items(&id("bill")).unwrap().len(), 2);
}
