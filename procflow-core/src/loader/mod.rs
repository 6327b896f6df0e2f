//! Load surface: serialized parsed graph in, immutable definition out.
//!
//! The core does not parse BPMN XML. An external ingester hands in the
//! `ProcessDto` shape (JSON or YAML); this module validates it and builds
//! the read-only `ProcessDefinition` shared by all instances.

mod dto;
mod validate;

pub use dto::{EventDto, FlowDto, NodeDto, NodeKindDto, ProcessDto, TaskDto};
pub use validate::validate;

use crate::definition::{
    EventSpec, FlowNode, NodeKind, ProcessDefinition, SequenceFlow, SubProcessSpec, TaskKind,
};
use crate::definition::{GatewayDirection, GatewayKind};
use crate::error::LoadError;
use crate::eval::ExprHandle;
use std::collections::BTreeMap;

/// Load a serialized definition (JSON bytes) into a `ProcessDefinition`.
pub fn load_slice(bytes: &[u8]) -> Result<ProcessDefinition, LoadError> {
    let dto: ProcessDto = serde_json::from_slice(bytes)?;
    build(&dto)
}

/// YAML flavor of `load_slice`.
pub fn load_yaml_str(yaml: &str) -> Result<ProcessDefinition, LoadError> {
    let dto: ProcessDto = serde_yaml::from_str(yaml)?;
    build(&dto)
}

/// Validate and build. Every violation is collected before failing.
pub fn build(dto: &ProcessDto) -> Result<ProcessDefinition, LoadError> {
    let errors = validate(&dto.nodes, &dto.flows, dto.executable);
    if !errors.is_empty() {
        return Err(LoadError::Invalid(errors));
    }
    Ok(build_scope(
        &dto.id,
        dto.executable,
        dto.process_type,
        &dto.nodes,
        &dto.flows,
    ))
}

fn build_scope(
    id: &str,
    executable: bool,
    process_type: crate::definition::ProcessType,
    nodes: &[NodeDto],
    flows: &[FlowDto],
) -> ProcessDefinition {
    let mut flow_map = BTreeMap::new();
    for flow in flows {
        flow_map.insert(
            flow.id.clone(),
            SequenceFlow {
                id: flow.id.clone(),
                source: flow.source.clone(),
                target: flow.target.clone(),
                guard: flow.guard.as_deref().map(ExprHandle::from),
                is_default: flow.is_default,
                is_immediate: flow.is_immediate,
            },
        );
    }

    let mut node_map = BTreeMap::new();
    for node in nodes {
        // Declared lists win; otherwise flow declaration order is the
        // evaluation order downstream.
        let incoming = node.incoming.clone().unwrap_or_else(|| {
            flows
                .iter()
                .filter(|f| f.target == node.id)
                .map(|f| f.id.clone())
                .collect()
        });
        let outgoing = node.outgoing.clone().unwrap_or_else(|| {
            flows
                .iter()
                .filter(|f| f.source == node.id)
                .map(|f| f.id.clone())
                .collect()
        });
        node_map.insert(
            node.id.clone(),
            FlowNode {
                id: node.id.clone(),
                name: node.name.clone().unwrap_or_default(),
                incoming,
                outgoing,
                kind: build_kind(&node.id, &node.kind),
            },
        );
    }

    ProcessDefinition {
        id: id.to_string(),
        executable,
        process_type,
        nodes: node_map,
        flows: flow_map,
    }
}

fn build_kind(node_id: &str, kind: &NodeKindDto) -> NodeKind {
    match kind {
        NodeKindDto::Start {
            event,
            interrupting,
        } => NodeKind::StartEvent {
            event: build_event(event),
            interrupting: *interrupting,
        },
        NodeKindDto::End { event } => NodeKind::EndEvent {
            event: build_event(event),
        },
        NodeKindDto::Catch { event } => NodeKind::IntermediateCatch {
            event: build_event(event),
        },
        NodeKindDto::Throw { event } => NodeKind::IntermediateThrow {
            event: build_event(event),
        },
        NodeKindDto::Boundary {
            attached_to,
            event,
            cancel_activity,
        } => NodeKind::Boundary {
            attached_to: attached_to.clone(),
            event: build_event(event),
            cancel_activity: *cancel_activity,
        },
        NodeKindDto::ExclusiveGateway { default_flow } => NodeKind::Gateway {
            gateway: GatewayKind::Exclusive,
            direction: GatewayDirection::Diverging,
            default_flow: default_flow.clone(),
        },
        NodeKindDto::ParallelGateway { direction } => NodeKind::Gateway {
            gateway: GatewayKind::Parallel,
            direction: *direction,
            default_flow: None,
        },
        NodeKindDto::InclusiveGateway {
            direction,
            default_flow,
        } => NodeKind::Gateway {
            gateway: GatewayKind::Inclusive,
            direction: *direction,
            default_flow: default_flow.clone(),
        },
        NodeKindDto::Task { task } => NodeKind::Task {
            task: build_task(task),
        },
        NodeKindDto::SubProcess {
            start_quantity,
            completion_quantity,
            for_compensation,
            triggered_by_event,
            transactional,
            nodes,
            flows,
        } => NodeKind::SubProcess(Box::new(SubProcessSpec {
            definition: build_scope(
                node_id,
                true,
                crate::definition::ProcessType::None,
                nodes,
                flows,
            ),
            start_quantity: *start_quantity,
            completion_quantity: *completion_quantity,
            for_compensation: *for_compensation,
            triggered_by_event: *triggered_by_event,
            transactional: *transactional,
        })),
    }
}

fn build_event(event: &EventDto) -> EventSpec {
    match event {
        EventDto::None => EventSpec::None,
        EventDto::Message { reference } => EventSpec::Message {
            reference: reference.clone(),
        },
        EventDto::Timer { expression } => EventSpec::Timer {
            expression: ExprHandle::new(expression),
        },
        EventDto::Signal { reference } => EventSpec::Signal {
            reference: reference.clone(),
        },
        EventDto::Error { reference } => EventSpec::Error {
            reference: reference.clone(),
        },
        EventDto::Escalation { reference } => EventSpec::Escalation {
            reference: reference.clone(),
        },
        EventDto::Cancel => EventSpec::Cancel,
        EventDto::Terminate => EventSpec::Terminate,
        EventDto::Conditional { expression } => EventSpec::Conditional {
            expression: ExprHandle::new(expression),
        },
        EventDto::Link { reference } => EventSpec::Link {
            reference: reference.clone(),
        },
    }
}

fn build_task(task: &TaskDto) -> TaskKind {
    match task {
        TaskDto::Abstract => TaskKind::Abstract,
        TaskDto::User => TaskKind::User,
        TaskDto::Service { task_type } => TaskKind::Service {
            task_type: task_type.clone(),
        },
        TaskDto::Script {
            expression,
            result_var,
        } => TaskKind::Script {
            expression: ExprHandle::new(expression),
            result_var: result_var.clone(),
        },
        TaskDto::Send => TaskKind::Send,
        TaskDto::Receive => TaskKind::Receive,
        TaskDto::BusinessRule { decision } => TaskKind::BusinessRule {
            decision: decision.clone(),
        },
        TaskDto::Manual => TaskKind::Manual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DefinitionErrorKind;
    use serde_json::json;

    fn linear_json() -> Vec<u8> {
        json!({
            "id": "order_flow",
            "nodes": [
                {"id": "start", "kind": "Start"},
                {"id": "approve", "kind": "Task", "task": {"type": "User"}},
                {"id": "end", "kind": "End"}
            ],
            "flows": [
                {"id": "f1", "source": "start", "target": "approve"},
                {"id": "f2", "source": "approve", "target": "end"}
            ]
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn loads_a_minimal_linear_definition() {
        let defn = load_slice(&linear_json()).unwrap();
        assert_eq!(defn.id, "order_flow");
        assert!(defn.executable);
        assert_eq!(defn.nodes.len(), 3);
        assert_eq!(defn.flows.len(), 2);
        assert_eq!(defn.outgoing("start").len(), 1);
        assert_eq!(defn.incoming("end")[0].id, "f2");
    }

    #[test]
    fn load_then_reserialize_is_idempotent() {
        let defn = load_slice(&linear_json()).unwrap();
        let round_tripped: ProcessDefinition =
            serde_json::from_str(&serde_json::to_string(&defn).unwrap()).unwrap();
        assert_eq!(defn, round_tripped);
        assert_eq!(defn.version(), round_tripped.version());
    }

    #[test]
    fn version_is_stable_across_node_declaration_order() {
        let reordered = json!({
            "id": "order_flow",
            "nodes": [
                {"id": "end", "kind": "End"},
                {"id": "start", "kind": "Start"},
                {"id": "approve", "kind": "Task", "task": {"type": "User"}}
            ],
            "flows": [
                {"id": "f1", "source": "start", "target": "approve"},
                {"id": "f2", "source": "approve", "target": "end"}
            ]
        })
        .to_string()
        .into_bytes();
        let a = load_slice(&linear_json()).unwrap();
        let b = load_slice(&reordered).unwrap();
        assert_eq!(a.version(), b.version());
    }

    #[test]
    fn dangling_flow_target_is_rejected() {
        let bytes = json!({
            "id": "p",
            "nodes": [
                {"id": "start", "kind": "Start"},
                {"id": "end", "kind": "End"}
            ],
            "flows": [
                {"id": "f1", "source": "start", "target": "ghost"},
                {"id": "f2", "source": "start", "target": "end"}
            ]
        })
        .to_string()
        .into_bytes();
        let err = load_slice(&bytes).unwrap_err();
        let LoadError::Invalid(errors) = err else {
            panic!("expected Invalid, got {err}");
        };
        assert!(errors
            .iter()
            .any(|e| e.kind == DefinitionErrorKind::DanglingReference && e.node == "f1"));
    }

    #[test]
    fn orphan_node_is_rejected() {
        let bytes = json!({
            "id": "p",
            "nodes": [
                {"id": "start", "kind": "Start"},
                {"id": "island", "kind": "Task"},
                {"id": "end", "kind": "End"}
            ],
            "flows": [
                {"id": "f1", "source": "start", "target": "end"}
            ]
        })
        .to_string()
        .into_bytes();
        let LoadError::Invalid(errors) = load_slice(&bytes).unwrap_err() else {
            panic!("expected Invalid");
        };
        assert!(errors
            .iter()
            .any(|e| e.kind == DefinitionErrorKind::OrphanNode && e.node == "island"));
    }

    #[test]
    fn start_with_incoming_flow_is_rejected() {
        let bytes = json!({
            "id": "p",
            "nodes": [
                {"id": "start", "kind": "Start"},
                {"id": "end", "kind": "End"}
            ],
            "flows": [
                {"id": "f1", "source": "start", "target": "end"},
                {"id": "f2", "source": "end", "target": "start"}
            ]
        })
        .to_string()
        .into_bytes();
        let LoadError::Invalid(errors) = load_slice(&bytes).unwrap_err() else {
            panic!("expected Invalid");
        };
        assert!(errors
            .iter()
            .any(|e| e.kind == DefinitionErrorKind::MalformedCardinality && e.node == "start"));
        // the same model also violates the end-event rule; both must be reported
        assert!(errors
            .iter()
            .any(|e| e.kind == DefinitionErrorKind::MalformedCardinality && e.node == "end"));
    }

    #[test]
    fn symmetric_cross_check_catches_stale_lists() {
        let bytes = json!({
            "id": "p",
            "nodes": [
                {"id": "start", "kind": "Start", "outgoing": ["f1", "f_gone"]},
                {"id": "end", "kind": "End"}
            ],
            "flows": [
                {"id": "f1", "source": "start", "target": "end"}
            ]
        })
        .to_string()
        .into_bytes();
        let LoadError::Invalid(errors) = load_slice(&bytes).unwrap_err() else {
            panic!("expected Invalid");
        };
        assert!(errors
            .iter()
            .any(|e| e.kind == DefinitionErrorKind::DanglingReference && e.node == "start"));
    }

    #[test]
    fn guarded_default_flow_is_rejected() {
        let bytes = json!({
            "id": "p",
            "nodes": [
                {"id": "start", "kind": "Start"},
                {"id": "gw", "kind": "ExclusiveGateway", "default_flow": "f_default"},
                {"id": "a", "kind": "End"},
                {"id": "b", "kind": "End"}
            ],
            "flows": [
                {"id": "f1", "source": "start", "target": "gw"},
                {"id": "f_a", "source": "gw", "target": "a", "guard": "approved"},
                {"id": "f_default", "source": "gw", "target": "b", "guard": "oops"}
            ]
        })
        .to_string()
        .into_bytes();
        let LoadError::Invalid(errors) = load_slice(&bytes).unwrap_err() else {
            panic!("expected Invalid");
        };
        assert!(errors
            .iter()
            .any(|e| e.kind == DefinitionErrorKind::NoDefaultFlow && e.node == "gw"));
    }

    #[test]
    fn unpaired_link_throw_is_rejected() {
        let bytes = json!({
            "id": "p",
            "nodes": [
                {"id": "start", "kind": "Start"},
                {"id": "jump", "kind": "Throw", "event": {"type": "Link", "reference": "hop"}},
                {"id": "end", "kind": "End"}
            ],
            "flows": [
                {"id": "f1", "source": "start", "target": "jump"},
                {"id": "f2", "source": "jump", "target": "end"}
            ]
        })
        .to_string()
        .into_bytes();
        let LoadError::Invalid(errors) = load_slice(&bytes).unwrap_err() else {
            panic!("expected Invalid");
        };
        assert!(errors
            .iter()
            .any(|e| e.kind == DefinitionErrorKind::DanglingReference && e.node == "jump"));
    }

    #[test]
    fn yaml_flavor_loads_the_same_graph() {
        let yaml = r#"
id: order_flow
nodes:
  - id: start
    kind: Start
  - id: approve
    kind: Task
    task:
      type: User
  - id: end
    kind: End
flows:
  - id: f1
    source: start
    target: approve
  - id: f2
    source: approve
    target: end
"#;
        let from_yaml = load_yaml_str(yaml).unwrap();
        let from_json = load_slice(&linear_json()).unwrap();
        assert_eq!(from_yaml.version(), from_json.version());
    }

    #[test]
    fn nested_subprocess_builds_resolvable_scopes() {
        let bytes = json!({
            "id": "p",
            "nodes": [
                {"id": "start", "kind": "Start"},
                {"id": "sub", "kind": "SubProcess",
                 "nodes": [
                    {"id": "s_start", "kind": "Start"},
                    {"id": "s_end", "kind": "End"}
                 ],
                 "flows": [
                    {"id": "sf1", "source": "s_start", "target": "s_end"}
                 ]},
                {"id": "end", "kind": "End"}
            ],
            "flows": [
                {"id": "f1", "source": "start", "target": "sub"},
                {"id": "f2", "source": "sub", "target": "end"}
            ]
        })
        .to_string()
        .into_bytes();
        let defn = load_slice(&bytes).unwrap();
        let inner = defn.resolve_scope(&["sub".to_string()]).unwrap();
        assert!(inner.node("s_start").is_some());
        assert!(defn.resolve_scope(&["start".to_string()]).is_none());
    }
}
