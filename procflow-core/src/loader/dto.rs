use crate::definition::{GatewayDirection, ProcessType};
use serde::{Deserialize, Serialize};

// ── Helper defaults for serde ──

fn default_true() -> bool {
    true
}

fn is_false(v: &bool) -> bool {
    !v
}

fn default_one() -> u32 {
    1
}

fn is_one(v: &u32) -> bool {
    *v == 1
}

// ── Top-level DTO ──

/// Serialized parsed-graph shape consumed by `load_slice`. The core does
/// not parse BPMN XML; an external ingester produces this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDto {
    pub id: String,
    #[serde(default = "default_true")]
    pub executable: bool,
    #[serde(default)]
    pub process_type: ProcessType,
    pub nodes: Vec<NodeDto>,
    pub flows: Vec<FlowDto>,
}

impl ProcessDto {
    /// Deterministic JSON: clone, sort nodes and flows by id, serialize to
    /// pretty JSON. Declaration-order lists are untouched.
    pub fn deterministic_json(&self) -> String {
        let mut dto = self.clone();
        sort_scope(&mut dto.nodes, &mut dto.flows);
        serde_json::to_string_pretty(&dto).unwrap_or_default()
    }
}

fn sort_scope(nodes: &mut [NodeDto], flows: &mut Vec<FlowDto>) {
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    flows.sort_by(|a, b| a.id.cmp(&b.id));
    for node in nodes.iter_mut() {
        if let NodeKindDto::SubProcess { nodes, flows, .. } = &mut node.kind {
            sort_scope(nodes, flows);
        }
    }
}

// ── Flows ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDto {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_default: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_immediate: bool,
}

// ── Nodes ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDto {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Declared flow lists. When present they are cross-checked against
    /// the edge list; when absent they are derived from it in flow
    /// declaration order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incoming: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outgoing: Option<Vec<String>>,
    #[serde(flatten)]
    pub kind: NodeKindDto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum NodeKindDto {
    Start {
        #[serde(default)]
        event: EventDto,
        #[serde(default = "default_true")]
        interrupting: bool,
    },
    End {
        #[serde(default)]
        event: EventDto,
    },
    Catch {
        event: EventDto,
    },
    Throw {
        event: EventDto,
    },
    Boundary {
        attached_to: String,
        event: EventDto,
        #[serde(default = "default_true")]
        cancel_activity: bool,
    },
    ExclusiveGateway {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_flow: Option<String>,
    },
    ParallelGateway {
        direction: GatewayDirection,
    },
    InclusiveGateway {
        direction: GatewayDirection,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_flow: Option<String>,
    },
    Task {
        #[serde(default)]
        task: TaskDto,
    },
    SubProcess {
        #[serde(default = "default_one", skip_serializing_if = "is_one")]
        start_quantity: u32,
        #[serde(default = "default_one", skip_serializing_if = "is_one")]
        completion_quantity: u32,
        #[serde(default, skip_serializing_if = "is_false")]
        for_compensation: bool,
        #[serde(default, skip_serializing_if = "is_false")]
        triggered_by_event: bool,
        #[serde(default, skip_serializing_if = "is_false")]
        transactional: bool,
        nodes: Vec<NodeDto>,
        flows: Vec<FlowDto>,
    },
}

// ── Events ──

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventDto {
    #[default]
    None,
    Message {
        reference: String,
    },
    Timer {
        expression: String,
    },
    Signal {
        reference: String,
    },
    Error {
        #[serde(default)]
        reference: Option<String>,
    },
    Escalation {
        #[serde(default)]
        reference: Option<String>,
    },
    Cancel,
    Terminate,
    Conditional {
        expression: String,
    },
    Link {
        reference: String,
    },
}

// ── Tasks ──

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskDto {
    #[default]
    Abstract,
    User,
    Service {
        task_type: String,
    },
    Script {
        expression: String,
        #[serde(default)]
        result_var: Option<String>,
    },
    Send,
    Receive,
    BusinessRule {
        #[serde(default)]
        decision: Option<String>,
    },
    Manual,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_json_ignores_declaration_order() {
        let make = |reversed: bool| {
            let mut nodes = vec![
                NodeDto {
                    id: "start".into(),
                    name: None,
                    incoming: None,
                    outgoing: None,
                    kind: NodeKindDto::Start {
                        event: EventDto::None,
                        interrupting: true,
                    },
                },
                NodeDto {
                    id: "end".into(),
                    name: None,
                    incoming: None,
                    outgoing: None,
                    kind: NodeKindDto::End {
                        event: EventDto::None,
                    },
                },
            ];
            if reversed {
                nodes.reverse();
            }
            ProcessDto {
                id: "p".into(),
                executable: true,
                process_type: Default::default(),
                nodes,
                flows: vec![FlowDto {
                    id: "f1".into(),
                    source: "start".into(),
                    target: "end".into(),
                    guard: None,
                    is_default: false,
                    is_immediate: false,
                }],
            }
        };
        assert_eq!(make(false).deterministic_json(), make(true).deterministic_json());
    }

    #[test]
    fn boundary_defaults_to_interrupting() {
        let json = r#"{"id": "b1", "kind": "Boundary", "attached_to": "t1", "event": {"type": "Error"}}"#;
        let node: NodeDto = serde_json::from_str(json).unwrap();
        assert!(
            matches!(node.kind, NodeKindDto::Boundary { cancel_activity: true, .. }),
            "cancelActivity must default to true"
        );
    }
}
