use crate::eval::ExprHandle;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// ─── Process definition ───────────────────────────────────────

/// How a process participates in collaborations. Carried through from the
/// source model; the engine does not interpret it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessType {
    #[default]
    None,
    Public,
    Private,
}

/// Immutable definition graph for one process.
///
/// Built once by the loader, then shared read-only by every instance of the
/// definition. Node and flow maps are BTreeMaps so iteration order, and the
/// canonical serialized form, are deterministic. Flow *declaration* order
/// lives in each node's `incoming`/`outgoing` lists; exclusive-gateway
/// guard evaluation depends on it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,
    pub executable: bool,
    pub process_type: ProcessType,
    pub nodes: BTreeMap<String, FlowNode>,
    pub flows: BTreeMap<String, SequenceFlow>,
}

impl ProcessDefinition {
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.get(id)
    }

    pub fn flow(&self, id: &str) -> Option<&SequenceFlow> {
        self.flows.get(id)
    }

    /// Outgoing sequence flows of a node, in declaration order.
    pub fn outgoing(&self, node_id: &str) -> Vec<&SequenceFlow> {
        self.node(node_id)
            .map(|n| {
                n.outgoing
                    .iter()
                    .filter_map(|f| self.flows.get(f))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Incoming sequence flows of a node, in declaration order.
    pub fn incoming(&self, node_id: &str) -> Vec<&SequenceFlow> {
        self.node(node_id)
            .map(|n| {
                n.incoming
                    .iter()
                    .filter_map(|f| self.flows.get(f))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Boundary events attached to the given activity.
    pub fn boundaries_attached_to(&self, activity: &str) -> Vec<&FlowNode> {
        self.nodes
            .values()
            .filter(|n| {
                matches!(&n.kind, NodeKind::Boundary { attached_to, .. } if attached_to == activity)
            })
            .collect()
    }

    pub fn start_events(&self) -> Vec<&FlowNode> {
        self.nodes
            .values()
            .filter(|n| matches!(n.kind, NodeKind::StartEvent { .. }))
            .collect()
    }

    /// Start events with no event definition: the ones seeded with a token
    /// when an instance starts.
    pub fn plain_start_events(&self) -> Vec<&FlowNode> {
        self.start_events()
            .into_iter()
            .filter(|n| {
                matches!(
                    n.kind,
                    NodeKind::StartEvent {
                        event: EventSpec::None,
                        ..
                    }
                )
            })
            .collect()
    }

    /// Event-triggered sub-processes of this scope. Never started by token
    /// flow; armed through their start events while the scope is active.
    pub fn event_subprocesses(&self) -> Vec<&FlowNode> {
        self.nodes
            .values()
            .filter(|n| matches!(&n.kind, NodeKind::SubProcess(sp) if sp.triggered_by_event))
            .collect()
    }

    /// Resolve a nested scope by the chain of sub-process node ids leading
    /// from the root definition to it. An empty path is the root itself.
    pub fn resolve_scope(&self, path: &[String]) -> Option<&ProcessDefinition> {
        let mut defn = self;
        for segment in path {
            defn = match &defn.node(segment)?.kind {
                NodeKind::SubProcess(sp) => &sp.definition,
                _ => return None,
            };
        }
        Some(defn)
    }

    /// Content-addressed version key: SHA-256 of the canonical JSON form.
    /// Stable for a given graph regardless of the order the loader saw
    /// nodes in, since the maps serialize key-ordered.
    pub fn version(&self) -> [u8; 32] {
        compute_hash(&serde_json::to_string(self).unwrap_or_default())
    }
}

pub fn compute_hash(data: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hasher.finalize().into()
}

// ─── Flow nodes ───────────────────────────────────────────────

/// One node of the definition graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    pub name: String,
    /// Incoming sequence-flow ids in declaration order.
    pub incoming: Vec<String>,
    /// Outgoing sequence-flow ids in declaration order.
    pub outgoing: Vec<String>,
    pub kind: NodeKind,
}

/// Variant payload of a flow node. A single tagged enum instead of the
/// source model's BaseElement/FlowElement/Event inheritance chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    StartEvent {
        event: EventSpec,
        /// For event-sub-process starts: whether triggering tears down the
        /// sibling tokens of the enclosing scope.
        interrupting: bool,
    },
    EndEvent {
        event: EventSpec,
    },
    IntermediateCatch {
        event: EventSpec,
    },
    IntermediateThrow {
        event: EventSpec,
    },
    Boundary {
        attached_to: String,
        event: EventSpec,
        /// Interrupting when true: firing cancels the attached activity.
        cancel_activity: bool,
    },
    Gateway {
        gateway: GatewayKind,
        direction: GatewayDirection,
        /// Outgoing flow taken when no guard matches.
        default_flow: Option<String>,
    },
    Task {
        task: TaskKind,
    },
    SubProcess(Box<SubProcessSpec>),
}

impl NodeKind {
    /// Activities are the nodes boundary events may attach to.
    pub fn is_activity(&self) -> bool {
        matches!(self, NodeKind::Task { .. } | NodeKind::SubProcess(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayKind {
    Exclusive,
    Parallel,
    Inclusive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayDirection {
    Diverging,
    Converging,
}

/// Task flavor. The split that matters to the engine is
/// `requires_external_completion`: those park their token until a
/// `complete_activity` call; the rest complete inline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TaskKind {
    Abstract,
    User,
    Service { task_type: String },
    Script { expression: ExprHandle, result_var: Option<String> },
    Send,
    Receive,
    BusinessRule { decision: Option<String> },
    Manual,
}

impl TaskKind {
    pub fn requires_external_completion(&self) -> bool {
        matches!(
            self,
            TaskKind::User
                | TaskKind::Service { .. }
                | TaskKind::Send
                | TaskKind::Receive
                | TaskKind::BusinessRule { .. }
        )
    }
}

/// Nested sub-process payload: a full definition-shaped subgraph plus the
/// activation flags of the hosting node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubProcessSpec {
    pub definition: ProcessDefinition,
    pub start_quantity: u32,
    pub completion_quantity: u32,
    pub for_compensation: bool,
    pub triggered_by_event: bool,
    /// Transactional sub-process: the only scope a Cancel throw/catch pair
    /// is valid in.
    pub transactional: bool,
}

// ─── Events ───────────────────────────────────────────────────

/// Event definition attached to an event node. References are correlation
/// keys matched against trigger references; expressions are resolved by the
/// external evaluator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSpec {
    None,
    Message { reference: String },
    Timer { expression: ExprHandle },
    Signal { reference: String },
    Error { reference: Option<String> },
    Escalation { reference: Option<String> },
    Cancel,
    Terminate,
    Conditional { expression: ExprHandle },
    Link { reference: String },
}

// ─── Sequence flows ───────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Guard expression handle, resolved by the external evaluator.
    pub guard: Option<ExprHandle>,
    pub is_default: bool,
    pub is_immediate: bool,
}
