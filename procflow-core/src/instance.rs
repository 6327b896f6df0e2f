use crate::types::{now_ms, Timestamp, VariableMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Tokens ───────────────────────────────────────────────────

/// What a token is doing, or blocked on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TokenState {
    /// Runnable: the stepper may pick this token up.
    Ready,
    /// Parked at a task awaiting an external `complete_activity` call.
    AwaitingCompletion { activity: String },
    /// Parked at a catch event awaiting a matching trigger. Timer catches
    /// carry their absolute due time, computed at arming time.
    AwaitingTrigger { due: Option<Timestamp> },
    /// Held at a sub-process node until the child scope completes.
    AwaitingScope { scope: Uuid },
}

/// One thread of control traversing the graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    pub token_id: Uuid,
    /// Node the token currently sits on.
    pub node: String,
    /// Scope activation the token flows in.
    pub scope: Uuid,
    /// Causal fork bookkeeping: the token this one was forked from and the
    /// fork gateway, so a matching join can recognize siblings.
    pub parent: Option<Uuid>,
    pub fork_point: Option<String>,
    /// Flow the token most recently arrived on. Joins key arrivals by it.
    pub arrived_by: Option<String>,
    pub state: TokenState,
}

impl Token {
    pub fn new(node: impl Into<String>, scope: Uuid) -> Self {
        Self {
            token_id: Uuid::now_v7(),
            node: node.into(),
            scope,
            parent: None,
            fork_point: None,
            arrived_by: None,
            state: TokenState::Ready,
        }
    }
}

// ─── Scopes ───────────────────────────────────────────────────

/// One activation of a process or nested sub-process: the unit boundary
/// interruption, terminate events, and join bookkeeping are scoped to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScopeActivation {
    pub scope_id: Uuid,
    pub parent: Option<Uuid>,
    /// Sub-process node id in the parent scope's definition. None for the
    /// root scope.
    pub subprocess: Option<String>,
    /// Token in the parent scope held while this scope runs. None for the
    /// root scope and for event-sub-process activations.
    pub parent_token: Option<Uuid>,
    pub transactional: bool,
    /// Chain of sub-process node ids from the root definition to here.
    /// Nodes never point back at their parents; callers resolve the scope
    /// definition through this path.
    pub path: Vec<String>,
}

// ─── Join accumulator ─────────────────────────────────────────

/// Arrived sibling tokens for one converging gateway, keyed by the
/// distinct incoming flow each arrived on. Keying by flow id is what
/// bounds the accumulator to the gateway's incoming-flow count.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JoinAccumulator {
    pub arrived: BTreeMap<String, Uuid>,
}

// ─── Boundary subscriptions ───────────────────────────────────

/// An armed boundary event: which activity instance it watches and what to
/// tear down if it interrupts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BoundarySubscription {
    pub boundary: String,
    pub scope: Uuid,
    pub host: String,
    pub host_token: Uuid,
    /// Absolute due time for timer boundary events.
    pub due: Option<Timestamp>,
}

// ─── Instance ─────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum InstanceState {
    Created,
    Running,
    /// No runnable tokens; awaiting an external signal or completion.
    Suspended,
    Completed {
        at: Timestamp,
    },
    Terminated {
        at: Timestamp,
        fault: Option<String>,
    },
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceState::Completed { .. } | InstanceState::Terminated { .. }
        )
    }
}

/// One execution of a ProcessDefinition.
///
/// Mutated exclusively by the engine stepper (one stepper invocation owns
/// the instance at a time). The whole struct serializes; it IS the
/// snapshot handed to `Persistor::checkpoint`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub instance_id: Uuid,
    pub definition_id: String,
    pub definition_version: [u8; 32],
    pub state: InstanceState,
    pub root_scope: Uuid,
    pub tokens: BTreeMap<Uuid, Token>,
    pub scopes: BTreeMap<Uuid, ScopeActivation>,
    /// Join accumulators keyed by `{scope}:{gateway}`.
    pub joins: BTreeMap<String, JoinAccumulator>,
    /// Armed boundary events keyed by `{scope}:{boundary}`.
    pub subscriptions: BTreeMap<String, BoundarySubscription>,
    pub variables: VariableMap,
    pub created_at: Timestamp,
}

impl ProcessInstance {
    pub fn new(
        definition_id: impl Into<String>,
        definition_version: [u8; 32],
        variables: VariableMap,
    ) -> Self {
        let root_scope = Uuid::now_v7();
        let mut scopes = BTreeMap::new();
        scopes.insert(
            root_scope,
            ScopeActivation {
                scope_id: root_scope,
                parent: None,
                subprocess: None,
                parent_token: None,
                transactional: false,
                path: Vec::new(),
            },
        );
        Self {
            instance_id: Uuid::now_v7(),
            definition_id: definition_id.into(),
            definition_version,
            state: InstanceState::Created,
            root_scope,
            tokens: BTreeMap::new(),
            scopes,
            joins: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            variables,
            created_at: now_ms(),
        }
    }

    pub fn scope(&self, id: Uuid) -> Option<&ScopeActivation> {
        self.scopes.get(&id)
    }

    /// First runnable token in id order. Uuid v7 ids are time-ordered, so
    /// this walks tokens in creation order.
    pub fn next_ready(&self) -> Option<Uuid> {
        self.tokens
            .values()
            .find(|t| t.state == TokenState::Ready)
            .map(|t| t.token_id)
    }

    pub fn live_tokens_in_scope(&self, scope: Uuid) -> usize {
        self.tokens.values().filter(|t| t.scope == scope).count()
    }

    /// The scope plus every activation nested under it.
    pub fn scope_tree(&self, scope: Uuid) -> Vec<Uuid> {
        let mut out = vec![scope];
        let mut i = 0;
        while i < out.len() {
            let current = out[i];
            out.extend(
                self.scopes
                    .values()
                    .filter(|a| a.parent == Some(current))
                    .map(|a| a.scope_id),
            );
            i += 1;
        }
        out
    }

    /// Tokens living anywhere inside the scope tree.
    pub fn tokens_in_scope_tree(&self, scope: Uuid) -> Vec<Uuid> {
        let scopes = self.scope_tree(scope);
        self.tokens
            .values()
            .filter(|t| scopes.contains(&t.scope))
            .map(|t| t.token_id)
            .collect()
    }

    /// Child scope activations directly under a scope.
    pub fn child_scopes(&self, scope: Uuid) -> Vec<Uuid> {
        self.scopes
            .values()
            .filter(|a| a.parent == Some(scope))
            .map(|a| a.scope_id)
            .collect()
    }

    pub fn join_key(scope: Uuid, gateway: &str) -> String {
        format!("{scope}:{gateway}")
    }

    pub fn subscription_key(scope: Uuid, boundary: &str) -> String {
        format!("{scope}:{boundary}")
    }

    /// Drop joins and boundary subscriptions bound to a scope. Called when
    /// the scope completes or is torn down.
    pub fn clear_scope_bookkeeping(&mut self, scope: Uuid) {
        let prefix = format!("{scope}:");
        self.joins.retain(|k, _| !k.starts_with(&prefix));
        self.subscriptions.retain(|k, _| !k.starts_with(&prefix));
    }

    /// Drop boundary subscriptions watching the given activity token.
    pub fn clear_subscriptions_for_token(&mut self, host_token: Uuid) {
        self.subscriptions.retain(|_, s| s.host_token != host_token);
    }

    /// Activity ids of tokens parked on `complete_activity`.
    pub fn pending_activities(&self) -> Vec<String> {
        self.tokens
            .values()
            .filter_map(|t| match &t.state {
                TokenState::AwaitingCompletion { activity } => Some(activity.clone()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_instance_has_root_scope_and_no_tokens() {
        let inst = ProcessInstance::new("p", [0u8; 32], VariableMap::new());
        assert_eq!(inst.scopes.len(), 1);
        assert!(inst.scopes.contains_key(&inst.root_scope));
        assert!(inst.tokens.is_empty());
        assert_eq!(inst.state, InstanceState::Created);
        assert!(!inst.state.is_terminal());
    }

    #[test]
    fn scope_tree_walks_nested_activations() {
        let mut inst = ProcessInstance::new("p", [0u8; 32], VariableMap::new());
        let child = Uuid::now_v7();
        let grandchild = Uuid::now_v7();
        inst.scopes.insert(
            child,
            ScopeActivation {
                scope_id: child,
                parent: Some(inst.root_scope),
                subprocess: Some("sub".into()),
                parent_token: None,
                transactional: false,
                path: vec!["sub".into()],
            },
        );
        inst.scopes.insert(
            grandchild,
            ScopeActivation {
                scope_id: grandchild,
                parent: Some(child),
                subprocess: Some("inner".into()),
                parent_token: None,
                transactional: false,
                path: vec!["sub".into(), "inner".into()],
            },
        );
        let tree = inst.scope_tree(inst.root_scope);
        assert_eq!(tree.len(), 3);
        assert!(tree.contains(&grandchild));
        assert_eq!(inst.scope_tree(child), vec![child, grandchild]);
    }

    #[test]
    fn clear_scope_bookkeeping_only_touches_that_scope() {
        let mut inst = ProcessInstance::new("p", [0u8; 32], VariableMap::new());
        let other = Uuid::now_v7();
        inst.joins.insert(
            ProcessInstance::join_key(inst.root_scope, "join"),
            JoinAccumulator::default(),
        );
        inst.joins
            .insert(ProcessInstance::join_key(other, "join"), JoinAccumulator::default());
        inst.clear_scope_bookkeeping(inst.root_scope);
        assert_eq!(inst.joins.len(), 1);
        assert!(inst
            .joins
            .contains_key(&ProcessInstance::join_key(other, "join")));
    }
}
