use crate::definition::{EventSpec, NodeKind, ProcessDefinition, TaskKind};
use crate::dispatch::{self, ThrowKind, ThrowResolution, TokenEffect};
use crate::error::{DispatchError, EngineError, GatewayError};
use crate::eval::Evaluator;
use crate::events::RuntimeEvent;
use crate::gateway::{self, GatewayDecision, GuardContext};
use crate::instance::{
    BoundarySubscription, InstanceState, ProcessInstance, ScopeActivation, Token, TokenState,
};
use crate::loader;
use crate::persist::Persistor;
use crate::types::{now_ms, Trigger, VariableMap};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Externally observable status of an instance.
#[derive(Clone, Debug, PartialEq)]
pub enum InstanceStatus {
    Running,
    /// Waiting on external input; carries the armed catch point and
    /// pending activity identifiers so a caller knows what is awaited.
    Suspended { awaiting: Vec<String> },
    Completed,
    Terminated { fault: Option<String> },
}

/// Ceiling on stepper iterations per pass. A well-formed model never gets
/// close; a cyclic one without waits would otherwise spin forever.
const MAX_STEPS: usize = 10_000;

/// The token scheduler.
///
/// Owns the registered definitions (read-only after registration) and the
/// in-flight instances. Each instance is advanced by one logical stepper
/// at a time: a `tokio::sync::Mutex` per instance id guarantees the join
/// accumulator sees arrivals in a well-defined order. Instances share no
/// mutable state, so independent instances run concurrently.
pub struct Engine {
    definitions: RwLock<BTreeMap<String, Arc<ProcessDefinition>>>,
    instances: RwLock<BTreeMap<Uuid, Arc<Mutex<ProcessInstance>>>>,
    evaluator: Arc<dyn Evaluator>,
    persistor: Arc<dyn Persistor>,
}

impl Engine {
    pub fn new(evaluator: Arc<dyn Evaluator>, persistor: Arc<dyn Persistor>) -> Self {
        Self {
            definitions: RwLock::new(BTreeMap::new()),
            instances: RwLock::new(BTreeMap::new()),
            evaluator,
            persistor,
        }
    }

    // ── Definition registry ──

    /// Register an already-built definition. Returns its id.
    pub fn register(&self, defn: ProcessDefinition) -> String {
        let id = defn.id.clone();
        self.definitions_mut().insert(id.clone(), Arc::new(defn));
        id
    }

    /// Load a serialized definition (JSON bytes) and register it.
    pub fn deploy_slice(&self, bytes: &[u8]) -> Result<String, EngineError> {
        Ok(self.register(loader::load_slice(bytes)?))
    }

    /// YAML flavor of `deploy_slice`.
    pub fn deploy_yaml_str(&self, yaml: &str) -> Result<String, EngineError> {
        Ok(self.register(loader::load_yaml_str(yaml)?))
    }

    pub fn definition(&self, id: &str) -> Result<Arc<ProcessDefinition>, EngineError> {
        self.definitions_read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDefinition(id.to_string()))
    }

    // ── Public API ──

    /// Create and run a new instance. Returns once no token is runnable:
    /// the instance is then completed, suspended awaiting external input,
    /// or terminated.
    pub async fn start(
        &self,
        definition_id: &str,
        variables: VariableMap,
    ) -> Result<Uuid, EngineError> {
        let defn = self.definition(definition_id)?;
        if !defn.executable {
            return Err(EngineError::NotExecutable(definition_id.to_string()));
        }

        let mut instance = ProcessInstance::new(definition_id, defn.version(), variables);
        let instance_id = instance.instance_id;
        info!(%instance_id, definition = %definition_id, "starting process instance");
        self.emit(
            instance_id,
            RuntimeEvent::InstanceStarted {
                instance_id,
                definition_id: definition_id.to_string(),
                definition_version: instance.definition_version,
            },
        )
        .await?;

        let root = instance.root_scope;
        let starts: Vec<String> = defn
            .plain_start_events()
            .iter()
            .map(|n| n.id.clone())
            .collect();
        for start in starts {
            self.spawn_token(&mut instance, &start, root, None, None, None)
                .await?;
        }
        instance.state = InstanceState::Running;
        self.checkpoint(&instance).await?;

        let handle = Arc::new(Mutex::new(instance));
        self.instances_mut().insert(instance_id, handle.clone());
        let mut guard = handle.lock().await;
        self.run(&defn, &mut guard).await?;
        Ok(instance_id)
    }

    /// Deliver a runtime trigger. Unmatched triggers come back as
    /// `UnknownTrigger` without touching instance state.
    pub async fn signal(&self, instance_id: Uuid, trigger: Trigger) -> Result<(), EngineError> {
        let handle = self.handle(instance_id)?;
        let mut instance = handle.lock().await;
        if instance.state.is_terminal() {
            return Err(EngineError::InstanceDone(instance_id));
        }
        let defn = self.definition(&instance.definition_id)?;

        let effects = dispatch::signal(&instance, &defn, &trigger, self.evaluator.as_ref())?;
        self.emit(
            instance_id,
            RuntimeEvent::TriggerDelivered {
                kind: trigger.kind,
                reference: trigger.reference.clone(),
            },
        )
        .await?;
        self.apply_effects(&defn, &mut instance, effects).await?;
        self.run(&defn, &mut instance).await
    }

    /// Complete a parked activity with its result variables. Rejected with
    /// `StaleResumption` when the activity is no longer armed (already
    /// interrupted or already completed).
    pub async fn complete_activity(
        &self,
        instance_id: Uuid,
        activity_id: &str,
        result: VariableMap,
    ) -> Result<(), EngineError> {
        let handle = self.handle(instance_id)?;
        let mut instance = handle.lock().await;
        if instance.state.is_terminal() {
            return Err(EngineError::InstanceDone(instance_id));
        }
        let defn = self.definition(&instance.definition_id)?;

        let parked = instance
            .tokens
            .values()
            .find(|t| {
                matches!(&t.state, TokenState::AwaitingCompletion { activity } if activity == activity_id)
            })
            .map(|t| t.token_id);
        let Some(token_id) = parked else {
            return Err(DispatchError::StaleResumption {
                instance: instance_id,
                activity: activity_id.to_string(),
            }
            .into());
        };

        instance.variables.extend(result);
        instance.clear_subscriptions_for_token(token_id);
        self.emit(
            instance_id,
            RuntimeEvent::ActivityCompleted {
                token_id,
                activity: activity_id.to_string(),
            },
        )
        .await?;

        if let Some(t) = instance.tokens.get_mut(&token_id) {
            t.state = TokenState::Ready;
        }
        let path = self.token_scope_path(&instance, token_id);
        if let Some(scope_defn) = defn.resolve_scope(&path) {
            self.advance_token(&defn, scope_defn, &mut instance, token_id)
                .await?;
        }
        self.run(&defn, &mut instance).await
    }

    pub async fn status(&self, instance_id: Uuid) -> Result<InstanceStatus, EngineError> {
        let handle = self.handle(instance_id)?;
        let instance = handle.lock().await;
        Ok(match &instance.state {
            InstanceState::Completed { .. } => InstanceStatus::Completed,
            InstanceState::Terminated { fault, .. } => InstanceStatus::Terminated {
                fault: fault.clone(),
            },
            InstanceState::Suspended => {
                let defn = self.definition(&instance.definition_id)?;
                InstanceStatus::Suspended {
                    awaiting: self.awaiting(&defn, &instance),
                }
            }
            InstanceState::Created | InstanceState::Running => InstanceStatus::Running,
        })
    }

    /// Rehydrate an instance from the persistor's last checkpoint. The
    /// definition must already be registered.
    pub async fn recover(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let snapshot = self
            .persistor
            .load(instance_id)
            .await
            .map_err(EngineError::Persist)?
            .ok_or(EngineError::UnknownInstance(instance_id))?;
        self.definition(&snapshot.definition_id)?;
        info!(%instance_id, "recovered instance from checkpoint");
        self.instances_mut()
            .insert(instance_id, Arc::new(Mutex::new(snapshot)));
        Ok(())
    }

    // ── Stepper ──

    /// Drain runnable tokens. Each step is one token against one node;
    /// the instance is checkpointed at every transition boundary.
    async fn run(
        &self,
        defn: &ProcessDefinition,
        instance: &mut ProcessInstance,
    ) -> Result<(), EngineError> {
        if !instance.state.is_terminal() {
            instance.state = InstanceState::Running;
        }
        let mut steps = 0usize;
        while let Some(token_id) = instance.next_ready() {
            if instance.state.is_terminal() {
                break;
            }
            steps += 1;
            if steps > MAX_STEPS {
                return Err(EngineError::StepLimitExceeded(instance.instance_id));
            }
            self.step(defn, instance, token_id).await?;
            self.checkpoint(instance).await?;
        }
        if !instance.state.is_terminal() {
            instance.state = InstanceState::Suspended;
            let awaiting = self.awaiting(defn, instance);
            self.emit(instance.instance_id, RuntimeEvent::Suspended { awaiting })
                .await?;
            self.checkpoint(instance).await?;
        }
        Ok(())
    }

    async fn step(
        &self,
        defn: &ProcessDefinition,
        instance: &mut ProcessInstance,
        token_id: Uuid,
    ) -> Result<(), EngineError> {
        let Some(token) = instance.tokens.get(&token_id) else {
            return Ok(());
        };
        let scope_id = token.scope;
        let node_id = token.node.clone();
        let Some(path) = instance.scope(scope_id).map(|a| a.path.clone()) else {
            // scope vanished under the token
            instance.tokens.remove(&token_id);
            return Ok(());
        };
        let Some(scope_defn) = defn.resolve_scope(&path) else {
            return self
                .raise_fault(
                    defn,
                    instance,
                    token_id,
                    None,
                    format!("scope path {path:?} does not resolve"),
                )
                .await;
        };
        let Some(node) = scope_defn.node(&node_id) else {
            return self
                .raise_fault(
                    defn,
                    instance,
                    token_id,
                    None,
                    format!("node '{node_id}' missing from its scope"),
                )
                .await;
        };
        debug!(%token_id, node = %node_id, "stepping token");

        match &node.kind {
            // Seeded start events and dispatcher-spawned boundary tokens
            // just move on.
            NodeKind::StartEvent { .. } | NodeKind::Boundary { .. } => {
                self.advance_token(defn, scope_defn, instance, token_id).await
            }

            NodeKind::Task { task } => {
                if task.requires_external_completion() {
                    if let Some(msg) = self
                        .arm_boundaries(scope_defn, instance, scope_id, &node_id, token_id)
                        .await?
                    {
                        return self.raise_fault(defn, instance, token_id, None, msg).await;
                    }
                    if let Some(t) = instance.tokens.get_mut(&token_id) {
                        t.state = TokenState::AwaitingCompletion {
                            activity: node_id.clone(),
                        };
                    }
                    self.emit(
                        instance.instance_id,
                        RuntimeEvent::ActivityWaiting {
                            token_id,
                            activity: node_id.clone(),
                        },
                    )
                    .await
                } else if let TaskKind::Script {
                    expression,
                    result_var,
                } = task
                {
                    match self.evaluator.evaluate(expression, &instance.variables) {
                        Ok(value) => {
                            if let Some(var) = result_var {
                                instance.variables.insert(var.clone(), value);
                            }
                            self.emit(
                                instance.instance_id,
                                RuntimeEvent::ScriptEvaluated {
                                    node: node_id.clone(),
                                    result_var: result_var.clone(),
                                },
                            )
                            .await?;
                            self.advance_token(defn, scope_defn, instance, token_id).await
                        }
                        Err(e) => {
                            self.raise_fault(defn, instance, token_id, None, e.to_string())
                                .await
                        }
                    }
                } else {
                    // abstract and manual tasks complete inline
                    self.advance_token(defn, scope_defn, instance, token_id).await
                }
            }

            NodeKind::Gateway { .. } => {
                let decision = {
                    let ctx = GuardContext {
                        evaluator: self.evaluator.as_ref(),
                        variables: &instance.variables,
                    };
                    gateway::decide(scope_defn, node, &ctx)
                };
                match decision {
                    Ok(GatewayDecision::PassThrough(flows)) => {
                        self.emit(
                            instance.instance_id,
                            RuntimeEvent::GatewayTaken {
                                gateway: node_id.clone(),
                                flows: flows.clone(),
                            },
                        )
                        .await?;
                        self.move_along(defn, scope_defn, instance, token_id, &flows)
                            .await
                    }
                    Ok(GatewayDecision::Fork(flows)) => {
                        instance.tokens.remove(&token_id);
                        let mut children = Vec::new();
                        for flow_id in &flows {
                            let Some(flow) = scope_defn.flow(flow_id) else {
                                continue;
                            };
                            let target = flow.target.clone();
                            let child = self
                                .spawn_token(
                                    instance,
                                    &target,
                                    scope_id,
                                    Some(token_id),
                                    Some(node_id.clone()),
                                    Some(flow_id.clone()),
                                )
                                .await?;
                            children.push(child);
                        }
                        self.emit(
                            instance.instance_id,
                            RuntimeEvent::Forked {
                                gateway: node_id.clone(),
                                children,
                            },
                        )
                        .await
                    }
                    Ok(GatewayDecision::AwaitJoin) => {
                        self.join_arrive(defn, scope_defn, instance, token_id, scope_id, &node_id)
                            .await
                    }
                    Err(GatewayError::NoApplicableFlow { gateway }) => {
                        self.raise_fault(
                            defn,
                            instance,
                            token_id,
                            None,
                            format!("gateway {gateway}: no outgoing flow applicable"),
                        )
                        .await
                    }
                    Err(GatewayError::Eval(e)) => {
                        self.raise_fault(defn, instance, token_id, None, e.to_string())
                            .await
                    }
                }
            }

            NodeKind::IntermediateCatch { event } => match event {
                // link catches are labels; a token walking onto one keeps going
                EventSpec::Link { .. } => {
                    self.advance_token(defn, scope_defn, instance, token_id).await
                }
                EventSpec::Timer { expression } => {
                    match self
                        .evaluator
                        .due_time(expression, &instance.variables, now_ms())
                    {
                        Ok(due) => {
                            if let Some(t) = instance.tokens.get_mut(&token_id) {
                                t.state = TokenState::AwaitingTrigger { due: Some(due) };
                            }
                            self.emit(
                                instance.instance_id,
                                RuntimeEvent::CatchArmed {
                                    node: node_id.clone(),
                                    token_id,
                                    due: Some(due),
                                },
                            )
                            .await
                        }
                        Err(e) => {
                            self.raise_fault(defn, instance, token_id, None, e.to_string())
                                .await
                        }
                    }
                }
                _ => {
                    if let Some(t) = instance.tokens.get_mut(&token_id) {
                        t.state = TokenState::AwaitingTrigger { due: None };
                    }
                    self.emit(
                        instance.instance_id,
                        RuntimeEvent::CatchArmed {
                            node: node_id.clone(),
                            token_id,
                            due: None,
                        },
                    )
                    .await
                }
            },

            NodeKind::IntermediateThrow { event } => {
                let event = event.clone();
                self.apply_throw(defn, scope_defn, instance, token_id, scope_id, &node_id, event, false)
                    .await
            }

            NodeKind::EndEvent { event } => {
                let event = event.clone();
                self.apply_throw(defn, scope_defn, instance, token_id, scope_id, &node_id, event, true)
                    .await
            }

            NodeKind::SubProcess(sp) => {
                if sp.triggered_by_event || sp.for_compensation {
                    // never started by token flow; validated upstream
                    return self.advance_token(defn, scope_defn, instance, token_id).await;
                }
                if let Some(msg) = self
                    .arm_boundaries(scope_defn, instance, scope_id, &node_id, token_id)
                    .await?
                {
                    return self.raise_fault(defn, instance, token_id, None, msg).await;
                }
                let child_id = Uuid::now_v7();
                let mut child_path = path.clone();
                child_path.push(node_id.clone());
                instance.scopes.insert(
                    child_id,
                    ScopeActivation {
                        scope_id: child_id,
                        parent: Some(scope_id),
                        subprocess: Some(node_id.clone()),
                        parent_token: Some(token_id),
                        transactional: sp.transactional,
                        path: child_path,
                    },
                );
                if let Some(t) = instance.tokens.get_mut(&token_id) {
                    t.state = TokenState::AwaitingScope { scope: child_id };
                }
                self.emit(
                    instance.instance_id,
                    RuntimeEvent::ScopeEntered {
                        scope: child_id,
                        subprocess: node_id.clone(),
                    },
                )
                .await?;
                let starts: Vec<String> = sp
                    .definition
                    .plain_start_events()
                    .iter()
                    .map(|n| n.id.clone())
                    .collect();
                for start in starts {
                    for _ in 0..sp.start_quantity.max(1) {
                        self.spawn_token(instance, &start, child_id, None, None, None)
                            .await?;
                    }
                }
                Ok(())
            }
        }
    }

    // ── Throw handling (intermediate throw and end events) ──

    #[allow(clippy::too_many_arguments)]
    async fn apply_throw(
        &self,
        defn: &ProcessDefinition,
        scope_defn: &ProcessDefinition,
        instance: &mut ProcessInstance,
        token_id: Uuid,
        scope_id: Uuid,
        node_id: &str,
        event: EventSpec,
        is_end: bool,
    ) -> Result<(), EngineError> {
        match event {
            EventSpec::Terminate => self.terminate_scope(defn, instance, scope_id).await,

            EventSpec::Error { reference } => {
                if is_end {
                    self.raise_error_end(defn, instance, scope_id, node_id, reference)
                        .await
                } else {
                    self.raise_fault(
                        defn,
                        instance,
                        token_id,
                        reference.clone(),
                        format!("error thrown at {node_id}"),
                    )
                    .await
                }
            }

            EventSpec::Cancel => {
                self.cancel_transaction(defn, instance, token_id, scope_id, node_id)
                    .await
            }

            EventSpec::Escalation { reference } => {
                let resolution = dispatch::route_thrown(
                    instance,
                    defn,
                    ThrowKind::Escalation,
                    scope_id,
                    node_id,
                    token_id,
                    reference.as_deref(),
                );
                match resolution {
                    ThrowResolution::Caught(effects) => {
                        self.apply_effects(defn, instance, effects).await?;
                    }
                    ThrowResolution::Uncaught => {
                        warn!(node = %node_id, ?reference, "escalation left uncaught; dropping");
                        self.emit(
                            instance.instance_id,
                            RuntimeEvent::EscalationDropped {
                                reference: reference.clone(),
                            },
                        )
                        .await?;
                    }
                }
                // an interrupting catch may have torn the thrower down
                self.finish_throw(defn, scope_defn, instance, token_id, is_end)
                    .await
            }

            EventSpec::Signal { reference } => {
                let trigger = Trigger::signal(reference);
                match dispatch::signal(instance, defn, &trigger, self.evaluator.as_ref()) {
                    Ok(effects) => self.apply_effects(defn, instance, effects).await?,
                    // signal throws are fire-and-forget
                    Err(DispatchError::UnknownTrigger { .. }) => {}
                    Err(DispatchError::StaleResumption { .. }) => {}
                }
                self.finish_throw(defn, scope_defn, instance, token_id, is_end)
                    .await
            }

            EventSpec::Link { reference } => {
                let catch = scope_defn.nodes.values().find(|n| {
                    matches!(
                        &n.kind,
                        NodeKind::IntermediateCatch {
                            event: EventSpec::Link { reference: catch_ref },
                        } if *catch_ref == reference
                    )
                });
                match catch.map(|n| n.id.clone()) {
                    Some(catch_id) => {
                        if let Some(t) = instance.tokens.get_mut(&token_id) {
                            t.node = catch_id;
                        }
                        self.advance_token(defn, scope_defn, instance, token_id).await
                    }
                    None => {
                        self.raise_fault(
                            defn,
                            instance,
                            token_id,
                            None,
                            format!("link '{reference}' has no catch in scope"),
                        )
                        .await
                    }
                }
            }

            // Message throws belong to external collaborators; the rest
            // have no throw semantics.
            _ => {
                self.finish_throw(defn, scope_defn, instance, token_id, is_end)
                    .await
            }
        }
    }

    /// Continue the throwing token, if the throw left it alive.
    async fn finish_throw(
        &self,
        defn: &ProcessDefinition,
        scope_defn: &ProcessDefinition,
        instance: &mut ProcessInstance,
        token_id: Uuid,
        is_end: bool,
    ) -> Result<(), EngineError> {
        if !instance.tokens.contains_key(&token_id) {
            return Ok(());
        }
        if is_end {
            self.consume_token(defn, instance, token_id).await
        } else {
            self.advance_token(defn, scope_defn, instance, token_id).await
        }
    }

    // ── Token plumbing ──

    async fn spawn_token(
        &self,
        instance: &mut ProcessInstance,
        node: &str,
        scope: Uuid,
        parent: Option<Uuid>,
        fork_point: Option<String>,
        arrived_by: Option<String>,
    ) -> Result<Uuid, EngineError> {
        let mut token = Token::new(node, scope);
        token.parent = parent;
        token.fork_point = fork_point;
        token.arrived_by = arrived_by;
        let token_id = token.token_id;
        self.emit(
            instance.instance_id,
            RuntimeEvent::TokenSpawned {
                token_id,
                node: node.to_string(),
                scope,
                parent,
            },
        )
        .await?;
        instance.tokens.insert(token_id, token);
        Ok(token_id)
    }

    /// Move a token along the given flows: in place for one flow, as an
    /// implicit fork for several, as an implicit end for none.
    async fn move_along(
        &self,
        defn: &ProcessDefinition,
        scope_defn: &ProcessDefinition,
        instance: &mut ProcessInstance,
        token_id: Uuid,
        flow_ids: &[String],
    ) -> Result<(), EngineError> {
        if flow_ids.is_empty() {
            return self.consume_token(defn, instance, token_id).await;
        }
        if flow_ids.len() == 1 {
            let flow_id = &flow_ids[0];
            let Some(flow) = scope_defn.flow(flow_id) else {
                instance.tokens.remove(&token_id);
                return Ok(());
            };
            let target = flow.target.clone();
            if let Some(token) = instance.tokens.get_mut(&token_id) {
                token.node = target.clone();
                token.arrived_by = Some(flow_id.clone());
                token.state = TokenState::Ready;
            }
            return self
                .emit(
                    instance.instance_id,
                    RuntimeEvent::TokenAdvanced {
                        token_id,
                        flow: flow_id.clone(),
                        to: target,
                    },
                )
                .await;
        }

        // implicit parallel fork: multiple outgoing flows from one node
        let Some(token) = instance.tokens.get(&token_id) else {
            return Ok(());
        };
        let scope_id = token.scope;
        let source = token.node.clone();
        instance.tokens.remove(&token_id);
        for flow_id in flow_ids {
            if let Some(flow) = scope_defn.flow(flow_id) {
                let target = flow.target.clone();
                self.spawn_token(
                    instance,
                    &target,
                    scope_id,
                    Some(token_id),
                    Some(source.clone()),
                    Some(flow_id.clone()),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Continue a token past its current node, along every outgoing flow.
    async fn advance_token(
        &self,
        defn: &ProcessDefinition,
        scope_defn: &ProcessDefinition,
        instance: &mut ProcessInstance,
        token_id: Uuid,
    ) -> Result<(), EngineError> {
        let Some(token) = instance.tokens.get(&token_id) else {
            return Ok(());
        };
        let node_id = token.node.clone();
        let flow_ids: Vec<String> = scope_defn
            .node(&node_id)
            .map(|n| n.outgoing.clone())
            .unwrap_or_default();
        self.move_along(defn, scope_defn, instance, token_id, &flow_ids)
            .await
    }

    async fn consume_token(
        &self,
        defn: &ProcessDefinition,
        instance: &mut ProcessInstance,
        token_id: Uuid,
    ) -> Result<(), EngineError> {
        let Some(token) = instance.tokens.remove(&token_id) else {
            return Ok(());
        };
        instance.clear_subscriptions_for_token(token_id);
        self.emit(
            instance.instance_id,
            RuntimeEvent::TokenConsumed {
                token_id,
                node: token.node.clone(),
            },
        )
        .await?;
        self.maybe_complete_scope(defn, instance, token.scope).await
    }

    // ── Joins ──

    async fn join_arrive(
        &self,
        defn: &ProcessDefinition,
        scope_defn: &ProcessDefinition,
        instance: &mut ProcessInstance,
        token_id: Uuid,
        scope_id: Uuid,
        gateway_id: &str,
    ) -> Result<(), EngineError> {
        let arrived_flow = instance
            .tokens
            .get(&token_id)
            .and_then(|t| t.arrived_by.clone())
            .unwrap_or_else(|| token_id.to_string());
        // the arriving token is absorbed either way
        instance.tokens.remove(&token_id);
        self.emit(
            instance.instance_id,
            RuntimeEvent::JoinArrived {
                gateway: gateway_id.to_string(),
                flow: arrived_flow.clone(),
                token_id,
            },
        )
        .await?;

        let expected = scope_defn
            .node(gateway_id)
            .map(|n| n.incoming.len())
            .unwrap_or(0);
        let key = ProcessInstance::join_key(scope_id, gateway_id);
        let accumulator = instance.joins.entry(key.clone()).or_default();
        accumulator.arrived.insert(arrived_flow, token_id);
        let arrived = accumulator.arrived.len();

        if expected > 0 && arrived >= expected {
            // barrier satisfied: one synchronization token continues on
            // every outgoing flow
            instance.joins.remove(&key);
            let out: Vec<(String, String)> = scope_defn
                .outgoing(gateway_id)
                .iter()
                .map(|f| (f.id.clone(), f.target.clone()))
                .collect();
            let fork_point = (out.len() > 1).then(|| gateway_id.to_string());
            let mut successors = Vec::new();
            for (flow_id, target) in &out {
                let successor = self
                    .spawn_token(
                        instance,
                        target,
                        scope_id,
                        None,
                        fork_point.clone(),
                        Some(flow_id.clone()),
                    )
                    .await?;
                successors.push(successor);
            }
            self.emit(
                instance.instance_id,
                RuntimeEvent::JoinReleased {
                    gateway: gateway_id.to_string(),
                    successors,
                },
            )
            .await?;
            if out.is_empty() {
                // degenerate join with no outgoing flow ends the branch
                self.maybe_complete_scope(defn, instance, scope_id).await?;
            }
        }
        Ok(())
    }

    // ── Scope lifecycle ──

    async fn maybe_complete_scope(
        &self,
        defn: &ProcessDefinition,
        instance: &mut ProcessInstance,
        scope_id: Uuid,
    ) -> Result<(), EngineError> {
        let done = instance.scopes.contains_key(&scope_id)
            && instance.live_tokens_in_scope(scope_id) == 0
            && instance.child_scopes(scope_id).is_empty()
            && !self.has_pending_join(instance, scope_id);
        if done {
            self.complete_scope(defn, instance, scope_id).await?;
        }
        Ok(())
    }

    fn has_pending_join(&self, instance: &ProcessInstance, scope_id: Uuid) -> bool {
        let prefix = format!("{scope_id}:");
        instance.joins.keys().any(|k| k.starts_with(&prefix))
    }

    /// Normal completion of a scope: the root transitions the instance to
    /// Completed; a sub-process scope resumes its held parent token.
    ///
    /// Manually boxed: scope completion can cascade (a resumed parent
    /// token may immediately finish its own scope).
    fn complete_scope<'a>(
        &'a self,
        defn: &'a ProcessDefinition,
        instance: &'a mut ProcessInstance,
        scope_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + 'a>> {
        Box::pin(async move {
            let Some(act) = instance.scopes.remove(&scope_id) else {
                return Ok(());
            };
            instance.clear_scope_bookkeeping(scope_id);
            self.emit(instance.instance_id, RuntimeEvent::ScopeCompleted { scope: scope_id })
                .await?;

            match (&act.subprocess, act.parent) {
                (None, _) | (Some(_), None) => {
                    let at = now_ms();
                    instance.state = InstanceState::Completed { at };
                    info!(instance_id = %instance.instance_id, "process instance completed");
                    self.emit(instance.instance_id, RuntimeEvent::Completed { at })
                        .await?;
                }
                (Some(_), Some(parent)) => match act.parent_token {
                    Some(parent_token) => {
                        instance.clear_subscriptions_for_token(parent_token);
                        if instance.tokens.contains_key(&parent_token) {
                            if let Some(t) = instance.tokens.get_mut(&parent_token) {
                                t.state = TokenState::Ready;
                            }
                            let parent_path = instance
                                .scope(parent)
                                .map(|a| a.path.clone())
                                .unwrap_or_default();
                            if let Some(parent_defn) = defn.resolve_scope(&parent_path) {
                                self.advance_token(defn, parent_defn, instance, parent_token)
                                    .await?;
                            }
                        }
                    }
                    None => {
                        // event sub-process finished; its host may be done now
                        self.maybe_complete_scope(defn, instance, parent).await?;
                    }
                },
            }
            Ok(())
        })
    }

    /// Terminate semantics: discard every token in the scope tree with no
    /// join synchronization, then end the scope. Only a root terminate
    /// ends the instance; a sub-process terminate resumes the parent.
    async fn terminate_scope(
        &self,
        defn: &ProcessDefinition,
        instance: &mut ProcessInstance,
        scope_id: Uuid,
    ) -> Result<(), EngineError> {
        for tid in instance.tokens_in_scope_tree(scope_id) {
            instance.tokens.remove(&tid);
            instance.clear_subscriptions_for_token(tid);
        }
        for sid in instance.scope_tree(scope_id) {
            if sid != scope_id {
                instance.scopes.remove(&sid);
            }
            instance.clear_scope_bookkeeping(sid);
        }
        let Some(act) = instance.scopes.remove(&scope_id) else {
            return Ok(());
        };

        match (&act.subprocess, act.parent) {
            (None, _) | (Some(_), None) => {
                let at = now_ms();
                instance.state = InstanceState::Terminated { at, fault: None };
                info!(instance_id = %instance.instance_id, "process instance terminated");
                self.emit(
                    instance.instance_id,
                    RuntimeEvent::Terminated { at, fault: None },
                )
                .await?;
            }
            (Some(_), Some(parent)) => {
                self.emit(
                    instance.instance_id,
                    RuntimeEvent::ScopeCancelled {
                        scope: scope_id,
                        reason: "terminate".to_string(),
                    },
                )
                .await?;
                match act.parent_token {
                    Some(parent_token) => {
                        instance.clear_subscriptions_for_token(parent_token);
                        if instance.tokens.contains_key(&parent_token) {
                            if let Some(t) = instance.tokens.get_mut(&parent_token) {
                                t.state = TokenState::Ready;
                            }
                            let parent_path = instance
                                .scope(parent)
                                .map(|a| a.path.clone())
                                .unwrap_or_default();
                            if let Some(parent_defn) = defn.resolve_scope(&parent_path) {
                                self.advance_token(defn, parent_defn, instance, parent_token)
                                    .await?;
                            }
                        }
                    }
                    None => {
                        self.maybe_complete_scope(defn, instance, parent).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Discard a scope tree outright (boundary interruption, rollback).
    async fn cancel_scope_tree(
        &self,
        instance: &mut ProcessInstance,
        scope_id: Uuid,
        reason: &str,
    ) -> Result<(), EngineError> {
        if !instance.scopes.contains_key(&scope_id) {
            return Ok(());
        }
        for tid in instance.tokens_in_scope_tree(scope_id) {
            instance.tokens.remove(&tid);
            instance.clear_subscriptions_for_token(tid);
        }
        for sid in instance.scope_tree(scope_id) {
            instance.scopes.remove(&sid);
            instance.clear_scope_bookkeeping(sid);
        }
        self.emit(
            instance.instance_id,
            RuntimeEvent::ScopeCancelled {
                scope: scope_id,
                reason: reason.to_string(),
            },
        )
        .await
    }

    // ── Faults ──

    /// Convert a runtime fault into an internal Error trigger routed
    /// through boundary and event-sub-process catches; uncaught faults
    /// terminate the instance with the fault recorded.
    async fn raise_fault(
        &self,
        defn: &ProcessDefinition,
        instance: &mut ProcessInstance,
        token_id: Uuid,
        reference: Option<String>,
        message: String,
    ) -> Result<(), EngineError> {
        let (scope_id, node_id) = instance
            .tokens
            .get(&token_id)
            .map(|t| (t.scope, t.node.clone()))
            .unwrap_or((instance.root_scope, String::new()));
        warn!(%token_id, node = %node_id, %message, "runtime fault");
        self.emit(
            instance.instance_id,
            RuntimeEvent::FaultRaised {
                node: node_id.clone(),
                reference: reference.clone(),
                message: message.clone(),
            },
        )
        .await?;

        let resolution = dispatch::route_thrown(
            instance,
            defn,
            ThrowKind::Error,
            scope_id,
            &node_id,
            token_id,
            reference.as_deref(),
        );
        match resolution {
            ThrowResolution::Caught(effects) => {
                let catcher = catcher_of(&effects);
                self.apply_effects(defn, instance, effects).await?;
                // the fault consumes the faulting token unless an
                // interrupting catch already tore it down
                if instance.tokens.remove(&token_id).is_some() {
                    instance.clear_subscriptions_for_token(token_id);
                }
                self.emit(instance.instance_id, RuntimeEvent::FaultCaught { catcher })
                    .await
            }
            ThrowResolution::Uncaught => self.terminate_with_fault(instance, message).await,
        }
    }

    /// Error end event: the scope fails as a whole and the error is thrown
    /// at its host activity in the parent scope.
    async fn raise_error_end(
        &self,
        defn: &ProcessDefinition,
        instance: &mut ProcessInstance,
        scope_id: Uuid,
        node_id: &str,
        reference: Option<String>,
    ) -> Result<(), EngineError> {
        let message = match &reference {
            Some(r) => format!("error '{r}' raised at {node_id}"),
            None => format!("error raised at {node_id}"),
        };
        self.emit(
            instance.instance_id,
            RuntimeEvent::FaultRaised {
                node: node_id.to_string(),
                reference: reference.clone(),
                message: message.clone(),
            },
        )
        .await?;

        let Some(act) = instance.scope(scope_id).cloned() else {
            return Ok(());
        };
        let (Some(subprocess), Some(parent)) = (act.subprocess.clone(), act.parent) else {
            // error end at the root scope escapes the instance
            return self.terminate_with_fault(instance, message).await;
        };

        // the failing scope is gone regardless of who catches
        if let Some(parent_token) = act.parent_token {
            instance.tokens.remove(&parent_token);
            instance.clear_subscriptions_for_token(parent_token);
        }
        self.cancel_scope_tree(instance, scope_id, "error").await?;

        let resolution = dispatch::route_thrown(
            instance,
            defn,
            ThrowKind::Error,
            parent,
            &subprocess,
            act.parent_token.unwrap_or(Uuid::nil()),
            reference.as_deref(),
        );
        match resolution {
            ThrowResolution::Caught(effects) => {
                let catcher = catcher_of(&effects);
                self.apply_effects(defn, instance, effects).await?;
                self.emit(instance.instance_id, RuntimeEvent::FaultCaught { catcher })
                    .await
            }
            ThrowResolution::Uncaught => self.terminate_with_fault(instance, message).await,
        }
    }

    async fn terminate_with_fault(
        &self,
        instance: &mut ProcessInstance,
        fault: String,
    ) -> Result<(), EngineError> {
        let at = now_ms();
        instance.tokens.clear();
        instance.subscriptions.clear();
        instance.joins.clear();
        instance.state = InstanceState::Terminated {
            at,
            fault: Some(fault.clone()),
        };
        warn!(instance_id = %instance.instance_id, %fault, "instance terminated by uncaught fault");
        self.emit(
            instance.instance_id,
            RuntimeEvent::Terminated {
                at,
                fault: Some(fault),
            },
        )
        .await
    }

    /// Cancel end/throw event: roll back the innermost enclosing
    /// transactional sub-process and request compensation.
    async fn cancel_transaction(
        &self,
        defn: &ProcessDefinition,
        instance: &mut ProcessInstance,
        token_id: Uuid,
        scope_id: Uuid,
        node_id: &str,
    ) -> Result<(), EngineError> {
        let mut current = Some(scope_id);
        let tx_scope = std::iter::from_fn(|| {
            let sid = current?;
            let act = instance.scope(sid)?;
            current = act.parent;
            Some(act)
        })
        .find(|a| a.transactional)
        .map(|a| a.scope_id);

        let Some(tx_scope) = tx_scope else {
            return self
                .raise_fault(
                    defn,
                    instance,
                    token_id,
                    None,
                    format!("cancel event at {node_id} outside a transactional sub-process"),
                )
                .await;
        };
        let effects = dispatch::cancel_transaction_effects(instance, defn, tx_scope)
            .unwrap_or_default();
        self.cancel_scope_tree(instance, tx_scope, "cancel").await?;
        self.apply_effects(defn, instance, effects).await
    }

    // ── Effect application ──

    async fn apply_effects(
        &self,
        defn: &ProcessDefinition,
        instance: &mut ProcessInstance,
        effects: Vec<TokenEffect>,
    ) -> Result<(), EngineError> {
        for effect in effects {
            match effect {
                TokenEffect::Resume { token } => {
                    if let Some(t) = instance.tokens.get_mut(&token) {
                        t.state = TokenState::Ready;
                    }
                    let path = self.token_scope_path(instance, token);
                    if let Some(scope_defn) = defn.resolve_scope(&path) {
                        self.advance_token(defn, scope_defn, instance, token).await?;
                    }
                }
                TokenEffect::SpawnAt { scope, node } => {
                    if instance.scopes.contains_key(&scope) {
                        self.spawn_token(instance, &node, scope, None, None, None)
                            .await?;
                    }
                }
                TokenEffect::InterruptActivity {
                    host_token,
                    boundary,
                } => {
                    if let Some(token) = instance.tokens.remove(&host_token) {
                        instance.clear_subscriptions_for_token(host_token);
                        if let TokenState::AwaitingScope { scope } = token.state {
                            self.cancel_scope_tree(instance, scope, "interrupted").await?;
                        }
                        self.emit(
                            instance.instance_id,
                            RuntimeEvent::BoundaryFired {
                                boundary,
                                interrupting: true,
                            },
                        )
                        .await?;
                    }
                }
                TokenEffect::TerminateScope { scope } => {
                    self.terminate_scope(defn, instance, scope).await?;
                }
                TokenEffect::CompensationRequested { scope, subprocess } => {
                    self.emit(
                        instance.instance_id,
                        RuntimeEvent::CompensationRequested { scope, subprocess },
                    )
                    .await?;
                }
                TokenEffect::StartEventSubprocess {
                    scope,
                    subprocess,
                    start,
                    interrupting,
                } => {
                    self.start_event_subprocess(defn, instance, scope, &subprocess, &start, interrupting)
                        .await?;
                }
            }
        }
        self.sweep_scopes(defn, instance).await
    }

    async fn start_event_subprocess(
        &self,
        defn: &ProcessDefinition,
        instance: &mut ProcessInstance,
        scope: Uuid,
        subprocess: &str,
        start: &str,
        interrupting: bool,
    ) -> Result<(), EngineError> {
        let Some(parent_path) = instance.scope(scope).map(|a| a.path.clone()) else {
            return Ok(());
        };
        let transactional = defn
            .resolve_scope(&parent_path)
            .and_then(|d| d.node(subprocess))
            .map(|n| matches!(&n.kind, NodeKind::SubProcess(sp) if sp.transactional))
            .unwrap_or(false);

        if interrupting {
            // an interrupting start tears down the host scope's other work
            for tid in instance.tokens_in_scope_tree(scope) {
                instance.tokens.remove(&tid);
                instance.clear_subscriptions_for_token(tid);
            }
            for sid in instance.scope_tree(scope) {
                if sid != scope {
                    instance.scopes.remove(&sid);
                }
                instance.clear_scope_bookkeeping(sid);
            }
        }

        let child_id = Uuid::now_v7();
        let mut path = parent_path;
        path.push(subprocess.to_string());
        instance.scopes.insert(
            child_id,
            ScopeActivation {
                scope_id: child_id,
                parent: Some(scope),
                subprocess: Some(subprocess.to_string()),
                parent_token: None,
                transactional,
                path,
            },
        );
        self.emit(
            instance.instance_id,
            RuntimeEvent::ScopeEntered {
                scope: child_id,
                subprocess: subprocess.to_string(),
            },
        )
        .await?;
        self.spawn_token(instance, start, child_id, None, None, None)
            .await?;
        Ok(())
    }

    /// Complete sub-process scopes left empty by effect application.
    async fn sweep_scopes(
        &self,
        defn: &ProcessDefinition,
        instance: &mut ProcessInstance,
    ) -> Result<(), EngineError> {
        loop {
            let candidate = instance
                .scopes
                .values()
                .find(|a| {
                    a.subprocess.is_some()
                        && instance.live_tokens_in_scope(a.scope_id) == 0
                        && instance.child_scopes(a.scope_id).is_empty()
                        && !self.has_pending_join(instance, a.scope_id)
                })
                .map(|a| a.scope_id);
            match candidate {
                Some(scope_id) => self.complete_scope(defn, instance, scope_id).await?,
                None => break,
            }
        }
        Ok(())
    }

    // ── Boundary arming ──

    /// Arm the boundary events attached to an activity. Returns a fault
    /// message when a timer boundary's due time cannot be computed.
    async fn arm_boundaries(
        &self,
        scope_defn: &ProcessDefinition,
        instance: &mut ProcessInstance,
        scope_id: Uuid,
        host: &str,
        host_token: Uuid,
    ) -> Result<Option<String>, EngineError> {
        let boundaries: Vec<(String, Option<crate::eval::ExprHandle>)> = scope_defn
            .boundaries_attached_to(host)
            .iter()
            .filter_map(|b| match &b.kind {
                NodeKind::Boundary { event, .. } => {
                    let timer = match event {
                        EventSpec::Timer { expression } => Some(expression.clone()),
                        _ => None,
                    };
                    Some((b.id.clone(), timer))
                }
                _ => None,
            })
            .collect();

        for (boundary, timer) in boundaries {
            let due = match timer {
                Some(expr) => {
                    match self.evaluator.due_time(&expr, &instance.variables, now_ms()) {
                        Ok(due) => Some(due),
                        Err(e) => return Ok(Some(e.to_string())),
                    }
                }
                None => None,
            };
            instance.subscriptions.insert(
                ProcessInstance::subscription_key(scope_id, &boundary),
                BoundarySubscription {
                    boundary: boundary.clone(),
                    scope: scope_id,
                    host: host.to_string(),
                    host_token,
                    due,
                },
            );
            self.emit(
                instance.instance_id,
                RuntimeEvent::BoundaryArmed {
                    boundary,
                    host: host.to_string(),
                },
            )
            .await?;
        }
        Ok(None)
    }

    // ── Infrastructure ──

    fn awaiting(&self, defn: &ProcessDefinition, instance: &ProcessInstance) -> Vec<String> {
        let mut ids: Vec<String> = dispatch::armed(instance, defn)
            .iter()
            .map(|c| c.node_id().to_string())
            .collect();
        ids.extend(instance.pending_activities());
        ids.sort();
        ids.dedup();
        ids
    }

    fn token_scope_path(&self, instance: &ProcessInstance, token_id: Uuid) -> Vec<String> {
        instance
            .tokens
            .get(&token_id)
            .and_then(|t| instance.scope(t.scope))
            .map(|a| a.path.clone())
            .unwrap_or_default()
    }

    fn handle(&self, instance_id: Uuid) -> Result<Arc<Mutex<ProcessInstance>>, EngineError> {
        self.instances_read()
            .get(&instance_id)
            .cloned()
            .ok_or(EngineError::UnknownInstance(instance_id))
    }

    async fn emit(&self, instance_id: Uuid, event: RuntimeEvent) -> Result<(), EngineError> {
        debug!(%instance_id, ?event, "runtime event");
        self.persistor
            .append_event(instance_id, &event)
            .await
            .map_err(EngineError::Persist)?;
        Ok(())
    }

    async fn checkpoint(&self, instance: &ProcessInstance) -> Result<(), EngineError> {
        self.persistor
            .checkpoint(instance)
            .await
            .map_err(EngineError::Persist)
    }

    fn definitions_read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<ProcessDefinition>>> {
        self.definitions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn definitions_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<ProcessDefinition>>> {
        self.definitions.write().unwrap_or_else(|e| e.into_inner())
    }

    fn instances_read(&self) -> RwLockReadGuard<'_, BTreeMap<Uuid, Arc<Mutex<ProcessInstance>>>> {
        self.instances.read().unwrap_or_else(|e| e.into_inner())
    }

    fn instances_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<Uuid, Arc<Mutex<ProcessInstance>>>> {
        self.instances.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn catcher_of(effects: &[TokenEffect]) -> String {
    effects
        .iter()
        .find_map(|e| match e {
            TokenEffect::SpawnAt { node, .. } => Some(node.clone()),
            TokenEffect::StartEventSubprocess { start, .. } => Some(start.clone()),
            _ => None,
        })
        .unwrap_or_default()
}
