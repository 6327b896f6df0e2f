use crate::definition::{EventSpec, NodeKind, ProcessDefinition};
use crate::error::DispatchError;
use crate::eval::Evaluator;
use crate::instance::{ProcessInstance, TokenState};
use crate::types::{is_truthy, Timestamp, Trigger, TriggerKind, VariableMap};
use tracing::debug;
use uuid::Uuid;

// ─── Armed catch points ───────────────────────────────────────

/// One currently armed catch point: an event node eligible to receive a
/// trigger right now.
#[derive(Clone, Debug)]
pub struct ArmedCatch {
    pub source: ArmedSource,
    pub spec: EventSpec,
    /// Absolute due time for timer catches.
    pub due: Option<Timestamp>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ArmedSource {
    /// Token parked at an intermediate catch event.
    Parked { token: Uuid, node: String },
    /// Boundary event attached to an active activity instance.
    Boundary {
        boundary: String,
        scope: Uuid,
        host_token: Uuid,
        cancel_activity: bool,
    },
    /// Start event of an event sub-process in an active scope.
    EventSubprocessStart {
        scope: Uuid,
        subprocess: String,
        start: String,
        interrupting: bool,
    },
}

impl ArmedCatch {
    /// Node id, for status reporting.
    pub fn node_id(&self) -> &str {
        match &self.source {
            ArmedSource::Parked { node, .. } => node,
            ArmedSource::Boundary { boundary, .. } => boundary,
            ArmedSource::EventSubprocessStart { start, .. } => start,
        }
    }
}

/// Every catch point currently armed for the instance: parked catch
/// tokens, boundary subscriptions, and event-sub-process start events of
/// active scopes.
pub fn armed(instance: &ProcessInstance, defn: &ProcessDefinition) -> Vec<ArmedCatch> {
    let mut out = Vec::new();

    for token in instance.tokens.values() {
        let TokenState::AwaitingTrigger { due } = &token.state else {
            continue;
        };
        let Some(act) = instance.scope(token.scope) else {
            continue;
        };
        let Some(spec) = defn
            .resolve_scope(&act.path)
            .and_then(|d| d.node(&token.node))
            .and_then(catch_spec)
        else {
            continue;
        };
        out.push(ArmedCatch {
            source: ArmedSource::Parked {
                token: token.token_id,
                node: token.node.clone(),
            },
            spec: spec.clone(),
            due: *due,
        });
    }

    for sub in instance.subscriptions.values() {
        let Some(act) = instance.scope(sub.scope) else {
            continue;
        };
        let Some(node) = defn
            .resolve_scope(&act.path)
            .and_then(|d| d.node(&sub.boundary))
        else {
            continue;
        };
        let NodeKind::Boundary {
            event,
            cancel_activity,
            ..
        } = &node.kind
        else {
            continue;
        };
        out.push(ArmedCatch {
            source: ArmedSource::Boundary {
                boundary: sub.boundary.clone(),
                scope: sub.scope,
                host_token: sub.host_token,
                cancel_activity: *cancel_activity,
            },
            spec: event.clone(),
            due: sub.due,
        });
    }

    for (scope_id, act) in &instance.scopes {
        let Some(scope_defn) = defn.resolve_scope(&act.path) else {
            continue;
        };
        for sp_node in scope_defn.event_subprocesses() {
            let NodeKind::SubProcess(sp) = &sp_node.kind else {
                continue;
            };
            for start in sp.definition.start_events() {
                let NodeKind::StartEvent {
                    event,
                    interrupting,
                } = &start.kind
                else {
                    continue;
                };
                if *event == EventSpec::None {
                    continue;
                }
                out.push(ArmedCatch {
                    source: ArmedSource::EventSubprocessStart {
                        scope: *scope_id,
                        subprocess: sp_node.id.clone(),
                        start: start.id.clone(),
                        interrupting: *interrupting,
                    },
                    spec: event.clone(),
                    due: None,
                });
            }
        }
    }

    out
}

fn catch_spec(node: &crate::definition::FlowNode) -> Option<&EventSpec> {
    match &node.kind {
        NodeKind::IntermediateCatch { event } | NodeKind::StartEvent { event, .. } => Some(event),
        _ => None,
    }
}

// ─── Token effects ────────────────────────────────────────────

/// Instruction produced by the dispatcher for the engine to apply. The
/// dispatcher never mutates the instance itself.
#[derive(Clone, Debug, PartialEq)]
pub enum TokenEffect {
    /// Resume a parked token: it advances past its current node.
    Resume { token: Uuid },
    /// Spawn a ready token on a node in a scope.
    SpawnAt { scope: Uuid, node: String },
    /// Tear down an activity instance: discard the host token and any
    /// scope it holds, with every nested token.
    InterruptActivity { host_token: Uuid, boundary: String },
    /// Discard every token in the scope tree and complete the scope
    /// without join synchronization.
    TerminateScope { scope: Uuid },
    /// Ask the external collaborator to run compensation for a rolled-back
    /// transactional scope.
    CompensationRequested { scope: Uuid, subprocess: String },
    /// Activate an event sub-process in a scope, seeding its start event.
    StartEventSubprocess {
        scope: Uuid,
        subprocess: String,
        start: String,
        interrupting: bool,
    },
}

// ─── Trigger matching ─────────────────────────────────────────

/// Match a runtime trigger against the armed catch points and produce the
/// effects the engine should apply.
///
/// Message/Error/Escalation deliver to the first match; Signal, Timer, and
/// Conditional broadcast to every match. Terminate targets the root scope
/// and Cancel the innermost transactional scope. No match is reported as
/// `UnknownTrigger` and leaves the instance untouched.
pub fn signal(
    instance: &ProcessInstance,
    defn: &ProcessDefinition,
    trigger: &Trigger,
    evaluator: &dyn Evaluator,
) -> Result<Vec<TokenEffect>, DispatchError> {
    match trigger.kind {
        TriggerKind::Terminate => {
            return Ok(vec![TokenEffect::TerminateScope {
                scope: instance.root_scope,
            }])
        }
        TriggerKind::Cancel => {
            return cancel_innermost_transaction(instance, defn).ok_or_else(|| {
                DispatchError::UnknownTrigger {
                    kind: trigger.kind,
                    reference: trigger.reference.clone(),
                }
            })
        }
        _ => {}
    }

    let armed = armed(instance, defn);
    let matched: Vec<&ArmedCatch> = armed
        .iter()
        .filter(|c| trigger_matches(c, trigger, evaluator, &instance.variables))
        .collect();

    if matched.is_empty() {
        return Err(DispatchError::UnknownTrigger {
            kind: trigger.kind,
            reference: trigger.reference.clone(),
        });
    }

    let broadcast = matches!(
        trigger.kind,
        TriggerKind::Signal | TriggerKind::Timer | TriggerKind::Conditional
    );
    let selected: Vec<&ArmedCatch> = if broadcast {
        matched
    } else {
        vec![matched[0]]
    };

    debug!(kind = ?trigger.kind, matches = selected.len(), "trigger matched");
    Ok(selected.iter().flat_map(|c| effects_for(c)).collect())
}

fn trigger_matches(
    catch: &ArmedCatch,
    trigger: &Trigger,
    evaluator: &dyn Evaluator,
    variables: &VariableMap,
) -> bool {
    match (&catch.spec, trigger.kind) {
        (EventSpec::Message { reference }, TriggerKind::Message)
        | (EventSpec::Signal { reference }, TriggerKind::Signal)
        | (EventSpec::Link { reference }, TriggerKind::Link) => {
            Some(reference.as_str()) == trigger.reference.as_deref()
        }
        (EventSpec::Error { reference }, TriggerKind::Error)
        | (EventSpec::Escalation { reference }, TriggerKind::Escalation) => {
            reference.is_none() || reference.as_deref() == trigger.reference.as_deref()
        }
        (EventSpec::Timer { .. }, TriggerKind::Timer) => {
            catch.due.map(|d| d <= trigger.at).unwrap_or(false)
        }
        (EventSpec::Conditional { expression }, TriggerKind::Conditional) => evaluator
            .evaluate(expression, variables)
            .map(|v| is_truthy(&v))
            .unwrap_or(false),
        _ => false,
    }
}

fn effects_for(catch: &ArmedCatch) -> Vec<TokenEffect> {
    match &catch.source {
        ArmedSource::Parked { token, .. } => vec![TokenEffect::Resume { token: *token }],
        ArmedSource::Boundary {
            boundary,
            scope,
            host_token,
            cancel_activity,
        } => {
            let spawn = TokenEffect::SpawnAt {
                scope: *scope,
                node: boundary.clone(),
            };
            if *cancel_activity {
                vec![
                    TokenEffect::InterruptActivity {
                        host_token: *host_token,
                        boundary: boundary.clone(),
                    },
                    spawn,
                ]
            } else {
                vec![spawn]
            }
        }
        ArmedSource::EventSubprocessStart {
            scope,
            subprocess,
            start,
            interrupting,
        } => vec![TokenEffect::StartEventSubprocess {
            scope: *scope,
            subprocess: subprocess.clone(),
            start: start.clone(),
            interrupting: *interrupting,
        }],
    }
}

/// Rollback effects for the innermost active transactional scope: tear the
/// scope down, request compensation, continue from the cancel boundary
/// when the transaction declares one.
fn cancel_innermost_transaction(
    instance: &ProcessInstance,
    defn: &ProcessDefinition,
) -> Option<Vec<TokenEffect>> {
    let act = instance
        .scopes
        .values()
        .filter(|a| a.transactional)
        .max_by_key(|a| a.path.len())?;
    cancel_transaction_effects(instance, defn, act.scope_id)
}

/// Rollback effects for a specific transactional scope. Used both by the
/// external Cancel trigger path and by cancel end events thrown inside the
/// transaction.
pub fn cancel_transaction_effects(
    instance: &ProcessInstance,
    defn: &ProcessDefinition,
    scope_id: Uuid,
) -> Option<Vec<TokenEffect>> {
    let act = instance.scope(scope_id)?;
    if !act.transactional {
        return None;
    }
    let subprocess = act.subprocess.clone()?;
    let parent_scope = act.parent?;
    let parent_act = instance.scope(parent_scope)?;
    let parent_defn = defn.resolve_scope(&parent_act.path)?;

    let mut effects = Vec::new();
    if let Some(host_token) = act.parent_token {
        let cancel_boundary = parent_defn
            .boundaries_attached_to(&subprocess)
            .into_iter()
            .find(|b| matches!(&b.kind, NodeKind::Boundary { event, .. } if *event == EventSpec::Cancel));
        effects.push(TokenEffect::InterruptActivity {
            host_token,
            boundary: cancel_boundary
                .map(|b| b.id.clone())
                .unwrap_or_else(|| subprocess.clone()),
        });
        if let Some(boundary) = cancel_boundary {
            effects.push(TokenEffect::SpawnAt {
                scope: parent_scope,
                node: boundary.id.clone(),
            });
        }
    }
    effects.push(TokenEffect::CompensationRequested {
        scope: scope_id,
        subprocess,
    });
    Some(effects)
}

// ─── Fault routing ────────────────────────────────────────────

/// What kind of thrown event is being routed through the scope chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrowKind {
    Error,
    Escalation,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ThrowResolution {
    Caught(Vec<TokenEffect>),
    Uncaught,
}

/// Route an error or escalation raised at `origin_node` in `origin_scope`.
///
/// Walks outward: boundary catches attached to the origin activity first
/// (exact reference matches before catch-alls), then matching
/// event-sub-process starts of the scope, then the enclosing scope with
/// the sub-process node as the activity. Uncaught at the root means the
/// caller terminates the instance (errors) or drops the throw
/// (escalations).
pub fn route_thrown(
    instance: &ProcessInstance,
    defn: &ProcessDefinition,
    kind: ThrowKind,
    origin_scope: Uuid,
    origin_node: &str,
    origin_token: Uuid,
    reference: Option<&str>,
) -> ThrowResolution {
    let mut scope_id = origin_scope;
    let mut activity = origin_node.to_string();
    let mut host_token = origin_token;

    loop {
        let Some(act) = instance.scope(scope_id) else {
            return ThrowResolution::Uncaught;
        };
        let Some(scope_defn) = defn.resolve_scope(&act.path) else {
            return ThrowResolution::Uncaught;
        };

        if let Some((boundary_id, cancel_activity)) =
            best_boundary_catch(scope_defn, &activity, kind, reference)
        {
            let spawn = TokenEffect::SpawnAt {
                scope: scope_id,
                node: boundary_id.clone(),
            };
            let effects = if cancel_activity {
                vec![
                    TokenEffect::InterruptActivity {
                        host_token,
                        boundary: boundary_id,
                    },
                    spawn,
                ]
            } else {
                vec![spawn]
            };
            return ThrowResolution::Caught(effects);
        }

        if let Some(effect) = event_subprocess_catch(scope_defn, scope_id, kind, reference) {
            return ThrowResolution::Caught(vec![effect]);
        }

        match (&act.subprocess, act.parent) {
            (Some(subprocess), Some(parent)) => {
                activity = subprocess.clone();
                host_token = act.parent_token.unwrap_or(host_token);
                scope_id = parent;
            }
            _ => return ThrowResolution::Uncaught,
        }
    }
}

/// Boundary catches on the activity, exact reference match first,
/// catch-all second.
fn best_boundary_catch(
    scope_defn: &ProcessDefinition,
    activity: &str,
    kind: ThrowKind,
    reference: Option<&str>,
) -> Option<(String, bool)> {
    let boundaries = scope_defn.boundaries_attached_to(activity);
    let candidate = |exact: bool| {
        boundaries.iter().find_map(|b| {
            let NodeKind::Boundary {
                event,
                cancel_activity,
                ..
            } = &b.kind
            else {
                return None;
            };
            let catch_ref = match (kind, event) {
                (ThrowKind::Error, EventSpec::Error { reference }) => reference.as_deref(),
                (ThrowKind::Escalation, EventSpec::Escalation { reference }) => {
                    reference.as_deref()
                }
                _ => return None,
            };
            let matches = if exact {
                reference.is_some() && catch_ref == reference
            } else {
                catch_ref.is_none()
            };
            matches.then(|| (b.id.clone(), *cancel_activity))
        })
    };
    candidate(true).or_else(|| candidate(false))
}

fn event_subprocess_catch(
    scope_defn: &ProcessDefinition,
    scope_id: Uuid,
    kind: ThrowKind,
    reference: Option<&str>,
) -> Option<TokenEffect> {
    for sp_node in scope_defn.event_subprocesses() {
        let NodeKind::SubProcess(sp) = &sp_node.kind else {
            continue;
        };
        for start in sp.definition.start_events() {
            let NodeKind::StartEvent {
                event,
                interrupting,
            } = &start.kind
            else {
                continue;
            };
            let catch_ref = match (kind, event) {
                (ThrowKind::Error, EventSpec::Error { reference }) => reference.as_deref(),
                (ThrowKind::Escalation, EventSpec::Escalation { reference }) => {
                    reference.as_deref()
                }
                _ => continue,
            };
            if catch_ref.is_none() || catch_ref == reference {
                return Some(TokenEffect::StartEventSubprocess {
                    scope: scope_id,
                    subprocess: sp_node.id.clone(),
                    start: start.id.clone(),
                    interrupting: *interrupting,
                });
            }
        }
    }
    None
}
