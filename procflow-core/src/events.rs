use crate::types::{Timestamp, TriggerKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Runtime events: the durable audit trail for every process instance.
/// Appended through the `Persistor` alongside state checkpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RuntimeEvent {
    InstanceStarted {
        instance_id: Uuid,
        definition_id: String,
        definition_version: [u8; 32],
    },
    TokenSpawned {
        token_id: Uuid,
        node: String,
        scope: Uuid,
        parent: Option<Uuid>,
    },
    TokenAdvanced {
        token_id: Uuid,
        flow: String,
        to: String,
    },
    TokenConsumed {
        token_id: Uuid,
        node: String,
    },
    ActivityWaiting {
        token_id: Uuid,
        activity: String,
    },
    ActivityCompleted {
        token_id: Uuid,
        activity: String,
    },
    ScriptEvaluated {
        node: String,
        result_var: Option<String>,
    },
    GatewayTaken {
        gateway: String,
        flows: Vec<String>,
    },
    Forked {
        gateway: String,
        children: Vec<Uuid>,
    },
    JoinArrived {
        gateway: String,
        flow: String,
        token_id: Uuid,
    },
    JoinReleased {
        gateway: String,
        successors: Vec<Uuid>,
    },
    CatchArmed {
        node: String,
        token_id: Uuid,
        due: Option<Timestamp>,
    },
    BoundaryArmed {
        boundary: String,
        host: String,
    },
    TriggerDelivered {
        kind: TriggerKind,
        reference: Option<String>,
    },
    BoundaryFired {
        boundary: String,
        interrupting: bool,
    },
    ScopeEntered {
        scope: Uuid,
        subprocess: String,
    },
    ScopeCompleted {
        scope: Uuid,
    },
    ScopeCancelled {
        scope: Uuid,
        reason: String,
    },
    CompensationRequested {
        scope: Uuid,
        subprocess: String,
    },
    FaultRaised {
        node: String,
        reference: Option<String>,
        message: String,
    },
    FaultCaught {
        catcher: String,
    },
    EscalationDropped {
        reference: Option<String>,
    },
    Suspended {
        awaiting: Vec<String>,
    },
    Completed {
        at: Timestamp,
    },
    Terminated {
        at: Timestamp,
        fault: Option<String>,
    },
}
