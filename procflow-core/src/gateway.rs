use crate::definition::{
    FlowNode, GatewayDirection, GatewayKind, NodeKind, ProcessDefinition, SequenceFlow,
};
use crate::error::GatewayError;
use crate::eval::Evaluator;
use crate::types::{is_truthy, VariableMap};
use tracing::debug;

/// What the engine should do with a token arriving at a gateway.
#[derive(Clone, Debug, PartialEq)]
pub enum GatewayDecision {
    /// Move the arriving token along these flows.
    PassThrough(Vec<String>),
    /// Consume the arriving token and spawn one sibling per flow.
    Fork(Vec<String>),
    /// Converging gateway: the caller registers the arrival in the join
    /// accumulator and absorbs the token until the barrier is satisfied.
    AwaitJoin,
}

/// Guard-evaluation context for a decision.
pub struct GuardContext<'a> {
    pub evaluator: &'a dyn Evaluator,
    pub variables: &'a VariableMap,
}

impl<'a> GuardContext<'a> {
    fn guard_satisfied(&self, flow: &SequenceFlow) -> Result<bool, GatewayError> {
        match &flow.guard {
            None => Ok(true),
            Some(guard) => {
                let value = self.evaluator.evaluate(guard, self.variables)?;
                Ok(is_truthy(&value))
            }
        }
    }
}

/// Decide how a gateway treats an arriving token.
///
/// Pure: no instance state is touched. Join bookkeeping belongs to the
/// caller; this function only classifies the arrival.
pub fn decide(
    defn: &ProcessDefinition,
    node: &FlowNode,
    ctx: &GuardContext<'_>,
) -> Result<GatewayDecision, GatewayError> {
    let NodeKind::Gateway {
        gateway,
        direction,
        default_flow,
    } = &node.kind
    else {
        return Ok(GatewayDecision::PassThrough(node.outgoing.clone()));
    };

    match (gateway, direction) {
        (GatewayKind::Exclusive, _) => {
            // First satisfied guard wins, in declaration order; the default
            // flow is only considered after every guarded flow failed.
            for flow in defn.outgoing(&node.id) {
                if is_default(flow, default_flow) {
                    continue;
                }
                if ctx.guard_satisfied(flow)? {
                    debug!(gateway = %node.id, flow = %flow.id, "exclusive branch taken");
                    return Ok(GatewayDecision::PassThrough(vec![flow.id.clone()]));
                }
            }
            match pick_default(defn, node, default_flow) {
                Some(flow_id) => {
                    debug!(gateway = %node.id, flow = %flow_id, "exclusive default taken");
                    Ok(GatewayDecision::PassThrough(vec![flow_id]))
                }
                None => Err(GatewayError::NoApplicableFlow {
                    gateway: node.id.clone(),
                }),
            }
        }

        // Parallel gateways ignore guards entirely.
        (GatewayKind::Parallel, GatewayDirection::Diverging) => {
            Ok(GatewayDecision::Fork(node.outgoing.clone()))
        }
        (GatewayKind::Parallel, GatewayDirection::Converging) => Ok(GatewayDecision::AwaitJoin),

        (GatewayKind::Inclusive, GatewayDirection::Diverging) => {
            let mut taken = Vec::new();
            for flow in defn.outgoing(&node.id) {
                if is_default(flow, default_flow) {
                    continue;
                }
                if ctx.guard_satisfied(flow)? {
                    taken.push(flow.id.clone());
                }
            }
            if taken.is_empty() {
                match pick_default(defn, node, default_flow) {
                    Some(flow_id) => taken.push(flow_id),
                    None => {
                        return Err(GatewayError::NoApplicableFlow {
                            gateway: node.id.clone(),
                        })
                    }
                }
            }
            debug!(gateway = %node.id, flows = ?taken, "inclusive branches taken");
            if taken.len() == 1 {
                Ok(GatewayDecision::PassThrough(taken))
            } else {
                Ok(GatewayDecision::Fork(taken))
            }
        }
        (GatewayKind::Inclusive, GatewayDirection::Converging) => Ok(GatewayDecision::AwaitJoin),
    }
}

fn is_default(flow: &SequenceFlow, default_flow: &Option<String>) -> bool {
    flow.is_default || default_flow.as_deref() == Some(flow.id.as_str())
}

fn pick_default(
    defn: &ProcessDefinition,
    node: &FlowNode,
    default_flow: &Option<String>,
) -> Option<String> {
    defn.outgoing(&node.id)
        .into_iter()
        .find(|f| is_default(f, default_flow))
        .map(|f| f.id.clone())
}
