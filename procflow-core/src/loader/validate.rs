use super::dto::{EventDto, FlowDto, NodeDto, NodeKindDto};
use crate::error::{DefinitionError, DefinitionErrorKind};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};

/// Validate a parsed graph before building the immutable definition.
/// Returns every violation found, not only the first.
pub fn validate(nodes: &[NodeDto], flows: &[FlowDto], top_level: bool) -> Vec<DefinitionError> {
    let mut errors = Vec::new();
    validate_scope(nodes, flows, top_level, &mut errors);
    errors
}

fn validate_scope(
    nodes: &[NodeDto],
    flows: &[FlowDto],
    top_level: bool,
    errors: &mut Vec<DefinitionError>,
) {
    let mut node_map: HashMap<&str, &NodeDto> = HashMap::new();

    // Node ids must be unique within the scope.
    for node in nodes {
        if node_map.insert(&node.id, node).is_some() {
            errors.push(DefinitionError::new(
                DefinitionErrorKind::MalformedCardinality,
                &node.id,
                "duplicate node id",
            ));
        }
    }

    let mut seen_flows: HashSet<&str> = HashSet::new();
    for flow in flows {
        if !seen_flows.insert(&flow.id) {
            errors.push(DefinitionError::new(
                DefinitionErrorKind::MalformedCardinality,
                &flow.id,
                "duplicate flow id",
            ));
        }
        for (role, reference) in [("source", &flow.source), ("target", &flow.target)] {
            if !node_map.contains_key(reference.as_str()) {
                errors.push(DefinitionError::new(
                    DefinitionErrorKind::DanglingReference,
                    &flow.id,
                    format!("{role} '{reference}' does not exist"),
                ));
            }
        }
    }

    let outgoing_of = |id: &str| -> Vec<&FlowDto> { flows.iter().filter(|f| f.source == id).collect() };
    let incoming_of = |id: &str| -> Vec<&FlowDto> { flows.iter().filter(|f| f.target == id).collect() };

    for node in nodes {
        cross_check_lists(node, flows, errors);
        let incoming = incoming_of(&node.id);
        let outgoing = outgoing_of(&node.id);

        match &node.kind {
            NodeKindDto::Start { .. } => {
                if !incoming.is_empty() {
                    errors.push(DefinitionError::new(
                        DefinitionErrorKind::MalformedCardinality,
                        &node.id,
                        "start event must have no incoming flows",
                    ));
                }
            }
            NodeKindDto::End { .. } => {
                if !outgoing.is_empty() {
                    errors.push(DefinitionError::new(
                        DefinitionErrorKind::MalformedCardinality,
                        &node.id,
                        "end event must have no outgoing flows",
                    ));
                }
            }
            NodeKindDto::Boundary { attached_to, .. } => {
                if !incoming.is_empty() {
                    errors.push(DefinitionError::new(
                        DefinitionErrorKind::MalformedCardinality,
                        &node.id,
                        "boundary event must have no incoming flows",
                    ));
                }
                match node_map.get(attached_to.as_str()) {
                    Some(host) if is_activity(host) => {}
                    Some(_) => errors.push(DefinitionError::new(
                        DefinitionErrorKind::DanglingReference,
                        &node.id,
                        format!("attached_to '{attached_to}' is not an activity"),
                    )),
                    None => errors.push(DefinitionError::new(
                        DefinitionErrorKind::DanglingReference,
                        &node.id,
                        format!("attached_to '{attached_to}' does not exist"),
                    )),
                }
            }
            NodeKindDto::ExclusiveGateway { default_flow }
            | NodeKindDto::InclusiveGateway { default_flow, .. } => {
                check_defaults(node, default_flow, &outgoing, errors);
            }
            NodeKindDto::SubProcess {
                for_compensation,
                triggered_by_event,
                nodes: sub_nodes,
                flows: sub_flows,
                ..
            } => {
                if (*for_compensation || *triggered_by_event)
                    && !(incoming.is_empty() && outgoing.is_empty())
                {
                    errors.push(DefinitionError::new(
                        DefinitionErrorKind::MalformedCardinality,
                        &node.id,
                        "event-triggered and compensation sub-processes take no sequence flows",
                    ));
                }
                let sub_has_plain_start = sub_nodes.iter().any(|n| {
                    matches!(
                        &n.kind,
                        NodeKindDto::Start {
                            event: EventDto::None,
                            ..
                        }
                    )
                });
                let sub_has_event_start = sub_nodes.iter().any(|n| {
                    matches!(&n.kind, NodeKindDto::Start { event, .. } if !matches!(event, EventDto::None))
                });
                if *triggered_by_event {
                    if !sub_has_event_start {
                        errors.push(DefinitionError::new(
                            DefinitionErrorKind::MalformedCardinality,
                            &node.id,
                            "event sub-process needs a start event with an event definition",
                        ));
                    }
                } else if !sub_has_plain_start {
                    errors.push(DefinitionError::new(
                        DefinitionErrorKind::MalformedCardinality,
                        &node.id,
                        "sub-process needs a plain start event",
                    ));
                }
                validate_scope(sub_nodes, sub_flows, false, errors);
            }
            _ => {}
        }
    }

    // Default flows may never be guarded, wherever they are marked.
    for flow in flows {
        if flow.is_default && flow.guard.is_some() {
            errors.push(DefinitionError::new(
                DefinitionErrorKind::NoDefaultFlow,
                &flow.id,
                "default flow must not carry a guard",
            ));
        }
    }

    // Link throws need a matching link catch in the same scope.
    check_link_pairs(nodes, errors);

    if top_level {
        let has_plain_start = nodes.iter().any(|n| {
            matches!(
                &n.kind,
                NodeKindDto::Start {
                    event: EventDto::None,
                    ..
                }
            )
        });
        if !has_plain_start {
            errors.push(DefinitionError::new(
                DefinitionErrorKind::MalformedCardinality,
                "<process>",
                "executable process needs a plain start event",
            ));
        }
    }

    check_reachability(nodes, flows, errors);
}

/// Explicit incoming/outgoing lists must agree with the edge list
/// (symmetric cross-check).
fn cross_check_lists(node: &NodeDto, flows: &[FlowDto], errors: &mut Vec<DefinitionError>) {
    let checks = [
        ("incoming", &node.incoming, true),
        ("outgoing", &node.outgoing, false),
    ];
    for (label, declared, is_incoming) in checks {
        let Some(declared) = declared else { continue };
        let actual: Vec<&str> = flows
            .iter()
            .filter(|f| {
                if is_incoming {
                    f.target == node.id
                } else {
                    f.source == node.id
                }
            })
            .map(|f| f.id.as_str())
            .collect();
        for id in declared {
            if !flows.iter().any(|f| &f.id == id) {
                errors.push(DefinitionError::new(
                    DefinitionErrorKind::DanglingReference,
                    &node.id,
                    format!("{label} list references unknown flow '{id}'"),
                ));
            } else if !actual.contains(&id.as_str()) {
                errors.push(DefinitionError::new(
                    DefinitionErrorKind::MalformedCardinality,
                    &node.id,
                    format!("{label} list names flow '{id}' which does not touch this node"),
                ));
            }
        }
        for id in &actual {
            if !declared.iter().any(|d| d == id) {
                errors.push(DefinitionError::new(
                    DefinitionErrorKind::MalformedCardinality,
                    &node.id,
                    format!("flow '{id}' missing from declared {label} list"),
                ));
            }
        }
    }
}

fn check_defaults(
    node: &NodeDto,
    default_flow: &Option<String>,
    outgoing: &[&FlowDto],
    errors: &mut Vec<DefinitionError>,
) {
    if let Some(default_id) = default_flow {
        match outgoing.iter().find(|f| &f.id == default_id) {
            None => errors.push(DefinitionError::new(
                DefinitionErrorKind::DanglingReference,
                &node.id,
                format!("default flow '{default_id}' is not an outgoing flow of this gateway"),
            )),
            Some(flow) if flow.guard.is_some() => errors.push(DefinitionError::new(
                DefinitionErrorKind::NoDefaultFlow,
                &node.id,
                format!("default flow '{default_id}' must not carry a guard"),
            )),
            Some(_) => {}
        }
    }
    let mut defaults = outgoing.iter().filter(|f| f.is_default).count();
    if let Some(default_id) = default_flow {
        if !outgoing.iter().any(|f| &f.id == default_id && f.is_default) {
            defaults += 1;
        }
    }
    if defaults > 1 {
        errors.push(DefinitionError::new(
            DefinitionErrorKind::NoDefaultFlow,
            &node.id,
            "gateway declares more than one default flow",
        ));
    }
}

fn check_link_pairs(nodes: &[NodeDto], errors: &mut Vec<DefinitionError>) {
    for node in nodes {
        let NodeKindDto::Throw {
            event: EventDto::Link { reference },
        } = &node.kind
        else {
            continue;
        };
        let paired = nodes.iter().any(|n| {
            matches!(
                &n.kind,
                NodeKindDto::Catch {
                    event: EventDto::Link { reference: catch_ref },
                } if catch_ref == reference
            )
        });
        if !paired {
            errors.push(DefinitionError::new(
                DefinitionErrorKind::DanglingReference,
                &node.id,
                format!("link throw '{reference}' has no matching link catch in this scope"),
            ));
        }
    }
}

/// Every node must be reachable from some start event of its scope.
/// Boundary events are reachable through their host; event-triggered and
/// compensation sub-processes are roots of their own.
fn check_reachability(nodes: &[NodeDto], flows: &[FlowDto], errors: &mut Vec<DefinitionError>) {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for node in nodes {
        index.entry(&node.id).or_insert_with(|| graph.add_node(&node.id));
    }
    for flow in flows {
        if let (Some(&a), Some(&b)) = (index.get(flow.source.as_str()), index.get(flow.target.as_str())) {
            graph.add_edge(a, b, ());
        }
    }
    for node in nodes {
        if let NodeKindDto::Boundary { attached_to, .. } = &node.kind {
            if let (Some(&host), Some(&boundary)) =
                (index.get(attached_to.as_str()), index.get(node.id.as_str()))
            {
                graph.add_edge(host, boundary, ());
            }
        }
        // link catches are entered through their paired throw
        if let NodeKindDto::Throw {
            event: EventDto::Link { reference },
        } = &node.kind
        {
            for catch in nodes.iter().filter(|n| {
                matches!(
                    &n.kind,
                    NodeKindDto::Catch {
                        event: EventDto::Link { reference: catch_ref },
                    } if catch_ref == reference
                )
            }) {
                if let (Some(&from), Some(&to)) =
                    (index.get(node.id.as_str()), index.get(catch.id.as_str()))
                {
                    graph.add_edge(from, to, ());
                }
            }
        }
    }

    let roots: Vec<NodeIndex> = nodes
        .iter()
        .filter(|n| match &n.kind {
            NodeKindDto::Start { .. } => true,
            NodeKindDto::SubProcess {
                for_compensation,
                triggered_by_event,
                ..
            } => *for_compensation || *triggered_by_event,
            _ => false,
        })
        .filter_map(|n| index.get(n.id.as_str()).copied())
        .collect();

    let mut visited: HashSet<NodeIndex> = HashSet::new();
    for root in roots {
        let mut dfs = Dfs::new(&graph, root);
        while let Some(nx) = dfs.next(&graph) {
            visited.insert(nx);
        }
    }

    for node in nodes {
        if let Some(idx) = index.get(node.id.as_str()) {
            if !visited.contains(idx) {
                errors.push(DefinitionError::new(
                    DefinitionErrorKind::OrphanNode,
                    &node.id,
                    "unreachable from every start event of its scope",
                ));
            }
        }
    }
}

fn is_activity(node: &NodeDto) -> bool {
    matches!(
        node.kind,
        NodeKindDto::Task { .. } | NodeKindDto::SubProcess { .. }
    )
}
