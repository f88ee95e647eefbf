//! Routing rules: outgoing flow selection, join conditions and the
//! inclusive-gateway lookahead

use crate::domain::condition::ExpressionEvaluator;
use crate::domain::flow_object::{FlowObject, FlowObjectCollection, NodeKind};
use crate::domain::sequence_flow::{ConnectingObjectCollection, SequenceFlow};
use crate::domain::token::TokenRegistry;
use crate::types::{FlowObjectId, SequenceFlowId, TokenId};
use crate::CoreError;
use serde_json::Value;
use std::collections::HashSet;

/// Pick the outgoing flows a node hands its token(s) to
///
/// The default flow is never evaluated. Remaining flows are evaluated in
/// declaration order; a flow without condition always matches. Exclusive
/// routing stops at the first match, parallel and inclusive gateways take
/// every match. Without any match the default flow is used, and without a
/// default flow selection fails.
pub fn select_outgoing<'a>(
    node: &FlowObject,
    flows: &'a ConnectingObjectCollection,
    evaluator: &dyn ExpressionEvaluator,
    process_data: &Value,
) -> Result<Vec<&'a SequenceFlow>, CoreError> {
    let outgoing = flows.outgoing(node.id());
    let take_all = node.kind().selects_all_matching();
    let mut selected = Vec::new();

    for flow in outgoing.iter().copied() {
        if node.default_flow() == Some(&flow.id) {
            continue;
        }
        let matches = match &flow.condition {
            Some(condition) => evaluator.evaluate(condition, process_data)?,
            None => true,
        };
        if matches {
            selected.push(flow);
            if !take_all {
                break;
            }
        }
    }

    if selected.is_empty() {
        if let Some(default) = node.default_flow().and_then(|id| flows.get(id)) {
            selected.push(default);
        }
    }

    if selected.is_empty() {
        return Err(CoreError::SequenceFlowNotSelected {
            flow_object: node.id().to_string(),
        });
    }

    Ok(selected)
}

/// For each incoming flow of `gateway`, the oldest queued token that arrived along it
fn tokens_per_incoming(
    gateway: &FlowObject,
    flows: &ConnectingObjectCollection,
    tokens: &TokenRegistry,
) -> Vec<(SequenceFlowId, Option<TokenId>)> {
    flows
        .incoming(gateway.id())
        .into_iter()
        .map(|flow| {
            let token = gateway.tokens().iter().copied().find(|&id| {
                tokens
                    .get(id)
                    .map_or(false, |token| token.arrived_via.as_ref() == Some(&flow.id))
            });
            (flow.id.clone(), token)
        })
        .collect()
}

/// Tokens a parallel join consumes when it fires, or `None` while a branch is missing
///
/// Exactly one token per incoming flow is consumed; extra tokens on the same
/// flow stay queued for a later activation.
pub fn parallel_join(
    gateway: &FlowObject,
    flows: &ConnectingObjectCollection,
    tokens: &TokenRegistry,
) -> Option<Vec<TokenId>> {
    tokens_per_incoming(gateway, flows, tokens)
        .into_iter()
        .map(|(_, token)| token)
        .collect()
}

/// Tokens an inclusive join consumes once every incoming flow carries one
pub fn inclusive_join_complete(
    gateway: &FlowObject,
    flows: &ConnectingObjectCollection,
    tokens: &TokenRegistry,
) -> Option<Vec<TokenId>> {
    parallel_join(gateway, flows, tokens)
}

/// Tokens an inclusive join consumes when no further token can reach it
///
/// Fires with whatever arrived (one token per incoming flow that carries
/// one) as long as no live token elsewhere in the instance can still travel
/// to the gateway.
pub fn inclusive_join_settled(
    gateway: &FlowObject,
    objects: &FlowObjectCollection,
    flows: &ConnectingObjectCollection,
    tokens: &TokenRegistry,
) -> Option<Vec<TokenId>> {
    if !gateway.has_token() {
        return None;
    }
    let waiting_elsewhere = tokens
        .iter()
        .filter(|token| !gateway.tokens().contains(&token.id))
        .any(|token| can_reach(&token.current, gateway.id(), objects, flows));
    if waiting_elsewhere {
        return None;
    }

    let consumed: Vec<TokenId> = tokens_per_incoming(gateway, flows, tokens)
        .into_iter()
        .filter_map(|(_, token)| token)
        .collect();
    if consumed.is_empty() {
        // Tokens that arrived without a flow (none in a validated definition)
        return gateway.tokens().first().map(|&token| vec![token]);
    }
    Some(consumed)
}

/// Whether a token resting on `from` can travel to `target` over the static graph
///
/// Activities also lead to the boundary events attached to them. The search
/// keeps a visited set, so cycles in the graph terminate.
pub fn can_reach(
    from: &FlowObjectId,
    target: &FlowObjectId,
    objects: &FlowObjectCollection,
    flows: &ConnectingObjectCollection,
) -> bool {
    let mut visited: HashSet<&FlowObjectId> = HashSet::new();
    let mut stack: Vec<&FlowObjectId> = vec![from];

    while let Some(node) = stack.pop() {
        if !visited.insert(node) {
            continue;
        }
        for flow in flows.outgoing(node) {
            if &flow.destination == target {
                return true;
            }
            stack.push(&flow.destination);
        }
        for boundary in objects.iter() {
            if let NodeKind::BoundaryEvent { attached_to, .. } = boundary.kind() {
                if attached_to == node {
                    stack.push(boundary.id());
                }
            }
        }
    }

    false
}
