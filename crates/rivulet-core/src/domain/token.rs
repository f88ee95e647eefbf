//! Tokens mark the current execution positions of a process instance

use crate::types::{FlowObjectId, SequenceFlowId, TokenId};
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A unit of control flow resting on exactly one flow object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    /// Identifier, unique within the owning process instance
    pub id: TokenId,

    /// Flow object the token is attached to
    pub current: FlowObjectId,

    /// Flow object the token left to reach `current`
    pub previous: Option<FlowObjectId>,

    /// Sequence flow the token travelled along, if any
    pub arrived_via: Option<SequenceFlowId>,
}

impl Token {
    /// Move the token along `via` to `destination`, remembering where it came from
    pub fn flow(&mut self, destination: FlowObjectId, via: Option<SequenceFlowId>) {
        let previous = std::mem::replace(&mut self.current, destination);
        self.previous = Some(previous);
        self.arrived_via = via;
    }
}

/// Registry of every live token in a process instance
#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    tokens: BTreeMap<TokenId, Token>,
    next_id: u64,
}

impl TokenRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from persisted tokens
    pub fn restore(tokens: Vec<Token>, next_id: u64) -> Self {
        let next_id = tokens
            .iter()
            .map(|token| token.id.0 + 1)
            .max()
            .unwrap_or(0)
            .max(next_id);
        Self {
            tokens: tokens.into_iter().map(|token| (token.id, token)).collect(),
            next_id,
        }
    }

    /// Create a new token resting on `at`
    pub fn issue(
        &mut self,
        at: FlowObjectId,
        previous: Option<FlowObjectId>,
        via: Option<SequenceFlowId>,
    ) -> TokenId {
        let id = TokenId(self.next_id);
        self.next_id += 1;
        self.tokens.insert(
            id,
            Token {
                id,
                current: at,
                previous,
                arrived_via: via,
            },
        );
        id
    }

    /// Look up a token
    #[inline]
    pub fn get(&self, id: TokenId) -> Option<&Token> {
        self.tokens.get(&id)
    }

    /// Move a token to `destination`; an unknown token is a logic error
    pub fn flow(
        &mut self,
        id: TokenId,
        destination: FlowObjectId,
        via: Option<SequenceFlowId>,
    ) -> Result<(), CoreError> {
        let token = self
            .tokens
            .get_mut(&id)
            .ok_or_else(|| CoreError::Logic(format!("{} is not a live token", id)))?;
        token.flow(destination, via);
        Ok(())
    }

    /// Destroy a token
    pub fn remove(&mut self, id: TokenId) -> Option<Token> {
        self.tokens.remove(&id)
    }

    /// All live tokens in id order
    pub fn iter(&self) -> impl Iterator<Item = &Token> {
        self.tokens.values()
    }

    /// Number of live tokens
    #[inline]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no token is alive
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Identifier the next issued token will receive
    #[inline]
    pub fn next_id(&self) -> u64 {
        self.next_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_assigns_sequential_ids() {
        let mut registry = TokenRegistry::new();
        let a = registry.issue(FlowObjectId::new("start"), None, None);
        let b = registry.issue(FlowObjectId::new("start"), None, None);

        assert_eq!(a, TokenId(0));
        assert_eq!(b, TokenId(1));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_flow_records_previous_location() {
        let mut registry = TokenRegistry::new();
        let id = registry.issue(FlowObjectId::new("start"), None, None);

        registry
            .flow(id, FlowObjectId::new("task"), Some(SequenceFlowId::new("f1")))
            .unwrap();

        let token = registry.get(id).unwrap();
        assert_eq!(token.current, FlowObjectId::new("task"));
        assert_eq!(token.previous, Some(FlowObjectId::new("start")));
        assert_eq!(token.arrived_via, Some(SequenceFlowId::new("f1")));
    }

    #[test]
    fn test_flow_of_unknown_token_is_a_logic_error() {
        let mut registry = TokenRegistry::new();
        registry.issue(FlowObjectId::new("start"), None, None);

        let result = registry.flow(TokenId(99), FlowObjectId::new("x"), None);
        assert!(matches!(result, Err(CoreError::Logic(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_restore_never_reuses_ids() {
        let mut registry = TokenRegistry::new();
        let first = registry.issue(FlowObjectId::new("a"), None, None);
        let second = registry.issue(FlowObjectId::new("b"), None, None);
        registry.remove(first);

        let tokens: Vec<Token> = registry.iter().cloned().collect();
        let mut restored = TokenRegistry::restore(tokens, 0);
        assert_eq!(restored.next_id(), second.0 + 1);

        let third = restored.issue(FlowObjectId::new("c"), None, None);
        assert_eq!(third, TokenId(2));
    }
}
