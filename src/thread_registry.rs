//! The thread registry: opaque-UUID ↔ private call-chain mapping (§4.4).
//!
//! Implemented as an immutable-snapshot tree: every [`extend_chain`] call
//! allocates a brand-new UUID for the extended chain rather than mutating
//! the UUID in place, so a handler can never correlate the UUID it was
//! handed with the UUID delivered to whatever it forwards to (§4.4
//! invariant). Parent/child links track which chains were spawned by which,
//! so that responding prunes exactly the subtree beneath it (§8 invariant
//! 3) without disturbing sibling or ancestor chains.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ThreadRegistryError, ThreadRegistryResult};

#[derive(Default)]
pub struct ThreadRegistry {
    chains: HashMap<String, Vec<String>>,
    parent_of: HashMap<String, String>,
    children_of: HashMap<String, Vec<String>>,
    root_of: HashMap<String, String>,
    /// One cancellation token per live chain UUID, cancelled when the chain
    /// is pruned or terminated while a handler may still be in flight on it
    /// (§5: "pruning from `.respond()` also cancels any in-flight sub-chain
    /// handlers via the cancellation token").
    tokens: HashMap<String, CancellationToken>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new call chain `[sender, initial_target]` with a fresh UUID.
    pub fn start_chain(&mut self, sender: &str, initial_target: &str) -> String {
        let uuid = Uuid::new_v4().to_string();
        self.chains
            .insert(uuid.clone(), vec![sender.to_string(), initial_target.to_string()]);
        self.root_of.insert(uuid.clone(), uuid.clone());
        self.tokens.insert(uuid.clone(), CancellationToken::new());
        uuid
    }

    /// The cancellation token for `uuid`'s in-flight dispatch, if any. The
    /// pump clones this into the handler's [`crate::handler::HandlerMetadata`]
    /// before spawning it.
    pub fn token_for(&self, uuid: &str) -> Option<CancellationToken> {
        self.tokens.get(uuid).cloned()
    }

    /// The root ancestor UUID of `uuid`'s logical conversation, stable
    /// across every UUID regeneration along the chain. Used to key
    /// per-conversation token budgets that must survive opacity rotation.
    pub fn root_of(&self, uuid: &str) -> Option<&str> {
        self.root_of.get(uuid).map(|s| s.as_str())
    }

    /// Extend the chain for `uuid` with `next_listener`, returning a new,
    /// never-before-issued UUID for the extended chain.
    pub fn extend_chain(&mut self, uuid: &str, next_listener: &str) -> ThreadRegistryResult<String> {
        let mut chain = self
            .chains
            .get(uuid)
            .cloned()
            .ok_or_else(|| ThreadRegistryError::NotFound(uuid.to_string()))?;
        chain.push(next_listener.to_string());

        let new_uuid = Uuid::new_v4().to_string();
        self.chains.insert(new_uuid.clone(), chain);
        self.parent_of.insert(new_uuid.clone(), uuid.to_string());
        self.children_of
            .entry(uuid.to_string())
            .or_default()
            .push(new_uuid.clone());
        let root = self.root_of.get(uuid).cloned().unwrap_or_else(|| uuid.to_string());
        self.root_of.insert(new_uuid.clone(), root);
        self.tokens.insert(new_uuid.clone(), CancellationToken::new());
        Ok(new_uuid)
    }

    /// Pop the tail of `uuid`'s chain and route to the new tail (the
    /// caller). Any chains spawned below `uuid` (sub-calls it made before
    /// responding) are pruned first. Returns the caller's thread UUID and
    /// name.
    pub fn prune_for_response(&mut self, uuid: &str) -> ThreadRegistryResult<(String, String)> {
        let chain = self
            .chains
            .get(uuid)
            .cloned()
            .ok_or_else(|| ThreadRegistryError::NotFound(uuid.to_string()))?;
        if chain.is_empty() {
            return Err(ThreadRegistryError::EmptyChain(uuid.to_string()));
        }

        self.prune_subtree(uuid);
        let parent = self.parent_of.remove(uuid);
        self.chains.remove(uuid);
        self.root_of.remove(uuid);
        // The handler that produced this response has already run to
        // completion; nothing to cancel, just drop the bookkeeping.
        self.tokens.remove(uuid);
        self.detach_from_parent(uuid);

        match parent {
            Some(parent_uuid) => {
                let caller_name = self
                    .chains
                    .get(&parent_uuid)
                    .and_then(|c| c.last())
                    .cloned()
                    .unwrap_or_default();
                Ok((parent_uuid, caller_name))
            }
            None => {
                let mut remaining = chain;
                remaining.pop();
                let caller_name = remaining.last().cloned().unwrap_or_default();
                Ok((uuid.to_string(), caller_name))
            }
        }
    }

    /// Delete this UUID's own entry and everything beneath it (§4.3: "chain
    /// terminates for this branch ... if the chain becomes empty, the
    /// entry is deleted").
    pub fn terminate(&mut self, uuid: &str) {
        self.prune_subtree(uuid);
        if let Some(token) = self.tokens.remove(uuid) {
            token.cancel();
        }
        self.chains.remove(uuid);
        self.parent_of.remove(uuid);
        self.root_of.remove(uuid);
        self.detach_from_parent(uuid);
    }

    /// Delete every descendant chain rooted at `uuid` (not `uuid` itself),
    /// cancelling each descendant's token so any in-flight handler spawned
    /// on it is torn down rather than left running unsupervised.
    pub fn prune_subtree(&mut self, uuid: &str) {
        let children = self.children_of.remove(uuid).unwrap_or_default();
        for child in children {
            self.prune_subtree(&child);
            if let Some(token) = self.tokens.remove(&child) {
                token.cancel();
            }
            self.chains.remove(&child);
            self.parent_of.remove(&child);
            self.root_of.remove(&child);
        }
    }

    fn detach_from_parent(&mut self, uuid: &str) {
        if let Some(parent) = self.parent_of.get(uuid).cloned() {
            if let Some(siblings) = self.children_of.get_mut(&parent) {
                siblings.retain(|c| c != uuid);
            }
        }
        for siblings in self.children_of.values_mut() {
            siblings.retain(|c| c != uuid);
        }
    }

    pub fn lookup(&self, uuid: &str) -> Option<&[String]> {
        self.chains.get(uuid).map(|c| c.as_slice())
    }

    pub fn chain_len(&self, uuid: &str) -> Option<usize> {
        self.chains.get(uuid).map(|c| c.len())
    }

    pub fn count(&self) -> usize {
        self.chains.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_chain_creates_two_element_chain() {
        let mut reg = ThreadRegistry::new();
        let uuid = reg.start_chain("console", "greeter");
        assert_eq!(reg.lookup(&uuid), Some(&["console".to_string(), "greeter".to_string()][..]));
    }

    #[test]
    fn extend_chain_allocates_fresh_uuid() {
        let mut reg = ThreadRegistry::new();
        let u0 = reg.start_chain("console", "greeter");
        let u1 = reg.extend_chain(&u0, "shouter").unwrap();
        assert_ne!(u0, u1);
        assert_eq!(
            reg.lookup(&u1),
            Some(&["console".to_string(), "greeter".to_string(), "shouter".to_string()][..])
        );
    }

    #[test]
    fn extend_chain_never_reuses_a_uuid_for_the_same_chain_text() {
        let mut reg = ThreadRegistry::new();
        let u0 = reg.start_chain("console", "greeter");
        let u1 = reg.extend_chain(&u0, "shouter").unwrap();
        reg.prune_for_response(&u1).unwrap();
        // same logical chain text constructed again from a fresh root
        let u0b = reg.start_chain("console", "greeter");
        let u1b = reg.extend_chain(&u0b, "shouter").unwrap();
        assert_ne!(u1, u1b);
    }

    #[test]
    fn prune_for_response_pops_tail_and_returns_caller() {
        let mut reg = ThreadRegistry::new();
        let u0 = reg.start_chain("console", "greeter");
        let u1 = reg.extend_chain(&u0, "shouter").unwrap();

        let (caller_uuid, caller_name) = reg.prune_for_response(&u1).unwrap();
        assert_eq!(caller_uuid, u0);
        assert_eq!(caller_name, "greeter");
        assert!(reg.lookup(&u1).is_none());
        assert!(reg.lookup(&u0).is_some());
    }

    #[test]
    fn prune_for_response_deletes_subchains_below_responder() {
        let mut reg = ThreadRegistry::new();
        let u0 = reg.start_chain("console", "greeter");
        let u1 = reg.extend_chain(&u0, "shouter").unwrap();
        let u2 = reg.extend_chain(&u1, "logger").unwrap();

        reg.prune_for_response(&u1).unwrap();
        assert!(reg.lookup(&u2).is_none());
        assert!(reg.lookup(&u1).is_none());
        assert!(reg.lookup(&u0).is_some());
    }

    #[test]
    fn terminate_removes_entry_and_descendants() {
        let mut reg = ThreadRegistry::new();
        let u0 = reg.start_chain("console", "greeter");
        let u1 = reg.extend_chain(&u0, "shouter").unwrap();

        reg.terminate(&u0);
        assert!(reg.lookup(&u0).is_none());
        assert!(reg.lookup(&u1).is_none());
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn root_of_is_stable_across_chain_extension() {
        let mut reg = ThreadRegistry::new();
        let u0 = reg.start_chain("console", "greeter");
        let u1 = reg.extend_chain(&u0, "shouter").unwrap();
        let u2 = reg.extend_chain(&u1, "logger").unwrap();
        assert_eq!(reg.root_of(&u0), Some(u0.as_str()));
        assert_eq!(reg.root_of(&u1), Some(u0.as_str()));
        assert_eq!(reg.root_of(&u2), Some(u0.as_str()));
    }

    #[test]
    fn root_level_response_pops_to_origin_sender() {
        let mut reg = ThreadRegistry::new();
        let u0 = reg.start_chain("console", "greeter");
        let (uuid, caller_name) = reg.prune_for_response(&u0).unwrap();
        assert_eq!(uuid, u0);
        assert_eq!(caller_name, "console");
    }

    #[test]
    fn start_chain_and_extend_chain_each_issue_a_live_token() {
        let mut reg = ThreadRegistry::new();
        let u0 = reg.start_chain("console", "greeter");
        let u1 = reg.extend_chain(&u0, "shouter").unwrap();
        assert!(!reg.token_for(&u0).unwrap().is_cancelled());
        assert!(!reg.token_for(&u1).unwrap().is_cancelled());
    }

    #[test]
    fn prune_for_response_deletes_subchain_tokens_but_cancels_them() {
        let mut reg = ThreadRegistry::new();
        let u0 = reg.start_chain("console", "greeter");
        let u1 = reg.extend_chain(&u0, "shouter").unwrap();
        let u2 = reg.extend_chain(&u1, "logger").unwrap();
        let sub_token = reg.token_for(&u2).unwrap();

        reg.prune_for_response(&u1).unwrap();
        assert!(sub_token.is_cancelled());
        assert!(reg.token_for(&u2).is_none());
        assert!(reg.token_for(&u1).is_none());
        assert!(reg.token_for(&u0).is_some());
    }

    #[test]
    fn terminate_cancels_own_token_and_every_descendant() {
        let mut reg = ThreadRegistry::new();
        let u0 = reg.start_chain("console", "greeter");
        let u1 = reg.extend_chain(&u0, "shouter").unwrap();
        let root_token = reg.token_for(&u0).unwrap();
        let child_token = reg.token_for(&u1).unwrap();

        reg.terminate(&u0);
        assert!(root_token.is_cancelled());
        assert!(child_token.is_cancelled());
        assert!(reg.token_for(&u0).is_none());
        assert!(reg.token_for(&u1).is_none());
    }
}
