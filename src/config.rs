//! The configuration surface (§6): scheduling policy, meta-request access,
//! handler timeout default, and token budget default. A plain
//! `serde`-deserializable struct — reading it from a file, env var, or CLI
//! flag is the embedding binary's job (out of scope, §1); this crate only
//! consumes the already-parsed value.

use serde::{Deserialize, Serialize};

/// Breadth-first (round-robin, default) vs depth-first dispatch fairness
/// (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulingPolicy {
    BreadthFirst,
    DepthFirst,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        SchedulingPolicy::BreadthFirst
    }
}

/// Access level required to answer a given meta request kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaAccess {
    None,
    Authenticated,
    Admin,
}

/// Boolean/graded gates on the core meta namespace (§4.5, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaPolicy {
    #[serde(default = "default_true")]
    pub list: bool,
    #[serde(default = "default_meta_access")]
    pub schema: MetaAccess,
    #[serde(default = "default_meta_access")]
    pub example: MetaAccess,
    #[serde(default = "default_meta_access")]
    pub prompt: MetaAccess,
}

fn default_true() -> bool {
    true
}

fn default_meta_access() -> MetaAccess {
    MetaAccess::Authenticated
}

impl Default for MetaPolicy {
    fn default() -> Self {
        Self {
            list: true,
            schema: MetaAccess::Authenticated,
            example: MetaAccess::Authenticated,
            prompt: MetaAccess::Authenticated,
        }
    }
}

/// The pump's tunables (§6 "Configuration surface"). `listeners` itself is
/// not part of this struct — handlers are Rust trait objects, not data, so
/// registration happens through [`crate::registry::ListenerRegistry::register`]
/// directly rather than generic deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpConfig {
    #[serde(default)]
    pub thread_scheduling: SchedulingPolicy,
    #[serde(default)]
    pub meta_policy: MetaPolicy,
    #[serde(default = "default_timeout_seconds")]
    pub handler_timeout_default_seconds: u64,
    #[serde(default = "default_token_budget")]
    pub thread_token_budget_default: i64,
    /// Fairness window K (§8 invariant 7): the max number of consecutive
    /// messages from one thread before another ready thread must be
    /// serviced under breadth-first scheduling.
    #[serde(default = "default_fairness_window")]
    pub fairness_window: usize,
    /// Bounded dispatch concurrency (§4.3 "concurrency of dispatch is
    /// bounded by a configurable maximum").
    #[serde(default = "default_max_concurrent_dispatch")]
    pub max_concurrent_dispatch: usize,
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_token_budget() -> i64 {
    100_000
}

fn default_fairness_window() -> usize {
    4
}

fn default_max_concurrent_dispatch() -> usize {
    16
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            thread_scheduling: SchedulingPolicy::default(),
            meta_policy: MetaPolicy::default(),
            handler_timeout_default_seconds: default_timeout_seconds(),
            thread_token_budget_default: default_token_budget(),
            fairness_window: default_fairness_window(),
            max_concurrent_dispatch: default_max_concurrent_dispatch(),
        }
    }
}
