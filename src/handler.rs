//! The handler surface: what untrusted listener coroutines see, and what
//! they may return (§4.3, §9 "untrusted coroutine isolation").

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A structural payload value, produced by the deserialize stage (§4.2
/// stage 6) and constructed by handlers for forwarded/returned payloads.
/// This is the statically-typed target's stand-in for the origin's
/// dynamically-introspected records (§9).
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadValue {
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    String(String),
    Record(Vec<(String, PayloadValue)>),
    List(Vec<PayloadValue>),
}

impl PayloadValue {
    pub fn field(&self, name: &str) -> Option<&PayloadValue> {
        match self {
            PayloadValue::Record(fields) => {
                fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PayloadValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Render as XML fragments, without the enclosing root element — used
    /// when building a root-wrapped payload for re-injection.
    pub fn to_xml_fields(&self) -> String {
        match self {
            PayloadValue::Record(fields) => fields
                .iter()
                .map(|(name, value)| format!("<{name}>{}</{name}>", value.to_xml_inline()))
                .collect(),
            other => other.to_xml_inline(),
        }
    }

    fn to_xml_inline(&self) -> String {
        match self {
            PayloadValue::Integer(i) => i.to_string(),
            PayloadValue::Decimal(d) => d.to_string(),
            PayloadValue::Boolean(b) => b.to_string(),
            PayloadValue::String(s) => crate::envelope::xml_escape(s),
            PayloadValue::Record(_) => self.to_xml_fields(),
            PayloadValue::List(items) => items
                .iter()
                .map(|i| format!("<item>{}</item>", i.to_xml_inline()))
                .collect(),
        }
    }
}

/// The typed, schema-validated payload a handler receives, paired with the
/// root tag it arrived on (useful for broadcast handlers distinguishing
/// which shared-tag listener they are).
#[derive(Debug, Clone)]
pub struct ValidatedPayload {
    pub root_tag: String,
    pub value: PayloadValue,
}

/// Out-of-band token-usage reporting handle (§9 Open Questions: token
/// budgets are reported via callback, never through the return path).
#[derive(Clone)]
pub struct TokenReporter {
    remaining: Arc<AtomicI64>,
}

impl TokenReporter {
    pub fn new(budget: i64) -> Self {
        Self {
            remaining: Arc::new(AtomicI64::new(budget)),
        }
    }

    /// Report that `n` tokens were spent. Returns the remaining budget,
    /// which may go negative (the pump is responsible for noticing
    /// exhaustion and terminating the chain).
    pub fn spend(&self, n: i64) -> i64 {
        self.remaining.fetch_sub(n, Ordering::SeqCst) - n
    }

    pub fn remaining(&self) -> i64 {
        self.remaining.load(Ordering::SeqCst)
    }
}

/// Everything a handler is allowed to observe about its own invocation.
/// Captured in dispatcher-local scope before the handler runs; nothing in
/// here is writable by the handler and nothing the handler returns can
/// override it (§4.3 Security invariants).
#[derive(Clone)]
pub struct HandlerMetadata {
    pub thread_id: String,
    pub from_id: String,
    pub own_name: Option<String>,
    pub is_self_call: bool,
    pub usage_instructions: String,
    pub tokens: TokenReporter,
    /// Cancelled by the dispatcher on handler timeout, or when a pruned
    /// sub-chain's in-flight work is cancelled (§4.3 step 3, §5). Handlers
    /// are free to ignore this; the dispatcher backs it up with
    /// `task.abort()`, which is not cooperative.
    pub cancellation: CancellationToken,
}

/// The tagged-sum return type replacing the origin's `HandlerResponse |
/// None` polymorphism (§9).
#[derive(Debug, Clone)]
pub enum HandlerResponse {
    /// The chain terminates for this branch; nothing is emitted.
    Terminate,
    /// Pop the call chain's tail and route `payload` to the new tail (the
    /// caller). `type_name` names the payload's shape for root-tag
    /// derivation (§6) — a response payload has no registered listener of
    /// its own to borrow a tag from.
    Respond {
        type_name: String,
        payload: PayloadValue,
    },
    /// Extend the call chain with `to` and route `payload` to it. `to`
    /// equal to the handler's own name is self-iteration (Scenario F).
    Forward { payload: PayloadValue, to: String },
}

/// The async capability every listener registers. Handlers are treated as
/// adversarial (§9): they see only what [`HandlerMetadata`] exposes.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, payload: ValidatedPayload, ctx: HandlerMetadata) -> HandlerResponse;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A closure-backed [`Handler`], for tests and small inline listeners —
/// mirrors this codebase's existing `FnHandler` test fixture idiom.
pub struct FnHandler<F>
where
    F: Fn(ValidatedPayload, HandlerMetadata) -> BoxFuture<'static, HandlerResponse> + Send + Sync,
{
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(ValidatedPayload, HandlerMetadata) -> BoxFuture<'static, HandlerResponse> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(ValidatedPayload, HandlerMetadata) -> BoxFuture<'static, HandlerResponse> + Send + Sync,
{
    async fn handle(&self, payload: ValidatedPayload, ctx: HandlerMetadata) -> HandlerResponse {
        (self.f)(payload, ctx).await
    }
}

/// Convenience builder for constructing a [`PayloadValue::Record`] by hand
/// (tests and simple handlers).
pub fn record(fields: Vec<(&str, PayloadValue)>) -> PayloadValue {
    PayloadValue::Record(
        fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
}

/// Build a flat string-valued record, the common case for simple payloads.
pub fn string_record(fields: Vec<(&str, &str)>) -> PayloadValue {
    PayloadValue::Record(
        fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), PayloadValue::String(v.to_string())))
            .collect(),
    )
}

pub type FieldMap = HashMap<String, PayloadValue>;
