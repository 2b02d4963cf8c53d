//! Error taxonomy for the pipeline core.
//!
//! Each subsystem gets its own `thiserror` enum; [`PipelineError`] aggregates
//! them for callers that cross subsystem boundaries (e.g. the pump invoking
//! the registry). None of these types ever reach a handler directly — the
//! dispatch boundary converts them to canned `<huh>`/`SystemError` payloads
//! (see [`crate::system`]).

use thiserror::Error;

/// Errors raised by [`crate::registry::ListenerRegistry`] operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("listener '{0}' has no description")]
    MissingDescription(String),
    #[error("listener '{0}' payload type is unrepresentable: {1}")]
    UnrepresentablePayload(String, String),
    #[error("root tag '{0}' already registered by a non-broadcast listener")]
    RootTagCollision(String),
    #[error("agent '{0}' cannot share root tag '{1}' with an existing listener")]
    AgentRootTagTaken(String, String),
    #[error("broadcast listeners sharing root tag '{0}' disagree on payload structure")]
    BroadcastStructureMismatch(String),
    #[error("listener '{0}' declares unknown peer '{1}'")]
    UnknownPeer(String, String),
    #[error("listener '{0}' already registered")]
    AlreadyRegistered(String),
    #[error("listener '{0}' not found")]
    NotFound(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors raised while running a message through the per-listener preprocessing pipeline.
///
/// These never leak structurally to a handler; [`crate::system::huh_for`] collapses
/// them to one of the three canned causes.
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("envelope malformed: {0}")]
    EnvelopeMalformed(String),
    #[error("unknown root tag: {0}")]
    UnknownRootTag(String),
    #[error("payload schema violation: {0}")]
    SchemaViolation(String),
}

pub type PreprocessResult<T> = Result<T, PreprocessError>;

/// Errors raised by the thread registry.
#[derive(Debug, Error)]
pub enum ThreadRegistryError {
    #[error("thread not found: {0}")]
    NotFound(String),
    #[error("thread '{0}' has an empty call chain")]
    EmptyChain(String),
}

pub type ThreadRegistryResult<T> = Result<T, ThreadRegistryError>;

/// Errors raised by the central message pump.
#[derive(Debug, Error)]
pub enum PumpError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Thread(#[from] ThreadRegistryError),
    #[error("handler '{0}' timed out")]
    Timeout(String),
    #[error("thread '{0}' exceeded its token budget")]
    BudgetExhausted(String),
    #[error("handler '{0}' targeted non-peer '{1}'")]
    RoutingViolation(String, String),
    #[error("handler '{0}' panicked or returned an internal error: {1}")]
    HandlerInternal(String, String),
}

pub type PumpResult<T> = Result<T, PumpError>;

/// Crate-level aggregate error for callers that span subsystems.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Thread(#[from] ThreadRegistryError),
    #[error(transparent)]
    Pump(#[from] PumpError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
