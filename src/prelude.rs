//! Everything an embedding application needs in one `use` — the shape this
//! codebase's own downstream consumer (`crate::pipeline::AgentPipeline`)
//! expects of `rust_pipeline::prelude::*`.

pub use crate::config::{MetaAccess, MetaPolicy, PumpConfig, SchedulingPolicy};
pub use crate::envelope::{build_envelope, Envelope};
pub use crate::error::{
    PipelineError, PipelineResult, PreprocessError, PreprocessResult, PumpError, PumpResult,
    RegistryError, RegistryResult, ThreadRegistryError, ThreadRegistryResult,
};
pub use crate::field::{FieldDescriptor, FieldType, PayloadType};
pub use crate::handler::{
    record, string_record, FnHandler, Handler, HandlerMetadata, HandlerResponse, PayloadValue,
    TokenReporter, ValidatedPayload,
};
pub use crate::pump::Pipeline;
pub use crate::registry::{Listener, ListenerRegistry, ListenerSpec};
pub use crate::system::{MetaHandler, SystemErrorCode};
pub use crate::thread_registry::ThreadRegistry;
