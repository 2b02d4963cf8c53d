//! System primitives (§4.5): the reserved core namespace — `<huh>`,
//! `<SystemError>`, and meta requests — all handled by a privileged
//! internal handler rather than a user listener, with identical envelope
//! discipline.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::config::{MetaAccess, MetaPolicy};
use crate::envelope::xml_escape;
use crate::error::PreprocessError;
use crate::registry::ListenerRegistry;

/// Truncate the base64-encoded original bytes to 4 KiB (§4.2, Scenario C).
const HUH_ORIGINAL_ATTEMPT_LIMIT: usize = 4096;

/// One of the canned, deliberately collapsed failure strings (§4.2,
/// topology-privacy rule in §7).
pub fn huh_error_text(err: &PreprocessError) -> &'static str {
    match err {
        PreprocessError::EnvelopeMalformed(_) => "Envelope malformed",
        PreprocessError::UnknownRootTag(_) | PreprocessError::SchemaViolation(_) => {
            "Invalid payload structure"
        }
    }
}

/// Build a `<huh>` payload (without the enclosing envelope) for a
/// preprocessing failure, addressed back to the offending sender by the
/// caller.
pub fn build_huh(err: &PreprocessError, original_bytes: &[u8]) -> String {
    let encoded = BASE64.encode(original_bytes);
    let truncated = encoded.len() > HUH_ORIGINAL_ATTEMPT_LIMIT;
    let encoded = if truncated {
        &encoded[..HUH_ORIGINAL_ATTEMPT_LIMIT]
    } else {
        &encoded[..]
    };
    format!(
        "<huh><error>{error}</error><original-attempt>{attempt}</original-attempt></huh>",
        error = xml_escape(huh_error_text(err)),
        attempt = encoded,
    )
}

/// The runtime-error kinds that produce a `<SystemError>` (§4.5, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemErrorCode {
    Routing,
    Validation,
    Timeout,
    Budget,
}

impl SystemErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemErrorCode::Routing => "routing",
            SystemErrorCode::Validation => "validation",
            SystemErrorCode::Timeout => "timeout",
            SystemErrorCode::Budget => "budget",
        }
    }

    /// Whether this code's thread may retry (§7 taxonomy).
    pub fn retry_allowed(&self) -> bool {
        !matches!(self, SystemErrorCode::Budget)
    }
}

/// Build a `<SystemError>` payload, generic by design (§4.5, §7
/// topology-privacy rule).
pub fn build_system_error(code: SystemErrorCode, message: &str) -> String {
    format!(
        "<SystemError><code>{code}</code><message>{message}</message><retry-allowed>{retry}</retry-allowed></SystemError>",
        code = code.as_str(),
        message = xml_escape(message),
        retry = code.retry_allowed(),
    )
}

/// The privileged handler for core-namespace meta requests: capability
/// listing and schema/example/prompt retrieval, gated by [`MetaPolicy`].
pub struct MetaHandler<'a> {
    registry: &'a ListenerRegistry,
    policy: &'a MetaPolicy,
}

impl<'a> MetaHandler<'a> {
    pub fn new(registry: &'a ListenerRegistry, policy: &'a MetaPolicy) -> Self {
        Self { registry, policy }
    }

    /// `<list-capabilities/>` — every listener name, newline-joined.
    pub fn list_capabilities(&self, caller_access: MetaAccess) -> Result<String, String> {
        if !self.policy.list {
            return Err("capability listing disabled".into());
        }
        let _ = caller_access; // listing has no graded access level (§6: boolean flag)
        let names = self.registry.listener_names();
        Ok(format!(
            "<list-capabilities>{}</list-capabilities>",
            names
                .iter()
                .map(|n| format!("<capability>{}</capability>", xml_escape(n)))
                .collect::<String>()
        ))
    }

    /// `<request-schema><capability>name</capability></request-schema>`.
    pub fn request_schema(&self, capability: &str, caller_access: MetaAccess) -> Result<String, String> {
        self.gated(self.policy.schema, caller_access, capability, |l| l.cached_schema.clone())
    }

    /// `<request-example>`.
    pub fn request_example(&self, capability: &str, caller_access: MetaAccess) -> Result<String, String> {
        self.gated(self.policy.example, caller_access, capability, |l| {
            l.cached_example.clone()
        })
    }

    /// `<request-prompt>`.
    pub fn request_prompt(&self, capability: &str, caller_access: MetaAccess) -> Result<String, String> {
        self.gated(self.policy.prompt, caller_access, capability, |l| {
            l.cached_prompt_fragment.clone()
        })
    }

    fn gated(
        &self,
        required: MetaAccess,
        caller_access: MetaAccess,
        capability: &str,
        extract: impl Fn(&crate::registry::Listener) -> String,
    ) -> Result<String, String> {
        if required == MetaAccess::None {
            return Err("disabled".into());
        }
        if caller_access < required {
            return Err("insufficient access".into());
        }
        let listener = self
            .registry
            .lookup_by_name(capability)
            .ok_or_else(|| "unknown capability".to_string())?;
        Ok(extract(&listener))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldDescriptor, FieldType, PayloadType};
    use crate::handler::FnHandler;
    use crate::registry::ListenerSpec;
    use std::sync::Arc;

    fn registry_with_shouter() -> ListenerRegistry {
        let mut reg = ListenerRegistry::new();
        reg.register(ListenerSpec {
            name: "shouter".into(),
            payload_type: PayloadType::new("ShoutInput", vec![FieldDescriptor::new("text", FieldType::String)]),
            handler: Arc::new(FnHandler::new(|_p, _c| {
                Box::pin(async { crate::handler::HandlerResponse::Terminate })
            })),
            description: "Shouts text.".into(),
            is_agent: false,
            peers: vec![],
            broadcast: false,
            timeout_seconds: None,
        })
        .unwrap();
        reg
    }

    #[test]
    fn huh_text_collapses_unknown_root_and_schema_violation() {
        let a = huh_error_text(&PreprocessError::UnknownRootTag("x".into()));
        let b = huh_error_text(&PreprocessError::SchemaViolation("y".into()));
        assert_eq!(a, b);
        assert_eq!(a, "Invalid payload structure");
    }

    #[test]
    fn build_huh_includes_canned_error_and_base64_attempt() {
        let huh = build_huh(&PreprocessError::EnvelopeMalformed("x".into()), b"<broken");
        assert!(huh.contains("Envelope malformed"));
        assert!(huh.contains("original-attempt"));
    }

    #[test]
    fn build_huh_truncates_long_original_attempt() {
        let big = vec![b'a'; 10_000];
        let huh = build_huh(&PreprocessError::SchemaViolation("x".into()), &big);
        let start = huh.find("<original-attempt>").unwrap() + "<original-attempt>".len();
        let end = huh.find("</original-attempt>").unwrap();
        assert!(end - start <= HUH_ORIGINAL_ATTEMPT_LIMIT);
    }

    #[test]
    fn system_error_budget_is_not_retryable() {
        let err = build_system_error(SystemErrorCode::Budget, "exhausted");
        assert!(err.contains("<retry-allowed>false</retry-allowed>"));
    }

    #[test]
    fn system_error_routing_is_retryable() {
        let err = build_system_error(SystemErrorCode::Routing, "blocked");
        assert!(err.contains("<retry-allowed>true</retry-allowed>"));
    }

    #[test]
    fn meta_list_capabilities_respects_policy() {
        let reg = registry_with_shouter();
        let mut policy = MetaPolicy::default();
        policy.list = false;
        let meta = MetaHandler::new(&reg, &policy);
        assert!(meta.list_capabilities(MetaAccess::Admin).is_err());
    }

    #[test]
    fn meta_request_schema_requires_access_level() {
        let reg = registry_with_shouter();
        let policy = MetaPolicy::default();
        let meta = MetaHandler::new(&reg, &policy);
        assert!(meta.request_schema("shouter", MetaAccess::None).is_err());
        assert!(meta.request_schema("shouter", MetaAccess::Authenticated).is_ok());
    }

    #[test]
    fn meta_request_unknown_capability_errs() {
        let reg = registry_with_shouter();
        let policy = MetaPolicy::default();
        let meta = MetaHandler::new(&reg, &policy);
        assert!(meta.request_example("missing", MetaAccess::Admin).is_err());
    }
}
