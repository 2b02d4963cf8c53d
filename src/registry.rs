//! The autonomous registry: listener catalog, derived root-tag routing
//! table, and schema/example/prompt-fragment synthesis (§4.1).

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{RegistryError, RegistryResult};
use crate::field::{FieldType, PayloadType};
use crate::handler::Handler;

/// A fully registered capability, with every derived artifact materialized
/// at registration time.
pub struct Listener {
    pub name: String,
    pub payload_type: PayloadType,
    pub handler: Arc<dyn Handler>,
    pub description: String,
    pub is_agent: bool,
    pub peers: Vec<String>,
    pub broadcast: bool,
    pub root_tag: String,
    /// Per-listener timeout override (§4.3 "per-listener configurable
    /// timeout (default applies if unspecified)"); `None` defers to the
    /// pump's configured default.
    pub timeout_seconds: Option<u64>,
    pub cached_schema: String,
    pub cached_example: String,
    pub cached_prompt_fragment: String,
    /// §4.1: "cached_usage_instructions ... materialized at registration."
    /// Depends on peers' own cached prompt fragments, so it is rebuilt (not
    /// merely re-cloned) on every `unregister` of one of this listener's
    /// peers — see [`ListenerRegistry::unregister`].
    pub cached_usage_instructions: String,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("name", &self.name)
            .field("root_tag", &self.root_tag)
            .field("is_agent", &self.is_agent)
            .field("peers", &self.peers)
            .field("broadcast", &self.broadcast)
            .finish()
    }
}

/// What a caller supplies to register a listener. The registry derives
/// `root_tag` and synthesizes the cached artifacts; none of those fields
/// are user-suppliable.
pub struct ListenerSpec {
    pub name: String,
    pub payload_type: PayloadType,
    pub handler: Arc<dyn Handler>,
    pub description: String,
    pub is_agent: bool,
    pub peers: Vec<String>,
    pub broadcast: bool,
    pub timeout_seconds: Option<u64>,
}

/// Derive the root tag for a non-broadcast listener (§6):
/// `lower(listener_name) + "." + lower(payload_type_name)`.
///
/// Broadcast listeners do not go through this: two listeners are only
/// useful sharing a tag if *different* names can still route to the same
/// place, so folding `listener_name` in here would defeat broadcast
/// entirely. [`ListenerRegistry::register`] derives a broadcast listener's
/// tag from its payload type name alone instead.
pub fn derive_root_tag(listener_name: &str, payload_type_name: &str) -> String {
    format!(
        "{}.{}",
        listener_name.to_lowercase(),
        payload_type_name.to_lowercase()
    )
}

/// Sanitize a listener name for the persisted-schema path layout (§6):
/// dots replaced with underscores.
pub fn sanitize_listener_name(name: &str) -> String {
    name.replace('.', "_")
}

/// The listener catalog and root-tag routing table.
///
/// Read-heavy, write-rare (§5); guarded by an `RwLock` in [`crate::pump`] so
/// that a single dispatch sees a consistent snapshot of the catalog.
#[derive(Default)]
pub struct ListenerRegistry {
    by_name: HashMap<String, Arc<Listener>>,
    by_root: HashMap<String, Vec<Arc<Listener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, synthesizing and caching its schema, example,
    /// and prompt fragment. Transactional: on any error the catalog is left
    /// byte-for-byte unchanged.
    pub fn register(&mut self, spec: ListenerSpec) -> RegistryResult<()> {
        if spec.description.trim().is_empty() {
            return Err(RegistryError::MissingDescription(spec.name));
        }
        if self.by_name.contains_key(&spec.name) {
            return Err(RegistryError::AlreadyRegistered(spec.name));
        }
        for peer in &spec.peers {
            if !self.by_name.contains_key(peer) {
                return Err(RegistryError::UnknownPeer(spec.name.clone(), peer.clone()));
            }
        }

        // Broadcast listeners must be able to share a tag under *different*
        // names, so their tag comes from the payload type alone.
        let root_tag = if spec.broadcast {
            spec.payload_type.name.to_lowercase()
        } else {
            derive_root_tag(&spec.name, &spec.payload_type.name)
        };

        if let Some(existing) = self.by_root.get(&root_tag) {
            if spec.is_agent {
                return Err(RegistryError::AgentRootTagTaken(spec.name, root_tag));
            }
            if !spec.broadcast || !existing.iter().all(|l| l.broadcast) {
                return Err(RegistryError::RootTagCollision(root_tag));
            }
            if let Some(first) = existing.first() {
                if !first.payload_type.structurally_eq(&spec.payload_type) {
                    return Err(RegistryError::BroadcastStructureMismatch(root_tag));
                }
            }
        }

        let cached_schema = synthesize_schema(&root_tag, &spec.payload_type);
        let cached_example = synthesize_example(&root_tag, &spec.payload_type);
        let cached_prompt_fragment =
            synthesize_prompt_fragment(&spec.name, &spec.description, &spec.payload_type, &cached_example);
        let cached_usage_instructions =
            self.synthesize_usage_instructions(&spec.peers);

        let listener = Arc::new(Listener {
            name: spec.name.clone(),
            payload_type: spec.payload_type,
            handler: spec.handler,
            description: spec.description,
            is_agent: spec.is_agent,
            peers: spec.peers,
            broadcast: spec.broadcast,
            root_tag: root_tag.clone(),
            timeout_seconds: spec.timeout_seconds,
            cached_schema,
            cached_example,
            cached_prompt_fragment,
            cached_usage_instructions,
        });

        self.by_name.insert(listener.name.clone(), listener.clone());
        self.by_root.entry(root_tag).or_default().push(listener);
        Ok(())
    }

    /// Remove a listener atomically. Lookups miss immediately; in-flight
    /// chain entries referencing the name remain for audit (§4.1) but the
    /// pump fails safe (generic `SystemError`) on response routing to it.
    ///
    /// Any surviving listener that names `name` as a peer has its
    /// `cached_usage_instructions` rebuilt, since that listener's own
    /// fragment of the removed peer is no longer meaningful to hand out.
    pub fn unregister(&mut self, name: &str) -> RegistryResult<()> {
        let listener = self
            .by_name
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if let Some(bucket) = self.by_root.get_mut(&listener.root_tag) {
            bucket.retain(|l| l.name != name);
            if bucket.is_empty() {
                self.by_root.remove(&listener.root_tag);
            }
        }

        let affected: Vec<String> = self
            .by_name
            .values()
            .filter(|l| l.peers.iter().any(|p| p == name))
            .map(|l| l.name.clone())
            .collect();
        for affected_name in affected {
            if let Some(existing) = self.by_name.get(&affected_name) {
                let rebuilt = self.synthesize_usage_instructions(&existing.peers);
                let updated = Arc::new(Listener {
                    name: existing.name.clone(),
                    payload_type: existing.payload_type.clone(),
                    handler: existing.handler.clone(),
                    description: existing.description.clone(),
                    is_agent: existing.is_agent,
                    peers: existing.peers.clone(),
                    broadcast: existing.broadcast,
                    root_tag: existing.root_tag.clone(),
                    timeout_seconds: existing.timeout_seconds,
                    cached_schema: existing.cached_schema.clone(),
                    cached_example: existing.cached_example.clone(),
                    cached_prompt_fragment: existing.cached_prompt_fragment.clone(),
                    cached_usage_instructions: rebuilt,
                });
                self.by_name.insert(affected_name.clone(), updated.clone());
                if let Some(bucket) = self.by_root.get_mut(&updated.root_tag) {
                    for slot in bucket.iter_mut() {
                        if slot.name == affected_name {
                            *slot = updated.clone();
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Concatenate the cached prompt fragments of the given peer names, in
    /// deterministic (sorted) order, plus a fixed response-semantics
    /// warning (§4.1). Shared by registration-time caching and
    /// post-unregister invalidation.
    fn synthesize_usage_instructions(&self, peers: &[String]) -> String {
        let mut peers = peers.to_vec();
        peers.sort();
        let mut out = String::new();
        for peer_name in &peers {
            if let Some(peer) = self.by_name.get(peer_name) {
                out.push_str(&peer.cached_prompt_fragment);
                out.push('\n');
            }
        }
        out.push_str(
            "Responding to a message terminates the sub-chain it belongs to; \
             the response is delivered to your caller, not to you.",
        );
        out
    }

    pub fn lookup_by_root(&self, root_tag: &str) -> Vec<Arc<Listener>> {
        self.by_root.get(root_tag).cloned().unwrap_or_default()
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<Listener>> {
        self.by_name.get(name).cloned()
    }

    pub fn listener_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Recompute what `listener`'s `cached_usage_instructions` would be from
    /// the catalog's current state. Used by tests and by callers that want
    /// to double-check the cache rather than trust it; dispatch itself reads
    /// `listener.cached_usage_instructions` directly (§4.1).
    pub fn build_usage_instructions(&self, listener: &Listener) -> String {
        self.synthesize_usage_instructions(&listener.peers)
    }
}

fn synthesize_schema(root_tag: &str, payload_type: &PayloadType) -> String {
    let mut body = String::new();
    write_schema_fields(&mut body, &payload_type.fields, 1);
    format!(
        "<xs:element name=\"{root}\">\n  <xs:complexType>\n    <xs:sequence>\n{body}    </xs:sequence>\n  </xs:complexType>\n</xs:element>\n",
        root = root_tag,
        body = body,
    )
}

fn write_schema_fields(out: &mut String, fields: &[crate::field::FieldDescriptor], indent: usize) {
    let pad = "  ".repeat(indent + 2);
    for field in fields {
        let min_occurs = if field.is_required() { "1" } else { "0" };
        let doc = field
            .doc
            .as_ref()
            .map(|d| format!(" doc=\"{}\"", d))
            .unwrap_or_default();
        match &field.ty {
            FieldType::Record(nested) => {
                out.push_str(&format!(
                    "{pad}<xs:element name=\"{name}\" minOccurs=\"{min}\"{doc}>\n{pad}  <xs:complexType>\n{pad}    <xs:sequence>\n",
                    pad = pad, name = field.name, min = min_occurs, doc = doc,
                ));
                write_schema_fields(out, nested, indent + 3);
                out.push_str(&format!(
                    "{pad}    </xs:sequence>\n{pad}  </xs:complexType>\n{pad}</xs:element>\n",
                    pad = pad,
                ));
            }
            FieldType::List(inner) => {
                out.push_str(&format!(
                    "{pad}<xs:element name=\"{name}\" type=\"{ty}\" minOccurs=\"0\" maxOccurs=\"unbounded\"{doc}/>\n",
                    pad = pad, name = field.name, ty = inner.xsd_name(), doc = doc,
                ));
            }
            leaf => {
                out.push_str(&format!(
                    "{pad}<xs:element name=\"{name}\" type=\"{ty}\" minOccurs=\"{min}\"{doc}/>\n",
                    pad = pad, name = field.name, ty = leaf.xsd_name(), min = min_occurs, doc = doc,
                ));
            }
        }
    }
}

fn synthesize_example(root_tag: &str, payload_type: &PayloadType) -> String {
    let body: String = payload_type
        .fields
        .iter()
        .map(|f| format!("<{}>{}</{}>", f.name, f.ty.default_text(), f.name))
        .collect();
    format!("<{root}>{body}</{root}>", root = root_tag, body = body)
}

fn synthesize_prompt_fragment(
    name: &str,
    description: &str,
    payload_type: &PayloadType,
    example: &str,
) -> String {
    let mut field_table = String::new();
    for f in &payload_type.fields {
        field_table.push_str(&format!(
            "  - {} ({}){}\n",
            f.name,
            f.ty.xsd_name(),
            f.doc
                .as_ref()
                .map(|d| format!(": {d}"))
                .unwrap_or_default(),
        ));
    }
    format!(
        "## {name}\n{description}\n\nFields:\n{field_table}\nExample:\n{example}\n\nResponding terminates this sub-chain.\n",
        name = name,
        description = description,
        field_table = field_table,
        example = example,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldDescriptor;
    use crate::handler::FnHandler;

    fn noop_handler() -> Arc<dyn Handler> {
        Arc::new(FnHandler::new(|_payload, _ctx| {
            Box::pin(async { crate::handler::HandlerResponse::Terminate })
        }))
    }

    fn text_payload(name: &str) -> PayloadType {
        PayloadType::new(name, vec![FieldDescriptor::new("text", FieldType::String)])
    }

    #[test]
    fn derive_root_tag_lowercases_and_joins() {
        assert_eq!(
            derive_root_tag("Calculator.Add", "AddPayload"),
            "calculator.add.addpayload"
        );
    }

    #[test]
    fn register_requires_description() {
        let mut reg = ListenerRegistry::new();
        let err = reg
            .register(ListenerSpec {
                name: "shouter".into(),
                payload_type: text_payload("ShoutInput"),
                handler: noop_handler(),
                description: "".into(),
                is_agent: false,
                peers: vec![],
                broadcast: false,
                timeout_seconds: None,
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::MissingDescription(_)));
    }

    #[test]
    fn register_rejects_unknown_peer() {
        let mut reg = ListenerRegistry::new();
        let err = reg
            .register(ListenerSpec {
                name: "greeter".into(),
                payload_type: text_payload("GreetingPayload"),
                handler: noop_handler(),
                description: "Greets people.".into(),
                is_agent: true,
                peers: vec!["shouter".into()],
                broadcast: false,
                timeout_seconds: None,
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownPeer(_, _)));
    }

    #[test]
    fn register_then_lookup_by_root_and_name() {
        let mut reg = ListenerRegistry::new();
        reg.register(ListenerSpec {
            name: "shouter".into(),
            payload_type: text_payload("ShoutInput"),
            handler: noop_handler(),
            description: "Shouts text.".into(),
            is_agent: false,
            peers: vec![],
            broadcast: false,
            timeout_seconds: None,
        })
        .unwrap();

        let listener = reg.lookup_by_name("shouter").unwrap();
        assert_eq!(listener.root_tag, "shouter.shoutinput");
        assert_eq!(reg.lookup_by_root("shouter.shoutinput").len(), 1);
        assert!(listener.cached_example.contains("<text></text>"));
    }

    #[test]
    fn register_with_timeout_override_is_retained() {
        let mut reg = ListenerRegistry::new();
        reg.register(ListenerSpec {
            name: "slow".into(),
            payload_type: text_payload("SlowInput"),
            handler: noop_handler(),
            description: "Takes a while.".into(),
            is_agent: false,
            peers: vec![],
            broadcast: false,
            timeout_seconds: Some(5),
        })
        .unwrap();

        let listener = reg.lookup_by_name("slow").unwrap();
        assert_eq!(listener.timeout_seconds, Some(5));
    }

    #[test]
    fn non_broadcast_root_tag_collision_rejected() {
        // Non-broadcast tags are `lower(name) + "." + lower(payload_type)`,
        // and `name` may itself contain dots — so a different (name, type)
        // pair can still land on the same joined string.
        let mut reg = ListenerRegistry::new();
        reg.register(ListenerSpec {
            name: "search.a".into(),
            payload_type: text_payload("b"),
            handler: noop_handler(),
            description: "Search A.".into(),
            is_agent: false,
            peers: vec![],
            broadcast: false,
            timeout_seconds: None,
        })
        .unwrap();

        let err = reg
            .register(ListenerSpec {
                name: "search".into(),
                payload_type: text_payload("a.b"),
                handler: noop_handler(),
                description: "Search B.".into(),
                is_agent: false,
                peers: vec![],
                broadcast: false,
                timeout_seconds: None,
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::RootTagCollision(_)));
    }

    #[test]
    fn broadcast_listeners_share_root_tag() {
        let mut reg = ListenerRegistry::new();
        reg.register(ListenerSpec {
            name: "search.google".into(),
            payload_type: text_payload("Query"),
            handler: noop_handler(),
            description: "Search Google.".into(),
            is_agent: false,
            peers: vec![],
            broadcast: true,
            timeout_seconds: None,
        })
        .unwrap();
        reg.register(ListenerSpec {
            name: "search.bing".into(),
            payload_type: text_payload("Query"),
            handler: noop_handler(),
            description: "Search Bing.".into(),
            is_agent: false,
            peers: vec![],
            broadcast: true,
            timeout_seconds: None,
        })
        .unwrap();

        assert_eq!(reg.lookup_by_root("query").len(), 2);
    }

    #[test]
    fn broadcast_structural_mismatch_rejected() {
        let mut reg = ListenerRegistry::new();
        reg.register(ListenerSpec {
            name: "search.google".into(),
            payload_type: PayloadType::new("Query", vec![FieldDescriptor::new("q", FieldType::String)]),
            handler: noop_handler(),
            description: "Search Google.".into(),
            is_agent: false,
            peers: vec![],
            broadcast: true,
            timeout_seconds: None,
        })
        .unwrap();

        let err = reg
            .register(ListenerSpec {
                name: "search.bing".into(),
                payload_type: PayloadType::new(
                    "Query",
                    vec![FieldDescriptor::new("q", FieldType::Integer)],
                ),
                handler: noop_handler(),
                description: "Search Bing.".into(),
                is_agent: false,
                peers: vec![],
                broadcast: true,
                timeout_seconds: None,
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::BroadcastStructureMismatch(_)));
    }

    #[test]
    fn agent_cannot_share_root_tag() {
        let mut reg = ListenerRegistry::new();
        reg.register(ListenerSpec {
            name: "search.google".into(),
            payload_type: text_payload("Query"),
            handler: noop_handler(),
            description: "Search Google.".into(),
            is_agent: false,
            peers: vec![],
            broadcast: true,
            timeout_seconds: None,
        })
        .unwrap();

        let err = reg
            .register(ListenerSpec {
                name: "search.agent".into(),
                payload_type: text_payload("Query"),
                handler: noop_handler(),
                description: "An agent.".into(),
                is_agent: true,
                peers: vec![],
                broadcast: true,
                timeout_seconds: None,
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::AgentRootTagTaken(_, _)));
    }

    #[test]
    fn unregister_removes_from_both_indexes() {
        let mut reg = ListenerRegistry::new();
        reg.register(ListenerSpec {
            name: "shouter".into(),
            payload_type: text_payload("ShoutInput"),
            handler: noop_handler(),
            description: "Shouts text.".into(),
            is_agent: false,
            peers: vec![],
            broadcast: false,
            timeout_seconds: None,
        })
        .unwrap();

        reg.unregister("shouter").unwrap();
        assert!(reg.lookup_by_name("shouter").is_none());
        assert!(reg.lookup_by_root("shouter.shoutinput").is_empty());
    }

    #[test]
    fn build_usage_instructions_concatenates_peer_fragments() {
        let mut reg = ListenerRegistry::new();
        reg.register(ListenerSpec {
            name: "shouter".into(),
            payload_type: text_payload("ShoutInput"),
            handler: noop_handler(),
            description: "Shouts text.".into(),
            is_agent: false,
            peers: vec![],
            broadcast: false,
            timeout_seconds: None,
        })
        .unwrap();
        reg.register(ListenerSpec {
            name: "greeter".into(),
            payload_type: text_payload("GreetingPayload"),
            handler: noop_handler(),
            description: "Greets people.".into(),
            is_agent: true,
            peers: vec!["shouter".into()],
            broadcast: false,
            timeout_seconds: None,
        })
        .unwrap();

        let greeter = reg.lookup_by_name("greeter").unwrap();
        assert!(greeter.cached_usage_instructions.contains("## shouter"));
        assert!(greeter.cached_usage_instructions.contains("terminates"));
        assert_eq!(
            greeter.cached_usage_instructions,
            reg.build_usage_instructions(&greeter)
        );
    }

    #[test]
    fn unregister_invalidates_dependent_cached_usage_instructions() {
        let mut reg = ListenerRegistry::new();
        reg.register(ListenerSpec {
            name: "shouter".into(),
            payload_type: text_payload("ShoutInput"),
            handler: noop_handler(),
            description: "Shouts text.".into(),
            is_agent: false,
            peers: vec![],
            broadcast: false,
            timeout_seconds: None,
        })
        .unwrap();
        reg.register(ListenerSpec {
            name: "greeter".into(),
            payload_type: text_payload("GreetingPayload"),
            handler: noop_handler(),
            description: "Greets people.".into(),
            is_agent: true,
            peers: vec!["shouter".into()],
            broadcast: false,
            timeout_seconds: None,
        })
        .unwrap();

        reg.unregister("shouter").unwrap();
        let greeter = reg.lookup_by_name("greeter").unwrap();
        assert!(!greeter.cached_usage_instructions.contains("## shouter"));
        assert!(greeter.cached_usage_instructions.contains("terminates"));
    }

    #[test]
    fn sanitize_listener_name_replaces_dots() {
        assert_eq!(sanitize_listener_name("calculator.add"), "calculator_add");
    }
}
