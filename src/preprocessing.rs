//! The per-listener preprocessing pipeline (§4.2): repair → canonicalize →
//! envelope-validate → extract → schema-validate → deserialize.
//!
//! The first three stages run once per inbound message (they don't depend
//! on which listener ends up handling it); [`validate_and_deserialize`]
//! runs once per target listener, so a broadcast fan-out can fail for one
//! listener without affecting its siblings (§4.2 Concurrency).

use std::sync::Arc;

use crate::envelope::{self, Envelope, XmlElement};
use crate::error::PreprocessError;
use crate::field::{FieldDescriptor, FieldType};
use crate::handler::{PayloadValue, ValidatedPayload};
use crate::registry::Listener;

/// Result of the shared (repair/canonicalize/envelope-validate/extract)
/// stages, before any per-listener work.
pub struct IngressedMessage {
    pub envelope: Envelope,
    pub root_tag: String,
    pub repaired: bool,
}

/// Stages 1-4: repair, canonicalize, envelope-validate, extract.
pub fn ingress(raw: &[u8]) -> Result<IngressedMessage, PreprocessError> {
    let (repaired_bytes, repaired) = envelope::repair(raw)?;
    let canonical = envelope::canonicalize(&repaired_bytes)?;
    let envelope = envelope::parse_envelope(&canonical)?;
    let root_tag = envelope::payload_root_tag(&envelope.payload)?;
    Ok(IngressedMessage {
        envelope,
        root_tag,
        repaired,
    })
}

/// Stages 5-6: schema-validate the payload body against `listener`'s
/// descriptors, then deserialize into a [`ValidatedPayload`].
pub fn validate_and_deserialize(
    listener: &Arc<Listener>,
    payload_xml: &str,
) -> Result<ValidatedPayload, PreprocessError> {
    let tree = envelope::parse_element_tree(payload_xml)?;
    let value = validate_record(&tree, &listener.payload_type.fields)?;
    Ok(ValidatedPayload {
        root_tag: listener.root_tag.clone(),
        value,
    })
}

fn validate_record(
    elem: &XmlElement,
    fields: &[FieldDescriptor],
) -> Result<PayloadValue, PreprocessError> {
    let mut out = Vec::with_capacity(fields.len());
    for field in fields {
        let matches: Vec<&XmlElement> = elem
            .children
            .iter()
            .filter(|c| c.name == field.name)
            .collect();

        if matches.is_empty() {
            if field.is_required() {
                return Err(PreprocessError::SchemaViolation(format!(
                    "missing required field '{}'",
                    field.name
                )));
            }
            out.push((field.name.clone(), default_value(&field.ty)));
            continue;
        }

        let value = match &field.ty {
            FieldType::List(inner) => {
                let items = matches
                    .iter()
                    .map(|m| validate_leaf(m, inner))
                    .collect::<Result<Vec<_>, _>>()?;
                PayloadValue::List(items)
            }
            other => validate_leaf(matches[0], other)?,
        };
        out.push((field.name.clone(), value));
    }
    Ok(PayloadValue::Record(out))
}

fn validate_leaf(elem: &XmlElement, ty: &FieldType) -> Result<PayloadValue, PreprocessError> {
    match ty {
        FieldType::Integer => elem
            .text
            .trim()
            .parse::<i64>()
            .map(PayloadValue::Integer)
            .map_err(|_| PreprocessError::SchemaViolation(format!("'{}' is not an integer", elem.name))),
        FieldType::Decimal => elem
            .text
            .trim()
            .parse::<f64>()
            .map(PayloadValue::Decimal)
            .map_err(|_| PreprocessError::SchemaViolation(format!("'{}' is not a decimal", elem.name))),
        FieldType::Boolean => match elem.text.trim() {
            "true" => Ok(PayloadValue::Boolean(true)),
            "false" => Ok(PayloadValue::Boolean(false)),
            _ => Err(PreprocessError::SchemaViolation(format!(
                "'{}' is not a boolean",
                elem.name
            ))),
        },
        FieldType::String => Ok(PayloadValue::String(elem.text.clone())),
        FieldType::Record(nested) => validate_record(elem, nested),
        FieldType::List(inner) => validate_leaf(elem, inner),
    }
}

fn default_value(ty: &FieldType) -> PayloadValue {
    match ty {
        FieldType::Integer => PayloadValue::Integer(0),
        FieldType::Decimal => PayloadValue::Decimal(0.0),
        FieldType::Boolean => PayloadValue::Boolean(false),
        FieldType::String => PayloadValue::String(String::new()),
        FieldType::Record(fields) => {
            PayloadValue::Record(fields.iter().map(|f| (f.name.clone(), default_value(&f.ty))).collect())
        }
        FieldType::List(_) => PayloadValue::List(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::build_envelope;
    use crate::field::PayloadType;
    use crate::handler::FnHandler;
    use crate::registry::{ListenerRegistry, ListenerSpec};
    use std::sync::Arc;

    fn calculator_add_listener() -> Arc<Listener> {
        let mut reg = ListenerRegistry::new();
        reg.register(ListenerSpec {
            name: "calculator.add".into(),
            payload_type: PayloadType::new(
                "AddPayload",
                vec![
                    FieldDescriptor::new("a", FieldType::Integer),
                    FieldDescriptor::new("b", FieldType::Integer),
                ],
            ),
            handler: Arc::new(FnHandler::new(|_p, _c| {
                Box::pin(async { crate::handler::HandlerResponse::Terminate })
            })),
            description: "Adds two integers.".into(),
            is_agent: false,
            peers: vec![],
            broadcast: false,
            timeout_seconds: None,
        })
        .unwrap();
        reg.lookup_by_name("calculator.add").unwrap()
    }

    #[test]
    fn ingress_extracts_envelope_and_root_tag() {
        let raw = build_envelope(
            "console",
            "t-1",
            Some("calculator.add"),
            "<calculator.add.addpayload><a>1</a><b>2</b></calculator.add.addpayload>",
        );
        let msg = ingress(&raw).unwrap();
        assert_eq!(msg.root_tag, "calculator.add.addpayload");
        assert!(!msg.repaired);
    }

    #[test]
    fn ingress_rejects_envelope_with_no_payload_root() {
        let raw = b"<message><from>x</from><thread>t</thread><payload>   </payload></message>";
        assert!(ingress(raw).is_err());
    }

    #[test]
    fn validate_and_deserialize_accepts_well_typed_payload() {
        let listener = calculator_add_listener();
        let payload = "<calculator.add.addpayload><a>1</a><b>2</b></calculator.add.addpayload>";
        let validated = validate_and_deserialize(&listener, payload).unwrap();
        assert_eq!(
            validated.value.field("a"),
            Some(&PayloadValue::Integer(1))
        );
    }

    #[test]
    fn validate_and_deserialize_rejects_non_numeric_field() {
        let listener = calculator_add_listener();
        let payload = "<calculator.add.addpayload><a>not-a-number</a><b>2</b></calculator.add.addpayload>";
        let err = validate_and_deserialize(&listener, payload).unwrap_err();
        assert!(matches!(err, PreprocessError::SchemaViolation(_)));
    }

    #[test]
    fn validate_and_deserialize_rejects_missing_required_field() {
        let listener = calculator_add_listener();
        let payload = "<calculator.add.addpayload><a>1</a></calculator.add.addpayload>";
        let err = validate_and_deserialize(&listener, payload).unwrap_err();
        assert!(matches!(err, PreprocessError::SchemaViolation(_)));
    }
}
