//! Declarative payload type descriptors.
//!
//! The origin system introspects dynamically-typed payload records at
//! registration time. This target is statically typed, so listeners instead
//! hand the registry an explicit, ordered [`PayloadType`] — a small
//! "schema-of-record" value — built with [`FieldDescriptor`]s. Schema
//! synthesis, example synthesis, and structural validation all walk this
//! same descriptor list, so the three artifacts stay in lockstep by
//! construction rather than by convention.

use std::fmt;

/// The primitive/structural kinds a payload field may take.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Integer,
    Decimal,
    Boolean,
    String,
    /// A nested record, described by its own field list.
    Record(Vec<FieldDescriptor>),
    /// A repeated field (`maxOccurs="unbounded"` in the synthesized schema).
    List(Box<FieldType>),
}

impl FieldType {
    /// The `xs:` primitive name used in schema synthesis, for leaf types.
    pub fn xsd_name(&self) -> &'static str {
        match self {
            FieldType::Integer => "xs:integer",
            FieldType::Decimal => "xs:decimal",
            FieldType::Boolean => "xs:boolean",
            FieldType::String => "xs:string",
            FieldType::Record(_) => "complexType",
            FieldType::List(_) => "unbounded",
        }
    }

    /// The default-value text used in synthesized examples.
    pub fn default_text(&self) -> String {
        match self {
            FieldType::Integer => "0".to_string(),
            FieldType::Decimal => "0.0".to_string(),
            FieldType::Boolean => "false".to_string(),
            FieldType::String => String::new(),
            FieldType::Record(fields) => fields
                .iter()
                .map(|f| format!("<{}>{}</{}>", f.name, f.ty.default_text(), f.name))
                .collect::<Vec<_>>()
                .join(""),
            FieldType::List(inner) => format!("<item>{}</item>", inner.default_text()),
        }
    }
}

/// One named field in a [`PayloadType`].
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: FieldType,
    pub doc: Option<String>,
    /// Presence of a default marks the field optional (§4.1: "required vs
    /// optional is determined by the presence of a default value").
    pub default: Option<String>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            doc: None,
            default: None,
        }
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// The structural description of a listener's payload, named for root-tag
/// derivation (`lower(listener_name) + "." + lower(payload_type_name)`).
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadType {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
}

impl PayloadType {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Structural equality ignoring the type name itself — used to enforce
    /// the broadcast invariant (§9: "enforce structural equality of payload
    /// descriptors at broadcast registration").
    pub fn structurally_eq(&self, other: &PayloadType) -> bool {
        self.fields == other.fields
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_text_for_primitives() {
        assert_eq!(FieldType::Integer.default_text(), "0");
        assert_eq!(FieldType::Decimal.default_text(), "0.0");
        assert_eq!(FieldType::Boolean.default_text(), "false");
        assert_eq!(FieldType::String.default_text(), "");
    }

    #[test]
    fn field_with_default_is_optional() {
        let f = FieldDescriptor::new("count", FieldType::Integer).with_default("0");
        assert!(!f.is_required());
        let g = FieldDescriptor::new("name", FieldType::String);
        assert!(g.is_required());
    }

    #[test]
    fn structural_equality_ignores_name() {
        let a = PayloadType::new("A", vec![FieldDescriptor::new("text", FieldType::String)]);
        let b = PayloadType::new("B", vec![FieldDescriptor::new("text", FieldType::String)]);
        assert!(a.structurally_eq(&b));

        let c = PayloadType::new("C", vec![FieldDescriptor::new("text", FieldType::Integer)]);
        assert!(!a.structurally_eq(&c));
    }
}
