//! The envelope wire format: parsing, repair, canonicalization, and synthesis.
//!
//! Canonicalization here is a simplified exclusive C14N: it re-serializes a
//! parsed event stream through a single deterministic writer, so any two
//! byte-forms that parse to the same element/attribute structure produce
//! identical canonical bytes — attribute order, quote style, and
//! insignificant whitespace stop mattering. It does not implement the full
//! W3C exclusive-C14N algorithm (namespace-axis inheritance, comments
//! handling); nothing in this pipeline signs across namespace-inheriting
//! payloads, so the simplified form satisfies every invariant §6 and §8
//! actually exercise (byte-identical output for repeated identical input).

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

use crate::error::PreprocessError;

pub const ENVELOPE_NS: &str = "https://xml-pipeline.org/ns/envelope/v1";
pub const CORE_NS: &str = "https://xml-pipeline.org/ns/core/v1";

/// A parsed, envelope-schema-valid message.
///
/// `thread` is mandatory on every pump-internal, re-injected envelope, but
/// may be absent on the very first external ingress of a new conversation
/// (§8 Scenario A: "thread absent") — the pump allocates one at dispatch
/// step 1 in that case.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub from: String,
    pub thread: Option<String>,
    pub to: Option<String>,
    /// The single payload root element, as canonicalized XML bytes (not
    /// including the enclosing `<payload>` tags).
    pub payload: String,
}

/// Escape text content for inclusion in an XML element body.
pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Unescape the five predefined XML entities.
pub fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Stage 1 (§4.2): parse possibly-malformed XML, recovering structure where
/// unambiguous. Returns the repaired bytes plus whether a repair occurred.
///
/// Strict parsing is attempted first. On failure, a lenient re-parse (which
/// tolerates mismatched end-tag case/whitespace) is attempted; if that
/// succeeds, the re-serialized, now-well-formed bytes are returned with
/// `repaired = true`. If neither succeeds, the malformed-envelope error is
/// returned for the pipeline to turn into a `<huh>`.
pub fn repair(bytes: &[u8]) -> Result<(Vec<u8>, bool), PreprocessError> {
    if quick_xml::Reader::from_reader(bytes)
        .check_end_names(true)
        .read_event()
        .is_ok()
        && well_formed(bytes)
    {
        return Ok((bytes.to_vec(), false));
    }

    let mut reader = Reader::from_reader(bytes);
    reader.check_end_names(false).trim_text(true);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(event) => {
                writer
                    .write_event(event)
                    .map_err(|e| PreprocessError::EnvelopeMalformed(e.to_string()))?;
            }
            Err(e) => return Err(PreprocessError::EnvelopeMalformed(e.to_string())),
        }
        buf.clear();
    }
    Ok((writer.into_inner().into_inner(), true))
}

fn well_formed(bytes: &[u8]) -> bool {
    let mut reader = Reader::from_reader(bytes);
    reader.check_end_names(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => return true,
            Ok(_) => {}
            Err(_) => return false,
        }
        buf.clear();
    }
}

/// Stage 2 (§4.2, §6): exclusive C14N normalization.
pub fn canonicalize(bytes: &[u8]) -> Result<Vec<u8>, PreprocessError> {
    let mut reader = Reader::from_reader(bytes);
    reader.trim_text(true);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                let canon = canonicalize_start(&e);
                writer
                    .write_event(Event::Start(canon))
                    .map_err(|e| PreprocessError::EnvelopeMalformed(e.to_string()))?;
            }
            Ok(Event::Empty(e)) => {
                let canon = canonicalize_start(&e);
                writer
                    .write_event(Event::Empty(canon))
                    .map_err(|e| PreprocessError::EnvelopeMalformed(e.to_string()))?;
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| PreprocessError::EnvelopeMalformed(e.to_string()))?;
                if !text.trim().is_empty() {
                    writer
                        .write_event(Event::Text(BytesText::new(text.as_ref())))
                        .map_err(|e| PreprocessError::EnvelopeMalformed(e.to_string()))?;
                }
            }
            Ok(Event::Comment(_) | Event::PI(_) | Event::DocType(_) | Event::Decl(_)) => {
                // Comments and declarations carry no dispatch-relevant information.
            }
            Ok(event) => {
                writer
                    .write_event(event)
                    .map_err(|e| PreprocessError::EnvelopeMalformed(e.to_string()))?;
            }
            Err(e) => return Err(PreprocessError::EnvelopeMalformed(e.to_string())),
        }
        buf.clear();
    }
    Ok(writer.into_inner().into_inner())
}

fn canonicalize_start<'a>(e: &BytesStart<'a>) -> BytesStart<'static> {
    let mut attrs: Vec<(String, String)> = e
        .attributes()
        .filter_map(|a| a.ok())
        .map(|a| {
            let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
            let value = a.unescape_value().unwrap_or_default().into_owned();
            (key, value)
        })
        .collect();
    attrs.sort_by(|a, b| a.0.cmp(&b.0));

    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut owned = BytesStart::new(name);
    for (k, v) in attrs {
        owned.push_attribute((k.as_str(), v.as_str()));
    }
    owned
}

/// Stages 3-4 (§4.2): envelope-schema-validate and extract the payload root.
pub fn parse_envelope(bytes: &[u8]) -> Result<Envelope, PreprocessError> {
    let mut reader = Reader::from_reader(bytes);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut from: Option<String> = None;
    let mut thread: Option<String> = None;
    let mut to: Option<String> = None;
    let mut payload: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                let tag = local_name(&e);
                match tag.as_str() {
                    "from" => from = Some(read_text(&mut reader)?),
                    "thread" => thread = Some(read_text(&mut reader)?),
                    "to" => to = Some(read_text(&mut reader)?),
                    "payload" => payload = Some(read_inner_xml(&mut reader, "payload")?),
                    _ => {}
                }
            }
            Ok(_) => {}
            Err(e) => return Err(PreprocessError::EnvelopeMalformed(e.to_string())),
        }
        buf.clear();
    }

    let from = from.ok_or_else(|| PreprocessError::EnvelopeMalformed("missing <from>".into()))?;
    let payload =
        payload.ok_or_else(|| PreprocessError::EnvelopeMalformed("missing <payload>".into()))?;
    if payload.trim().is_empty() {
        return Err(PreprocessError::EnvelopeMalformed(
            "payload contains no root element".into(),
        ));
    }

    Ok(Envelope {
        from,
        thread,
        to,
        payload,
    })
}

fn local_name(e: &BytesStart) -> String {
    let full = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    full.rsplit(':').next().unwrap_or(&full).to_string()
}

fn read_text(reader: &mut Reader<&[u8]>) -> Result<String, PreprocessError> {
    let mut buf = Vec::new();
    match reader.read_event_into(&mut buf) {
        Ok(Event::Text(t)) => Ok(t
            .unescape()
            .map_err(|e| PreprocessError::EnvelopeMalformed(e.to_string()))?
            .into_owned()),
        Ok(Event::End(_)) => Ok(String::new()),
        Ok(_) => Ok(String::new()),
        Err(e) => Err(PreprocessError::EnvelopeMalformed(e.to_string())),
    }
}

/// Re-serialize everything between a start tag and its matching end tag.
fn read_inner_xml(reader: &mut Reader<&[u8]>, tag: &str) -> Result<String, PreprocessError> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut depth = 0usize;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::End(e)) if local_name_of(&e) == tag && depth == 0 => break,
            Ok(Event::Start(e)) => {
                depth += 1;
                writer
                    .write_event(Event::Start(e))
                    .map_err(|e| PreprocessError::EnvelopeMalformed(e.to_string()))?;
            }
            Ok(Event::End(e)) => {
                depth = depth.saturating_sub(1);
                writer
                    .write_event(Event::End(e))
                    .map_err(|e| PreprocessError::EnvelopeMalformed(e.to_string()))?;
            }
            Ok(Event::Eof) => {
                return Err(PreprocessError::EnvelopeMalformed(format!(
                    "unterminated <{tag}>"
                )))
            }
            Ok(event) => {
                writer
                    .write_event(event)
                    .map_err(|e| PreprocessError::EnvelopeMalformed(e.to_string()))?;
            }
            Err(e) => return Err(PreprocessError::EnvelopeMalformed(e.to_string())),
        }
        buf.clear();
    }
    Ok(String::from_utf8_lossy(&writer.into_inner().into_inner()).into_owned())
}

fn local_name_of(e: &quick_xml::events::BytesEnd) -> String {
    let full = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    full.rsplit(':').next().unwrap_or(&full).to_string()
}

/// A minimal generic XML element tree, used by schema validation and
/// deserialization to walk a payload body against a [`crate::field::FieldDescriptor`]
/// list without re-parsing for every stage.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct XmlElement {
    pub name: String,
    pub text: String,
    pub children: Vec<XmlElement>,
}

/// Parse `xml` (expected to be a single root element) into a generic tree.
pub fn parse_element_tree(xml: &str) -> Result<XmlElement, PreprocessError> {
    let mut reader = Reader::from_reader(xml.as_bytes());
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                stack.push(XmlElement {
                    name: local_name(&e),
                    text: String::new(),
                    children: Vec::new(),
                });
            }
            Ok(Event::Empty(e)) => {
                let elem = XmlElement {
                    name: local_name(&e),
                    text: String::new(),
                    children: Vec::new(),
                };
                push_finished(&mut stack, &mut root, elem);
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| PreprocessError::SchemaViolation(e.to_string()))?
                    .into_owned();
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text);
                }
            }
            Ok(Event::End(_)) => {
                if let Some(elem) = stack.pop() {
                    push_finished(&mut stack, &mut root, elem);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(PreprocessError::SchemaViolation(e.to_string())),
        }
        buf.clear();
    }

    root.ok_or_else(|| PreprocessError::SchemaViolation("empty payload".into()))
}

fn push_finished(stack: &mut Vec<XmlElement>, root: &mut Option<XmlElement>, elem: XmlElement) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(elem);
    } else {
        *root = Some(elem);
    }
}

/// Extract the tag name of the single payload root element (the derived
/// root tag a message targets).
pub fn payload_root_tag(payload_xml: &str) -> Result<String, PreprocessError> {
    let mut reader = Reader::from_reader(payload_xml.as_bytes());
    reader.trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => return Ok(local_name(&e)),
            Ok(Event::Eof) => {
                return Err(PreprocessError::EnvelopeMalformed(
                    "payload contains no root element".into(),
                ))
            }
            Ok(_) => {}
            Err(e) => return Err(PreprocessError::EnvelopeMalformed(e.to_string())),
        }
        buf.clear();
    }
}

/// Build a canonical envelope for injection into ingress.
pub fn build_envelope(from: &str, thread: &str, to: Option<&str>, payload_xml: &str) -> Vec<u8> {
    let to_elem = to
        .map(|t| format!("<to>{}</to>", xml_escape(t)))
        .unwrap_or_default();
    format!(
        "<message xmlns=\"{ns}\"><from>{from}</from><thread>{thread}</thread>{to_elem}<payload>{payload}</payload></message>",
        ns = ENVELOPE_NS,
        from = xml_escape(from),
        thread = xml_escape(thread),
        to_elem = to_elem,
        payload = payload_xml,
    )
    .into_bytes()
}
