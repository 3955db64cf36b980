//! Envelope & schema store.
//!
//! The envelope schema is fixed and shared: one outermost form for every
//! message on the bus. Payload schemas are declared per listener, compiled
//! once at registration, and cached for the listener's lifetime. Compiled
//! schemas also render to `schemas/<name>/v1.xsd` on disk so operators can
//! inspect the live contract.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::xml::{canon, Element};

/// Namespace of the shared envelope schema.
pub const ENVELOPE_NS: &str = "https://xml-pipeline.org/ns/envelope/v1";

/// Namespace of system payloads (`huh`, `boot`, lifecycle primitives).
pub const SYSTEM_NS: &str = "https://xml-pipeline.org/ns/system/v1";

/// Sender identifier the pump uses for system-generated messages.
pub const CORE_SENDER: &str = "core";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("envelope: {0}")]
    Envelope(String),

    #[error("payload: {0}")]
    Payload(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Envelope ──

/// The outer wrapper: sender, thread, optional direct target, one payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub from: String,
    pub thread: String,
    pub to: Option<String>,
    pub payload: Element,
}

impl Envelope {
    /// Construct an envelope from pump-authoritative values.
    pub fn build(from: &str, thread: &str, to: Option<&str>, payload: Element) -> Self {
        Self {
            from: from.to_string(),
            thread: thread.to_string(),
            to: to.map(|t| t.to_string()),
            payload,
        }
    }

    /// Validate a parsed tree against the envelope schema.
    pub fn parse(root: &Element) -> Result<Self, SchemaError> {
        if root.name != "message" {
            return Err(SchemaError::Envelope(format!(
                "expected <message>, got <{}>",
                root.name
            )));
        }
        if let Some(ns) = root.namespace() {
            if ns != ENVELOPE_NS {
                return Err(SchemaError::Envelope(format!(
                    "unexpected envelope namespace '{ns}'"
                )));
            }
        }

        let from = root
            .child_text("from")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SchemaError::Envelope("missing <from>".into()))?;
        let thread = root
            .child_text("thread")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SchemaError::Envelope("missing <thread>".into()))?;
        let to = root.child_text("to").filter(|s| !s.is_empty());

        let payloads: Vec<&Element> = root
            .elements()
            .filter(|e| !matches!(e.name.as_str(), "from" | "thread" | "to"))
            .collect();
        let payload = match payloads.as_slice() {
            [one] => (*one).clone(),
            [] => return Err(SchemaError::Envelope("missing payload element".into())),
            many => {
                return Err(SchemaError::Envelope(format!(
                    "expected exactly one payload element, got {}",
                    many.len()
                )))
            }
        };

        Ok(Self {
            from,
            thread,
            to,
            payload,
        })
    }

    pub fn to_element(&self) -> Element {
        let mut root = Element::new("message").with_attr("xmlns", ENVELOPE_NS);
        root = root.with_child(Element::new("from").with_text(&self.from));
        root = root.with_child(Element::new("thread").with_text(&self.thread));
        if let Some(ref to) = self.to {
            root = root.with_child(Element::new("to").with_text(to));
        }
        root.with_child(self.payload.clone())
    }

    /// Canonical wire bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canon::to_bytes(&self.to_element())
    }
}

// ── Payload schemas ──

/// Kind of a leaf field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Int,
    Float,
    Bool,
}

impl FieldKind {
    fn xsd_type(&self) -> &'static str {
        match self {
            FieldKind::Text => "xs:string",
            FieldKind::Int => "xs:long",
            FieldKind::Float => "xs:double",
            FieldKind::Bool => "xs:boolean",
        }
    }

    fn sample(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Int => "0",
            FieldKind::Float => "0.0",
            FieldKind::Bool => "false",
        }
    }
}

/// Declared field of a payload schema.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
        }
    }
}

/// Declared shape of a listener's payload.
#[derive(Debug, Clone)]
pub struct PayloadSchema {
    pub root_tag: String,
    pub namespace: Option<String>,
    pub fields: Vec<FieldSpec>,
    /// Strict schemas reject undeclared child elements.
    pub strict: bool,
}

impl PayloadSchema {
    pub fn new(root_tag: &str) -> Self {
        Self {
            root_tag: root_tag.to_string(),
            namespace: None,
            fields: Vec::new(),
            strict: true,
        }
    }

    pub fn with_namespace(mut self, ns: &str) -> Self {
        self.namespace = Some(ns.to_string());
        self
    }

    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn lenient(mut self) -> Self {
        self.strict = false;
        self
    }
}

/// A typed leaf value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    fn render(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Bool(b) => b.to_string(),
        }
    }
}

/// Deserialized payload: the tagged variant handlers operate on.
#[derive(Debug, Clone, Default)]
pub struct PayloadValue {
    pub tag: String,
    pub fields: BTreeMap<String, Value>,
}

impl PayloadValue {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(|v| v.as_str())
    }

    pub fn int(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(|v| v.as_int())
    }

    pub fn float(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(|v| v.as_float())
    }
}

/// A payload schema compiled for repeated validation.
#[derive(Debug)]
pub struct CompiledSchema {
    schema: PayloadSchema,
    by_name: HashMap<String, usize>,
}

impl CompiledSchema {
    pub fn compile(schema: PayloadSchema) -> Self {
        let by_name = schema
            .fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Self { schema, by_name }
    }

    pub fn root_tag(&self) -> &str {
        &self.schema.root_tag
    }

    pub fn namespace(&self) -> Option<&str> {
        self.schema.namespace.as_deref()
    }

    /// Validate a payload tree. Errors carry enough text for a `<huh>`
    /// diagnostic the sender can act on.
    pub fn validate(&self, payload: &Element) -> Result<(), SchemaError> {
        if payload.name != self.schema.root_tag {
            return Err(SchemaError::Payload(format!(
                "expected <{}>, got <{}>",
                self.schema.root_tag, payload.name
            )));
        }
        if let (Some(want), Some(got)) = (self.schema.namespace.as_deref(), payload.namespace()) {
            if want != got {
                return Err(SchemaError::Payload(format!(
                    "<{}> namespace '{got}' does not match schema namespace '{want}'",
                    payload.name
                )));
            }
        }

        for field in &self.schema.fields {
            match payload.child(&field.name) {
                Some(child) => {
                    let text = child.text();
                    let ok = match field.kind {
                        FieldKind::Text => true,
                        FieldKind::Int => text.trim().parse::<i64>().is_ok(),
                        FieldKind::Float => text.trim().parse::<f64>().is_ok(),
                        FieldKind::Bool => matches!(text.trim(), "true" | "false"),
                    };
                    if !ok {
                        return Err(SchemaError::Payload(format!(
                            "<{}> is not a valid {:?}: '{text}'",
                            field.name, field.kind
                        )));
                    }
                }
                None if field.required => {
                    return Err(SchemaError::Payload(format!(
                        "missing required <{}>",
                        field.name
                    )));
                }
                None => {}
            }
        }

        if self.schema.strict {
            for child in payload.elements() {
                if !self.by_name.contains_key(&child.name) {
                    return Err(SchemaError::Payload(format!(
                        "undeclared element <{}>",
                        child.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Deserialize a validated tree into the tagged variant.
    pub fn deserialize(&self, payload: &Element) -> Result<PayloadValue, SchemaError> {
        self.validate(payload)?;
        let mut fields = BTreeMap::new();
        for field in &self.schema.fields {
            let Some(child) = payload.child(&field.name) else {
                continue;
            };
            let text = child.text();
            let value = match field.kind {
                FieldKind::Text => Value::Text(text),
                FieldKind::Int => Value::Int(text.trim().parse().map_err(|_| {
                    SchemaError::Payload(format!("<{}>: not an integer", field.name))
                })?),
                FieldKind::Float => Value::Float(text.trim().parse().map_err(|_| {
                    SchemaError::Payload(format!("<{}>: not a number", field.name))
                })?),
                FieldKind::Bool => Value::Bool(text.trim() == "true"),
            };
            fields.insert(field.name.clone(), value);
        }
        Ok(PayloadValue {
            tag: payload.name.clone(),
            fields,
        })
    }

    /// Serialize a tagged variant back to a payload tree.
    pub fn serialize(&self, value: &PayloadValue) -> Element {
        let mut el = Element::new(&self.schema.root_tag);
        if let Some(ref ns) = self.schema.namespace {
            el.set_attr("xmlns", ns);
        }
        // Declared order, not map order.
        for field in &self.schema.fields {
            if let Some(v) = value.fields.get(&field.name) {
                el.children.push(crate::xml::Node::Element(
                    Element::new(&field.name).with_text(&v.render()),
                ));
            }
        }
        el
    }

    /// An example payload for introspection queries.
    pub fn example(&self) -> Element {
        let mut el = Element::new(&self.schema.root_tag);
        if let Some(ref ns) = self.schema.namespace {
            el.set_attr("xmlns", ns);
        }
        for field in self.schema.fields.iter().filter(|f| f.required) {
            el.children.push(crate::xml::Node::Element(
                Element::new(&field.name).with_text(field.kind.sample()),
            ));
        }
        el
    }

    /// Render the schema as a minimal XSD document.
    pub fn to_xsd(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str("<xs:schema xmlns:xs=\"http://www.w3.org/2001/XMLSchema\"");
        if let Some(ref ns) = self.schema.namespace {
            out.push_str(&format!(" targetNamespace=\"{ns}\""));
        }
        out.push_str(">\n");
        out.push_str(&format!("  <xs:element name=\"{}\">\n", self.schema.root_tag));
        out.push_str("    <xs:complexType>\n      <xs:all>\n");
        for field in &self.schema.fields {
            let min = if field.required { 1 } else { 0 };
            out.push_str(&format!(
                "        <xs:element name=\"{}\" type=\"{}\" minOccurs=\"{min}\"/>\n",
                field.name,
                field.kind.xsd_type()
            ));
        }
        out.push_str("      </xs:all>\n    </xs:complexType>\n  </xs:element>\n</xs:schema>\n");
        out
    }
}

/// Deserialize without a declared schema: every child element becomes a
/// text field, direct text lands in `text`. System payloads and diagnostics
/// reach handlers through this.
pub fn lenient_value(payload: &Element) -> PayloadValue {
    let mut fields = BTreeMap::new();
    for child in payload.elements() {
        fields.insert(child.name.clone(), Value::Text(child.text()));
    }
    let own_text = payload.text();
    if !own_text.trim().is_empty() {
        fields.insert("text".to_string(), Value::Text(own_text.trim().to_string()));
    }
    PayloadValue {
        tag: payload.name.clone(),
        fields,
    }
}

// ── Store ──

/// Caches compiled schemas by listener name and persists their XSD form.
#[derive(Debug, Default)]
pub struct SchemaStore {
    dir: Option<PathBuf>,
    cache: HashMap<String, Arc<CompiledSchema>>,
}

impl SchemaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that persists compiled schemas under `dir/<name>/v1.xsd`.
    pub fn with_dir(dir: &Path) -> Self {
        Self {
            dir: Some(dir.to_path_buf()),
            cache: HashMap::new(),
        }
    }

    /// Compile and cache a schema for a listener.
    pub fn compile(
        &mut self,
        listener: &str,
        schema: PayloadSchema,
    ) -> Result<Arc<CompiledSchema>, SchemaError> {
        let compiled = Arc::new(CompiledSchema::compile(schema));
        if let Some(ref dir) = self.dir {
            let schema_dir = dir.join(listener);
            std::fs::create_dir_all(&schema_dir)?;
            std::fs::write(schema_dir.join("v1.xsd"), compiled.to_xsd())?;
        }
        self.cache.insert(listener.to_string(), compiled.clone());
        Ok(compiled)
    }

    pub fn get(&self, listener: &str) -> Option<Arc<CompiledSchema>> {
        self.cache.get(listener).cloned()
    }

    pub fn remove(&mut self, listener: &str) {
        self.cache.remove(listener);
    }
}
