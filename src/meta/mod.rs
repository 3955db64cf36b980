//! Meta listener — introspection over the capability table.
//!
//! Answers schema, example, prompt-fragment and capability-list queries.
//! Each operation is gated by a configured privilege level; callers on the
//! main bus are authenticated by construction, and only the core itself
//! counts as admin.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::handler::{
    Handler, HandlerContext, HandlerFailure, HandlerResponse, HandlerResult, ValidatedPayload,
};
use crate::registry::{ListenerKind, ListenerRegistry};
use crate::schema::{FieldKind, FieldSpec, PayloadSchema, CORE_SENDER};
use crate::xml::{canon, Element, Node};

pub const META_NS: &str = "https://xml-pipeline.org/ns/meta/v1";

/// Privilege required for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetaGate {
    /// Open to anyone on the bus.
    None,
    /// Any authenticated participant (the main-bus default).
    #[default]
    Authenticated,
    /// Core only.
    Admin,
}

impl MetaGate {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(MetaGate::None),
            "authenticated" => Some(MetaGate::Authenticated),
            "admin" => Some(MetaGate::Admin),
            _ => None,
        }
    }
}

/// Per-operation gates from configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetaFlags {
    pub schema: MetaGate,
    pub example: MetaGate,
    pub prompt: MetaGate,
    pub capabilities: MetaGate,
}

/// Payload contract for `<meta-query>`.
pub fn schema() -> PayloadSchema {
    PayloadSchema::new("meta-query")
        .with_namespace(META_NS)
        .with_field(FieldSpec::required("op", FieldKind::Text))
        .with_field(FieldSpec::optional("target", FieldKind::Text))
}

pub struct MetaHandler {
    registry: Arc<RwLock<ListenerRegistry>>,
    flags: MetaFlags,
}

impl MetaHandler {
    pub fn new(registry: Arc<RwLock<ListenerRegistry>>, flags: MetaFlags) -> Self {
        Self { registry, flags }
    }

    fn caller_level(ctx: &HandlerContext) -> MetaGate {
        if ctx.from == CORE_SENDER {
            MetaGate::Admin
        } else {
            MetaGate::Authenticated
        }
    }

    fn permitted(gate: MetaGate, level: MetaGate) -> bool {
        match gate {
            MetaGate::None => true,
            MetaGate::Authenticated => {
                matches!(level, MetaGate::Authenticated | MetaGate::Admin)
            }
            MetaGate::Admin => level == MetaGate::Admin,
        }
    }
}

#[async_trait]
impl Handler for MetaHandler {
    async fn handle(&self, payload: ValidatedPayload, ctx: HandlerContext) -> HandlerResult {
        let op = payload
            .value
            .text("op")
            .ok_or_else(|| HandlerFailure::Failed("missing <op>".into()))?
            .to_string();
        let target = payload.value.text("target").map(str::to_string);
        let level = Self::caller_level(&ctx);

        let gate = match op.as_str() {
            "schema" => self.flags.schema,
            "example" => self.flags.example,
            "prompt" => self.flags.prompt,
            "capabilities" => self.flags.capabilities,
            other => {
                return Err(HandlerFailure::Failed(format!(
                    "unknown meta operation '{other}'"
                )))
            }
        };
        if !Self::permitted(gate, level) {
            return Err(HandlerFailure::Failed(format!(
                "meta operation '{op}' requires a higher privilege level"
            )));
        }

        let registry = self.registry.read().await;
        let mut response = Element::new("meta-response")
            .with_attr("xmlns", META_NS)
            .with_attr("op", &op);

        match op.as_str() {
            "capabilities" => {
                for name in registry.names() {
                    let record = registry.lookup_by_name(&name).expect("listed name");
                    let kind = match record.kind {
                        ListenerKind::Tool => "tool",
                        ListenerKind::Agent => "agent",
                    };
                    response.children.push(Node::Element(
                        Element::new("capability")
                            .with_attr("name", &record.name)
                            .with_attr("kind", kind)
                            .with_attr("root-tag", &record.root_tag)
                            .with_text(&record.description),
                    ));
                }
            }
            _ => {
                let target = target.ok_or_else(|| {
                    HandlerFailure::Failed(format!("meta operation '{op}' needs a <target>"))
                })?;
                let record = registry.lookup_by_name(&target).ok_or_else(|| {
                    HandlerFailure::Failed(format!("unknown capability '{target}'"))
                })?;
                response.set_attr("target", &target);
                match op.as_str() {
                    "schema" => {
                        response.children.push(Node::Element(
                            Element::new("schema").with_text(&record.schema.to_xsd()),
                        ));
                    }
                    "example" => {
                        response
                            .children
                            .push(Node::Element(record.schema.example()));
                    }
                    "prompt" => {
                        let fragment = format!(
                            "{}: {}. Emit <{}> payloads, e.g. {}",
                            record.name,
                            record.description,
                            record.root_tag,
                            String::from_utf8_lossy(&canon::to_bytes(&record.schema.example())),
                        );
                        response.children.push(Node::Element(
                            Element::new("fragment").with_text(&fragment),
                        ));
                    }
                    _ => unreachable!("gated above"),
                }
            }
        }

        Ok(HandlerResponse::Reply(canon::to_bytes(&response)))
    }
}
