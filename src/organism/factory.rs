//! Handler factory — resolves configured handler references.
//!
//! The configuration names handlers by reference string
//! (`tools.calculate.add`); the factory maps those to vetted handler
//! instances registered at bootstrap. Dynamic code loading is deliberately
//! absent: a handler reference that isn't in the factory is a
//! configuration error.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::agents::{AgentConfig, AgentHandler};
use crate::bus::{derive_root_tag, ListenerSpec};
use crate::handler::Handler;
use crate::llm::LlmPool;
use crate::registry::ListenerKind;
use crate::schema::{FieldKind, FieldSpec, PayloadSchema};
use crate::threads::PathRegistry;

use super::Organism;

#[derive(Default)]
pub struct HandlerFactory {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reference: &str, handler: Arc<dyn Handler>) {
        self.handlers.insert(reference.to_string(), handler);
    }

    pub fn resolve(&self, reference: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(reference).cloned()
    }

    pub fn references(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }
}

/// What agent handlers need beyond configuration.
#[derive(Clone)]
pub struct AgentRuntime {
    pub pool: Arc<Mutex<LlmPool>>,
    pub paths: Arc<Mutex<PathRegistry>>,
}

fn parse_field_kind(kind: &str) -> Result<FieldKind, String> {
    match kind {
        "text" | "string" => Ok(FieldKind::Text),
        "int" => Ok(FieldKind::Int),
        "float" | "number" => Ok(FieldKind::Float),
        "bool" => Ok(FieldKind::Bool),
        other => Err(format!("unknown field kind '{other}'")),
    }
}

/// Turn the organism's roster into registrable listener specs.
///
/// Gateways are wired separately (they need live connections); agents
/// require an `AgentRuntime`.
pub fn build_specs(
    org: &Organism,
    factory: &HandlerFactory,
    agent_runtime: Option<&AgentRuntime>,
) -> Result<Vec<ListenerSpec>, String> {
    let mut specs = Vec::new();

    for listener in org.listeners() {
        let handler = factory.resolve(&listener.handler).ok_or_else(|| {
            format!(
                "listener '{}': unknown handler reference '{}'",
                listener.name, listener.handler
            )
        })?;

        let mut schema = PayloadSchema::new(&derive_root_tag(
            &listener.payload_type,
            listener.root_tag.as_deref(),
        ));
        if let Some(ref ns) = listener.namespace {
            schema = schema.with_namespace(ns);
        }
        if !listener.strict {
            schema = schema.lenient();
        }
        for field in &listener.fields {
            let kind = parse_field_kind(&field.kind)
                .map_err(|e| format!("listener '{}': {e}", listener.name))?;
            schema = schema.with_field(FieldSpec {
                name: field.name.clone(),
                kind,
                required: field.required,
            });
        }

        specs.push(ListenerSpec {
            name: listener.name.clone(),
            schema,
            description: listener.description.clone(),
            kind: ListenerKind::Tool,
            peers: Vec::new(),
            share: 0.0,
            handler,
        });
    }

    for agent in org.agents() {
        let runtime = agent_runtime
            .ok_or_else(|| format!("agent '{}' configured but no LLM pool available", agent.name))?;

        let prompt = match (&agent.prompt, &agent.system_prompt) {
            (Some(inline), _) => inline.clone(),
            (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
                format!(
                    "agent '{}': cannot read system prompt {}: {e}",
                    agent.name,
                    path.display()
                )
            })?,
            (None, None) => {
                return Err(format!(
                    "agent '{}' has neither a prompt nor a system_prompt path",
                    agent.name
                ))
            }
        };

        let mut config = AgentConfig::new(&agent.name, &prompt);
        config.model = agent.model.clone();
        config.max_tokens = agent.max_tokens;

        let schema =
            PayloadSchema::new(&derive_root_tag(&agent.name, agent.root_tag.as_deref())).lenient();

        specs.push(ListenerSpec {
            name: agent.name.clone(),
            schema,
            description: agent.description.clone(),
            kind: ListenerKind::Agent,
            peers: agent.peers.clone(),
            share: agent.share,
            handler: Arc::new(AgentHandler::new(
                runtime.pool.clone(),
                runtime.paths.clone(),
                config,
            )),
        });
    }

    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{FnHandler, HandlerContext, HandlerResponse, ValidatedPayload};
    use crate::organism::parser::parse_organism;

    fn noop() -> Arc<dyn Handler> {
        Arc::new(FnHandler(
            |_p: ValidatedPayload, _ctx: HandlerContext| {
                Box::pin(async move { Ok(HandlerResponse::None) }) as _
            },
        ))
    }

    fn runtime() -> AgentRuntime {
        AgentRuntime {
            pool: Arc::new(Mutex::new(LlmPool::new("test-key".into(), "sonnet"))),
            paths: Arc::new(Mutex::new(PathRegistry::new())),
        }
    }

    const YAML: &str = r#"
organism:
  name: demo
listeners:
  - name: calculator.add
    payload_type: calculator.Add
    handler: tools.calculate.add
    description: "Add"
    fields:
      - name: a
        kind: float
        required: true
agents:
  - name: researcher
    description: "Researcher"
    prompt: "You research."
    peers: [calculator.add]
    share: 0.5
"#;

    #[test]
    fn specs_built_from_roster() {
        let org = parse_organism(YAML).unwrap();
        let mut factory = HandlerFactory::new();
        factory.insert("tools.calculate.add", noop());

        let runtime = runtime();
        let specs = build_specs(&org, &factory, Some(&runtime)).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "calculator.add");
        assert_eq!(specs[0].kind, ListenerKind::Tool);
        assert_eq!(specs[0].schema.root_tag, "add");
        assert_eq!(specs[1].name, "researcher");
        assert_eq!(specs[1].kind, ListenerKind::Agent);
        assert_eq!(specs[1].share, 0.5);
    }

    #[test]
    fn unknown_handler_reference_fails() {
        let org = parse_organism(YAML).unwrap();
        let factory = HandlerFactory::new();
        let runtime = runtime();
        let err = build_specs(&org, &factory, Some(&runtime)).unwrap_err();
        assert!(err.contains("unknown handler reference"));
    }

    #[test]
    fn agents_without_pool_fail() {
        let org = parse_organism(YAML).unwrap();
        let mut factory = HandlerFactory::new();
        factory.insert("tools.calculate.add", noop());
        let err = build_specs(&org, &factory, None).unwrap_err();
        assert!(err.contains("no LLM pool"));
    }

    #[test]
    fn bad_field_kind_fails() {
        let yaml = r#"
organism:
  name: demo
listeners:
  - name: t
    payload_type: T
    handler: h
    description: "d"
    fields:
      - name: x
        kind: quaternion
"#;
        let org = parse_organism(yaml).unwrap();
        let mut factory = HandlerFactory::new();
        factory.insert("h", noop());
        let err = build_specs(&org, &factory, None).unwrap_err();
        assert!(err.contains("unknown field kind"));
    }
}
