//! Out-of-band command handler — the privileged control channel.
//!
//! Commands arrive on a loopback endpoint, in the same envelope framing as
//! the main bus but with payloads from the privileged schema:
//! `add-listener`, `remove-listener`, `hot-reload`, `introspect`,
//! `prune-thread`, `shutdown`. Every payload carries an ed25519 signature
//! (hex, in a `sig`
//! attribute) over its canonical bytes; verification failure is logged and
//! the command is dropped. Structural effects apply atomically through the
//! bus and are visible to routing immediately.
//!
//! The main bus never learns these shapes: they have no registered root
//! tag there, so a leaked privileged payload dies in routing resolution.

use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bus::Bus;
use crate::organism::factory::{build_specs, AgentRuntime, HandlerFactory};
use crate::organism::parser::parse_organism;
use crate::registry::ListenerKind;
use crate::schema::{Envelope, FieldKind, FieldSpec, PayloadSchema, CORE_SENDER};
use crate::server::auth::{decode_hex, encode_hex};
use crate::xml::{canon, repair, Element, Node};

pub const OOB_NS: &str = "https://xml-pipeline.org/ns/oob/v1";

/// Attribute carrying the command signature.
pub const SIG_ATTR: &str = "sig";

/// Executes verified privileged commands against the bus.
pub struct OobCommander {
    bus: Arc<Bus>,
    verifying_key: VerifyingKey,
    factory: Arc<HandlerFactory>,
    agent_runtime: Option<AgentRuntime>,
    shutdown_tx: mpsc::Sender<()>,
}

impl OobCommander {
    pub fn new(
        bus: Arc<Bus>,
        verifying_key: VerifyingKey,
        factory: Arc<HandlerFactory>,
        agent_runtime: Option<AgentRuntime>,
        shutdown_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            bus,
            verifying_key,
            factory,
            agent_runtime,
            shutdown_tx,
        }
    }

    /// Process one frame from the OOB socket; the reply goes back on the
    /// same socket, never onto the bus.
    pub async fn handle_frame(&self, raw: &[u8]) -> Vec<u8> {
        let envelope = repair::parse(raw).and_then(|tree| Envelope::parse(&tree).ok());
        let Some(envelope) = envelope else {
            return reply_envelope("-", result_err("frame is not a valid envelope"));
        };
        let thread = envelope.thread.clone();

        let mut payload = envelope.payload.clone();
        if let Err(reason) = self.verify_signature(&mut payload) {
            warn!(target: "security", reason = %reason, tag = %payload.name, "OOB signature rejected");
            return reply_envelope(&thread, result_err("rejected"));
        }

        let result = match payload.name.as_str() {
            "add-listener" => self.add_listener(&payload).await,
            "remove-listener" => self.remove_listener(&payload).await,
            "hot-reload" => self.hot_reload(&payload).await,
            "introspect" => self.introspect().await,
            "prune-thread" => self.prune_thread(&payload).await,
            "shutdown" => {
                info!("shutdown requested via OOB");
                let _ = self.shutdown_tx.send(()).await;
                Ok(result_ok("shutting down"))
            }
            other => Err(format!("unknown privileged command '{other}'")),
        };

        match result {
            Ok(element) => reply_envelope(&thread, element),
            Err(reason) => reply_envelope(&thread, result_err(&reason)),
        }
    }

    /// Strip the signature attribute and verify it against the canonical
    /// bytes of what remains.
    fn verify_signature(&self, payload: &mut Element) -> Result<(), String> {
        let sig_hex = payload
            .remove_attr(SIG_ATTR)
            .ok_or_else(|| "missing signature".to_string())?;
        let sig_bytes = decode_hex(&sig_hex).ok_or_else(|| "signature is not hex".to_string())?;
        let sig_raw: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| "signature has the wrong length".to_string())?;
        let signature = Signature::from_bytes(&sig_raw);

        self.verifying_key
            .verify(&canon::to_bytes(payload), &signature)
            .map_err(|_| "signature does not verify".to_string())
    }

    // ── Commands ──

    async fn add_listener(&self, payload: &Element) -> Result<Element, String> {
        let name = required_child(payload, "name")?;
        let description = required_child(payload, "description")?;
        let handler_ref = required_child(payload, "handler")?;
        let kind = match payload.child_text("kind").as_deref() {
            None | Some("tool") => ListenerKind::Tool,
            Some("agent") => ListenerKind::Agent,
            Some(other) => return Err(format!("unknown listener kind '{other}'")),
        };
        let handler = self
            .factory
            .resolve(&handler_ref)
            .ok_or_else(|| format!("unknown handler reference '{handler_ref}'"))?;

        let root_tag = payload
            .child_text("root-tag")
            .unwrap_or_else(|| crate::bus::derive_root_tag(&name, None));
        let mut schema = PayloadSchema::new(&root_tag);
        if let Some(ns) = payload.child_text("namespace") {
            schema = schema.with_namespace(&ns);
        }
        for field in payload.elements().filter(|e| e.name == "field") {
            let field_name = field
                .attr("name")
                .ok_or_else(|| "field without a name".to_string())?;
            let kind = match field.attr("kind").unwrap_or("text") {
                "text" | "string" => FieldKind::Text,
                "int" => FieldKind::Int,
                "float" | "number" => FieldKind::Float,
                "bool" => FieldKind::Bool,
                other => return Err(format!("unknown field kind '{other}'")),
            };
            schema = schema.with_field(FieldSpec {
                name: field_name.to_string(),
                kind,
                required: field.attr("required") == Some("true"),
            });
        }

        let peers = payload
            .elements()
            .filter(|e| e.name == "peer")
            .map(|e| e.text())
            .collect();

        self.bus
            .add_listener(crate::bus::ListenerSpec {
                name: name.clone(),
                schema,
                description,
                kind,
                peers,
                share: payload
                    .child_text("share")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.1),
                handler,
            })
            .await?;
        Ok(result_ok(&format!("listener '{name}' registered")))
    }

    async fn remove_listener(&self, payload: &Element) -> Result<Element, String> {
        let name = required_child(payload, "name")?;
        self.bus.remove_listener(&name).await?;
        Ok(result_ok(&format!("listener '{name}' removed")))
    }

    async fn prune_thread(&self, payload: &Element) -> Result<Element, String> {
        let thread = required_child(payload, "thread")?;
        let reason = payload
            .child_text("reason")
            .unwrap_or_else(|| "pruned by operator".to_string());
        self.bus.force_prune(&thread, &reason)?;
        Ok(result_ok(&format!("thread '{thread}' pruned")))
    }

    async fn hot_reload(&self, payload: &Element) -> Result<Element, String> {
        let yaml = required_child(payload, "config")?;
        let organism = parse_organism(&yaml)?;
        let specs = build_specs(&organism, &self.factory, self.agent_runtime.as_ref())?;
        let event = self.bus.reload(specs).await?;

        let mut result = result_ok("reload applied");
        result.set_attr("added", &event.added.len().to_string());
        result.set_attr("removed", &event.removed.len().to_string());
        result.set_attr("updated", &event.updated.len().to_string());
        Ok(result)
    }

    async fn introspect(&self) -> Result<Element, String> {
        let mut result = Element::new("oob-result")
            .with_attr("xmlns", OOB_NS)
            .with_attr("ok", "true")
            .with_attr("organism", self.bus.organism());

        let registry = self.bus.registry.read().await;
        let mut listeners = Element::new("listeners");
        for name in registry.names() {
            let record = registry.lookup_by_name(&name).expect("listed name");
            listeners.children.push(Node::Element(
                Element::new("listener")
                    .with_attr("name", &record.name)
                    .with_attr("root-tag", &record.root_tag)
                    .with_attr(
                        "kind",
                        match record.kind {
                            ListenerKind::Tool => "tool",
                            ListenerKind::Agent => "agent",
                        },
                    ),
            ));
        }
        result.children.push(Node::Element(listeners));

        // Private paths are admissible here: this is the forensic surface.
        let paths = self.bus.paths.lock().await;
        let threads = Element::new("threads").with_attr("count", &paths.len().to_string());
        drop(paths);
        result.children.push(Node::Element(threads));
        Ok(result)
    }
}

/// Sign a command payload in place (operator tooling and tests). The
/// signature covers the canonical bytes after a parse round trip, so both
/// sides see identical whitespace handling.
pub fn sign_command(payload: &mut Element, key: &SigningKey) {
    payload.remove_attr(SIG_ATTR);
    let bytes = canon::to_bytes(payload);
    let normalized = repair::parse(&bytes)
        .map(|e| canon::to_bytes(&e))
        .unwrap_or(bytes);
    let signature = key.sign(&normalized);
    payload.set_attr(SIG_ATTR, &encode_hex(&signature.to_bytes()));
}

fn required_child(payload: &Element, name: &str) -> Result<String, String> {
    payload
        .child_text(name)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("missing <{name}>"))
}

fn result_ok(text: &str) -> Element {
    Element::new("oob-result")
        .with_attr("xmlns", OOB_NS)
        .with_attr("ok", "true")
        .with_text(text)
}

fn result_err(text: &str) -> Element {
    Element::new("oob-result")
        .with_attr("xmlns", OOB_NS)
        .with_attr("ok", "false")
        .with_text(text)
}

fn reply_envelope(thread: &str, payload: Element) -> Vec<u8> {
    Envelope::build(CORE_SENDER, thread, None, payload).canonical_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusBuilder;
    use crate::handler::{FnHandler, HandlerContext, HandlerResponse, ValidatedPayload};

    fn noop() -> Arc<dyn crate::handler::Handler> {
        Arc::new(FnHandler(
            |_p: ValidatedPayload, _ctx: HandlerContext| {
                Box::pin(async move { Ok(HandlerResponse::None) }) as _
            },
        ))
    }

    async fn commander() -> (OobCommander, SigningKey, mpsc::Receiver<()>) {
        let bus = Arc::new(BusBuilder::new("test-org").build().await.unwrap());
        let key = SigningKey::from_bytes(&[42u8; 32]);
        let mut factory = HandlerFactory::new();
        factory.insert("builtin.echo", noop());
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let commander = OobCommander::new(
            bus,
            key.verifying_key(),
            Arc::new(factory),
            None,
            shutdown_tx,
        );
        (commander, key, shutdown_rx)
    }

    fn command_envelope(payload: Element) -> Vec<u8> {
        Envelope::build("operator", "oob-1", None, payload).canonical_bytes()
    }

    fn signed(mut payload: Element, key: &SigningKey) -> Vec<u8> {
        sign_command(&mut payload, key);
        command_envelope(payload)
    }

    fn add_listener_payload() -> Element {
        Element::new("add-listener")
            .with_attr("xmlns", OOB_NS)
            .with_child(Element::new("name").with_text("echo"))
            .with_child(Element::new("description").with_text("Echo tool"))
            .with_child(Element::new("handler").with_text("builtin.echo"))
            .with_child(Element::new("root-tag").with_text("ping"))
    }

    #[tokio::test]
    async fn unsigned_command_rejected() {
        let (commander, _key, _rx) = commander().await;
        let reply = commander
            .handle_frame(&command_envelope(add_listener_payload()))
            .await;
        let text = String::from_utf8(reply).unwrap();
        assert!(text.contains("ok=\"false\""));
        assert!(text.contains("rejected"));

        // Nothing was registered.
        assert!(!commander.bus.registry.read().await.contains("echo"));
    }

    #[tokio::test]
    async fn forged_signature_rejected() {
        let (commander, _key, _rx) = commander().await;
        let wrong_key = SigningKey::from_bytes(&[7u8; 32]);
        let reply = commander
            .handle_frame(&signed(add_listener_payload(), &wrong_key))
            .await;
        assert!(String::from_utf8(reply).unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn signed_add_then_remove_listener() {
        let (commander, key, _rx) = commander().await;

        let reply = commander
            .handle_frame(&signed(add_listener_payload(), &key))
            .await;
        let text = String::from_utf8(reply).unwrap();
        assert!(text.contains("ok=\"true\""), "got: {text}");
        assert!(commander.bus.registry.read().await.contains("echo"));

        let remove = Element::new("remove-listener")
            .with_attr("xmlns", OOB_NS)
            .with_child(Element::new("name").with_text("echo"));
        let reply = commander.handle_frame(&signed(remove, &key)).await;
        assert!(String::from_utf8(reply).unwrap().contains("ok=\"true\""));
        assert!(!commander.bus.registry.read().await.contains("echo"));
    }

    #[tokio::test]
    async fn tampered_payload_fails_verification() {
        let (commander, key, _rx) = commander().await;
        let mut payload = add_listener_payload();
        sign_command(&mut payload, &key);
        // Tamper after signing.
        payload.children.push(Node::Element(
            Element::new("peer").with_text("smuggled"),
        ));
        let reply = commander.handle_frame(&command_envelope(payload)).await;
        assert!(String::from_utf8(reply).unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn introspect_lists_roster() {
        let (commander, key, _rx) = commander().await;
        commander
            .handle_frame(&signed(add_listener_payload(), &key))
            .await;

        let introspect = Element::new("introspect").with_attr("xmlns", OOB_NS);
        let reply = commander.handle_frame(&signed(introspect, &key)).await;
        let text = String::from_utf8(reply).unwrap();
        assert!(text.contains("organism=\"test-org\""));
        assert!(text.contains("name=\"echo\""));
    }

    #[tokio::test]
    async fn shutdown_signals_main() {
        let (commander, key, mut rx) = commander().await;
        let shutdown = Element::new("shutdown").with_attr("xmlns", OOB_NS);
        let reply = commander.handle_frame(&signed(shutdown, &key)).await;
        assert!(String::from_utf8(reply).unwrap().contains("shutting down"));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn hot_reload_applies_roster() {
        let (commander, key, _rx) = commander().await;
        let yaml = r#"
organism:
  name: test-org
listeners:
  - name: echo
    payload_type: Echo
    handler: builtin.echo
    description: "Echo"
"#;
        let reload = Element::new("hot-reload")
            .with_attr("xmlns", OOB_NS)
            .with_child(Element::new("config").with_text(yaml));
        let reply = commander.handle_frame(&signed(reload, &key)).await;
        let text = String::from_utf8(reply).unwrap();
        assert!(text.contains("ok=\"true\""), "got: {text}");
        assert!(text.contains("added=\"1\""));
        assert!(commander.bus.registry.read().await.contains("echo"));
    }

    #[tokio::test]
    async fn prune_thread_cancels_subtree() {
        let (commander, key, _rx) = commander().await;
        commander.bus.paths.lock().await.adopt_root("t-doomed", None);

        let prune = Element::new("prune-thread")
            .with_attr("xmlns", OOB_NS)
            .with_child(Element::new("thread").with_text("t-doomed"));
        let reply = commander.handle_frame(&signed(prune, &key)).await;
        assert!(String::from_utf8(reply).unwrap().contains("ok=\"true\""));

        // The pump processes the control message asynchronously.
        let mut tries = 0;
        while commander.bus.paths.lock().await.contains("t-doomed") {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            tries += 1;
            assert!(tries < 100, "thread was never pruned");
        }
    }

    #[tokio::test]
    async fn unknown_command_reports_error() {
        let (commander, key, _rx) = commander().await;
        let bogus = Element::new("make-coffee").with_attr("xmlns", OOB_NS);
        let reply = commander.handle_frame(&signed(bogus, &key)).await;
        assert!(String::from_utf8(reply)
            .unwrap()
            .contains("unknown privileged command"));
    }
}
