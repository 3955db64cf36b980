//! Pipeline steps.
//!
//! Every step has the same shape: it reads and mutates a `MessageState`.
//! The default listener pipeline runs repair → canonicalize →
//! validate-envelope → extract-payload → validate-payload → deserialize →
//! resolve-routing. The system pipeline swaps the last three for a single
//! compose step that builds `<huh>`, `<thread-spawned>`,
//! `<system-thread-error>` and boot messages.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::registry::{ListenerRecord, ListenerRegistry};
use crate::schema::{self, Envelope, CORE_SENDER, SYSTEM_NS};
use crate::threads::PathRegistry;
use crate::xml::{canon, repair, Element};

use super::state::{
    MessageState, META_DROP, META_EGRESS, META_HOP, META_REINJECT, META_SYSTEM,
};

/// Flat token estimate: prompt assembly overhead plus ~4 bytes per token.
fn estimate_tokens(raw_len: usize) -> u32 {
    (raw_len / 4 + 48) as u32
}

/// Shared context the steps run against.
#[derive(Clone)]
pub struct StepContext {
    /// The owning listener; `None` on the system pipeline.
    pub listener: Option<Arc<ListenerRecord>>,
    pub registry: Arc<RwLock<ListenerRegistry>>,
    pub paths: Arc<Mutex<PathRegistry>>,
}

/// One preprocessing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Repair,
    Canonicalize,
    ValidateEnvelope,
    ExtractPayload,
    ValidatePayload,
    Deserialize,
    ResolveRouting,
    SystemCompose,
}

/// Ordered steps for a listener pipeline.
pub fn default_steps() -> Vec<Step> {
    vec![
        Step::Repair,
        Step::Canonicalize,
        Step::ValidateEnvelope,
        Step::ExtractPayload,
        Step::ValidatePayload,
        Step::Deserialize,
        Step::ResolveRouting,
    ]
}

/// Ordered steps for the permanent system pipeline. Payload schemas are
/// unknown here, so validation/deserialization are omitted.
pub fn system_steps() -> Vec<Step> {
    vec![
        Step::Repair,
        Step::Canonicalize,
        Step::ValidateEnvelope,
        Step::ExtractPayload,
        Step::SystemCompose,
    ]
}

impl Step {
    pub async fn run(&self, state: &mut MessageState, cx: &StepContext) {
        match self {
            Step::Repair => repair_step(state),
            Step::Canonicalize => canonicalize_step(state),
            Step::ValidateEnvelope => validate_envelope_step(state),
            Step::ExtractPayload => extract_payload_step(state),
            Step::ValidatePayload => validate_payload_step(state, cx),
            Step::Deserialize => deserialize_step(state, cx),
            Step::ResolveRouting => resolve_routing_step(state, cx).await,
            Step::SystemCompose => system_compose_step(state, cx).await,
        }
    }
}

fn repair_step(state: &mut MessageState) {
    match repair::parse(&state.raw) {
        Some(tree) => state.tree = Some(tree),
        None => state.fail("repair: no XML element could be recovered from the message"),
    }
}

fn canonicalize_step(state: &mut MessageState) {
    if let Some(ref tree) = state.tree {
        state.raw = canon::to_bytes(tree);
    }
}

/// Validate the envelope shape. Trusted provenance set by the entry point
/// always wins over whatever the wire (or a handler) wrote.
fn validate_envelope_step(state: &mut MessageState) {
    let Some(ref tree) = state.tree else {
        state.fail("validate-envelope: no tree");
        return;
    };
    let mut envelope = match Envelope::parse(tree) {
        Ok(env) => env,
        Err(e) => {
            state.fail(e.to_string());
            return;
        }
    };

    match state.from {
        Some(ref trusted) => envelope.from = trusted.clone(),
        None => state.from = Some(envelope.from.clone()),
    }
    match state.thread_id {
        Some(ref trusted) => envelope.thread = trusted.clone(),
        None => state.thread_id = Some(envelope.thread.clone()),
    }
    match state.to {
        Some(ref trusted) => envelope.to = Some(trusted.clone()),
        None => state.to = envelope.to.clone(),
    }

    state.raw = envelope.canonical_bytes();
    state.envelope = Some(envelope);
}

fn extract_payload_step(state: &mut MessageState) {
    match state.envelope {
        Some(ref env) => state.payload = Some(env.payload.clone()),
        None => state.fail("extract-payload: no envelope"),
    }
}

/// Requests routed by root tag validate against the listener's registered
/// schema. Provenance-routed deliveries (tool results and other replies
/// carried by an explicit target) have shapes of their senders' making;
/// they pass on envelope validity alone.
fn is_reply_delivery(state: &MessageState, listener: &ListenerRecord) -> bool {
    state.to.as_deref() == Some(listener.name.as_str())
        && state
            .payload
            .as_ref()
            .map(|p| p.name != listener.schema.root_tag())
            .unwrap_or(false)
}

fn validate_payload_step(state: &mut MessageState, cx: &StepContext) {
    let Some(ref listener) = cx.listener else {
        return;
    };
    let Some(ref payload) = state.payload else {
        state.fail("validate-payload: no payload");
        return;
    };
    if is_reply_delivery(state, listener) {
        return;
    }
    if let Err(e) = listener.schema.validate(payload) {
        state.fail(e.to_string());
    }
}

fn deserialize_step(state: &mut MessageState, cx: &StepContext) {
    let Some(ref payload) = state.payload else {
        state.fail("deserialize: no payload");
        return;
    };
    let value = match cx.listener {
        Some(ref listener) if !is_reply_delivery(state, listener) => {
            match listener.schema.deserialize(payload) {
                Ok(v) => v,
                Err(e) => {
                    state.fail(e.to_string());
                    return;
                }
            }
        }
        _ => schema::lenient_value(payload),
    };
    state.value = Some(value);
    state.estimated_tokens = estimate_tokens(state.raw.len());
}

/// Resolve delivery targets: explicit `to` wins, otherwise the root tag.
/// Peer safety is enforced for registered agents.
async fn resolve_routing_step(state: &mut MessageState, cx: &StepContext) {
    let registry = cx.registry.read().await;

    let targets = if let Some(ref to) = state.to {
        match registry.lookup_by_name(to) {
            Some(record) => vec![record],
            None => {
                state.fail(format!("unknown-target: '{to}' is not a registered capability"));
                return;
            }
        }
    } else {
        let Some(tag) = state.root_tag().map(|t| t.to_string()) else {
            state.fail("resolve-routing: no payload root tag");
            return;
        };
        let bound = registry.lookup_by_root(&tag);
        if bound.is_empty() {
            state.fail(format!("unknown capability root tag '{tag}'"));
            return;
        }
        bound
    };

    // Peer safety: a registered agent may only reach its declared peers or
    // itself (blind self-iteration). Tools reply by provenance; external
    // clients and the core are not agents.
    if let Some(ref from) = state.from {
        if let Some(sender) = registry.lookup_by_name(from) {
            if sender.is_agent() {
                for target in &targets {
                    let allowed =
                        sender.peers.contains(&target.name) || target.name == sender.name;
                    if !allowed {
                        state.fail(format!(
                            "peer violation: '{from}' may not reach '{}'",
                            target.name
                        ));
                        return;
                    }
                }
            }
        }
    }

    state.targets = targets;
}

// ── System pipeline ──

/// Terminal step of the system pipeline.
async fn system_compose_step(state: &mut MessageState, cx: &StepContext) {
    if state.error.is_some() {
        compose_huh(state, cx).await;
        return;
    }

    let tag = state.root_tag().map(|t| t.to_string()).unwrap_or_default();
    match tag.as_str() {
        "boot" => {
            let organism = state
                .payload
                .as_ref()
                .and_then(|p| p.child_text("organism"))
                .unwrap_or_default();
            let listeners = state
                .payload
                .as_ref()
                .and_then(|p| p.child_text("listeners"))
                .unwrap_or_default();
            info!(organism = %organism, listeners = %listeners, "organism booted");
            state.set_meta(META_DROP, "true");
        }
        "thread-spawn" => compose_spawn(state, cx).await,
        // Already-composed system payloads in transit (huh delivered to an
        // agent, lifecycle notices): deliver by explicit target.
        _ => deliver_system(state, cx).await,
    }
}

/// Build a `<huh>` diagnostic back into the originating thread. The hop
/// marker survives so the diagnostic lands inside the sender's open
/// call-chain segment.
async fn compose_huh(state: &mut MessageState, cx: &StepContext) {
    let error = state.error.take().unwrap_or_else(|| "unknown error".into());
    let (Some(thread), Some(sender)) = (state.thread_id.clone(), state.from.clone()) else {
        warn!(error = %error, "dropping unroutable diagnostic (no thread or sender)");
        state.set_meta(META_DROP, "true");
        return;
    };
    let hop = state.meta(META_HOP).map(str::to_string);

    let payload = Element::new("huh")
        .with_attr("xmlns", SYSTEM_NS)
        .with_text(&error);
    *state = compose_system_message(&thread, &sender, payload);
    if let Some(hop) = hop {
        state.set_meta(META_HOP, &hop);
    }
    deliver_system(state, cx).await;
}

/// Handle an explicit spawn primitive: create the child thread, re-inject
/// the task into its target's pipeline, acknowledge the spawner.
async fn compose_spawn(state: &mut MessageState, cx: &StepContext) {
    let (Some(thread), Some(sender)) = (state.thread_id.clone(), state.from.clone()) else {
        state.set_meta(META_DROP, "true");
        return;
    };
    let payload = state.payload.clone().unwrap_or_default();
    let Some(target) = payload.child_text("to").filter(|t| !t.is_empty()) else {
        state.fail("thread-spawn: missing <to>");
        return compose_huh(state, cx).await;
    };
    let Some(task) = payload.elements().find(|e| e.name != "to").cloned() else {
        state.fail("thread-spawn: missing task payload");
        return compose_huh(state, cx).await;
    };

    let child = {
        let mut paths = cx.paths.lock().await;
        match paths.extend(&thread, &target) {
            Ok(child) => child,
            Err(e) => {
                state.fail(format!("thread-spawn: {e}"));
                return compose_huh(state, cx).await;
            }
        }
    };

    // The spawned task enters its target's pipeline like any other message.
    let envelope = Envelope::build(CORE_SENDER, &child, Some(&target), task);
    let mut task_state = MessageState::from_raw(envelope.canonical_bytes());
    task_state.from = Some(CORE_SENDER.to_string());
    task_state.thread_id = Some(child.clone());
    task_state.to = Some(target.clone());
    task_state.set_meta(META_REINJECT, &target);

    // Acknowledge the spawner in its own thread.
    let ack = Element::new("thread-spawned")
        .with_attr("xmlns", SYSTEM_NS)
        .with_attr("id", &child)
        .with_child(Element::new("target").with_text(&target));
    let mut ack_state = compose_system_message(&thread, &sender, ack);
    deliver_system(&mut ack_state, cx).await;

    ack_state.follow_ups.push(task_state);
    *state = ack_state;
}

/// A fresh system message addressed into `thread` at `recipient`.
pub fn compose_system_message(thread: &str, recipient: &str, payload: Element) -> MessageState {
    let tag = payload.name.clone();
    let envelope = Envelope::build(CORE_SENDER, thread, Some(recipient), payload.clone());
    let raw = envelope.canonical_bytes();
    let mut state = MessageState::from_raw(raw.clone());
    state.estimated_tokens = estimate_tokens(raw.len());
    state.thread_id = Some(thread.to_string());
    state.from = Some(CORE_SENDER.to_string());
    state.to = Some(recipient.to_string());
    state.value = Some(schema::lenient_value(&payload));
    state.payload = Some(envelope.payload.clone());
    state.envelope = Some(envelope);
    state.set_meta(META_SYSTEM, &tag);
    state
}

/// Resolve a system message's recipient: a registered listener, or the
/// external client at the thread root.
async fn deliver_system(state: &mut MessageState, cx: &StepContext) {
    let Some(to) = state.to.clone() else {
        state.set_meta(META_DROP, "true");
        return;
    };
    let registry = cx.registry.read().await;
    match registry.lookup_by_name(&to) {
        Some(record) => state.targets = vec![record],
        None => state.set_meta(META_EGRESS, "true"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{FnHandler, HandlerContext, HandlerResponse, ValidatedPayload};
    use crate::registry::{ListenerKind, ListenerRegistry};
    use crate::schema::{CompiledSchema, FieldKind, FieldSpec, PayloadSchema};
    use std::collections::HashSet;

    fn noop() -> Arc<dyn crate::handler::Handler> {
        Arc::new(FnHandler(
            |_p: ValidatedPayload, _ctx: HandlerContext| {
                Box::pin(async move { Ok(HandlerResponse::None) }) as _
            },
        ))
    }

    fn add_record() -> crate::registry::ListenerRecord {
        crate::registry::ListenerRecord {
            name: "calculator.add".into(),
            root_tag: "add".into(),
            description: "adds numbers".into(),
            kind: ListenerKind::Tool,
            peers: HashSet::new(),
            schema: Arc::new(CompiledSchema::compile(
                PayloadSchema::new("add")
                    .with_field(FieldSpec::required("a", FieldKind::Float))
                    .with_field(FieldSpec::required("b", FieldKind::Float)),
            )),
            handler: noop(),
        }
    }

    fn agent_record(name: &str, root: &str, peers: &[&str]) -> crate::registry::ListenerRecord {
        crate::registry::ListenerRecord {
            name: name.into(),
            root_tag: root.into(),
            description: format!("{name} agent"),
            kind: ListenerKind::Agent,
            peers: peers.iter().map(|s| s.to_string()).collect(),
            schema: Arc::new(CompiledSchema::compile(PayloadSchema::new(root).lenient())),
            handler: noop(),
        }
    }

    async fn context_with(records: Vec<crate::registry::ListenerRecord>) -> StepContext {
        let mut registry = ListenerRegistry::new();
        for record in records {
            registry.register(record).unwrap();
        }
        StepContext {
            listener: None,
            registry: Arc::new(RwLock::new(registry)),
            paths: Arc::new(Mutex::new(PathRegistry::new())),
        }
    }

    fn envelope_bytes(from: &str, thread: &str, payload: &str) -> Vec<u8> {
        format!(
            "<message xmlns=\"{ENVELOPE_NS}\"><from>{from}</from><thread>{thread}</thread>{payload}</message>",
            ENVELOPE_NS = crate::schema::ENVELOPE_NS
        )
        .into_bytes()
    }

    async fn run_default(state: &mut MessageState, cx: &StepContext) {
        for step in default_steps() {
            step.run(state, cx).await;
            if state.is_failed() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn full_pipeline_on_good_message() {
        let mut cx = context_with(vec![add_record()]).await;
        cx.listener = cx.registry.read().await.lookup_by_name("calculator.add");

        let mut state = MessageState::from_raw(envelope_bytes(
            "researcher",
            "t1",
            "<add><a>40</a><b>2</b></add>",
        ));
        run_default(&mut state, &cx).await;

        assert!(!state.is_failed(), "error: {:?}", state.error);
        assert_eq!(state.thread_id.as_deref(), Some("t1"));
        assert_eq!(state.from.as_deref(), Some("researcher"));
        assert_eq!(state.targets.len(), 1);
        assert_eq!(state.targets[0].name, "calculator.add");
        assert!(state.estimated_tokens > 0);
        assert_eq!(state.value.as_ref().unwrap().float("a"), Some(40.0));
    }

    #[tokio::test]
    async fn trusted_provenance_overrides_wire() {
        let mut cx = context_with(vec![add_record()]).await;
        cx.listener = cx.registry.read().await.lookup_by_name("calculator.add");

        let mut state = MessageState::from_raw(envelope_bytes(
            "attacker",
            "other-thread",
            "<add><a>1</a><b>2</b></add>",
        ));
        state.from = Some("researcher".into());
        state.thread_id = Some("t1".into());
        run_default(&mut state, &cx).await;

        let env = state.envelope.as_ref().unwrap();
        assert_eq!(env.from, "researcher");
        assert_eq!(env.thread, "t1");
        let wire = String::from_utf8(state.raw.clone()).unwrap();
        assert!(wire.contains("<from>researcher</from>"));
        assert!(!wire.contains("attacker"));
    }

    #[tokio::test]
    async fn validation_failure_halts_before_routing() {
        let mut cx = context_with(vec![add_record()]).await;
        cx.listener = cx.registry.read().await.lookup_by_name("calculator.add");

        let mut state = MessageState::from_raw(envelope_bytes(
            "researcher",
            "t1",
            "<add><a>forty</a><b>2</b></add>",
        ));
        run_default(&mut state, &cx).await;

        assert!(state.is_failed());
        assert!(state.error.as_ref().unwrap().contains("<a>"));
        assert!(state.targets.is_empty());
    }

    #[tokio::test]
    async fn unknown_root_tag_fails_routing() {
        let cx = context_with(vec![add_record()]).await;
        let mut state =
            MessageState::from_raw(envelope_bytes("researcher", "t1", "<mystery/>"));
        run_default(&mut state, &cx).await;
        assert!(state.error.as_ref().unwrap().contains("unknown capability"));
    }

    #[tokio::test]
    async fn unknown_explicit_target_fails() {
        let cx = context_with(vec![add_record()]).await;
        let mut state = MessageState::from_raw(
            format!(
                "<message xmlns=\"{}\"><from>x</from><thread>t</thread><to>ghost</to><add><a>1</a><b>2</b></add></message>",
                crate::schema::ENVELOPE_NS
            )
            .into_bytes(),
        );
        run_default(&mut state, &cx).await;
        assert!(state.error.as_ref().unwrap().contains("unknown-target"));
    }

    #[tokio::test]
    async fn peer_violation_detected() {
        let cx = context_with(vec![
            add_record(),
            agent_record("researcher", "research-task", &[]),
        ])
        .await;

        let mut state = MessageState::from_raw(envelope_bytes(
            "researcher",
            "t1",
            "<add><a>1</a><b>2</b></add>",
        ));
        run_default(&mut state, &cx).await;
        assert!(state.error.as_ref().unwrap().contains("peer violation"));
    }

    #[tokio::test]
    async fn self_iteration_allowed_without_peer_entry() {
        let cx = context_with(vec![agent_record("researcher", "research-task", &[])]).await;

        let mut state = MessageState::from_raw(envelope_bytes(
            "researcher",
            "t1",
            "<research-task><q>next step</q></research-task>",
        ));
        run_default(&mut state, &cx).await;
        assert!(!state.is_failed(), "error: {:?}", state.error);
        assert_eq!(state.targets[0].name, "researcher");
    }

    #[tokio::test]
    async fn reply_delivery_bypasses_payload_schema() {
        // A tool result addressed to an agent doesn't match the agent's
        // own payload schema; provenance routing carries it through.
        let mut cx = context_with(vec![agent_record("researcher", "research-task", &[])]).await;
        cx.listener = cx.registry.read().await.lookup_by_name("researcher");

        let mut state = MessageState::from_raw(
            format!(
                "<message xmlns=\"{}\"><from>calculator.add</from><thread>t1</thread><to>researcher</to><result>42</result></message>",
                crate::schema::ENVELOPE_NS
            )
            .into_bytes(),
        );
        run_default(&mut state, &cx).await;

        assert!(!state.is_failed(), "error: {:?}", state.error);
        assert_eq!(state.targets[0].name, "researcher");
        assert_eq!(state.value.as_ref().unwrap().tag, "result");
    }

    #[tokio::test]
    async fn broadcast_resolves_all_bound_listeners() {
        let mut google = add_record();
        google.name = "google".into();
        google.root_tag = "search".into();
        google.schema = Arc::new(CompiledSchema::compile(PayloadSchema::new("search").lenient()));
        let mut bing = add_record();
        bing.name = "bing".into();
        bing.root_tag = "search".into();
        bing.schema = Arc::new(CompiledSchema::compile(PayloadSchema::new("search").lenient()));

        let cx = context_with(vec![google, bing]).await;
        let mut state =
            MessageState::from_raw(envelope_bytes("client", "t1", "<search><q>rust</q></search>"));
        run_default(&mut state, &cx).await;

        let names: Vec<&str> = state.targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["google", "bing"]);
    }

    #[tokio::test]
    async fn system_compose_builds_huh() {
        let cx = context_with(vec![agent_record("researcher", "research-task", &[])]).await;

        let mut state = MessageState::from_raw(b"<garbage".to_vec());
        state.from = Some("researcher".into());
        state.thread_id = Some("t1".into());
        state.fail("schema says no");

        for step in [Step::SystemCompose] {
            step.run(&mut state, &cx).await;
        }

        assert!(state.meta(META_SYSTEM).is_some());
        assert_eq!(state.targets[0].name, "researcher");
        let wire = String::from_utf8(state.raw.clone()).unwrap();
        assert!(wire.contains("<huh"));
        assert!(wire.contains("schema says no"));
        assert!(wire.contains("<from>core</from>"));
        assert!(wire.contains("<thread>t1</thread>"));
    }

    #[tokio::test]
    async fn huh_to_unregistered_sender_egresses() {
        let cx = context_with(vec![]).await;
        let mut state = MessageState::from_raw(Vec::new());
        state.from = Some("client".into());
        state.thread_id = Some("t1".into());
        state.fail("privileged payload on main bus");

        Step::SystemCompose.run(&mut state, &cx).await;
        assert_eq!(state.meta(META_EGRESS), Some("true"));
    }

    #[tokio::test]
    async fn spawn_creates_child_and_ack() {
        let cx = context_with(vec![agent_record("researcher", "research-task", &[])]).await;
        let root = cx.paths.lock().await.new_root(None);

        let raw = format!(
            "<message xmlns=\"{}\"><from>planner</from><thread>{root}</thread><thread-spawn xmlns=\"{}\"><to>researcher</to><research-task>dig</research-task></thread-spawn></message>",
            crate::schema::ENVELOPE_NS,
            SYSTEM_NS,
        );
        let mut state = MessageState::from_raw(raw.into_bytes());
        for step in system_steps() {
            step.run(&mut state, &cx).await;
            if state.is_failed() {
                break;
            }
        }

        // Ack goes back to the spawner; the task is a follow-up re-injection.
        assert_eq!(state.root_tag(), Some("thread-spawned"));
        assert_eq!(state.follow_ups.len(), 1);
        let task = &state.follow_ups[0];
        assert_eq!(task.meta(META_REINJECT), Some("researcher"));
        let child = task.thread_id.clone().unwrap();
        assert_ne!(child, root);
        let paths = cx.paths.lock().await;
        assert!(paths.path_of(&child).unwrap().ends_with(".researcher"));
    }

    #[tokio::test]
    async fn boot_message_is_logged_and_dropped() {
        let cx = context_with(vec![]).await;
        let raw = format!(
            "<message xmlns=\"{}\"><from>core</from><thread>t0</thread><boot xmlns=\"{}\"><organism>demo</organism><listeners>3</listeners></boot></message>",
            crate::schema::ENVELOPE_NS,
            SYSTEM_NS,
        );
        let mut state = MessageState::from_raw(raw.into_bytes());
        for step in system_steps() {
            step.run(&mut state, &cx).await;
        }
        assert_eq!(state.meta(META_DROP), Some("true"));
    }
}
