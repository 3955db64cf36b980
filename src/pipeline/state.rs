//! MessageState — the universal intermediate representation.
//!
//! Every message on the bus flows through one of these. All fields except
//! the raw bytes start empty and are populated by successive pipeline
//! steps; the first step to record an error halts the pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use crate::registry::ListenerRecord;
use crate::schema::{Envelope, PayloadValue};
use crate::xml::Element;

/// Marks a state the pump must egress to the originating client.
pub const META_EGRESS: &str = "egress";
/// Payload tag of a system-composed message (`huh`, `boot`, ...).
pub const META_SYSTEM: &str = "system";
/// Names a listener pipeline the pump should re-inject this state into
/// (spawned task entering its target's pipeline for full validation).
pub const META_REINJECT: &str = "reinject";
/// A state the pump should discard without further processing.
pub const META_DROP: &str = "drop";
/// Path-registry hop this message belongs to: set by the post-processor so
/// delivery lands inside the emitter's open call-chain segment instead of
/// extending a new one.
pub const META_HOP: &str = "hop";

#[derive(Default)]
pub struct MessageState {
    /// Wire bytes; canonical after the canonicalize step.
    pub raw: Vec<u8>,
    /// Repaired tree of the whole message.
    pub tree: Option<Element>,
    /// Validated envelope.
    pub envelope: Option<Envelope>,
    /// Extracted payload tree.
    pub payload: Option<Element>,
    /// Deserialized payload.
    pub value: Option<PayloadValue>,

    /// Trusted provenance. Entry points (server, pump, post-processor) set
    /// these before the pipeline runs; envelope fields never override them.
    pub thread_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,

    /// Resolved delivery targets.
    pub targets: Vec<Arc<ListenerRecord>>,
    /// Diagnostic; set by the step that failed.
    pub error: Option<String>,
    /// Estimated prompt+completion cost, attached at deserialization.
    pub estimated_tokens: u32,
    /// Open extension bag.
    pub metadata: HashMap<String, String>,
    /// Additional states produced alongside this one (system pipeline only:
    /// a thread-spawn yields both the spawned task and the acknowledgement).
    pub follow_ups: Vec<MessageState>,
}

impl MessageState {
    pub fn from_raw(raw: Vec<u8>) -> Self {
        Self {
            raw,
            ..Default::default()
        }
    }

    /// Record a diagnostic. The pipeline halts after the current step.
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(error.into());
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|s| s.as_str())
    }

    pub fn set_meta(&mut self, key: &str, value: &str) {
        self.metadata.insert(key.to_string(), value.to_string());
    }

    /// Root tag of the payload, once extracted.
    pub fn root_tag(&self) -> Option<&str> {
        self.payload.as_ref().map(|p| p.name.as_str())
    }
}

impl std::fmt::Debug for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageState")
            .field("thread_id", &self.thread_id)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("root_tag", &self.root_tag())
            .field("targets", &self.targets.iter().map(|t| &t.name).collect::<Vec<_>>())
            .field("error", &self.error)
            .field("estimated_tokens", &self.estimated_tokens)
            .finish_non_exhaustive()
    }
}
