//! Common surface for handler authors and embedders.

pub use crate::bus::{derive_root_tag, Bus, BusBuilder, ListenerSpec, ReloadEvent};
pub use crate::handler::{
    FnHandler, Handler, HandlerContext, HandlerFailure, HandlerResponse, HandlerResult,
    ValidatedPayload,
};
pub use crate::pump::{BusEvent, PumpConfig, Scheduling};
pub use crate::registry::{ListenerKind, ScopedStorage};
pub use crate::schema::{
    Envelope, FieldKind, FieldSpec, PayloadSchema, PayloadValue, Value, CORE_SENDER, ENVELOPE_NS,
    SYSTEM_NS,
};

use crate::xml::repair;

/// Build canonical envelope bytes around payload bytes. Convenience for
/// clients and tests; the pump builds its own envelopes from captured
/// scope.
pub fn build_envelope(
    from: &str,
    to: Option<&str>,
    thread: &str,
    payload: &[u8],
) -> Result<Vec<u8>, String> {
    let payload = repair::parse(payload).ok_or_else(|| "payload is not XML".to_string())?;
    Ok(Envelope::build(from, thread, to, payload).canonical_bytes())
}
