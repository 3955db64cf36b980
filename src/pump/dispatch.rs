//! The dispatcher and the trust boundary around handler invocation.
//!
//! Before a handler runs, the pump captures the authoritative metadata for
//! the invocation in a `DispatchScope` that lives entirely on the pump's
//! side of the boundary. The handler sees only the deserialized payload and
//! a minimal context; whatever bytes it returns, fresh envelopes are built
//! from the scope, never from handler output.

use std::collections::HashSet;
use std::sync::Arc;

use futures::FutureExt;

use crate::handler::{HandlerContext, HandlerFailure, HandlerResult, ValidatedPayload};
use crate::registry::ListenerRecord;

/// Authoritative per-invocation metadata, captured before the handler call.
#[derive(Debug, Clone)]
pub struct DispatchScope {
    /// Registered name of the executing listener.
    pub listener: String,
    /// Opaque wire thread identifier.
    pub thread_id: String,
    /// Sender that triggered this invocation.
    pub sender: String,
    /// Parent thread, from the path registry.
    pub parent_thread: Option<String>,
    /// The executing listener's declared peer set.
    pub peers: HashSet<String>,
    /// Call-chain segment this invocation runs under. Stays open across an
    /// agent's whole conversation; popped when the listener replies.
    pub hop: Option<String>,
    /// Budget bucket the admission was charged to (agent name or tools).
    pub bucket: String,
    /// Admitted cost, refunded if the backend throttles.
    pub cost: u32,
    /// Canonical envelope bytes of the dispatched message, kept so a
    /// throttled message can be requeued verbatim.
    pub raw: Vec<u8>,
}

/// What a finished dispatch hands back to the pump.
pub struct DispatchOutcome {
    pub scope: DispatchScope,
    pub result: HandlerResult,
}

/// Invoke one handler. Stateless: everything the completion path needs
/// travels in the scope. Panics are contained at this boundary and
/// surfaced like any other handler failure.
pub async fn invoke(
    record: Arc<ListenerRecord>,
    payload: ValidatedPayload,
    scope: DispatchScope,
) -> DispatchOutcome {
    let ctx = HandlerContext {
        thread_id: scope.thread_id.clone(),
        from: scope.sender.clone(),
        own_name: scope.listener.clone(),
    };

    let result = match std::panic::AssertUnwindSafe(record.handler.handle(payload, ctx))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => Err(HandlerFailure::Failed(format!(
            "handler '{}' panicked",
            scope.listener
        ))),
    };

    DispatchOutcome { scope, result }
}
