//! The handler seam — the only surface untrusted capability code touches.
//!
//! A handler receives the deserialized payload plus a minimal context record
//! and returns raw bytes. It never sees routing metadata in a mutable form:
//! the pump captures the authoritative values before the call and builds
//! fresh envelopes from them afterwards, so nothing a handler writes can
//! alter provenance.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

use crate::schema::PayloadValue;

/// Context a handler may read. The thread identifier keys its scoped
/// storage; nothing here is fed back into routing.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Opaque thread identifier.
    pub thread_id: String,
    /// Registered name of the sender.
    pub from: String,
    /// This handler's own registered name.
    pub own_name: String,
}

/// The payload as it reaches a handler: validated, deserialized, with the
/// canonical bytes alongside for handlers that forward or quote them.
#[derive(Debug, Clone)]
pub struct ValidatedPayload {
    pub tag: String,
    pub xml: Vec<u8>,
    pub value: PayloadValue,
}

/// What a handler hands back to the pump. All byte forms re-enter the bus
/// through the post-processor and are validated like any other message.
#[derive(Debug, Clone)]
pub enum HandlerResponse {
    /// Payloads routed by their root tags (agent fan-out, self-iteration).
    Emit(Vec<u8>),
    /// Payloads routed back to the captured sender (tool replies).
    Reply(Vec<u8>),
    /// Nothing to say.
    None,
}

/// Why a handler failed. Throttling is distinguished so the pump can feed
/// it into congestion control instead of surfacing a diagnostic.
#[derive(Debug, Clone)]
pub enum HandlerFailure {
    /// Backend rate limit; the message should be requeued.
    Throttled { retry_after: Option<u64> },
    /// Anything else; becomes a `<huh>` to the sender.
    Failed(String),
}

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerFailure::Throttled { retry_after } => {
                write!(f, "backend throttled (retry after {retry_after:?}s)")
            }
            HandlerFailure::Failed(reason) => write!(f, "{reason}"),
        }
    }
}

pub type HandlerResult = Result<HandlerResponse, HandlerFailure>;

/// A registered capability's entry point.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, payload: ValidatedPayload, ctx: HandlerContext) -> HandlerResult;
}

type BoxedHandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Adapter for closure handlers, mostly used in tests and wiring code.
pub struct FnHandler<F>(pub F)
where
    F: Fn(ValidatedPayload, HandlerContext) -> BoxedHandlerFuture + Send + Sync + 'static;

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(ValidatedPayload, HandlerContext) -> BoxedHandlerFuture + Send + Sync + 'static,
{
    async fn handle(&self, payload: ValidatedPayload, ctx: HandlerContext) -> HandlerResult {
        (self.0)(payload, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_payload(tag: &str) -> ValidatedPayload {
        ValidatedPayload {
            tag: tag.into(),
            xml: format!("<{tag}/>").into_bytes(),
            value: PayloadValue {
                tag: tag.into(),
                fields: Default::default(),
            },
        }
    }

    #[tokio::test]
    async fn fn_handler_invokes_closure() {
        let echo = FnHandler(|p: ValidatedPayload, _ctx: HandlerContext| {
            Box::pin(async move { Ok(HandlerResponse::Reply(p.xml)) }) as _
        });

        let ctx = HandlerContext {
            thread_id: "t1".into(),
            from: "tester".into(),
            own_name: "echo".into(),
        };
        match echo.handle(make_payload("ping"), ctx).await.unwrap() {
            HandlerResponse::Reply(bytes) => assert_eq!(bytes, b"<ping/>"),
            other => panic!("expected Reply, got {other:?}"),
        }
    }

    #[test]
    fn failure_display() {
        let f = HandlerFailure::Throttled {
            retry_after: Some(30),
        };
        assert!(f.to_string().contains("throttled"));
        let f = HandlerFailure::Failed("boom".into());
        assert_eq!(f.to_string(), "boom");
    }
}
