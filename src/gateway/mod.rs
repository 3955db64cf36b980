//! Federation gateways — narrow bidirectional forwarding.
//!
//! A gateway registers as a local listener; payloads wrapped in its root
//! tag are forwarded over an outbound WSS connection to the remote
//! organism. Private paths never cross the wire: the remote side sees our
//! opaque thread identifier and treats it as a fresh root, and we do the
//! same with theirs. The gateway pairs local threads with their callers in
//! its listener-scoped storage so remote replies re-enter the right
//! thread.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::handler::{
    Handler, HandlerContext, HandlerFailure, HandlerResponse, HandlerResult, ValidatedPayload,
};
use crate::organism::GatewayConfig;
use crate::registry::ScopedStorage;
use crate::schema::{Envelope, PayloadSchema};
use crate::xml::repair;

/// Reconnect delay after a dropped gateway connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Payload contract: anything wrapped in the gateway's root tag.
pub fn schema(gateway_name: &str) -> PayloadSchema {
    PayloadSchema::new(gateway_name).lenient()
}

/// The forwarding listener.
pub struct GatewayHandler {
    name: String,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    correlations: ScopedStorage,
}

#[async_trait]
impl Handler for GatewayHandler {
    async fn handle(&self, payload: ValidatedPayload, ctx: HandlerContext) -> HandlerResult {
        // The wrapped element is the actual payload to forward.
        let wrapper = repair::parse(&payload.xml)
            .ok_or_else(|| HandlerFailure::Failed("unreadable gateway payload".into()))?;
        let Some(inner) = wrapper.elements().next().cloned() else {
            return Err(HandlerFailure::Failed(format!(
                "nothing to forward inside <{}>",
                self.name
            )));
        };

        // Remember who asked, so the remote reply re-enters their thread.
        self.correlations.put(&ctx.thread_id, ctx.from.clone());

        let envelope = Envelope::build(&self.name, &ctx.thread_id, None, inner);
        self.outbound
            .send(envelope.canonical_bytes())
            .map_err(|_| HandlerFailure::Failed("gateway connection is down".into()))?;
        debug!(gateway = %self.name, thread = %ctx.thread_id, "forwarded to remote");
        Ok(HandlerResponse::None)
    }
}

/// A live gateway: connection task plus the registrable handler.
pub struct Gateway {
    pub name: String,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    correlations: ScopedStorage,
}

impl Gateway {
    /// Spawn the connection task. The task reconnects forever; frames sent
    /// while disconnected are dropped with a warning.
    pub fn spawn(cfg: &GatewayConfig, bus: Arc<Bus>, correlations: ScopedStorage) -> Gateway {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(connection_task(
            cfg.name.clone(),
            cfg.url.clone(),
            bus,
            outbound_rx,
            outbound_tx.clone(),
            correlations.clone(),
        ));
        Gateway {
            name: cfg.name.clone(),
            outbound: outbound_tx,
            correlations,
        }
    }

    pub fn handler(&self) -> GatewayHandler {
        GatewayHandler {
            name: self.name.clone(),
            outbound: self.outbound.clone(),
            correlations: self.correlations.clone(),
        }
    }
}

async fn connection_task(
    name: String,
    url: String,
    bus: Arc<Bus>,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    correlations: ScopedStorage,
) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!(gateway = %name, url = %url, "gateway connected");
                let (mut sink, mut stream) = ws.split();
                loop {
                    tokio::select! {
                        out = outbound_rx.recv() => match out {
                            Some(bytes) => {
                                let text = String::from_utf8_lossy(&bytes).into_owned();
                                if sink.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            None => return,
                        },
                        frame = stream.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                handle_inbound(
                                    &name,
                                    text.as_str().as_bytes(),
                                    &bus,
                                    &outbound_tx,
                                    &correlations,
                                )
                                .await;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(gateway = %name, "gateway stream error: {e}");
                                break;
                            }
                        },
                    }
                }
                warn!(gateway = %name, "gateway disconnected");
            }
            Err(e) => warn!(gateway = %name, url = %url, "gateway connect failed: {e}"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// A frame from the remote side. A known correlation means it answers a
/// thread we forwarded; anything else starts a fresh opaque root here.
async fn handle_inbound(
    name: &str,
    raw: &[u8],
    bus: &Arc<Bus>,
    outbound_tx: &mpsc::UnboundedSender<Vec<u8>>,
    correlations: &ScopedStorage,
) {
    let Some(envelope) = repair::parse(raw).and_then(|t| Envelope::parse(&t).ok()) else {
        warn!(gateway = %name, "unparseable frame from remote dropped");
        return;
    };

    let caller = correlations.remove(&envelope.thread);
    let rebuilt = Envelope::build(
        name,
        &envelope.thread,
        caller.as_deref(),
        envelope.payload.clone(),
    );

    // Fresh remote work gets our outbound connection as its egress path,
    // so terminal responses flow back across the gateway.
    let client = if caller.is_none() {
        Some(outbound_tx.clone())
    } else {
        None
    };
    if let Err(e) = bus.inject(rebuilt.canonical_bytes(), name, client).await {
        warn!(gateway = %name, "inbound gateway message rejected: {e}");
    }
}
