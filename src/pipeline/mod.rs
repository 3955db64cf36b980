//! Per-listener pipelines.
//!
//! Each listener owns one pipeline: a bounded in-queue and a worker task
//! that runs the ordered steps over every message sequentially, preserving
//! per-thread causality. Pipelines run concurrently with each other. A step
//! failure short-circuits the message into the permanent system pipeline,
//! which turns it into a `<huh>` diagnostic instead of dropping it.

pub mod state;
pub mod steps;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error};

use state::MessageState;
use steps::{Step, StepContext};

/// Default bound of a pipeline's in-queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Handle to a running pipeline worker.
pub struct Pipeline {
    pub name: String,
    tx: mpsc::Sender<MessageState>,
    closed: Arc<AtomicBool>,
}

impl Pipeline {
    /// Spawn a pipeline worker.
    ///
    /// Prepared states go to `out` (the pump's ready channel). Failed states
    /// go to `system_tx`; the system pipeline itself passes `None` and
    /// composes diagnostics in place.
    pub fn spawn(
        name: &str,
        steps: Vec<Step>,
        cx: StepContext,
        out: mpsc::UnboundedSender<MessageState>,
        system_tx: Option<mpsc::Sender<MessageState>>,
        capacity: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<MessageState>(capacity);
        let closed = Arc::new(AtomicBool::new(false));

        let worker_name = name.to_string();
        let worker_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(mut msg) = rx.recv().await {
                if worker_closed.load(Ordering::SeqCst) {
                    // Intake was closed mid-flight; surface, don't drop.
                    msg.fail(format!("capability '{worker_name}' was removed"));
                }

                if !msg.is_failed() {
                    for step in &steps {
                        step.run(&mut msg, &cx).await;
                        if msg.is_failed() {
                            debug!(
                                pipeline = %worker_name,
                                step = ?step,
                                error = msg.error.as_deref().unwrap_or(""),
                                "pipeline halted"
                            );
                            break;
                        }
                    }
                }

                if msg.is_failed() {
                    match system_tx {
                        Some(ref sys) => {
                            if sys.send(msg).await.is_err() {
                                error!(pipeline = %worker_name, "system pipeline gone; diagnostic lost");
                            }
                            continue;
                        }
                        // The system pipeline composes its own diagnostics.
                        None => Step::SystemCompose.run(&mut msg, &cx).await,
                    }
                }

                if out.send(msg).is_err() {
                    break; // pump gone, shut down
                }
            }
        });

        Self {
            name: name.to_string(),
            tx,
            closed,
        }
    }

    /// A clone of the intake sender (used to wire listener pipelines to the
    /// system pipeline).
    pub fn intake(&self) -> mpsc::Sender<MessageState> {
        self.tx.clone()
    }

    /// Non-blocking enqueue. Returns the state back on a full queue so the
    /// pump can defer it (backpressure) instead of blocking the loop.
    pub fn try_enqueue(&self, msg: MessageState) -> Result<(), MessageState> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(msg);
        }
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(m) | mpsc::error::TrySendError::Closed(m) => m,
        })
    }

    /// Blocking enqueue for ingress paths that may await.
    pub async fn enqueue(&self, msg: MessageState) -> Result<(), MessageState> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(msg);
        }
        self.tx.send(msg).await.map_err(|e| e.0)
    }

    /// Close intake. Messages already queued drain as removal diagnostics.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
