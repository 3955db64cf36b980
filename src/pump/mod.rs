//! The message pump — central coordinator of the bus.
//!
//! One cooperative loop gathers prepared messages from every pipeline,
//! admits them against token budgets under weighted deficit round-robin,
//! launches dispatch tasks up to the concurrency cap, and consumes handler
//! completions as they finish. Response bytes pass through the
//! post-processor and re-enter the bus as fresh messages carrying
//! pump-injected provenance. Terminal payloads egress to the client that
//! opened the thread.

pub mod budget;
pub mod dispatch;
pub mod respond;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::handler::{HandlerFailure, HandlerResponse, ValidatedPayload};
use crate::pipeline::state::{
    MessageState, META_DROP, META_EGRESS, META_HOP, META_REINJECT, META_SYSTEM,
};
use crate::pipeline::Pipeline;
use crate::registry::{ListenerRegistry, ListenerStorage};
use crate::schema::{Envelope, CORE_SENDER, SYSTEM_NS};
use crate::threads::{PathRegistry, ThreadState};
use crate::xml::{canon, Element};

use budget::{BudgetBook, TOOL_BUCKET};
use dispatch::{DispatchOutcome, DispatchScope};

/// Default share for agents added without an explicit one (hot-reload).
const DEFAULT_AGENT_SHARE: f64 = 0.1;

/// Thread scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheduling {
    /// Fair across threads: new work joins the back of each bucket.
    #[default]
    BreadthFirst,
    /// Finish a branch first: new work jumps the queue.
    DepthFirst,
}

impl Scheduling {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "breadth-first" => Some(Scheduling::BreadthFirst),
            "depth-first" => Some(Scheduling::DepthFirst),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub scheduling: Scheduling,
    /// Maximum concurrent dispatches.
    pub concurrency_cap: usize,
    /// Global token budget, tokens per minute.
    pub tokens_per_minute: f64,
    /// Threads idle past this are force-pruned with a timeout diagnostic.
    pub idle_timeout: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            scheduling: Scheduling::BreadthFirst,
            concurrency_cap: 32,
            tokens_per_minute: 100_000.0,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Observability stream (operator surfaces subscribe to this).
#[derive(Debug, Clone)]
pub enum BusEvent {
    MessageInjected { thread_id: String, target: String },
    Dispatched { thread_id: String, listener: String },
    HandlerFailed { listener: String, reason: String },
    Throttled { bucket: String },
    Egressed { thread_id: String },
    ThreadTerminal { thread_id: String },
    SecurityEvent { reason: String },
}

/// Control requests from the privileged surface into the pump loop.
#[derive(Debug)]
pub enum PumpControl {
    ForcePrune { thread: String, reason: String },
}

/// Where a popped call-chain segment points: the caller one segment up.
#[derive(Debug, Clone)]
enum PopTarget {
    /// A listener's open segment.
    Listener { name: String, hop: String },
    /// The thread root: the external client.
    Client,
    /// No segment to pop (system deliveries, degraded paths).
    Orphan,
}

pub struct MessagePump {
    cfg: PumpConfig,
    registry: Arc<RwLock<ListenerRegistry>>,
    paths: Arc<Mutex<PathRegistry>>,
    pipelines: Arc<RwLock<HashMap<String, Pipeline>>>,
    system_intake: mpsc::Sender<MessageState>,
    ready_rx: mpsc::UnboundedReceiver<MessageState>,
    budgets: Arc<StdMutex<BudgetBook>>,
    storage: ListenerStorage,
    events: broadcast::Sender<BusEvent>,
    shutdown_rx: watch::Receiver<bool>,
    control_rx: mpsc::UnboundedReceiver<PumpControl>,

    /// Per-bucket ready queues: one per agent, one shared for tools.
    queues: HashMap<String, VecDeque<MessageState>>,
    bucket_cursor: usize,
    inflight: JoinSet<DispatchOutcome>,
    thread_aborts: HashMap<String, Vec<AbortHandle>>,
    /// Force-pruned threads whose late handler bytes must be discarded.
    cancelled: HashSet<String>,
    /// Backpressured enqueues waiting for pipeline capacity.
    deferred: VecDeque<(String, MessageState)>,
}

#[allow(clippy::too_many_arguments)]
impl MessagePump {
    pub fn new(
        cfg: PumpConfig,
        registry: Arc<RwLock<ListenerRegistry>>,
        paths: Arc<Mutex<PathRegistry>>,
        pipelines: Arc<RwLock<HashMap<String, Pipeline>>>,
        system_intake: mpsc::Sender<MessageState>,
        ready_rx: mpsc::UnboundedReceiver<MessageState>,
        budgets: Arc<StdMutex<BudgetBook>>,
        storage: ListenerStorage,
        events: broadcast::Sender<BusEvent>,
        shutdown_rx: watch::Receiver<bool>,
        control_rx: mpsc::UnboundedReceiver<PumpControl>,
    ) -> Self {
        Self {
            cfg,
            registry,
            paths,
            pipelines,
            system_intake,
            ready_rx,
            budgets,
            storage,
            events,
            shutdown_rx,
            control_rx,
            queues: HashMap::new(),
            bucket_cursor: 0,
            inflight: JoinSet::new(),
            thread_aborts: HashMap::new(),
            cancelled: HashSet::new(),
            deferred: VecDeque::new(),
        }
    }

    /// The pump loop. Runs until shutdown is signalled or all intake
    /// channels close.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_refill = Instant::now();

        info!("message pump running");
        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => break,
                maybe = self.ready_rx.recv() => match maybe {
                    Some(msg) => self.accept_ready(msg).await,
                    None => break,
                },
                Some(done) = self.inflight.join_next(), if !self.inflight.is_empty() => {
                    self.on_completion(done).await;
                }
                Some(control) = self.control_rx.recv() => match control {
                    PumpControl::ForcePrune { thread, reason } => {
                        self.force_prune(&thread, &reason).await;
                    }
                },
                _ = tick.tick() => {
                    let now = Instant::now();
                    self.budgets
                        .lock()
                        .expect("budget lock")
                        .refill(now.duration_since(last_refill));
                    last_refill = now;
                    self.flush_deferred().await;
                    self.sweep_idle().await;
                    if self.inflight.is_empty() {
                        self.cancelled.clear();
                    }
                }
            }
            self.launch_ready().await;
        }
        info!("message pump stopped");
    }

    // ── Intake ──

    /// Take a prepared state off a pipeline and queue it for admission.
    async fn accept_ready(&mut self, first: MessageState) {
        let mut work = VecDeque::new();
        work.push_back(first);

        while let Some(mut msg) = work.pop_front() {
            for follow_up in msg.follow_ups.drain(..) {
                work.push_back(follow_up);
            }

            if let Some(thread) = msg.thread_id.clone() {
                self.paths.lock().await.dec_queued(&thread);
            }

            if msg.meta(META_DROP).is_some() {
                continue;
            }
            if let Some(target) = msg.meta(META_REINJECT).map(str::to_string) {
                msg.metadata.remove(META_REINJECT);
                self.inject_into_pipeline(&target, msg).await;
                continue;
            }
            if msg.meta(META_EGRESS).is_some() {
                self.egress(msg).await;
                continue;
            }
            if msg.targets.is_empty() {
                warn!(state = ?msg, "prepared state with no targets discarded");
                continue;
            }

            let bucket = bucket_of(&msg);
            self.ensure_bucket(&bucket).await;
            let queue = self.queues.entry(bucket).or_default();
            match self.cfg.scheduling {
                Scheduling::BreadthFirst => queue.push_back(msg),
                Scheduling::DepthFirst => queue.push_front(msg),
            }
        }
    }

    async fn ensure_bucket(&mut self, bucket: &str) {
        let mut budgets = self.budgets.lock().expect("budget lock");
        if !budgets.has_bucket(bucket) {
            budgets.add_agent(bucket, DEFAULT_AGENT_SHARE);
        }
    }

    /// Enqueue a state into a listener's pipeline, deferring on
    /// backpressure and diverting to the system pipeline when the listener
    /// is unknown.
    async fn inject_into_pipeline(&mut self, name: &str, mut state: MessageState) {
        let pipelines = self.pipelines.read().await;
        match pipelines.get(name) {
            Some(pipeline) => {
                if let Some(thread) = state.thread_id.clone() {
                    self.paths.lock().await.inc_queued(&thread);
                }
                if let Err(back) = pipeline.try_enqueue(state) {
                    if let Some(thread) = back.thread_id.clone() {
                        self.paths.lock().await.dec_queued(&thread);
                    }
                    debug!(listener = name, "pipeline full, deferring enqueue");
                    self.deferred.push_back((name.to_string(), back));
                }
            }
            None => {
                drop(pipelines);
                state.fail(format!("unknown capability '{name}'"));
                self.send_system(state).await;
            }
        }
    }

    /// Route a failed or system-bound state into the system pipeline.
    async fn send_system(&mut self, state: MessageState) {
        if let Some(thread) = state.thread_id.clone() {
            self.paths.lock().await.inc_queued(&thread);
        }
        if self.system_intake.send(state).await.is_err() {
            error!("system pipeline gone; diagnostic lost");
        }
    }

    /// Retry deferred enqueues against freed pipeline capacity.
    async fn flush_deferred(&mut self) {
        let pending: Vec<(String, MessageState)> = self.deferred.drain(..).collect();
        for (name, state) in pending {
            self.inject_into_pipeline(&name, state).await;
        }
    }

    // ── Admission and launch ──

    /// Launch dispatches while the cap and the budgets allow.
    async fn launch_ready(&mut self) {
        while self.inflight.len() < self.cfg.concurrency_cap {
            let Some((bucket, msg)) = self.pick_admissible() else {
                break;
            };
            self.dispatch(bucket, msg).await;
        }
    }

    /// Weighted deficit round-robin across buckets. Within a bucket, the
    /// front message runs if it fits; otherwise the smallest queued message
    /// that fits gets its turn.
    fn pick_admissible(&mut self) -> Option<(String, MessageState)> {
        self.queues.retain(|_, q| !q.is_empty());
        if self.queues.is_empty() {
            return None;
        }

        let mut buckets: Vec<String> = self.queues.keys().cloned().collect();
        buckets.sort();
        let n = buckets.len();
        let mut budgets = self.budgets.lock().expect("budget lock");

        for offset in 0..n {
            let bucket = &buckets[(self.bucket_cursor + offset) % n];
            let queue = self.queues.get_mut(bucket).expect("bucket queue");

            let front_cost = queue.front().map(|m| m.estimated_tokens).unwrap_or(0);
            let index = if budgets.can_admit(bucket, front_cost) {
                Some(0)
            } else {
                // The front doesn't fit; maybe a smaller one does.
                queue
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, m)| m.estimated_tokens)
                    .filter(|(_, m)| budgets.can_admit(bucket, m.estimated_tokens))
                    .map(|(i, _)| i)
            };

            if let Some(index) = index {
                let msg = queue.remove(index).expect("indexed message");
                budgets.admit(bucket, msg.estimated_tokens);
                self.bucket_cursor = (self.bucket_cursor + offset + 1) % n;
                return Some((bucket.clone(), msg));
            }
        }
        None
    }

    /// Capture authoritative metadata and spawn one task per target.
    async fn dispatch(&mut self, bucket: String, msg: MessageState) {
        let Some(thread) = msg.thread_id.clone() else {
            warn!("dispatch without thread identifier discarded");
            return;
        };
        let sender = msg.from.clone().unwrap_or_else(|| CORE_SENDER.to_string());
        let payload_el = msg.payload.clone().unwrap_or_default();
        let payload_bytes = canon::to_bytes(&payload_el);
        // The call-chain position this message was emitted from.
        let base = msg.meta(META_HOP).map(str::to_string);

        let mut paths = self.paths.lock().await;
        paths.append_history(&thread, msg.raw.clone());
        let parent = paths.parent_of(&thread).map(String::from);

        for target in &msg.targets {
            // Delivery into an already-open segment (reply to an agent,
            // self-iteration, diagnostics) reuses it; a delegation extends
            // the path by one segment.
            let hop = match base {
                Some(ref base_hop)
                    if paths.listener_of(base_hop) == Some(target.name.as_str()) =>
                {
                    Some(base_hop.clone())
                }
                _ if sender == CORE_SENDER || msg.meta(META_SYSTEM).is_some() => base.clone(),
                Some(ref base_hop) => paths.extend(base_hop, &target.name).ok(),
                None => paths.extend(&thread, &target.name).ok(),
            };
            paths.inc_in_flight(&thread);

            let scope = DispatchScope {
                listener: target.name.clone(),
                thread_id: thread.clone(),
                sender: sender.clone(),
                parent_thread: parent.clone(),
                peers: target.peers.clone(),
                hop,
                bucket: bucket.clone(),
                cost: msg.estimated_tokens,
                raw: msg.raw.clone(),
            };
            let payload = ValidatedPayload {
                tag: payload_el.name.clone(),
                xml: payload_bytes.clone(),
                value: msg.value.clone().unwrap_or_default(),
            };

            debug!(listener = %target.name, thread = %thread, "dispatching");
            let _ = self.events.send(BusEvent::Dispatched {
                thread_id: thread.clone(),
                listener: target.name.clone(),
            });
            let handle = self
                .inflight
                .spawn(dispatch::invoke(target.clone(), payload, scope));
            self.thread_aborts
                .entry(thread.clone())
                .or_default()
                .push(handle);
        }
    }

    // ── Completions ──

    async fn on_completion(&mut self, res: Result<DispatchOutcome, JoinError>) {
        let outcome = match res {
            Ok(outcome) => outcome,
            Err(join_err) if join_err.is_cancelled() => return,
            Err(join_err) => {
                error!("dispatch task failed: {join_err}");
                return;
            }
        };
        let scope = outcome.scope;
        self.paths.lock().await.dec_in_flight(&scope.thread_id);

        if self.cancelled.contains(&scope.thread_id) {
            // Force-pruned thread: late bytes are discarded unprocessed.
            debug!(thread = %scope.thread_id, "discarding late response from cancelled thread");
            self.pop_hop(&scope).await;
            return;
        }

        match outcome.result {
            Ok(HandlerResponse::Emit(bytes)) => {
                // The listener keeps working; its segment stays open.
                self.record_success(&scope);
                self.post_process(&scope, bytes, false).await;
            }
            Ok(HandlerResponse::Reply(bytes)) => {
                self.record_success(&scope);
                self.post_process(&scope, bytes, true).await;
            }
            Ok(HandlerResponse::None) => {
                self.record_success(&scope);
                self.pop_hop(&scope).await;
            }
            Err(HandlerFailure::Throttled { retry_after }) => {
                debug!(bucket = %scope.bucket, ?retry_after, "backend throttled, requeueing");
                self.budgets
                    .lock()
                    .expect("budget lock")
                    .on_throttle(&scope.bucket, scope.cost);
                let _ = self.events.send(BusEvent::Throttled {
                    bucket: scope.bucket.clone(),
                });
                let popped = self.pop_hop(&scope).await;

                // Requeue the captured wire bytes through the listener's
                // own pipeline; admission will re-check the shrunk budget.
                let mut state = MessageState::from_raw(scope.raw.clone());
                state.from = Some(scope.sender.clone());
                state.thread_id = Some(scope.thread_id.clone());
                state.to = Some(scope.listener.clone());
                if let PopTarget::Listener { hop, .. } = popped {
                    state.set_meta(META_HOP, &hop);
                }
                self.inject_into_pipeline(&scope.listener.clone(), state).await;
            }
            Err(HandlerFailure::Failed(reason)) => {
                warn!(listener = %scope.listener, reason = %reason, "handler failed");
                let _ = self.events.send(BusEvent::HandlerFailed {
                    listener: scope.listener.clone(),
                    reason: reason.clone(),
                });
                let reason = format!("handler '{}' failed: {reason}", scope.listener);
                self.diagnose_to_caller(&scope, &reason).await;
            }
        }

        let root = self.root_of(&scope.thread_id).await;
        self.maybe_finalize(&root).await;
    }

    fn record_success(&self, scope: &DispatchScope) {
        if scope.bucket != TOOL_BUCKET {
            self.budgets
                .lock()
                .expect("budget lock")
                .on_success(&scope.bucket);
        }
    }

    /// Pop the listener's call-chain segment and name whoever is one
    /// segment up.
    async fn pop_hop(&mut self, scope: &DispatchScope) -> PopTarget {
        let Some(ref hop) = scope.hop else {
            return PopTarget::Orphan;
        };
        let mut paths = self.paths.lock().await;
        match paths.prune(hop) {
            Some(parent) => match paths.listener_of(&parent) {
                Some(name) => PopTarget::Listener {
                    name: name.to_string(),
                    hop: parent.clone(),
                },
                // The parent is the thread root: the external caller.
                None => PopTarget::Client,
            },
            None => PopTarget::Orphan,
        }
    }

    /// Close the listener's segment and surface a diagnostic to its
    /// caller (handler failures, garbage from tools).
    async fn diagnose_to_caller(&mut self, scope: &DispatchScope, reason: &str) {
        let mut state = MessageState::from_raw(Vec::new());
        state.thread_id = Some(scope.thread_id.clone());
        state.fail(reason.to_string());
        match self.pop_hop(scope).await {
            PopTarget::Listener { name, hop } => {
                state.from = Some(name);
                state.set_meta(META_HOP, &hop);
            }
            PopTarget::Client | PopTarget::Orphan => {
                state.from = Some(scope.sender.clone());
            }
        }
        self.send_system(state).await;
    }

    /// Turn raw handler bytes into fresh messages on the bus.
    async fn post_process(&mut self, scope: &DispatchScope, bytes: Vec<u8>, reply: bool) {
        let children = respond::extract_payloads(&bytes);
        let emitter_is_agent = {
            let registry = self.registry.read().await;
            registry
                .lookup_by_name(&scope.listener)
                .map(|r| r.is_agent())
                .unwrap_or(false)
        };

        // A lone diagnostic substitute (unparseable or empty response).
        let sole_huh = children.len() == 1
            && children[0].name == "huh"
            && children[0].namespace() == Some(SYSTEM_NS);
        if sole_huh {
            let reason = children[0].text();
            if emitter_is_agent && scope.hop.is_some() {
                // Back to the emitter for self-correction, inside its
                // still-open segment.
                let mut state = MessageState::from_raw(Vec::new());
                state.thread_id = Some(scope.thread_id.clone());
                state.from = Some(scope.listener.clone());
                state.fail(reason);
                if let Some(ref hop) = scope.hop {
                    state.set_meta(META_HOP, hop);
                }
                self.send_system(state).await;
            } else {
                self.diagnose_to_caller(scope, &reason).await;
            }
            return;
        }

        // A reply closes this listener's segment; all its payloads go to
        // the caller one segment up.
        let destination = if reply {
            Some(self.pop_hop(scope).await)
        } else {
            None
        };

        for child in children {
            let (to, hop_meta, direct_egress) = match &destination {
                Some(PopTarget::Listener { name, hop }) => {
                    (Some(name.clone()), Some(hop.clone()), false)
                }
                Some(PopTarget::Client) => (None, None, true),
                Some(PopTarget::Orphan) => {
                    let sender_known = {
                        let registry = self.registry.read().await;
                        registry.contains(&scope.sender)
                    };
                    if sender_known {
                        (Some(scope.sender.clone()), None, false)
                    } else {
                        (None, None, true)
                    }
                }
                // Emission: route by root tag, from inside the emitter's
                // open segment.
                None => (None, scope.hop.clone(), false),
            };

            let envelope = Envelope::build(
                &scope.listener,
                &scope.thread_id,
                to.as_deref(),
                child.clone(),
            );
            let mut state = MessageState::from_raw(envelope.canonical_bytes());
            state.from = Some(scope.listener.clone());
            state.thread_id = Some(scope.thread_id.clone());
            state.to = to.clone();
            if let Some(ref hop) = hop_meta {
                state.set_meta(META_HOP, hop);
            }

            if direct_egress {
                self.egress(state).await;
                continue;
            }

            match to {
                Some(target_name) => {
                    self.inject_into_pipeline(&target_name, state).await;
                }
                None => {
                    let first_bound = {
                        let registry = self.registry.read().await;
                        registry
                            .lookup_by_root(&child.name)
                            .first()
                            .map(|r| r.name.clone())
                    };
                    match first_bound {
                        Some(name) => self.inject_into_pipeline(&name, state).await,
                        None => {
                            state.fail(format!(
                                "unknown capability root tag '{}'",
                                child.name
                            ));
                            self.send_system(state).await;
                        }
                    }
                }
            }
        }
    }

    // ── Egress and thread lifecycle ──

    /// Deliver wire bytes to the client that opened the thread.
    async fn egress(&mut self, msg: MessageState) {
        let Some(thread) = msg.thread_id.clone() else {
            warn!("egress without thread identifier dropped");
            return;
        };
        let mut paths = self.paths.lock().await;
        match paths.client_of(&thread) {
            Some(client) => {
                if client.send(msg.raw.clone()).is_err() {
                    warn!(thread = %thread, "client connection gone, egress dropped");
                }
            }
            None => warn!(thread = %thread, "no client attached, egress dropped"),
        }
        paths.append_history(&thread, msg.raw.clone());

        let root = root_of_locked(&paths, &thread);
        paths.set_state(&root, ThreadState::Draining);
        drop(paths);

        let _ = self.events.send(BusEvent::Egressed {
            thread_id: thread.clone(),
        });
        self.maybe_finalize(&root).await;
    }

    async fn root_of(&self, thread: &str) -> String {
        let paths = self.paths.lock().await;
        root_of_locked(&paths, thread)
    }

    fn pump_has_queued(&self, thread: &str) -> bool {
        self.queues
            .values()
            .flatten()
            .chain(self.deferred.iter().map(|(_, m)| m))
            .any(|m| m.thread_id.as_deref() == Some(thread))
    }

    /// A draining root with nothing queued or in flight is terminal: its
    /// registry entry and all listener-scoped storage are deleted.
    async fn maybe_finalize(&mut self, root: &str) {
        if self.pump_has_queued(root) {
            return;
        }
        let removed = {
            let mut paths = self.paths.lock().await;
            if paths.state_of(root) != Some(ThreadState::Draining) || !paths.is_quiescent(root) {
                return;
            }
            paths.set_state(root, ThreadState::Terminal);
            paths.remove_subtree(root)
        };
        for id in &removed {
            self.storage.clear_thread(id);
            self.thread_aborts.remove(id);
        }
        info!(thread = %root, "thread terminal");
        let _ = self.events.send(BusEvent::ThreadTerminal {
            thread_id: root.to_string(),
        });
    }

    // ── Cancellation ──

    async fn sweep_idle(&mut self) {
        let idle = self
            .paths
            .lock()
            .await
            .idle_roots(self.cfg.idle_timeout);
        for root in idle {
            self.force_prune(&root, "thread idle timeout").await;
        }
    }

    /// Cancel a whole thread subtree: abort in-flight dispatches, drop
    /// queued work, notify the client, release all state.
    pub async fn force_prune(&mut self, root: &str, reason: &str) {
        let mut paths = self.paths.lock().await;
        if !paths.contains(root) {
            return;
        }
        warn!(thread = %root, reason = %reason, "force-pruning thread");

        // Notify before the entry disappears.
        let diagnostic = Envelope::build(
            CORE_SENDER,
            root,
            None,
            Element::new("system-thread-error")
                .with_attr("xmlns", SYSTEM_NS)
                .with_text(reason),
        );
        if let Some(client) = paths.client_of(root) {
            let _ = client.send(diagnostic.canonical_bytes());
        }

        let removed = paths.remove_subtree(root);
        drop(paths);

        for id in &removed {
            self.cancelled.insert(id.clone());
            if let Some(handles) = self.thread_aborts.remove(id) {
                for handle in handles {
                    handle.abort();
                }
            }
            self.storage.clear_thread(id);
        }
        let doomed: HashSet<&String> = removed.iter().collect();
        for queue in self.queues.values_mut() {
            queue.retain(|m| {
                m.thread_id
                    .as_ref()
                    .map(|t| !doomed.contains(t))
                    .unwrap_or(true)
            });
        }
        self.deferred.retain(|(_, m)| {
            m.thread_id
                .as_ref()
                .map(|t| !doomed.contains(t))
                .unwrap_or(true)
        });

        let _ = self.events.send(BusEvent::ThreadTerminal {
            thread_id: root.to_string(),
        });
    }
}

/// Budget bucket for a routed message: the agent's own bucket, or the
/// shared tool bucket. Mixed broadcast cannot happen (agent root tags are
/// exclusive), so inspecting the first target is enough.
fn bucket_of(msg: &MessageState) -> String {
    match msg.targets.first() {
        Some(t) if t.is_agent() => t.name.clone(),
        _ => TOOL_BUCKET.to_string(),
    }
}

fn root_of_locked(paths: &PathRegistry, thread: &str) -> String {
    let mut cursor = thread.to_string();
    while let Some(parent) = paths.parent_of(&cursor) {
        cursor = parent.to_string();
    }
    cursor
}
