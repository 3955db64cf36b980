//! Bus — assembly and runtime surface of the message plane.
//!
//! `BusBuilder` registers listeners before anything runs (schemas compile
//! once, pipelines spawn at build). The built `Bus` exposes ingress,
//! structural mutation (privileged add/remove/reload), and shutdown. The
//! pump runs as a background task owned by the bus.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::handler::Handler;
use crate::pipeline::state::MessageState;
use crate::pipeline::steps::{default_steps, system_steps, StepContext};
use crate::pipeline::{Pipeline, DEFAULT_QUEUE_CAPACITY};
use crate::pump::budget::BudgetBook;
use crate::pump::{BusEvent, MessagePump, PumpConfig, PumpControl};
use crate::registry::{
    ListenerKind, ListenerRecord, ListenerRegistry, ListenerStorage, ScopedStorage,
};
use crate::schema::{Envelope, PayloadSchema, SchemaStore, CORE_SENDER, SYSTEM_NS};
use crate::threads::{ClientHandle, PathRegistry, ThreadState};
use crate::xml::{repair, Element};

/// Payload root tags reserved for the privileged channel. On the main bus
/// these have no registered listener by construction; seeing one is a
/// security event.
pub const PRIVILEGED_TAGS: &[&str] = &[
    "add-listener",
    "remove-listener",
    "hot-reload",
    "introspect",
    "prune-thread",
    "shutdown",
];

/// System payload tags clients may legitimately send.
const CLIENT_SYSTEM_TAGS: &[&str] = &["thread-spawn"];

/// Everything needed to register one capability.
pub struct ListenerSpec {
    // NOTE: `handler: Arc<dyn Handler>` doesn't implement Debug; see manual
    // `impl Debug for ListenerSpec` below.
    pub name: String,
    pub schema: PayloadSchema,
    pub description: String,
    pub kind: ListenerKind,
    pub peers: Vec<String>,
    /// Agent share of the global token budget; ignored for tools.
    pub share: f64,
    pub handler: Arc<dyn Handler>,
}

impl std::fmt::Debug for ListenerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSpec")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("description", &self.description)
            .field("kind", &self.kind)
            .field("peers", &self.peers)
            .field("share", &self.share)
            .field("handler", &"<handler>")
            .finish()
    }
}

/// Result of a hot-reload diff.
#[derive(Debug, Default)]
pub struct ReloadEvent {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

pub struct BusBuilder {
    organism: String,
    cfg: PumpConfig,
    queue_capacity: usize,
    registry: Arc<RwLock<ListenerRegistry>>,
    paths: Arc<Mutex<PathRegistry>>,
    schemas: Arc<StdMutex<SchemaStore>>,
    budgets: Arc<StdMutex<BudgetBook>>,
}

impl BusBuilder {
    pub fn new(organism: &str) -> Self {
        let cfg = PumpConfig::default();
        let budgets = BudgetBook::new(cfg.tokens_per_minute);
        Self {
            organism: organism.to_string(),
            cfg,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            registry: Arc::new(RwLock::new(ListenerRegistry::new())),
            paths: Arc::new(Mutex::new(PathRegistry::new())),
            schemas: Arc::new(StdMutex::new(SchemaStore::new())),
            budgets: Arc::new(StdMutex::new(budgets)),
        }
    }

    /// Shared path registry handle, usable before build (agent handlers
    /// read conversation history through it).
    pub fn paths(&self) -> Arc<Mutex<PathRegistry>> {
        self.paths.clone()
    }

    /// Persist compiled schemas under `dir/<listener>/v1.xsd`.
    pub fn with_schema_dir(self, dir: &Path) -> Self {
        *self.schemas.lock().expect("schema lock") = SchemaStore::with_dir(dir);
        self
    }

    pub fn with_pump_config(mut self, cfg: PumpConfig) -> Self {
        *self.budgets.lock().expect("budget lock") = BudgetBook::new(cfg.tokens_per_minute);
        self.cfg = cfg;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Shared registry handle, usable before build (the meta handler needs
    /// it at construction time).
    pub fn registry(&self) -> Arc<RwLock<ListenerRegistry>> {
        self.registry.clone()
    }

    /// Storage view for a listener being wired up (stateful tools).
    pub fn scoped_storage(&self, listener: &str) -> ScopedStorage {
        self.registry
            .try_read()
            .expect("registry uncontended at build time")
            .scoped_storage(listener)
    }

    /// Register a capability.
    pub fn listener(self, spec: ListenerSpec) -> Result<Self, String> {
        let compiled = self
            .schemas
            .lock()
            .expect("schema lock")
            .compile(&spec.name, spec.schema)
            .map_err(|e| format!("schema for '{}': {e}", spec.name))?;

        let record = ListenerRecord {
            name: spec.name.clone(),
            root_tag: compiled.root_tag().to_string(),
            description: spec.description,
            kind: spec.kind,
            peers: spec.peers.into_iter().collect(),
            schema: compiled,
            handler: spec.handler,
        };

        {
            let mut registry = self
                .registry
                .try_write()
                .map_err(|_| "registry contended during build".to_string())?;
            registry.register(record).map_err(|e| e.to_string())?;
        }
        if spec.kind == ListenerKind::Agent {
            self.budgets
                .lock()
                .expect("budget lock")
                .add_agent(&spec.name, spec.share);
        }
        Ok(self)
    }

    /// Build the bus: spawn the system pipeline, one pipeline per
    /// listener, and the pump. Injects the boot message.
    pub async fn build(self) -> Result<Bus, String> {
        let paths = self.paths.clone();
        let storage = self.registry.read().await.storage();
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let system_cx = StepContext {
            listener: None,
            registry: self.registry.clone(),
            paths: paths.clone(),
        };
        let system = Pipeline::spawn(
            "system",
            system_steps(),
            system_cx,
            ready_tx.clone(),
            None,
            self.queue_capacity,
        );

        let pipelines = Arc::new(RwLock::new(HashMap::new()));
        {
            let registry = self.registry.read().await;
            let mut map = pipelines.write().await;
            for record in registry.records() {
                let cx = StepContext {
                    listener: Some(record.clone()),
                    registry: self.registry.clone(),
                    paths: paths.clone(),
                };
                map.insert(
                    record.name.clone(),
                    Pipeline::spawn(
                        &record.name,
                        default_steps(),
                        cx,
                        ready_tx.clone(),
                        Some(system.intake()),
                        self.queue_capacity,
                    ),
                );
            }
        }

        let pump = MessagePump::new(
            self.cfg.clone(),
            self.registry.clone(),
            paths.clone(),
            pipelines.clone(),
            system.intake(),
            ready_rx,
            self.budgets.clone(),
            storage.clone(),
            events.clone(),
            shutdown_rx,
            control_rx,
        );
        let pump_task = tokio::spawn(pump.run());

        let bus = Bus {
            organism: self.organism,
            registry: self.registry,
            paths,
            pipelines,
            system,
            ready_tx,
            budgets: self.budgets,
            schemas: self.schemas,
            storage,
            events,
            shutdown_tx,
            control_tx,
            pump_task: StdMutex::new(Some(pump_task)),
            queue_capacity: self.queue_capacity,
        };
        bus.inject_boot().await;
        Ok(bus)
    }
}

/// The running message plane.
pub struct Bus {
    organism: String,
    pub registry: Arc<RwLock<ListenerRegistry>>,
    pub paths: Arc<Mutex<PathRegistry>>,
    pipelines: Arc<RwLock<HashMap<String, Pipeline>>>,
    system: Pipeline,
    ready_tx: mpsc::UnboundedSender<MessageState>,
    budgets: Arc<StdMutex<BudgetBook>>,
    schemas: Arc<StdMutex<SchemaStore>>,
    storage: ListenerStorage,
    events: broadcast::Sender<BusEvent>,
    shutdown_tx: watch::Sender<bool>,
    control_tx: mpsc::UnboundedSender<PumpControl>,
    pump_task: StdMutex<Option<JoinHandle<()>>>,
    queue_capacity: usize,
}

impl Bus {
    pub fn organism(&self) -> &str {
        &self.organism
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> broadcast::Sender<BusEvent> {
        self.events.clone()
    }

    /// First message of the organism's lifetime.
    async fn inject_boot(&self) {
        let boot_thread = self.paths.lock().await.new_root(None);
        let listener_count = self.registry.read().await.len();
        let payload = Element::new("boot")
            .with_attr("xmlns", SYSTEM_NS)
            .with_child(Element::new("organism").with_text(&self.organism))
            .with_child(Element::new("listeners").with_text(&listener_count.to_string()));
        let envelope = Envelope::build(CORE_SENDER, &boot_thread, None, payload);

        let mut state = MessageState::from_raw(envelope.canonical_bytes());
        state.from = Some(CORE_SENDER.to_string());
        state.thread_id = Some(boot_thread.clone());
        self.paths.lock().await.inc_queued(&boot_thread);
        if self.system.enqueue(state).await.is_err() {
            warn!("boot message could not be enqueued");
        }
    }

    /// Ingress from an authenticated external connection.
    ///
    /// `identity` is the authenticated client name (never taken from the
    /// wire). Unknown thread identifiers become new roots tied to the
    /// client's egress handle.
    pub async fn inject(
        &self,
        raw: Vec<u8>,
        identity: &str,
        client: Option<ClientHandle>,
    ) -> Result<(), String> {
        // Peek at the envelope to pick the pipeline and register the root.
        let peek = repair::parse(&raw).and_then(|tree| Envelope::parse(&tree).ok());
        let Some(envelope) = peek else {
            let mut state = MessageState::from_raw(raw);
            state.from = Some(identity.to_string());
            state.fail("message could not be parsed as an envelope");
            return self.send_system(state).await;
        };

        let thread = envelope.thread.clone();
        {
            let mut paths = self.paths.lock().await;
            paths.adopt_root(&thread, client);
            paths.set_state(&thread, ThreadState::Open);
        }

        let tag = envelope.payload.name.as_str();
        if PRIVILEGED_TAGS.contains(&tag) {
            // Privileged shapes never execute from the main bus; the pump
            // is oblivious to them, so routing resolution fails into <huh>.
            warn!(
                target: "security",
                client = identity,
                tag,
                "privileged payload on main bus"
            );
            let _ = self.events.send(BusEvent::SecurityEvent {
                reason: format!("privileged payload '{tag}' from '{identity}' on main bus"),
            });
        }

        let mut state = MessageState::from_raw(raw);
        state.from = Some(identity.to_string());
        state.thread_id = Some(thread.clone());

        // System primitives clients may use go straight to the system
        // pipeline; everything else to the matching listener pipeline.
        let pipeline_name = if CLIENT_SYSTEM_TAGS.contains(&tag) {
            None
        } else if let Some(ref to) = envelope.to {
            self.registry
                .read()
                .await
                .lookup_by_name(to)
                .map(|r| r.name.clone())
        } else {
            self.registry
                .read()
                .await
                .lookup_by_root(tag)
                .first()
                .map(|r| r.name.clone())
        };

        let _ = self.events.send(BusEvent::MessageInjected {
            thread_id: thread.clone(),
            target: pipeline_name.clone().unwrap_or_else(|| "system".into()),
        });

        match pipeline_name {
            Some(name) => {
                let pipelines = self.pipelines.read().await;
                let Some(pipeline) = pipelines.get(&name) else {
                    drop(pipelines);
                    state.fail(format!("unknown capability '{name}'"));
                    return self.send_system(state).await;
                };
                self.paths.lock().await.inc_queued(&thread);
                if let Err(back) = pipeline.enqueue(state).await {
                    self.paths.lock().await.dec_queued(&thread);
                    let mut state = back;
                    state.fail(format!("capability '{name}' is not accepting messages"));
                    return self.send_system(state).await;
                }
                Ok(())
            }
            None => self.send_system(state).await,
        }
    }

    async fn send_system(&self, state: MessageState) -> Result<(), String> {
        if let Some(thread) = state.thread_id.clone() {
            self.paths.lock().await.inc_queued(&thread);
        }
        self.system
            .enqueue(state)
            .await
            .map_err(|_| "system pipeline unavailable".to_string())
    }

    // ── Structural mutation (privileged paths only) ──

    /// Register a listener and spawn its pipeline. Applied atomically:
    /// the registry write lock serializes against routing reads.
    pub async fn add_listener(&self, spec: ListenerSpec) -> Result<(), String> {
        let compiled = self
            .schemas
            .lock()
            .expect("schema lock")
            .compile(&spec.name, spec.schema)
            .map_err(|e| format!("schema for '{}': {e}", spec.name))?;

        let record = ListenerRecord {
            name: spec.name.clone(),
            root_tag: compiled.root_tag().to_string(),
            description: spec.description,
            kind: spec.kind,
            peers: spec.peers.into_iter().collect(),
            schema: compiled,
            handler: spec.handler,
        };

        let mut registry = self.registry.write().await;
        let record = registry.register(record).map_err(|e| e.to_string())?;
        let cx = StepContext {
            listener: Some(record.clone()),
            registry: self.registry.clone(),
            paths: self.paths.clone(),
        };
        self.pipelines.write().await.insert(
            record.name.clone(),
            Pipeline::spawn(
                &record.name,
                default_steps(),
                cx,
                self.ready_tx.clone(),
                Some(self.system.intake()),
                self.queue_capacity,
            ),
        );
        if spec.kind == ListenerKind::Agent {
            self.budgets
                .lock()
                .expect("budget lock")
                .add_agent(&spec.name, spec.share);
        }
        info!(listener = %spec.name, "listener registered");
        Ok(())
    }

    /// Deregister a listener. Its pipeline intake closes immediately;
    /// queued messages drain as removal diagnostics.
    pub async fn remove_listener(&self, name: &str) -> Result<(), String> {
        let mut registry = self.registry.write().await;
        registry.unregister(name).map_err(|e| e.to_string())?;
        if let Some(pipeline) = self.pipelines.write().await.remove(name) {
            pipeline.close();
        }
        self.budgets.lock().expect("budget lock").remove_agent(name);
        self.schemas.lock().expect("schema lock").remove(name);
        info!(listener = %name, "listener removed");
        Ok(())
    }

    /// Replace the listener set wholesale, diffing against the current one.
    pub async fn reload(&self, specs: Vec<ListenerSpec>) -> Result<ReloadEvent, String> {
        let current = self.registry.read().await.names();
        let incoming: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
        let mut event = ReloadEvent::default();

        for name in &current {
            if !incoming.contains(name) {
                self.remove_listener(name).await?;
                event.removed.push(name.clone());
            }
        }
        for spec in specs {
            if current.contains(&spec.name) {
                let name = spec.name.clone();
                self.remove_listener(&name).await?;
                self.add_listener(spec).await?;
                event.updated.push(name);
            } else {
                event.added.push(spec.name.clone());
                self.add_listener(spec).await?;
            }
        }
        info!(
            added = event.added.len(),
            removed = event.removed.len(),
            updated = event.updated.len(),
            "hot reload applied"
        );
        Ok(event)
    }

    /// Storage handle (privileged introspection and tests).
    pub fn storage(&self) -> ListenerStorage {
        self.storage.clone()
    }

    /// Cancel a thread subtree (privileged). In-flight dispatches abort;
    /// their late bytes are discarded.
    pub fn force_prune(&self, thread: &str, reason: &str) -> Result<(), String> {
        self.control_tx
            .send(PumpControl::ForcePrune {
                thread: thread.to_string(),
                reason: reason.to_string(),
            })
            .map_err(|_| "pump is not running".to_string())
    }

    /// Stop the pump and close down.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.pump_task.lock().expect("pump task lock").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Derive a payload root tag from a payload type name: the lowercased type
/// name unless an explicit tag is configured.
pub fn derive_root_tag(payload_type: &str, explicit: Option<&str>) -> String {
    match explicit {
        Some(tag) => tag.to_string(),
        None => payload_type
            .rsplit('.')
            .next()
            .unwrap_or(payload_type)
            .to_lowercase(),
    }
}
