use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use agentserver::bus::{BusBuilder, ListenerSpec};
use agentserver::gateway::{self, Gateway};
use agentserver::llm::LlmPool;
use agentserver::meta::MetaHandler;
use agentserver::oob::OobCommander;
use agentserver::organism::factory::{build_specs, AgentRuntime, HandlerFactory};
use agentserver::organism::parser::{load_organism, parse_organism};
use agentserver::organism::Organism;
use agentserver::registry::ListenerKind;
use agentserver::server::auth::{load_signing_key, TotpAuthenticator};
use agentserver::server::{run_main_bus, run_oob, ServerConfig};
use agentserver::tools::calculate::{CalcOp, CalculatorTool};
use agentserver::tools::fetch::FetchTool;
use agentserver::tools::search::{bing_stub, google_stub, SearchTool};

/// Default organism configuration embedded in the binary.
const DEFAULT_ORGANISM: &str = r#"
organism:
  name: agentserver

budget:
  tokens_per_minute: 100000
  idle_timeout_secs: 300

meta:
  allow_schema: authenticated
  allow_example: authenticated
  allow_prompt: authenticated
  allow_capabilities: authenticated

listeners:
  - name: calculator.add
    payload_type: calculator.Add
    handler: tools.calculate.add
    description: "Add two numbers; omit <b> to reuse the last result"
    namespace: "https://xml-pipeline.org/ns/calculator/v1"
    fields:
      - name: a
        kind: float
        required: true
      - name: b
        kind: float

  - name: calculator.sub
    payload_type: calculator.Sub
    handler: tools.calculate.sub
    description: "Subtract b from a"
    namespace: "https://xml-pipeline.org/ns/calculator/v1"
    fields:
      - name: a
        kind: float
        required: true
      - name: b
        kind: float

  - name: calculator.mul
    payload_type: calculator.Mul
    handler: tools.calculate.mul
    description: "Multiply two numbers"
    namespace: "https://xml-pipeline.org/ns/calculator/v1"
    fields:
      - name: a
        kind: float
        required: true
      - name: b
        kind: float

  - name: calculator.div
    payload_type: calculator.Div
    handler: tools.calculate.div
    description: "Divide a by b"
    namespace: "https://xml-pipeline.org/ns/calculator/v1"
    fields:
      - name: a
        kind: float
        required: true
      - name: b
        kind: float

  - name: google
    payload_type: search.Search
    root_tag: search
    handler: tools.search.google
    description: "Web search (google)"
    namespace: "https://xml-pipeline.org/ns/search/v1"
    fields:
      - name: query
        kind: text
        required: true
      - name: limit
        kind: int

  - name: bing
    payload_type: search.Search
    root_tag: search
    handler: tools.search.bing
    description: "Web search (bing)"
    namespace: "https://xml-pipeline.org/ns/search/v1"
    fields:
      - name: query
        kind: text
        required: true
      - name: limit
        kind: int

  - name: fetch
    payload_type: tools.Fetch
    handler: tools.fetch
    description: "Bounded HTTP GET"
    namespace: "https://xml-pipeline.org/ns/fetch/v1"
    fields:
      - name: url
        kind: text
        required: true
      - name: limit
        kind: int

  - name: meta
    payload_type: meta.MetaQuery
    root_tag: meta-query
    handler: meta
    description: "Introspection: schema, example, prompt, capabilities"
    namespace: "https://xml-pipeline.org/ns/meta/v1"
    fields:
      - name: op
        kind: text
        required: true
      - name: target
        kind: text

agents:
  - name: researcher
    description: "General research agent"
    prompt: |
      You are the researcher agent on an XML message bus. You receive
      <research-task> payloads. Act by emitting payload elements for your
      peer capabilities (search, calculator operations, fetch, meta). When
      you are done, wrap your final answer in <reply>...</reply>.
    peers: [calculator.add, calculator.sub, calculator.mul, calculator.div, google, bing, fetch, meta]
    root_tag: research-task
    share: 0.6
"#;

#[derive(Parser)]
#[command(
    name = "agentserver",
    about = "Multi-agent orchestration substrate — an XML message plane for tools and LLM agents."
)]
struct Cli {
    /// Path to the organism YAML (default: embedded)
    #[arg(short, long)]
    config: Option<String>,

    /// Data directory for logs and cached schemas (default: .agentserver/)
    #[arg(long)]
    data: Option<String>,

    /// Override the main bus port
    #[arg(short, long)]
    port: Option<u16>,

    /// Default model alias for agents
    #[arg(short, long, default_value = "sonnet")]
    model: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("agentserver: bootstrap failed: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let data_dir = PathBuf::from(cli.data.unwrap_or_else(|| ".agentserver".into()));
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("cannot create data dir {}", data_dir.display()))?;

    // Log to file; the terminal stays quiet for operator tooling.
    let log_file = std::fs::File::create(data_dir.join("agentserver.log"))?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("agentserver=info".parse()?),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .init();

    // Parse organism config.
    let mut organism = match cli.config {
        Some(ref path) => load_organism(std::path::Path::new(path)).map_err(|e| anyhow!(e))?,
        None => parse_organism(DEFAULT_ORGANISM).map_err(|e| anyhow!(e))?,
    };
    if let Some(port) = cli.port {
        organism.port = port;
    }
    info!(organism = %organism.name, port = organism.port, "starting");

    // LLM pool: required whenever agents are configured.
    let pool = if organism.agents().is_empty() {
        None
    } else {
        let pool = LlmPool::from_env(&cli.model)
            .map_err(|e| anyhow!("agents configured but no LLM backend: {e}"))?;
        Some(Arc::new(Mutex::new(pool)))
    };

    // Identity key: mandatory for the privileged channel.
    let signing_key = organism
        .identity
        .as_ref()
        .map(|path| load_signing_key(path).map_err(|e| anyhow!(e)))
        .transpose()?;
    if organism.oob.enabled && signing_key.is_none() {
        bail!("OOB channel enabled but organism.identity is not configured");
    }

    let totp = organism
        .totp_secret
        .as_ref()
        .map(|path| TotpAuthenticator::from_file(path).map_err(|e| anyhow!(e)))
        .transpose()?;
    if totp.is_none() {
        warn!("no TOTP secret configured; main bus connections are unauthenticated");
    }

    // Wire the bus.
    let builder = BusBuilder::new(&organism.name)
        .with_schema_dir(&data_dir.join("schemas"))
        .with_pump_config(organism.pump_config());

    let factory = Arc::new(builtin_factory(&builder, &organism));
    let agent_runtime = pool.map(|pool| AgentRuntime {
        pool,
        paths: builder.paths(),
    });
    let specs =
        build_specs(&organism, &factory, agent_runtime.as_ref()).map_err(|e| anyhow!(e))?;

    let mut builder = builder;
    for spec in specs {
        builder = builder.listener(spec).map_err(|e| anyhow!(e))?;
    }
    let bus = Arc::new(builder.build().await.map_err(|e| anyhow!(e))?);

    // Gateways attach after build (they need the running bus for ingress).
    for gateway_cfg in organism.gateways() {
        let correlations = bus.storage().scoped(&gateway_cfg.name);
        let gateway = Gateway::spawn(gateway_cfg, bus.clone(), correlations);
        bus.add_listener(ListenerSpec {
            name: gateway_cfg.name.clone(),
            schema: gateway::schema(&gateway_cfg.name),
            description: gateway_cfg.description.clone(),
            kind: ListenerKind::Tool,
            peers: Vec::new(),
            share: 0.0,
            handler: Arc::new(gateway.handler()),
        })
        .await
        .map_err(|e| anyhow!(e))?;
    }

    // Endpoints. The guard keeps the shutdown channel open when the OOB
    // endpoint is disabled.
    let (oob_shutdown_tx, mut oob_shutdown_rx) = mpsc::channel(1);
    let _shutdown_guard = oob_shutdown_tx.clone();
    if organism.oob.enabled {
        let commander = Arc::new(OobCommander::new(
            bus.clone(),
            signing_key.expect("checked above").verifying_key(),
            factory.clone(),
            agent_runtime.clone(),
            oob_shutdown_tx,
        ));
        let oob_cfg = organism.oob.clone();
        tokio::spawn(async move {
            if let Err(e) = run_oob(commander, &oob_cfg).await {
                tracing::error!("OOB endpoint failed: {e}");
            }
        });
    }

    let server_cfg = ServerConfig {
        bind: "0.0.0.0".into(),
        port: organism.port,
        tls: organism.tls.clone(),
        totp,
    };
    let mut bus_task = tokio::spawn(run_main_bus(bus.clone(), server_cfg));

    info!("agentserver ready");
    let exit_code = tokio::select! {
        _ = oob_shutdown_rx.recv() => {
            info!("clean shutdown via OOB");
            0
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            0
        }
        result = &mut bus_task => {
            match result {
                Ok(Err(e)) => tracing::error!("main bus failed: {e}"),
                Err(e) => tracing::error!("main bus task died: {e}"),
                Ok(Ok(())) => {}
            }
            2
        }
    };

    bus_task.abort();
    bus.shutdown().await;
    Ok(exit_code)
}

/// Register the vetted builtin handlers the configuration may reference.
fn builtin_factory(builder: &BusBuilder, organism: &Organism) -> HandlerFactory {
    let mut factory = HandlerFactory::new();
    for op in [CalcOp::Add, CalcOp::Sub, CalcOp::Mul, CalcOp::Div] {
        let memory = builder.scoped_storage(&op.listener_name());
        factory.insert(
            &format!("tools.calculate.{}", op.root_tag()),
            Arc::new(CalculatorTool::new(op, memory)),
        );
    }
    factory.insert("tools.search.google", Arc::new(SearchTool::new(google_stub())));
    factory.insert("tools.search.bing", Arc::new(SearchTool::new(bing_stub())));
    factory.insert("tools.fetch", Arc::new(FetchTool::new()));
    factory.insert(
        "meta",
        Arc::new(MetaHandler::new(builder.registry(), organism.meta)),
    );
    factory
}
