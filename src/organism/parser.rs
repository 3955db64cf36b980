//! YAML parser for the organism configuration.
//!
//! Parses the bootstrap file into an `Organism` by calling the imperative
//! API (register_listener, register_agent, register_gateway).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::meta::{MetaFlags, MetaGate};
use crate::pump::Scheduling;

use super::{
    AgentEntry, FieldConfig, GatewayConfig, ListenerConfig, OobConfig, Organism, TlsConfig,
};

#[derive(Debug, Deserialize)]
struct OrganismYaml {
    organism: OrganismMeta,
    #[serde(default)]
    oob: Option<OobYaml>,
    #[serde(default)]
    thread_scheduling: Option<String>,
    #[serde(default)]
    budget: Option<BudgetYaml>,
    #[serde(default)]
    meta: HashMap<String, String>,
    #[serde(default)]
    listeners: Vec<ListenerYaml>,
    #[serde(default)]
    agents: Vec<AgentYaml>,
    #[serde(default)]
    gateways: Vec<GatewayYaml>,
}

#[derive(Debug, Deserialize)]
struct OrganismMeta {
    name: String,
    #[serde(default)]
    identity: Option<PathBuf>,
    #[serde(default)]
    totp_secret: Option<PathBuf>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    tls: Option<TlsYaml>,
}

#[derive(Debug, Deserialize)]
struct TlsYaml {
    cert: PathBuf,
    key: PathBuf,
}

#[derive(Debug, Deserialize)]
struct OobYaml {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    bind: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    socket: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct BudgetYaml {
    #[serde(default)]
    tokens_per_minute: Option<f64>,
    #[serde(default)]
    idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ListenerYaml {
    name: String,
    payload_type: String,
    handler: String,
    description: String,
    #[serde(default)]
    root_tag: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    fields: Vec<FieldYaml>,
    #[serde(default = "default_true")]
    strict: bool,
}

#[derive(Debug, Deserialize)]
struct FieldYaml {
    name: String,
    kind: String,
    #[serde(default)]
    required: bool,
}

#[derive(Debug, Deserialize)]
struct AgentYaml {
    name: String,
    description: String,
    #[serde(default)]
    root_tag: Option<String>,
    #[serde(default)]
    system_prompt: Option<PathBuf>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    peers: Vec<String>,
    #[serde(default = "default_share")]
    share: f64,
    #[serde(default)]
    model: Option<String>,
    #[serde(default = "default_max_tokens")]
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GatewayYaml {
    name: String,
    url: String,
    #[serde(default)]
    public_key: Option<String>,
    #[serde(default)]
    description: String,
}

fn default_true() -> bool {
    true
}

fn default_share() -> f64 {
    0.25
}

fn default_max_tokens() -> u32 {
    4096
}

/// Load an organism from a YAML file.
pub fn load_organism(path: &Path) -> Result<Organism, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    parse_organism(&contents)
}

/// Parse an organism from a YAML string.
pub fn parse_organism(yaml: &str) -> Result<Organism, String> {
    let raw: OrganismYaml =
        serde_yaml::from_str(yaml).map_err(|e| format!("YAML parse error: {e}"))?;

    let mut org = Organism::new(&raw.organism.name);
    org.identity = raw.organism.identity;
    org.totp_secret = raw.organism.totp_secret;
    if let Some(port) = raw.organism.port {
        org.port = port;
    }
    org.tls = raw.organism.tls.map(|t| TlsConfig {
        cert: t.cert,
        key: t.key,
    });

    if let Some(oob) = raw.oob {
        org.oob = OobConfig {
            enabled: oob.enabled,
            bind: oob.bind.unwrap_or_else(|| "127.0.0.1".into()),
            port: oob.port,
            socket: oob.socket,
        };
    }

    if let Some(ref scheduling) = raw.thread_scheduling {
        org.scheduling = Scheduling::parse(scheduling)
            .ok_or_else(|| format!("unknown thread_scheduling '{scheduling}'"))?;
    }

    if let Some(budget) = raw.budget {
        if let Some(tpm) = budget.tokens_per_minute {
            org.tokens_per_minute = tpm;
        }
        if let Some(idle) = budget.idle_timeout_secs {
            org.idle_timeout = Duration::from_secs(idle);
        }
    }

    org.meta = parse_meta_flags(&raw.meta)?;

    for l in raw.listeners {
        org.register_listener(ListenerConfig {
            name: l.name,
            payload_type: l.payload_type,
            root_tag: l.root_tag,
            namespace: l.namespace,
            handler: l.handler,
            description: l.description,
            fields: l
                .fields
                .into_iter()
                .map(|f| FieldConfig {
                    name: f.name,
                    kind: f.kind,
                    required: f.required,
                })
                .collect(),
            strict: l.strict,
        })?;
    }

    for a in raw.agents {
        org.register_agent(AgentEntry {
            name: a.name,
            root_tag: a.root_tag,
            description: a.description,
            system_prompt: a.system_prompt,
            prompt: a.prompt,
            peers: a.peers,
            share: a.share,
            model: a.model,
            max_tokens: a.max_tokens,
        })?;
    }

    for g in raw.gateways {
        org.register_gateway(GatewayConfig {
            name: g.name,
            url: g.url,
            public_key: g.public_key,
            description: g.description,
        })?;
    }

    org.validate()?;
    Ok(org)
}

fn parse_meta_flags(raw: &HashMap<String, String>) -> Result<MetaFlags, String> {
    let mut flags = MetaFlags::default();
    for (key, value) in raw {
        let gate = MetaGate::parse(value)
            .ok_or_else(|| format!("meta flag '{key}': unknown level '{value}'"))?;
        match key.as_str() {
            "allow_schema" => flags.schema = gate,
            "allow_example" => flags.example = gate,
            "allow_prompt" => flags.prompt = gate,
            "allow_capabilities" => flags.capabilities = gate,
            other => return Err(format!("unknown meta flag '{other}'")),
        }
    }
    Ok(flags)
}
