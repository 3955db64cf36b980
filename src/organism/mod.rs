//! Organism — configuration model for one server instance.
//!
//! The organism is the single source of truth for identity, endpoints,
//! scheduling policy, and the listener/agent/gateway roster. The YAML
//! parser is a client of this imperative API, and so is the privileged
//! hot-reload path.

pub mod factory;
pub mod parser;

use std::path::PathBuf;
use std::time::Duration;

use crate::meta::MetaFlags;
use crate::pump::{PumpConfig, Scheduling};

/// TLS material for the main bus.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Privileged channel endpoint.
#[derive(Debug, Clone)]
pub struct OobConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: Option<u16>,
    pub socket: Option<PathBuf>,
}

impl Default for OobConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1".into(),
            port: None,
            socket: None,
        }
    }
}

/// A declared payload field.
#[derive(Debug, Clone)]
pub struct FieldConfig {
    pub name: String,
    pub kind: String,
    pub required: bool,
}

/// A tool listener from configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub name: String,
    /// Payload type name; the root tag derives from it when no explicit
    /// tag is given.
    pub payload_type: String,
    pub root_tag: Option<String>,
    pub namespace: Option<String>,
    pub handler: String,
    pub description: String,
    pub fields: Vec<FieldConfig>,
    pub strict: bool,
}

/// An agent listener from configuration.
#[derive(Debug, Clone)]
pub struct AgentEntry {
    pub name: String,
    pub root_tag: Option<String>,
    pub description: String,
    /// Path to the system prompt file.
    pub system_prompt: Option<PathBuf>,
    /// Inline prompt, wins over the file.
    pub prompt: Option<String>,
    pub peers: Vec<String>,
    /// Share of the global token budget.
    pub share: f64,
    pub model: Option<String>,
    pub max_tokens: u32,
}

/// A federation gateway from configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub name: String,
    pub url: String,
    /// Hex-encoded trusted public key of the remote organism.
    pub public_key: Option<String>,
    pub description: String,
}

/// The organism: everything bootstrap needs.
#[derive(Debug)]
pub struct Organism {
    pub name: String,
    /// Long-term ed25519 identity key file.
    pub identity: Option<PathBuf>,
    /// TOTP shared-secret file for main-bus authentication.
    pub totp_secret: Option<PathBuf>,
    pub port: u16,
    pub tls: Option<TlsConfig>,
    pub oob: OobConfig,
    pub scheduling: Scheduling,
    pub tokens_per_minute: f64,
    pub idle_timeout: Duration,
    pub meta: MetaFlags,
    listeners: Vec<ListenerConfig>,
    agents: Vec<AgentEntry>,
    gateways: Vec<GatewayConfig>,
}

impl Organism {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            identity: None,
            totp_secret: None,
            port: 8901,
            tls: None,
            oob: OobConfig::default(),
            scheduling: Scheduling::BreadthFirst,
            tokens_per_minute: 100_000.0,
            idle_timeout: Duration::from_secs(300),
            meta: MetaFlags::default(),
            listeners: Vec::new(),
            agents: Vec::new(),
            gateways: Vec::new(),
        }
    }

    pub fn register_listener(&mut self, listener: ListenerConfig) -> Result<(), String> {
        if self.is_name_taken(&listener.name) {
            return Err(format!("listener '{}' already registered", listener.name));
        }
        self.listeners.push(listener);
        Ok(())
    }

    pub fn register_agent(&mut self, agent: AgentEntry) -> Result<(), String> {
        if self.is_name_taken(&agent.name) {
            return Err(format!("agent '{}' already registered", agent.name));
        }
        if agent.share <= 0.0 || agent.share > 1.0 {
            return Err(format!(
                "agent '{}': share must be in (0, 1], got {}",
                agent.name, agent.share
            ));
        }
        self.agents.push(agent);
        Ok(())
    }

    pub fn register_gateway(&mut self, gateway: GatewayConfig) -> Result<(), String> {
        if self.is_name_taken(&gateway.name) {
            return Err(format!("gateway '{}' already registered", gateway.name));
        }
        self.gateways.push(gateway);
        Ok(())
    }

    fn is_name_taken(&self, name: &str) -> bool {
        self.listeners.iter().any(|l| l.name == name)
            || self.agents.iter().any(|a| a.name == name)
            || self.gateways.iter().any(|g| g.name == name)
    }

    pub fn listeners(&self) -> &[ListenerConfig] {
        &self.listeners
    }

    pub fn agents(&self) -> &[AgentEntry] {
        &self.agents
    }

    pub fn gateways(&self) -> &[GatewayConfig] {
        &self.gateways
    }

    pub fn get_listener(&self, name: &str) -> Option<&ListenerConfig> {
        self.listeners.iter().find(|l| l.name == name)
    }

    pub fn get_agent(&self, name: &str) -> Option<&AgentEntry> {
        self.agents.iter().find(|a| a.name == name)
    }

    /// Validate cross-references: every declared peer must exist.
    pub fn validate(&self) -> Result<(), String> {
        for agent in &self.agents {
            for peer in &agent.peers {
                if !self.is_name_taken(peer) {
                    return Err(format!(
                        "agent '{}' declares unknown peer '{peer}'",
                        agent.name
                    ));
                }
            }
        }
        let total_share: f64 = self.agents.iter().map(|a| a.share).sum();
        if total_share > 1.0 + f64::EPSILON {
            return Err(format!(
                "agent shares sum to {total_share:.2}, exceeding the global budget"
            ));
        }
        Ok(())
    }

    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            scheduling: self.scheduling,
            concurrency_cap: PumpConfig::default().concurrency_cap,
            tokens_per_minute: self.tokens_per_minute,
            idle_timeout: self.idle_timeout,
        }
    }
}
