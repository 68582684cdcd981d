use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::{
    orchestrator::OrchestratorConfig,
    queue::QueueConfig,
    transfer::TransferConfig,
};

#[derive(Debug, Parser, Clone)]
#[command(name = "agent-bridge")]
#[command(about = "Bridges a local agent CLI to a remote relay over one persistent connection")]
pub struct Config {
    /// Agent identity announced to the relay.
    #[arg(long)]
    pub agent_id: Option<String>,

    #[arg(long, default_value = "wss://relay.example.dev")]
    pub relay_url: String,

    /// Relay auth token; falls back to AGENT_BRIDGE_TOKEN.
    #[arg(long, env = "AGENT_BRIDGE_TOKEN", default_value = "")]
    pub token: String,

    #[arg(long, default_value_t = 2)]
    pub max_active: usize,

    #[arg(long, default_value_t = 30_000)]
    pub queue_wait_timeout_ms: u64,

    #[arg(long, default_value_t = 16)]
    pub queue_max: usize,

    #[arg(long, default_value_t = 600)]
    pub replay_ttl_secs: u64,

    #[arg(long, default_value_t = 10_000)]
    pub replay_max_entries: usize,

    #[arg(long, default_value_t = 600)]
    pub session_idle_secs: u64,

    #[arg(long, default_value_t = 60)]
    pub sweep_interval_secs: u64,

    #[arg(long, default_value_t = 15)]
    pub heartbeat_secs: u64,

    #[arg(long, default_value_t = 300)]
    pub transfer_active_ttl_secs: u64,

    #[arg(long, default_value_t = 3600)]
    pub transfer_dormant_ttl_secs: u64,

    #[arg(long)]
    pub transfer_cache_dir: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long, default_value_t = false)]
    pub json_output: bool,

    /// Backend command run per turn.
    #[arg(required = true)]
    pub command: String,

    #[arg(last = true)]
    pub args: Vec<String>,
}

impl Config {
    pub fn resolved_agent_id(&self) -> String {
        self.agent_id
            .clone()
            .unwrap_or_else(|| format!("bridge-{}", std::process::id()))
    }

    pub fn transfer_cache_dir(&self) -> PathBuf {
        self.transfer_cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("agent-bridge")
                .join("transfers")
        })
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            agent_id: self.resolved_agent_id(),
            queue: QueueConfig {
                max_active: self.max_active,
                wait_timeout: Duration::from_millis(self.queue_wait_timeout_ms),
                max_queued: self.queue_max,
            },
            replay_ttl: Duration::from_secs(self.replay_ttl_secs),
            replay_max_entries: self.replay_max_entries,
            session_idle_ttl: Duration::from_secs(self.session_idle_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            heartbeat_period: Duration::from_secs(self.heartbeat_secs),
            transfer: TransferConfig {
                active_ttl: Duration::from_secs(self.transfer_active_ttl_secs),
                dormant_ttl: Duration::from_secs(self.transfer_dormant_ttl_secs),
                cache_dir: self.transfer_cache_dir(),
            },
        }
    }
}
