use std::{collections::HashSet, time::Duration};

use clap::Parser;

use crate::{
    dispatcher::{DispatchSettings, RouterSettings},
    readiness::ReadinessSettings,
    typing::TypingSettings,
    types::AgentName,
};

#[derive(Debug, Parser, Clone)]
#[command(name = "agent-chat-router")]
#[command(about = "Routes @mention chat between a user session and a pool of agents")]
pub struct Config {
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: String,

    #[arg(long, default_value_t = 8765)]
    pub port: u16,

    /// Base URL of the agent lifecycle service. Without it, agents are
    /// tracked in memory.
    #[arg(long)]
    pub lifecycle_url: Option<String>,

    /// Comma-separated agents known to the in-memory registry.
    #[arg(long, default_value = "assistant")]
    pub agents: String,

    #[arg(long, default_value = "assistant")]
    pub primary: String,

    /// Upper bound on one lifecycle service call, and on building the
    /// registry view a routing decision is made against.
    #[arg(long, default_value_t = 5000)]
    pub registry_timeout_ms: u64,

    #[arg(long, default_value_t = 500)]
    pub readiness_interval_ms: u64,

    #[arg(long, default_value_t = 10)]
    pub readiness_max_attempts: u32,

    #[arg(long, default_value_t = 500)]
    pub readiness_grace_ms: u64,

    #[arg(long, default_value_t = 1000)]
    pub reinit_delay_ms: u64,

    #[arg(long, default_value_t = 500)]
    pub typing_debounce_ms: u64,

    #[arg(long, default_value_t = 60_000)]
    pub typing_timeout_ms: u64,

    #[arg(long, default_value_t = 3)]
    pub max_delegation_depth: u32,

    #[arg(long, default_value_t = 200)]
    pub history_limit: usize,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long, default_value_t = false)]
    pub json_events: bool,
}

impl Config {
    pub fn primary_agent(&self) -> AgentName {
        AgentName::new(&self.primary)
    }

    /// Agents for the in-memory registry; always includes the primary.
    pub fn agents_vec(&self) -> Vec<AgentName> {
        let mut agents: Vec<AgentName> = self
            .agents
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(AgentName::new)
            .collect();
        let primary = self.primary_agent();
        if !agents.contains(&primary) {
            agents.insert(0, primary);
        }
        let mut seen = HashSet::new();
        agents.retain(|agent| seen.insert(agent.clone()));
        agents
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_millis(self.registry_timeout_ms)
    }

    pub fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            readiness: ReadinessSettings {
                poll_interval: Duration::from_millis(self.readiness_interval_ms),
                max_attempts: self.readiness_max_attempts,
                grace: Duration::from_millis(self.readiness_grace_ms),
                reinit_delay: Duration::from_millis(self.reinit_delay_ms),
            },
            typing: TypingSettings {
                debounce: Duration::from_millis(self.typing_debounce_ms),
                timeout: Duration::from_millis(self.typing_timeout_ms),
            },
            dispatch: DispatchSettings {
                primary: self.primary_agent(),
                max_delegation_depth: self.max_delegation_depth,
                registry_timeout: self.registry_timeout(),
            },
            history_limit: self.history_limit,
        }
    }
}
