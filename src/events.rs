//! Process logging setup and the machine-readable router event stream.

use std::io::{self, Write};
#[cfg(test)]
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
#[cfg(test)]
use parking_lot::Mutex;
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

use crate::{
    config::Config,
    routing::RoutingDecision,
    types::{AgentName, SessionKey},
};

/// `RUST_LOG` wins over `--log-level` when both are set.
pub fn init_logging(cfg: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// One routing lifecycle fact. Serialized as
/// `{"type": "<snake_case>", "payload": {..}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RouterEvent {
    RouterStarted {
        addr: String,
        primary: AgentName,
    },
    RouterStopped {},
    SessionOpened {
        session: SessionKey,
    },
    SessionClosed {
        session: SessionKey,
        dropped_deliveries: usize,
    },
    RoutingDecision {
        session: SessionKey,
        decision: RoutingDecision,
        ignored: Vec<AgentName>,
    },
    ReadinessTimeout {
        session: SessionKey,
        agent: AgentName,
        attempts: u32,
    },
    DeliveryFailed {
        session: SessionKey,
        agent: AgentName,
        error: String,
    },
}

impl RouterEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RouterStarted { .. } => "router_started",
            Self::RouterStopped {} => "router_stopped",
            Self::SessionOpened { .. } => "session_opened",
            Self::SessionClosed { .. } => "session_closed",
            Self::RoutingDecision { .. } => "routing_decision",
            Self::ReadinessTimeout { .. } => "readiness_timeout",
            Self::DeliveryFailed { .. } => "delivery_failed",
        }
    }
}

#[derive(Clone, Debug)]
enum Sink {
    Off,
    Stderr,
    #[cfg(test)]
    Memory(Arc<Mutex<Vec<serde_json::Value>>>),
}

/// Writes [`RouterEvent`]s as JSON lines on stderr, each stamped with `ts`.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    sink: Sink,
}

impl EventEmitter {
    pub fn new(json_output: bool) -> Self {
        let sink = if json_output { Sink::Stderr } else { Sink::Off };
        Self { sink }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    /// Emitter that keeps rendered lines in memory instead of printing them.
    #[cfg(test)]
    pub(crate) fn recording() -> (Self, Arc<Mutex<Vec<serde_json::Value>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let emitter = Self {
            sink: Sink::Memory(Arc::clone(&lines)),
        };
        (emitter, lines)
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.sink, Sink::Off)
    }

    pub fn emit(&self, event: RouterEvent) {
        match &self.sink {
            Sink::Off => {}
            Sink::Stderr => {
                let line = render(&event);
                let mut stderr = io::stderr().lock();
                let _ = writeln!(stderr, "{line}");
            }
            #[cfg(test)]
            Sink::Memory(lines) => lines.lock().push(render(&event)),
        }
    }
}

fn render(event: &RouterEvent) -> serde_json::Value {
    let mut line = match serde_json::to_value(event) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(target = "router::events", kind = event.kind(), error = %error, "event not serializable");
            serde_json::json!({ "type": event.kind() })
        }
    };
    if let Some(fields) = line.as_object_mut() {
        fields.insert("ts".into(), Utc::now().to_rfc3339().into());
    }
    line
}
