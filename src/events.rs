//! Logging init and machine-readable lifecycle events.
//!
//! Supervisors that run the bridge as a child process watch stderr for one
//! JSON line per lifecycle transition. The event set is closed on purpose:
//! anything finer-grained belongs in tracing, not here.

use std::io::{self, Write};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

pub fn init_logging(cfg: &Config) -> Result<()> {
    let filter =
        EnvFilter::try_new(cfg.log_level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(true)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Reconnected,
    Disconnected,
}

/// Lifecycle transitions of the bridge process itself.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Startup { agent_id: String, relay_url: String },
    Connection { status: ConnectionStatus },
    Shutdown { agent_id: String },
}

/// JSON lifecycle events on stderr. Off unless `--json-output` is set.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    json_output: bool,
}

impl EventEmitter {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }

    pub fn emit(&self, event: &LifecycleEvent) {
        if !self.json_output {
            return;
        }

        let mut line = match serde_json::to_value(event) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => return,
        };
        line.insert(
            "ts".to_string(),
            serde_json::Value::String(Utc::now().to_rfc3339()),
        );

        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{}", serde_json::Value::Object(line));
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionStatus, EventEmitter, LifecycleEvent};

    #[test]
    fn lifecycle_events_serialize_tagged() {
        let event = LifecycleEvent::Startup {
            agent_id: "alpha".into(),
            relay_url: "wss://relay.example.dev".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "startup");
        assert_eq!(value["payload"]["agent_id"], "alpha");

        let event = LifecycleEvent::Connection {
            status: ConnectionStatus::Reconnected,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "connection");
        assert_eq!(value["payload"]["status"], "reconnected");
    }

    #[test]
    fn emit_disabled_is_noop() {
        let emitter = EventEmitter::new(false);
        emitter.emit(&LifecycleEvent::Shutdown {
            agent_id: "alpha".into(),
        });
    }

    #[test]
    fn emit_enabled_no_panic() {
        let emitter = EventEmitter::new(true);
        emitter.emit(&LifecycleEvent::Connection {
            status: ConnectionStatus::Connected,
        });
    }
}
