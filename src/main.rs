use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;

use agent_bridge::{
    adapter::CommandAdapter,
    config::Config,
    events::{self, EventEmitter, LifecycleEvent},
    orchestrator::{Orchestrator, OrchestratorEvent},
    relay_ws::{BridgeWsClient, WsControl},
    transfer::{self, NullSenderFactory},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();
    events::init_logging(&cfg)?;
    let emitter = EventEmitter::new(cfg.json_output);
    let agent_id = cfg.resolved_agent_id();
    let orch_config = cfg.orchestrator_config();

    // A previous process that died uncleanly may have left transfer bytes
    // behind; they are unreachable now.
    transfer::sweep_disk(&orch_config.transfer.cache_dir).await;

    let adapter = CommandAdapter::new(cfg.command.clone(), cfg.args.clone());
    let (outbound_tx, outbound_rx) = mpsc::channel(256);
    let (orchestrator, events_tx) =
        Orchestrator::new(orch_config, adapter, NullSenderFactory, outbound_tx);

    let ws = BridgeWsClient::new(cfg.relay_url.clone(), cfg.token.clone(), agent_id.clone());
    let (control_tx, control_rx) = mpsc::channel(4);

    emitter.emit(&LifecycleEvent::Startup {
        agent_id: agent_id.clone(),
        relay_url: cfg.relay_url.clone(),
    });
    tracing::info!(
        target = "agent_bridge::main",
        agent = %agent_id,
        relay = %cfg.relay_url,
        command = %cfg.command,
        "bridge starting"
    );

    let ws_events = events_tx.clone();
    let ws_emitter = emitter.clone();
    let ws_task = tokio::spawn(async move {
        ws.run(ws_emitter, ws_events, outbound_rx, control_rx).await;
    });
    let orchestrator_task = tokio::spawn(orchestrator.run());

    tokio::signal::ctrl_c().await?;
    tracing::info!(target = "agent_bridge::main", "shutdown signal received");

    let _ = control_tx.send(WsControl::Shutdown).await;
    let _ = events_tx.send(OrchestratorEvent::Shutdown).await;
    let _ = orchestrator_task.await;
    ws_task.abort();

    emitter.emit(&LifecycleEvent::Shutdown { agent_id });
    Ok(())
}
