// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;
mod control_loop;
mod event_loop;
mod ipc;
mod workspace;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use swarm_conflict::{ConsensusExecutor, SessionManager};
use swarm_ledger::{Ledger, LedgerMonitor, NoGoZoneRegistry};
use swarm_merge::{DatabaseForker, Merger};
use swarm_spawn::AgentSpawner;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use control_loop::{ControlLoop, UnboundCanonicalDatabase, UnboundLlmDriver};
use event_loop::OrchestratorBus;
use ipc::IpcBridge;
use workspace::WorkspaceLayout;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry().with(filter).with(fmt::layer().with_target(false)).try_init();
}

/// Name of the `swarm-agent` worker binary, resolved relative to this
/// binary's own directory (both ship from the same build, §4.6).
fn agent_binary_path() -> PathBuf {
    let mut path = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("swarm-orchestrator"));
    path.set_file_name("swarm-agent");
    path
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    if let Some(cmd) = &cli.command {
        match cmd {
            Commands::Completions { shell } => {
                cli::print_completions(*shell);
                return Ok(());
            }
            Commands::ShowConfig => {
                let config = swarm_config::load(cli.config.as_deref())?;
                println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                return Ok(());
            }
        }
    }

    let config = swarm_config::load(cli.config.as_deref())?;

    let target_binary = cli.target_binary.clone().context("target_binary is required outside of subcommands")?;
    let binary_name = target_binary.file_name().and_then(|n| n.to_str()).unwrap_or("target").to_string();

    let workspace_root = cli.workspace.clone().unwrap_or_else(|| PathBuf::from(".swarm-workspace"));
    let layout = WorkspaceLayout::new(&workspace_root, &binary_name);

    // §6 persisted layout is wiped on startup except `lldb_config.json`,
    // generalized to whatever the resolved config's lldb section names
    // (SPEC_FULL.md §C.4).
    let preserve: Vec<String> = if config.lldb.enabled { vec!["lldb_config.json".to_string()] } else { vec![] };
    workspace::reset_workspace(&layout.root, &preserve)?;
    layout.ensure_dirs()?;

    let source_database = layout.root.join(format!("{binary_name}.db"));
    if !source_database.exists() {
        tokio::fs::write(&source_database, []).await.context("initializing empty program database")?;
    }

    let ledger = Ledger::open(&layout.ledger_path())?;
    let nogo = Arc::new(NoGoZoneRegistry::new());
    let session_mgr = Arc::new(SessionManager::new());
    let llm_driver: Arc<dyn swarm_core::ports::LlmDriver> = Arc::new(UnboundLlmDriver);
    let consensus = Arc::new(ConsensusExecutor::new(llm_driver.clone()));

    let bus_port = swarm_bus::allocate_port(&binary_name);
    let bus_server = swarm_bus::BusServer::bind(bus_port).await.context("binding chat-relay bus server")?;
    let bound_port = bus_server.port();
    tokio::spawn(bus_server.run());
    info!(port = bound_port, "chat-relay bus listening");

    let spawner = AgentSpawner::new(agent_binary_path(), layout.root.clone());

    let (mut orchestrator_bus, pending_results) = OrchestratorBus::connect(
        bound_port,
        session_mgr.clone(),
        nogo.clone(),
        ledger.clone(),
        consensus.clone(),
        spawner.clone(),
    )
    .await
    .context("connecting orchestrator to its own bus")?;
    orchestrator_bus.subscribe().await.context("subscribing orchestrator bus channels")?;
    tokio::spawn(orchestrator_bus.run());

    // §4.3 broadcast protocol: watch every TOOL_CALL row for the two
    // injection-lifecycle tool names and re-publish the no-go zone they
    // staked out to `#agents`, over a dedicated connection so this never
    // competes with the main orchestrator bus task for the socket.
    let (monitor, mut ledger_events) = LedgerMonitor::start(ledger.clone());
    tokio::spawn(async move {
        let mut broadcaster = match swarm_bus::BusClient::connect(bound_port, "nogo_broadcaster").await {
            Ok(bus) => bus,
            Err(e) => {
                tracing::warn!(error = %e, "no-go broadcaster failed to connect to bus, zones will not be relayed");
                return;
            }
        };
        while let Some(call) = ledger_events.recv().await {
            tracing::debug!(id = call.id, tool = %call.tool_name, agent = %call.agent_id, "observed ledger row");

            let zone_type = match call.tool_name.as_str() {
                "allocate_code_workspace" => Some(swarm_core::NoGoZoneType::TempSegment),
                "finalize_code_injection" => Some(swarm_core::NoGoZoneType::CodeCave),
                _ => None,
            };
            let Some(zone_type) = zone_type else { continue };
            let Some(end) = call.parameters.get("end").and_then(serde_json::Value::as_u64) else { continue };

            let zone = swarm_core::NoGoZone::new(call.address, end, call.agent_id.clone(), zone_type);
            let wire = swarm_ledger::serialize_zone(&zone);
            if let Err(e) = broadcaster.send_message("#agents", &wire).await {
                tracing::warn!(error = %e, "failed to broadcast no-go zone");
            }
        }
    });

    let forker = Arc::new(DatabaseForker::new(layout.agents_dir()));
    let canonical_db: Arc<dyn swarm_core::ports::ProgramDatabase> = Arc::new(UnboundCanonicalDatabase);
    let merger = Arc::new(Merger::new(ledger.clone(), canonical_db));

    let mut control = ControlLoop::new(
        llm_driver,
        spawner,
        forker,
        merger,
        ledger.clone(),
        pending_results,
        source_database,
        target_binary,
        bound_port,
        layout.ledger_path(),
    );

    if cli.ipc {
        let session_dir = cli.session_dir.clone().unwrap_or_else(|| layout.root.clone());
        let bridge = IpcBridge::new(session_dir);
        bridge
            .run(|request| {
                let control = &mut control;
                async move {
                    match request.method.as_str() {
                        "start_task" | "process_input" => {
                            let task = request.params.get("task").and_then(serde_json::Value::as_str).unwrap_or_default();
                            let report = control.run_task(task).await?;
                            Ok(serde_json::json!({"report": report}))
                        }
                        other => Err(swarm_core::SwarmError::ExternalDriverClosed(format!("unknown IPC method `{other}`"))),
                    }
                }
            })
            .await
            .context("running external IPC bridge")?;
        info!("Shutdown complete");
    } else if let Some(task) = cli.task.clone() {
        let report = control.run_task(&task).await?;
        println!("{report}");
    } else {
        warn!("no task provided and --ipc not set; nothing to do");
    }

    monitor.stop();
    Ok(())
}
