// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! C6: spawns agent worker processes, tracks their liveness, and can
//! terminate or resurrect one (§4.6).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use swarm_core::{AgentInfo, SwarmError};
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{info, warn};

struct Tracked {
    info: AgentInfo,
    config_path: PathBuf,
    child: Child,
}

/// Spawns and supervises the OS processes behind each agent. One instance
/// lives for the lifetime of the orchestrator.
pub struct AgentSpawner {
    agent_binary: PathBuf,
    workspace_dir: PathBuf,
    next_id: AtomicU64,
    tracked: Mutex<HashMap<String, Tracked>>,
}

impl AgentSpawner {
    pub fn new(agent_binary: impl Into<PathBuf>, workspace_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            agent_binary: agent_binary.into(),
            workspace_dir: workspace_dir.into(),
            next_id: AtomicU64::new(1),
            tracked: Mutex::new(HashMap::new()),
        })
    }

    fn allocate_agent_id(&self) -> String {
        format!("agent_{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Reserve the next `agent_<N>` id without launching anything. Callers
    /// that need to fork a per-agent database (C5) before the process
    /// exists — the fork directory is named after the agent id — call this
    /// first and then `spawn_agent_with_id`.
    pub fn reserve_agent_id(&self) -> String {
        self.allocate_agent_id()
    }

    /// Write the per-agent config file and launch its worker process.
    /// `extra` is merged into the config object (bus port, model settings,
    /// whatever the caller's `swarm-agent` binary expects beyond the
    /// baseline fields).
    pub async fn spawn_agent(
        &self,
        task: &str,
        database_path: &Path,
        binary_path: &Path,
        extra: serde_json::Value,
    ) -> Result<AgentInfo, SwarmError> {
        let agent_id = self.allocate_agent_id();
        self.spawn_agent_with_id(&agent_id, task, database_path, binary_path, extra).await
    }

    /// Same as `spawn_agent` but under a caller-supplied id, for callers
    /// that already reserved one via `reserve_agent_id` to fork a database
    /// directory ahead of the launch (§4.5, §4.6).
    pub async fn spawn_agent_with_id(
        &self,
        agent_id: &str,
        task: &str,
        database_path: &Path,
        binary_path: &Path,
        extra: serde_json::Value,
    ) -> Result<AgentInfo, SwarmError> {
        let agent_id = agent_id.to_string();
        let configs_dir = self.workspace_dir.join("configs");
        tokio::fs::create_dir_all(&configs_dir)
            .await
            .map_err(|e| SwarmError::Collaborator(format!("create configs dir for {agent_id}: {e}")))?;

        let mut config = json!({
            "agent_id": agent_id,
            "task": task,
            "database_path": database_path,
            "binary_path": binary_path,
        });
        if let (Some(obj), serde_json::Value::Object(extra_obj)) = (config.as_object_mut(), &extra) {
            for (k, v) in extra_obj {
                obj.insert(k.clone(), v.clone());
            }
        }

        let config_path = configs_dir.join(format!("{agent_id}_config.json"));
        tokio::fs::write(&config_path, serde_json::to_vec_pretty(&config).unwrap())
            .await
            .map_err(|e| SwarmError::Collaborator(format!("write config for {agent_id}: {e}")))?;

        let child = self.launch(&config_path)?;
        let process_id = child.id().unwrap_or(0) as i32;

        let mut info = AgentInfo::new(agent_id.clone(), task.to_string());
        info.database_path = database_path.to_string_lossy().to_string();
        info.binary_path = binary_path.to_string_lossy().to_string();
        info.process_id = process_id;

        info!(agent_id, process_id, "spawned agent process");
        self.tracked.lock().await.insert(agent_id.clone(), Tracked { info: info.clone(), config_path, child });
        Ok(info)
    }

    fn launch(&self, config_path: &Path) -> Result<Child, SwarmError> {
        tokio::process::Command::new(&self.agent_binary)
            .arg("--config")
            .arg(config_path)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SwarmError::Collaborator(format!("failed to launch agent process: {e}")))
    }

    /// Poll whether the agent's process is still alive. A process that has
    /// already been reaped (via `try_wait`) counts as not running.
    pub async fn is_agent_running(&self, agent_id: &str) -> bool {
        let mut tracked = self.tracked.lock().await;
        match tracked.get_mut(agent_id) {
            Some(t) => matches!(t.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn agent_info(&self, agent_id: &str) -> Option<AgentInfo> {
        self.tracked.lock().await.get(agent_id).map(|t| t.info.clone())
    }

    /// Send a kill signal and drop the tracked entry. Idempotent: a second
    /// call on an already-gone agent is a no-op, not an error.
    pub async fn terminate_agent(&self, agent_id: &str) -> Result<(), SwarmError> {
        let mut tracked = self.tracked.lock().await;
        if let Some(mut t) = tracked.remove(agent_id) {
            if let Err(e) = t.child.kill().await {
                warn!(agent_id, error = %e, "failed to kill agent process");
            }
        }
        Ok(())
    }

    /// Relaunch an agent from its existing config file under a fresh OS
    /// process while keeping the same agent id (§4.6 "resurrect" — used
    /// when a worker dies mid-task and the orchestrator wants to retry
    /// without losing its ledger history or conflict-channel identity).
    pub async fn resurrect_agent(&self, agent_id: &str) -> Result<AgentInfo, SwarmError> {
        let config_path = {
            let tracked = self.tracked.lock().await;
            tracked.get(agent_id).map(|t| t.config_path.clone()).ok_or_else(|| SwarmError::Collaborator(format!("no tracked config for {agent_id}")))?
        };

        let child = self.launch(&config_path)?;
        let process_id = child.id().unwrap_or(0) as i32;

        let mut tracked = self.tracked.lock().await;
        let t = tracked.get_mut(agent_id).expect("checked above");
        t.child = child;
        t.info.process_id = process_id;
        info!(agent_id, process_id, "resurrected agent process");
        Ok(t.info.clone())
    }
}
