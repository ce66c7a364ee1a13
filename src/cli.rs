// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

/// Drives a multi-agent reverse-engineering swarm against one target binary.
#[derive(Parser, Debug)]
#[command(name = "swarm-orchestrator", version, about)]
pub struct Cli {
    /// Path to the binary the swarm will analyze.
    pub target_binary: Option<PathBuf>,

    /// The user task to hand to the control loop (e.g. "find the parser
    /// entry point"). Omit when driving the orchestrator over `--ipc`.
    pub task: Option<String>,

    /// Explicit config file path (highest priority layer, §6).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Drive the orchestrator via the external IPC bridge (C10) instead of
    /// running `task` directly and exiting.
    #[arg(long)]
    pub ipc: bool,

    /// Directory containing (or to contain) `request.pipe`/`response.pipe`
    /// for `--ipc` mode. Defaults to the workspace directory.
    #[arg(long)]
    pub session_dir: Option<PathBuf>,

    /// Root directory for per-binary workspaces (ledger, agent forks,
    /// configs). Defaults to `.swarm-workspace` in the current directory.
    #[arg(long)]
    pub workspace: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print shell completions and exit.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
    /// Print the resolved configuration as YAML and exit.
    ShowConfig,
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}
