// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

#[derive(Parser, Debug)]
#[command(
    name = "llmgate",
    about = "An API-compatibility gateway exposing OpenAI and Anthropic dialects over a single upstream provider",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to config file (overrides auto-discovery)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway HTTP server (default when no subcommand is given).
    Serve,

    /// Print the effective configuration (all layers merged, env applied) and exit.
    ShowConfig,

    /// List models the gateway will resolve requests against.
    ///
    /// Shows the built-in catalog plus any `model.aliases` / `model.hidden_models`
    /// configured, i.e. exactly what `GET /v1/models` would return.
    ListModels {
        /// Output as JSON instead of a formatted table.
        #[arg(long)]
        json: bool,
    },

    /// Generate a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "llmgate", &mut std::io::stdout());
}
