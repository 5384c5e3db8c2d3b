// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // reqwest's rustls-tls backend panics at first TLS handshake if more than
    // one crypto provider is linked in and none was installed as default;
    // pin it explicitly rather than rely on whichever gets linked last.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let config = gate_config::load(cli.config.as_deref())?;
            gate_server::serve(config).await
        }
        Commands::ShowConfig => {
            let config = gate_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
        Commands::ListModels { json } => list_models_cmd(cli.config.as_deref(), json),
        Commands::Completions { shell } => {
            cli::print_completions(shell);
            Ok(())
        }
    }
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}

/// Lists every model id [`gate_model::ModelResolver::available_models`]
/// would surface, i.e. exactly what `GET /v1/models` returns — built from
/// the same config layers the running gateway would load.
fn list_models_cmd(config_path: Option<&std::path::Path>, as_json: bool) -> anyhow::Result<()> {
    let config = gate_config::load(config_path)?;

    let resolver_config = gate_model::ResolverConfig {
        aliases: config.model.aliases.clone(),
        hidden_models: config.model.hidden_models.clone(),
        hidden_from_list: config.model.hidden_from_list.iter().cloned().collect(),
    };
    let resolver = gate_model::ModelResolver::new(resolver_config, gate_model::ModelCache::fallback());

    let mut ids = resolver.available_models();
    ids.sort();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&ids)?);
        return Ok(());
    }

    if ids.is_empty() {
        println!("No models found.");
        return Ok(());
    }

    let id_w = ids.iter().map(|i| i.len()).max().unwrap_or(10).max(10);
    println!("{:<id_w$}  CONTEXT WINDOW", "ID", id_w = id_w);
    println!("{}", "-".repeat(id_w + 20));
    for id in &ids {
        let ctx = gate_model::max_input_tokens(id, 0);
        let ctx = if ctx == 0 { "-".to_string() } else { ctx.to_string() };
        println!("{:<id_w$}  {}", id, ctx, id_w = id_w);
    }
    println!("\nTotal: {} model(s)", ids.len());
    Ok(())
}
