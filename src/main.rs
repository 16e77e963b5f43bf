use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use linkbox::cli::{
    Cli, Commands, ResourceCommands, TelemetryCommands, UserCommands, command_label,
};
use linkbox::commands::{run_migrate, run_resources_add, run_search, run_users_create};
use linkbox::config::{load_profiles, resolve_runtime_config};
use linkbox::error::{categorize_error, format_cli_error};
use linkbox::model::NewResource;
use linkbox::server::run_server;
use linkbox::telemetry::{TelemetrySink, round_metric, run_telemetry_report};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let show_sensitive_config = cli.show_sensitive_config;
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err, show_sensitive_config));
        tracing::error!(category = %categorize_error(&err).code(), "command failed");
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_filter).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;
    let telemetry = TelemetrySink::new(&cfg, command_label(&cli.command));
    let started_at = Instant::now();

    let result = match cli.command {
        Commands::Serve { host, port } => run_server(cfg.clone(), host, port, &telemetry).await,
        Commands::Migrate => run_migrate(&cfg).await,
        Commands::Users { command } => match command {
            UserCommands::Create { username } => run_users_create(&cfg, &username).await,
        },
        Commands::Resources { command } => match command {
            ResourceCommands::Add {
                user_id,
                url,
                title,
                digest,
                tags,
            } => {
                run_resources_add(
                    &cfg,
                    user_id,
                    NewResource {
                        url,
                        title,
                        digest,
                        tags,
                    },
                )
                .await
            }
        },
        Commands::Search { user_id, query } => {
            run_search(&cfg, user_id, &query.join(" "), &telemetry).await
        }
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { path, limit } => run_telemetry_report(&cfg, path, limit),
        },
    };

    let latency_ms = round_metric(started_at.elapsed().as_secs_f64() * 1000.0);
    match &result {
        Ok(()) => telemetry.emit("command.completed", json!({ "latency_ms": latency_ms })),
        Err(err) => telemetry.emit(
            "command.failed",
            json!({
                "latency_ms": latency_ms,
                "category": categorize_error(err).code()
            }),
        ),
    }

    result
}
