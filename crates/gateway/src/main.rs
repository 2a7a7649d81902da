use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rl_domain::config::{Config, ConfigSeverity};
use rl_gateway::cli::{Cli, Command, ConfigCommand};
use rl_gateway::{api, bootstrap};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = rl_gateway::cli::load_config(cli.config.as_ref())?;

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(cmd)) => match cmd {
            ConfigCommand::Validate => {
                let issues = config.validate();
                for issue in &issues {
                    eprintln!("{issue}");
                }
                if issues
                    .iter()
                    .any(|i| i.severity == ConfigSeverity::Error)
                {
                    std::process::exit(1);
                }
                println!("config ok");
                Ok(())
            }
            ConfigCommand::Show => {
                println!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
        },
        Some(Command::Version) => {
            println!("runloom {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the server process.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,rl_engine=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!(mode = ?config.mode, "RunLoom starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Engine stack ─────────────────────────────────────────────────
    let state = bootstrap::build(config.clone()).await?;

    // ── HTTP surface ─────────────────────────────────────────────────
    let app = api::router()
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state);

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Durable state makes the next boot resume cleanly.
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
