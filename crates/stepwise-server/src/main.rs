//! `stepwise` binary: `serve` and `check-config`

use anyhow::Context;
use clap::{value_parser, Arg, Command};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use stepwise_core::StepwiseConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Command::new("stepwise")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Bounded plan orchestrator")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Configuration file layered over config/stepwise.toml"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("serve").about("Run the HTTP server").arg(
                Arg::new("bind")
                    .long("bind")
                    .value_parser(value_parser!(SocketAddr))
                    .help("Listen address (overrides server.bind)"),
            ),
        )
        .subcommand(Command::new("check-config").about("Print the resolved configuration"));

    let matches = cli.get_matches();
    let config_path = matches.get_one::<PathBuf>("config");
    let cfg = StepwiseConfig::load(config_path.map(PathBuf::as_path))
        .context("loading configuration")?;

    match matches.subcommand() {
        Some(("serve", args)) => {
            stepwise_core::telemetry::init(&cfg.telemetry).context("installing subscriber")?;
            let bind = match args.get_one::<SocketAddr>("bind") {
                Some(addr) => *addr,
                None => cfg
                    .server
                    .bind
                    .parse()
                    .with_context(|| format!("invalid server.bind {:?}", cfg.server.bind))?,
            };
            serve(cfg, bind).await
        }
        Some(("check-config", _)) => {
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            Ok(())
        }
        _ => anyhow::bail!("unknown subcommand"),
    }
}

async fn serve(cfg: StepwiseConfig, bind: SocketAddr) -> anyhow::Result<()> {
    let state = stepwise_server::assemble(&cfg).await?;

    let sweeper = state.orchestrator.clone();
    let period = Duration::from_secs(cfg.temp.sweep_after_secs.max(1));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.tick().await;
        loop {
            tick.tick().await;
            let swept = sweeper.sweep_temp().await;
            let purged = sweeper.memory().purge_locks();
            if swept > 0 || purged > 0 {
                tracing::debug!(swept, purged, "expired artifacts and locks removed");
            }
        }
    });

    let orchestrator = state.orchestrator.clone();
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(%bind, "stepwise listening");
    axum::serve(listener, stepwise_server::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("server error")?;
    orchestrator.shutdown();
    Ok(())
}
