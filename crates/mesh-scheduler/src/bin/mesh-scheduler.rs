//! mesh-scheduler binary

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use mesh_core::{HeadroomStrategy, ObservabilityConfig, SchedulerConfig, TrainerClient};
use mesh_predict::{HttpForecaster, HttpTrainerClient, SampleUploader, TrainerWatcher, UploadBuffer};
use mesh_scheduler::{server, AppState, Scheduler};
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn cli() -> Command {
    Command::new("mesh-scheduler")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Predictive SLO-aware request scheduler")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("HTTP bind address (ip:port)"),
        )
        .arg(
            Arg::new("forecaster")
                .short('f')
                .long("forecaster")
                .value_name("URL")
                .help("Forecaster endpoint, may be repeated")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("trainer")
                .short('t')
                .long("trainer")
                .value_name("URL")
                .help("Training service base URL"),
        )
        .arg(
            Arg::new("strategy")
                .long("strategy")
                .value_name("STRATEGY")
                .help("Headroom selection strategy")
                .value_parser(["least", "most"]),
        )
        .arg(
            Arg::new("no-metrics")
                .long("no-metrics")
                .help("Disable the /metrics endpoint")
                .action(ArgAction::SetTrue),
        )
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();

    let config = match build_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            process::exit(1);
        }
    };

    init_tracing(&config.observability);

    if let Err(e) = run(config).await {
        error!("mesh-scheduler failed: {:#}", e);
        process::exit(1);
    }

    info!("mesh-scheduler shutdown complete");
}

fn init_tracing(observability: &ObservabilityConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "mesh_scheduler={level},mesh_predict={level},tower_http=debug",
            level = observability.log_level
        )
        .into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if observability.log_format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Build configuration from the config file, environment and command line
fn build_config(matches: &ArgMatches) -> Result<SchedulerConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => SchedulerConfig::load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => SchedulerConfig::load().context("Failed to load configuration")?,
    };

    if let Some(bind) = matches.get_one::<String>("bind") {
        let addr: SocketAddr = bind
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", bind))?;
        config.server.bind_ip = addr.ip();
        config.server.port = addr.port();
    }

    if let Some(endpoints) = matches.get_many::<String>("forecaster") {
        config.forecast.endpoints = endpoints.cloned().collect();
    }

    if let Some(trainer) = matches.get_one::<String>("trainer") {
        config.trainer.url = trainer.clone();
    }

    if let Some(strategy) = matches.get_one::<String>("strategy") {
        config.headroom.strategy = strategy
            .parse::<HeadroomStrategy>()
            .map_err(anyhow::Error::msg)?;
    }

    if matches.get_flag("no-metrics") {
        config.observability.metrics_enabled = false;
    }

    config
        .validate()
        .context("Configuration validation failed")?;
    Ok(config)
}

async fn run(config: SchedulerConfig) -> Result<()> {
    info!("Starting mesh-scheduler with configuration:");
    info!("  Bind address: {}", config.server.bind_addr());
    info!("  Forecasters: {:?}", config.forecast.endpoints);
    info!("  Trainer: {}", config.trainer.url);
    info!("  Headroom strategy: {}", config.headroom.strategy);
    info!("  TPOT stride: {}", config.samples.tpot_stride);

    let bind_addr = config.server.bind_addr();
    let forecaster = Arc::new(HttpForecaster::new(&config.forecast)?);
    let trainer: Arc<dyn TrainerClient> = Arc::new(HttpTrainerClient::new(&config.trainer)?);
    let buffer = Arc::new(UploadBuffer::new(config.samples.buffer_capacity));

    let uploader = Arc::new(SampleUploader::new(
        buffer.clone(),
        trainer.clone(),
        config.samples.clone(),
    ));
    let watcher = Arc::new(TrainerWatcher::new(trainer, &config.trainer));
    let scheduler = Arc::new(Scheduler::new(config, forecaster, buffer)?);

    if !scheduler.forecaster_ready().await {
        warn!("Forecaster is not ready yet; predictive requests will fall back to the baseline profile");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = vec![
        uploader.clone().spawn(shutdown_rx.clone()),
        watcher.clone().spawn(shutdown_rx.clone()),
        scheduler.clone().spawn_cleanup(shutdown_rx.clone()),
    ];

    let state = AppState::new(scheduler)
        .with_uploader_stats(uploader.stats())
        .with_watcher(watcher);

    let mut server_shutdown = shutdown_rx;
    let served = server::serve(state, bind_addr, async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Received shutdown signal");
            }
            _ = server_shutdown.changed() => {}
        }
    })
    .await;

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    served.context("HTTP server failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "samples:\n  tpot_stride: 50").unwrap();
        file
    }

    #[test]
    fn test_overrides_applied() {
        let file = config_file();
        let path = file.path().to_str().unwrap();
        let matches = cli().get_matches_from(vec![
            "mesh-scheduler",
            "--config",
            path,
            "--bind",
            "127.0.0.1:9100",
            "--forecaster",
            "http://f1:8000",
            "--forecaster",
            "http://f2:8000",
            "--strategy",
            "most",
            "--no-metrics",
        ]);

        let config = build_config(&matches).unwrap();
        assert_eq!(config.samples.tpot_stride, 50);
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.forecast.endpoints, vec!["http://f1:8000", "http://f2:8000"]);
        assert_eq!(config.headroom.strategy, HeadroomStrategy::Most);
        assert!(!config.observability.metrics_enabled);
    }

    #[test]
    fn test_invalid_bind_rejected() {
        let file = config_file();
        let path = file.path().to_str().unwrap();
        let matches =
            cli().get_matches_from(vec!["mesh-scheduler", "--config", path, "--bind", "nowhere"]);
        assert!(build_config(&matches).is_err());
    }

    #[test]
    fn test_invalid_strategy_rejected_at_parse() {
        let result = cli().try_get_matches_from(vec!["mesh-scheduler", "--strategy", "random"]);
        assert!(result.is_err());
    }
}
