use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use calendar_offline::{
    calendar::EventBook,
    storage::{config::Config, mutation_store::MutationStore},
    sync::{
        gateway::MutationGateway,
        network::{HttpProbe, NetworkMonitor, spawn_probe_loop},
        remote_api::HttpEventApi,
        sync_engine::SyncEngine,
    },
};

mod cli;
use cli::{CliMode, USAGE, parse_cli_mode};

pub struct Services {
    pub config: Config,
    pub client: reqwest::Client,
    pub probe: Arc<HttpProbe>,
    pub engine: SyncEngine,
    pub gateway: MutationGateway,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging();

    let cli_mode = match parse_cli_mode() {
        Ok(mode) => mode,
        Err(err) => {
            eprintln!("Error: {}", err);
            println!("{}", USAGE);
            return Ok(());
        }
    };

    if cli_mode == CliMode::Help {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load_or_create().context("loading configuration")?;
    let services = build_services(config).await?;

    match cli_mode {
        CliMode::Status => cli::run_status_mode(&services).await,
        CliMode::Drain => cli::run_drain_mode(&services).await,
        CliMode::Agenda => cli::run_agenda_mode(&services).await,
        CliMode::InstallAssets => cli::run_install_assets_mode(&services).await,
        CliMode::Run | CliMode::Help => run_service(services).await,
    }
}

async fn build_services(config: Config) -> anyhow::Result<Services> {
    let client = reqwest::Client::builder()
        .timeout(config.remote.request_timeout())
        .build()
        .context("building HTTP client")?;

    let probe = Arc::new(HttpProbe::new(config.remote.base_url.clone(), client.clone()));
    let monitor = NetworkMonitor::from_probe(probe.as_ref()).await;

    let store = MutationStore::open(&config.storage.database_path).with_context(|| {
        format!(
            "opening mutation store at {}",
            config.storage.database_path.display()
        )
    })?;
    let api = Arc::new(HttpEventApi::with_client(
        config.remote.base_url.clone(),
        client.clone(),
    ));

    let engine = SyncEngine::new(store, api, monitor, EventBook::new());
    let gateway = MutationGateway::new(engine.clone());

    Ok(Services {
        config,
        client,
        probe,
        engine,
        gateway,
    })
}

async fn run_service(services: Services) -> anyhow::Result<()> {
    let Services {
        config,
        probe,
        engine,
        gateway,
        ..
    } = services;

    let pending = engine.store().len().await?;
    tracing::info!(
        "Sync service started against {} with {} pending change(s)",
        config.remote.base_url,
        pending
    );

    if engine.monitor().is_online() {
        if let Err(e) = engine.refresh_events().await {
            tracing::warn!("Initial event refresh failed: {}", e);
        }
        tracing::info!("{} event(s) loaded", gateway.book().len());
        engine.request_drain();
    }

    let prober = spawn_probe_loop(
        engine.monitor().clone(),
        probe,
        config.sync.probe_interval(),
    );
    let syncer = engine.spawn(config.sync.retry_interval());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    prober.abort();
    syncer.abort();
    tracing::info!("Sync service stopped");
    Ok(())
}

fn setup_logging() {
    let log_dir = Config::app_dir();

    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, "calendar-offline.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false)
        .init();

    std::mem::forget(_guard);

    tracing::info!("calendar-offline started");
}
