//! Command-line entry points for the two deployment roles plus one-shot
//! maintenance commands.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use crate::acme::CertbotClient;
use crate::cache::{CertCache, RedisCertCache};
use crate::config::Config;
use crate::error::{CertError, Result};
use crate::events::{EventSink, KafkaEventSink, trigger};
use crate::orchestrator::CertificateManager;
use crate::repository::{CertificateRepository, MySqlCertificateRepository};
use crate::scheduler::Scheduler;
use crate::server::{AppState, start_server};
use crate::types::CertStore;

#[derive(Parser)]
#[command(name = "certpool", version, about = "TLS certificate lifecycle manager")]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "certpool.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Serve the HTTP API (producer role)
    Api {
        /// Listen address; overrides the configuration file
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Consume bus events (worker role)
    Worker,
    /// Run the pool importer once and exit
    Refresh {
        /// Store to import: websites or apis
        #[arg(long)]
        store: String,
    },
    /// Run the days-remaining sweep and auto-renewal once and exit
    Renew,
}

/// Everything the roles share, wired once.
struct Wiring {
    manager: CertificateManager,
    sink: Arc<KafkaEventSink>,
    repo: Arc<MySqlCertificateRepository>,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Api { listen } => run_api(config, listen).await,
        Command::Worker => run_worker(config).await,
        Command::Refresh { store } => run_refresh(config, &store).await,
        Command::Renew => run_renew(config).await,
    }
}

fn load_config(path: &PathBuf) -> Result<Config> {
    let mut config = if path.exists() {
        Config::from_file(path)?
    } else {
        tracing::info!(
            "Config file {} not found, using defaults plus environment",
            path.display()
        );
        Config::default()
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

async fn wire(config: &Config) -> Result<Wiring> {
    let repo = Arc::new(
        MySqlCertificateRepository::connect(&config.mysql_url(), config.mysql.max_connections)
            .await?,
    );
    let cache: Arc<dyn CertCache> = Arc::new(RedisCertCache::new(
        &config.redis_url(),
        config.redis.list_ttl_secs,
        config.redis.detail_ttl_secs,
    )?);
    let sink = Arc::new(KafkaEventSink::new(
        &config.kafka.bootstrap_servers,
        &config.kafka.event_topic,
    )?);
    if let Err(e) = sink.ensure_topic(&config.kafka.bootstrap_servers).await {
        tracing::warn!("Could not ensure event topic, relying on broker auto-create: {e}");
    }
    let issuer = Arc::new(CertbotClient::new(
        &config.certs.acme_challenge_dir,
        &config.certs.certs_dir,
        config.cert_max_wait(),
    )?);

    let repo_dyn: Arc<dyn CertificateRepository> = repo.clone();
    let sink_dyn: Arc<dyn EventSink> = sink.clone();
    let manager = CertificateManager::new(
        repo_dyn,
        cache,
        sink_dyn,
        issuer,
        &config.certs.certs_dir,
    );

    Ok(Wiring {
        manager,
        sink,
        repo,
    })
}

fn spawn_ctrl_c(tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = tx.send(true);
        }
    });
}

async fn run_api(config: Config, listen: Option<SocketAddr>) -> Result<()> {
    let wiring = wire(&config).await?;
    let addr = match listen {
        Some(addr) => addr,
        None => config
            .server
            .listen_addr
            .parse()
            .map_err(|e| CertError::configuration(format!("Bad listen_addr: {e}")))?,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_ctrl_c(shutdown_tx);

    if config.certs.read_on_startup {
        for store in [CertStore::Websites, CertStore::Apis] {
            match wiring.manager.import_store(store, trigger::STARTUP).await {
                Ok(report) => tracing::info!(
                    "Startup import: store={store}, processed={}, failed={}",
                    report.processed,
                    report.failed
                ),
                Err(e) => tracing::error!("Startup import failed: store={store}, error={e}"),
            }
        }
    }

    let scheduler = if config.schedule.enabled {
        Some(Scheduler::start(
            wiring.manager.clone(),
            &config.schedule,
            shutdown_rx.clone(),
        )?)
    } else {
        tracing::info!("Scheduler disabled");
        None
    };

    let state = AppState {
        manager: wiring.manager.clone(),
        challenge_dir: config.certs.acme_challenge_dir.clone().into(),
    };
    start_server(addr, state, shutdown_rx).await?;

    // Shutdown order: scheduler, producer buffers, then connections.
    if let Some(scheduler) = scheduler {
        scheduler.join().await;
    }
    if let Err(e) = wiring.sink.flush(std::time::Duration::from_secs(5)) {
        tracing::warn!("Producer flush on shutdown failed: {e}");
    }
    wiring.repo.close().await;
    tracing::info!("API role stopped");
    Ok(())
}

async fn run_worker(config: Config) -> Result<()> {
    let wiring = wire(&config).await?;
    let consumer = crate::events::KafkaEventConsumer::new(&config.kafka)?;
    let router = crate::worker::build_router(wiring.manager.clone());
    tracing::info!("Worker role starting with {} event routes", router.len());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_ctrl_c(shutdown_tx);

    consumer.run(&router, shutdown_rx).await;

    if let Err(e) = wiring.sink.flush(std::time::Duration::from_secs(5)) {
        tracing::warn!("Producer flush on shutdown failed: {e}");
    }
    wiring.repo.close().await;
    tracing::info!("Worker role stopped");
    Ok(())
}

async fn run_refresh(config: Config, store: &str) -> Result<()> {
    let wiring = wire(&config).await?;
    let store: CertStore = store.parse()?;
    let report = wiring.manager.import_store(store, trigger::MANUAL).await?;
    println!(
        "{} (processed: {}, failed: {})",
        report.message, report.processed, report.failed
    );
    wiring.repo.close().await;
    Ok(())
}

async fn run_renew(config: Config) -> Result<()> {
    let wiring = wire(&config).await?;
    let report = wiring.manager.renew_expiring().await?;
    println!(
        "Updated {}/{} certificates; renewed {}, failed {}, skipped {}",
        report.updated, report.total, report.renewed, report.failed, report.skipped
    );
    if let Err(e) = wiring.sink.flush(std::time::Duration::from_secs(5)) {
        tracing::warn!("Producer flush failed: {e}");
    }
    wiring.repo.close().await;
    Ok(())
}
