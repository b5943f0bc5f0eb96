mod api;
mod config;
mod db;
mod dispatcher;
mod error;
mod models;
mod scraper;
mod status;

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::AppConfig;
use crate::db::Database;
use crate::dispatcher::Dispatcher;
use crate::scraper::qbittorrent::SessionClient;
use crate::scraper::rss::HttpFeedSource;
use crate::scraper::tracker::Controller;

/// Watch RSS feeds and send matching torrents to qBittorrent, once each
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Config file; defaults to $RSS_DISPATCH_CONFIG, then ./config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Poll every feed once and exit
    #[arg(long)]
    once: bool,

    /// Control surface address, overrides [control].bind
    #[arg(long)]
    bind: Option<String>,
}

fn init_tracing(log_file: Option<&str>) -> anyhow::Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(file_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = args
        .config
        .or_else(|| std::env::var_os("RSS_DISPATCH_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    let config = AppConfig::load(&config_path)?;

    init_tracing(config.log_file.as_deref())?;
    tracing::info!("Loaded config from {}", config_path.display());
    tracing::debug!("{:?}", config.client);

    let db = Database::open(&config.database_path)?;
    tracing::info!("Dispatch history at {}", config.database_path);

    let client = Arc::new(SessionClient::new(&config.client).context("Failed to build qBittorrent client")?);
    let source = Arc::new(
        HttpFeedSource::new(Duration::from_secs(config.feed_timeout_secs))
            .context("Failed to build feed client")?,
    );

    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::new(Arc::new(db.clone()), client.clone());
    let controller = Arc::new(
        Controller::new(config.feeds.clone(), source, dispatcher, db, cancel.clone())
            .with_retention_days(config.history_retention_days),
    );
    controller.load_rules(&config.rules).await?;

    match client.app_version().await {
        Ok(version) => tracing::info!("Connected to qBittorrent {} at {}", version, client.base_url()),
        Err(e) => tracing::warn!("qBittorrent at {} not reachable yet: {}", client.base_url(), e),
    }

    if args.once {
        let reports = controller.run_once().await;
        for (feed, report) in reports {
            match report {
                Some(report) => tracing::info!(
                    feed = %feed,
                    items = report.items,
                    dispatched = report.dispatched,
                    skipped = report.skipped,
                    rejected = report.rejected,
                    "Done"
                ),
                None => tracing::warn!(feed = %feed, "Feed did not complete"),
            }
        }
        return Ok(());
    }

    let tasks = controller.spawn();

    let server = if config.control.enabled {
        let bind = args.bind.unwrap_or(config.control.bind);
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("Failed to bind control surface on {}", bind))?;
        tracing::info!("Control surface listening on {}", bind);

        let app = api::router(api::AppState {
            controller: controller.clone(),
            client: client.clone(),
        });
        let shutdown = cancel.clone();
        Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down, waiting for in-flight dispatches");
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("Task ended abnormally: {}", e);
        }
    }
    controller.drain().await;

    if let Some(server) = server {
        server.await?.context("Control surface failed")?;
    }

    tracing::info!("Stopped");
    Ok(())
}
