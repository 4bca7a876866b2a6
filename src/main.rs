use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use config::Config;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{error, info};

use zaplink_core::channels::ChannelCatalog;
use zaplink_core::epg::EpgStore;
use zaplink_core::hls::HlsManager;
use zaplink_core::scan::ScanDriver;
use zaplink_core::tuner::TunerPool;
use zaplink_core::{create_app, AppState};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

#[derive(Debug, Deserialize)]
struct Settings {
    server: ServerConfig,
    tuners: TunerConfig,
    channels: ChannelsConfig,
    hls: HlsConfig,
    epg: EpgConfig,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    host: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct TunerConfig {
    #[serde(default = "default_device_root")]
    device_root: PathBuf,
    #[serde(default = "default_capture_program")]
    capture_program: String,
}

fn default_device_root() -> PathBuf {
    PathBuf::from("/dev/dvb")
}

fn default_capture_program() -> String {
    "dvbv5-zap".to_string()
}

#[derive(Debug, Deserialize)]
struct ChannelsConfig {
    conf_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct HlsConfig {
    #[serde(default = "default_hls_root")]
    root: PathBuf,
    #[serde(default = "default_housekeeping_interval_secs")]
    housekeeping_interval_secs: u64,
}

fn default_hls_root() -> PathBuf {
    PathBuf::from("/tmp/zaplink_hls")
}

fn default_housekeeping_interval_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
struct EpgConfig {
    #[serde(default = "default_epg_db_path")]
    db_path: PathBuf,
    #[serde(default)]
    scan_enabled: bool,
}

fn default_epg_db_path() -> PathBuf {
    PathBuf::from("zaplink_epg.sqlite3")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // A client disconnecting mid-stream must not bring the process down
    // (spec §7's broken-pipe discipline).
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let args = Args::parse();

    let settings = Config::builder()
        .add_source(config::File::with_name(&args.config))
        .build()?;
    let settings: Settings = settings.try_deserialize()?;

    info!(config = %args.config, "configuration loaded");

    let descriptors = TunerPool::discover(&settings.tuners.device_root)?;
    if descriptors.is_empty() {
        error!(device_root = %settings.tuners.device_root.display(), "no tuner adapters found");
    }
    info!(tuners = descriptors.len(), "discovered tuner adapters");
    let pool = TunerPool::new(descriptors);

    let catalog = Arc::new(ChannelCatalog::load(&settings.channels.conf_path).await?);
    info!(channels = catalog.all().len(), "loaded channel catalog");

    let hls = HlsManager::new(
        settings.hls.root.clone(),
        pool.clone(),
        settings.tuners.capture_program.clone(),
        settings.channels.conf_path.clone(),
    )?;

    let epg = EpgStore::open(settings.epg.db_path.clone()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if settings.epg.scan_enabled {
        let scan_driver = ScanDriver::new(
            pool.clone(),
            epg.clone(),
            catalog.clone(),
            settings.channels.conf_path.clone(),
            settings.tuners.capture_program.clone(),
        );
        let scan_shutdown = shutdown_rx.clone();
        tokio::spawn(scan_driver.run(scan_shutdown));
    } else {
        info!("guide scanning disabled by configuration");
    }

    let housekeeping_interval = std::time::Duration::from_secs(settings.hls.housekeeping_interval_secs);
    tokio::spawn(hls.clone().run_housekeeping(housekeeping_interval));

    let state = Arc::new(AppState {
        catalog,
        pool,
        hls: hls.clone(),
        epg,
        channels_conf_path: settings.channels.conf_path,
        capture_program: settings.tuners.capture_program,
    });

    let app = create_app(state);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    hls.shutdown().await;
    Ok(())
}
