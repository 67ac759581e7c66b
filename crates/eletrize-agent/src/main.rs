//! Eletrize Agent - headless dashboard session
//!
//! Runs the sync engine without a webview: loads the configuration, keeps
//! device state in a SQLite store under the user data directory, performs the
//! initial load and keeps polling until Ctrl-C.
//!
//! Usage: `eletrize-agent [CONFIG.json] [--initialize] [--print-config]`
//!
//! The configuration path may also come from `ELETRIZE_CONFIG`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use eletrize_sync::{
    AttributeObserver, Dashboard, DashboardBuilder, DeviceId, HostCapabilities, InitialLoad,
    Notice, NoticeLevel, Notifier, SyncConfig,
};

/// Command line options
#[derive(Debug, Default)]
struct Options {
    config: Option<PathBuf>,
    initialize: bool,
    print_config: bool,
}

impl Options {
    fn parse(args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let mut options = Options::default();
        for arg in args {
            match arg.as_str() {
                "--initialize" => options.initialize = true,
                "--print-config" => options.print_config = true,
                flag if flag.starts_with("--") => anyhow::bail!("unknown flag: {}", flag),
                path => options.config = Some(PathBuf::from(path)),
            }
        }
        if options.config.is_none() {
            options.config = std::env::var_os("ELETRIZE_CONFIG").map(PathBuf::from);
        }
        Ok(options)
    }
}

/// Notices go to the log.
struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Info => tracing::info!(notice = %notice.message),
            NoticeLevel::Warning => tracing::warn!(notice = %notice.message),
            NoticeLevel::Error => tracing::error!(notice = %notice.message),
        }
    }
}

/// Secondary attributes (volume, level) go to the log.
struct LogAttributes;

impl AttributeObserver for LogAttributes {
    fn on_attributes(&self, id: &DeviceId, attributes: &BTreeMap<String, String>) {
        tracing::debug!(device = %id, ?attributes, "Device attributes");
    }
}

fn load_config(options: &Options) -> anyhow::Result<SyncConfig> {
    match &options.config {
        Some(path) => SyncConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => {
            tracing::warn!("No configuration given, using development defaults");
            Ok(SyncConfig::development())
        }
    }
}

fn setup_dashboard(config: SyncConfig) -> anyhow::Result<Dashboard> {
    let data_dir = dirs::data_dir()
        .context("no user data directory on this platform")?
        .join("eletrize");
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;

    let dashboard = DashboardBuilder::new()
        .config(config)
        .storage_dir(&data_dir)
        .capabilities(HostCapabilities::headless())
        .notifier(Arc::new(LogNotifier))
        .attribute_observer(Arc::new(LogAttributes))
        .build()?;

    tracing::info!(data_dir = %data_dir.display(), "Agent state initialized");
    Ok(dashboard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eletrize=debug,eletrize_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = Options::parse(std::env::args().skip(1))?;
    let config = load_config(&options)?;

    if options.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    tracing::info!("Starting Eletrize Agent...");
    let dashboard = setup_dashboard(config)?;

    if options.initialize {
        let report = dashboard.dispatcher.initialize_devices(None).await;
        if report.failed > 0 {
            tracing::warn!(failed = report.failed, "Some devices did not initialize");
        }
    }

    match dashboard.start(None).await {
        InitialLoad::Hub { applied, failed } => {
            tracing::info!(applied, failed = failed.len(), "Loaded states from hub");
        }
        InitialLoad::Cached { error } => {
            tracing::warn!(error = %error, "Running on stored states until the hub answers");
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    tracing::info!("Shutting down...");
    dashboard.shutdown().await;
    Ok(())
}
