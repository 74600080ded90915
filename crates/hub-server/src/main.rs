//! Hub server
//!
//! Loads `hub.yaml`, sets up every config entry and runs until Ctrl-C.

mod demo;

use anyhow::{bail, Context as _, Result};
use hub_config::{HubConfig, LoggerConfig};
use hub_config_entries::{ConfigEntries, HubContext, IntegrationRegistry};
use hub_core::{events, Context, Event};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const DEFAULT_CONFIG: &str = "hub.yaml";

fn config_path() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    let mut path = PathBuf::from(DEFAULT_CONFIG);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => match args.next() {
                Some(value) => path = PathBuf::from(value),
                None => bail!("--config needs a path"),
            },
            other => match other.strip_prefix("--config=") {
                Some(value) => path = PathBuf::from(value),
                None => bail!("unexpected argument {other:?}; usage: hub [--config PATH]"),
            },
        }
    }
    Ok(path)
}

/// A missing config file means defaults rooted next to where it would be
fn load_config(path: &Path) -> Result<HubConfig> {
    if path.exists() {
        return HubConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()));
    }
    let mut config = HubConfig::default();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        config.config_dir = parent.to_path_buf();
    }
    Ok(config)
}

fn init_tracing(logger: &LoggerConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(logger.directives())
            .with_context(|| format!("invalid log levels {:?}", logger.directives()))?,
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = config_path()?;
    let config = load_config(&path)?;
    init_tracing(&config.logger)?;

    info!("Starting hub (config dir {})", config.config_dir.display());
    if !path.exists() {
        warn!("{} not found, using defaults", path.display());
    }

    let yaml_entries = config.entries.clone();
    let hub = HubContext::new(config);
    hub.load_registries()
        .await
        .context("failed to load entity registry")?;

    let integrations = Arc::new(IntegrationRegistry::new());
    integrations.register(Arc::new(demo::DemoIntegration));

    let entries = ConfigEntries::new(Arc::clone(&hub), integrations);
    entries.load().await.context("failed to load config entries")?;
    let imported = entries
        .import_entries(&yaml_entries)
        .await
        .context("failed to import config entries")?;
    if imported > 0 {
        info!("Imported {} config entries from YAML", imported);
    }

    let mut loaded = 0;
    for (entry_id, result) in entries.setup_all().await {
        match result {
            Ok(true) => loaded += 1,
            Ok(false) => {
                warn!(entry_id = %entry_id, state = ?entries.state(&entry_id), "Entry not loaded")
            }
            Err(err) => error!(entry_id = %entry_id, "Setup failed: {}", err),
        }
    }
    hub.bus().fire(Event::new(
        events::HUB_START,
        serde_json::Value::Null,
        Context::new(),
    ));
    info!("Hub is running with {} of {} entries loaded", loaded, entries.len());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    hub.bus().fire(Event::new(
        events::HUB_STOP,
        serde_json::Value::Null,
        Context::new(),
    ));

    entries.shutdown().await;
    hub.save_registries()
        .await
        .context("failed to save entity registry")?;
    entries.save().await.context("failed to save config entries")?;
    info!("Stopped");
    Ok(())
}
