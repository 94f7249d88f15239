use miette::{Context as _, IntoDiagnostic};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{filter::Targets, prelude::*};

use tinymush::prelude::*;
use tinymush_redb::MushStore;

use crate::Args;

/// Builds the runtime config: YAML file, `MUSH_*` env, then explicit
/// CLI overrides (env only wins when the flag was not given).
pub fn load_config(args: &Args) -> miette::Result<Config> {
    let mut overrides: Vec<(&str, String)> = Vec::new();

    if let Some(port) = args.port {
        overrides.push(("port", port.to_string()));
    }
    if let Some(port) = args.tls_port {
        overrides.push(("tls_port", port.to_string()));
    }
    if let Some(cert) = &args.tls_cert {
        overrides.push(("tls", "true".to_string()));
        overrides.push(("tls_cert", cert.display().to_string()));
    }
    if let Some(key) = &args.tls_key {
        overrides.push(("tls_key", key.display().to_string()));
    }
    if let Some(dir) = &args.textdir {
        overrides.push(("text_dir", dir.display().to_string()));
    }
    if let Some(dir) = &args.dictdir {
        overrides.push(("dict_dir", dir.display().to_string()));
    }
    if let Some(path) = &args.sqldb {
        overrides.push(("sql_enabled", "true".to_string()));
        overrides.push(("sql_database", path.display().to_string()));
    }

    Config::load(args.conf.as_deref(), &overrides)
        .into_diagnostic()
        .context("loading configuration")
}

pub fn setup_tracing(config: &LoggingConfig) -> miette::Result<()> {
    let level = config
        .max_level
        .as_deref()
        .map(|text| text.parse::<Level>())
        .transpose()
        .into_diagnostic()
        .context("parsing logging.max_level")?
        .unwrap_or(Level::INFO);

    let mut filter = Targets::new()
        .with_target("tinymush", level)
        .with_target("admin", level);

    if config.include_web {
        filter = filter.with_target("tower_http", level).with_target("axum", level);
    }

    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .finish()
        .with(filter)
        .init();

    Ok(())
}

/// The store file: explicit flag, else auto-detected in the data dir.
pub fn store_path(config: &Config, args: &Args) -> PathBuf {
    args.bolt
        .clone()
        .unwrap_or_else(|| config.data_dir.join("game.redb"))
}

pub fn open_store(config: &Config, args: &Args) -> miette::Result<MushStore> {
    let path = store_path(config, args);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .into_diagnostic()
            .context("creating data directory")?;
    }

    MushStore::open(&path, None)
        .into_diagnostic()
        .with_context(|| format!("opening store at {}", path.display()))
}
