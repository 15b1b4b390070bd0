mod run;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use monthledger::config::LedgerConfig;

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "monthledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let dirs = project_dirs()?;
    let config = load_config(&dirs)?;
    let db_path = get_db_path(&dirs)?;
    run::as_cli(&args, &db_path, config)
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "monthledger", "monthledger")
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))
}

fn load_config(dirs: &ProjectDirs) -> Result<LedgerConfig> {
    let path = dirs.config_dir().join("config.toml");
    LedgerConfig::load_or_default(&path)
        .with_context(|| format!("Failed to load config: {}", path.display()))
}

fn get_db_path(dirs: &ProjectDirs) -> Result<PathBuf> {
    let data_dir = dirs.data_dir();
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    Ok(data_dir.join("monthledger.db"))
}
