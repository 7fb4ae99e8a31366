mod cli;

use anyhow::Result;
use mod_migrator::config::AppConfig;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let config = AppConfig::load_or_create()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let code = cli::run(&config)?;
    std::process::exit(code)
}
