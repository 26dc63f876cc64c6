use std::sync::Arc;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gator::cli::Cli;
use gator::commands::{self, State};
use gator::config::Config;
use gator::db::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };
    let config = Config::load_or_default(&config_path)?;
    debug!("Loaded configuration from {}", config_path.display());

    // Initialize database
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| config.db_url.clone());
    let db = Database::new(&database_url).await?;
    db.initialize().await?;

    let mut state = State {
        db: Arc::new(db),
        config,
        config_path,
    };

    commands::run(&mut state, cli.command, &mut std::io::stdout()).await?;

    Ok(())
}
