//! Huddle CLI entry point

mod cli;

use crate::cli::{Cli, Commands};
use anyhow::{Context, Result};
use clap::Parser;
use huddle::config::ServerConfig;
use huddle::server::HuddleServer;
use huddle::storage::{MemoryStore, PostgresConfig, PostgresStore, Store};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let db_config = || -> Result<PostgresConfig> {
        match &cli.database_url {
            Some(url) => PostgresConfig::from_url(url).context("Invalid DATABASE_URL"),
            None => PostgresConfig::from_env().context("DATABASE_URL not set"),
        }
    };

    match cli.command {
        Commands::Serve {
            ref bind,
            ref secret,
            token_ttl_secs,
            revalidate_membership,
            revoke_live_sockets,
        } => {
            let store: Arc<dyn Store> = match &cli.database_url {
                Some(_) => Arc::new(PostgresStore::new(db_config()?).await?),
                None => {
                    warn!("No DATABASE_URL set, using in-memory store");
                    Arc::new(MemoryStore::new())
                }
            };

            let mut config = ServerConfig::new(
                bind.parse().context("Invalid bind address")?,
                token_secret(secret.as_deref()),
            );
            config.token_ttl = token_ttl_secs.map(Duration::from_secs);
            config.revoke_live_sockets = revoke_live_sockets;
            config.gateway.revalidate_membership = revalidate_membership;
            config.validate()?;

            serve(config, store).await
        }
        Commands::Init => init(db_config()?).await,
        Commands::Status => status(db_config()?).await,
    }
}

fn token_secret(secret: Option<&str>) -> Vec<u8> {
    match secret {
        Some(secret) => secret.as_bytes().to_vec(),
        None => {
            warn!("HUDDLE_SECRET not set, tokens will not survive a restart");
            let mut bytes = [0u8; 32];
            rand::rng().fill(&mut bytes);
            bytes.to_vec()
        }
    }
}

async fn serve(config: ServerConfig, store: Arc<dyn Store>) -> Result<()> {
    let server = HuddleServer::new(config, store);

    info!("Starting Huddle server...");
    server.run().await?;

    Ok(())
}

async fn init(db_config: PostgresConfig) -> Result<()> {
    let _store = PostgresStore::new(db_config).await?;
    println!("Database schema initialized successfully");
    Ok(())
}

async fn status(db_config: PostgresConfig) -> Result<()> {
    let store = PostgresStore::new(db_config).await?;
    store.ping().await?;

    println!("Huddle Status");
    println!("=============");
    println!("Database: Connected");

    Ok(())
}
