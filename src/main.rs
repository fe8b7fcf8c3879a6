//! LTP Recorder
//!
//! Usage:
//!   ltp-recorder --instruments instruments.json --segment NSE-OTH --token <access token>
//!
//! Environment (also read from `.env`):
//!   LTP_FEED_URL, LTP_INSTRUMENTS, LTP_SEGMENT, LTP_TABLE_DB
//!   LTP_ACCESS_TOKEN or LTP_CLIENT_ID / LTP_CLIENT_SECRET / LTP_TOKEN_URL
//!   RUST_LOG (default: ltp_recorder=info)

use std::{path::Path, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ltp_recorder::{
    aggregator::{Aggregator, Snapshotter},
    config::RecorderConfig,
    feed::{AuthProvider, ClientCredentialsAuth, ConnectionManager, StaticToken},
    registry::{JsonInstrumentLoader, SubscriptionRegistry},
    store::{SqliteTableStore, TableStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let config = RecorderConfig::parse();

    info!(
        feed_url = %config.feed_url,
        segment = %config.segment,
        table_db = %config.table_db,
        heartbeat_secs = config.heartbeat_interval().as_secs(),
        snapshot_secs = config.snapshot_interval().as_secs(),
        reconnect = !config.no_reconnect,
        "starting ltp recorder"
    );

    let loader = JsonInstrumentLoader::new(&config.instruments, config.segment.clone());
    let registry = Arc::new(
        SubscriptionRegistry::load(&loader)
            .with_context(|| format!("loading instruments from {}", config.instruments))?,
    );
    if registry.is_empty() {
        warn!(segment = %config.segment, "no instruments to subscribe");
    }
    info!(instruments = registry.len(), "subscription registry loaded");

    let store = Arc::new(
        SqliteTableStore::new(&config.table_db)
            .with_context(|| format!("opening table database {}", config.table_db))?,
    );
    let seed = store
        .load_table()
        .with_context(|| format!("loading persisted table from {}", config.table_db))?;
    if let Some(table) = &seed {
        info!(
            rows = table.row_count(),
            columns = table.column_count(),
            "resuming persisted table"
        );
    }

    let aggregator = Aggregator::new(registry.clone(), seed, config.buffer_capacity);

    let snapshotter = Snapshotter::new(aggregator.clone(), store, config.snapshot_interval());
    tokio::spawn(snapshotter.run());

    let auth = build_auth(&config)?;
    let manager = ConnectionManager::new(
        config.connection_config(),
        registry,
        auth,
        aggregator.clone(),
    );

    let result = manager.run().await;

    let stats = aggregator.stats().snapshot();
    let session = manager.session().metrics().snapshot();
    info!(
        state = %manager.state(),
        aggregator = %serde_json::to_string(&stats).unwrap_or_default(),
        session = %serde_json::to_string(&session).unwrap_or_default(),
        "feed connection finished"
    );

    if let Err(e) = result {
        error!(error = %e, "feed connection failed");
        return Err(e.into());
    }
    Ok(())
}

fn build_auth(config: &RecorderConfig) -> Result<Arc<dyn AuthProvider>> {
    if let Some(oauth) = config.oauth_client() {
        info!(token_url = %oauth.token_url, "using client-credentials token provider");
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .context("building HTTP client")?;
        return Ok(Arc::new(ClientCredentialsAuth::new(
            http,
            oauth.token_url,
            oauth.client_id,
            oauth.client_secret,
            config.token.clone(),
        )));
    }

    match config.token.as_deref().map(str::trim) {
        Some(token) if !token.is_empty() => Ok(Arc::new(StaticToken::new(token))),
        _ => bail!("no access token: set LTP_ACCESS_TOKEN or the LTP_CLIENT_* variables"),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ltp_recorder=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    let _ = dotenv();

    // Also the crate-root .env when launched from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
