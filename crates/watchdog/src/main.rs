use anyhow::{bail, Context};
use clap::Parser;
use common::{SharedClock, SystemClock};
use provider::{LambdaClient, MemoryProvider, Provider};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use watchdog::api::{self, AppState};
use watchdog::config::WatchdogConfig;
use watchdog::events::EventLog;
use watchdog::heartbeats::HeartbeatRegistry;
use watchdog::store::{self, KvStore, MemoryStore, SqliteStore};
use watchdog::sweep::Sweeper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = WatchdogConfig::parse();
    if let Err(e) = config.validate() {
        bail!("invalid configuration: {}", e);
    }

    let clock: SharedClock = Arc::new(SystemClock);

    let store: Arc<dyn KvStore> = if config.memory {
        warn!("In-memory store: heartbeats and events are lost on restart");
        Arc::new(MemoryStore::new(clock.clone()))
    } else {
        let path = config.db.clone().unwrap_or_else(store::default_db_path);
        info!("Using database: {}", path.display());
        Arc::new(
            SqliteStore::open(&path, clock.clone())
                .with_context(|| format!("failed to open store at {}", path.display()))?,
        )
    };

    let provider: Arc<dyn Provider> = if config.mock {
        warn!("Mock mode: sweeping an empty in-memory fleet");
        Arc::new(MemoryProvider::new())
    } else {
        let api_key = config.provider_api_key.clone().unwrap_or_default();
        match &config.provider_url {
            Some(url) => Arc::new(LambdaClient::with_base_url(api_key, url.clone())),
            None => Arc::new(LambdaClient::new(api_key)),
        }
    };

    let heartbeats = HeartbeatRegistry::new(store.clone(), clock.clone(), config.heartbeat_ttl());
    let events = EventLog::new(store.clone(), clock.clone(), config.event_ttl());
    let sweeper = Arc::new(Sweeper::new(
        provider,
        store,
        heartbeats.clone(),
        events.clone(),
        clock,
        config.sweep(),
    ));

    if config.once {
        return match sweeper.run_once().await {
            Some(_) => Ok(()),
            None => bail!("sweep failed"),
        };
    }

    sweeper.start(config.sweep_interval());

    let app = api::router(AppState {
        heartbeats,
        events,
        token: Arc::from(config.token.as_str()),
    });
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!("Watchdog listening on {}", config.listen);
    axum::serve(listener, app).await.context("watchdog API failed")?;
    Ok(())
}
