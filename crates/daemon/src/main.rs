use anyhow::{bail, Context};
use clap::Parser;
use common::{Clock, SharedClock, SystemClock};
use daemon::api::{self, AppState};
use daemon::config::DaemonConfig;
use daemon::db;
use daemon::heartbeat::{HeartbeatEmitter, WatchdogClient};
use daemon::keeper::LeaseKeeper;
use daemon::monitor::LeaseMonitor;
use daemon::probe::ActivityProbe;
use daemon::terminate::{until_done, InstanceLabels, Terminator};
use provider::{Instance, LambdaClient, MemoryProvider, Provider};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = DaemonConfig::parse();
    if let Err(e) = config.validate() {
        bail!("invalid configuration: {}", e);
    }

    let clock: SharedClock = Arc::new(SystemClock);

    let db_path = config.db_path();
    info!("Using database: {}", db_path.display());
    let conn = db::init_db(&db_path)
        .with_context(|| format!("failed to open lease database at {}", db_path.display()))?;
    let keeper = Arc::new(
        LeaseKeeper::open(conn, &config.instance_id, &config.lease(), clock.now())
            .context("failed to load or create the lease record")?,
    );

    let provider = build_provider(&config);

    let probe = config.activity_probe_url.as_ref().map(|url| {
        Arc::new(ActivityProbe::new(
            url.clone(),
            config.activity_metric.clone(),
            config.probe_service.clone(),
        ))
    });

    let heartbeat = config.watchdog_url.as_ref().map(|url| {
        let mut emitter = HeartbeatEmitter::new(
            WatchdogClient::new(url.clone(), config.token.clone()),
            keeper.clone(),
            clock.clone(),
        )
        .with_model(config.model.clone());
        if let Some(probe) = &probe {
            emitter = emitter.with_probe(probe.clone());
        }
        Arc::new(emitter)
    });
    if heartbeat.is_none() {
        warn!("No watchdog URL configured; heartbeats disabled");
    }

    let mut terminator = Terminator::new(keeper.clone(), provider, clock.clone()).with_labels(InstanceLabels {
        gpu_type: config.gpu_type.clone(),
        region: config.region.clone(),
    });
    if let Some(heartbeat) = &heartbeat {
        terminator = terminator.with_heartbeat(heartbeat.clone());
    }
    let terminator = Arc::new(terminator);

    if let Some(reason) = keeper.pending_shutdown() {
        warn!("Stored lease is already shutting down ({}); resuming termination", reason);
    }

    LeaseMonitor::new(keeper.clone(), terminator.clone(), clock.clone(), config.check_interval()).start();
    if let Some(heartbeat) = heartbeat {
        heartbeat.start(config.heartbeat_interval(), terminator.subscribe());
    }
    if let Some(probe) = probe {
        probe.start(keeper.clone(), clock.clone(), config.check_interval(), terminator.subscribe());
    }

    let app = api::router(AppState {
        keeper,
        terminator: terminator.clone(),
        clock,
        token: Arc::from(config.token.as_str()),
    });

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!("Control API listening on {}", config.listen);

    let mut done = terminator.subscribe();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            until_done(&mut done).await;
            info!("Termination confirmed; shutting down");
        })
        .await
        .context("control API failed")?;
    Ok(())
}

fn build_provider(config: &DaemonConfig) -> Arc<dyn Provider> {
    if config.mock {
        warn!("Mock mode: termination goes to an in-memory provider");
        return Arc::new(MemoryProvider::with_instances([Instance {
            id: config.instance_id.clone(),
            name: None,
            ip: None,
            status: "active".to_string(),
            instance_type: config.gpu_type.clone(),
            region: config.region.clone(),
            file_system_names: vec![common::defaults::FLEET_MARKER.to_string()],
            created_at: None,
        }]));
    }
    let api_key = config.provider_api_key.clone().unwrap_or_default();
    match &config.provider_url {
        Some(url) => Arc::new(LambdaClient::with_base_url(api_key, url.clone())),
        None => Arc::new(LambdaClient::new(api_key)),
    }
}
