mod pending;
mod remote;

use anyhow::{anyhow, bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use common::{defaults, EventsQuery, TerminationEvent, TerminationReason};
use pending::PendingQueue;
use provider::{Instance, LambdaClient, LaunchRequest, MemoryProvider, Provider};
use remote::{DaemonApi, RemoteError, WatchdogApi};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const WAIT_POLL: Duration = Duration::from_secs(10);
const WAIT_TIMEOUT_SECS: u64 = 600;

#[derive(Parser)]
#[command(name = "gpulease", author, version, about = "Launch and control leased GPU instances", long_about = None)]
struct Cli {
    /// Shared bearer token of the daemons and the watchdog.
    #[arg(long, env = "GPULEASE_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    #[arg(long, env = "GPULEASE_PROVIDER_API_KEY", hide_env_values = true, global = true)]
    provider_api_key: Option<String>,

    #[arg(long, env = "GPULEASE_PROVIDER_URL", global = true)]
    provider_url: Option<String>,

    #[arg(long, env = "GPULEASE_WATCHDOG_URL", global = true)]
    watchdog_url: Option<String>,

    /// Reach the daemon here instead of http://<instance ip>:8080 (e.g. through an SSH tunnel).
    #[arg(long, env = "GPULEASE_DAEMON_URL", global = true)]
    daemon_url: Option<String>,

    /// Use an in-memory provider. Nothing is launched or billed.
    #[arg(long, global = true)]
    mock: bool,

    /// Answer yes to every confirmation.
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    /// Pending event queue file.
    #[arg(long, env = "GPULEASE_PENDING_FILE", global = true)]
    pending_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a managed instance
    Launch {
        #[arg(long)]
        instance_type: String,
        #[arg(long)]
        region: String,
        #[arg(long = "ssh-key", required = true)]
        ssh_keys: Vec<String>,
        #[arg(long)]
        name: Option<String>,
        /// Extra filesystems to attach, besides the fleet marker.
        #[arg(long = "file-system")]
        file_systems: Vec<String>,
        /// Block until the instance and its daemon are up.
        #[arg(long)]
        wait: bool,
    },
    /// List managed instances
    List {
        /// Include instances this system does not manage.
        #[arg(long)]
        all: bool,
    },
    /// Show the lease of an instance
    Status { instance_id: String },
    /// Extend the lease of an instance
    Extend { instance_id: String, hours: i64 },
    /// Terminate an instance now
    Stop { instance_id: String },
    /// Wait until an instance is active and its daemon answers
    Wait {
        instance_id: String,
        #[arg(long, default_value_t = WAIT_TIMEOUT_SECS)]
        timeout: u64,
    },
    /// Show termination history from the watchdog
    Events {
        #[arg(long)]
        hours: Option<i64>,
        #[arg(long)]
        instance_id: Option<String>,
        #[arg(long)]
        event_type: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Deliver queued termination events to the watchdog
    Sync,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let ctl = Ctl::new(&cli);

    match &cli.command {
        Commands::Launch {
            instance_type,
            region,
            ssh_keys,
            name,
            file_systems,
            wait,
        } => {
            let mut file_system_names = vec![defaults::FLEET_MARKER.to_string()];
            file_system_names.extend(file_systems.iter().cloned());
            let request = LaunchRequest {
                region_name: region.clone(),
                instance_type_name: instance_type.clone(),
                ssh_key_names: ssh_keys.clone(),
                file_system_names,
                name: name.clone(),
            };
            ctl.launch(request, *wait).await
        }
        Commands::List { all } => ctl.list(*all).await,
        Commands::Status { instance_id } => ctl.status(instance_id).await,
        Commands::Extend { instance_id, hours } => ctl.extend(instance_id, *hours).await,
        Commands::Stop { instance_id } => ctl.stop(instance_id).await,
        Commands::Wait { instance_id, timeout } => {
            ctl.wait(instance_id, Duration::from_secs(*timeout)).await.map(|_| ())
        }
        Commands::Events {
            hours,
            instance_id,
            event_type,
            limit,
        } => {
            ctl.events(EventsQuery {
                hours: *hours,
                instance_id: instance_id.clone(),
                event_type: event_type.clone(),
                limit: *limit,
            })
            .await
        }
        Commands::Sync => ctl.sync().await,
    }
}

struct Ctl {
    provider: Option<Arc<dyn Provider>>,
    token: Option<String>,
    watchdog_url: Option<String>,
    daemon_url: Option<String>,
    assume_yes: bool,
    pending: PendingQueue,
}

impl Ctl {
    fn new(cli: &Cli) -> Self {
        let provider: Option<Arc<dyn Provider>> = if cli.mock {
            Some(Arc::new(MemoryProvider::new()))
        } else {
            cli.provider_api_key.clone().map(|api_key| -> Arc<dyn Provider> {
                match &cli.provider_url {
                    Some(url) => Arc::new(LambdaClient::with_base_url(api_key, url.clone())),
                    None => Arc::new(LambdaClient::new(api_key)),
                }
            })
        };
        Self {
            provider,
            token: cli.token.clone(),
            watchdog_url: cli.watchdog_url.clone(),
            daemon_url: cli.daemon_url.clone(),
            assume_yes: cli.yes,
            pending: PendingQueue::new(cli.pending_file.clone().unwrap_or_else(pending::default_path)),
        }
    }

    fn provider(&self) -> anyhow::Result<&dyn Provider> {
        self.provider
            .as_deref()
            .ok_or_else(|| anyhow!("provider API key missing (set GPULEASE_PROVIDER_API_KEY or use --mock)"))
    }

    fn token(&self) -> anyhow::Result<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| anyhow!("bearer token missing (set GPULEASE_TOKEN)"))
    }

    fn watchdog(&self) -> anyhow::Result<WatchdogApi> {
        let url = self
            .watchdog_url
            .as_deref()
            .ok_or_else(|| anyhow!("watchdog URL missing (set GPULEASE_WATCHDOG_URL)"))?;
        Ok(WatchdogApi::new(url, self.token.as_deref().unwrap_or_default()))
    }

    fn confirm(&self, prompt: &str) -> anyhow::Result<bool> {
        if self.assume_yes {
            return Ok(true);
        }
        print!("{} [y/N] ", prompt);
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
    }

    async fn instance(&self, instance_id: &str) -> anyhow::Result<Instance> {
        self.provider()?
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| anyhow!("instance {} not found", instance_id))
    }

    fn daemon_for(&self, instance: &Instance) -> anyhow::Result<DaemonApi> {
        let base = match (&self.daemon_url, &instance.ip) {
            (Some(url), _) => url.clone(),
            (None, Some(ip)) => format!("http://{}:{}", ip, defaults::DAEMON_PORT),
            (None, None) => bail!("instance {} has no IP address yet", instance.id),
        };
        Ok(DaemonApi::new(&base, self.token()?))
    }

    async fn launch(&self, request: LaunchRequest, wait: bool) -> anyhow::Result<()> {
        let provider = self.provider()?;
        let catalog = provider.catalog().await;
        if let Some(catalog) = &catalog {
            let check = catalog.check(&request);
            for warning in &check.warnings {
                eprintln!("warning: {}", warning);
            }
            if !check.can_launch() {
                for error in &check.errors {
                    eprintln!("error: {}", error);
                }
                bail!("launch request rejected before contacting the provider");
            }
        }

        println!("Instance type: {}", request.instance_type_name);
        println!("Region:        {}", request.region_name);
        println!(
            "Lease:         {}h (maximum {}h, idle timeout {}m)",
            defaults::INITIAL_LEASE_HOURS,
            defaults::MAX_LEASE_HOURS,
            defaults::IDLE_TIMEOUT_MINUTES
        );
        if let Some(t) = catalog.as_ref().and_then(|c| c.instance_type(&request.instance_type_name)) {
            println!(
                "Price:         ${:.2}/h (${:.2} for the initial lease, at most ${:.2})",
                t.price_per_hour(),
                t.estimate_cost(defaults::INITIAL_LEASE_HOURS),
                t.estimate_cost(defaults::MAX_LEASE_HOURS)
            );
        }
        if !self.confirm("Launch this instance? It is billed until terminated.")? {
            println!("Cancelled.");
            return Ok(());
        }
        let id = provider
            .launch_instance(&request)
            .await
            .context("launch failed")?;
        println!("Launched instance {}", id);
        if wait {
            let instance = self.wait(&id, Duration::from_secs(WAIT_TIMEOUT_SECS)).await?;
            println!("Ready at {}", instance.ip.unwrap_or_default());
        }
        Ok(())
    }

    async fn list(&self, all: bool) -> anyhow::Result<()> {
        let instances = self.provider()?.list_instances().await.context("listing instances failed")?;
        let shown: Vec<&Instance> = instances
            .iter()
            .filter(|i| all || i.carries_marker(defaults::FLEET_MARKER))
            .collect();
        if shown.is_empty() {
            println!("No instances.");
            return Ok(());
        }
        println!("{:<38} {:<12} {:<16} {:<18} {}", "ID", "STATUS", "IP", "TYPE", "REGION");
        for i in shown {
            println!(
                "{:<38} {:<12} {:<16} {:<18} {}",
                i.id,
                i.status,
                i.ip.as_deref().unwrap_or("-"),
                i.instance_type,
                i.region
            );
        }
        Ok(())
    }

    async fn status(&self, instance_id: &str) -> anyhow::Result<()> {
        let instance = self.instance(instance_id).await?;
        let snap = self.daemon_for(&instance)?.status().await?;
        println!("Instance:    {} ({:?})", snap.instance_id, snap.state);
        println!("Uptime:      {}m", snap.uptime_minutes);
        println!("Deadline:    {} ({}m left)", snap.lease_deadline, snap.remaining_minutes);
        println!("Hard limit:  {}", snap.hard_deadline);
        println!("Idle:        {}m of {}m", snap.idle_minutes, snap.idle_timeout_minutes);
        println!(
            "Extensions:  {} ({:.1}h still available)",
            snap.extension_count, snap.available_extension_hours
        );
        if let Some(reason) = snap.termination_reason {
            println!("Terminating: {}", reason);
        }
        Ok(())
    }

    async fn extend(&self, instance_id: &str, hours: i64) -> anyhow::Result<()> {
        if hours <= 0 {
            bail!("hours must be a positive integer");
        }
        let instance = self.instance(instance_id).await?;
        let daemon = self.daemon_for(&instance)?;
        if !self.confirm(&format!("Extend {} by {}h? This adds cost.", instance_id, hours))? {
            println!("Cancelled.");
            return Ok(());
        }
        match daemon.extend(hours).await {
            Ok(resp) => {
                println!(
                    "New deadline {} ({:.1}h total, {:.1}h still available)",
                    resp.new_deadline, resp.total_hours, resp.available_extension_hours
                );
                Ok(())
            }
            Err(RemoteError::Rejected { message, .. }) => bail!("extension refused: {}", message),
            Err(e) => Err(e.into()),
        }
    }

    async fn stop(&self, instance_id: &str) -> anyhow::Result<()> {
        let instance = self.instance(instance_id).await?;
        if !self.confirm(&format!("Terminate {} now?", instance_id))? {
            println!("Cancelled.");
            return Ok(());
        }

        // The daemon reports its own event when it accepts the shutdown.
        let mut via_daemon = false;
        if let Ok(daemon) = self.daemon_for(&instance) {
            match daemon.shutdown().await {
                Ok(_) => {
                    println!("Daemon accepted shutdown of {}", instance_id);
                    via_daemon = true;
                }
                Err(e) if e.is_unreachable() => {
                    eprintln!("Daemon unreachable ({}); terminating through the provider", e)
                }
                Err(e) => eprintln!("Daemon refused shutdown: {}; terminating through the provider", e),
            }
        }
        if via_daemon {
            return Ok(());
        }

        let outcome = self
            .provider()?
            .terminate_instance(instance_id)
            .await
            .context("terminate failed")?;
        println!("Terminated {} ({:?})", instance_id, outcome);

        let event = TerminationEvent {
            timestamp: Utc::now(),
            instance_id: instance.id.clone(),
            reason: TerminationReason::Manual,
            uptime_minutes: instance
                .created_at
                .map(|at| (Utc::now() - at).num_minutes().max(0) as u64)
                .unwrap_or(0),
            gpu_type: instance.instance_type.clone(),
            region: instance.region.clone(),
        };
        self.report(event).await
    }

    /// Send an event to the watchdog, or queue it for `sync`.
    async fn report(&self, event: TerminationEvent) -> anyhow::Result<()> {
        let delivered = match self.watchdog() {
            Ok(watchdog) => match watchdog.record_event(&event).await {
                Ok(_) => true,
                Err(e) => {
                    eprintln!("Could not record event: {}", e);
                    false
                }
            },
            Err(_) => false,
        };
        if !delivered {
            self.pending.push(event)?;
            println!(
                "Event queued in {}; run `gpulease sync` later",
                self.pending.path().display()
            );
        }
        Ok(())
    }

    async fn wait(&self, instance_id: &str, timeout: Duration) -> anyhow::Result<Instance> {
        let provider = self.provider()?;
        let started = Instant::now();
        loop {
            match provider.get_instance(instance_id).await {
                Ok(Some(instance)) if instance.is_gone() => {
                    bail!("instance {} is {}", instance_id, instance.status)
                }
                Ok(Some(instance)) if instance.is_active() && instance.ip.is_some() => {
                    match self.daemon_for(&instance) {
                        Ok(daemon) if daemon.is_up().await => return Ok(instance),
                        _ => println!("{} is active, waiting for its daemon...", instance_id),
                    }
                }
                Ok(Some(instance)) => println!("{} is {}...", instance_id, instance.status),
                Ok(None) => bail!("instance {} not found", instance_id),
                Err(e) => eprintln!("Provider error while waiting: {}", e),
            }
            if started.elapsed() >= timeout {
                bail!("{} not ready after {}s", instance_id, timeout.as_secs());
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    async fn events(&self, query: EventsQuery) -> anyhow::Result<()> {
        let resp = self.watchdog()?.events(&query).await?;
        if resp.events.is_empty() {
            println!("No terminations in this window.");
            return Ok(());
        }
        println!("{:<28} {:<38} {:<16} {:>8}", "TIME", "INSTANCE", "REASON", "UPTIME");
        for e in &resp.events {
            println!(
                "{:<28} {:<38} {:<16} {:>7}m",
                e.timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                e.instance_id,
                e.reason.as_str(),
                e.uptime_minutes
            );
        }
        println!();
        println!(
            "{} event(s), {:.1}h total uptime",
            resp.totals.events,
            resp.totals.uptime_minutes as f64 / 60.0
        );
        if resp.count < resp.totals.events {
            println!("(showing the newest {})", resp.count);
        }
        for (reason, n) in &resp.totals.by_reason {
            println!("  {:<16} {}", reason, n);
        }
        Ok(())
    }

    async fn sync(&self) -> anyhow::Result<()> {
        if self.pending.load().is_empty() {
            println!("Nothing to sync.");
            return Ok(());
        }
        let (delivered, remaining) = self.pending.sync(&self.watchdog()?).await?;
        println!("Delivered {} event(s), {} still pending", delivered, remaining);
        Ok(())
    }
}
