use common::{Clock, SharedClock, TerminationEvent, TerminationReason};
use provider::{Provider, ProviderError, TerminateOutcome};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::heartbeat::HeartbeatEmitter;
use crate::keeper::LeaseKeeper;

/// Resolves once `done` reads `true`, or once its sender is gone.
///
/// The borrowed value is dropped before returning, so the future stays
/// `Send` inside `tokio::select!` in spawned tasks.
pub async fn until_done(done: &mut watch::Receiver<bool>) {
    let _ = done.wait_for(|d| *d).await;
}

/// Where the instance runs, for the audit event.
#[derive(Debug, Clone, Default)]
pub struct InstanceLabels {
    pub gpu_type: String,
    pub region: String,
}

/// The one path every shutdown trigger goes through.
///
/// Committing is one-way. A failed provider call leaves the daemon in
/// `SHUTTING_DOWN` and the monitor loop calls `terminate` again on its next
/// tick until the provider confirms.
pub struct Terminator {
    keeper: Arc<LeaseKeeper>,
    provider: Arc<dyn Provider>,
    clock: SharedClock,
    heartbeat: Option<Arc<HeartbeatEmitter>>,
    labels: InstanceLabels,
    attempt: Mutex<()>,
    done_tx: watch::Sender<bool>,
}

impl Terminator {
    pub fn new(keeper: Arc<LeaseKeeper>, provider: Arc<dyn Provider>, clock: SharedClock) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            keeper,
            provider,
            clock,
            heartbeat: None,
            labels: InstanceLabels::default(),
            attempt: Mutex::new(()),
            done_tx,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Arc<HeartbeatEmitter>) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn with_labels(mut self, labels: InstanceLabels) -> Self {
        self.labels = labels;
        self
    }

    /// Flips to `true` once the provider has confirmed termination.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    pub fn is_done(&self) -> bool {
        *self.done_tx.borrow()
    }

    pub async fn terminate(&self, reason: TerminationReason) -> Result<(), ProviderError> {
        let (reason, first) = self.keeper.begin_shutdown(reason);
        self.execute(reason, first).await
    }

    /// Carry out a termination the keeper has already committed to.
    /// `first` says whether that commit made the transition.
    pub async fn run_committed(&self, reason: TerminationReason, first: bool) -> Result<(), ProviderError> {
        self.execute(reason, first).await
    }

    /// Commit now and run the provider call in the background. Used by the
    /// control API so the caller sees `shutting_down` as soon as it returns.
    pub fn request(self: &Arc<Self>, reason: TerminationReason) -> TerminationReason {
        let (reason, first) = self.keeper.begin_shutdown(reason);
        let this = self.clone();
        tokio::spawn(async move {
            let _ = this.execute(reason, first).await;
        });
        reason
    }

    async fn execute(&self, reason: TerminationReason, first: bool) -> Result<(), ProviderError> {
        let instance_id = self.keeper.instance_id();

        let _guard = self.attempt.lock().await;
        if self.is_done() {
            return Ok(());
        }

        if first {
            warn!("Terminating instance {} (reason: {})", instance_id, reason);
            self.announce(&instance_id, reason).await;
        } else {
            info!("Retrying termination of {} (reason: {})", instance_id, reason);
        }

        match self.provider.terminate_instance(&instance_id).await {
            Ok(outcome) => {
                match outcome {
                    TerminateOutcome::Terminated => info!("Provider accepted termination of {}", instance_id),
                    TerminateOutcome::AlreadyGone => info!("Instance {} was already terminated", instance_id),
                }
                self.done_tx.send_replace(true);
                Ok(())
            }
            Err(e) => {
                error!(
                    "Failed to terminate {}: {}; will retry on next check",
                    instance_id, e
                );
                Err(e)
            }
        }
    }

    /// Best-effort: final heartbeat carrying the reason, then the audit event.
    async fn announce(&self, instance_id: &str, reason: TerminationReason) {
        let Some(heartbeat) = &self.heartbeat else {
            return;
        };
        heartbeat.beat().await;

        let now = self.clock.now();
        let event = TerminationEvent {
            timestamp: now,
            instance_id: instance_id.to_string(),
            reason,
            uptime_minutes: self.keeper.lease().uptime_minutes(now),
            gpu_type: self.labels.gpu_type.clone(),
            region: self.labels.region.clone(),
        };
        if let Err(e) = heartbeat.client().report_event(&event).await {
            warn!("Failed to report termination event: {}", e);
        }
    }
}
