//! Fleet - the reconciliation loop
//!
//! Keeps a fixed number of workers running behind the gateway and proxy.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           STEWARD                            │
//! │                                                              │
//! │   ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐     │
//! │   │ Observe  │──│  Decide  │──│ Execute  │──│   Edge   │     │
//! │   └──────────┘  └──────────┘  └──────────┘  └──────────┘     │
//! │        │                           │                         │
//! │   provider + oracle          provider + relay                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Cycles never overlap. Each one re-reads the desired count, builds a
//! fresh snapshot, and forgets it afterwards. The only state carried
//! between cycles is whether the edge still needs to be redeployed.

pub mod cli;
pub mod decider;
pub mod executor;
pub mod models;
pub mod observer;

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{read_desired_count, Config, ConfigError};
use crate::edge::{EdgeError, EdgeHost, EdgeReconfigurer, EdgeTopology};
use crate::poll::{PollError, Poller, Probe};
use crate::provider::ProviderError;
use crate::relay::Relay;
pub use decider::decide;
use executor::{ExecError, ExecutionReport, Executor};
use models::*;
use observer::Observer;

/// Driver settings
#[derive(Debug, Clone)]
pub struct StewardSettings {
    pub worker_prefix: String,
    pub desired_count_file: PathBuf,
    pub default_desired_count: usize,
    pub cycle_pause: Duration,
    pub error_backoff: Duration,
    pub warmup: Duration,
    pub poll_interval: Duration,
    pub startup_timeout: Duration,
    pub probe_timeout: Duration,
    /// Observe and decide only
    pub dry_run: bool,
}

impl StewardSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            worker_prefix: config.fleet.worker_prefix.clone(),
            desired_count_file: config.fleet.desired_count_file.clone(),
            default_desired_count: config.fleet.default_desired_count,
            cycle_pause: config.control.cycle_pause(),
            error_backoff: config.control.error_backoff(),
            warmup: config.control.warmup(),
            poll_interval: config.control.poll_interval(),
            startup_timeout: Duration::from_secs(config.control.startup_timeout_secs),
            probe_timeout: Duration::from_secs(config.ssh.connect_timeout_secs.saturating_add(5)),
            dry_run: config.control.dry_run,
        }
    }
}

/// Errors that end a cycle early; the loop backs off and tries again
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("Desired count unavailable: {0}")]
    DesiredCount(#[from] ConfigError),

    #[error("Observation failed: {0}")]
    Observe(#[from] ProviderError),

    #[error("Provisioning aborted: {0}")]
    Provision(ExecError),

    #[error("Edge reconfiguration failed: {0}")]
    Edge(#[from] EdgeError),

    #[error("Cycle cancelled")]
    Cancelled,
}

/// Errors that prevent the steward from starting
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Edge lookup failed: {0}")]
    Edge(#[from] EdgeError),

    #[error("{role} '{name}' has no floating address")]
    NoPublicAddress { role: &'static str, name: String },

    #[error("{role} at {address} unreachable: {source}")]
    Unreachable {
        role: &'static str,
        address: IpAddr,
        #[source]
        source: PollError,
    },
}

/// Result of one cycle
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub snapshot: FleetSnapshot,
    pub actions: Vec<Action>,
    /// None in dry-run mode
    pub report: Option<ExecutionReport>,
    pub edge_applied: bool,
}

/// Confirm the gateway and proxy answer on their public addresses.
///
/// Returns the topology seen at startup; its gateway address is the one
/// everything else is relayed through.
pub async fn startup(
    edge: &EdgeReconfigurer,
    relay: &dyn Relay,
    settings: &StewardSettings,
    cancel: &CancellationToken,
) -> Result<EdgeTopology, StartupError> {
    let topology = edge.topology().await?;

    for (role, host) in [("gateway", &topology.gateway), ("proxy", &topology.proxy)] {
        wait_public(role, host, relay, settings, cancel).await?;
    }

    info!(
        gateway = ?topology.gateway.public,
        proxy = ?topology.proxy.public,
        workers = topology.workers.len(),
        "Edge reachable"
    );
    Ok(topology)
}

async fn wait_public(
    role: &'static str,
    host: &EdgeHost,
    relay: &dyn Relay,
    settings: &StewardSettings,
    cancel: &CancellationToken,
) -> Result<(), StartupError> {
    let address = host.public.ok_or_else(|| StartupError::NoPublicAddress {
        role,
        name: host.name.clone(),
    })?;

    let probe_timeout = settings.probe_timeout;
    Poller::new(settings.poll_interval, settings.startup_timeout)
        .until(&format!("{} {} reachable", role, host.name), cancel, || async move {
            match relay.reachable(address, probe_timeout).await {
                Ok(true) => Probe::Ready(()),
                Ok(false) => Probe::Pending("ssh refused".to_string()),
                Err(e) => Probe::Pending(e.to_string()),
            }
        })
        .await
        .map_err(|source| StartupError::Unreachable { role, address, source })
}

/// The control loop driver
pub struct Steward {
    settings: StewardSettings,
    observer: Observer,
    executor: Executor,
    edge: EdgeReconfigurer,
    gateway: IpAddr,
    /// Set by a topology change, cleared by a successful edge apply
    redeploy_pending: bool,
}

impl Steward {
    pub fn new(
        settings: StewardSettings,
        observer: Observer,
        executor: Executor,
        edge: EdgeReconfigurer,
        gateway: IpAddr,
    ) -> Self {
        Self {
            settings,
            observer,
            executor,
            edge,
            gateway,
            // The edge may predate a restart
            redeploy_pending: true,
        }
    }

    pub fn edge(&self) -> &EdgeReconfigurer {
        &self.edge
    }

    pub fn redeploy_pending(&self) -> bool {
        self.redeploy_pending
    }

    /// Run cycles until `shutdown` is cancelled
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(
            prefix = %self.settings.worker_prefix,
            gateway = %self.gateway,
            dry_run = self.settings.dry_run,
            "Steward started"
        );

        if !pause(&shutdown, self.settings.warmup).await {
            info!("Steward shutting down");
            return;
        }

        loop {
            let wait = match self.tick(&shutdown).await {
                Ok(_) => self.settings.cycle_pause,
                Err(CycleError::Cancelled) => break,
                Err(e) => {
                    error!(error = %e, backoff_secs = self.settings.error_backoff.as_secs(), "Cycle failed");
                    self.settings.error_backoff
                }
            };

            if !pause(&shutdown, wait).await {
                break;
            }
        }

        info!("Steward shutting down");
    }

    /// Observe and decide without touching anything
    pub async fn plan(&self) -> Result<(FleetSnapshot, Vec<Action>), CycleError> {
        let desired = read_desired_count(&self.settings.desired_count_file, self.settings.default_desired_count)?;
        let snapshot = self
            .observer
            .build_snapshot(&self.settings.worker_prefix, desired)
            .await?;
        let actions = decide(&snapshot);
        Ok((snapshot, actions))
    }

    /// One full cycle
    pub async fn tick(&mut self, shutdown: &CancellationToken) -> Result<CycleOutcome, CycleError> {
        let started = Instant::now();
        let (snapshot, actions) = self.plan().await?;

        info!(
            desired = snapshot.desired_count,
            active = snapshot.active_count(),
            operational = snapshot.operational_count(),
            liveness_known = snapshot.liveness_known,
            actions = actions.len(),
            "Cycle observed"
        );
        for action in &actions {
            info!(action = %action, "Decided");
        }

        if self.settings.dry_run {
            if !actions.is_empty() {
                info!("Dry run, nothing executed");
            }
            return Ok(CycleOutcome {
                snapshot,
                actions,
                report: None,
                edge_applied: false,
            });
        }

        let cycle = shutdown.child_token();
        let report = self.executor.execute(&actions, self.gateway, &cycle).await;

        if report.topology_changed {
            self.redeploy_pending = true;
        }
        if !report.warnings.is_empty() {
            warn!(warnings = report.warnings.len(), "Cycle completed with incomplete actions");
        }
        if let Some(fatal) = report.fatal.clone() {
            cycle.cancel();
            return Err(CycleError::Provision(fatal));
        }
        if shutdown.is_cancelled() {
            return Err(CycleError::Cancelled);
        }

        let mut edge_applied = false;
        if self.redeploy_pending {
            self.edge.apply().await?;
            self.redeploy_pending = false;
            edge_applied = true;
        }

        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            created = report.created.len(),
            removed = report.removed.len(),
            edge_applied,
            "Cycle finished"
        );

        Ok(CycleOutcome {
            snapshot,
            actions,
            report: Some(report),
            edge_applied,
        })
    }
}

/// Sleep unless shut down first; false when shut down
async fn pause(shutdown: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}
