//! Executor - carries out the decided actions against the provider
//!
//! Teardowns run first, then provisions. Units within a phase touch
//! disjoint resources and run concurrently up to `max_parallel`; their
//! outcomes are folded into one [`ExecutionReport`] by the calling task.
//!
//! Every wait is bounded. A unit that fails cleans up what it created
//! before giving up. A new member the gateway cannot reach is fatal: the
//! remaining provisions are cancelled and every member created in this
//! cycle is torn down again.

use futures::stream::{self, StreamExt};
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::models::*;
use crate::config::{Config, ConfigError};
use crate::poll::{PollError, Poller, Probe};
use crate::provider::{
    boot_volume_name, Instance, InstanceStatus, NewInstance, NewVolume, Provider, ProviderError, VolumeStatus,
};
use crate::relay::Relay;

/// Worker template and wait limits
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub prefix: String,
    pub flavor: String,
    pub image_id: String,
    pub volume_size_gb: u32,
    pub key_name: String,
    pub network_id: String,
    pub security_group: String,
    pub tag: String,
    pub subnet: IpNetwork,
    pub max_parallel: usize,
    pub poll_interval: Duration,
    pub volume_timeout: Duration,
    pub instance_timeout: Duration,
    pub ssh_ready_timeout: Duration,
    /// Limit for a single relayed SSH attempt
    pub probe_timeout: Duration,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            prefix: config.fleet.worker_prefix.clone(),
            flavor: config.fleet.flavor.clone(),
            image_id: config.fleet.image_id.clone(),
            volume_size_gb: config.fleet.volume_size_gb,
            key_name: config.fleet.key_name.clone(),
            network_id: config.fleet.network_id.clone(),
            security_group: config.fleet.security_group.clone(),
            tag: config.fleet.tag.clone(),
            subnet: config.subnet()?,
            max_parallel: config.control.max_parallel.max(1),
            poll_interval: config.control.poll_interval(),
            volume_timeout: Duration::from_secs(config.control.volume_timeout_secs),
            instance_timeout: Duration::from_secs(config.control.instance_timeout_secs),
            ssh_ready_timeout: Duration::from_secs(config.control.ssh_ready_timeout_secs),
            probe_timeout: Duration::from_secs(config.ssh.connect_timeout_secs.saturating_add(5)),
        })
    }
}

/// Errors of a single provisioning or teardown unit
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecError {
    #[error("{member}: {source}")]
    Provider {
        member: String,
        #[source]
        source: ProviderError,
    },

    #[error("{member}: {source}")]
    Wait {
        member: String,
        #[source]
        source: PollError,
    },

    #[error("{member}: no address in the private subnet")]
    NoAddress { member: String },

    #[error("{member} ({address}) unreachable from the gateway: {source}")]
    Unreachable {
        member: String,
        address: IpAddr,
        #[source]
        source: PollError,
    },

    #[error("{member}: cancelled")]
    Cancelled { member: String },
}

/// What one cycle's execution achieved
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// Some member was created or deleted
    pub topology_changed: bool,
    pub created: Vec<String>,
    pub removed: Vec<String>,
    pub warnings: Vec<String>,
    /// Set when the cycle must be aborted
    pub fatal: Option<ExecError>,
}

impl ExecutionReport {
    fn warn(&mut self, message: String) {
        warn!(warning = %message, "Action incomplete");
        self.warnings.push(message);
    }
}

/// A member that reached Active and answered through the gateway
#[derive(Debug, Clone)]
struct Provisioned {
    name: String,
    instance_id: String,
    volume_id: String,
    address: IpAddr,
}

#[derive(Debug)]
struct ProvisionFailure {
    error: ExecError,
    fatal: bool,
}

impl ProvisionFailure {
    fn abandon(error: ExecError) -> Self {
        Self { error, fatal: false }
    }
}

#[derive(Debug)]
struct TeardownOutcome {
    name: String,
    /// Set when the instance went but its volume did not
    volume_error: Option<ExecError>,
}

pub struct Executor {
    provider: Arc<dyn Provider>,
    relay: Arc<dyn Relay>,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(provider: Arc<dyn Provider>, relay: Arc<dyn Relay>, settings: ExecutorSettings) -> Self {
        Self {
            provider,
            relay,
            settings,
        }
    }

    /// Execute `actions`; new members are checked for reachability from `gateway`
    pub async fn execute(&self, actions: &[Action], gateway: IpAddr, cancel: &CancellationToken) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        if actions.is_empty() {
            return report;
        }

        // A member targeted twice is deleted once
        let mut targets: Vec<&Member> = Vec::new();
        for member in actions.iter().flat_map(Action::targets) {
            if !targets.iter().any(|t| t.name == member.name) {
                targets.push(member);
            }
        }
        let ordinals: Vec<u32> = actions.iter().flat_map(Action::new_ordinals).collect();

        let teardowns: Vec<Result<TeardownOutcome, ExecError>> = stream::iter(targets)
            .map(|member| self.teardown(member, cancel))
            .buffer_unordered(self.settings.max_parallel)
            .collect()
            .await;

        for outcome in teardowns {
            match outcome {
                Ok(done) => {
                    report.topology_changed = true;
                    if let Some(e) = done.volume_error {
                        report.warn(format!("volume of {} left behind: {}", done.name, e));
                    }
                    report.removed.push(done.name);
                }
                Err(e) => report.warn(format!("teardown aborted: {}", e)),
            }
        }

        let provision_cancel = cancel.child_token();
        let mut provisioned: Vec<Provisioned> = Vec::new();
        {
            let mut units = stream::iter(ordinals)
                .map(|ordinal| self.provision(ordinal, gateway, &provision_cancel))
                .buffer_unordered(self.settings.max_parallel);

            while let Some(outcome) = units.next().await {
                match outcome {
                    Ok(member) => provisioned.push(member),
                    Err(failure) if failure.fatal => {
                        error!(error = %failure.error, "New member unreachable, aborting provisioning");
                        provision_cancel.cancel();
                        if report.fatal.is_none() {
                            report.fatal = Some(failure.error);
                        }
                    }
                    Err(failure) => report.warn(format!("provisioning abandoned: {}", failure.error)),
                }
            }
        }

        if report.fatal.is_some() {
            for member in provisioned.drain(..) {
                warn!(member = %member.name, address = %member.address, "Rolling back member created this cycle");
                self.discard(&member.name, Some(&member.instance_id), &member.volume_id).await;
                report.topology_changed = true;
            }
        }

        for member in provisioned {
            report.topology_changed = true;
            report.created.push(member.name);
        }

        report.created.sort();
        report.removed.sort();
        report
    }

    //=========================================================================
    // TEARDOWN
    //=========================================================================

    async fn teardown(&self, member: &Member, cancel: &CancellationToken) -> Result<TeardownOutcome, ExecError> {
        let started = Instant::now();
        info!(
            member = %member.name,
            address = ?member.internal_address,
            liveness = ?member.liveness,
            "Tearing down member"
        );

        let volume_id = self.resolve_volume(member).await;

        self.delete_instance(&member.name, &member.instance_id, cancel).await?;

        let volume_error = match volume_id {
            Some(id) => self.delete_volume(&member.name, &id, cancel).await.err(),
            None => None,
        };

        info!(
            member = %member.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            volume_left = volume_error.is_some(),
            "Member removed"
        );

        Ok(TeardownOutcome {
            name: member.name.clone(),
            volume_error,
        })
    }

    /// Attached volume from the snapshot, else a lookup by name; best-effort
    async fn resolve_volume(&self, member: &Member) -> Option<String> {
        if let Some(id) = &member.attached_volume_id {
            return Some(id.clone());
        }

        match self.provider.find_volume(&boot_volume_name(&member.name)).await {
            Ok(found) => found.map(|v| v.id),
            Err(e) => {
                debug!(member = %member.name, error = %e, "Volume lookup failed, deleting instance only");
                None
            }
        }
    }

    async fn delete_instance(&self, member: &str, instance_id: &str, cancel: &CancellationToken) -> Result<(), ExecError> {
        self.provider
            .delete_instance(instance_id)
            .await
            .map_err(|source| ExecError::Provider {
                member: member.to_string(),
                source,
            })?;

        let provider = &self.provider;
        self.poller(self.settings.instance_timeout)
            .until(&format!("deletion of instance {}", member), cancel, || async move {
                match provider.show_instance(instance_id).await {
                    Ok(None) => Probe::Ready(()),
                    Ok(Some(inst)) if inst.status == InstanceStatus::Deleted => Probe::Ready(()),
                    Ok(Some(inst)) => Probe::Pending(format!("{:?}", inst.status)),
                    Err(e) if e.is_transient() => Probe::Pending(e.to_string()),
                    Err(e) => Probe::Failed(e.to_string()),
                }
            })
            .await
            .map_err(|source| ExecError::Wait {
                member: member.to_string(),
                source,
            })
    }

    /// Delete a volume and wait until the provider no longer knows it.
    ///
    /// A detached volume gets the delete re-issued; an errored one gets one
    /// more attempt before we give up.
    async fn delete_volume(&self, member: &str, volume_id: &str, cancel: &CancellationToken) -> Result<(), ExecError> {
        if let Err(e) = self.provider.delete_volume(volume_id).await {
            // Often still detaching from the instance; the poll re-issues it
            debug!(member, volume_id, error = %e, "Initial volume delete refused");
        }

        let provider = &self.provider;
        let retried = AtomicBool::new(false);
        let retried = &retried;

        self.poller(self.settings.volume_timeout)
            .until(&format!("deletion of volume of {}", member), cancel, || async move {
                let volume = match provider.show_volume(volume_id).await {
                    Ok(volume) => volume,
                    Err(e) if e.is_transient() => return Probe::Pending(e.to_string()),
                    Err(e) => return Probe::Failed(e.to_string()),
                };

                let Some(volume) = volume else {
                    return Probe::Ready(());
                };

                match volume.status {
                    VolumeStatus::Deleting => Probe::Pending("deleting".to_string()),
                    VolumeStatus::Available => {
                        if let Err(e) = provider.delete_volume(volume_id).await {
                            return Probe::Pending(format!("available, delete refused: {}", e));
                        }
                        Probe::Pending("available, delete re-issued".to_string())
                    }
                    VolumeStatus::Error | VolumeStatus::ErrorDeleting => {
                        if retried.swap(true, Ordering::SeqCst) {
                            return Probe::Failed(format!("volume stuck in {:?}", volume.status));
                        }
                        if let Err(e) = provider.delete_volume(volume_id).await {
                            return Probe::Failed(format!("retry after {:?} refused: {}", volume.status, e));
                        }
                        Probe::Pending(format!("{:?}, delete retried", volume.status))
                    }
                    other => Probe::Pending(format!("{:?}", other)),
                }
            })
            .await
            .map_err(|source| ExecError::Wait {
                member: member.to_string(),
                source,
            })
    }

    //=========================================================================
    // PROVISIONING
    //=========================================================================

    async fn provision(&self, ordinal: u32, gateway: IpAddr, cancel: &CancellationToken) -> Result<Provisioned, ProvisionFailure> {
        let name = member_name(&self.settings.prefix, ordinal);
        if cancel.is_cancelled() {
            return Err(ProvisionFailure::abandon(ExecError::Cancelled { member: name }));
        }

        let started = Instant::now();
        info!(member = %name, "Provisioning member");

        let volume_id = self
            .provider
            .create_volume(&NewVolume {
                name: boot_volume_name(&name),
                size_gb: self.settings.volume_size_gb,
                image_id: self.settings.image_id.clone(),
                tag: self.settings.tag.clone(),
            })
            .await
            .map_err(|source| {
                ProvisionFailure::abandon(ExecError::Provider {
                    member: name.clone(),
                    source,
                })
            })?;
        debug!(member = %name, volume_id = %volume_id, "Boot volume requested");

        if let Err(e) = self.wait_volume_available(&name, &volume_id, cancel).await {
            self.discard(&name, None, &volume_id).await;
            return Err(ProvisionFailure::abandon(e));
        }

        let created = self
            .provider
            .create_instance(&NewInstance {
                name: name.clone(),
                flavor: self.settings.flavor.clone(),
                key_name: self.settings.key_name.clone(),
                network_id: self.settings.network_id.clone(),
                security_group: self.settings.security_group.clone(),
                tag: self.settings.tag.clone(),
                boot_volume_id: volume_id.clone(),
            })
            .await;

        let instance_id = match created {
            Ok(id) => id,
            Err(source) => {
                warn!(member = %name, error = %source, "Instance creation failed, removing its volume");
                self.discard(&name, None, &volume_id).await;
                return Err(ProvisionFailure::abandon(ExecError::Provider {
                    member: name,
                    source,
                }));
            }
        };

        let instance = match self.wait_instance_active(&name, &instance_id, cancel).await {
            Ok(instance) => instance,
            Err(e) => {
                self.discard(&name, Some(&instance_id), &volume_id).await;
                return Err(ProvisionFailure::abandon(e));
            }
        };

        let Some(address) = instance.internal_address(&self.settings.subnet) else {
            self.discard(&name, Some(&instance_id), &volume_id).await;
            return Err(ProvisionFailure::abandon(ExecError::NoAddress { member: name }));
        };
        info!(member = %name, address = %address, "Instance active");

        if let Err(source) = self.wait_reachable(&name, gateway, address, cancel).await {
            self.discard(&name, Some(&instance_id), &volume_id).await;
            if matches!(source, PollError::Cancelled { .. }) {
                return Err(ProvisionFailure::abandon(ExecError::Cancelled { member: name }));
            }
            return Err(ProvisionFailure {
                error: ExecError::Unreachable {
                    member: name,
                    address,
                    source,
                },
                fatal: true,
            });
        }

        info!(
            member = %name,
            address = %address,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Member provisioned"
        );

        Ok(Provisioned {
            name,
            instance_id,
            volume_id,
            address,
        })
    }

    async fn wait_volume_available(&self, member: &str, volume_id: &str, cancel: &CancellationToken) -> Result<(), ExecError> {
        let provider = &self.provider;
        self.poller(self.settings.volume_timeout)
            .until(&format!("boot volume of {}", member), cancel, || async move {
                match provider.show_volume(volume_id).await {
                    Ok(Some(v)) => match v.status {
                        VolumeStatus::Available => Probe::Ready(()),
                        VolumeStatus::Error => Probe::Failed("volume entered error".to_string()),
                        other => Probe::Pending(format!("{:?}", other)),
                    },
                    Ok(None) => Probe::Pending("not visible yet".to_string()),
                    Err(e) if e.is_transient() => Probe::Pending(e.to_string()),
                    Err(e) => Probe::Failed(e.to_string()),
                }
            })
            .await
            .map_err(|source| ExecError::Wait {
                member: member.to_string(),
                source,
            })
    }

    async fn wait_instance_active(&self, member: &str, instance_id: &str, cancel: &CancellationToken) -> Result<Instance, ExecError> {
        let provider = &self.provider;
        self.poller(self.settings.instance_timeout)
            .until(&format!("instance {}", member), cancel, || async move {
                match provider.show_instance(instance_id).await {
                    Ok(Some(inst)) if inst.status == InstanceStatus::Active => Probe::Ready(inst),
                    Ok(Some(inst)) if inst.status == InstanceStatus::Building => {
                        Probe::Pending("building".to_string())
                    }
                    Ok(Some(inst)) => Probe::Failed(format!("instance entered {:?}", inst.status)),
                    Ok(None) => Probe::Pending("not visible yet".to_string()),
                    Err(e) if e.is_transient() => Probe::Pending(e.to_string()),
                    Err(e) => Probe::Failed(e.to_string()),
                }
            })
            .await
            .map_err(|source| ExecError::Wait {
                member: member.to_string(),
                source,
            })
    }

    async fn wait_reachable(&self, member: &str, gateway: IpAddr, address: IpAddr, cancel: &CancellationToken) -> Result<(), PollError> {
        let relay = &self.relay;
        let probe_timeout = self.settings.probe_timeout;
        self.poller(self.settings.ssh_ready_timeout)
            .until(&format!("ssh to {} via gateway", member), cancel, || async move {
                match relay.probe_via(gateway, address, probe_timeout).await {
                    Ok(true) => Probe::Ready(()),
                    Ok(false) => Probe::Pending("ssh refused".to_string()),
                    Err(e) => Probe::Pending(e.to_string()),
                }
            })
            .await
    }

    /// Best-effort cleanup of a unit's resources.
    ///
    /// Runs to completion even when the cycle is cancelled; every wait is
    /// still bounded.
    async fn discard(&self, member: &str, instance_id: Option<&str>, volume_id: &str) {
        let cleanup = CancellationToken::new();

        if let Some(id) = instance_id {
            if let Err(e) = self.delete_instance(member, id, &cleanup).await {
                error!(member, instance_id = id, error = %e, "Cleanup could not delete instance");
            }
        }

        match self.delete_volume(member, volume_id, &cleanup).await {
            Ok(()) => debug!(member, volume_id, "Cleanup removed volume"),
            Err(e) => error!(member, volume_id, error = %e, "Cleanup could not delete volume"),
        }
    }

    fn poller(&self, timeout: Duration) -> Poller {
        Poller::new(self.settings.poll_interval, timeout)
    }
}
