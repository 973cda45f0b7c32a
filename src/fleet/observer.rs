//! Observer - builds the per-cycle fleet snapshot
//!
//! Merges what the provider reports with what the health oracle reports.
//! An unreachable oracle degrades liveness to `Unknown` instead of failing
//! the cycle; the provider dimension is still reconciled.

use ipnetwork::IpNetwork;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use super::models::*;
use crate::oracle::HealthOracle;
use crate::provider::{Instance, InstanceStatus, Provider, ProviderError};

pub struct Observer {
    provider: Arc<dyn Provider>,
    oracle: Arc<dyn HealthOracle>,
    subnet: IpNetwork,
}

impl Observer {
    pub fn new(provider: Arc<dyn Provider>, oracle: Arc<dyn HealthOracle>, subnet: IpNetwork) -> Self {
        Self {
            provider,
            oracle,
            subnet,
        }
    }

    /// Observe every worker under `role_prefix`. Read-only.
    pub async fn build_snapshot(&self, role_prefix: &str, desired_count: usize) -> Result<FleetSnapshot, ProviderError> {
        let instances = self.provider.list_instances(role_prefix).await?;

        let alive = match self.oracle.alive().await {
            Ok(alive) => Some(alive),
            Err(e) => {
                warn!(error = %e, "Health oracle unreachable, liveness unknown this cycle");
                None
            }
        };

        let mut seen: HashMap<&str, usize> = HashMap::new();
        for inst in &instances {
            *seen.entry(inst.name.as_str()).or_default() += 1;
        }
        for (name, records) in seen.iter().filter(|(_, n)| **n > 1) {
            warn!(member = %name, records, "Several instances share a name, keeping the most useful one");
        }

        let members = instances
            .iter()
            .map(|inst| self.member_from(role_prefix, inst, alive.as_ref()))
            .collect();

        let snapshot = FleetSnapshot::new(role_prefix, members, desired_count, alive.is_some());

        debug!(
            members = snapshot.members.len(),
            active = snapshot.active_count(),
            operational = snapshot.operational_count(),
            desired = desired_count,
            "Snapshot built"
        );

        Ok(snapshot)
    }

    fn member_from(&self, prefix: &str, inst: &Instance, alive: Option<&HashSet<IpAddr>>) -> Member {
        let provider_state = provider_state(&inst.status);

        let internal_address = if provider_state == ProviderState::Active {
            let addr = inst.internal_address(&self.subnet);
            if addr.is_none() {
                warn!(member = %inst.name, subnet = %self.subnet, "Active member has no address in the private subnet");
            }
            addr
        } else {
            None
        };

        // Without an address the oracle has no verdict on this member
        let liveness = match (alive, internal_address) {
            (Some(set), Some(addr)) if set.contains(&addr) => LivenessState::Alive,
            (Some(_), Some(_)) => LivenessState::Dead,
            (Some(_), None) if provider_state != ProviderState::Active => LivenessState::Dead,
            _ => LivenessState::Unknown,
        };

        Member {
            name: inst.name.clone(),
            instance_id: inst.id.clone(),
            ordinal: parse_ordinal(prefix, &inst.name),
            internal_address,
            provider_state,
            liveness,
            attached_volume_id: inst.volume_ids.first().cloned(),
        }
    }
}

pub fn provider_state(status: &InstanceStatus) -> ProviderState {
    match status {
        InstanceStatus::Active => ProviderState::Active,
        InstanceStatus::Building => ProviderState::Pending,
        InstanceStatus::Deleted => ProviderState::Absent,
        InstanceStatus::Error | InstanceStatus::Shutoff | InstanceStatus::Other(_) => ProviderState::Error,
    }
}
