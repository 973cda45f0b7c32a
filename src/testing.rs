//! In-memory fakes for the provider, oracle and relay seams

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::edge::EdgeSettings;
use crate::fleet::executor::ExecutorSettings;
use crate::oracle::{HealthOracle, OracleError};
use crate::provider::{
    AddressKind, FloatingIp, Instance, InstanceAddress, InstanceStatus, NewInstance, NewVolume, Provider,
    ProviderError, Volume, VolumeStatus,
};
use crate::relay::{Relay, RelayError, RemoteOutput};

pub const SUBNET: &str = "10.10.0.0/24";

pub fn test_settings() -> ExecutorSettings {
    ExecutorSettings {
        prefix: "node".to_string(),
        flavor: "small".to_string(),
        image_id: "img-1".to_string(),
        volume_size_gb: 10,
        key_name: "steward-key".to_string(),
        network_id: "net-1".to_string(),
        security_group: "default".to_string(),
        tag: "fleet-steward".to_string(),
        subnet: SUBNET.parse().unwrap(),
        max_parallel: 4,
        poll_interval: Duration::from_secs(5),
        volume_timeout: Duration::from_secs(60),
        instance_timeout: Duration::from_secs(60),
        ssh_ready_timeout: Duration::from_secs(60),
        probe_timeout: Duration::from_secs(15),
    }
}

pub fn edge_settings(work_dir: &Path) -> EdgeSettings {
    EdgeSettings {
        worker_prefix: "node".to_string(),
        gateway_name: "bastion".to_string(),
        proxy_name: "proxy".to_string(),
        subnet: SUBNET.parse().unwrap(),
        ssh_user: "ubuntu".to_string(),
        private_key_path: PathBuf::from("/etc/fleet-steward/steward-key"),
        work_dir: work_dir.to_path_buf(),
        templates_dir: PathBuf::from("templates"),
        remote_dir: "fleet-steward".to_string(),
        playbook_command: "ansible-playbook -i hosts site.yaml".to_string(),
        run_timeout: Duration::from_secs(60),
    }
}

//=============================================================================
// PROVIDER
//=============================================================================

#[derive(Default)]
struct ProviderState {
    instances: Vec<Instance>,
    volumes: Vec<Volume>,
    floating: Vec<FloatingIp>,
    next_id: u32,
    hosts_assigned: usize,

    fail_listing: bool,
    fail_instance_create: bool,
    fail_instance_delete: bool,
    stall_volumes: bool,
    stalled_volume_names: HashSet<String>,
    stall_instances: bool,
    sticky_volume_errors: bool,

    instance_create_calls: usize,
    instance_delete_calls: usize,
    volume_create_calls: usize,
    volume_delete_calls: usize,
}

/// Provider whose resources settle on the first look.
///
/// New volumes turn available and new instances active the first time
/// they are shown, unless stalled. Instance deletion is immediate and
/// detaches the boot volume.
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<ProviderState>,
}

fn fixed(addr: &str) -> InstanceAddress {
    InstanceAddress {
        network: "private".to_string(),
        addr: addr.parse().unwrap(),
        kind: AddressKind::Fixed,
    }
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Active worker with volume `vol-<name>` attached
    pub fn add_active(&self, name: &str, addr: &str) {
        let mut state = self.state.lock().unwrap();
        state.volumes.push(Volume {
            id: format!("vol-{}", name),
            name: format!("{}-vol", name),
            status: VolumeStatus::InUse,
        });
        state.instances.push(Instance {
            id: format!("id-{}", name),
            name: name.to_string(),
            status: InstanceStatus::Active,
            addresses: vec![fixed(addr)],
            volume_ids: vec![format!("vol-{}", name)],
        });
    }

    pub fn add_instance(&self, name: &str, status: InstanceStatus, addr: Option<&str>) {
        self.state.lock().unwrap().instances.push(Instance {
            id: format!("id-{}", name),
            name: name.to_string(),
            status,
            addresses: addr.map(fixed).into_iter().collect(),
            volume_ids: vec![],
        });
    }

    /// Gateway or proxy, optionally with a floating address on the record
    pub fn add_edge_host(&self, name: &str, internal: &str, public: Option<&str>) {
        let mut addresses = vec![fixed(internal)];
        if let Some(public) = public {
            addresses.push(InstanceAddress {
                network: "private".to_string(),
                addr: public.parse().unwrap(),
                kind: AddressKind::Floating,
            });
        }
        self.state.lock().unwrap().instances.push(Instance {
            id: format!("id-{}", name),
            name: name.to_string(),
            status: InstanceStatus::Active,
            addresses,
            volume_ids: vec![],
        });
    }

    pub fn add_floating_ip(&self, floating: &str, fixed: &str) {
        let mut state = self.state.lock().unwrap();
        let id = format!("fip-{}", state.floating.len());
        state.floating.push(FloatingIp {
            id,
            floating_ip: floating.parse().unwrap(),
            fixed_ip: Some(fixed.parse().unwrap()),
            port_id: None,
        });
    }

    pub fn fail_listing(&self, fail: bool) {
        self.state.lock().unwrap().fail_listing = fail;
    }

    pub fn fail_instance_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_instance_create = fail;
    }

    pub fn fail_instance_delete(&self, fail: bool) {
        self.state.lock().unwrap().fail_instance_delete = fail;
    }

    /// New volumes never leave `creating`
    pub fn stall_volumes(&self, stall: bool) {
        self.state.lock().unwrap().stall_volumes = stall;
    }

    /// Keep only the named volume in `creating`
    pub fn stall_volume(&self, name: &str) {
        self.state.lock().unwrap().stalled_volume_names.insert(name.to_string());
    }

    /// New instances never leave `BUILD`
    pub fn stall_instances(&self, stall: bool) {
        self.state.lock().unwrap().stall_instances = stall;
    }

    /// Volume deletes land in `error_deleting` instead of removing it
    pub fn sticky_volume_errors(&self, sticky: bool) {
        self.state.lock().unwrap().sticky_volume_errors = sticky;
    }

    pub fn instance_named(&self, name: &str) -> Option<Instance> {
        self.state
            .lock()
            .unwrap()
            .instances
            .iter()
            .find(|i| i.name == name)
            .cloned()
    }

    /// Names of active instances under a prefix, sorted
    pub fn active_names(&self, prefix: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state
            .instances
            .iter()
            .filter(|i| i.name.starts_with(prefix) && i.status == InstanceStatus::Active)
            .map(|i| i.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn volume_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state.volumes.iter().map(|v| v.name.clone()).collect();
        names.sort();
        names
    }

    pub fn instance_create_calls(&self) -> usize {
        self.state.lock().unwrap().instance_create_calls
    }

    pub fn instance_delete_calls(&self) -> usize {
        self.state.lock().unwrap().instance_delete_calls
    }

    pub fn volume_create_calls(&self) -> usize {
        self.state.lock().unwrap().volume_create_calls
    }

    pub fn volume_delete_calls(&self) -> usize {
        self.state.lock().unwrap().volume_delete_calls
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn list_instances(&self, name_prefix: &str) -> Result<Vec<Instance>, ProviderError> {
        let state = self.state.lock().unwrap();
        if state.fail_listing {
            return Err(ProviderError::Network("connection refused".to_string()));
        }
        Ok(state
            .instances
            .iter()
            .filter(|i| i.name.starts_with(name_prefix))
            .cloned()
            .collect())
    }

    async fn show_instance(&self, id: &str) -> Result<Option<Instance>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        let stall = state.stall_instances;
        let next_host = 100 + state.hosts_assigned;

        let Some(inst) = state.instances.iter_mut().find(|i| i.id == id) else {
            return Ok(None);
        };
        if inst.status != InstanceStatus::Building || stall {
            return Ok(Some(inst.clone()));
        }
        inst.status = InstanceStatus::Active;
        inst.addresses.push(fixed(&format!("10.10.0.{}", next_host)));
        let shown = inst.clone();
        state.hosts_assigned += 1;
        Ok(Some(shown))
    }

    async fn create_instance(&self, spec: &NewInstance) -> Result<String, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.instance_create_calls += 1;
        if state.fail_instance_create {
            return Err(ProviderError::Http {
                operation: "create server".to_string(),
                status: 403,
                body: "Quota exceeded for cores".to_string(),
            });
        }

        state.next_id += 1;
        let id = format!("srv-{}", state.next_id);
        if let Some(vol) = state.volumes.iter_mut().find(|v| v.id == spec.boot_volume_id) {
            vol.status = VolumeStatus::InUse;
        }
        state.instances.push(Instance {
            id: id.clone(),
            name: spec.name.clone(),
            status: InstanceStatus::Building,
            addresses: vec![],
            volume_ids: vec![spec.boot_volume_id.clone()],
        });
        Ok(id)
    }

    async fn delete_instance(&self, id: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.instance_delete_calls += 1;
        if state.fail_instance_delete {
            return Err(ProviderError::Http {
                operation: "delete server".to_string(),
                status: 403,
                body: "locked".to_string(),
            });
        }

        let Some(pos) = state.instances.iter().position(|i| i.id == id) else {
            return Ok(());
        };
        let inst = state.instances.remove(pos);
        for vol in state.volumes.iter_mut().filter(|v| inst.volume_ids.contains(&v.id)) {
            vol.status = VolumeStatus::Available;
        }
        Ok(())
    }

    async fn create_volume(&self, spec: &NewVolume) -> Result<String, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.volume_create_calls += 1;
        state.next_id += 1;
        let id = format!("vol-{}", state.next_id);
        state.volumes.push(Volume {
            id: id.clone(),
            name: spec.name.clone(),
            status: VolumeStatus::Creating,
        });
        Ok(id)
    }

    async fn show_volume(&self, id: &str) -> Result<Option<Volume>, ProviderError> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let Some(vol) = state.volumes.iter_mut().find(|v| v.id == id) else {
            return Ok(None);
        };
        let stall = state.stall_volumes || state.stalled_volume_names.contains(&vol.name);
        if vol.status == VolumeStatus::Creating && !stall {
            vol.status = VolumeStatus::Available;
        }
        Ok(Some(vol.clone()))
    }

    async fn find_volume(&self, name: &str) -> Result<Option<Volume>, ProviderError> {
        let state = self.state.lock().unwrap();
        Ok(state.volumes.iter().find(|v| v.name == name).cloned())
    }

    async fn delete_volume(&self, id: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.volume_delete_calls += 1;
        let sticky = state.sticky_volume_errors;

        let Some(pos) = state.volumes.iter().position(|v| v.id == id) else {
            return Ok(());
        };
        if state.volumes[pos].status == VolumeStatus::InUse {
            return Err(ProviderError::Http {
                operation: "delete volume".to_string(),
                status: 400,
                body: "Volume is attached".to_string(),
            });
        }
        if sticky {
            state.volumes[pos].status = VolumeStatus::ErrorDeleting;
        } else {
            state.volumes.remove(pos);
        }
        Ok(())
    }

    async fn list_floating_ips(&self) -> Result<Vec<FloatingIp>, ProviderError> {
        Ok(self.state.lock().unwrap().floating.clone())
    }
}

//=============================================================================
// ORACLE
//=============================================================================

pub struct FakeOracle {
    alive: Option<HashSet<IpAddr>>,
}

impl FakeOracle {
    pub fn alive(addresses: &[&str]) -> Self {
        Self {
            alive: Some(addresses.iter().map(|a| a.parse().unwrap()).collect()),
        }
    }

    pub fn unreachable() -> Self {
        Self { alive: None }
    }
}

#[async_trait]
impl HealthOracle for FakeOracle {
    async fn alive(&self) -> Result<HashSet<IpAddr>, OracleError> {
        self.alive.clone().ok_or(OracleError::Request {
            status: 7,
            stderr: "Failed to connect".to_string(),
        })
    }
}

//=============================================================================
// RELAY
//=============================================================================

#[derive(Default)]
struct RelayState {
    refuse_probes: bool,
    unreachable: bool,
    fail_runs: bool,
    fail_uploads: bool,
    probes: Vec<(IpAddr, IpAddr)>,
    runs: Vec<(IpAddr, String)>,
    uploads: Vec<(IpAddr, Vec<PathBuf>, String)>,
}

/// Relay that records every call and succeeds unless told otherwise
#[derive(Default)]
pub struct FakeRelay {
    state: Mutex<RelayState>,
}

impl FakeRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_probes(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_probes = refuse;
    }

    pub fn unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    pub fn fail_runs(&self, fail: bool) {
        self.state.lock().unwrap().fail_runs = fail;
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.state.lock().unwrap().fail_uploads = fail;
    }

    pub fn probes(&self) -> Vec<(IpAddr, IpAddr)> {
        self.state.lock().unwrap().probes.clone()
    }

    pub fn runs(&self) -> Vec<(IpAddr, String)> {
        self.state.lock().unwrap().runs.clone()
    }

    pub fn uploads(&self) -> Vec<(IpAddr, Vec<PathBuf>, String)> {
        self.state.lock().unwrap().uploads.clone()
    }
}

#[async_trait]
impl Relay for FakeRelay {
    async fn run(&self, host: IpAddr, command: &str, _timeout: Duration) -> Result<RemoteOutput, RelayError> {
        let mut state = self.state.lock().unwrap();
        state.runs.push((host, command.to_string()));
        if state.fail_runs {
            return Ok(RemoteOutput {
                status: 2,
                stdout: String::new(),
                stderr: "fatal: [proxy]: UNREACHABLE!".to_string(),
            });
        }
        Ok(RemoteOutput {
            status: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn probe_via(&self, gateway: IpAddr, target: IpAddr, _timeout: Duration) -> Result<bool, RelayError> {
        let mut state = self.state.lock().unwrap();
        state.probes.push((gateway, target));
        Ok(!state.refuse_probes)
    }

    async fn reachable(&self, _host: IpAddr, _timeout: Duration) -> Result<bool, RelayError> {
        Ok(!self.state.lock().unwrap().unreachable)
    }

    async fn upload(&self, host: IpAddr, local: &[PathBuf], remote_dir: &str, _timeout: Duration) -> Result<(), RelayError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_uploads {
            return Err(RelayError::CopyFailed {
                host,
                stderr: "Connection closed".to_string(),
            });
        }
        state.uploads.push((host, local.to_vec(), remote_dir.to_string()));
        Ok(())
    }
}
