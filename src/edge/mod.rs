//! Edge reconfiguration
//!
//! After the worker set changes, the gateway and proxy are told about it:
//! the topology is queried fresh from the provider, rendered, shipped to
//! the gateway with the templates, and the configuration-management
//! command is run there. Any failure is fatal for the cycle; the next one
//! starts over from a fresh query.

pub mod inventory;

pub use inventory::{render_inventory, render_nodes, EdgeHost, EdgeTopology, HostAccess};

use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::{Config, ConfigError};
use crate::fleet::models::parse_ordinal;
use crate::provider::{FloatingIp, Instance, InstanceStatus, Provider, ProviderError};
use crate::relay::{shell_quote, Relay, RelayError};

pub const INVENTORY_FILE: &str = "hosts";
pub const NODES_FILE: &str = "nodes.txt";

/// Edge errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum EdgeError {
    #[error("Provider query failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("No {role} instance named '{name}'")]
    MissingHost { role: &'static str, name: String },

    #[error("{name} has no address in the private subnet")]
    NoAddress { name: String },

    #[error("{name} has no floating address")]
    NoPublicAddress { name: String },

    #[error("Failed to write {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("Transfer to the gateway failed: {0}")]
    Relay(#[from] RelayError),

    #[error("Configuration run exited with {status}: {stderr}")]
    RunFailed { status: i32, stderr: String },
}

#[derive(Debug, Clone)]
pub struct EdgeSettings {
    pub worker_prefix: String,
    pub gateway_name: String,
    pub proxy_name: String,
    pub subnet: IpNetwork,
    pub ssh_user: String,
    pub private_key_path: PathBuf,
    pub work_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub remote_dir: String,
    pub playbook_command: String,
    pub run_timeout: Duration,
}

impl EdgeSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            worker_prefix: config.fleet.worker_prefix.clone(),
            gateway_name: config.fleet.gateway_name.clone(),
            proxy_name: config.fleet.proxy_name.clone(),
            subnet: config.subnet()?,
            ssh_user: config.ssh.user.clone(),
            private_key_path: config.ssh.private_key_path.clone(),
            work_dir: config.edge.work_dir.clone(),
            templates_dir: config.edge.templates_dir.clone(),
            remote_dir: config.edge.remote_dir.clone(),
            playbook_command: config.edge.playbook_command.clone(),
            run_timeout: Duration::from_secs(config.edge.run_timeout_secs),
        })
    }

    /// Key file name; the key is shipped next to the inventory
    fn key_file(&self) -> String {
        self.private_key_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.private_key_path.display().to_string())
    }

    pub fn host_access(&self) -> HostAccess {
        HostAccess {
            user: self.ssh_user.clone(),
            key_file: self.key_file(),
        }
    }
}

pub struct EdgeReconfigurer {
    provider: Arc<dyn Provider>,
    relay: Arc<dyn Relay>,
    settings: EdgeSettings,
}

impl EdgeReconfigurer {
    pub fn new(provider: Arc<dyn Provider>, relay: Arc<dyn Relay>, settings: EdgeSettings) -> Self {
        Self {
            provider,
            relay,
            settings,
        }
    }

    pub fn settings(&self) -> &EdgeSettings {
        &self.settings
    }

    /// Query gateway, proxy and active workers from the provider
    pub async fn topology(&self) -> Result<EdgeTopology, EdgeError> {
        let mut floating: Option<Vec<FloatingIp>> = None;

        let gateway = self
            .edge_host("gateway", &self.settings.gateway_name, &mut floating)
            .await?;
        let proxy = self
            .edge_host("proxy", &self.settings.proxy_name, &mut floating)
            .await?;

        let prefix = &self.settings.worker_prefix;
        let mut workers: Vec<EdgeHost> = self
            .provider
            .list_instances(prefix)
            .await?
            .into_iter()
            .filter(|inst| inst.status == InstanceStatus::Active)
            .filter_map(|inst| {
                inst.internal_address(&self.settings.subnet).map(|internal| EdgeHost {
                    name: inst.name,
                    internal,
                    public: None,
                })
            })
            .collect();
        workers.sort_by(|a, b| {
            parse_ordinal(prefix, &a.name)
                .cmp(&parse_ordinal(prefix, &b.name))
                .then_with(|| a.name.cmp(&b.name))
        });

        Ok(EdgeTopology { gateway, proxy, workers })
    }

    /// Push the current topology to the edge and apply it
    pub async fn apply(&self) -> Result<EdgeTopology, EdgeError> {
        let started = Instant::now();
        let topology = self.topology().await?;
        let gateway = topology
            .gateway
            .public
            .ok_or_else(|| EdgeError::NoPublicAddress {
                name: topology.gateway.name.clone(),
            })?;

        let rendered = self.write_artifacts(&topology).await?;

        let mut files = rendered;
        files.push(self.settings.private_key_path.clone());
        files.push(self.settings.templates_dir.clone());

        self.relay
            .upload(gateway, &files, &self.settings.remote_dir, self.settings.run_timeout)
            .await?;
        debug!(gateway = %gateway, files = files.len(), "Edge artifacts transferred");

        let command = format!(
            "cd {} && chmod 600 {} && {}",
            shell_quote(&self.settings.remote_dir),
            shell_quote(&self.settings.key_file()),
            self.settings.playbook_command
        );
        self.run_checked(gateway, &command, self.settings.run_timeout).await?;

        info!(
            gateway = %gateway,
            workers = topology.workers.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Edge reconfigured"
        );
        Ok(topology)
    }

    /// Write `hosts` and `nodes.txt` into the work dir
    pub async fn write_artifacts(&self, topology: &EdgeTopology) -> Result<Vec<PathBuf>, EdgeError> {
        let dir = &self.settings.work_dir;
        tokio::fs::create_dir_all(dir).await.map_err(|e| io_error(dir, e))?;

        let hosts = dir.join(INVENTORY_FILE);
        let nodes = dir.join(NODES_FILE);

        write_file(&hosts, &render_inventory(topology, &self.settings.host_access())).await?;
        write_file(&nodes, &render_nodes(topology)).await?;

        Ok(vec![hosts, nodes])
    }

    async fn run_checked(&self, host: IpAddr, command: &str, timeout: Duration) -> Result<(), EdgeError> {
        let output = self.relay.run(host, command, timeout).await?;
        if !output.success() {
            return Err(EdgeError::RunFailed {
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn edge_host(
        &self,
        role: &'static str,
        name: &str,
        floating: &mut Option<Vec<FloatingIp>>,
    ) -> Result<EdgeHost, EdgeError> {
        let inst: Instance = self
            .provider
            .list_instances(name)
            .await?
            .into_iter()
            .find(|inst| inst.name == name)
            .ok_or_else(|| EdgeError::MissingHost {
                role,
                name: name.to_string(),
            })?;

        let internal = inst
            .internal_address(&self.settings.subnet)
            .ok_or_else(|| EdgeError::NoAddress { name: name.to_string() })?;

        // Some clouds omit floating addresses from the server record
        let public = match inst.floating_address() {
            Some(addr) => Some(addr),
            None => {
                if floating.is_none() {
                    *floating = Some(self.provider.list_floating_ips().await?);
                }
                floating
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .find(|f| f.fixed_ip == Some(internal))
                    .map(|f| f.floating_ip)
            }
        };

        Ok(EdgeHost { name: inst.name, internal, public })
    }
}

async fn write_file(path: &Path, contents: &str) -> Result<(), EdgeError> {
    tokio::fs::write(path, contents).await.map_err(|e| io_error(path, e))
}

fn io_error(path: &Path, e: std::io::Error) -> EdgeError {
    EdgeError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{edge_settings, FakeProvider, FakeRelay};

    fn edge(provider: &Arc<FakeProvider>, relay: &Arc<FakeRelay>, work_dir: &Path) -> EdgeReconfigurer {
        EdgeReconfigurer::new(provider.clone(), relay.clone(), edge_settings(work_dir))
    }

    fn fleet() -> Arc<FakeProvider> {
        let provider = Arc::new(FakeProvider::new());
        provider.add_edge_host("bastion", "10.10.0.3", Some("203.0.113.1"));
        provider.add_edge_host("proxy", "10.10.0.4", Some("203.0.113.2"));
        provider.add_active("node4", "10.10.0.14");
        provider.add_active("node1", "10.10.0.11");
        provider.add_instance("node7", InstanceStatus::Building, None);
        provider
    }

    #[tokio::test]
    async fn test_topology_lists_active_workers_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let provider = fleet();
        let relay = Arc::new(FakeRelay::new());

        let topo = edge(&provider, &relay, dir.path()).topology().await.unwrap();

        assert_eq!(topo.gateway.public, Some("203.0.113.1".parse().unwrap()));
        assert_eq!(topo.proxy.internal, "10.10.0.4".parse::<IpAddr>().unwrap());
        let names: Vec<&str> = topo.workers.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["node1", "node4"]);
    }

    #[tokio::test]
    async fn test_public_address_from_floating_ip_listing() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeProvider::new());
        provider.add_edge_host("bastion", "10.10.0.3", None);
        provider.add_edge_host("proxy", "10.10.0.4", None);
        provider.add_floating_ip("198.51.100.7", "10.10.0.3");
        let relay = Arc::new(FakeRelay::new());

        let topo = edge(&provider, &relay, dir.path()).topology().await.unwrap();

        assert_eq!(topo.gateway.public, Some("198.51.100.7".parse().unwrap()));
        assert_eq!(topo.proxy.public, None);
    }

    #[tokio::test]
    async fn test_missing_proxy_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeProvider::new());
        provider.add_edge_host("bastion", "10.10.0.3", Some("203.0.113.1"));
        let relay = Arc::new(FakeRelay::new());

        let err = edge(&provider, &relay, dir.path()).topology().await.unwrap_err();
        assert!(matches!(err, EdgeError::MissingHost { role: "proxy", .. }));
    }

    #[tokio::test]
    async fn test_apply_ships_artifacts_and_runs_playbook() {
        let dir = tempfile::tempdir().unwrap();
        let provider = fleet();
        let relay = Arc::new(FakeRelay::new());

        edge(&provider, &relay, dir.path()).apply().await.unwrap();

        let nodes = std::fs::read_to_string(dir.path().join(NODES_FILE)).unwrap();
        assert_eq!(nodes, "10.10.0.11\n10.10.0.14\n");
        let hosts = std::fs::read_to_string(dir.path().join(INVENTORY_FILE)).unwrap();
        assert!(hosts.contains("node4 ansible_host=10.10.0.14"));

        let uploads = relay.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "203.0.113.1".parse::<IpAddr>().unwrap());
        assert_eq!(uploads[0].1.len(), 4);

        let runs = relay.runs();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].1.starts_with("cd 'fleet-steward' && chmod 600 'steward-key'"));
        assert!(runs[0].1.ends_with("ansible-playbook -i hosts site.yaml"));
    }

    #[tokio::test]
    async fn test_failed_run_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = fleet();
        let relay = Arc::new(FakeRelay::new());
        relay.fail_runs(true);

        let err = edge(&provider, &relay, dir.path()).apply().await.unwrap_err();
        assert!(matches!(err, EdgeError::RunFailed { .. }));
    }

    #[tokio::test]
    async fn test_failed_upload_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = fleet();
        let relay = Arc::new(FakeRelay::new());
        relay.fail_uploads(true);

        let err = edge(&provider, &relay, dir.path()).apply().await.unwrap_err();
        assert!(matches!(err, EdgeError::Relay(_)));
        assert!(relay.runs().is_empty(), "playbook must not run after a failed transfer");
    }
}
