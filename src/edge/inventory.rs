//! Inventory rendering
//!
//! Two artifacts describe the topology to the edge:
//! - `hosts`: INI inventory for the configuration-management run
//! - `nodes.txt`: worker addresses for the health prober

use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::net::IpAddr;

/// A host as the edge sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeHost {
    pub name: String,
    /// Address inside the private subnet
    pub internal: IpAddr,
    /// Floating address, gateway and proxy only
    pub public: Option<IpAddr>,
}

/// Gateway, proxy and the active workers behind them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeTopology {
    pub gateway: EdgeHost,
    pub proxy: EdgeHost,
    /// Ordinal order
    pub workers: Vec<EdgeHost>,
}

/// Connection settings written into every host line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAccess {
    pub user: String,
    /// Key path as seen from where the playbook runs
    pub key_file: String,
}

/// Render the INI inventory.
///
/// ```text
/// [gateway]
/// bastion ansible_host=10.10.0.3 ansible_user=ubuntu ansible_ssh_private_key_file=key public_ip=203.0.113.1
/// ```
pub fn render_inventory(topology: &EdgeTopology, access: &HostAccess) -> String {
    let mut out = String::new();

    section(&mut out, "gateway", std::slice::from_ref(&topology.gateway), access);
    section(&mut out, "proxy", std::slice::from_ref(&topology.proxy), access);
    section(&mut out, "workers", &topology.workers, access);

    out.push_str("[cluster:children]\ngateway\nproxy\nworkers\n");
    out
}

/// One worker internal address per line
pub fn render_nodes(topology: &EdgeTopology) -> String {
    topology
        .workers
        .iter()
        .map(|w| format!("{}\n", w.internal))
        .collect()
}

fn section(out: &mut String, role: &str, hosts: &[EdgeHost], access: &HostAccess) {
    let _ = writeln!(out, "[{}]", role);
    for host in hosts {
        let _ = write!(
            out,
            "{} ansible_host={} ansible_user={} ansible_ssh_private_key_file={}",
            host.name, host.internal, access.user, access.key_file
        );
        if let Some(public) = host.public {
            let _ = write!(out, " public_ip={}", public);
        }
        out.push('\n');
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str, internal: &str, public: Option<&str>) -> EdgeHost {
        EdgeHost {
            name: name.to_string(),
            internal: internal.parse().unwrap(),
            public: public.map(|p| p.parse().unwrap()),
        }
    }

    fn topology() -> EdgeTopology {
        EdgeTopology {
            gateway: host("bastion", "10.10.0.3", Some("203.0.113.1")),
            proxy: host("proxy", "10.10.0.4", Some("203.0.113.2")),
            workers: vec![host("node1", "10.10.0.11", None), host("node4", "10.10.0.14", None)],
        }
    }

    fn access() -> HostAccess {
        HostAccess {
            user: "ubuntu".to_string(),
            key_file: "steward-key".to_string(),
        }
    }

    #[test]
    fn test_render_inventory() {
        let expected = "\
[gateway]
bastion ansible_host=10.10.0.3 ansible_user=ubuntu ansible_ssh_private_key_file=steward-key public_ip=203.0.113.1

[proxy]
proxy ansible_host=10.10.0.4 ansible_user=ubuntu ansible_ssh_private_key_file=steward-key public_ip=203.0.113.2

[workers]
node1 ansible_host=10.10.0.11 ansible_user=ubuntu ansible_ssh_private_key_file=steward-key
node4 ansible_host=10.10.0.14 ansible_user=ubuntu ansible_ssh_private_key_file=steward-key

[cluster:children]
gateway
proxy
workers
";
        assert_eq!(render_inventory(&topology(), &access()), expected);
    }

    #[test]
    fn test_render_inventory_without_workers() {
        let mut topo = topology();
        topo.workers.clear();

        let rendered = render_inventory(&topo, &access());
        assert!(rendered.contains("[workers]\n\n[cluster:children]"));
    }

    #[test]
    fn test_render_nodes() {
        assert_eq!(render_nodes(&topology()), "10.10.0.11\n10.10.0.14\n");

        let mut topo = topology();
        topo.workers.clear();
        assert_eq!(render_nodes(&topo), "");
    }
}
