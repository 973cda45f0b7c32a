//! Steward configuration

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub edge: EdgeConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

/// OpenStack credentials and endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Identity (Keystone v3) endpoint
    #[serde(default = "default_auth_url")]
    pub auth_url: String,

    #[serde(default = "default_admin")]
    pub username: String,

    /// Usually supplied through `OS_PASSWORD` instead
    #[serde(default)]
    pub password: String,

    #[serde(default = "default_admin")]
    pub project_name: String,

    #[serde(default = "default_domain")]
    pub user_domain: String,

    #[serde(default = "default_domain")]
    pub project_domain: String,

    /// Region used to pick catalog endpoints (any region when unset)
    #[serde(default)]
    pub region: Option<String>,

    /// Catalog endpoint interface
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Endpoint overrides, skipping the service catalog
    #[serde(default)]
    pub compute_url: Option<String>,
    #[serde(default)]
    pub volume_url: Option<String>,
    #[serde(default)]
    pub network_url: Option<String>,

    /// Timeout for a single API request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Fleet shape and worker template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Worker names are this prefix followed by an ordinal
    #[serde(default = "default_worker_prefix")]
    pub worker_prefix: String,

    #[serde(default = "default_gateway_name")]
    pub gateway_name: String,

    #[serde(default = "default_proxy_name")]
    pub proxy_name: String,

    /// One-line file holding the desired worker count
    #[serde(default = "default_desired_count_file")]
    pub desired_count_file: PathBuf,

    /// Used when the desired count file is absent
    #[serde(default = "default_desired_count")]
    pub default_desired_count: usize,

    /// Flavor name or id
    #[serde(default = "default_flavor")]
    pub flavor: String,

    /// Base image the boot volumes are created from
    #[serde(default)]
    pub image_id: String,

    #[serde(default = "default_volume_size")]
    pub volume_size_gb: u32,

    #[serde(default = "default_key_name")]
    pub key_name: String,

    /// Private network the workers attach to
    #[serde(default)]
    pub network_id: String,

    /// CIDR of the private subnet; selects the internal address
    #[serde(default = "default_subnet_cidr")]
    pub subnet_cidr: String,

    #[serde(default = "default_security_group")]
    pub security_group: String,

    /// Tag applied to every instance and volume we create
    #[serde(default = "default_tag")]
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,

    #[serde(default = "default_private_key")]
    pub private_key_path: PathBuf,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Liveness prober, as reachable from the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default = "default_oracle_url")]
    pub url: String,

    #[serde(default = "default_oracle_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Local directory the inventory is rendered into
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Fixed configuration templates shipped with every run
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,

    /// Destination directory on the gateway
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,

    /// Command run on the gateway from `remote_dir`
    #[serde(default = "default_playbook_command")]
    pub playbook_command: String,

    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
}

/// Loop pacing and bounded-wait limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_cycle_pause")]
    pub cycle_pause_secs: u64,

    /// Pause after a failed cycle
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,

    /// Wait after startup checks, before the first cycle
    #[serde(default = "default_warmup")]
    pub warmup_secs: u64,

    /// Concurrent provisioning/teardown units per cycle
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_volume_timeout")]
    pub volume_timeout_secs: u64,

    #[serde(default = "default_instance_timeout")]
    pub instance_timeout_secs: u64,

    #[serde(default = "default_ssh_ready_timeout")]
    pub ssh_ready_timeout_secs: u64,

    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Decide and log, never act
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            auth_url: default_auth_url(),
            username: default_admin(),
            password: String::new(),
            project_name: default_admin(),
            user_domain: default_domain(),
            project_domain: default_domain(),
            region: None,
            interface: default_interface(),
            compute_url: None,
            volume_url: None,
            network_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            worker_prefix: default_worker_prefix(),
            gateway_name: default_gateway_name(),
            proxy_name: default_proxy_name(),
            desired_count_file: default_desired_count_file(),
            default_desired_count: default_desired_count(),
            flavor: default_flavor(),
            image_id: String::new(),
            volume_size_gb: default_volume_size(),
            key_name: default_key_name(),
            network_id: String::new(),
            subnet_cidr: default_subnet_cidr(),
            security_group: default_security_group(),
            tag: default_tag(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            private_key_path: default_private_key(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            url: default_oracle_url(),
            timeout_secs: default_oracle_timeout(),
        }
    }
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            templates_dir: default_templates_dir(),
            remote_dir: default_remote_dir(),
            playbook_command: default_playbook_command(),
            run_timeout_secs: default_run_timeout(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            cycle_pause_secs: default_cycle_pause(),
            error_backoff_secs: default_error_backoff(),
            warmup_secs: default_warmup(),
            max_parallel: default_max_parallel(),
            poll_interval_secs: default_poll_interval(),
            volume_timeout_secs: default_volume_timeout(),
            instance_timeout_secs: default_instance_timeout(),
            ssh_ready_timeout_secs: default_ssh_ready_timeout(),
            startup_timeout_secs: default_startup_timeout(),
            dry_run: false,
        }
    }
}

// Defaults
fn default_auth_url() -> String { "http://localhost:5000/v3".to_string() }
fn default_admin() -> String { "admin".to_string() }
fn default_domain() -> String { "Default".to_string() }
fn default_interface() -> String { "public".to_string() }
fn default_request_timeout() -> u64 { 30 }
fn default_worker_prefix() -> String { "node".to_string() }
fn default_gateway_name() -> String { "bastion".to_string() }
fn default_proxy_name() -> String { "proxy".to_string() }
fn default_desired_count_file() -> PathBuf { PathBuf::from("servers.conf") }
fn default_desired_count() -> usize { 3 }
fn default_flavor() -> String { "1C-2GB-50GB".to_string() }
fn default_volume_size() -> u32 { 10 }
fn default_key_name() -> String { "steward-key".to_string() }
fn default_subnet_cidr() -> String { "10.10.0.0/24".to_string() }
fn default_security_group() -> String { "default".to_string() }
fn default_tag() -> String { "fleet-steward".to_string() }
fn default_ssh_user() -> String { "ubuntu".to_string() }
fn default_private_key() -> PathBuf { PathBuf::from("steward-key") }
fn default_connect_timeout() -> u64 { 10 }
fn default_oracle_url() -> String { "http://localhost:5000/".to_string() }
fn default_oracle_timeout() -> u64 { 10 }
fn default_work_dir() -> PathBuf { PathBuf::from("/var/lib/fleet-steward") }
fn default_templates_dir() -> PathBuf { PathBuf::from("templates") }
fn default_remote_dir() -> String { "fleet-steward".to_string() }
fn default_playbook_command() -> String { "ansible-playbook -i hosts site.yaml".to_string() }
fn default_run_timeout() -> u64 { 900 }
fn default_cycle_pause() -> u64 { 30 }
fn default_error_backoff() -> u64 { 60 }
fn default_warmup() -> u64 { 10 }
fn default_max_parallel() -> usize { 4 }
fn default_poll_interval() -> u64 { 5 }
fn default_volume_timeout() -> u64 { 300 }
fn default_instance_timeout() -> u64 { 300 }
fn default_ssh_ready_timeout() -> u64 { 180 }
fn default_startup_timeout() -> u64 { 120 }

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Load from a TOML file, or defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Reject settings the control loop cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fleet.worker_prefix.is_empty() {
            return Err(ConfigError::Invalid("fleet.worker_prefix is empty".to_string()));
        }
        if self.control.max_parallel == 0 {
            return Err(ConfigError::Invalid("control.max_parallel must be at least 1".to_string()));
        }
        if self.control.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("control.poll_interval_secs must be at least 1".to_string()));
        }
        self.subnet()?;
        Ok(())
    }

    /// The private subnet as a network, for address membership tests
    pub fn subnet(&self) -> Result<IpNetwork, ConfigError> {
        self.fleet.subnet_cidr.parse().map_err(|e| {
            ConfigError::Invalid(format!(
                "fleet.subnet_cidr '{}': {}",
                self.fleet.subnet_cidr, e
            ))
        })
    }
}

impl ControlConfig {
    pub fn cycle_pause(&self) -> Duration { Duration::from_secs(self.cycle_pause_secs) }
    pub fn error_backoff(&self) -> Duration { Duration::from_secs(self.error_backoff_secs) }
    pub fn warmup(&self) -> Duration { Duration::from_secs(self.warmup_secs) }
    pub fn poll_interval(&self) -> Duration { Duration::from_secs(self.poll_interval_secs) }
}

/// Read the desired worker count, re-read every cycle.
///
/// A missing file yields `default`; a file that does not hold a single
/// non-negative integer is an error rather than a silent resize.
pub fn read_desired_count(path: &Path, default: usize) -> Result<usize, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(default),
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        }
    };

    let line = content.lines().map(str::trim).find(|l| !l.is_empty());
    match line {
        None => Ok(default),
        Some(line) => line.parse().map_err(|_| ConfigError::Parse {
            path: path.display().to_string(),
            reason: format!("expected a worker count, got '{}'", line),
        }),
    }
}
