//! Provider - typed client boundary for the cloud control plane
//!
//! The control loop only ever talks to the cloud through the [`Provider`]
//! trait. Responses are normalized into the records below so nothing
//! upstream parses free text.
//!
//! The client holds no fleet state between calls; every cycle re-observes.

pub mod openstack;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

pub use openstack::OpenStackClient;

/// Compute instance as reported by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub status: InstanceStatus,
    pub addresses: Vec<InstanceAddress>,
    /// Volumes currently attached, boot volume first
    pub volume_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Active,
    /// Any transitional status (BUILD, REBOOT, RESIZE, ...)
    Building,
    Error,
    Shutoff,
    Deleted,
    Other(String),
}

impl InstanceStatus {
    pub fn parse(status: &str) -> Self {
        match status.to_ascii_uppercase().as_str() {
            "ACTIVE" => Self::Active,
            "BUILD" | "REBUILD" | "REBOOT" | "HARD_REBOOT" | "RESIZE" | "VERIFY_RESIZE"
            | "MIGRATING" | "PASSWORD" => Self::Building,
            "ERROR" => Self::Error,
            "SHUTOFF" => Self::Shutoff,
            "DELETED" | "SOFT_DELETED" => Self::Deleted,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressKind {
    Fixed,
    Floating,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceAddress {
    pub network: String,
    pub addr: IpAddr,
    pub kind: AddressKind,
}

impl Instance {
    /// First address that lies inside the private subnet
    pub fn internal_address(&self, subnet: &IpNetwork) -> Option<IpAddr> {
        self.addresses
            .iter()
            .map(|a| a.addr)
            .find(|addr| subnet.contains(*addr))
    }

    /// First floating address attached to the instance
    pub fn floating_address(&self) -> Option<IpAddr> {
        self.addresses
            .iter()
            .find(|a| a.kind == AddressKind::Floating)
            .map(|a| a.addr)
    }
}

/// Block volume as reported by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub status: VolumeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeStatus {
    Creating,
    Downloading,
    Available,
    InUse,
    Attaching,
    Detaching,
    Deleting,
    Error,
    ErrorDeleting,
    Other(String),
}

impl VolumeStatus {
    pub fn parse(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "creating" => Self::Creating,
            "downloading" => Self::Downloading,
            "available" => Self::Available,
            "in-use" => Self::InUse,
            "attaching" | "reserved" => Self::Attaching,
            "detaching" => Self::Detaching,
            "deleting" => Self::Deleting,
            "error" => Self::Error,
            "error_deleting" => Self::ErrorDeleting,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Floating (public) address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatingIp {
    pub id: String,
    pub floating_ip: IpAddr,
    pub fixed_ip: Option<IpAddr>,
    pub port_id: Option<String>,
}

/// Boot volume request
#[derive(Debug, Clone, PartialEq)]
pub struct NewVolume {
    pub name: String,
    pub size_gb: u32,
    pub image_id: String,
    pub tag: String,
}

/// Instance request; boots from an existing volume
#[derive(Debug, Clone, PartialEq)]
pub struct NewInstance {
    pub name: String,
    pub flavor: String,
    pub key_name: String,
    pub network_id: String,
    pub security_group: String,
    pub tag: String,
    pub boot_volume_id: String,
}

/// Cloud control plane operations used by the control loop.
///
/// Deletes of resources that are already gone succeed; `show_*` returns
/// `None` for a resource the provider does not know.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Instances whose name starts with `name_prefix`, any status
    async fn list_instances(&self, name_prefix: &str) -> Result<Vec<Instance>, ProviderError>;

    async fn show_instance(&self, id: &str) -> Result<Option<Instance>, ProviderError>;

    /// Returns the new instance id; the instance is usually still building
    async fn create_instance(&self, spec: &NewInstance) -> Result<String, ProviderError>;

    async fn delete_instance(&self, id: &str) -> Result<(), ProviderError>;

    /// Returns the new volume id; the volume is usually still creating
    async fn create_volume(&self, spec: &NewVolume) -> Result<String, ProviderError>;

    async fn show_volume(&self, id: &str) -> Result<Option<Volume>, ProviderError>;

    async fn find_volume(&self, name: &str) -> Result<Option<Volume>, ProviderError>;

    async fn delete_volume(&self, id: &str) -> Result<(), ProviderError>;

    async fn list_floating_ips(&self) -> Result<Vec<FloatingIp>, ProviderError>;
}

/// Provider errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("{operation} returned HTTP {status}: {body}")]
    Http {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {operation}: {reason}")]
    InvalidResponse { operation: String, reason: String },

    #[error("No '{0}' endpoint in the service catalog")]
    NoEndpoint(String),

    #[error("Unknown flavor '{0}'")]
    UnknownFlavor(String),
}

impl ProviderError {
    /// Worth retrying within the same bounded wait
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 409 || *status == 429,
            _ => false,
        }
    }
}

/// Name of the boot volume owned by a member
pub fn boot_volume_name(member: &str) -> String {
    format!("{}-vol", member)
}
