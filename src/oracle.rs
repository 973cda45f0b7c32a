//! Health oracle - independent liveness verdicts for workers
//!
//! The prober runs inside the private network and answers an HTTP GET with
//! one `address:STATE` line per worker. We fetch it through the gateway.

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::OracleConfig;
use crate::relay::{Relay, RelayError};

#[async_trait]
pub trait HealthOracle: Send + Sync {
    /// Internal addresses currently reported alive
    async fn alive(&self) -> Result<HashSet<IpAddr>, OracleError>;
}

/// Oracle errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum OracleError {
    #[error("Gateway unreachable: {0}")]
    Relay(#[from] RelayError),

    #[error("Prober request failed with exit status {status}: {stderr}")]
    Request { status: i32, stderr: String },
}

/// Oracle queried with `curl` on the gateway host
pub struct GatewayOracle {
    relay: Arc<dyn Relay>,
    gateway: IpAddr,
    url: String,
    timeout: Duration,
}

impl GatewayOracle {
    pub fn new(relay: Arc<dyn Relay>, gateway: IpAddr, config: &OracleConfig) -> Self {
        Self {
            relay,
            gateway,
            url: config.url.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl HealthOracle for GatewayOracle {
    async fn alive(&self) -> Result<HashSet<IpAddr>, OracleError> {
        let command = format!("curl -fsS --max-time {} '{}'", self.timeout.as_secs(), self.url);
        // Leave room for the SSH hop on top of curl's own limit
        let output = self
            .relay
            .run(self.gateway, &command, self.timeout + Duration::from_secs(10))
            .await?;

        if !output.success() {
            return Err(OracleError::Request {
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }

        let alive = parse_alive(&output.stdout);
        debug!(alive = alive.len(), "Oracle verdict received");
        Ok(alive)
    }
}

/// Collect the addresses of `address:ALIVE` lines; anything else is ignored
pub fn parse_alive(body: &str) -> HashSet<IpAddr> {
    body.lines()
        .filter_map(|line| line.trim().strip_suffix(":ALIVE"))
        .filter_map(|addr| addr.trim().parse().ok())
        .collect()
}
