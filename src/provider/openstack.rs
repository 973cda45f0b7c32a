//! OpenStack REST client (Keystone v3, Nova, Cinder v3, Neutron v2.0)

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::*;
use crate::config::CloudConfig;

/// Re-authenticate well before Keystone's default one hour expiry
const TOKEN_TTL: Duration = Duration::from_secs(45 * 60);

/// Nova microversion that accepts instance tags on create
const COMPUTE_MICROVERSION: &str = "2.52";

#[derive(Debug, Clone, Copy)]
enum Service {
    Compute,
    Volume,
    Network,
}

impl Service {
    fn catalog_types(self) -> &'static [&'static str] {
        match self {
            Self::Compute => &["compute"],
            Self::Volume => &["volumev3", "block-storage", "volume"],
            Self::Network => &["network"],
        }
    }
}

#[derive(Debug, Clone)]
struct Session {
    token: String,
    compute_url: String,
    volume_url: String,
    network_url: String,
    issued_at: Instant,
}

impl Session {
    fn base_url(&self, service: Service) -> &str {
        match service {
            Service::Compute => &self.compute_url,
            Service::Volume => &self.volume_url,
            Service::Network => &self.network_url,
        }
    }
}

/// Provider implementation over the OpenStack APIs
pub struct OpenStackClient {
    http: reqwest::Client,
    cloud: CloudConfig,
    session: RwLock<Option<Session>>,
}

impl OpenStackClient {
    pub fn new(cloud: CloudConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cloud.request_timeout_secs))
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self {
            http,
            cloud,
            session: RwLock::new(None),
        })
    }

    /// Obtain a token, verifying the credentials
    pub async fn authenticate(&self) -> Result<(), ProviderError> {
        let session = self.issue_token().await?;
        *self.session.write().await = Some(session);
        Ok(())
    }

    async fn current_session(&self) -> Result<Session, ProviderError> {
        {
            let session = self.session.read().await;
            if let Some(s) = session.as_ref() {
                if s.issued_at.elapsed() < TOKEN_TTL {
                    return Ok(s.clone());
                }
            }
        }

        let fresh = self.issue_token().await?;
        *self.session.write().await = Some(fresh.clone());
        Ok(fresh)
    }

    async fn issue_token(&self) -> Result<Session, ProviderError> {
        let body = serde_json::json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.cloud.username,
                            "domain": { "name": self.cloud.user_domain },
                            "password": self.cloud.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": self.cloud.project_name,
                        "domain": { "name": self.cloud.project_domain },
                    }
                }
            }
        });

        let url = format!("{}/auth/tokens", self.cloud.auth_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::Auth(format!("HTTP {}", response.status())));
        }

        let token = response
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .ok_or_else(|| ProviderError::Auth("response carried no X-Subject-Token".to_string()))?;

        let reply: TokenReply = response.json().await.map_err(|e| ProviderError::InvalidResponse {
            operation: "issue token".to_string(),
            reason: e.to_string(),
        })?;

        let session = Session {
            token,
            compute_url: self.endpoint(Service::Compute, &reply.token.catalog)?,
            volume_url: self.endpoint(Service::Volume, &reply.token.catalog)?,
            network_url: self.endpoint(Service::Network, &reply.token.catalog)?,
            issued_at: Instant::now(),
        };

        info!(user = %self.cloud.username, project = %self.cloud.project_name, "Authenticated with identity service");
        Ok(session)
    }

    fn endpoint(&self, service: Service, catalog: &[CatalogEntry]) -> Result<String, ProviderError> {
        let overridden = match service {
            Service::Compute => &self.cloud.compute_url,
            Service::Volume => &self.cloud.volume_url,
            Service::Network => &self.cloud.network_url,
        };
        if let Some(url) = overridden {
            return Ok(url.trim_end_matches('/').to_string());
        }

        catalog
            .iter()
            .filter(|entry| service.catalog_types().contains(&entry.kind.as_str()))
            .flat_map(|entry| entry.endpoints.iter())
            .find(|ep| {
                ep.interface == self.cloud.interface
                    && self
                        .cloud
                        .region
                        .as_ref()
                        .map_or(true, |r| ep.region_id.as_deref() == Some(r.as_str()) || ep.region.as_deref() == Some(r.as_str()))
            })
            .map(|ep| ep.url.trim_end_matches('/').to_string())
            .ok_or_else(|| ProviderError::NoEndpoint(service.catalog_types()[0].to_string()))
    }

    /// Issue one request; `Ok(None)` means the resource does not exist.
    async fn call(
        &self,
        service: Service,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        operation: &str,
    ) -> Result<Option<serde_json::Value>, ProviderError> {
        let mut retried_auth = false;

        loop {
            let session = self.current_session().await?;
            let url = format!("{}{}", session.base_url(service), path);

            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("X-Auth-Token", &session.token);
            if matches!(service, Service::Compute) {
                request = request.header("X-OpenStack-Nova-API-Version", COMPUTE_MICROVERSION);
            }
            if let Some(body) = &body {
                request = request.json(body);
            }

            debug!(operation, %method, url = %url, "Provider request");
            let response = request
                .send()
                .await
                .map_err(|e| ProviderError::Network(e.to_string()))?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !retried_auth {
                warn!(operation, "Token rejected, re-authenticating");
                *self.session.write().await = None;
                retried_auth = true;
                continue;
            }
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ProviderError::Http {
                    operation: operation.to_string(),
                    status: status.as_u16(),
                    body,
                });
            }

            let text = response
                .text()
                .await
                .map_err(|e| ProviderError::Network(e.to_string()))?;
            if text.trim().is_empty() {
                return Ok(Some(serde_json::Value::Null));
            }
            let value = serde_json::from_str(&text).map_err(|e| ProviderError::InvalidResponse {
                operation: operation.to_string(),
                reason: e.to_string(),
            })?;
            return Ok(Some(value));
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        service: Service,
        path: &str,
        operation: &str,
    ) -> Result<Option<T>, ProviderError> {
        match self.call(service, Method::GET, path, None, operation).await? {
            Some(value) => decode(value, operation).map(Some),
            None => Ok(None),
        }
    }

    async fn resolve_flavor(&self, flavor: &str) -> Result<String, ProviderError> {
        let reply: FlavorsReply = self
            .get(Service::Compute, "/flavors", "list flavors")
            .await?
            .unwrap_or_default();

        reply
            .flavors
            .into_iter()
            .find(|f| f.id == flavor || f.name == flavor)
            .map(|f| f.id)
            .ok_or_else(|| ProviderError::UnknownFlavor(flavor.to_string()))
    }
}

#[async_trait]
impl Provider for OpenStackClient {
    async fn list_instances(&self, name_prefix: &str) -> Result<Vec<Instance>, ProviderError> {
        let path = format!("/servers/detail?name=^{}", name_prefix);
        let reply: ServersReply = self
            .get(Service::Compute, &path, "list instances")
            .await?
            .unwrap_or_default();

        // The name filter is a server-side regex; enforce the prefix here too
        Ok(reply
            .servers
            .into_iter()
            .filter(|s| s.name.starts_with(name_prefix))
            .map(ServerRecord::into_instance)
            .collect())
    }

    async fn show_instance(&self, id: &str) -> Result<Option<Instance>, ProviderError> {
        let reply: Option<ServerReply> = self
            .get(Service::Compute, &format!("/servers/{}", id), "show instance")
            .await?;
        Ok(reply.map(|r| r.server.into_instance()))
    }

    async fn create_instance(&self, spec: &NewInstance) -> Result<String, ProviderError> {
        let flavor_id = self.resolve_flavor(&spec.flavor).await?;
        let body = serde_json::json!({
            "server": {
                "name": spec.name,
                "flavorRef": flavor_id,
                "key_name": spec.key_name,
                "networks": [{ "uuid": spec.network_id }],
                "security_groups": [{ "name": spec.security_group }],
                "tags": [spec.tag],
                "block_device_mapping_v2": [{
                    "boot_index": 0,
                    "uuid": spec.boot_volume_id,
                    "source_type": "volume",
                    "destination_type": "volume",
                    "delete_on_termination": false,
                }],
            }
        });

        let value = self
            .call(Service::Compute, Method::POST, "/servers", Some(body), "create instance")
            .await?
            .ok_or_else(|| missing("create instance"))?;
        let reply: ServerReply = decode(value, "create instance")?;
        Ok(reply.server.id)
    }

    async fn delete_instance(&self, id: &str) -> Result<(), ProviderError> {
        self.call(
            Service::Compute,
            Method::DELETE,
            &format!("/servers/{}", id),
            None,
            "delete instance",
        )
        .await?;
        Ok(())
    }

    async fn create_volume(&self, spec: &NewVolume) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "volume": {
                "name": spec.name,
                "size": spec.size_gb,
                "imageRef": spec.image_id,
                "metadata": { "tag": spec.tag },
            }
        });

        let value = self
            .call(Service::Volume, Method::POST, "/volumes", Some(body), "create volume")
            .await?
            .ok_or_else(|| missing("create volume"))?;
        let reply: VolumeReply = decode(value, "create volume")?;
        Ok(reply.volume.id)
    }

    async fn show_volume(&self, id: &str) -> Result<Option<Volume>, ProviderError> {
        let reply: Option<VolumeReply> = self
            .get(Service::Volume, &format!("/volumes/{}", id), "show volume")
            .await?;
        Ok(reply.map(|r| r.volume.into_volume()))
    }

    async fn find_volume(&self, name: &str) -> Result<Option<Volume>, ProviderError> {
        let reply: VolumesReply = self
            .get(Service::Volume, &format!("/volumes/detail?name={}", name), "find volume")
            .await?
            .unwrap_or_default();
        Ok(reply
            .volumes
            .into_iter()
            .find(|v| v.name.as_deref() == Some(name))
            .map(VolumeRecord::into_volume))
    }

    async fn delete_volume(&self, id: &str) -> Result<(), ProviderError> {
        self.call(
            Service::Volume,
            Method::DELETE,
            &format!("/volumes/{}", id),
            None,
            "delete volume",
        )
        .await?;
        Ok(())
    }

    async fn list_floating_ips(&self) -> Result<Vec<FloatingIp>, ProviderError> {
        let reply: FloatingIpsReply = self
            .get(Service::Network, "/v2.0/floatingips", "list floating addresses")
            .await?
            .unwrap_or_default();
        Ok(reply
            .floatingips
            .into_iter()
            .filter_map(|f| {
                Some(FloatingIp {
                    floating_ip: f.floating_ip_address.parse().ok()?,
                    fixed_ip: f.fixed_ip_address.and_then(|a| a.parse().ok()),
                    port_id: f.port_id,
                    id: f.id,
                })
            })
            .collect())
    }
}

fn decode<T: DeserializeOwned>(value: serde_json::Value, operation: &str) -> Result<T, ProviderError> {
    serde_json::from_value(value).map_err(|e| ProviderError::InvalidResponse {
        operation: operation.to_string(),
        reason: e.to_string(),
    })
}

fn missing(operation: &str) -> ProviderError {
    ProviderError::InvalidResponse {
        operation: operation.to_string(),
        reason: "resource vanished".to_string(),
    }
}

// Wire records

#[derive(Debug, Deserialize)]
struct TokenReply {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct CatalogEndpoint {
    interface: String,
    url: String,
    #[serde(default)]
    region_id: Option<String>,
    #[serde(default)]
    region: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServersReply {
    #[serde(default)]
    servers: Vec<ServerRecord>,
}

#[derive(Debug, Deserialize)]
struct ServerReply {
    server: ServerRecord,
}

#[derive(Debug, Deserialize)]
struct ServerRecord {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    addresses: BTreeMap<String, Vec<AddressRecord>>,
    #[serde(rename = "os-extended-volumes:volumes_attached", default)]
    volumes_attached: Vec<IdRecord>,
}

#[derive(Debug, Deserialize)]
struct AddressRecord {
    addr: String,
    #[serde(rename = "OS-EXT-IPS:type", default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdRecord {
    id: String,
}

impl ServerRecord {
    fn into_instance(self) -> Instance {
        let addresses = self
            .addresses
            .into_iter()
            .flat_map(|(network, records)| {
                records.into_iter().filter_map(move |r| {
                    let addr: IpAddr = r.addr.parse().ok()?;
                    let kind = match r.kind.as_deref() {
                        Some("floating") => AddressKind::Floating,
                        _ => AddressKind::Fixed,
                    };
                    Some(InstanceAddress {
                        network: network.clone(),
                        addr,
                        kind,
                    })
                })
            })
            .collect();

        Instance {
            id: self.id,
            name: self.name,
            status: InstanceStatus::parse(&self.status),
            addresses,
            volume_ids: self.volumes_attached.into_iter().map(|v| v.id).collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FlavorsReply {
    #[serde(default)]
    flavors: Vec<FlavorRecord>,
}

#[derive(Debug, Deserialize)]
struct FlavorRecord {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct VolumeReply {
    volume: VolumeRecord,
}

#[derive(Debug, Default, Deserialize)]
struct VolumesReply {
    #[serde(default)]
    volumes: Vec<VolumeRecord>,
}

#[derive(Debug, Deserialize)]
struct VolumeRecord {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: String,
}

impl VolumeRecord {
    fn into_volume(self) -> Volume {
        Volume {
            id: self.id,
            name: self.name.unwrap_or_default(),
            status: VolumeStatus::parse(&self.status),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FloatingIpsReply {
    #[serde(default)]
    floatingips: Vec<FloatingIpRecord>,
}

#[derive(Debug, Deserialize)]
struct FloatingIpRecord {
    id: String,
    floating_ip_address: String,
    #[serde(default)]
    fixed_ip_address: Option<String>,
    #[serde(default)]
    port_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_record_normalization() {
        let raw = serde_json::json!({
            "server": {
                "id": "abc",
                "name": "node3",
                "status": "ACTIVE",
                "addresses": {
                    "private": [
                        {"addr": "10.10.0.12", "version": 4, "OS-EXT-IPS:type": "fixed"},
                        {"addr": "198.51.100.7", "version": 4, "OS-EXT-IPS:type": "floating"},
                        {"addr": "not-an-ip", "version": 4}
                    ]
                },
                "os-extended-volumes:volumes_attached": [{"id": "vol-1"}]
            }
        });

        let reply: ServerReply = serde_json::from_value(raw).unwrap();
        let inst = reply.server.into_instance();

        assert_eq!(inst.name, "node3");
        assert_eq!(inst.status, InstanceStatus::Active);
        assert_eq!(inst.addresses.len(), 2);
        assert_eq!(inst.floating_address(), Some("198.51.100.7".parse().unwrap()));
        assert_eq!(inst.volume_ids, vec!["vol-1".to_string()]);
    }

    #[test]
    fn test_endpoint_from_catalog_honours_region_and_interface() {
        let client = OpenStackClient::new(CloudConfig {
            region: Some("RegionTwo".to_string()),
            ..CloudConfig::default()
        })
        .unwrap();

        let catalog: Vec<CatalogEntry> = serde_json::from_value(serde_json::json!([
            {"type": "compute", "endpoints": [
                {"interface": "public", "region_id": "RegionOne", "url": "http://one:8774/v2.1/"},
                {"interface": "internal", "region_id": "RegionTwo", "url": "http://int:8774/v2.1"},
                {"interface": "public", "region_id": "RegionTwo", "url": "http://two:8774/v2.1/"}
            ]}
        ]))
        .unwrap();

        assert_eq!(
            client.endpoint(Service::Compute, &catalog).unwrap(),
            "http://two:8774/v2.1"
        );
        assert!(matches!(
            client.endpoint(Service::Network, &catalog),
            Err(ProviderError::NoEndpoint(_))
        ));
    }
}
