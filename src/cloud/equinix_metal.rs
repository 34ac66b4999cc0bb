//! Equinix Metal backend. Device creation is scoped to a project, which is
//! why the project ID is a required configuration field for this provider.

use async_trait::async_trait;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{BasicHost, BoxedProvisioner, HostDeleteRequest, Provisioner, ProvisionedHost};
use crate::config::InfraConfig;

const API_URL: &str = "https://api.equinix.com/metal/v1";
const AUTH_HEADER: &str = "X-Auth-Token";

#[derive(Serialize)]
struct CreateDevicePayload<'a> {
    hostname: &'a str,
    plan: &'a str,
    metro: &'a str,
    operating_system: &'a str,
    userdata: &'a str,
}

#[derive(Deserialize, Debug)]
struct IpAddress {
    address: String,
    public: bool,
    address_family: u8,
}

#[derive(Deserialize, Debug)]
struct Device {
    id: String,
    state: String,
    #[serde(default)]
    ip_addresses: Vec<IpAddress>,
}

#[derive(Deserialize)]
struct DeviceListResponse {
    devices: Vec<Device>,
}

pub struct EquinixMetalProvisioner {
    client: reqwest::Client,
    project_id: String,
}

pub fn from_config(config: &InfraConfig) -> Result<BoxedProvisioner> {
    Ok(Box::new(EquinixMetalProvisioner::new(
        &config.get_access_key()?,
        config.project_id.clone(),
    )?))
}

impl EquinixMetalProvisioner {
    pub fn new(token: &str, project_id: String) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTH_HEADER, HeaderValue::from_str(token)?);
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;
        Ok(EquinixMetalProvisioner { client, project_id })
    }

    async fn find_by_ip(&self, ip: &str) -> Result<Option<String>> {
        let hosts = self.list().await?;
        Ok(hosts.into_iter().find(|h| h.ip == ip).map(|h| h.id))
    }
}

fn to_host(device: Device) -> ProvisionedHost {
    // Equinix already calls a booted device "active".
    let ip = device
        .ip_addresses
        .iter()
        .find(|address| address.public && address.address_family == 4)
        .map(|address| address.address.clone())
        .unwrap_or_default();
    ProvisionedHost {
        id: device.id,
        ip,
        status: device.state,
    }
}

#[async_trait]
impl Provisioner for EquinixMetalProvisioner {
    async fn provision(&self, host: BasicHost) -> Result<ProvisionedHost> {
        info!(name = %host.name, project = %self.project_id, "creating Equinix Metal device");

        let payload = CreateDevicePayload {
            hostname: &host.name,
            plan: &host.plan,
            metro: &host.region,
            operating_system: &host.os,
            userdata: &host.user_data,
        };

        let resp = self
            .client
            .post(format!(
                "{API_URL}/projects/{}/devices",
                self.project_id
            ))
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(eyre!(
                "Equinix Metal API error creating device: {}",
                resp.text().await.unwrap_or_default()
            ));
        }

        let created: Device = resp.json().await?;
        Ok(to_host(created))
    }

    async fn status(&self, id: &str) -> Result<ProvisionedHost> {
        let resp = self
            .client
            .get(format!("{API_URL}/devices/{id}"))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(eyre!(
                "Equinix Metal API error fetching device {id}: {}",
                resp.text().await.unwrap_or_default()
            ));
        }

        let found: Device = resp.json().await?;
        Ok(to_host(found))
    }

    async fn delete(&self, req: HostDeleteRequest) -> Result<()> {
        let id = if req.id.is_empty() {
            match self.find_by_ip(&req.ip).await? {
                Some(id) => id,
                None => {
                    warn!(ip = %req.ip, "no Equinix Metal device found for IP, nothing to delete");
                    return Ok(());
                }
            }
        } else {
            req.id
        };

        let resp = self
            .client
            .delete(format!("{API_URL}/devices/{id}"))
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            warn!(%id, "Equinix Metal device already gone");
            return Ok(());
        }
        if !resp.status().is_success() {
            return Err(eyre!(
                "Equinix Metal API error deleting device {id}: {}",
                resp.text().await.unwrap_or_default()
            ));
        }

        info!(%id, "deleted Equinix Metal device");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProvisionedHost>> {
        let resp = self
            .client
            .get(format!(
                "{API_URL}/projects/{}/devices",
                self.project_id
            ))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(eyre!(
                "Equinix Metal API error listing devices: {}",
                resp.text().await.unwrap_or_default()
            ));
        }

        let listed: DeviceListResponse = resp.json().await?;
        Ok(listed.devices.into_iter().map(to_host).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_v4_address_is_selected() {
        let device = Device {
            id: "dev-1".into(),
            state: "active".into(),
            ip_addresses: vec![
                IpAddress {
                    address: "10.0.0.2".into(),
                    public: false,
                    address_family: 4,
                },
                IpAddress {
                    address: "2604:1380::1".into(),
                    public: true,
                    address_family: 6,
                },
                IpAddress {
                    address: "147.75.0.1".into(),
                    public: true,
                    address_family: 4,
                },
            ],
        };
        let host = to_host(device);
        assert_eq!(host.ip, "147.75.0.1");
        assert_eq!(host.status, "active");
    }

    #[test]
    fn queued_device_has_no_ip() {
        let device = Device {
            id: "dev-1".into(),
            state: "queued".into(),
            ip_addresses: vec![],
        };
        let host = to_host(device);
        assert_eq!(host.ip, "");
        assert_eq!(host.status, "queued");
    }
}
