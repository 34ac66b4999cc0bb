//! Linode backend, speaking the REST API directly.
//!
//! Cloud-init user data goes through the metadata service and must be
//! base64-encoded in the create call.

use async_trait::async_trait;
use base64::prelude::*;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{
    pwgen, BasicHost, BoxedProvisioner, HostDeleteRequest, Provisioner, ProvisionedHost,
    ACTIVE_STATUS,
};
use crate::config::InfraConfig;

const API_URL: &str = "https://api.linode.com/v4";

#[derive(Serialize)]
struct Metadata {
    user_data: String,
}

#[derive(Serialize)]
struct CreateInstancePayload<'a> {
    label: &'a str,
    #[serde(rename = "type")]
    instance_type: &'a str,
    region: &'a str,
    image: &'a str,
    root_pass: &'a str,
    metadata: Metadata,
}

#[derive(Deserialize, Debug)]
struct Instance {
    id: u64,
    status: String,
    #[serde(default)]
    ipv4: Vec<String>,
}

#[derive(Deserialize)]
struct InstanceListResponse {
    data: Vec<Instance>,
}

pub struct LinodeProvisioner {
    client: reqwest::Client,
}

pub fn from_config(config: &InfraConfig) -> Result<BoxedProvisioner> {
    Ok(Box::new(LinodeProvisioner::new(&config.get_access_key()?)?))
}

impl LinodeProvisioner {
    pub fn new(token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))?,
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;
        Ok(LinodeProvisioner { client })
    }

    async fn find_by_ip(&self, ip: &str) -> Result<Option<String>> {
        let hosts = self.list().await?;
        Ok(hosts.into_iter().find(|h| h.ip == ip).map(|h| h.id))
    }
}

fn to_host(instance: Instance) -> ProvisionedHost {
    let status = if instance.status == "running" {
        ACTIVE_STATUS.to_string()
    } else {
        instance.status
    };
    ProvisionedHost {
        id: instance.id.to_string(),
        ip: instance.ipv4.first().cloned().unwrap_or_default(),
        status,
    }
}

#[async_trait]
impl Provisioner for LinodeProvisioner {
    async fn provision(&self, host: BasicHost) -> Result<ProvisionedHost> {
        info!(name = %host.name, region = %host.region, "creating Linode instance");

        // Linode requires a root password even when access only ever
        // happens through the tunnel; generate a throwaway one.
        let root_pass = pwgen::generate_token();

        let payload = CreateInstancePayload {
            label: &host.name,
            instance_type: &host.plan,
            region: &host.region,
            image: &host.os,
            root_pass: &root_pass,
            metadata: Metadata {
                user_data: BASE64_STANDARD.encode(&host.user_data),
            },
        };

        let resp = self
            .client
            .post(format!("{API_URL}/linode/instances"))
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(eyre!(
                "Linode API error creating instance: {}",
                resp.text().await.unwrap_or_default()
            ));
        }

        let created: Instance = resp.json().await?;
        let mut provisioned = to_host(created);
        // Addresses reported at create time are not reachable until the
        // instance boots; let the status poll surface the IP instead.
        provisioned.ip = String::new();
        Ok(provisioned)
    }

    async fn status(&self, id: &str) -> Result<ProvisionedHost> {
        let resp = self
            .client
            .get(format!("{API_URL}/linode/instances/{id}"))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(eyre!(
                "Linode API error fetching instance {id}: {}",
                resp.text().await.unwrap_or_default()
            ));
        }

        let found: Instance = resp.json().await?;
        Ok(to_host(found))
    }

    async fn delete(&self, req: HostDeleteRequest) -> Result<()> {
        let id = if req.id.is_empty() {
            match self.find_by_ip(&req.ip).await? {
                Some(id) => id,
                None => {
                    warn!(ip = %req.ip, "no Linode instance found for IP, nothing to delete");
                    return Ok(());
                }
            }
        } else {
            req.id
        };

        let resp = self
            .client
            .delete(format!("{API_URL}/linode/instances/{id}"))
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            warn!(%id, "Linode instance already gone");
            return Ok(());
        }
        if !resp.status().is_success() {
            return Err(eyre!(
                "Linode API error deleting instance {id}: {}",
                resp.text().await.unwrap_or_default()
            ));
        }

        info!(%id, "deleted Linode instance");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProvisionedHost>> {
        let resp = self
            .client
            .get(format!("{API_URL}/linode/instances"))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(eyre!(
                "Linode API error listing instances: {}",
                resp.text().await.unwrap_or_default()
            ));
        }

        let listed: InstanceListResponse = resp.json().await?;
        Ok(listed.data.into_iter().map(to_host).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_status_is_normalized() {
        let instance = Instance {
            id: 7,
            status: "running".into(),
            ipv4: vec!["5.6.7.8".into()],
        };
        let host = to_host(instance);
        assert_eq!(host.status, ACTIVE_STATUS);
        assert_eq!(host.ip, "5.6.7.8");
    }

    #[test]
    fn provisioning_status_passes_through() {
        let instance = Instance {
            id: 7,
            status: "provisioning".into(),
            ipv4: vec![],
        };
        assert_eq!(to_host(instance).status, "provisioning");
    }
}
