//! Hetzner Cloud backend, speaking the REST API directly.

use async_trait::async_trait;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{
    BasicHost, BoxedProvisioner, HostDeleteRequest, Provisioner, ProvisionedHost, ACTIVE_STATUS,
};
use crate::config::InfraConfig;

const API_URL: &str = "https://api.hetzner.cloud/v1";

#[derive(Serialize)]
struct CreateServerPayload<'a> {
    name: &'a str,
    server_type: &'a str,
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
    user_data: &'a str,
}

#[derive(Deserialize, Debug)]
struct Ipv4 {
    ip: String,
}

#[derive(Deserialize, Debug, Default)]
struct PublicNet {
    ipv4: Option<Ipv4>,
}

#[derive(Deserialize, Debug)]
struct Server {
    id: u64,
    status: String,
    #[serde(default)]
    public_net: PublicNet,
}

#[derive(Deserialize)]
struct ServerResponse {
    server: Server,
}

#[derive(Deserialize)]
struct ServerListResponse {
    servers: Vec<Server>,
}

pub struct HetznerProvisioner {
    client: reqwest::Client,
}

pub fn from_config(config: &InfraConfig) -> Result<BoxedProvisioner> {
    Ok(Box::new(HetznerProvisioner::new(&config.get_access_key()?)?))
}

impl HetznerProvisioner {
    pub fn new(token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))?,
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;
        Ok(HetznerProvisioner { client })
    }

    async fn find_by_ip(&self, ip: &str) -> Result<Option<String>> {
        let hosts = self.list().await?;
        Ok(hosts.into_iter().find(|h| h.ip == ip).map(|h| h.id))
    }
}

fn to_host(server: Server) -> ProvisionedHost {
    let status = if server.status == "running" {
        ACTIVE_STATUS.to_string()
    } else {
        server.status
    };
    ProvisionedHost {
        id: server.id.to_string(),
        ip: server
            .public_net
            .ipv4
            .map(|v4| v4.ip)
            .unwrap_or_default(),
        status,
    }
}

#[async_trait]
impl Provisioner for HetznerProvisioner {
    async fn provision(&self, host: BasicHost) -> Result<ProvisionedHost> {
        info!(name = %host.name, "creating Hetzner server");

        let payload = CreateServerPayload {
            name: &host.name,
            server_type: &host.plan,
            image: &host.os,
            location: (!host.region.is_empty()).then_some(host.region.as_str()),
            user_data: &host.user_data,
        };

        let resp = self
            .client
            .post(format!("{API_URL}/servers"))
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(eyre!(
                "Hetzner API error creating server: {}",
                resp.text().await.unwrap_or_default()
            ));
        }

        let created: ServerResponse = resp.json().await?;
        Ok(to_host(created.server))
    }

    async fn status(&self, id: &str) -> Result<ProvisionedHost> {
        let resp = self
            .client
            .get(format!("{API_URL}/servers/{id}"))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(eyre!(
                "Hetzner API error fetching server {id}: {}",
                resp.text().await.unwrap_or_default()
            ));
        }

        let found: ServerResponse = resp.json().await?;
        Ok(to_host(found.server))
    }

    async fn delete(&self, req: HostDeleteRequest) -> Result<()> {
        let id = if req.id.is_empty() {
            match self.find_by_ip(&req.ip).await? {
                Some(id) => id,
                None => {
                    warn!(ip = %req.ip, "no Hetzner server found for IP, nothing to delete");
                    return Ok(());
                }
            }
        } else {
            req.id
        };

        let resp = self
            .client
            .delete(format!("{API_URL}/servers/{id}"))
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            warn!(%id, "Hetzner server already gone");
            return Ok(());
        }
        if !resp.status().is_success() {
            return Err(eyre!(
                "Hetzner API error deleting server {id}: {}",
                resp.text().await.unwrap_or_default()
            ));
        }

        info!(%id, "deleted Hetzner server");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProvisionedHost>> {
        let resp = self
            .client
            .get(format!("{API_URL}/servers"))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(eyre!(
                "Hetzner API error listing servers: {}",
                resp.text().await.unwrap_or_default()
            ));
        }

        let listed: ServerListResponse = resp.json().await?;
        Ok(listed.servers.into_iter().map(to_host).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_status_is_normalized() {
        let server = Server {
            id: 42,
            status: "running".into(),
            public_net: PublicNet {
                ipv4: Some(Ipv4 { ip: "1.2.3.4".into() }),
            },
        };
        let host = to_host(server);
        assert_eq!(host.status, ACTIVE_STATUS);
        assert_eq!(host.ip, "1.2.3.4");
        assert_eq!(host.id, "42");
    }

    #[test]
    fn pending_server_has_no_ip() {
        let server = Server {
            id: 42,
            status: "initializing".into(),
            public_net: PublicNet::default(),
        };
        let host = to_host(server);
        assert_eq!(host.status, "initializing");
        assert_eq!(host.ip, "");
    }
}
