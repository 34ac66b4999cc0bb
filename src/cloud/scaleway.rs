//! Scaleway backend.
//!
//! Scaleway instances are zone-scoped: every call that addresses a server
//! needs both the server UUID and the zone it lives in. Both travel inside
//! the opaque host ID as a [`ServerId`], so a tunnel status recorded under
//! one operator configuration can still be deleted after the configured
//! zone changes.

use async_trait::async_trait;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{
    BasicHost, BoxedProvisioner, HostDeleteRequest, Provisioner, ProvisionedHost, ACTIVE_STATUS,
};
use crate::config::InfraConfig;

const API_URL: &str = "https://api.scaleway.com/instance/v1";
const AUTH_HEADER: &str = "X-Auth-Token";
const ID_SEPARATOR: char = '|';

/// Internal form of a Scaleway host ID. Serialized as `uuid|zone` at the
/// provisioner boundary and never split anywhere else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerId {
    pub server: String,
    pub zone: String,
}

impl ServerId {
    pub fn encode(&self) -> String {
        format!("{}{}{}", self.server, ID_SEPARATOR, self.zone)
    }

    pub fn parse(id: &str) -> Result<Self> {
        match id.split_once(ID_SEPARATOR) {
            Some((server, zone)) if !server.is_empty() && !zone.is_empty() => Ok(ServerId {
                server: server.to_string(),
                zone: zone.to_string(),
            }),
            _ => Err(eyre!("malformed Scaleway host id: {id}")),
        }
    }
}

#[derive(Serialize)]
struct CreateServerPayload<'a> {
    name: &'a str,
    commercial_type: &'a str,
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    project: Option<&'a str>,
    // Without this Scaleway never attaches a public IP to the instance.
    dynamic_ip_required: bool,
}

#[derive(Serialize)]
struct ServerActionPayload<'a> {
    action: &'a str,
}

#[derive(Deserialize, Debug)]
struct PublicIp {
    address: String,
}

#[derive(Deserialize, Debug)]
struct Server {
    id: String,
    state: String,
    #[serde(default)]
    public_ip: Option<PublicIp>,
}

#[derive(Deserialize)]
struct ServerResponse {
    server: Server,
}

#[derive(Deserialize)]
struct ServerListResponse {
    servers: Vec<Server>,
}

pub struct ScalewayProvisioner {
    client: reqwest::Client,
    zone: String,
}

pub fn from_config(config: &InfraConfig) -> Result<BoxedProvisioner> {
    let zone = if !config.zone.is_empty() {
        config.zone.clone()
    } else if !config.region.is_empty() {
        config.region.clone()
    } else {
        "fr-par-1".to_string()
    };
    Ok(Box::new(ScalewayProvisioner::new(
        &config.get_secret_key()?,
        zone,
    )?))
}

impl ScalewayProvisioner {
    pub fn new(secret_key: &str, zone: String) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTH_HEADER, HeaderValue::from_str(secret_key)?);
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;
        Ok(ScalewayProvisioner { client, zone })
    }

    fn zone_url(&self, zone: &str, path: &str) -> String {
        format!("{API_URL}/zones/{zone}/servers{path}")
    }

    async fn fetch(&self, id: &ServerId) -> Result<Server> {
        let resp = self
            .client
            .get(self.zone_url(&id.zone, &format!("/{}", id.server)))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(eyre!(
                "Scaleway API error fetching server {}: {}",
                id.server,
                resp.text().await.unwrap_or_default()
            ));
        }

        let found: ServerResponse = resp.json().await?;
        Ok(found.server)
    }

    async fn find_by_ip(&self, ip: &str) -> Result<Option<String>> {
        let hosts = self.list().await?;
        Ok(hosts.into_iter().find(|h| h.ip == ip).map(|h| h.id))
    }
}

fn to_host(server: Server, zone: &str) -> ProvisionedHost {
    let status = if server.state == "running" {
        ACTIVE_STATUS.to_string()
    } else {
        server.state
    };
    ProvisionedHost {
        id: ServerId {
            server: server.id,
            zone: zone.to_string(),
        }
        .encode(),
        ip: server
            .public_ip
            .map(|public_ip| public_ip.address)
            .unwrap_or_default(),
        status,
    }
}

#[async_trait]
impl Provisioner for ScalewayProvisioner {
    async fn provision(&self, host: BasicHost) -> Result<ProvisionedHost> {
        info!(name = %host.name, zone = %self.zone, "creating Scaleway server");

        let payload = CreateServerPayload {
            name: &host.name,
            commercial_type: &host.plan,
            image: &host.os,
            project: host.additional.get("organization-id").map(String::as_str),
            dynamic_ip_required: true,
        };

        let resp = self
            .client
            .post(self.zone_url(&self.zone, ""))
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(eyre!(
                "Scaleway API error creating server: {}",
                resp.text().await.unwrap_or_default()
            ));
        }

        let created: ServerResponse = resp.json().await?;
        let server_id = created.server.id.clone();

        // User data must be attached before boot for cloud-init to see it.
        let resp = self
            .client
            .patch(self.zone_url(
                &self.zone,
                &format!("/{server_id}/user_data/cloud-init"),
            ))
            .header("Content-Type", "text/plain")
            .body(host.user_data.clone())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(eyre!(
                "Scaleway API error setting user data: {}",
                resp.text().await.unwrap_or_default()
            ));
        }

        let resp = self
            .client
            .post(self.zone_url(&self.zone, &format!("/{server_id}/action")))
            .json(&ServerActionPayload { action: "poweron" })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(eyre!(
                "Scaleway API error powering on server: {}",
                resp.text().await.unwrap_or_default()
            ));
        }

        Ok(to_host(created.server, &self.zone))
    }

    async fn status(&self, id: &str) -> Result<ProvisionedHost> {
        let id = ServerId::parse(id)?;
        let server = self.fetch(&id).await?;
        Ok(to_host(server, &id.zone))
    }

    async fn delete(&self, req: HostDeleteRequest) -> Result<()> {
        let encoded = if req.id.is_empty() {
            match self.find_by_ip(&req.ip).await? {
                Some(id) => id,
                None => {
                    warn!(ip = %req.ip, "no Scaleway server found for IP, nothing to delete");
                    return Ok(());
                }
            }
        } else {
            req.id
        };
        let id = ServerId::parse(&encoded)?;

        // "terminate" powers the server off and deletes it together with
        // its volumes in one call.
        let resp = self
            .client
            .post(self.zone_url(&id.zone, &format!("/{}/action", id.server)))
            .json(&ServerActionPayload {
                action: "terminate",
            })
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            warn!(server = %id.server, "Scaleway server already gone");
            return Ok(());
        }
        if !resp.status().is_success() {
            return Err(eyre!(
                "Scaleway API error terminating server {}: {}",
                id.server,
                resp.text().await.unwrap_or_default()
            ));
        }

        info!(server = %id.server, zone = %id.zone, "terminated Scaleway server");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProvisionedHost>> {
        let resp = self
            .client
            .get(self.zone_url(&self.zone, ""))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(eyre!(
                "Scaleway API error listing servers: {}",
                resp.text().await.unwrap_or_default()
            ));
        }

        let listed: ServerListResponse = resp.json().await?;
        Ok(listed
            .servers
            .into_iter()
            .map(|server| to_host(server, &self.zone))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_id_round_trips() {
        let id = ServerId {
            server: "5a0ed7a5-dc8a-4b5c-9268-3db1d5e6f0e1".into(),
            zone: "fr-par-1".into(),
        };
        let encoded = id.encode();
        assert_eq!(encoded, "5a0ed7a5-dc8a-4b5c-9268-3db1d5e6f0e1|fr-par-1");
        assert_eq!(ServerId::parse(&encoded).unwrap(), id);
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert!(ServerId::parse("no-separator").is_err());
        assert!(ServerId::parse("|fr-par-1").is_err());
        assert!(ServerId::parse("uuid|").is_err());
    }

    #[test]
    fn running_state_is_normalized() {
        let server = Server {
            id: "abc".into(),
            state: "running".into(),
            public_ip: Some(PublicIp {
                address: "51.15.0.1".into(),
            }),
        };
        let host = to_host(server, "nl-ams-1");
        assert_eq!(host.status, ACTIVE_STATUS);
        assert_eq!(host.id, "abc|nl-ams-1");
        assert_eq!(host.ip, "51.15.0.1");
    }
}
