use async_trait::async_trait;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use digitalocean_rs::{DigitalOceanApi, DigitalOceanError};
use tracing::{info, warn};

use super::{BasicHost, BoxedProvisioner, HostDeleteRequest, Provisioner, ProvisionedHost};
use crate::config::InfraConfig;

const NOT_FOUND_MARKER: &str = "could not be found";

/// Provisions droplets through the DigitalOcean API.
pub struct DigitalOceanProvisioner {
    api: DigitalOceanApi,
}

pub fn from_config(config: &InfraConfig) -> Result<BoxedProvisioner> {
    Ok(Box::new(DigitalOceanProvisioner::new(
        config.get_access_key()?,
    )))
}

impl DigitalOceanProvisioner {
    pub fn new(token: String) -> Self {
        DigitalOceanProvisioner {
            api: DigitalOceanApi::new(token),
        }
    }

    async fn find_by_ip(&self, ip: &str) -> Result<Option<String>> {
        let hosts = self.list().await?;
        Ok(hosts.into_iter().find(|h| h.ip == ip).map(|h| h.id))
    }
}

#[async_trait]
impl Provisioner for DigitalOceanProvisioner {
    async fn provision(&self, host: BasicHost) -> Result<ProvisionedHost> {
        info!(name = %host.name, region = %host.region, "creating droplet");

        let droplet = self
            .api
            .create_droplet(&host.name, &host.plan, &host.os)
            .user_data(&host.user_data)
            .run_async()
            .await?;

        // The droplet has no public address this early; the IP is picked up
        // by later status polls.
        Ok(ProvisionedHost {
            id: droplet.id.to_string(),
            ip: String::new(),
            status: droplet.status.clone(),
        })
    }

    async fn status(&self, id: &str) -> Result<ProvisionedHost> {
        let droplet = self.api.get_droplet_async(id).await?;

        let ip = droplet
            .networks
            .v4
            .first()
            .map(|network| network.ip_address.clone())
            .unwrap_or_default();

        Ok(ProvisionedHost {
            id: id.to_string(),
            ip,
            // DigitalOcean already reports running droplets as "active".
            status: droplet.status.clone(),
        })
    }

    async fn delete(&self, req: HostDeleteRequest) -> Result<()> {
        let id = if req.id.is_empty() {
            match self.find_by_ip(&req.ip).await? {
                Some(id) => id,
                None => {
                    warn!(ip = %req.ip, "no droplet found for IP, nothing to delete");
                    return Ok(());
                }
            }
        } else {
            req.id
        };

        match self.api.delete_droplet_async(&id).await {
            Ok(_) => {
                info!(%id, "deleted droplet");
                Ok(())
            }
            Err(DigitalOceanError::Api(e)) if e.message.contains(NOT_FOUND_MARKER) => {
                warn!(%id, "droplet already gone");
                Ok(())
            }
            Err(e) => Err(eyre!("DigitalOcean API error: {e}")),
        }
    }

    async fn list(&self) -> Result<Vec<ProvisionedHost>> {
        let droplets = self.api.list_droplets_async().await?;

        Ok(droplets
            .into_iter()
            .map(|droplet| ProvisionedHost {
                id: droplet.id.to_string(),
                ip: droplet
                    .networks
                    .v4
                    .first()
                    .map(|network| network.ip_address.clone())
                    .unwrap_or_default(),
                status: droplet.status.clone(),
            })
            .collect())
    }
}
