//! AWS EC2 backend.
//!
//! Instances are tagged so IP-based lookups only ever scan hosts this
//! operator created. A security group opening the control port and the
//! tunnelled service ports is created per host.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::types::{
    Filter, InstanceStateName, InstanceType, IpPermission, IpRange, ResourceType, Tag,
    TagSpecification,
};
use aws_sdk_ec2::Client;
use aws_smithy_runtime::client::http::hyper_014::HyperClientBuilder;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use tracing::{info, warn};

use super::{
    BasicHost, BoxedProvisioner, HostDeleteRequest, Provisioner, ProvisionedHost, ACTIVE_STATUS,
};
use crate::config::InfraConfig;

const MANAGED_TAG: &str = "tunnel-operator";

pub struct Ec2Provisioner {
    region: String,
    access_key: String,
    secret_key: String,
}

pub fn from_config(config: &InfraConfig) -> Result<BoxedProvisioner> {
    Ok(Box::new(Ec2Provisioner {
        region: config.region.clone(),
        access_key: config.get_access_key()?,
        secret_key: config.get_secret_key()?,
    }))
}

impl Ec2Provisioner {
    /// Builds a fresh client per call; credentials are static and the
    /// construction is cheap compared to the EC2 round-trips around it.
    async fn client(&self) -> Client {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_only()
            .enable_http1()
            .enable_http2()
            .build();
        let http_client = HyperClientBuilder::new().build(https);

        let credentials = aws_sdk_ec2::config::Credentials::new(
            self.access_key.clone(),
            self.secret_key.clone(),
            None,
            None,
            MANAGED_TAG,
        );

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_ec2::config::Region::new(self.region.clone()))
            .credentials_provider(credentials)
            .http_client(http_client)
            .load()
            .await;

        Client::new(&sdk_config)
    }

    async fn ensure_security_group(&self, client: &Client, host: &BasicHost) -> Result<String> {
        let mut create = client
            .create_security_group()
            .group_name(format!("{}-tunnel", host.name))
            .description(format!("Tunnel exit node ports for {}", host.name));
        if let Some(vpc_id) = host.additional.get("vpc-id") {
            create = create.vpc_id(vpc_id);
        }
        let created = create.send().await?;
        let group_id = created
            .group_id()
            .ok_or_else(|| eyre!("EC2 returned no security group id"))?
            .to_string();

        let mut ports: Vec<i32> = Vec::new();
        if let Some(control_port) = host.additional.get("control-port") {
            ports.push(control_port.parse()?);
        }
        if let Some(service_ports) = host.additional.get("ports") {
            for port in service_ports.split(',').filter(|p| !p.is_empty()) {
                ports.push(port.trim().parse()?);
            }
        }

        let permissions = ports
            .into_iter()
            .map(|port| {
                IpPermission::builder()
                    .ip_protocol("tcp")
                    .from_port(port)
                    .to_port(port)
                    .ip_ranges(IpRange::builder().cidr_ip("0.0.0.0/0").build())
                    .build()
            })
            .collect::<Vec<_>>();

        client
            .authorize_security_group_ingress()
            .group_id(&group_id)
            .set_ip_permissions(Some(permissions))
            .send()
            .await?;

        Ok(group_id)
    }

    async fn find_by_ip(&self, ip: &str) -> Result<Option<String>> {
        let hosts = self.list().await?;
        Ok(hosts.into_iter().find(|h| h.ip == ip).map(|h| h.id))
    }
}

fn to_host(instance: &aws_sdk_ec2::types::Instance) -> ProvisionedHost {
    let state = instance
        .state()
        .and_then(|state| state.name())
        .cloned()
        .unwrap_or(InstanceStateName::Pending);
    let status = if state == InstanceStateName::Running {
        ACTIVE_STATUS.to_string()
    } else {
        state.as_str().to_string()
    };

    ProvisionedHost {
        id: instance.instance_id().unwrap_or_default().to_string(),
        ip: instance.public_ip_address().unwrap_or_default().to_string(),
        status,
    }
}

#[async_trait]
impl Provisioner for Ec2Provisioner {
    async fn provision(&self, host: BasicHost) -> Result<ProvisionedHost> {
        info!(name = %host.name, region = %self.region, "creating EC2 instance");

        let client = self.client().await;
        let group_id = self.ensure_security_group(&client, &host).await?;

        let tags = TagSpecification::builder()
            .resource_type(ResourceType::Instance)
            .tags(Tag::builder().key("Name").value(&host.name).build())
            .tags(Tag::builder().key("managed-by").value(MANAGED_TAG).build())
            .build();

        let mut run = client
            .run_instances()
            .image_id(&host.os)
            .instance_type(InstanceType::from(host.plan.as_str()))
            .min_count(1)
            .max_count(1)
            // Already base64-encoded by the host-config builder, as the
            // EC2 API requires.
            .user_data(&host.user_data)
            .security_group_ids(&group_id)
            .tag_specifications(tags);
        if let Some(subnet_id) = host.additional.get("subnet-id") {
            run = run.subnet_id(subnet_id);
        }

        let reservation = run.send().await?;
        let instance = reservation
            .instances()
            .first()
            .ok_or_else(|| eyre!("EC2 returned no instance for {}", host.name))?;

        Ok(ProvisionedHost {
            id: instance.instance_id().unwrap_or_default().to_string(),
            ip: String::new(),
            status: String::new(),
        })
    }

    async fn status(&self, id: &str) -> Result<ProvisionedHost> {
        let client = self.client().await;
        let described = client.describe_instances().instance_ids(id).send().await?;

        let instance = described
            .reservations()
            .iter()
            .flat_map(|reservation| reservation.instances())
            .next()
            .ok_or_else(|| eyre!("EC2 instance {id} not found"))?;

        Ok(to_host(instance))
    }

    async fn delete(&self, req: HostDeleteRequest) -> Result<()> {
        let id = if req.id.is_empty() {
            match self.find_by_ip(&req.ip).await? {
                Some(id) => id,
                None => {
                    warn!(ip = %req.ip, "no EC2 instance found for IP, nothing to delete");
                    return Ok(());
                }
            }
        } else {
            req.id
        };

        match client_terminate(&self.client().await, &id).await {
            Ok(()) => {
                info!(%id, "terminated EC2 instance");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> Result<Vec<ProvisionedHost>> {
        let client = self.client().await;
        let described = client
            .describe_instances()
            .filters(
                Filter::builder()
                    .name("tag:managed-by")
                    .values(MANAGED_TAG)
                    .build(),
            )
            .send()
            .await?;

        Ok(described
            .reservations()
            .iter()
            .flat_map(|reservation| reservation.instances())
            .map(to_host)
            .collect())
    }
}

async fn client_terminate(client: &Client, id: &str) -> Result<()> {
    match client.terminate_instances().instance_ids(id).send().await {
        Ok(_) => Ok(()),
        Err(e) => {
            let service_err = e.into_service_error();
            if service_err.meta().code() == Some("InvalidInstanceID.NotFound") {
                warn!(%id, "EC2 instance already gone");
                return Ok(());
            }
            Err(eyre!("EC2 API error terminating {id}: {service_err}"))
        }
    }
}
