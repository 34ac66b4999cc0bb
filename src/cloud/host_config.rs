//! Per-provider host descriptors.
//!
//! Pure mapping from (tunnel, service ports, operator config) to the
//! [`BasicHost`] a provider understands: default image and plan, target
//! region, boot script, and whatever the generic shape cannot express in
//! the `additional` bag. No I/O happens here.

use std::collections::BTreeMap;

use base64::prelude::*;

use super::{BasicHost, CONTROL_PORT};
use crate::config::InfraConfig;

/// Inputs for building one host descriptor.
pub struct HostParams<'a> {
    pub tunnel_name: &'a str,
    /// Comma-joined service ports, as exposed on the exit node.
    pub ports: &'a str,
    pub user_data: &'a str,
    pub config: &'a InfraConfig,
}

pub fn digitalocean(params: &HostParams<'_>) -> BasicHost {
    BasicHost {
        name: params.tunnel_name.to_string(),
        os: "ubuntu-22-04-x64".to_string(),
        plan: "s-1vcpu-1gb".to_string(),
        region: params.config.region.clone(),
        user_data: params.user_data.to_string(),
        additional: BTreeMap::new(),
    }
}

pub fn ec2(params: &HostParams<'_>) -> BasicHost {
    let mut additional = BTreeMap::new();
    additional.insert("control-port".to_string(), CONTROL_PORT.to_string());
    additional.insert("ports".to_string(), params.ports.to_string());

    if !params.config.vpc_id.is_empty() {
        additional.insert("vpc-id".to_string(), params.config.vpc_id.clone());
    }
    if !params.config.subnet_id.is_empty() {
        additional.insert("subnet-id".to_string(), params.config.subnet_id.clone());
    }

    BasicHost {
        name: params.tunnel_name.to_string(),
        os: "ami-0f8e81a3da6e2510a".to_string(),
        plan: "t3.micro".to_string(),
        region: params.config.region.clone(),
        // The EC2 API requires user data to be base64-encoded.
        user_data: BASE64_STANDARD.encode(params.user_data),
        additional,
    }
}

pub fn linode(params: &HostParams<'_>) -> BasicHost {
    BasicHost {
        name: params.tunnel_name.to_string(),
        os: "linode/ubuntu22.04".to_string(),
        plan: "g6-nanode-1".to_string(),
        region: params.config.region.clone(),
        user_data: params.user_data.to_string(),
        additional: BTreeMap::new(),
    }
}

pub fn hetzner(params: &HostParams<'_>) -> BasicHost {
    BasicHost {
        name: params.tunnel_name.to_string(),
        os: "ubuntu-22.04".to_string(),
        plan: "cx22".to_string(),
        region: params.config.region.clone(),
        user_data: params.user_data.to_string(),
        additional: BTreeMap::new(),
    }
}

pub fn scaleway(params: &HostParams<'_>) -> BasicHost {
    let mut additional = BTreeMap::new();
    if !params.config.organization_id.is_empty() {
        additional.insert(
            "organization-id".to_string(),
            params.config.organization_id.clone(),
        );
    }

    BasicHost {
        name: params.tunnel_name.to_string(),
        os: "ubuntu_jammy".to_string(),
        plan: "DEV1-S".to_string(),
        region: params.config.region.clone(),
        user_data: params.user_data.to_string(),
        additional,
    }
}

pub fn equinix_metal(params: &HostParams<'_>) -> BasicHost {
    let mut additional = BTreeMap::new();
    additional.insert("project-id".to_string(), params.config.project_id.clone());

    BasicHost {
        name: params.tunnel_name.to_string(),
        os: "ubuntu_22_04".to_string(),
        plan: "c3.small.x86".to_string(),
        region: params.config.region.clone(),
        user_data: params.user_data.to_string(),
        additional,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::ProviderRegistry;

    fn params<'a>(config: &'a InfraConfig) -> HostParams<'a> {
        HostParams {
            tunnel_name: "web-tunnel",
            ports: "80,443",
            user_data: "#!/bin/bash\ntrue\n",
            config,
        }
    }

    #[test]
    fn plan_override_replaces_provider_default() {
        let registry = ProviderRegistry::default();
        let config = InfraConfig {
            provider: "digitalocean".into(),
            region: "lon1".into(),
            plan: "s-2vcpu-4gb".into(),
            ..Default::default()
        };
        let host = registry.host_config(&params(&config)).unwrap();
        assert_eq!(host.plan, "s-2vcpu-4gb");
        assert_eq!(host.region, "lon1");
    }

    #[test]
    fn default_plan_used_without_override() {
        let registry = ProviderRegistry::default();
        let config = InfraConfig {
            provider: "hetzner".into(),
            region: "fsn1".into(),
            ..Default::default()
        };
        let host = registry.host_config(&params(&config)).unwrap();
        assert_eq!(host.plan, "cx22");
        assert_eq!(host.name, "web-tunnel");
    }

    #[test]
    fn ec2_user_data_is_base64() {
        let config = InfraConfig {
            provider: "ec2".into(),
            region: "eu-west-1".into(),
            vpc_id: "vpc-1".into(),
            subnet_id: "subnet-1".into(),
            ..Default::default()
        };
        let host = ec2(&params(&config));
        assert_eq!(
            BASE64_STANDARD.decode(&host.user_data).unwrap(),
            b"#!/bin/bash\ntrue\n"
        );
        assert_eq!(host.additional.get("ports").unwrap(), "80,443");
        assert_eq!(host.additional.get("vpc-id").unwrap(), "vpc-1");
        assert_eq!(host.additional.get("subnet-id").unwrap(), "subnet-1");
        assert_eq!(host.additional.get("control-port").unwrap(), "8123");
    }

    #[test]
    fn equinix_metal_carries_project_id() {
        let config = InfraConfig {
            provider: "equinix-metal".into(),
            project_id: "proj-123".into(),
            ..Default::default()
        };
        let host = equinix_metal(&params(&config));
        assert_eq!(host.additional.get("project-id").unwrap(), "proj-123");
    }
}
