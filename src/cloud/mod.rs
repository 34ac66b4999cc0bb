//! Cloud provisioning backends.
//!
//! Every backend implements the same [`Provisioner`] contract: kick off a
//! host creation, poll its status by ID, and tear it down again. Providers
//! do not retry internally; retry policy belongs to the reconcile queue.

use std::collections::BTreeMap;

use async_trait::async_trait;
use color_eyre::Result;

use crate::config::InfraConfig;
use crate::error::ReconcileError;

pub mod digitalocean;
pub mod ec2;
pub mod equinix_metal;
pub mod hetzner;
pub mod host_config;
pub mod linode;
pub mod pwgen;
pub mod scaleway;
pub mod userdata;

/// Normalized status value for a host that is booted and reachable.
/// Providers map their native "running"/"ok" states onto this sentinel so
/// the reconciler has a single equality check.
pub const ACTIVE_STATUS: &str = "active";

/// Control-plane port the tunnel server listens on.
pub const CONTROL_PORT: u16 = 8123;

/// Transient description of a host to create. Built fresh for every
/// provisioning attempt, never stored.
#[derive(Debug, Clone, Default)]
pub struct BasicHost {
    pub name: String,
    pub os: String,
    pub plan: String,
    pub region: String,
    pub user_data: String,
    /// Provider-specific extension bag: project IDs, firewall rules,
    /// VPC/subnet IDs and the like.
    pub additional: BTreeMap<String, String>,
}

/// A provisioned (or provisioning) cloud host as reported by a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionedHost {
    /// Opaque provider-defined identifier. Some providers compose several
    /// fields into this string; see [`scaleway::ServerId`].
    pub id: String,
    pub ip: String,
    pub status: String,
}

/// Teardown request. When `id` is empty the provider resolves the host by
/// scanning `list()` for a matching IP; this covers tunnels whose host was
/// recorded only through the service's old external IP.
#[derive(Debug, Clone, Default)]
pub struct HostDeleteRequest {
    pub id: String,
    pub ip: String,
    pub region: String,
    pub zone: String,
}

#[async_trait]
pub trait Provisioner {
    /// Start creating a host. Must not block beyond the initial API call;
    /// boot progress is observed later through [`Provisioner::status`].
    async fn provision(&self, host: BasicHost) -> Result<ProvisionedHost>;

    /// Poll the current state of a host. An empty `ip` is expected while
    /// the provider has not assigned an address yet and is not an error.
    async fn status(&self, id: &str) -> Result<ProvisionedHost>;

    /// Tear a host down, by ID or by IP lookup.
    async fn delete(&self, req: HostDeleteRequest) -> Result<()>;

    /// Enumerate hosts visible to this provisioner, used for IP-based
    /// deletion lookups.
    async fn list(&self) -> Result<Vec<ProvisionedHost>>;
}

pub type BoxedProvisioner = Box<dyn Provisioner + Send + Sync>;

type ProvisionerFactory = fn(&InfraConfig) -> Result<BoxedProvisioner>;
type HostConfigBuilder = fn(&host_config::HostParams<'_>) -> BasicHost;

/// One registered provider: how to build its host descriptor and how to
/// construct its provisioner. Adding a provider is one `register` call.
struct ProviderEntry {
    host_config: HostConfigBuilder,
    factory: ProvisionerFactory,
}

/// Registry mapping provider names to their builders, populated once at
/// startup. Replaces per-provider match arms scattered through the
/// reconciler.
pub struct ProviderRegistry {
    entries: BTreeMap<&'static str, ProviderEntry>,
}

impl ProviderRegistry {
    fn register(
        &mut self,
        name: &'static str,
        host_config: HostConfigBuilder,
        factory: ProvisionerFactory,
    ) {
        self.entries.insert(name, ProviderEntry { host_config, factory });
    }

    pub fn provisioner(
        &self,
        config: &InfraConfig,
    ) -> Result<BoxedProvisioner, ReconcileError> {
        let entry = self
            .entries
            .get(config.provider.as_str())
            .ok_or_else(|| ReconcileError::UnsupportedProvider(config.provider.clone()))?;
        (entry.factory)(config).map_err(ReconcileError::OperatorError)
    }

    pub fn host_config(
        &self,
        params: &host_config::HostParams<'_>,
    ) -> Result<BasicHost, ReconcileError> {
        let entry = self
            .entries
            .get(params.config.provider.as_str())
            .ok_or_else(|| {
                ReconcileError::UnsupportedProvider(params.config.provider.clone())
            })?;

        let mut host = (entry.host_config)(params);
        // An explicit plan always wins over the provider default.
        if !params.config.plan.is_empty() {
            host.plan = params.config.plan.clone();
        }
        Ok(host)
    }

    pub fn supported(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        let mut registry = ProviderRegistry {
            entries: BTreeMap::new(),
        };
        registry.register(
            "digitalocean",
            host_config::digitalocean,
            digitalocean::from_config,
        );
        registry.register("ec2", host_config::ec2, ec2::from_config);
        registry.register("linode", host_config::linode, linode::from_config);
        registry.register("hetzner", host_config::hetzner, hetzner::from_config);
        registry.register("scaleway", host_config::scaleway, scaleway::from_config);
        registry.register(
            "equinix-metal",
            host_config::equinix_metal,
            equinix_metal::from_config,
        );
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_is_rejected() {
        let registry = ProviderRegistry::default();
        let config = InfraConfig {
            provider: "gce".into(),
            ..Default::default()
        };
        let err = registry.provisioner(&config).unwrap_err();
        assert!(matches!(err, ReconcileError::UnsupportedProvider(p) if p == "gce"));
    }

    #[test]
    fn registry_lists_providers() {
        let registry = ProviderRegistry::default();
        let supported = registry.supported();
        assert!(supported.contains(&"digitalocean"));
        assert!(supported.contains(&"ec2"));
        assert!(supported.contains(&"scaleway"));
    }
}
