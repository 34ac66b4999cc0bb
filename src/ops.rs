use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const MANAGED_ANNOTATION: &str = "tunnel-operator.dev/manage";
pub const PORTS_ANNOTATION: &str = "tunnel-operator.dev/ports";

/// Host state while the exit node is being created.
pub const HOST_PROVISIONING: &str = "provisioning";

/// Reference to another namespaced resource, by name and namespace.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
pub struct ResourceRef {
    pub name: String,
    pub namespace: String,
}

#[derive(Serialize, Deserialize, Debug, CustomResource, Clone, Default, JsonSchema)]
#[kube(
    group = "tunnel-operator.dev",
    version = "v1alpha1",
    kind = "Tunnel",
    singular = "tunnel",
    struct = "Tunnel",
    status = "TunnelStatus",
    namespaced,
    printcolumn = r#"{"name":"Service","type":"string","jsonPath":".spec.serviceRef.name"}"#,
    printcolumn = r#"{"name":"HostStatus","type":"string","jsonPath":".status.hostStatus"}"#,
    printcolumn = r#"{"name":"HostIP","type":"string","jsonPath":".status.hostIP"}"#,
    printcolumn = r#"{"name":"HostID","type":"string","jsonPath":".status.hostId"}"#
)]
#[serde(rename_all = "camelCase")]
/// Tunnel is a custom resource pairing one LoadBalancer service with one
/// cloud exit node. It is usually generated by the operator when a new
/// LoadBalancer service appears, but may also be applied by hand.
pub struct TunnelSpec {
    /// The service this tunnel exposes. A tunnel without a service reference
    /// is invalid and will not be reconciled.
    pub service_ref: Option<ResourceRef>,
    /// Optional pre-existing secret holding the auth token under the `token`
    /// key. When unset, the operator generates one.
    #[serde(default)]
    pub auth_token_ref: Option<ResourceRef>,
    /// Optional reference to a license secret for the tunnel client.
    #[serde(default)]
    pub license_ref: Option<ResourceRef>,
    /// Whether the operator may write the exit node's IP onto the service's
    /// externalIPs list.
    #[serde(default)]
    pub update_service_ip: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    /// True when this tunnel was created by the operator rather than applied
    /// by a user.
    #[serde(default)]
    pub generated: bool,
    /// Lifecycle state of the exit node: "", "provisioning" or "active".
    /// Only ever moves forward.
    #[serde(default)]
    pub host_status: String,
    /// Opaque provider-specific identifier for the exit node.
    #[serde(default)]
    pub host_id: String,
    /// Public IP of the exit node, once assigned.
    #[serde(default, rename = "hostIP")]
    pub host_ip: String,
    /// Secret holding the generated auth token.
    #[serde(default)]
    pub auth_token_ref: Option<ResourceRef>,
    /// The in-cluster client deployment created for this tunnel.
    #[serde(default)]
    pub client_deployment_ref: Option<ResourceRef>,
}

impl Tunnel {
    /// Name of the secret holding the tunnel auth token, preferring a
    /// user-supplied reference over the generated one. `None` means no
    /// secret exists yet.
    pub fn auth_secret_name(&self) -> Option<String> {
        if let Some(r) = &self.spec.auth_token_ref {
            return Some(r.name.clone());
        }
        self.status
            .as_ref()
            .and_then(|s| s.auth_token_ref.as_ref())
            .map(|r| r.name.clone())
    }

    /// Whether this tunnel legitimately owns its service. Only owned
    /// services get their externalIPs rewritten, so a user can reference a
    /// service informationally without the operator clobbering it.
    pub fn owns_service(&self) -> bool {
        self.metadata
            .owner_references
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|oref| oref.kind == "Service")
    }

    pub fn host_status(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.host_status.as_str())
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn tunnel_with_owner(kind: &str) -> Tunnel {
        let mut tunnel = Tunnel::new("web-tunnel", TunnelSpec::default());
        tunnel.metadata.namespace = Some("default".into());
        tunnel.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "v1".into(),
            kind: kind.into(),
            name: "web".into(),
            uid: "1234".into(),
            ..Default::default()
        }]);
        tunnel
    }

    #[test]
    fn owns_service_requires_service_owner_ref() {
        assert!(tunnel_with_owner("Service").owns_service());
        assert!(!tunnel_with_owner("Deployment").owns_service());

        let mut orphan = Tunnel::new("web-tunnel", TunnelSpec::default());
        orphan.metadata.owner_references = None;
        assert!(!orphan.owns_service());
    }

    #[test]
    fn auth_secret_name_prefers_spec_ref() {
        let mut tunnel = Tunnel::new("web-tunnel", TunnelSpec::default());
        assert_eq!(tunnel.auth_secret_name(), None);

        tunnel.status = Some(TunnelStatus {
            auth_token_ref: Some(ResourceRef {
                name: "generated".into(),
                namespace: "default".into(),
            }),
            ..Default::default()
        });
        assert_eq!(tunnel.auth_secret_name().as_deref(), Some("generated"));

        tunnel.spec.auth_token_ref = Some(ResourceRef {
            name: "user-supplied".into(),
            namespace: "default".into(),
        });
        assert_eq!(tunnel.auth_secret_name().as_deref(), Some("user-supplied"));
    }

    #[test]
    fn host_status_defaults_to_empty() {
        let tunnel = Tunnel::new("web-tunnel", TunnelSpec::default());
        assert_eq!(tunnel.host_status(), "");
    }
}
