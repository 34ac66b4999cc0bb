//! Tunnel client deployment.
//!
//! Builds the single-replica in-cluster workload that dials out to the exit
//! node and forwards traffic to the target service. The set of forwarded
//! ports is recorded in an annotation so later reconciles can detect when
//! the service's ports changed and the deployment needs rebuilding.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Container, PodSpec, PodTemplateSpec, ResourceRequirements, SecretVolumeSource,
            Service, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::api::resource::Quantity,
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{core::ObjectMeta, Resource, ResourceExt};

use crate::cloud::CONTROL_PORT;
use crate::error::ReconcileError;
use crate::ops::{Tunnel, PORTS_ANNOTATION};

/// Name of the license secret mirrored into each managed namespace.
pub const LICENSE_SECRET_NAME: &str = "tunnel-license";

const TOKEN_MOUNT_PATH: &str = "/var/tunnel/auth-token";
const LICENSE_MOUNT_PATH: &str = "/var/tunnel/license";

/// Comma-joined port list for a service, e.g. `"80,443,8080"`.
/// Deterministic for a given service so it can be compared byte-for-byte
/// against the deployment's ports annotation.
pub fn get_ports_string(service: &Service) -> String {
    let ports = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref());

    match ports {
        Some(ports) => ports
            .iter()
            .map(|p| p.port.to_string())
            .collect::<Vec<_>>()
            .join(","),
        None => String::new(),
    }
}

/// Name of the client deployment for a tunnel. A previously recorded
/// reference wins so updates land on the same object.
pub fn client_deployment_name(tunnel: &Tunnel) -> String {
    tunnel
        .status
        .as_ref()
        .and_then(|status| status.client_deployment_ref.as_ref())
        .map(|r| r.name.clone())
        .unwrap_or_else(|| format!("{}-client", tunnel.name_any()))
}

pub fn make_client_deployment(
    tunnel: &Tunnel,
    client_image: &str,
    ports: &str,
    max_memory: &str,
) -> Result<Deployment, ReconcileError> {
    let name = client_deployment_name(tunnel);

    let upstream = tunnel
        .spec
        .service_ref
        .as_ref()
        .ok_or_else(|| ReconcileError::NoServiceRef(tunnel.name_any()))?
        .name
        .clone();

    let host_ip = tunnel
        .status
        .as_ref()
        .map(|status| status.host_ip.clone())
        .unwrap_or_default();

    let auth_secret = tunnel
        .auth_secret_name()
        .ok_or_else(|| ReconcileError::EmptyAuthToken(tunnel.name_any()))?;

    let oref = tunnel.controller_owner_ref(&()).ok_or_else(|| {
        ReconcileError::OperatorError(color_eyre::eyre::eyre!(
            "tunnel {} has no uid, cannot own a deployment",
            tunnel.name_any()
        ))
    })?;

    let container = Container {
        name: "tunnel-client".to_string(),
        image: Some(client_image.to_string()),
        command: Some(vec!["tunnel-client".to_string()]),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(vec![
            "tcp".to_string(),
            "client".to_string(),
            format!("--url=wss://{host_ip}:{CONTROL_PORT}/connect"),
            format!("--token-file={TOKEN_MOUNT_PATH}/token"),
            format!("--upstream={upstream}"),
            format!("--ports={ports}"),
            format!("--license-file={LICENSE_MOUNT_PATH}/license"),
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "auth-token-volume".to_string(),
                mount_path: TOKEN_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "license-volume".to_string(),
                mount_path: LICENSE_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("25m".to_string())),
                ("memory".to_string(), Quantity("25Mi".to_string())),
            ])),
            limits: Some(BTreeMap::from([(
                "memory".to_string(),
                Quantity(max_memory.to_string()),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    };

    let labels = BTreeMap::from([("app.kubernetes.io/name".to_string(), name.clone())]);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: tunnel.namespace(),
            annotations: Some(BTreeMap::from([(
                PORTS_ANNOTATION.to_string(),
                ports.to_string(),
            )])),
            owner_references: Some(vec![oref]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![
                        Volume {
                            name: "auth-token-volume".to_string(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(auth_secret),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: "license-volume".to_string(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(LICENSE_SECRET_NAME.to_string()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use crate::ops::{ResourceRef, TunnelSpec, TunnelStatus};

    fn service_with_ports(ports: &[i32]) -> Service {
        Service {
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                ports: Some(
                    ports
                        .iter()
                        .map(|p| ServicePort {
                            port: *p,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn active_tunnel() -> Tunnel {
        let mut tunnel = Tunnel::new(
            "web-tunnel",
            TunnelSpec {
                service_ref: Some(ResourceRef {
                    name: "web".into(),
                    namespace: "default".into(),
                }),
                ..Default::default()
            },
        );
        tunnel.metadata.namespace = Some("default".into());
        tunnel.metadata.uid = Some("uid-1".into());
        tunnel.status = Some(TunnelStatus {
            host_status: "active".into(),
            host_ip: "1.2.3.4".into(),
            auth_token_ref: Some(ResourceRef {
                name: "web-tunnel".into(),
                namespace: "default".into(),
            }),
            ..Default::default()
        });
        tunnel
    }

    #[test]
    fn ports_string_joins_in_order() {
        let svc = service_with_ports(&[80, 443, 8080]);
        assert_eq!(get_ports_string(&svc), "80,443,8080");
        // Deterministic: building twice yields identical output.
        assert_eq!(get_ports_string(&svc), get_ports_string(&svc));
    }

    #[test]
    fn ports_string_empty_without_ports() {
        assert_eq!(get_ports_string(&Service::default()), "");
    }

    #[test]
    fn deployment_carries_ports_annotation_and_url() {
        let tunnel = active_tunnel();
        let deployment = make_client_deployment(&tunnel, "img:1", "80,443", "128Mi").unwrap();

        let annotations = deployment.metadata.annotations.unwrap();
        assert_eq!(annotations.get(PORTS_ANNOTATION).unwrap(), "80,443");

        let container = &deployment.spec.unwrap().template.spec.unwrap().containers[0];
        let args = container.args.as_ref().unwrap();
        assert!(args.contains(&"--url=wss://1.2.3.4:8123/connect".to_string()));
        assert!(args.contains(&"--upstream=web".to_string()));
        assert!(args.contains(&"--ports=80,443".to_string()));
    }

    #[test]
    fn deployment_name_prefers_recorded_ref() {
        let mut tunnel = active_tunnel();
        assert_eq!(client_deployment_name(&tunnel), "web-tunnel-client");

        tunnel.status.as_mut().unwrap().client_deployment_ref = Some(ResourceRef {
            name: "legacy-client".into(),
            namespace: "default".into(),
        });
        assert_eq!(client_deployment_name(&tunnel), "legacy-client");
    }

    #[test]
    fn deployment_requires_service_ref() {
        let mut tunnel = active_tunnel();
        tunnel.spec.service_ref = None;
        let err = make_client_deployment(&tunnel, "img:1", "80", "128Mi").unwrap_err();
        assert!(matches!(err, ReconcileError::NoServiceRef(_)));
    }
}
