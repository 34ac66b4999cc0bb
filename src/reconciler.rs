//! Tunnel reconciliation.
//!
//! `sync_handler` is the single level-triggered entry point the workers call
//! with a `namespace/name` key. A key may name a LoadBalancer Service (which
//! drives tunnel creation and deletion according to the manage policy) or a
//! Tunnel (which drives the host state machine). Each pass performs at most
//! one forward state transition and relies on requeues to make progress.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        core::v1::{Secret, Service},
    },
    ByteString,
};
use kube::{
    api::{Patch, PatchParams, PostParams},
    core::ObjectMeta,
    runtime::events::{Event, EventType, Recorder},
    Api, Client, Resource, ResourceExt,
};
use tracing::{debug, error, info, warn};

use crate::cloud::{HostDeleteRequest, ProviderRegistry, ProvisionedHost, ACTIVE_STATUS};
use crate::cloud::{host_config::HostParams, pwgen, userdata};
use crate::config::InfraConfig;
use crate::deployment::{
    client_deployment_name, get_ports_string, make_client_deployment, LICENSE_SECRET_NAME,
};
use crate::error::ReconcileError;
use crate::ops::{ResourceRef, Tunnel, TunnelSpec, HOST_PROVISIONING, MANAGED_ANNOTATION};
use crate::queue::WorkQueue;

const OPERATOR_MANAGER: &str = "tunnel-operator";

/// How long to wait before polling a host that is still provisioning.
const PROVISIONING_POLL: Duration = Duration::from_secs(20);

pub struct Context {
    pub client: Client,
    pub infra: InfraConfig,
    pub registry: ProviderRegistry,
    pub recorder: Recorder,
    pub queue: Arc<WorkQueue>,
    pub operator_namespace: String,
}

/// Whether the operator should manage a given LoadBalancer service.
/// An explicit annotation always wins; otherwise the `annotated_only`
/// setting decides the default.
pub fn should_manage(service: &Service, annotated_only: bool) -> bool {
    match service
        .annotations()
        .get(MANAGED_ANNOTATION)
        .map(String::as_str)
    {
        Some(value) => value == "1" || value.parse::<bool>().unwrap_or(false),
        None => !annotated_only,
    }
}

/// Byte-for-byte comparison of the license payloads of two secrets.
pub fn license_in_sync(source: Option<&ByteString>, target: Option<&ByteString>) -> bool {
    match (source, target) {
        (Some(src), Some(dst)) => src.0 == dst.0,
        (None, None) => true,
        _ => false,
    }
}

pub async fn sync_handler(ctx: &Context, key: &str) -> Result<(), ReconcileError> {
    let Some((namespace, name)) = key.split_once('/') else {
        warn!(key, "Invalid resource key, skipping");
        return Ok(());
    };

    let services: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
    if let Some(service) = services.get_opt(name).await? {
        return ensure_tunnel_for_service(ctx, &service).await;
    }

    let tunnels: Api<Tunnel> = Api::namespaced(ctx.client.clone(), namespace);
    match tunnels.get_opt(name).await? {
        Some(tunnel) => sync_tunnel(ctx, key, &tunnel).await,
        None => {
            // Stale key, the object is gone.
            debug!(key, "No service or tunnel for key");
            Ok(())
        }
    }
}

/// Create or remove the Tunnel backing a LoadBalancer service, following the
/// manage policy. The created tunnel is owned by the service so it is garbage
/// collected along with it.
async fn ensure_tunnel_for_service(ctx: &Context, service: &Service) -> Result<(), ReconcileError> {
    let svc_type = service
        .spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref());
    if svc_type != Some("LoadBalancer") {
        return Ok(());
    }

    let namespace = service.namespace().unwrap_or_default();
    let tunnel_name = format!("{}-tunnel", service.name_any());
    let tunnels: Api<Tunnel> = Api::namespaced(ctx.client.clone(), &namespace);
    let existing = tunnels.get_opt(&tunnel_name).await?;

    let manage = should_manage(service, ctx.infra.annotated_only);
    match (manage, existing) {
        (true, None) => {
            let oref = service.controller_owner_ref(&()).ok_or_else(|| {
                ReconcileError::OperatorError(color_eyre::eyre::eyre!(
                    "service {} has no uid, cannot own a tunnel",
                    service.name_any()
                ))
            })?;

            let mut tunnel = Tunnel::new(
                &tunnel_name,
                TunnelSpec {
                    service_ref: Some(ResourceRef {
                        name: service.name_any(),
                        namespace: namespace.clone(),
                    }),
                    update_service_ip: true,
                    ..Default::default()
                },
            );
            tunnel.metadata.namespace = Some(namespace.clone());
            tunnel.metadata.owner_references = Some(vec![oref]);

            info!(service = %service.name_any(), tunnel = %tunnel_name, "Creating tunnel for service");
            tunnels.create(&PostParams::default(), &tunnel).await?;

            let serverside = PatchParams::apply(OPERATOR_MANAGER);
            tunnels
                .patch_status(
                    &tunnel_name,
                    &serverside,
                    &Patch::Merge(serde_json::json!({
                        "status": { "generated": true }
                    })),
                )
                .await?;
        }
        (false, Some(tunnel)) => {
            // Policy no longer allows managing this service. Deleting the
            // tunnel triggers host teardown through the watcher.
            info!(tunnel = %tunnel.name_any(), "Manage policy disallows service, deleting tunnel");
            tunnels
                .delete(&tunnel.name_any(), &Default::default())
                .await?;
        }
        _ => {}
    }
    Ok(())
}

/// Drive the tunnel host state machine one step forward.
async fn sync_tunnel(ctx: &Context, key: &str, tunnel: &Tunnel) -> Result<(), ReconcileError> {
    let namespace = tunnel.namespace().unwrap_or_default();

    match tunnel.host_status() {
        "" => sync_new_tunnel(ctx, key, tunnel, &namespace).await?,
        HOST_PROVISIONING => sync_provisioning_tunnel(ctx, key, tunnel, &namespace).await?,
        ACTIVE_STATUS => sync_active_tunnel(ctx, tunnel, &namespace).await?,
        other => {
            warn!(tunnel = %tunnel.name_any(), status = other, "Unknown host status, ignoring");
            return Ok(());
        }
    }

    ctx.recorder
        .publish(
            &Event {
                type_: EventType::Normal,
                reason: "Synced".into(),
                note: Some("Tunnel synced successfully".into()),
                action: "Sync".into(),
                secondary: None,
            },
            &tunnel.object_ref(&()),
        )
        .await?;
    Ok(())
}

/// First pass ensures the auth token secret; once the secret exists the host
/// is provisioned and its id recorded.
async fn sync_new_tunnel(
    ctx: &Context,
    key: &str,
    tunnel: &Tunnel,
    namespace: &str,
) -> Result<(), ReconcileError> {
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    let secret_name = tunnel
        .auth_secret_name()
        .unwrap_or_else(|| tunnel.name_any());

    let Some(secret) = secrets.get_opt(&secret_name).await? else {
        create_auth_secret(ctx, tunnel, namespace, &secret_name).await?;
        // Provision on the next pass, once the secret is observable.
        return Ok(());
    };

    let token = secret
        .data
        .as_ref()
        .and_then(|data| data.get("token"))
        .map(|b| String::from_utf8_lossy(&b.0).to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ReconcileError::EmptyAuthToken(secret_name.clone()))?;

    let service = tunnel_service(ctx, tunnel).await?;
    let ports = get_ports_string(&service);
    if ports.is_empty() {
        return Err(ReconcileError::NoPortsSet);
    }

    let user_data =
        userdata::make_exit_server_userdata(&token, &ctx.infra.get_server_version());
    let host = ctx.registry.host_config(&HostParams {
        tunnel_name: &tunnel.name_any(),
        ports: &ports,
        user_data: &user_data,
        config: &ctx.infra,
    })?;

    let provisioner = ctx.registry.provisioner(&ctx.infra)?;
    info!(tunnel = %tunnel.name_any(), provider = %ctx.infra.provider, "Provisioning exit node");
    let provisioned = provisioner.provision(host).await?;

    let tunnels: Api<Tunnel> = Api::namespaced(ctx.client.clone(), namespace);
    tunnels
        .patch_status(
            &tunnel.name_any(),
            &PatchParams::apply(OPERATOR_MANAGER),
            &Patch::Merge(serde_json::json!({
                "status": {
                    "hostStatus": HOST_PROVISIONING,
                    "hostId": provisioned.id,
                }
            })),
        )
        .await?;

    info!(tunnel = %tunnel.name_any(), host_id = %provisioned.id, "Host created, awaiting IP");
    ctx.queue.add_after(key, PROVISIONING_POLL);
    Ok(())
}

async fn create_auth_secret(
    ctx: &Context,
    tunnel: &Tunnel,
    namespace: &str,
    secret_name: &str,
) -> Result<(), ReconcileError> {
    let oref = tunnel.controller_owner_ref(&()).ok_or_else(|| {
        ReconcileError::OperatorError(color_eyre::eyre::eyre!(
            "tunnel {} has no uid, cannot own a secret",
            tunnel.name_any()
        ))
    })?;

    let token = pwgen::generate_token();
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![oref]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "token".to_string(),
            ByteString(token.into_bytes()),
        )])),
        ..Default::default()
    };

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    info!(tunnel = %tunnel.name_any(), secret = secret_name, "Creating auth token secret");
    secrets.create(&PostParams::default(), &secret).await?;

    let tunnels: Api<Tunnel> = Api::namespaced(ctx.client.clone(), namespace);
    tunnels
        .patch_status(
            &tunnel.name_any(),
            &PatchParams::apply(OPERATOR_MANAGER),
            &Patch::Merge(serde_json::json!({
                "status": {
                    "authTokenRef": ResourceRef {
                        name: secret_name.to_string(),
                        namespace: namespace.to_string(),
                    }
                }
            })),
        )
        .await?;
    Ok(())
}

/// Outcome of one poll of a provisioning host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProvisioningStep {
    /// No host id was ever recorded; the host status stays where it is and
    /// the record needs manual attention.
    Stalled,
    /// Host exists but is not reachable yet, poll again later.
    Wait,
    /// Host is up with a public IP, move to "active".
    Activate(String),
}

/// Pure transition decision for a tunnel in "provisioning". The host status
/// only ever moves forward, so nothing here may yield an earlier state.
pub(crate) fn provisioning_step(
    host_id: &str,
    polled: Option<&ProvisionedHost>,
) -> ProvisioningStep {
    if host_id.is_empty() {
        return ProvisioningStep::Stalled;
    }
    match polled {
        Some(host) if host.status == ACTIVE_STATUS && !host.ip.is_empty() => {
            ProvisioningStep::Activate(host.ip.clone())
        }
        _ => ProvisioningStep::Wait,
    }
}

/// Poll the provider until the host reports active with a public IP, then
/// record the IP and wire it onto the service.
async fn sync_provisioning_tunnel(
    ctx: &Context,
    key: &str,
    tunnel: &Tunnel,
    namespace: &str,
) -> Result<(), ReconcileError> {
    let host_id = tunnel
        .status
        .as_ref()
        .map(|status| status.host_id.clone())
        .unwrap_or_default();

    let step = if host_id.is_empty() {
        provisioning_step(&host_id, None)
    } else {
        let provisioner = ctx.registry.provisioner(&ctx.infra)?;
        let host = provisioner.status(&host_id).await?;
        provisioning_step(&host_id, Some(&host))
    };

    match step {
        ProvisioningStep::Stalled => {
            error!(tunnel = %tunnel.name_any(), "Provisioning tunnel has no host id recorded, manual cleanup required");
            Ok(())
        }
        ProvisioningStep::Wait => {
            debug!(tunnel = %tunnel.name_any(), "Host not ready yet");
            ctx.queue.add_after(key, PROVISIONING_POLL);
            Ok(())
        }
        ProvisioningStep::Activate(ip) => {
            let tunnels: Api<Tunnel> = Api::namespaced(ctx.client.clone(), namespace);
            tunnels
                .patch_status(
                    &tunnel.name_any(),
                    &PatchParams::apply(OPERATOR_MANAGER),
                    &Patch::Merge(serde_json::json!({
                        "status": {
                            "hostStatus": ACTIVE_STATUS,
                            "hostIP": ip,
                        }
                    })),
                )
                .await?;

            info!(tunnel = %tunnel.name_any(), ip = %ip, "Host is active");
            update_service(ctx, tunnel, &ip).await?;
            Ok(())
        }
    }
}

/// Steady state: keep the license mirrored, the client deployment current
/// and the service IP in place.
async fn sync_active_tunnel(
    ctx: &Context,
    tunnel: &Tunnel,
    namespace: &str,
) -> Result<(), ReconcileError> {
    sync_tunnel_license(ctx, namespace).await?;

    let service = tunnel_service(ctx, tunnel).await?;
    let ports = get_ports_string(&service);
    if ports.is_empty() {
        return Err(ReconcileError::NoPortsSet);
    }

    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), namespace);
    let name = client_deployment_name(tunnel);
    let existing = deployments.get_opt(&name).await?;

    let current_ports = existing
        .as_ref()
        .and_then(|d| d.annotations().get(crate::ops::PORTS_ANNOTATION).cloned());

    if existing.is_none() || current_ports.as_deref() != Some(ports.as_str()) {
        // A failed deployment update must not kick the tunnel into backoff;
        // the service IP sync below still has to run. The deployment watcher
        // re-enqueues the tunnel for another attempt.
        if let Err(e) = apply_client_deployment(ctx, tunnel, namespace, &name, &ports).await {
            warn!(tunnel = %tunnel.name_any(), deployment = %name, "Failed to apply client deployment: {e}");
        }
    }

    let host_ip = tunnel
        .status
        .as_ref()
        .map(|status| status.host_ip.clone())
        .unwrap_or_default();
    update_service(ctx, tunnel, &host_ip).await?;
    Ok(())
}

async fn apply_client_deployment(
    ctx: &Context,
    tunnel: &Tunnel,
    namespace: &str,
    name: &str,
    ports: &str,
) -> Result<(), ReconcileError> {
    let desired = make_client_deployment(
        tunnel,
        &ctx.infra.get_client_image(),
        ports,
        &ctx.infra.get_max_client_memory(),
    )?;

    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), namespace);
    info!(tunnel = %tunnel.name_any(), deployment = name, ports, "Applying client deployment");
    deployments
        .patch(
            name,
            &PatchParams::apply(OPERATOR_MANAGER).force(),
            &Patch::Apply(&desired),
        )
        .await?;

    let tunnels: Api<Tunnel> = Api::namespaced(ctx.client.clone(), namespace);
    tunnels
        .patch_status(
            &tunnel.name_any(),
            &PatchParams::apply(OPERATOR_MANAGER),
            &Patch::Merge(serde_json::json!({
                "status": {
                    "clientDeploymentRef": ResourceRef {
                        name: name.to_string(),
                        namespace: namespace.to_string(),
                    }
                }
            })),
        )
        .await?;
    Ok(())
}

/// Mirror the operator namespace's license secret into the tunnel namespace.
/// Tunnels work without a license secret, so a missing source is not an error.
async fn sync_tunnel_license(ctx: &Context, namespace: &str) -> Result<(), ReconcileError> {
    if namespace == ctx.operator_namespace {
        return Ok(());
    }

    let source_api: Api<Secret> = Api::namespaced(ctx.client.clone(), &ctx.operator_namespace);
    let Some(source) = source_api.get_opt(LICENSE_SECRET_NAME).await? else {
        debug!("No license secret in operator namespace, skipping sync");
        return Ok(());
    };
    let source_license = source.data.as_ref().and_then(|d| d.get("license"));

    let target_api: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    let target = target_api.get_opt(LICENSE_SECRET_NAME).await?;
    let target_license = target.as_ref().and_then(|t| t.data.as_ref()).and_then(|d| d.get("license"));

    if license_in_sync(source_license, target_license) {
        return Ok(());
    }

    let copy = Secret {
        metadata: ObjectMeta {
            name: Some(LICENSE_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: source.data.clone(),
        ..Default::default()
    };

    info!(namespace, "Syncing license secret");
    target_api
        .patch(
            LICENSE_SECRET_NAME,
            &PatchParams::apply(OPERATOR_MANAGER).force(),
            &Patch::Apply(&copy),
        )
        .await?;
    Ok(())
}

/// externalIPs after applying one change: a non-empty `ip` is appended once,
/// an empty `ip` strips only the previously recorded host IP. IPs set by
/// users or other controllers are preserved either way.
fn apply_external_ip(mut ips: Vec<String>, ip: &str, recorded: &str) -> Vec<String> {
    if ip.is_empty() {
        ips.retain(|existing| existing != recorded);
    } else if !ips.iter().any(|existing| existing == ip) {
        ips.push(ip.to_string());
    }
    ips
}

/// LoadBalancer ingress mirroring the full externalIPs set, not just the
/// tunnel's own IP.
fn ingress_from_ips(ips: &[String]) -> serde_json::Value {
    serde_json::Value::Array(
        ips.iter()
            .map(|ip| serde_json::json!({ "ip": ip }))
            .collect(),
    )
}

/// Set or clear the exit node IP on the target service. Only services that
/// own their tunnel and opted into IP updates are touched. Passing an empty
/// `ip` removes the previously recorded host IP.
pub async fn update_service(ctx: &Context, tunnel: &Tunnel, ip: &str) -> Result<(), ReconcileError> {
    let Some(status) = tunnel.status.as_ref() else {
        return Ok(());
    };
    if !tunnel.spec.update_service_ip || !tunnel.owns_service() {
        debug!(tunnel = %tunnel.name_any(), "Tunnel does not update its service, skipping");
        return Ok(());
    }

    let service_ref = tunnel
        .spec
        .service_ref
        .as_ref()
        .ok_or_else(|| ReconcileError::NoServiceRef(tunnel.name_any()))?;

    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &service_ref.namespace);
    let Some(service) = services.get_opt(&service_ref.name).await? else {
        debug!(service = %service_ref.name, "Service is gone, nothing to update");
        return Ok(());
    };

    let external_ips = apply_external_ip(
        service
            .spec
            .as_ref()
            .and_then(|spec| spec.external_ips.clone())
            .unwrap_or_default(),
        ip,
        &status.host_ip,
    );

    let serverside = PatchParams::apply(OPERATOR_MANAGER);
    services
        .patch(
            &service_ref.name,
            &serverside,
            &Patch::Merge(serde_json::json!({
                "spec": { "externalIPs": external_ips }
            })),
        )
        .await?;

    let ingress = ingress_from_ips(&external_ips);
    services
        .patch_status(
            &service_ref.name,
            &serverside,
            &Patch::Merge(serde_json::json!({
                "status": { "loadBalancer": { "ingress": ingress } }
            })),
        )
        .await?;

    info!(service = %service_ref.name, ip, "Updated service IP");
    Ok(())
}

/// Teardown target for a deleted tunnel, when there is anything to delete.
/// A request with an empty `id` is still issued so the provider can resolve
/// the host by scanning its `list` output for the recorded IP.
fn teardown_request(status: &crate::ops::TunnelStatus, infra: &InfraConfig) -> Option<HostDeleteRequest> {
    if status.host_id.is_empty() && status.host_ip.is_empty() {
        return None;
    }
    Some(HostDeleteRequest {
        id: status.host_id.clone(),
        ip: status.host_ip.clone(),
        region: infra.region.clone(),
        zone: infra.zone.clone(),
    })
}

/// Host teardown when a tunnel is deleted. Both the provider delete and the
/// service cleanup are best effort, a half-failed teardown must not wedge the
/// queue on a key that no longer resolves.
pub async fn handle_tunnel_deleted(ctx: &Context, tunnel: &Tunnel) {
    let Some(status) = tunnel.status.as_ref() else {
        return;
    };

    if let Some(req) = teardown_request(status, &ctx.infra) {
        match ctx.registry.provisioner(&ctx.infra) {
            Ok(provisioner) => {
                let (host_id, host_ip) = (req.id.clone(), req.ip.clone());
                match provisioner.delete(req).await {
                    Ok(()) => info!(tunnel = %tunnel.name_any(), host_id, host_ip, "Deleted exit node"),
                    Err(e) => warn!(tunnel = %tunnel.name_any(), host_id, host_ip, "Failed to delete exit node: {e}"),
                }
            }
            Err(e) => warn!(tunnel = %tunnel.name_any(), "No provisioner for teardown: {e}"),
        }
    }

    if let Err(e) = update_service(ctx, tunnel, "").await {
        warn!(tunnel = %tunnel.name_any(), "Failed to clear service IP: {e}");
    }
}

async fn tunnel_service(ctx: &Context, tunnel: &Tunnel) -> Result<Service, ReconcileError> {
    let service_ref = tunnel
        .spec
        .service_ref
        .as_ref()
        .ok_or_else(|| ReconcileError::NoServiceRef(tunnel.name_any()))?;
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &service_ref.namespace);
    Ok(services.get(&service_ref.name).await?)
}

/// Namespace the operator runs in: the serviceaccount mount, then the
/// NAMESPACE variable, then "default".
pub fn read_namespace() -> String {
    if let Ok(ns) = std::fs::read_to_string(
        "/var/run/secrets/kubernetes.io/serviceaccount/namespace",
    ) {
        let ns = ns.trim();
        if !ns.is_empty() {
            return ns.to_string();
        }
    }
    std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::TunnelStatus;
    use k8s_openapi::api::core::v1::ServiceSpec;

    fn annotated_service(value: Option<&str>) -> Service {
        let mut svc = Service {
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        if let Some(value) = value {
            svc.metadata.annotations = Some(BTreeMap::from([(
                MANAGED_ANNOTATION.to_string(),
                value.to_string(),
            )]));
        }
        svc
    }

    #[test]
    fn manage_policy_defaults_follow_annotated_only() {
        let svc = annotated_service(None);
        assert!(should_manage(&svc, false));
        assert!(!should_manage(&svc, true));
    }

    #[test]
    fn manage_policy_annotation_wins() {
        assert!(should_manage(&annotated_service(Some("true")), true));
        assert!(should_manage(&annotated_service(Some("1")), true));
        assert!(!should_manage(&annotated_service(Some("false")), false));
        assert!(!should_manage(&annotated_service(Some("garbage")), false));
    }

    #[test]
    fn license_sync_compares_bytes() {
        let a = ByteString(b"lic-a".to_vec());
        let b = ByteString(b"lic-b".to_vec());
        assert!(license_in_sync(Some(&a), Some(&a.clone())));
        assert!(!license_in_sync(Some(&a), Some(&b)));
        assert!(!license_in_sync(Some(&a), None));
        assert!(license_in_sync(None, None));
    }

    #[test]
    fn external_ip_updates_preserve_foreign_ips() {
        let ips = apply_external_ip(vec!["9.9.9.9".into()], "1.2.3.4", "");
        assert_eq!(ips, vec!["9.9.9.9".to_string(), "1.2.3.4".to_string()]);

        // Adding again is idempotent.
        let ips = apply_external_ip(ips, "1.2.3.4", "");
        assert_eq!(ips.len(), 2);

        // Clearing strips only the recorded host IP.
        let ips = apply_external_ip(ips, "", "1.2.3.4");
        assert_eq!(ips, vec!["9.9.9.9".to_string()]);
    }

    #[test]
    fn ingress_mirrors_full_external_ip_set() {
        let ips = vec!["9.9.9.9".to_string(), "1.2.3.4".to_string()];
        assert_eq!(
            ingress_from_ips(&ips),
            serde_json::json!([{ "ip": "9.9.9.9" }, { "ip": "1.2.3.4" }])
        );
        assert_eq!(ingress_from_ips(&[]), serde_json::json!([]));
    }

    #[test]
    fn teardown_falls_back_to_ip_lookup() {
        let infra = InfraConfig {
            region: "lon1".into(),
            ..Default::default()
        };

        let status = TunnelStatus {
            host_ip: "1.2.3.4".into(),
            ..Default::default()
        };
        let req = teardown_request(&status, &infra).unwrap();
        assert!(req.id.is_empty());
        assert_eq!(req.ip, "1.2.3.4");
        assert_eq!(req.region, "lon1");

        let empty = TunnelStatus::default();
        assert!(teardown_request(&empty, &infra).is_none());
    }

    #[test]
    fn host_status_only_moves_forward() {
        fn rank(status: &str) -> usize {
            match status {
                "" => 0,
                HOST_PROVISIONING => 1,
                ACTIVE_STATUS => 2,
                other => panic!("unexpected status {other}"),
            }
        }

        let polls = [
            ProvisionedHost::default(),
            ProvisionedHost {
                status: "provisioning".into(),
                ..Default::default()
            },
            ProvisionedHost {
                status: ACTIVE_STATUS.into(),
                ..Default::default()
            },
            ProvisionedHost {
                status: ACTIVE_STATUS.into(),
                ip: "1.2.3.4".into(),
                ..Default::default()
            },
            // A late stale poll must not pull the tunnel back.
            ProvisionedHost {
                status: "provisioning".into(),
                ..Default::default()
            },
        ];

        let mut status = HOST_PROVISIONING.to_string();
        for polled in &polls {
            let next = match provisioning_step("vm-123", Some(polled)) {
                ProvisioningStep::Activate(_) => ACTIVE_STATUS.to_string(),
                ProvisioningStep::Wait | ProvisioningStep::Stalled => status.clone(),
            };
            assert!(rank(&next) >= rank(&status), "regressed {status} -> {next}");
            status = next;
        }
        assert_eq!(status, ACTIVE_STATUS);
    }

    #[test]
    fn missing_host_id_stalls_in_place() {
        assert_eq!(provisioning_step("", None), ProvisioningStep::Stalled);
        // A stalled record keeps its current status; nothing maps it back
        // to the empty state.
        assert_eq!(
            provisioning_step("vm-123", Some(&ProvisionedHost::default())),
            ProvisioningStep::Wait
        );
    }
}
