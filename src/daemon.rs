//! Operator daemon: watch streams feed the work queue, workers drain it.
//!
//! Three watchers run side by side. Services are diffed against the last
//! seen copy so only spec or annotation changes enqueue work. Tunnels
//! enqueue on every apply and trigger host teardown on delete. Deployments
//! are resolved back to their owning tunnel so a deleted or drifted client
//! deployment gets rebuilt. Workers start only after every watcher has
//! finished its initial list, so startup cannot race a half-synced cache.

use std::collections::HashMap;
use std::sync::Arc;

use color_eyre::Result;
use futures::StreamExt;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
use kube::{
    runtime::{
        events::{Recorder, Reporter},
        watcher,
    },
    Api, Client, ResourceExt,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::cloud::ProviderRegistry;
use crate::config::InfraConfig;
use crate::ops::Tunnel;
use crate::queue::WorkQueue;
use crate::reconciler::{self, Context};

const WORKERS: usize = 2;

fn object_key(namespace: Option<String>, name: String) -> String {
    format!("{}/{}", namespace.unwrap_or_default(), name)
}

/// Services only count when they ask for a load balancer.
fn is_load_balancer(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        == Some("LoadBalancer")
}

/// Something reconciliation cares about changed: the spec or the
/// annotations. Status churn from other controllers is ignored.
fn service_changed(prev: &Service, next: &Service) -> bool {
    prev.spec != next.spec || prev.metadata.annotations != next.metadata.annotations
}

async fn watch_services(ctx: Arc<Context>, ready: oneshot::Sender<()>) {
    let api: Api<Service> = Api::all(ctx.client.clone());
    let mut stream = std::pin::pin!(watcher(api, watcher::Config::default()));
    let mut ready = Some(ready);
    let mut seen: HashMap<String, Service> = HashMap::new();

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Init) => {}
            Ok(watcher::Event::InitApply(svc)) | Ok(watcher::Event::Apply(svc)) => {
                if !is_load_balancer(&svc) {
                    continue;
                }
                let key = object_key(svc.namespace(), svc.name_any());
                let unchanged = seen
                    .get(&key)
                    .is_some_and(|prev| !service_changed(prev, &svc));
                seen.insert(key.clone(), svc);
                if !unchanged {
                    debug!(key, "Service changed, enqueueing");
                    ctx.queue.add(&key);
                }
            }
            Ok(watcher::Event::InitDone) => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(());
                }
            }
            Ok(watcher::Event::Delete(svc)) => {
                let key = object_key(svc.namespace(), svc.name_any());
                seen.remove(&key);
            }
            Err(e) => warn!("Service watch error: {e}"),
        }
    }
}

async fn watch_tunnels(ctx: Arc<Context>, ready: oneshot::Sender<()>) {
    let api: Api<Tunnel> = Api::all(ctx.client.clone());
    let mut stream = std::pin::pin!(watcher(api, watcher::Config::default()));
    let mut ready = Some(ready);

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Init) => {}
            Ok(watcher::Event::InitApply(tunnel)) | Ok(watcher::Event::Apply(tunnel)) => {
                let key = object_key(tunnel.namespace(), tunnel.name_any());
                ctx.queue.add(&key);
            }
            Ok(watcher::Event::InitDone) => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(());
                }
            }
            Ok(watcher::Event::Delete(tunnel)) => {
                info!(tunnel = %tunnel.name_any(), "Tunnel deleted, tearing down host");
                reconciler::handle_tunnel_deleted(&ctx, &tunnel).await;
            }
            Err(e) => warn!("Tunnel watch error: {e}"),
        }
    }
}

/// Deployments owned by a tunnel re-enqueue that tunnel, so a deleted or
/// hand-edited client deployment converges back to the desired state.
async fn watch_deployments(ctx: Arc<Context>, ready: oneshot::Sender<()>) {
    let api: Api<Deployment> = Api::all(ctx.client.clone());
    let mut stream = std::pin::pin!(watcher(api, watcher::Config::default()));
    let mut ready = Some(ready);

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Init) => {}
            Ok(watcher::Event::InitDone) => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(());
                }
            }
            Ok(watcher::Event::InitApply(dep))
            | Ok(watcher::Event::Apply(dep))
            | Ok(watcher::Event::Delete(dep)) => {
                let owner = dep
                    .owner_references()
                    .iter()
                    .find(|oref| oref.kind == "Tunnel")
                    .map(|oref| oref.name.clone());
                if let Some(owner) = owner {
                    let key = object_key(dep.namespace(), owner);
                    debug!(key, "Client deployment event, enqueueing owner");
                    ctx.queue.add(&key);
                }
            }
            Err(e) => warn!("Deployment watch error: {e}"),
        }
    }
}

async fn run_worker(ctx: Arc<Context>, id: usize) {
    while let Some(key) = ctx.queue.get().await {
        match reconciler::sync_handler(&ctx, &key).await {
            Ok(()) => {
                ctx.queue.forget(&key);
                ctx.queue.done(&key);
            }
            Err(e) if e.is_fatal() => {
                // Retrying cannot fix these, drop the key.
                error!(worker = id, key, "Reconcile failed permanently: {e}");
                ctx.queue.forget(&key);
                ctx.queue.done(&key);
            }
            Err(e) => {
                warn!(worker = id, key, "Reconcile failed, will retry: {e}");
                ctx.queue.add_rate_limited(&key);
                ctx.queue.done(&key);
            }
        }
    }
    debug!(worker = id, "Worker shutting down");
}

pub async fn run() -> Result<()> {
    let infra = InfraConfig::from_env()?;
    infra.validate()?;

    let client = Client::try_default().await?;
    let reporter = Reporter {
        controller: "tunnel-operator".into(),
        instance: std::env::var("HOSTNAME").ok(),
    };
    let recorder = Recorder::new(client.clone(), reporter);

    let queue = Arc::new(WorkQueue::new());
    let ctx = Arc::new(Context {
        client,
        registry: ProviderRegistry::default(),
        recorder,
        queue: queue.clone(),
        operator_namespace: reconciler::read_namespace(),
        infra,
    });

    info!(
        provider = %ctx.infra.provider,
        namespace = %ctx.operator_namespace,
        "Starting tunnel operator"
    );

    let (svc_ready_tx, svc_ready) = oneshot::channel();
    let (tun_ready_tx, tun_ready) = oneshot::channel();
    let (dep_ready_tx, dep_ready) = oneshot::channel();

    tokio::spawn(watch_services(ctx.clone(), svc_ready_tx));
    tokio::spawn(watch_tunnels(ctx.clone(), tun_ready_tx));
    tokio::spawn(watch_deployments(ctx.clone(), dep_ready_tx));

    // Initial lists must land in the queue before workers drain it.
    let _ = svc_ready.await;
    let _ = tun_ready.await;
    let _ = dep_ready.await;
    info!("Watcher caches synced, starting {WORKERS} workers");

    let workers: Vec<_> = (0..WORKERS)
        .map(|id| tokio::spawn(run_worker(ctx.clone(), id)))
        .collect();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining work queue");
    queue.shut_down();
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;

    fn lb_service(name: &str) -> Service {
        let mut svc = Service {
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        svc.metadata.name = Some(name.to_string());
        svc.metadata.namespace = Some("default".to_string());
        svc
    }

    #[test]
    fn keys_are_namespace_slash_name() {
        let svc = lb_service("web");
        assert_eq!(object_key(svc.namespace(), svc.name_any()), "default/web");
    }

    #[test]
    fn status_churn_is_not_a_change() {
        let prev = lb_service("web");
        let mut next = prev.clone();
        next.status = Some(Default::default());
        assert!(!service_changed(&prev, &next));

        next.spec.as_mut().unwrap().external_ips = Some(vec!["1.2.3.4".into()]);
        assert!(service_changed(&prev, &next));
    }

    #[test]
    fn only_load_balancers_count() {
        assert!(is_load_balancer(&lb_service("web")));
        let mut clusterip = lb_service("web");
        clusterip.spec.as_mut().unwrap().type_ = Some("ClusterIP".into());
        assert!(!is_load_balancer(&clusterip));
    }
}
