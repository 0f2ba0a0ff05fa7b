//! Per-namespace informers for `Service`s and the three supported workload
//! kinds (spec §4.5 "Namespace watcher set"). Built on `kube::runtime::watcher`
//! and `reflector`, in the shape the wider example corpus uses them (see e.g.
//! `firestoned-bindy`'s controller startup) rather than a hand-rolled poll
//! loop.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::{Deployment, ReplicaSet, StatefulSet},
    core::v1::Service,
};
use kube::{
    runtime::{reflector, watcher, WatchStreamExt},
    Api, Client,
};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{KubeApiError, Result},
    workload::{Workload, WorkloadKind, WorkloadRef},
};

const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(30);
const WATCH_CHANNEL_CAPACITY: usize = 256;

/// A change worth telling reconcilers about. Deliberately coarse: the payload
/// only names what moved, not how. Watchers suppress a send when the new
/// object is equivalent to the last one seen for that key under
/// [`services_equivalent`]/[`workloads_equivalent`] (spec §4.5 "diff-quiescent
/// change notifications"); beyond that they don't interpret the diff, they
/// just let the reconciler re-read snapshots (spec §4.6 step 1).
#[derive(Debug, Clone)]
pub enum WatchEvent {
    ServiceChanged { namespace: String, name: String },
    WorkloadChanged(WorkloadRef),
}

/// Owns one watcher per (namespace, resource kind) pair and fans changes out
/// on a broadcast channel. Namespaces are added lazily as intercepts touch
/// them (spec §4.5: "namespaces are watched on demand").
pub struct NamespaceWatcherSet {
    client: Client,
    cancellation: CancellationToken,
    sender: broadcast::Sender<WatchEvent>,
    namespaces: RwLock<BTreeMap<String, NamespaceHandle>>,
}

struct NamespaceHandle {
    _tasks: Vec<tokio::task::JoinHandle<()>>,
    service_cache: Arc<reflector::Store<Service>>,
}

impl NamespaceWatcherSet {
    pub fn new(client: Client, cancellation: CancellationToken) -> Self {
        let (sender, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            client,
            cancellation,
            sender,
            namespaces: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.sender.subscribe()
    }

    /// Every namespace currently being watched, sorted for deterministic
    /// listing (spec §4.5: "namespace enumeration is sorted").
    pub async fn watched_namespaces(&self) -> Vec<String> {
        self.namespaces.read().await.keys().cloned().collect()
    }

    /// Starts watching `namespace` if it isn't already, and blocks until the
    /// initial cache sync completes or [`CACHE_SYNC_TIMEOUT`] elapses.
    pub async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        if self.namespaces.read().await.contains_key(namespace) {
            return Ok(());
        }

        let mut guard = self.namespaces.write().await;
        if guard.contains_key(namespace) {
            return Ok(());
        }

        debug!(namespace, "starting namespace watcher set");

        let (service_reader, service_writer) = reflector::store();
        let service_store = Arc::new(service_reader);

        let mut tasks = Vec::new();
        tasks.push(self.spawn_service_watcher(namespace, service_writer));
        for kind in WorkloadKind::ALL {
            tasks.push(self.spawn_workload_watcher(namespace, kind));
        }

        tokio::time::timeout(CACHE_SYNC_TIMEOUT, service_store.wait_until_ready())
            .await
            .map_err(|_| {
                KubeApiError::InvalidState {
                    kind: "Namespace",
                    namespace: namespace.to_owned(),
                    name: String::new(),
                    message: "timed out waiting for the service cache to sync".to_owned(),
                }
            })?;

        guard.insert(
            namespace.to_owned(),
            NamespaceHandle {
                _tasks: tasks,
                service_cache: service_store,
            },
        );

        Ok(())
    }

    pub async fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        let guard = self.namespaces.read().await;
        let handle = guard.get(namespace)?;
        handle
            .service_cache
            .state()
            .into_iter()
            .find(|svc| svc.metadata.name.as_deref() == Some(name))
            .map(|arc| (*arc).clone())
    }

    fn spawn_service_watcher(
        &self,
        namespace: &str,
        writer: reflector::Writer<Service>,
    ) -> tokio::task::JoinHandle<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let sender = self.sender.clone();
        let namespace = namespace.to_owned();
        let cancellation = self.cancellation.clone();

        tokio::spawn(async move {
            let stream = watcher(api, watcher::Config::default())
                .default_backoff()
                .reflect(writer)
                .touched_objects();
            tokio::pin!(stream);

            let mut last_seen: std::collections::HashMap<String, Service> = std::collections::HashMap::new();

            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    next = stream.next() => {
                        match next {
                            Some(Ok(service)) => {
                                if let Some(name) = service.metadata.name.clone() {
                                    let quiescent = last_seen
                                        .get(&name)
                                        .is_some_and(|previous| services_equivalent(previous, &service));
                                    last_seen.insert(name.clone(), service);
                                    if quiescent {
                                        continue;
                                    }
                                    let _ = sender.send(WatchEvent::ServiceChanged {
                                        namespace: namespace.clone(),
                                        name,
                                    });
                                }
                            }
                            Some(Err(error)) => warn!(namespace = %namespace, %error, "service watcher error"),
                            None => break,
                        }
                    }
                }
            }
        })
    }

    fn spawn_workload_watcher(&self, namespace: &str, kind: WorkloadKind) -> tokio::task::JoinHandle<()> {
        let sender = self.sender.clone();
        let namespace_owned = namespace.to_owned();
        let cancellation = self.cancellation.clone();
        let client = self.client.clone();

        tokio::spawn(async move {
            match kind {
                WorkloadKind::Deployment => {
                    let api: Api<Deployment> = Api::namespaced(client, &namespace_owned);
                    watch_workload_kind(api, kind, namespace_owned, sender, cancellation, |d| {
                        Workload::Deployment(d)
                    })
                    .await;
                }
                WorkloadKind::ReplicaSet => {
                    let api: Api<ReplicaSet> = Api::namespaced(client, &namespace_owned);
                    watch_workload_kind(api, kind, namespace_owned, sender, cancellation, |r| {
                        Workload::ReplicaSet(r)
                    })
                    .await;
                }
                WorkloadKind::StatefulSet => {
                    let api: Api<StatefulSet> = Api::namespaced(client, &namespace_owned);
                    watch_workload_kind(api, kind, namespace_owned, sender, cancellation, |s| {
                        Workload::StatefulSet(s)
                    })
                    .await;
                }
            }
        })
    }
}

async fn watch_workload_kind<K, F>(
    api: Api<K>,
    kind: WorkloadKind,
    namespace: String,
    sender: broadcast::Sender<WatchEvent>,
    cancellation: CancellationToken,
    wrap: F,
) where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + std::fmt::Debug
        + for<'de> serde::Deserialize<'de>
        + Send
        + Sync
        + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
    F: Fn(K) -> Workload,
{
    let stream = watcher(api, watcher::Config::default()).default_backoff().touched_objects();
    tokio::pin!(stream);

    let mut last_seen: std::collections::HashMap<String, Workload> = std::collections::HashMap::new();

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            next = stream.next() => {
                match next {
                    Some(Ok(object)) => {
                        let workload = wrap(object);
                        if filter_owned_workload(&workload) {
                            continue;
                        }
                        let name = workload.metadata().name.clone().unwrap_or_default();
                        let quiescent = last_seen
                            .get(&name)
                            .is_some_and(|previous| workloads_equivalent(previous, &workload));
                        last_seen.insert(name.clone(), workload);
                        if quiescent {
                            continue;
                        }
                        let _ = sender.send(WatchEvent::WorkloadChanged(WorkloadRef {
                            kind,
                            namespace: namespace.clone(),
                            name,
                        }));
                    }
                    Some(Err(error)) => warn!(namespace = %namespace, ?kind, %error, "workload watcher error"),
                    None => break,
                }
            }
        }
    }
}

/// Hides `ReplicaSet`s owned by a `Deployment` (and, symmetrically, any
/// workload with a recognized controller owner) from the watch stream: the
/// owning `Deployment`'s own watcher already reports the change, and acting
/// on both would double-apply the action plan (spec §4.5).
fn filter_owned_workload(workload: &Workload) -> bool {
    matches!(
        workload.controller_owner_kind(),
        Some("Deployment") | Some("StatefulSet")
    )
}

/// True when two `Service`s are equivalent for reconciliation purposes,
/// ignoring `resourceVersion`, `status`, and timestamps (spec §4.5:
/// "informer equality ignores irrelevant fields").
pub fn services_equivalent(a: &Service, b: &Service) -> bool {
    let meta_equal = a.metadata.uid == b.metadata.uid
        && a.metadata.name == b.metadata.name
        && a.metadata.namespace == b.metadata.namespace;

    let spec_equal = match (a.spec.as_ref(), b.spec.as_ref()) {
        (Some(a), Some(b)) => a.type_ == b.type_ && a.ports == b.ports,
        (None, None) => true,
        _ => false,
    };

    meta_equal && spec_equal
}

/// True when two workloads are equivalent for reconciliation purposes,
/// ignoring `resourceVersion`, `status`, and timestamps: pod-template
/// labels and, per container, name and ports must match (spec §4.5).
pub fn workloads_equivalent(a: &Workload, b: &Workload) -> bool {
    if a.kind() != b.kind() {
        return false;
    }
    if a.metadata().uid != b.metadata().uid {
        return false;
    }

    let labels_equal = a
        .pod_template()
        .and_then(|t| t.metadata.as_ref())
        .and_then(|m| m.labels.as_ref())
        == b.pod_template()
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.labels.as_ref());

    let containers_equal = a.containers().len() == b.containers().len()
        && a.containers().iter().zip(b.containers().iter()).all(|(ca, cb)| {
            ca.name == cb.name && ca.ports == cb.ports
        });

    labels_equal && containers_equal
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(uid: &str, labels: &[(&str, &str)]) -> Workload {
        use k8s_openapi::{
            api::{
                apps::v1::{Deployment, DeploymentSpec},
                core::v1::{PodSpec, PodTemplateSpec},
            },
            apimachinery::pkg::apis::meta::v1::ObjectMeta,
        };

        Workload::Deployment(Deployment {
            metadata: ObjectMeta {
                uid: Some(uid.to_owned()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(
                            labels
                                .iter()
                                .map(|(k, v)| (k.to_string(), v.to_string()))
                                .collect(),
                        ),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        })
    }

    #[test]
    fn identical_workloads_are_equivalent() {
        let a = deployment("abc", &[("app", "x")]);
        let b = deployment("abc", &[("app", "x")]);
        assert!(workloads_equivalent(&a, &b));
    }

    #[test]
    fn differing_labels_are_not_equivalent() {
        let a = deployment("abc", &[("app", "x")]);
        let b = deployment("abc", &[("app", "y")]);
        assert!(!workloads_equivalent(&a, &b));
    }

    #[test]
    fn owned_replicasets_are_filtered() {
        use k8s_openapi::{
            api::apps::v1::ReplicaSet,
            apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
        };

        let owned = Workload::ReplicaSet(ReplicaSet {
            metadata: ObjectMeta {
                owner_references: Some(vec![OwnerReference {
                    kind: "Deployment".to_owned(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            spec: None,
            status: None,
        });

        assert!(filter_owned_workload(&owned));
    }

    #[test]
    fn a_relabeled_but_otherwise_identical_deployment_does_not_wake_subscribers() {
        // same shape as the last-seen tracking in `watch_workload_kind`: insert,
        // then check whether the next observation is quiescent under our own
        // equality before deciding to broadcast.
        let mut last_seen: std::collections::HashMap<String, Workload> = std::collections::HashMap::new();
        let first = deployment("abc", &[("app", "x")]);
        last_seen.insert("web".to_owned(), first);

        let resynced = deployment("abc", &[("app", "x")]);
        let quiescent = last_seen
            .get("web")
            .is_some_and(|previous| workloads_equivalent(previous, &resynced));
        assert!(quiescent, "identical resync should be suppressed");

        let relabeled = deployment("abc", &[("app", "y")]);
        let quiescent = last_seen
            .get("web")
            .is_some_and(|previous| workloads_equivalent(previous, &relabeled));
        assert!(!quiescent, "an actual label change should wake subscribers");
    }
}
