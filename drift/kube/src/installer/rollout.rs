//! Waits for a patched workload's rollout to converge (spec §4.2 "Rollout
//! convergence"): `observedGeneration` must catch up to `.metadata.generation`
//! and the workload's ready/updated replica counts must match `.spec.replicas`.
//! `ReplicaSet`s have no rollout of their own — converging one means deleting
//! its pods so the set's controller recreates them with the patched template.

use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use kube::{api::DeleteParams, Api, Client};
use tokio::time::Instant;
use tracing::debug;

use crate::{
    error::{KubeApiError, Result},
    workload::{Workload, WorkloadRef},
};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub async fn wait_for_convergence(
    client: &Client,
    workload_ref: &WorkloadRef,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;

    loop {
        let workload = load(client, workload_ref).await?;
        if has_converged(&workload) {
            return Ok(());
        }

        if workload_ref.kind == crate::workload::WorkloadKind::ReplicaSet {
            delete_pods_of(client, workload_ref).await?;
        }

        if Instant::now() >= deadline {
            return Err(KubeApiError::RolloutTimedOut {
                kind: workload_ref.kind.as_str(),
                namespace: workload_ref.namespace.clone(),
                name: workload_ref.name.clone(),
            });
        }

        debug!(
            kind = workload_ref.kind.as_str(),
            namespace = workload_ref.namespace.as_str(),
            name = workload_ref.name.as_str(),
            "rollout not yet converged, polling again"
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn load(client: &Client, workload_ref: &WorkloadRef) -> Result<Workload> {
    use crate::workload::WorkloadKind::*;
    match workload_ref.kind {
        Deployment => {
            let api: Api<k8s_openapi::api::apps::v1::Deployment> =
                Api::namespaced(client.clone(), &workload_ref.namespace);
            api.get(&workload_ref.name)
                .await
                .map(Workload::Deployment)
                .map_err(Into::into)
        }
        ReplicaSet => {
            let api: Api<k8s_openapi::api::apps::v1::ReplicaSet> =
                Api::namespaced(client.clone(), &workload_ref.namespace);
            api.get(&workload_ref.name)
                .await
                .map(Workload::ReplicaSet)
                .map_err(Into::into)
        }
        StatefulSet => {
            let api: Api<k8s_openapi::api::apps::v1::StatefulSet> =
                Api::namespaced(client.clone(), &workload_ref.namespace);
            api.get(&workload_ref.name)
                .await
                .map(Workload::StatefulSet)
                .map_err(Into::into)
        }
    }
}

fn has_converged(workload: &Workload) -> bool {
    match workload {
        Workload::Deployment(d) => {
            let generation = d.metadata.generation;
            let Some(status) = d.status.as_ref() else {
                return false;
            };
            let Some(spec) = d.spec.as_ref() else {
                return false;
            };
            let wanted = spec.replicas.unwrap_or(1);
            status.observed_generation == generation
                && status.updated_replicas.unwrap_or(0) == wanted
                && status.available_replicas.unwrap_or(0) == wanted
        }
        Workload::StatefulSet(s) => {
            let generation = s.metadata.generation;
            let Some(status) = s.status.as_ref() else {
                return false;
            };
            let Some(spec) = s.spec.as_ref() else {
                return false;
            };
            let wanted = spec.replicas.unwrap_or(1);
            status.observed_generation == generation
                && status.updated_replicas.unwrap_or(0) == wanted
                && status.ready_replicas.unwrap_or(0) == wanted
        }
        // A bare ReplicaSet has no rollout mechanism; convergence is driven
        // entirely by `delete_pods_of` forcing replacement pods, so we just
        // check the replica count caught up.
        Workload::ReplicaSet(r) => {
            let Some(status) = r.status.as_ref() else {
                return false;
            };
            let Some(spec) = r.spec.as_ref() else {
                return false;
            };
            let wanted = spec.replicas.unwrap_or(1);
            status.ready_replicas.unwrap_or(0) == wanted
        }
    }
}

async fn delete_pods_of(client: &Client, workload_ref: &WorkloadRef) -> Result<()> {
    use k8s_openapi::api::core::v1::Pod;

    let rs_api: Api<ReplicaSet> = Api::namespaced(client.clone(), &workload_ref.namespace);
    let rs = rs_api.get(&workload_ref.name).await?;
    let Some(selector) = rs.spec.map(|s| s.selector) else {
        return Ok(());
    };
    let Some(match_labels) = selector.match_labels else {
        return Ok(());
    };

    let label_selector = match_labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");

    let pod_api: Api<Pod> = Api::namespaced(client.clone(), &workload_ref.namespace);
    let pods = pod_api
        .list(&kube::api::ListParams::default().labels(&label_selector))
        .await?;

    for pod in pods.items {
        let Some(name) = pod.metadata.name else {
            continue;
        };
        debug!(pod = name.as_str(), "deleting pod to force replacement");
        let _ = pod_api.delete(&name, &DeleteParams::default()).await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus, ReplicaSetSpec, ReplicaSetStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

    use super::*;

    fn deployment(generation: i64, observed: i64, wanted: i32, updated: i32, available: i32) -> Workload {
        Workload::Deployment(Deployment {
            metadata: ObjectMeta {
                generation: Some(generation),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(wanted),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                observed_generation: Some(observed),
                updated_replicas: Some(updated),
                available_replicas: Some(available),
                ..Default::default()
            }),
        })
    }

    #[test]
    fn deployment_has_not_converged_until_generation_and_replicas_both_catch_up() {
        assert!(!has_converged(&deployment(2, 1, 3, 3, 3)));
        assert!(!has_converged(&deployment(2, 2, 3, 2, 3)));
        assert!(!has_converged(&deployment(2, 2, 3, 3, 2)));
        assert!(has_converged(&deployment(2, 2, 3, 3, 3)));
    }

    #[test]
    fn deployment_with_no_status_yet_has_not_converged() {
        let workload = Workload::Deployment(Deployment {
            metadata: ObjectMeta {
                generation: Some(1),
                ..Default::default()
            },
            spec: Some(DeploymentSpec::default()),
            status: None,
        });
        assert!(!has_converged(&workload));
    }

    #[test]
    fn replica_set_converges_once_ready_replicas_reach_the_desired_count() {
        let not_ready = Workload::ReplicaSet(ReplicaSet {
            spec: Some(ReplicaSetSpec {
                replicas: Some(2),
                selector: LabelSelector::default(),
                ..Default::default()
            }),
            status: Some(ReplicaSetStatus {
                ready_replicas: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(!has_converged(&not_ready));

        let ready = Workload::ReplicaSet(ReplicaSet {
            spec: Some(ReplicaSetSpec {
                replicas: Some(2),
                selector: LabelSelector::default(),
                ..Default::default()
            }),
            status: Some(ReplicaSetStatus {
                ready_replicas: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(has_converged(&ready));
    }
}
