use k8s_openapi::{
    api::{
        apps::v1::{Deployment, ReplicaSet, StatefulSet},
        core::v1::{Container, PodTemplateSpec, Probe},
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
};
use serde::{Deserialize, Serialize};

use crate::error::ObjectRef;

/// The workload kinds this crate knows how to install a sidecar onto (spec
/// §3 "Namespace watcher set": "3 workload-kind watchers").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    ReplicaSet,
    StatefulSet,
}

impl WorkloadKind {
    pub const ALL: [Self; 3] = [Self::Deployment, Self::ReplicaSet, Self::StatefulSet];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::ReplicaSet => "ReplicaSet",
            Self::StatefulSet => "StatefulSet",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

/// A loaded workload object, abstracting over the three kinds this crate
/// supports so the action library and installer can operate generically
/// (compare to the teacher's `Rollout::get_pod_template`, which resolves a
/// similar multi-shape indirection for Argo Rollouts).
#[derive(Debug, Clone)]
pub enum Workload {
    Deployment(Deployment),
    ReplicaSet(ReplicaSet),
    StatefulSet(StatefulSet),
}

impl Workload {
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Self::Deployment(_) => WorkloadKind::Deployment,
            Self::ReplicaSet(_) => WorkloadKind::ReplicaSet,
            Self::StatefulSet(_) => WorkloadKind::StatefulSet,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Deployment(d) => &d.metadata,
            Self::ReplicaSet(r) => &r.metadata,
            Self::StatefulSet(s) => &s.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::Deployment(d) => &mut d.metadata,
            Self::ReplicaSet(r) => &mut r.metadata,
            Self::StatefulSet(s) => &mut s.metadata,
        }
    }

    pub fn pod_template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Self::Deployment(d) => d.spec.as_ref().map(|s| &s.template),
            Self::ReplicaSet(r) => r.spec.as_ref().and_then(|s| s.template.as_ref()),
            Self::StatefulSet(s) => s.spec.as_ref().map(|s| &s.template),
        }
    }

    pub fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        match self {
            Self::Deployment(d) => d.spec.as_mut().map(|s| &mut s.template),
            Self::ReplicaSet(r) => r.spec.as_mut().and_then(|s| s.template.as_mut()),
            Self::StatefulSet(s) => s.spec.as_mut().map(|s| &mut s.template),
        }
    }

    pub fn containers(&self) -> &[Container] {
        static EMPTY: Vec<Container> = Vec::new();
        self.pod_template()
            .and_then(|t| t.spec.as_ref())
            .map(|s| s.containers.as_slice())
            .unwrap_or(&EMPTY)
    }

    pub fn init_containers(&self) -> &[Container] {
        static EMPTY: Vec<Container> = Vec::new();
        self.pod_template()
            .and_then(|t| t.spec.as_ref())
            .and_then(|s| s.init_containers.as_ref())
            .map(Vec::as_slice)
            .unwrap_or(&EMPTY)
    }

    pub fn init_containers_mut(&mut self) -> &mut Vec<Container> {
        static EMPTY_TEMPLATE_BUG: &str =
            "workload has no pod template; caller must check before mutating containers";
        self.pod_template_mut()
            .expect(EMPTY_TEMPLATE_BUG)
            .spec
            .get_or_insert_with(Default::default)
            .init_containers
            .get_or_insert_with(Default::default)
    }

    pub fn containers_mut(&mut self) -> &mut Vec<Container> {
        static EMPTY_TEMPLATE_BUG: &str =
            "workload has no pod template; caller must check before mutating containers";
        &mut self
            .pod_template_mut()
            .expect(EMPTY_TEMPLATE_BUG)
            .spec
            .get_or_insert_with(Default::default)
            .containers
    }

    pub fn selector(&self) -> Option<&LabelSelector> {
        match self {
            Self::Deployment(d) => d.spec.as_ref().map(|s| &s.selector),
            Self::ReplicaSet(r) => r.spec.as_ref().map(|s| &s.selector),
            Self::StatefulSet(s) => s.spec.as_ref().map(|s| &s.selector),
        }
    }

    /// The controller-owner this workload reports, if any — used by
    /// [`crate::watcher::filter_owned_workloads`] to hide e.g. a
    /// `ReplicaSet` that a `Deployment` already owns (spec §4.5).
    pub fn controller_owner_kind(&self) -> Option<&str> {
        self.metadata()
            .owner_references
            .as_ref()?
            .iter()
            .find(|owner| owner.controller == Some(true))
            .map(|owner| owner.kind.as_str())
    }
}

impl ObjectRef for Workload {
    fn kind_str(&self) -> &'static str {
        self.kind().as_str()
    }

    fn namespace_str(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    fn name_str(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }
}

/// Renames a container port in-place and rewrites any liveness/readiness/
/// startup probe that referenced it by name — the other half of the "hide
/// container port" action (spec §4.1).
pub fn rewrite_probe_port_names(container: &mut Container, old_name: &str, new_name: &str) {
    for probe in [
        container.liveness_probe.as_mut(),
        container.readiness_probe.as_mut(),
        container.startup_probe.as_mut(),
    ]
    .into_iter()
    .flatten()
    {
        rewrite_probe(probe, old_name, new_name);
    }
}

fn rewrite_probe(probe: &mut Probe, old_name: &str, new_name: &str) {
    if let Some(http_get) = probe.http_get.as_mut() {
        if http_get.port.as_str() == Some(old_name) {
            http_get.port = k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::String(
                new_name.to_owned(),
            );
        }
    }
    if let Some(tcp_socket) = probe.tcp_socket.as_mut() {
        if tcp_socket.port.as_str() == Some(old_name) {
            tcp_socket.port = k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::String(
                new_name.to_owned(),
            );
        }
    }
}

trait IntOrStringExt {
    fn as_str(&self) -> Option<&str>;
}

impl IntOrStringExt for k8s_openapi::apimachinery::pkg::util::intstr::IntOrString {
    fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            Self::Int(_) => None,
        }
    }
}
