//! Installs, upgrades, and removes the per-workload action plan that lets
//! the manager redirect one app container's traffic to an agent sidecar
//! (spec §4.2).

pub mod container;
pub mod port_resolution;
pub mod rollout;

use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use kube::{api::Api, Client};
use tracing::{info, warn};

use crate::{
    action::{
        annotation::{self, CompleteAction},
        AddEnvVars, AddSidecarContainer, ApplyOutcome, UndoOutcome,
    },
    error::{KubeApiError, Result},
    workload::{Workload, WorkloadKind, WorkloadRef},
};

/// Everything the installer needs to know to place or remove an agent.
pub struct AgentSpec {
    pub image: String,
    pub container_name: String,
    pub volume_name: String,
    pub service_port: u16,
    pub app_container: Option<String>,
    pub env_vars: Vec<(String, String)>,
    pub rollout_timeout: Duration,
}

pub struct AgentInstaller {
    client: Client,
    tool_version: semver::Version,
}

/// Outcome of [`AgentInstaller::ensure_agent`]: whether an install happened,
/// an existing agent was upgraded in place, or it was already current (spec
/// §4.2 EnsureAgent: "installs, upgrades, or is a no-op").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Installed,
    Upgraded,
    AlreadyCurrent,
}

impl AgentInstaller {
    pub fn new(client: Client, tool_version: semver::Version) -> Self {
        Self { client, tool_version }
    }

    pub async fn ensure_agent(
        &self,
        workload_ref: &WorkloadRef,
        service_name: &str,
        spec: &AgentSpec,
    ) -> Result<EnsureOutcome> {
        let mut workload = self.load_workload(workload_ref).await?;
        let mut service = self.load_service(&workload_ref.namespace, service_name).await?;

        if let Some(mesh) = container::detect_mesh(&workload) {
            info!(namespace = %workload_ref.namespace, name = %workload_ref.name, ?mesh, "detected service mesh sidecar");
        }

        if container::is_webhook_injected(&workload) {
            return self.verify_webhook_injected(&mut workload, workload_ref, spec).await;
        }

        let annotations = workload.metadata().annotations.clone().unwrap_or_default();
        let existing = annotation::read(&annotations, &self.tool_version)
            .map_err(KubeApiError::Annotation)?;

        if let Some(existing) = existing {
            return self
                .upgrade_in_place(&mut workload, &mut service, workload_ref, existing, spec)
                .await;
        }

        let plan = self.build_plan(&workload, &service, spec)?;
        self.apply_plan(&mut workload, &mut service, &plan)?;

        let annotations = workload
            .metadata_mut()
            .annotations
            .get_or_insert_with(Default::default);
        annotation::write(annotations, &plan);

        self.persist(&workload, &service, workload_ref, service_name).await?;
        rollout::wait_for_convergence(&self.client, workload_ref, spec.rollout_timeout).await?;

        Ok(EnsureOutcome::Installed)
    }

    pub async fn undo_agent(
        &self,
        workload_ref: &WorkloadRef,
        service_name: &str,
        rollout_timeout: Duration,
    ) -> Result<UndoOutcome> {
        let mut workload = self.load_workload(workload_ref).await?;
        let mut service = self.load_service(&workload_ref.namespace, service_name).await?;

        let annotations = workload.metadata().annotations.clone().unwrap_or_default();
        let Some(plan) = annotation::read(&annotations, &self.tool_version)
            .map_err(KubeApiError::Annotation)?
        else {
            // No action annotation means this tool never mutated the
            // workload directly, so it must have gotten its agent from a
            // webhook (spec §4.2 UndoAgent). There is nothing here for us
            // to undo; a restart lets the webhook re-run from a clean pod.
            self.touch_restarted_at(&mut workload)?;
            self.persist_workload(&workload, workload_ref).await?;
            rollout::wait_for_convergence(&self.client, workload_ref, rollout_timeout).await?;
            return Ok(UndoOutcome::Undone);
        };

        let mut any_undone = false;
        for action in plan.actions_in_order().into_iter().rev() {
            match action.undo(&mut workload, &mut service, &self.tool_version)? {
                UndoOutcome::Undone => any_undone = true,
                UndoOutcome::AlreadyUndone => {}
            }
        }

        if let Some(annotations) = workload.metadata_mut().annotations.as_mut() {
            annotation::clear(annotations);
        }

        self.persist(&workload, &service, workload_ref, service_name).await?;

        if any_undone {
            Ok(UndoOutcome::Undone)
        } else {
            Ok(UndoOutcome::AlreadyUndone)
        }
    }

    /// Removes every agent this tool has ever installed across a namespace,
    /// used when tearing down the manager entirely (spec §4.2
    /// "RemoveManagerAndAgents"). Best-effort: a single workload failing to
    /// undo is logged and does not stop the sweep.
    pub async fn remove_manager_and_agents(
        &self,
        namespace: &str,
        rollout_timeout: Duration,
    ) -> Result<usize> {
        let mut removed = 0;
        for kind in WorkloadKind::ALL {
            let refs = self.list_annotated(namespace, kind).await?;
            for (workload_ref, service_name) in refs {
                match self.undo_agent(&workload_ref, &service_name, rollout_timeout).await {
                    Ok(UndoOutcome::Undone) => removed += 1,
                    Ok(UndoOutcome::AlreadyUndone) => {}
                    Err(error) => warn!(
                        namespace = %workload_ref.namespace,
                        name = %workload_ref.name,
                        %error,
                        "failed to remove agent while tearing down manager"
                    ),
                }
            }
        }
        Ok(removed)
    }

    async fn list_annotated(
        &self,
        namespace: &str,
        kind: WorkloadKind,
    ) -> Result<Vec<(WorkloadRef, String)>> {
        let mut found = Vec::new();
        let names: Vec<(String, std::collections::BTreeMap<String, String>)> = match kind {
            WorkloadKind::Deployment => {
                let api: Api<k8s_openapi::api::apps::v1::Deployment> =
                    Api::namespaced(self.client.clone(), namespace);
                api.list(&Default::default())
                    .await?
                    .items
                    .into_iter()
                    .filter_map(|w| Some((w.metadata.name?, w.metadata.annotations.unwrap_or_default())))
                    .collect()
            }
            WorkloadKind::ReplicaSet => {
                let api: Api<k8s_openapi::api::apps::v1::ReplicaSet> =
                    Api::namespaced(self.client.clone(), namespace);
                api.list(&Default::default())
                    .await?
                    .items
                    .into_iter()
                    .filter_map(|w| Some((w.metadata.name?, w.metadata.annotations.unwrap_or_default())))
                    .collect()
            }
            WorkloadKind::StatefulSet => {
                let api: Api<k8s_openapi::api::apps::v1::StatefulSet> =
                    Api::namespaced(self.client.clone(), namespace);
                api.list(&Default::default())
                    .await?
                    .items
                    .into_iter()
                    .filter_map(|w| Some((w.metadata.name?, w.metadata.annotations.unwrap_or_default())))
                    .collect()
            }
        };

        for (name, annotations) in names {
            if let Some(plan) = annotation::read(&annotations, &self.tool_version).ok().flatten() {
                found.push((
                    WorkloadRef {
                        kind,
                        namespace: namespace.to_owned(),
                        name,
                    },
                    plan.referenced_service,
                ));
            }
        }

        Ok(found)
    }

    fn build_plan(
        &self,
        workload: &Workload,
        service: &Service,
        spec: &AgentSpec,
    ) -> Result<CompleteAction> {
        let resolved = port_resolution::resolve(&port_resolution::PortRequest {
            workload,
            service,
            service_port: spec.service_port,
        })?;

        let app_container = spec
            .app_container
            .clone()
            .unwrap_or(resolved.app_container.clone());

        let add_tp_env = if spec.env_vars.is_empty() {
            None
        } else {
            Some(AddEnvVars {
                container: spec.container_name.clone(),
                vars: spec.env_vars.clone(),
            })
        };

        let is_headless = service
            .spec
            .as_ref()
            .map(|s| s.cluster_ip.as_deref() == Some("None"))
            .unwrap_or(false);

        let add_init_container = is_headless.then(|| crate::action::AddInitContainer {
            container_name: format!("{}-init", spec.container_name),
            image: spec.image.clone(),
        });

        let referenced_service = service.metadata.name.clone().ok_or_else(|| {
            KubeApiError::InvalidState {
                kind: "Service",
                namespace: service.metadata.namespace.clone().unwrap_or_default(),
                name: String::new(),
                message: "service has no name".to_owned(),
            }
        })?;

        let plan = CompleteAction {
            version: self.tool_version.clone(),
            referenced_service,
            referenced_service_port: Some(spec.service_port),
            referenced_service_port_name: None,
            hide_container_port: resolved.hide_container_port,
            make_port_symbolic: resolved.make_port_symbolic,
            add_symbolic_port: resolved.add_symbolic_port,
            add_traffic_agent: Some(AddSidecarContainer {
                container_name: spec.container_name.clone(),
                image: spec.image.clone(),
                takes_over_port: resolved.container_port_name.clone(),
                app_container,
                volume_name: spec.volume_name.clone(),
            }),
            add_init_container,
            add_tp_env,
        };

        Ok(plan)
    }

    fn apply_plan(
        &self,
        workload: &mut Workload,
        service: &mut Service,
        plan: &CompleteAction,
    ) -> Result<()> {
        for action in plan.actions_in_order() {
            match action.apply(workload, service)? {
                ApplyOutcome::Applied => {}
                ApplyOutcome::AlreadyDone => {}
            }
        }
        Ok(())
    }

    /// Spec §4.2 EnsureAgent, webhook-injected branch: never touches ports,
    /// containers, or the action annotation. A rollout restart is the only
    /// mutation allowed, and only when the sidecar didn't show up on its own.
    async fn verify_webhook_injected(
        &self,
        workload: &mut Workload,
        workload_ref: &WorkloadRef,
        spec: &AgentSpec,
    ) -> Result<EnsureOutcome> {
        if container::has_container_named(workload, &spec.container_name) {
            return Ok(EnsureOutcome::AlreadyCurrent);
        }

        info!(
            namespace = %workload_ref.namespace,
            name = %workload_ref.name,
            "webhook-injected workload is missing its agent sidecar, restarting"
        );
        self.touch_restarted_at(workload)?;
        self.persist_workload(workload, workload_ref).await?;
        rollout::wait_for_convergence(&self.client, workload_ref, spec.rollout_timeout).await?;
        Ok(EnsureOutcome::Installed)
    }

    fn touch_restarted_at(&self, workload: &mut Workload) -> Result<()> {
        let Some(template) = workload.pod_template_mut() else {
            return Err(KubeApiError::invalid_state(
                workload,
                "webhook-injected workload has no pod template to restart",
            ));
        };
        template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(Default::default)
            .insert(
                "kubectl.kubernetes.io/restartedAt".to_owned(),
                chrono::Utc::now().to_rfc3339(),
            );
        Ok(())
    }

    async fn persist_workload(&self, workload: &Workload, workload_ref: &WorkloadRef) -> Result<()> {
        let params = kube::api::PostParams::default();
        match workload {
            Workload::Deployment(d) => {
                let api: Api<k8s_openapi::api::apps::v1::Deployment> =
                    Api::namespaced(self.client.clone(), &workload_ref.namespace);
                api.replace(&workload_ref.name, &params, d).await?;
            }
            Workload::ReplicaSet(r) => {
                let api: Api<k8s_openapi::api::apps::v1::ReplicaSet> =
                    Api::namespaced(self.client.clone(), &workload_ref.namespace);
                api.replace(&workload_ref.name, &params, r).await?;
            }
            Workload::StatefulSet(s) => {
                let api: Api<k8s_openapi::api::apps::v1::StatefulSet> =
                    Api::namespaced(self.client.clone(), &workload_ref.namespace);
                api.replace(&workload_ref.name, &params, s).await?;
            }
        }
        Ok(())
    }

    async fn upgrade_in_place(
        &self,
        workload: &mut Workload,
        service: &mut Service,
        workload_ref: &WorkloadRef,
        existing: CompleteAction,
        spec: &AgentSpec,
    ) -> Result<EnsureOutcome> {
        let Some(sidecar) = existing.add_traffic_agent.as_ref() else {
            return Err(KubeApiError::invalid_state(
                workload,
                "action annotation present but missing the sidecar action",
            ));
        };

        if sidecar.image == spec.image {
            return Ok(EnsureOutcome::AlreadyCurrent);
        }

        let upgraded = sidecar.upgrade_image(workload, &spec.image);
        if upgraded {
            self.persist(workload, service, workload_ref, &existing.referenced_service)
                .await?;
            rollout::wait_for_convergence(&self.client, workload_ref, spec.rollout_timeout).await?;
            Ok(EnsureOutcome::Upgraded)
        } else {
            Ok(EnsureOutcome::AlreadyCurrent)
        }
    }

    async fn load_workload(&self, workload_ref: &WorkloadRef) -> Result<Workload> {
        use WorkloadKind::*;
        Ok(match workload_ref.kind {
            Deployment => {
                let api: Api<k8s_openapi::api::apps::v1::Deployment> =
                    Api::namespaced(self.client.clone(), &workload_ref.namespace);
                Workload::Deployment(api.get(&workload_ref.name).await?)
            }
            ReplicaSet => {
                let api: Api<k8s_openapi::api::apps::v1::ReplicaSet> =
                    Api::namespaced(self.client.clone(), &workload_ref.namespace);
                Workload::ReplicaSet(api.get(&workload_ref.name).await?)
            }
            StatefulSet => {
                let api: Api<k8s_openapi::api::apps::v1::StatefulSet> =
                    Api::namespaced(self.client.clone(), &workload_ref.namespace);
                Workload::StatefulSet(api.get(&workload_ref.name).await?)
            }
        })
    }

    async fn load_service(&self, namespace: &str, name: &str) -> Result<Service> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn persist(
        &self,
        workload: &Workload,
        service: &Service,
        workload_ref: &WorkloadRef,
        service_name: &str,
    ) -> Result<()> {
        let params = kube::api::PostParams::default();
        match workload {
            Workload::Deployment(d) => {
                let api: Api<k8s_openapi::api::apps::v1::Deployment> =
                    Api::namespaced(self.client.clone(), &workload_ref.namespace);
                api.replace(&workload_ref.name, &params, d).await?;
            }
            Workload::ReplicaSet(r) => {
                let api: Api<k8s_openapi::api::apps::v1::ReplicaSet> =
                    Api::namespaced(self.client.clone(), &workload_ref.namespace);
                api.replace(&workload_ref.name, &params, r).await?;
            }
            Workload::StatefulSet(s) => {
                let api: Api<k8s_openapi::api::apps::v1::StatefulSet> =
                    Api::namespaced(self.client.clone(), &workload_ref.namespace);
                api.replace(&workload_ref.name, &params, s).await?;
            }
        }

        let service_api: Api<Service> = Api::namespaced(self.client.clone(), &workload_ref.namespace);
        service_api.replace(service_name, &params, service).await?;
        Ok(())
    }
}
