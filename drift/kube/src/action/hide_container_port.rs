use serde::{Deserialize, Serialize};

use super::{find_container, find_container_ref, ApplyOutcome, UndoOutcome};
use crate::{
    error::{KubeApiError, Result},
    workload::{rewrite_probe_port_names, Workload},
};

/// Renames a named container port to a generated name ≤15 bytes, and
/// rewrites any probe that referenced it by name (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HideContainerPort {
    pub container: String,
    pub original_name: String,
    pub hidden_name: String,
}

impl HideContainerPort {
    pub fn apply(&self, workload: &mut Workload) -> Result<ApplyOutcome> {
        if self.is_done(workload) {
            return Ok(ApplyOutcome::AlreadyDone);
        }

        let container = find_container(workload, &self.container).ok_or_else(|| {
            KubeApiError::InvalidState {
                kind: "Container",
                namespace: String::new(),
                name: self.container.clone(),
                message: "container not found while hiding port".to_owned(),
            }
        })?;

        let Some(ports) = container.ports.as_mut() else {
            return Ok(ApplyOutcome::AlreadyDone);
        };
        for port in ports.iter_mut() {
            if port.name.as_deref() == Some(self.original_name.as_str()) {
                port.name = Some(self.hidden_name.clone());
            }
        }

        rewrite_probe_port_names(container, &self.original_name, &self.hidden_name);
        Ok(ApplyOutcome::Applied)
    }

    pub fn undo(&self, workload: &mut Workload) -> Result<UndoOutcome> {
        let Some(container) = find_container(workload, &self.container) else {
            return Ok(UndoOutcome::AlreadyUndone);
        };

        let renamed = container
            .ports
            .as_mut()
            .into_iter()
            .flatten()
            .any(|p| p.name.as_deref() == Some(self.hidden_name.as_str()));
        if !renamed {
            return Ok(UndoOutcome::AlreadyUndone);
        }

        for port in container.ports.as_mut().into_iter().flatten() {
            if port.name.as_deref() == Some(self.hidden_name.as_str()) {
                port.name = Some(self.original_name.clone());
            }
        }
        rewrite_probe_port_names(container, &self.hidden_name, &self.original_name);
        Ok(UndoOutcome::Undone)
    }

    pub fn is_done(&self, workload: &Workload) -> bool {
        find_container_ref(workload, &self.container)
            .and_then(|c| c.ports.as_ref())
            .map(|ports| ports.iter().any(|p| p.name.as_deref() == Some(self.hidden_name.as_str())))
            .unwrap_or(false)
    }

    pub fn explain_apply(&self) -> String {
        format!(
            "renamed container port \"{}\" to \"{}\" on container \"{}\"",
            self.original_name, self.hidden_name, self.container
        )
    }

    pub fn explain_undo(&self) -> String {
        format!(
            "renamed container port \"{}\" back to \"{}\" on container \"{}\"",
            self.hidden_name, self.original_name, self.container
        )
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{Container, ContainerPort, HTTPGetAction, PodSpec, PodTemplateSpec, Probe},
    };
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    use super::*;

    fn fixture() -> Workload {
        Workload::Deployment(Deployment {
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "web".to_owned(),
                            ports: Some(vec![ContainerPort {
                                name: Some("http".to_owned()),
                                container_port: 8080,
                                ..Default::default()
                            }]),
                            readiness_probe: Some(Probe {
                                http_get: Some(HTTPGetAction {
                                    port: IntOrString::String("http".to_owned()),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn action() -> HideContainerPort {
        HideContainerPort {
            container: "web".to_owned(),
            original_name: "http".to_owned(),
            hidden_name: "tx-http".to_owned(),
        }
    }

    #[test]
    fn apply_renames_the_port_and_rewrites_the_probe() {
        let mut workload = fixture();
        let action = action();

        assert_eq!(action.apply(&mut workload).unwrap(), ApplyOutcome::Applied);

        let container = &workload.containers()[0];
        assert_eq!(
            container.ports.as_ref().unwrap()[0].name.as_deref(),
            Some("tx-http")
        );
        let probe_port = container.readiness_probe.as_ref().unwrap().http_get.as_ref().unwrap().port.clone();
        assert_eq!(probe_port, IntOrString::String("tx-http".to_owned()));
    }

    #[test]
    fn apply_is_idempotent() {
        let mut workload = fixture();
        let action = action();
        action.apply(&mut workload).unwrap();

        assert_eq!(action.apply(&mut workload).unwrap(), ApplyOutcome::AlreadyDone);
    }

    #[test]
    fn undo_restores_the_original_name_and_probe() {
        let mut workload = fixture();
        let action = action();
        action.apply(&mut workload).unwrap();

        assert_eq!(action.undo(&mut workload).unwrap(), UndoOutcome::Undone);

        let container = &workload.containers()[0];
        assert_eq!(container.ports.as_ref().unwrap()[0].name.as_deref(), Some("http"));
        let probe_port = container.readiness_probe.as_ref().unwrap().http_get.as_ref().unwrap().port.clone();
        assert_eq!(probe_port, IntOrString::String("http".to_owned()));
    }

    #[test]
    fn undo_without_a_prior_apply_reports_already_undone() {
        let mut workload = fixture();
        let action = action();

        assert_eq!(action.undo(&mut workload).unwrap(), UndoOutcome::AlreadyUndone);
    }

    #[test]
    fn round_trip_restores_the_fixture_exactly() {
        let mut workload = fixture();
        let original = workload.containers()[0].clone();
        let action = action();

        action.apply(&mut workload).unwrap();
        action.undo(&mut workload).unwrap();

        assert_eq!(workload.containers()[0], original);
    }
}
