use k8s_openapi::api::core::v1::Container;
use serde::{Deserialize, Serialize};

use super::find_init_container_ref;
use crate::{
    action::{ApplyOutcome, UndoOutcome},
    error::Result,
    workload::Workload,
};

/// Added only when the backing service is headless (spec §4.1): without a
/// cluster IP, the agent needs an init container to prepare iptables rules
/// before the app container starts routing its own traffic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddInitContainer {
    pub container_name: String,
    pub image: String,
}

impl AddInitContainer {
    pub fn apply(&self, workload: &mut Workload) -> Result<ApplyOutcome> {
        if self.is_done(workload) {
            return Ok(ApplyOutcome::AlreadyDone);
        }

        workload.init_containers_mut().push(Container {
            name: self.container_name.clone(),
            image: Some(self.image.clone()),
            ..Default::default()
        });

        Ok(ApplyOutcome::Applied)
    }

    pub fn undo(&self, workload: &mut Workload) -> Result<UndoOutcome> {
        let Some(index) = workload
            .init_containers_mut()
            .iter()
            .position(|c| c.name == self.container_name)
        else {
            return Ok(UndoOutcome::AlreadyUndone);
        };
        workload.init_containers_mut().remove(index);
        Ok(UndoOutcome::Undone)
    }

    pub fn is_done(&self, workload: &Workload) -> bool {
        find_init_container_ref(workload, &self.container_name).is_some()
    }

    pub fn explain_apply(&self) -> String {
        format!("added init container \"{}\" ({})", self.container_name, self.image)
    }

    pub fn explain_undo(&self) -> String {
        format!("removed init container \"{}\"", self.container_name)
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{PodSpec, PodTemplateSpec},
    };

    use super::*;

    fn fixture() -> Workload {
        Workload::Deployment(Deployment {
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec::default()),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn action() -> AddInitContainer {
        AddInitContainer {
            container_name: "drift-init".to_owned(),
            image: "docker.io/drift/init:1.0".to_owned(),
        }
    }

    #[test]
    fn apply_adds_the_init_container() {
        let mut workload = fixture();
        let action = action();

        assert_eq!(action.apply(&mut workload).unwrap(), ApplyOutcome::Applied);
        assert_eq!(workload.init_containers().len(), 1);
        assert_eq!(workload.init_containers()[0].name, "drift-init");
    }

    #[test]
    fn apply_is_idempotent() {
        let mut workload = fixture();
        let action = action();
        action.apply(&mut workload).unwrap();

        assert_eq!(action.apply(&mut workload).unwrap(), ApplyOutcome::AlreadyDone);
        assert_eq!(workload.init_containers().len(), 1);
    }

    #[test]
    fn round_trip_restores_the_fixture_exactly() {
        let mut workload = fixture();
        let action = action();

        action.apply(&mut workload).unwrap();
        assert_eq!(action.undo(&mut workload).unwrap(), UndoOutcome::Undone);
        assert!(workload.init_containers().is_empty());

        assert_eq!(action.undo(&mut workload).unwrap(), UndoOutcome::AlreadyUndone);
    }
}
