use k8s_openapi::api::core::v1::{Container, ContainerPort, Volume, VolumeMount};
use serde::{Deserialize, Serialize};

use super::{find_container_ref, ApplyOutcome, UndoOutcome};
use crate::{error::Result, workload::Workload};

/// Tool versions below this one never created the annotation-backed volume,
/// so undoing an action recorded by one of them must leave the volume in
/// place — removing it would be undoing state that was never ours. This is
/// the "some threshold" spec §4.1 leaves unspecified; see DESIGN.md.
pub const VOLUME_REMOVAL_MIN_VERSION: semver::Version = semver::Version::new(0, 2, 0);

/// Adds the sidecar container that lets the cluster intercept traffic for
/// one app container's port (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddSidecarContainer {
    pub container_name: String,
    pub image: String,
    /// Named container port on `app_container` the sidecar takes over.
    pub takes_over_port: String,
    pub app_container: String,
    pub volume_name: String,
}

impl AddSidecarContainer {
    const VOLUME_MOUNT_PATH: &'static str = "/var/run/drift";

    pub fn apply(&self, workload: &mut Workload) -> Result<ApplyOutcome> {
        if self.is_done(workload) {
            return Ok(ApplyOutcome::AlreadyDone);
        }

        self.ensure_volume(workload);

        workload.containers_mut().push(Container {
            name: self.container_name.clone(),
            image: Some(self.image.clone()),
            ports: Some(vec![ContainerPort {
                name: Some(self.takes_over_port.clone()),
                ..Default::default()
            }]),
            volume_mounts: Some(vec![VolumeMount {
                name: self.volume_name.clone(),
                mount_path: Self::VOLUME_MOUNT_PATH.to_owned(),
                ..Default::default()
            }]),
            ..Default::default()
        });

        Ok(ApplyOutcome::Applied)
    }

    /// Overwrites the sidecar's image in place (spec §4.2 EnsureAgent:
    /// "if present but image differs, upgrades by overwriting the container
    /// image"). Not part of apply/undo — called directly by the installer.
    pub fn upgrade_image(&self, workload: &mut Workload, new_image: &str) -> bool {
        let Some(container) = workload
            .containers_mut()
            .iter_mut()
            .find(|c| c.name == self.container_name)
        else {
            return false;
        };
        if container.image.as_deref() == Some(new_image) {
            return false;
        }
        container.image = Some(new_image.to_owned());
        true
    }

    pub fn undo(&self, workload: &mut Workload, tool_version: &semver::Version) -> Result<UndoOutcome> {
        let Some(index) = workload
            .containers_mut()
            .iter()
            .position(|c| c.name == self.container_name)
        else {
            return Ok(UndoOutcome::AlreadyUndone);
        };

        workload.containers_mut().remove(index);

        if *tool_version >= VOLUME_REMOVAL_MIN_VERSION {
            self.remove_volume(workload);
        }

        Ok(UndoOutcome::Undone)
    }

    pub fn is_done(&self, workload: &Workload) -> bool {
        find_container_ref(workload, &self.container_name).is_some()
    }

    fn ensure_volume(&self, workload: &mut Workload) {
        let Some(template) = workload.pod_template_mut() else {
            return;
        };
        let spec = template.spec.get_or_insert_with(Default::default);
        let volumes = spec.volumes.get_or_insert_with(Default::default);
        if volumes.iter().any(|v| v.name == self.volume_name) {
            return;
        }
        volumes.push(Volume {
            name: self.volume_name.clone(),
            empty_dir: Some(Default::default()),
            ..Default::default()
        });
    }

    fn remove_volume(&self, workload: &mut Workload) {
        if let Some(template) = workload.pod_template_mut() {
            if let Some(spec) = template.spec.as_mut() {
                if let Some(volumes) = spec.volumes.as_mut() {
                    volumes.retain(|v| v.name != self.volume_name);
                }
            }
        }
    }

    pub fn explain_apply(&self) -> String {
        format!(
            "added sidecar container \"{}\" ({}) taking over port \"{}\" on container \"{}\"",
            self.container_name, self.image, self.takes_over_port, self.app_container
        )
    }

    pub fn explain_undo(&self) -> String {
        format!("removed sidecar container \"{}\"", self.container_name)
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{Container, PodSpec, PodTemplateSpec},
    };

    use super::*;

    fn fixture() -> Workload {
        Workload::Deployment(Deployment {
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "web".to_owned(),
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

    fn action() -> AddSidecarContainer {
        AddSidecarContainer {
            container_name: "drift-agent".to_owned(),
            image: "docker.io/drift/agent:1.0".to_owned(),
            takes_over_port: "tx-http".to_owned(),
            app_container: "web".to_owned(),
            volume_name: "drift-agent".to_owned(),
        }
    }

    #[test]
    fn apply_adds_the_sidecar_and_its_volume() {
        let mut workload = fixture();
        let action = action();

        assert_eq!(action.apply(&mut workload).unwrap(), ApplyOutcome::Applied);
        assert_eq!(workload.containers().len(), 2);
        assert!(workload.containers().iter().any(|c| c.name == "drift-agent"));

        let volumes = workload.pod_template().unwrap().spec.as_ref().unwrap().volumes.as_ref().unwrap();
        assert!(volumes.iter().any(|v| v.name == "drift-agent"));
    }

    #[test]
    fn apply_is_idempotent() {
        let mut workload = fixture();
        let action = action();
        action.apply(&mut workload).unwrap();

        assert_eq!(action.apply(&mut workload).unwrap(), ApplyOutcome::AlreadyDone);
        assert_eq!(workload.containers().len(), 2);
    }

    #[test]
    fn upgrade_image_overwrites_only_when_different() {
        let mut workload = fixture();
        let action = action();
        action.apply(&mut workload).unwrap();

        assert!(action.upgrade_image(&mut workload, "docker.io/drift/agent:2.0"));
        assert_eq!(
            workload.containers().iter().find(|c| c.name == "drift-agent").unwrap().image.as_deref(),
            Some("docker.io/drift/agent:2.0")
        );

        assert!(!action.upgrade_image(&mut workload, "docker.io/drift/agent:2.0"));
    }

    #[test]
    fn undo_below_the_volume_removal_threshold_keeps_the_volume() {
        let mut workload = fixture();
        let action = action();
        action.apply(&mut workload).unwrap();

        let old_version = semver::Version::new(0, 1, 0);
        assert_eq!(action.undo(&mut workload, &old_version).unwrap(), UndoOutcome::Undone);

        assert!(!workload.containers().iter().any(|c| c.name == "drift-agent"));
        let volumes = workload.pod_template().unwrap().spec.as_ref().unwrap().volumes.as_ref().unwrap();
        assert!(volumes.iter().any(|v| v.name == "drift-agent"));
    }

    #[test]
    fn undo_at_or_above_the_volume_removal_threshold_removes_the_volume() {
        let mut workload = fixture();
        let original = workload.containers()[0].clone();
        let action = action();
        action.apply(&mut workload).unwrap();

        assert_eq!(
            action.undo(&mut workload, &VOLUME_REMOVAL_MIN_VERSION).unwrap(),
            UndoOutcome::Undone
        );

        assert_eq!(workload.containers().len(), 1);
        assert_eq!(workload.containers()[0], original);
        let volumes = workload.pod_template().unwrap().spec.as_ref().unwrap().volumes.as_ref();
        assert!(volumes.map(|v| v.is_empty()).unwrap_or(true));
    }

    #[test]
    fn undo_without_a_prior_apply_reports_already_undone() {
        let mut workload = fixture();
        let action = action();

        assert_eq!(
            action.undo(&mut workload, &VOLUME_REMOVAL_MIN_VERSION).unwrap(),
            UndoOutcome::AlreadyUndone
        );
    }
}
