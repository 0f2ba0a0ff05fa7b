use k8s_openapi::api::core::v1::EnvVar;
use serde::{Deserialize, Serialize};

use super::{find_container, find_container_ref, ApplyOutcome, UndoOutcome};
use crate::{error::Result, workload::Workload};

/// Adds environment variables to a named app container, in deterministic
/// key order (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddEnvVars {
    pub container: String,
    pub vars: Vec<(String, String)>,
}

impl AddEnvVars {
    pub fn apply(&self, workload: &mut Workload) -> Result<ApplyOutcome> {
        if self.is_done(workload) {
            return Ok(ApplyOutcome::AlreadyDone);
        }

        let Some(container) = find_container(workload, &self.container) else {
            return Ok(ApplyOutcome::AlreadyDone);
        };

        let env = container.env.get_or_insert_with(Default::default);
        for (key, value) in &self.vars {
            if env.iter().any(|e| &e.name == key) {
                continue;
            }
            env.push(EnvVar {
                name: key.clone(),
                value: Some(value.clone()),
                value_from: None,
            });
        }

        Ok(ApplyOutcome::Applied)
    }

    pub fn undo(&self, workload: &mut Workload) -> Result<UndoOutcome> {
        let Some(container) = find_container(workload, &self.container) else {
            return Ok(UndoOutcome::AlreadyUndone);
        };

        let Some(env) = container.env.as_mut() else {
            return Ok(UndoOutcome::AlreadyUndone);
        };

        let keys: std::collections::HashSet<&str> =
            self.vars.iter().map(|(k, _)| k.as_str()).collect();
        let before = env.len();
        env.retain(|e| !keys.contains(e.name.as_str()));

        if env.len() == before {
            Ok(UndoOutcome::AlreadyUndone)
        } else {
            Ok(UndoOutcome::Undone)
        }
    }

    pub fn is_done(&self, workload: &Workload) -> bool {
        let Some(container) = find_container_ref(workload, &self.container) else {
            return false;
        };
        let Some(env) = container.env.as_ref() else {
            return false;
        };
        self.vars
            .iter()
            .all(|(k, _)| env.iter().any(|e| &e.name == k))
    }

    pub fn explain_apply(&self) -> String {
        let keys: Vec<&str> = self.vars.iter().map(|(k, _)| k.as_str()).collect();
        format!(
            "added environment variables [{}] to container \"{}\"",
            keys.join(", "),
            self.container
        )
    }

    pub fn explain_undo(&self) -> String {
        let keys: Vec<&str> = self.vars.iter().map(|(k, _)| k.as_str()).collect();
        format!(
            "removed environment variables [{}] from container \"{}\"",
            keys.join(", "),
            self.container
        )
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec},
    };

    use super::*;

    fn fixture() -> Workload {
        Workload::Deployment(Deployment {
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "web".to_owned(),
                            env: Some(vec![EnvVar {
                                name: "EXISTING".to_owned(),
                                value: Some("kept".to_owned()),
                                value_from: None,
                            }]),
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

    fn action() -> AddEnvVars {
        AddEnvVars {
            container: "web".to_owned(),
            vars: vec![
                ("DRIFT_INTERCEPT".to_owned(), "1".to_owned()),
                ("DRIFT_AGENT_PORT".to_owned(), "8765".to_owned()),
            ],
        }
    }

    #[test]
    fn apply_appends_without_disturbing_existing_vars() {
        let mut workload = fixture();
        let action = action();

        assert_eq!(action.apply(&mut workload).unwrap(), ApplyOutcome::Applied);

        let env = workload.containers()[0].env.as_ref().unwrap();
        assert_eq!(env.len(), 3);
        assert_eq!(env[0].name, "EXISTING");
        assert_eq!(env[1].name, "DRIFT_INTERCEPT");
        assert_eq!(env[2].name, "DRIFT_AGENT_PORT");
    }

    #[test]
    fn apply_is_idempotent() {
        let mut workload = fixture();
        let action = action();
        action.apply(&mut workload).unwrap();

        assert_eq!(action.apply(&mut workload).unwrap(), ApplyOutcome::AlreadyDone);
        assert_eq!(workload.containers()[0].env.as_ref().unwrap().len(), 3);
    }

    #[test]
    fn undo_removes_only_the_keys_it_added() {
        let mut workload = fixture();
        let action = action();
        action.apply(&mut workload).unwrap();

        assert_eq!(action.undo(&mut workload).unwrap(), UndoOutcome::Undone);

        let env = workload.containers()[0].env.as_ref().unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].name, "EXISTING");
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
