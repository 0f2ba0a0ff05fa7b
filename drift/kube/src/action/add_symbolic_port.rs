use k8s_openapi::{api::core::v1::Service, apimachinery::pkg::util::intstr::IntOrString};
use serde::{Deserialize, Serialize};

use super::{find_service_port, find_service_port_ref, ApplyOutcome, UndoOutcome};
use crate::error::{KubeApiError, Result};

/// Adds a symbolic target port to a service port that previously had none
/// (defaulted to the service's own port number) — spec §4.1, scenario 3.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddSymbolicPort {
    pub service_port: u16,
    pub symbolic_name: String,
}

impl AddSymbolicPort {
    pub fn apply(&self, service: &mut Service) -> Result<ApplyOutcome> {
        if self.is_done(service) {
            return Ok(ApplyOutcome::AlreadyDone);
        }

        let port = find_service_port(service, self.service_port).ok_or_else(|| {
            KubeApiError::InvalidState {
                kind: "Service",
                namespace: String::new(),
                name: String::new(),
                message: format!("no port {} to add a symbolic target port to", self.service_port),
            }
        })?;
        port.target_port = Some(IntOrString::String(self.symbolic_name.clone()));
        Ok(ApplyOutcome::Applied)
    }

    pub fn undo(&self, service: &mut Service) -> Result<UndoOutcome> {
        let Some(port) = find_service_port(service, self.service_port) else {
            return Ok(UndoOutcome::AlreadyUndone);
        };
        if port.target_port.as_ref() != Some(&IntOrString::String(self.symbolic_name.clone())) {
            return Ok(UndoOutcome::AlreadyUndone);
        }
        port.target_port = None;
        Ok(UndoOutcome::Undone)
    }

    pub fn is_done(&self, service: &Service) -> bool {
        find_service_port_ref(service, self.service_port)
            .map(|p| p.target_port.as_ref() == Some(&IntOrString::String(self.symbolic_name.clone())))
            .unwrap_or(false)
    }

    pub fn explain_apply(&self) -> String {
        format!(
            "added symbolic target port \"{}\" to service port {}",
            self.symbolic_name, self.service_port
        )
    }

    pub fn explain_undo(&self) -> String {
        format!(
            "cleared the target port added to service port {}, restoring the implicit default",
            self.service_port
        )
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};

    use super::*;

    fn fixture() -> Service {
        Service {
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port: 80,
                    target_port: None,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn action() -> AddSymbolicPort {
        AddSymbolicPort {
            service_port: 80,
            symbolic_name: "tx-80".to_owned(),
        }
    }

    #[test]
    fn apply_sets_the_symbolic_target_port() {
        let mut service = fixture();
        let action = action();

        assert_eq!(action.apply(&mut service).unwrap(), ApplyOutcome::Applied);
        assert_eq!(
            service.spec.unwrap().ports.unwrap()[0].target_port,
            Some(IntOrString::String("tx-80".to_owned()))
        );
    }

    #[test]
    fn apply_is_idempotent() {
        let mut service = fixture();
        let action = action();
        action.apply(&mut service).unwrap();

        assert_eq!(action.apply(&mut service).unwrap(), ApplyOutcome::AlreadyDone);
    }

    #[test]
    fn round_trip_restores_the_fixture_exactly() {
        let mut service = fixture();
        let original = service.clone();
        let action = action();

        action.apply(&mut service).unwrap();
        assert_eq!(action.undo(&mut service).unwrap(), UndoOutcome::Undone);
        assert_eq!(service, original);

        assert_eq!(action.undo(&mut service).unwrap(), UndoOutcome::AlreadyUndone);
    }

    #[test]
    fn apply_against_a_missing_port_errors() {
        let mut service = fixture();
        let action = AddSymbolicPort {
            service_port: 9999,
            symbolic_name: "tx-9999".to_owned(),
        };

        assert!(action.apply(&mut service).is_err());
    }
}
