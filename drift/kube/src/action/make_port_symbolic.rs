use k8s_openapi::{api::core::v1::Service, apimachinery::pkg::util::intstr::IntOrString};
use serde::{Deserialize, Serialize};

use super::{find_service_port, find_service_port_ref, ApplyOutcome, UndoOutcome};
use crate::error::{KubeApiError, Result};

/// Replaces a numeric service target port with a generated symbolic name
/// that matches the container port renamed by [`super::HideContainerPort`]
/// (spec §4.1, scenario 2).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MakePortSymbolic {
    pub service_port: u16,
    pub target_port: u16,
    pub symbolic_name: String,
}

impl MakePortSymbolic {
    pub fn apply(&self, service: &mut Service) -> Result<ApplyOutcome> {
        if self.is_done(service) {
            return Ok(ApplyOutcome::AlreadyDone);
        }

        let port = find_service_port(service, self.service_port).ok_or_else(|| {
            KubeApiError::InvalidState {
                kind: "Service",
                namespace: String::new(),
                name: String::new(),
                message: format!("no port {} to make symbolic", self.service_port),
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
        port.target_port = Some(IntOrString::Int(self.target_port as i32));
        Ok(UndoOutcome::Undone)
    }

    pub fn is_done(&self, service: &Service) -> bool {
        find_service_port_ref(service, self.service_port)
            .map(|p| p.target_port.as_ref() == Some(&IntOrString::String(self.symbolic_name.clone())))
            .unwrap_or(false)
    }

    pub fn explain_apply(&self) -> String {
        format!(
            "replaced service port {}'s numeric target port {} with symbolic name \"{}\"",
            self.service_port, self.target_port, self.symbolic_name
        )
    }

    pub fn explain_undo(&self) -> String {
        format!(
            "restored service port {}'s target port to the number {}",
            self.service_port, self.target_port
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
                    target_port: Some(IntOrString::Int(8080)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn action() -> MakePortSymbolic {
        MakePortSymbolic {
            service_port: 80,
            target_port: 8080,
            symbolic_name: "tx-8080".to_owned(),
        }
    }

    #[test]
    fn apply_replaces_the_numeric_target_with_the_symbolic_name() {
        let mut service = fixture();
        let action = action();

        assert_eq!(action.apply(&mut service).unwrap(), ApplyOutcome::Applied);
        assert_eq!(
            service.spec.unwrap().ports.unwrap()[0].target_port,
            Some(IntOrString::String("tx-8080".to_owned()))
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
    fn round_trip_restores_the_numeric_target_port() {
        let mut service = fixture();
        let original = service.clone();
        let action = action();

        action.apply(&mut service).unwrap();
        assert_eq!(action.undo(&mut service).unwrap(), UndoOutcome::Undone);
        assert_eq!(service, original);

        assert_eq!(action.undo(&mut service).unwrap(), UndoOutcome::AlreadyUndone);
    }
}
