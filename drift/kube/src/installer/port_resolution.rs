//! Decides which [`crate::action::PartialAction`]s are needed to let the
//! agent take over one app container's port, given how the backing service
//! currently addresses it (spec §4.1 "three scenarios", §4.2 "port
//! resolution").

use k8s_openapi::{api::core::v1::Service, apimachinery::pkg::util::intstr::IntOrString};

use crate::{
    action::{AddSymbolicPort, HideContainerPort, MakePortSymbolic},
    error::{KubeApiError, Result},
    workload::Workload,
};

/// The container port the caller asked to intercept, and the service port
/// in front of it.
pub struct PortRequest<'a> {
    pub workload: &'a Workload,
    pub service: &'a Service,
    pub service_port: u16,
}

/// The port-handling half of an action plan: the fields `CompleteAction`
/// needs to eventually address this port symbolically, plus the name of
/// the app container whose port is being taken over.
pub struct ResolvedPort {
    pub app_container: String,
    pub container_port_name: String,
    pub hide_container_port: Option<HideContainerPort>,
    pub make_port_symbolic: Option<MakePortSymbolic>,
    pub add_symbolic_port: Option<AddSymbolicPort>,
}

pub fn resolve(request: &PortRequest<'_>) -> Result<ResolvedPort> {
    let service_port = find_service_port(request.service, request.service_port)?;
    let target = service_port.target_port.clone();

    match target {
        // Scenario 1: the service already names its target port
        // symbolically. As long as a container exposes a port under that
        // name, no rewrite is needed at all — the sidecar can claim it
        // directly.
        Some(IntOrString::String(name)) => {
            let container = find_container_exposing_port_name(request.workload, &name)?;
            Ok(ResolvedPort {
                app_container: container.to_owned(),
                container_port_name: name,
                hide_container_port: None,
                make_port_symbolic: None,
                add_symbolic_port: None,
            })
        }

        // Scenario 2: the service targets a numeric port. Find the
        // container port with that number; if it has a name, hide it and
        // have the service follow the new name. If it has no name, we
        // cannot rename a nameless port, so fall through as if it were
        // scenario 3's "give the service a name to chase" but against the
        // container port's number directly.
        Some(IntOrString::Int(port_number)) => {
            let (container, existing_name) =
                find_container_exposing_port_number(request.workload, port_number)?;
            let hidden_name = generate_port_name(port_number as u16);

            match existing_name {
                Some(original_name) => Ok(ResolvedPort {
                    app_container: container.clone(),
                    container_port_name: hidden_name.clone(),
                    hide_container_port: Some(HideContainerPort {
                        container,
                        original_name,
                        hidden_name: hidden_name.clone(),
                    }),
                    make_port_symbolic: Some(MakePortSymbolic {
                        service_port: request.service_port,
                        target_port: port_number as u16,
                        symbolic_name: hidden_name,
                    }),
                    add_symbolic_port: None,
                }),
                None => Ok(ResolvedPort {
                    app_container: container,
                    container_port_name: hidden_name.clone(),
                    hide_container_port: None,
                    make_port_symbolic: Some(MakePortSymbolic {
                        service_port: request.service_port,
                        target_port: port_number as u16,
                        symbolic_name: hidden_name,
                    }),
                    add_symbolic_port: None,
                }),
            }
        }

        // Scenario 3: no target port at all — Kubernetes defaults it to
        // the service port's own number. Same handling as scenario 2 but
        // through `AddSymbolicPort` since there is nothing to replace.
        None => {
            let port_number = request.service_port;
            let (container, existing_name) =
                find_container_exposing_port_number(request.workload, port_number as i32)?;
            let symbolic_name = generate_port_name(port_number);

            Ok(ResolvedPort {
                app_container: container.clone(),
                container_port_name: symbolic_name.clone(),
                hide_container_port: existing_name.clone().map(|original_name| HideContainerPort {
                    container: container.clone(),
                    original_name,
                    hidden_name: symbolic_name.clone(),
                }),
                make_port_symbolic: None,
                add_symbolic_port: Some(AddSymbolicPort {
                    service_port: request.service_port,
                    symbolic_name,
                }),
            })
        }
    }
}

fn find_service_port(
    service: &Service,
    port_number: u16,
) -> Result<&k8s_openapi::api::core::v1::ServicePort> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| ports.iter().find(|p| p.port == port_number as i32))
        .ok_or_else(|| {
            KubeApiError::NoMatchingService(port_number.to_string(), service_display(service))
        })
}

fn find_container_exposing_port_name(workload: &Workload, name: &str) -> Result<String> {
    workload
        .containers()
        .iter()
        .find(|c| {
            c.ports
                .as_ref()
                .map(|ports| ports.iter().any(|p| p.name.as_deref() == Some(name)))
                .unwrap_or(false)
        })
        .map(|c| c.name.clone())
        .ok_or_else(|| KubeApiError::NoAcceptableWorkload(workload.name_str_for_error()))
}

fn find_container_exposing_port_number(
    workload: &Workload,
    port_number: i32,
) -> Result<(String, Option<String>)> {
    for container in workload.containers() {
        let Some(ports) = container.ports.as_ref() else {
            continue;
        };
        if let Some(port) = ports.iter().find(|p| p.container_port == port_number) {
            return Ok((container.name.clone(), port.name.clone()));
        }
    }
    Err(KubeApiError::NoAcceptableWorkload(
        workload.name_str_for_error(),
    ))
}

/// Kubernetes container port names are limited to 15 bytes and must be
/// valid DNS labels. Deterministic by construction (spec §8 scenarios 2/3
/// mandate the literal `tx-<port>` form, e.g. `tx-8080`), so re-running the
/// installer against the same workload always picks the same name.
fn generate_port_name(port_number: u16) -> String {
    format!("tx-{port_number}")
}

fn service_display(service: &Service) -> String {
    format!(
        "{}/{}",
        service.metadata.namespace.as_deref().unwrap_or(""),
        service.metadata.name.as_deref().unwrap_or(""),
    )
}

trait WorkloadDisplayExt {
    fn name_str_for_error(&self) -> String;
}

impl WorkloadDisplayExt for Workload {
    fn name_str_for_error(&self) -> String {
        use crate::error::ObjectRef;
        format!("{}/{}", self.namespace_str(), self.name_str())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec},
    };

    use super::*;

    #[test]
    fn generated_port_names_stay_within_the_kubernetes_limit() {
        let name = generate_port_name(54321);
        assert_eq!(name, "tx-54321");
        assert!(name.len() <= 15);
    }

    fn deployment_with_port(port: ContainerPort) -> Workload {
        Workload::Deployment(Deployment {
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "web".to_owned(),
                            ports: Some(vec![port]),
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

    fn service_with_target(port: u16, target: Option<IntOrString>) -> Service {
        Service {
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port: port as i32,
                    target_port: target,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Spec §8 scenario 1: a named container port already addressed
    /// symbolically by the service needs no rewriting at all.
    #[test]
    fn scenario_1_named_target_port_needs_no_rewrite() {
        let workload = deployment_with_port(ContainerPort {
            name: Some("http".to_owned()),
            container_port: 8080,
            ..Default::default()
        });
        let service = service_with_target(80, Some(IntOrString::String("http".to_owned())));

        let resolved = resolve(&PortRequest {
            workload: &workload,
            service: &service,
            service_port: 80,
        })
        .unwrap();

        assert_eq!(resolved.app_container, "web");
        assert_eq!(resolved.container_port_name, "http");
        assert!(resolved.hide_container_port.is_none());
        assert!(resolved.make_port_symbolic.is_none());
        assert!(resolved.add_symbolic_port.is_none());
    }

    /// Spec §8 scenario 2: a numeric target port on an unnamed container
    /// port needs a fresh symbolic name on both the container and the
    /// service, with no rename to reverse on the container side.
    #[test]
    fn scenario_2_numeric_target_port_gets_a_symbolic_name() {
        let workload = deployment_with_port(ContainerPort {
            name: None,
            container_port: 8080,
            ..Default::default()
        });
        let service = service_with_target(8080, Some(IntOrString::Int(8080)));

        let resolved = resolve(&PortRequest {
            workload: &workload,
            service: &service,
            service_port: 8080,
        })
        .unwrap();

        assert_eq!(resolved.app_container, "web");
        assert!(resolved.hide_container_port.is_none());
        let make_symbolic = resolved.make_port_symbolic.unwrap();
        assert_eq!(make_symbolic.service_port, 8080);
        assert_eq!(make_symbolic.target_port, 8080);
        assert_eq!(make_symbolic.symbolic_name, "tx-8080");
        assert_eq!(resolved.container_port_name, "tx-8080");
        assert!(resolved.add_symbolic_port.is_none());
    }

    /// Scenario 2 variant: the numeric target port's container port is
    /// already named, so the plan must hide the old name in addition to
    /// making the service symbolic, so the rename can be undone later.
    #[test]
    fn scenario_2_variant_named_container_port_is_hidden_first() {
        let workload = deployment_with_port(ContainerPort {
            name: Some("http".to_owned()),
            container_port: 8080,
            ..Default::default()
        });
        let service = service_with_target(8080, Some(IntOrString::Int(8080)));

        let resolved = resolve(&PortRequest {
            workload: &workload,
            service: &service,
            service_port: 8080,
        })
        .unwrap();

        let hide = resolved.hide_container_port.unwrap();
        assert_eq!(hide.original_name, "http");
        assert_eq!(hide.hidden_name, "tx-8080");
        assert_eq!(resolved.container_port_name, "tx-8080");
        assert_eq!(resolved.make_port_symbolic.unwrap().symbolic_name, "tx-8080");
    }

    /// Spec §8 scenario 3: no target port at all (defaulted to the service
    /// port's own number) needs `AddSymbolicPort`, not `MakePortSymbolic`.
    #[test]
    fn scenario_3_default_target_port_gets_add_symbolic_port() {
        let workload = deployment_with_port(ContainerPort {
            name: None,
            container_port: 80,
            ..Default::default()
        });
        let service = service_with_target(80, None);

        let resolved = resolve(&PortRequest {
            workload: &workload,
            service: &service,
            service_port: 80,
        })
        .unwrap();

        assert!(resolved.make_port_symbolic.is_none());
        assert!(resolved.hide_container_port.is_none());
        let add_symbolic = resolved.add_symbolic_port.unwrap();
        assert_eq!(add_symbolic.service_port, 80);
        assert_eq!(add_symbolic.symbolic_name, "tx-80");
        assert_eq!(resolved.container_port_name, "tx-80");
    }

    #[test]
    fn resolve_against_a_service_port_that_does_not_exist_errors() {
        let workload = deployment_with_port(ContainerPort {
            name: Some("http".to_owned()),
            container_port: 8080,
            ..Default::default()
        });
        let service = service_with_target(80, Some(IntOrString::String("http".to_owned())));

        let err = resolve(&PortRequest {
            workload: &workload,
            service: &service,
            service_port: 9999,
        })
        .unwrap_err();
        assert!(matches!(err, KubeApiError::NoMatchingService(_, _)));
    }
}
