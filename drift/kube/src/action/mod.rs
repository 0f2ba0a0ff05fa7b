//! The Action Library (spec §4.1): a closed set of reversible, idempotent
//! modifications of a workload or service object. Each kind is a plain
//! struct; [`PartialAction`] is the tagged union that dispatches apply/undo/
//! is-done/explain by hand-written `match`, per the design note in spec §9
//! ("dynamic dispatch replaced with tagged variants" — no runtime
//! polymorphism is required here).

mod add_env;
mod add_init_container;
mod add_sidecar;
mod add_symbolic_port;
mod hide_container_port;
mod make_port_symbolic;

pub mod annotation;

use k8s_openapi::api::core::v1::Service;
use serde::{Deserialize, Serialize};

pub use add_env::AddEnvVars;
pub use add_init_container::AddInitContainer;
pub use add_sidecar::AddSidecarContainer;
pub use add_symbolic_port::AddSymbolicPort;
pub use annotation::{AnnotationError, CompleteAction};
pub use hide_container_port::HideContainerPort;
pub use make_port_symbolic::MakePortSymbolic;

use crate::workload::Workload;

/// Result of applying a [`PartialAction`]: whether it actually did anything,
/// or found the object already in the desired state (spec §4.1: "Applying
/// an action that is already done must be a no-op").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    AlreadyDone,
}

/// Result of undoing a [`PartialAction`]. An action that was never applied
/// undoes to [`UndoOutcome::AlreadyUndone`], which callers treat as success
/// (spec §4.1, §7: "an 'already undone' outcome is treated as success").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoOutcome {
    Undone,
    AlreadyUndone,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum PartialAction {
    HideContainerPort(HideContainerPort),
    MakePortSymbolic(MakePortSymbolic),
    AddSymbolicPort(AddSymbolicPort),
    AddSidecarContainer(AddSidecarContainer),
    AddInitContainer(AddInitContainer),
    AddEnvVars(AddEnvVars),
}

impl PartialAction {
    pub fn apply(
        &self,
        workload: &mut Workload,
        service: &mut Service,
    ) -> crate::error::Result<ApplyOutcome> {
        match self {
            Self::HideContainerPort(a) => a.apply(workload),
            Self::MakePortSymbolic(a) => a.apply(service),
            Self::AddSymbolicPort(a) => a.apply(service),
            Self::AddSidecarContainer(a) => a.apply(workload),
            Self::AddInitContainer(a) => a.apply(workload),
            Self::AddEnvVars(a) => a.apply(workload),
        }
    }

    pub fn undo(
        &self,
        workload: &mut Workload,
        service: &mut Service,
        tool_version: &semver::Version,
    ) -> crate::error::Result<UndoOutcome> {
        match self {
            Self::HideContainerPort(a) => a.undo(workload),
            Self::MakePortSymbolic(a) => a.undo(service),
            Self::AddSymbolicPort(a) => a.undo(service),
            Self::AddSidecarContainer(a) => a.undo(workload, tool_version),
            Self::AddInitContainer(a) => a.undo(workload),
            Self::AddEnvVars(a) => a.undo(workload),
        }
    }

    pub fn is_done(&self, workload: &Workload, service: &Service) -> bool {
        match self {
            Self::HideContainerPort(a) => a.is_done(workload),
            Self::MakePortSymbolic(a) => a.is_done(service),
            Self::AddSymbolicPort(a) => a.is_done(service),
            Self::AddSidecarContainer(a) => a.is_done(workload),
            Self::AddInitContainer(a) => a.is_done(workload),
            Self::AddEnvVars(a) => a.is_done(workload),
        }
    }

    pub fn explain_apply(&self) -> String {
        match self {
            Self::HideContainerPort(a) => a.explain_apply(),
            Self::MakePortSymbolic(a) => a.explain_apply(),
            Self::AddSymbolicPort(a) => a.explain_apply(),
            Self::AddSidecarContainer(a) => a.explain_apply(),
            Self::AddInitContainer(a) => a.explain_apply(),
            Self::AddEnvVars(a) => a.explain_apply(),
        }
    }

    pub fn explain_undo(&self) -> String {
        match self {
            Self::HideContainerPort(a) => a.explain_undo(),
            Self::MakePortSymbolic(a) => a.explain_undo(),
            Self::AddSymbolicPort(a) => a.explain_undo(),
            Self::AddSidecarContainer(a) => a.explain_undo(),
            Self::AddInitContainer(a) => a.explain_undo(),
            Self::AddEnvVars(a) => a.explain_undo(),
        }
    }
}

fn find_container<'a>(
    workload: &'a mut Workload,
    name: &str,
) -> Option<&'a mut k8s_openapi::api::core::v1::Container> {
    workload
        .containers_mut()
        .iter_mut()
        .find(|c| c.name == name)
}

fn find_container_ref<'a>(
    workload: &'a Workload,
    name: &str,
) -> Option<&'a k8s_openapi::api::core::v1::Container> {
    workload.containers().iter().find(|c| c.name == name)
}

fn find_init_container_ref<'a>(
    workload: &'a Workload,
    name: &str,
) -> Option<&'a k8s_openapi::api::core::v1::Container> {
    workload.init_containers().iter().find(|c| c.name == name)
}

fn find_service_port<'a>(
    service: &'a mut Service,
    port_number: u16,
) -> Option<&'a mut k8s_openapi::api::core::v1::ServicePort> {
    service
        .spec
        .as_mut()?
        .ports
        .as_mut()?
        .iter_mut()
        .find(|p| p.port == port_number as i32)
}

fn find_service_port_ref(service: &Service, port_number: u16) -> Option<&k8s_openapi::api::core::v1::ServicePort> {
    service
        .spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .find(|p| p.port == port_number as i32)
}
