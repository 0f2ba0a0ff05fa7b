//! The versioned annotation that persists a workload's action plan (spec §3
//! "Workload action annotation", §6 "Annotation format", §9).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{
    AddEnvVars, AddInitContainer, AddSidecarContainer, AddSymbolicPort, HideContainerPort,
    MakePortSymbolic, PartialAction,
};

/// Domain key under which the annotation is stored on the workload/service.
pub const ANNOTATION_KEY: &str = "drift.dev/action-plan";

#[derive(thiserror::Error, Debug)]
pub enum AnnotationError {
    #[error("failed to parse action annotation: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(
        "workload carries an action annotation written by version {annotation}, which is newer \
        (major or minor) than the running tool's version {tool} — refusing to read it"
    )]
    VersionTooNew {
        annotation: semver::Version,
        tool: semver::Version,
    },
}

/// The full, versioned action plan recorded on a workload or service (spec
/// §4.1: "complete action"). At most one instance of each action kind may
/// be present; `actions_in_order` always yields them in the fixed
/// apply order below, which is also the reverse of the undo order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CompleteAction {
    #[serde(with = "version_as_string")]
    pub version: semver::Version,
    pub referenced_service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referenced_service_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referenced_service_port_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hide_container_port: Option<HideContainerPort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub make_port_symbolic: Option<MakePortSymbolic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_symbolic_port: Option<AddSymbolicPort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_traffic_agent: Option<AddSidecarContainer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_init_container: Option<AddInitContainer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_tp_env: Option<AddEnvVars>,
}

impl CompleteAction {
    /// The fixed apply order (spec §4.1's "ordered sequence"): hide the
    /// real port first, make the service side agree on a name for it,
    /// then add the sidecar that takes the hidden port over, then the
    /// init container (headless services only), then env vars last so the
    /// sidecar's own environment additions don't race container creation.
    pub fn actions_in_order(&self) -> Vec<PartialAction> {
        let mut actions = Vec::with_capacity(6);
        if let Some(a) = &self.hide_container_port {
            actions.push(PartialAction::HideContainerPort(a.clone()));
        }
        if let Some(a) = &self.make_port_symbolic {
            actions.push(PartialAction::MakePortSymbolic(a.clone()));
        }
        if let Some(a) = &self.add_symbolic_port {
            actions.push(PartialAction::AddSymbolicPort(a.clone()));
        }
        if let Some(a) = &self.add_traffic_agent {
            actions.push(PartialAction::AddSidecarContainer(a.clone()));
        }
        if let Some(a) = &self.add_init_container {
            actions.push(PartialAction::AddInitContainer(a.clone()));
        }
        if let Some(a) = &self.add_tp_env {
            actions.push(PartialAction::AddEnvVars(a.clone()));
        }
        actions
    }

    pub fn sidecar_image(&self) -> Option<&str> {
        self.add_traffic_agent.as_ref().map(|a| a.image.as_str())
    }
}

mod version_as_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(version: &semver::Version, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&version.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<semver::Version, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Reads and validates the annotation, if present. A workload without the
/// annotation returns `Ok(None)` — distinct from a workload whose annotation
/// fails to parse or is forward-incompatible, both of which are errors
/// (spec §4.1: "if newer, reject with an explicit error — never silently
/// proceed").
pub fn read(
    annotations: &BTreeMap<String, String>,
    tool_version: &semver::Version,
) -> Result<Option<CompleteAction>, AnnotationError> {
    let Some(raw) = annotations.get(ANNOTATION_KEY) else {
        return Ok(None);
    };

    let action: CompleteAction = serde_json::from_str(raw)?;

    if action.version.major > tool_version.major
        || (action.version.major == tool_version.major && action.version.minor > tool_version.minor)
    {
        return Err(AnnotationError::VersionTooNew {
            annotation: action.version,
            tool: tool_version.clone(),
        });
    }

    Ok(Some(action))
}

pub fn write(annotations: &mut BTreeMap<String, String>, action: &CompleteAction) {
    let raw = serde_json::to_string(action).expect("CompleteAction always serializes");
    annotations.insert(ANNOTATION_KEY.to_owned(), raw);
}

pub fn clear(annotations: &mut BTreeMap<String, String>) {
    annotations.remove(ANNOTATION_KEY);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(version: &str) -> CompleteAction {
        CompleteAction {
            version: version.parse().unwrap(),
            referenced_service: "my-svc".to_owned(),
            referenced_service_port: Some(80),
            referenced_service_port_name: None,
            hide_container_port: Some(HideContainerPort {
                container: "web".to_owned(),
                original_name: "http".to_owned(),
                hidden_name: "tx-http".to_owned(),
            }),
            make_port_symbolic: None,
            add_symbolic_port: None,
            add_traffic_agent: Some(AddSidecarContainer {
                container_name: "drift-agent".to_owned(),
                image: "docker.io/drift/agent:1.0".to_owned(),
                takes_over_port: "tx-http".to_owned(),
                app_container: "web".to_owned(),
                volume_name: "drift-agent".to_owned(),
            }),
            add_init_container: None,
            add_tp_env: None,
        }
    }

    #[test]
    fn round_trips_through_json() {
        let action = sample("1.2.3");
        let mut annotations = BTreeMap::new();
        write(&mut annotations, &action);

        let tool_version: semver::Version = "1.2.3".parse().unwrap();
        let read_back = read(&annotations, &tool_version).unwrap().unwrap();
        assert_eq!(read_back, action);
    }

    #[test]
    fn rejects_a_newer_minor_version() {
        let action = sample("1.3.0");
        let mut annotations = BTreeMap::new();
        write(&mut annotations, &action);

        let tool_version: semver::Version = "1.2.9".parse().unwrap();
        let err = read(&annotations, &tool_version).unwrap_err();
        assert!(matches!(err, AnnotationError::VersionTooNew { .. }));
    }

    #[test]
    fn patch_version_is_ignored_by_the_gate() {
        let action = sample("1.2.99");
        let mut annotations = BTreeMap::new();
        write(&mut annotations, &action);

        let tool_version: semver::Version = "1.2.0".parse().unwrap();
        assert!(read(&annotations, &tool_version).unwrap().is_some());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            ANNOTATION_KEY.to_owned(),
            r#"{"version":"1.0.0","referencedService":"svc","madeUp":true}"#.to_owned(),
        );
        let tool_version: semver::Version = "1.0.0".parse().unwrap();
        assert!(read(&annotations, &tool_version).is_err());
    }

    #[test]
    fn actions_in_order_is_fixed_and_skips_absent_kinds() {
        let action = sample("1.0.0");
        let ordered = action.actions_in_order();
        assert_eq!(ordered.len(), 2);
        assert!(matches!(ordered[0], PartialAction::HideContainerPort(_)));
        assert!(matches!(ordered[1], PartialAction::AddSidecarContainer(_)));
    }
}
