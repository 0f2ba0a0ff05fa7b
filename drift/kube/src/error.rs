use std::fmt;

/// Errors raised while reasoning about or mutating Kubernetes objects.
///
/// Mirrors the shape of the corresponding error type the installer and
/// watchers in this crate rely on throughout: most call sites want to
/// report *which* object was at fault, not just that a field was missing.
#[derive(thiserror::Error, Debug)]
pub enum KubeApiError {
    #[error("{kind} {namespace}/{name}: missing field {field}")]
    MissingField {
        kind: &'static str,
        namespace: String,
        name: String,
        field: &'static str,
    },

    #[error("{kind} {namespace}/{name}: invalid state: {message}")]
    InvalidState {
        kind: &'static str,
        namespace: String,
        name: String,
        message: String,
    },

    #[error("kube API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("annotation error: {0}")]
    Annotation(#[from] crate::action::AnnotationError),

    #[error("no acceptable workload found for {0}")]
    NoAcceptableWorkload(String),

    #[error("no service exposes port {0} for workload {1}")]
    NoMatchingService(String, String),

    #[error("rollout of {kind} {namespace}/{name} did not converge within the configured timeout")]
    RolloutTimedOut {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("workload {namespace}/{name} is misconfigured: {message}")]
    MisconfiguredWorkload {
        namespace: String,
        name: String,
        message: String,
    },
}

pub type Result<T, E = KubeApiError> = std::result::Result<T, E>;

/// Anything with `.metadata.namespace`/`.metadata.name` and a known kind
/// name, used so [`KubeApiError::missing_field`]/[`KubeApiError::invalid_state`]
/// can be called the same way `rollout.rs`'s `KubeApiError::missing_field(self,
/// ...)` is in the teacher, without every caller re-typing the object's
/// namespace/name/kind by hand.
pub trait ObjectRef {
    fn kind_str(&self) -> &'static str;
    fn namespace_str(&self) -> &str;
    fn name_str(&self) -> &str;
}

impl KubeApiError {
    pub fn missing_field(obj: &impl ObjectRef, field: &'static str) -> Self {
        Self::MissingField {
            kind: obj.kind_str(),
            namespace: obj.namespace_str().to_owned(),
            name: obj.name_str().to_owned(),
            field,
        }
    }

    pub fn invalid_state(obj: &impl ObjectRef, message: impl fmt::Display) -> Self {
        Self::InvalidState {
            kind: obj.kind_str(),
            namespace: obj.namespace_str().to_owned(),
            name: obj.name_str().to_owned(),
            message: message.to_string(),
        }
    }
}
