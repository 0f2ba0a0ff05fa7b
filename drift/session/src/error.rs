//! The named exit/error categories surfaced to the CLI (spec §6, §7).

use drift_kube::KubeApiError;

/// Every error the session's public operations can return. Each variant
/// corresponds to one of the categories spec §6 names explicitly; the
/// CLI matches on these to pick an exit code and a user-facing message.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    /// Two ACTIVE intercepts claim different namespaces at once (spec §4.6
    /// step 6).
    #[error("namespace ambiguity: intercepts are active in both \"{first}\" and \"{second}\"")]
    NamespaceAmbiguity { first: String, second: String },

    /// No workload/service combination could be found to back an intercept.
    #[error("no acceptable workload found: {0}")]
    NoAcceptableWorkload(String),

    /// The caller asked to create something that already exists under that
    /// name.
    #[error("\"{0}\" already exists")]
    AlreadyExists(String),

    /// Another intercept already claims this target host+port (spec §3
    /// invariant).
    #[error("local target {0} is already in use by another intercept")]
    LocalTargetInUse(String),

    /// Another intercept already claims this client mount point (spec §3
    /// invariant).
    #[error("mount point {0} is already in use by another intercept")]
    MountPointBusy(String),

    /// The manager rejected a request or returned an RPC-level failure.
    #[error("traffic manager error: {0}")]
    TrafficManagerError(String),

    /// Connect, or a rollout/dial, failed to establish within its timeout.
    #[error("failed to establish: {0}")]
    FailedToEstablish(String),

    /// A workload could not be fitted to an agent (bad port, unreadable
    /// object, forward-incompatible annotation).
    #[error("misconfigured workload: {0}")]
    MisconfiguredWorkload(String),

    /// A mechanism arg or flag the selected agent image does not understand.
    #[error("unknown flag: {0}")]
    UnknownFlag(String),

    /// The manager no longer recognizes this session, or a named intercept
    /// no longer exists.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("kubernetes API error: {0}")]
    Kube(#[from] KubeApiError),

    #[error(transparent)]
    Protocol(#[from] drift_protocol::ProtocolError),

    #[error("registering a key that is already registered: {0}")]
    WaiterAlreadyRegistered(String),

    #[error("operation timed out: {0}")]
    Timeout(String),
}

impl SessionError {
    /// True for the fatal-to-session failures spec §7 kind 4 names: the
    /// orchestrator returns these as a sentinel so the outer supervisor
    /// tears the session down and reconnects, instead of retrying in place.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<tonic::Status> for SessionError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::NotFound => Self::NotFound(status.message().to_owned()),
            _ => Self::TrafficManagerError(status.message().to_owned()),
        }
    }
}
