use crate::pb;

/// Lifecycle state of an intercept at the manager (spec §GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    Waiting,
    Active,
    NoAgent,
    NoMechanism,
    AgentError,
    Removed,
    /// Client-local only (spec §4.6 step 6): the manager never reports this
    /// disposition itself. The reconciler overwrites an otherwise-ACTIVE
    /// intercept's disposition with this one when a second, differently
    /// namespaced intercept is active at the same time, rather than
    /// silently picking one namespace over the other.
    NamespaceAmbiguity,
}

impl Disposition {
    pub fn is_terminal_error(self) -> bool {
        matches!(
            self,
            Self::NoAgent | Self::NoMechanism | Self::AgentError | Self::NamespaceAmbiguity
        )
    }
}

impl From<pb::Disposition> for Disposition {
    fn from(value: pb::Disposition) -> Self {
        match value {
            pb::Disposition::Waiting => Self::Waiting,
            pb::Disposition::Active => Self::Active,
            pb::Disposition::NoAgent => Self::NoAgent,
            pb::Disposition::NoMechanism => Self::NoMechanism,
            pb::Disposition::AgentError => Self::AgentError,
            pb::Disposition::Removed => Self::Removed,
        }
    }
}

impl From<Disposition> for pb::Disposition {
    fn from(value: Disposition) -> Self {
        match value {
            Disposition::Waiting => Self::Waiting,
            Disposition::Active => Self::Active,
            Disposition::NoAgent => Self::NoAgent,
            Disposition::NoMechanism => Self::NoMechanism,
            Disposition::AgentError => Self::AgentError,
            Disposition::Removed => Self::Removed,
            // Never actually sent to the manager — this disposition is
            // assigned locally by the reconciler and only ever travels
            // back out through `InterceptRecord`/the CLI.
            Disposition::NamespaceAmbiguity => Self::AgentError,
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Waiting => "WAITING",
            Self::Active => "ACTIVE",
            Self::NoAgent => "NO_AGENT",
            Self::NoMechanism => "NO_MECHANISM",
            Self::AgentError => "AGENT_ERROR",
            Self::Removed => "REMOVED",
            Self::NamespaceAmbiguity => "NAMESPACE_AMBIGUITY",
        };
        f.write_str(s)
    }
}
