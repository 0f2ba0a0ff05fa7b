//! Kubernetes object model, the reversible Action Library, the agent
//! installer, and namespace watchers (spec §3, §4).

pub mod action;
pub mod error;
pub mod installer;
pub mod watcher;
pub mod workload;

pub use error::{KubeApiError, Result};
pub use installer::{AgentInstaller, AgentSpec, EnsureOutcome};
pub use workload::{Workload, WorkloadKind, WorkloadRef};
