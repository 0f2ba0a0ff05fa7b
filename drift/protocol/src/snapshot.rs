use std::collections::HashMap;

use crate::{pb, Disposition};

/// {name, namespace, environment, data ports} — spec §3 "Agent record".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    pub name: String,
    pub namespace: String,
    pub environment: HashMap<String, String>,
    pub sftp_port: u16,
    pub ftp_port: u16,
}

impl AgentRecord {
    pub fn key(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }
}

impl From<pb::AgentData> for AgentRecord {
    fn from(value: pb::AgentData) -> Self {
        Self {
            name: value.name,
            namespace: value.namespace,
            environment: value.environment,
            sftp_port: value.sftp_port as u16,
            ftp_port: value.ftp_port as u16,
        }
    }
}

/// A manager agent snapshot, deduplicated per (name, namespace) as required
/// by spec §3: pod replicas of the same agent yield a single logical entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentSnapshot {
    agents: Vec<AgentRecord>,
}

impl AgentSnapshot {
    pub fn agents(&self) -> &[AgentRecord] {
        &self.agents
    }

    pub fn find(&self, name: &str, namespace: &str) -> Option<&AgentRecord> {
        self.agents
            .iter()
            .find(|a| a.name == name && a.namespace == namespace)
    }
}

impl From<pb::AgentSnapshot> for AgentSnapshot {
    fn from(value: pb::AgentSnapshot) -> Self {
        let mut seen = std::collections::HashSet::new();
        let agents = value
            .agents
            .into_iter()
            .map(AgentRecord::from)
            .filter(|agent| seen.insert(agent.key()))
            .collect();
        Self { agents }
    }
}

/// Spec §3 "Intercept" attributes that are carried over the wire. Session-
/// local attributes (per-intercept cancellation, mount bridge handler pid)
/// live alongside this in `drift-session`, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptRecord {
    pub id: String,
    pub name: String,
    pub workload_namespace: String,
    pub workload_name: String,
    pub target_host: String,
    pub target_port: u16,
    pub mechanism: String,
    pub mechanism_args: Vec<String>,
    pub local_ports: Vec<u16>,
    pub mount_point: Option<String>,
    pub pod_ip: Option<String>,
    pub sftp_port: u16,
    pub ftp_port: u16,
    pub disposition: Disposition,
    pub error_message: String,
    pub environment: HashMap<String, String>,
    pub client_mount_point: Option<String>,
    pub local_mount_bridge_port: Option<u16>,
}

impl From<pb::InterceptInfo> for InterceptRecord {
    fn from(value: pb::InterceptInfo) -> Self {
        let spec = value.spec.unwrap_or_default();
        Self {
            id: value.id,
            name: spec.name,
            workload_namespace: spec.workload_namespace,
            workload_name: spec.workload_name,
            target_host: spec.target_host,
            target_port: spec.target_port as u16,
            mechanism: spec.mechanism,
            mechanism_args: spec.mechanism_args,
            local_ports: spec.local_ports.into_iter().map(|p| p as u16).collect(),
            mount_point: spec.mount_point,
            pod_ip: value.pod_ip,
            sftp_port: value.sftp_port as u16,
            ftp_port: value.ftp_port as u16,
            disposition: pb::Disposition::try_from(value.disposition)
                .unwrap_or(pb::Disposition::AgentError)
                .into(),
            error_message: value.error_message,
            environment: value.environment,
            client_mount_point: value.client_mount_point,
            local_mount_bridge_port: value.local_mount_bridge_port.map(|p| p as u16),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterceptSnapshot {
    intercepts: Vec<InterceptRecord>,
}

impl InterceptSnapshot {
    pub fn intercepts(&self) -> &[InterceptRecord] {
        &self.intercepts
    }

    pub fn into_by_id(self) -> HashMap<String, InterceptRecord> {
        self.intercepts
            .into_iter()
            .map(|i| (i.id.clone(), i))
            .collect()
    }
}

impl From<pb::InterceptSnapshot> for InterceptSnapshot {
    fn from(value: pb::InterceptSnapshot) -> Self {
        Self {
            intercepts: value.intercepts.into_iter().map(Into::into).collect(),
        }
    }
}
