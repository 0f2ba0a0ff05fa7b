//! The root daemon (spec §6, GLOSSARY): a privileged workstation process
//! that programs DNS and routes cluster CIDRs. It is an external
//! collaborator — out of scope per spec §1 — so this module only models
//! the narrow interface the session consumes from it.

use ipnet::IpNet;

/// Parameters handed to the root daemon on connect (spec §4.9 step 6, §6
/// "Connect(outbound-info)").
#[derive(Debug, Clone)]
pub struct OutboundInfo {
    pub session_id: String,
    /// Includes the Kubernetes API server's own address, so the control
    /// channel is never recursed through the proxy (spec §6).
    pub never_proxy: Vec<IpNet>,
    pub also_proxy: Vec<IpNet>,
    pub dns_config: DnsConfig,
    pub kube_flags: Vec<String>,
    pub home_dir: Option<std::path::PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct DnsConfig {
    pub search_paths: Vec<String>,
    pub namespaces: Vec<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum RootDaemonError {
    #[error("root daemon RPC failed: {0}")]
    Rpc(String),

    #[error("root daemon reported an incompatible session")]
    IncompatibleSession,
}

/// The interface the session orchestrator consumes from the root daemon
/// (spec §6). A real implementation dials the daemon's local control socket
/// and speaks its own protocol; that wire format is out of scope here (spec
/// §1 Non-goals: "the low-level VPN/TUN or DNS resolver").
#[async_trait::async_trait]
pub trait RootDaemonClient: Send + Sync {
    async fn connect(&self, info: OutboundInfo) -> Result<(), RootDaemonError>;

    /// Sent whenever the intercepted namespace changes (spec §4.6 step 6,
    /// §6 "SetDnsSearchPath").
    async fn set_dns_search_path(&self, paths: Vec<String>, namespaces: Vec<String>) -> Result<(), RootDaemonError>;

    async fn disconnect(&self) -> Result<(), RootDaemonError>;
}

/// Used when the session runs with the root daemon disabled (spec §4.9
/// step 6: "Connect to the root daemon (if enabled)") — e.g. under test, or
/// when the user opted out of DNS/route programming.
pub struct DisabledRootDaemon;

#[async_trait::async_trait]
impl RootDaemonClient for DisabledRootDaemon {
    async fn connect(&self, _info: OutboundInfo) -> Result<(), RootDaemonError> {
        Ok(())
    }

    async fn set_dns_search_path(&self, _paths: Vec<String>, _namespaces: Vec<String>) -> Result<(), RootDaemonError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RootDaemonError> {
        Ok(())
    }
}
