//! Command-line surface over [`drift_session::Session`]. Each subcommand
//! connects (reusing the cached session token when the manager still
//! recognizes it), performs one operation, and tears back down.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "drift", version, about = "Redirect Kubernetes workload traffic to your workstation")]
pub struct Cli {
    #[command(flatten)]
    pub connect: ConnectArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Namespace the manager is deployed into.
    #[arg(long, global = true, default_value = "ambassador")]
    pub manager_namespace: String,

    /// Name of the manager's Kubernetes Service.
    #[arg(long, global = true, default_value = "drift-manager")]
    pub manager_service: String,

    /// gRPC port the manager Service exposes.
    #[arg(long, global = true, default_value_t = 8081)]
    pub manager_grpc_port: u16,

    /// Namespaces to watch for owned workloads and agent snapshots.
    /// Repeat to map more than one.
    #[arg(long = "namespace", global = true)]
    pub mapped_namespaces: Vec<String>,

    /// Path to the persistent config file. Defaults to the platform config dir.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the kubeconfig context to use; defaults to the ambient kube config.
    #[arg(long, global = true)]
    pub kube_context: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect and stay attached in the foreground until interrupted.
    Connect,

    /// Tear down the cached session, if any.
    Disconnect,

    /// Print session counters and the active session id.
    Status,

    /// Intercept management.
    Intercept {
        #[command(subcommand)]
        action: InterceptCommand,
    },

    /// Read-only views of what the manager is reporting.
    Agent {
        #[command(subcommand)]
        action: AgentCommand,
    },

    /// Emits a shell completion script to stdout.
    Completions { shell: clap_complete::Shell },
}

#[derive(Subcommand, Debug)]
pub enum InterceptCommand {
    /// Creates an intercept and blocks in the foreground until interrupted,
    /// removing it on the way out.
    Add(InterceptAddArgs),

    /// Removes a previously created intercept by name.
    Remove { name: String },

    /// Lists the intercepts this session's manager currently reports.
    List,
}

#[derive(Args, Debug)]
pub struct InterceptAddArgs {
    /// Name this intercept is registered under.
    pub name: String,

    /// Namespace the target workload lives in.
    #[arg(long)]
    pub workload_namespace: String,

    /// Name of the target Deployment/ReplicaSet/StatefulSet.
    #[arg(long)]
    pub workload: String,

    /// Hostname or service name the intercept redirects traffic for.
    #[arg(long)]
    pub target_host: String,

    /// Port on the target the intercept redirects.
    #[arg(long)]
    pub target_port: u16,

    /// Mechanism the agent should use to split traffic (e.g. "tcp", "http").
    #[arg(long, default_value = "tcp")]
    pub mechanism: String,

    /// Extra arguments passed through to the chosen mechanism.
    #[arg(long = "mechanism-arg")]
    pub mechanism_args: Vec<String>,

    /// Local ports the agent should forward matched traffic to.
    #[arg(long = "local-port", required = true)]
    pub local_ports: Vec<u16>,

    /// Local filesystem path to mount the agent's remote filesystem at.
    #[arg(long)]
    pub mount_point: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum AgentCommand {
    /// Lists the agents currently reporting into this session's manager.
    List,
}
