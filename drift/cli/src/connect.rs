//! Builds a [`drift_session::ConnectParams`] from CLI flags and the ambient
//! kube config, and runs the session's Connect sequence (spec §4.9).

use std::sync::Arc;

use drift_session::{ConnectParams, RootDaemonClient, Session};
use ipnet::IpNet;
use kube::config::{KubeConfigOptions, Kubeconfig};

use crate::{cli::ConnectArgs, error::CliError, install_id};

pub async fn connect(args: &ConnectArgs) -> Result<Arc<Session>, CliError> {
    let kube_config = match &args.kube_context {
        Some(context) => {
            let kubeconfig = Kubeconfig::read().map_err(|e| CliError::Kube(e.to_string()))?;
            kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &KubeConfigOptions {
                    context: Some(context.clone()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| CliError::Kube(e.to_string()))?
        }
        None => kube::Config::infer().await.map_err(|e| CliError::Kube(e.to_string()))?,
    };

    let cluster_host = kube_config.cluster_url.to_string();
    let api_server_addrs = resolve_api_server(&kube_config.cluster_url).await;

    let client = kube::Client::try_from(kube_config).map_err(|e| CliError::Kube(e.to_string()))?;

    let mut config = match &args.config {
        Some(path) => drift_config::Config::load(path)?,
        None => drift_config::Config::load_default()?,
    };
    for namespace in &args.mapped_namespaces {
        if !config.mapped_namespaces.contains(namespace) {
            config.mapped_namespaces.push(namespace.clone());
        }
    }

    let token_cache = drift_session::TokenCache::at(
        drift_session::TokenCache::default_path().ok_or_else(|| CliError::Kube("no resolvable home directory".to_owned()))?,
    );

    let root_daemon: Arc<dyn RootDaemonClient> = Arc::new(drift_session::DisabledRootDaemon);

    let user_at_host = format!(
        "{}@{}",
        whoami::username(),
        whoami::fallible::hostname().unwrap_or_else(|_| "unknown-host".to_owned())
    );

    let params = ConnectParams {
        client,
        manager_namespace: args.manager_namespace.clone(),
        manager_service_name: args.manager_service.clone(),
        manager_grpc_port: args.manager_grpc_port,
        cluster_host,
        user_at_host,
        install_id: install_id::load_or_create(),
        client_version: env!("CARGO_PKG_VERSION").to_owned(),
        config,
        root_daemon,
        token_cache,
        api_server_addrs,
        tool_version: env!("CARGO_PKG_VERSION")
            .parse()
            .expect("crate version is always valid semver"),
    };

    Session::connect(params).await.map_err(CliError::Session)
}

async fn resolve_api_server(cluster_url: &http::Uri) -> Vec<IpNet> {
    let Some(host) = cluster_url.host() else {
        return Vec::new();
    };
    let port = cluster_url.port_u16().unwrap_or(443);

    match tokio::net::lookup_host((host, port)).await {
        Ok(addrs) => addrs
            .filter_map(|addr| {
                let ip = addr.ip();
                let prefix = if ip.is_ipv4() { 32 } else { 128 };
                IpNet::new(ip, prefix).ok()
            })
            .collect(),
        Err(error) => {
            tracing::warn!(%host, %error, "failed to resolve API server address, never-proxy list will not include it");
            Vec::new()
        }
    }
}
