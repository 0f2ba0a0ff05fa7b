//! Dialing and talking to the cluster-side manager (spec §4.9 steps 1-4,
//! §6). The manager is reached the same way `kubectl port-forward` reaches
//! a pod: through the Kubernetes API server, with a fresh port-forward
//! opened per HTTP/2 connection attempt.

use std::time::Duration;

use drift_protocol::pb;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{api::ListParams, Api, Client};
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, warn};

use crate::error::SessionError;

/// Verifies the manager's backing service exists in `namespace` (spec §4.9
/// step 1: "Verify the cluster-side service `traffic-manager` exists").
pub async fn verify_manager_service(client: &Client, namespace: &str, service_name: &str) -> Result<(), SessionError> {
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    api.get(service_name).await.map_err(|error| {
        SessionError::FailedToEstablish(format!(
            "service {namespace}/{service_name} not found: {error}"
        ))
    })?;
    Ok(())
}

/// Builds a `tonic` channel to the manager, dialing through a fresh
/// Kubernetes pod port-forward for every HTTP/2 connection attempt (spec
/// §4.9 step 2: "Build a port-forward dialer against the Kubernetes API").
pub async fn connect(
    client: Client,
    namespace: String,
    service_name: String,
    grpc_port: u16,
    timeout: Duration,
) -> Result<Channel, SessionError> {
    let namespace_for_connector = namespace.clone();
    let service_name_for_connector = service_name.clone();
    let client_for_connector = client.clone();

    let connector = service_fn(move |_uri: Uri| {
        let client = client_for_connector.clone();
        let namespace = namespace_for_connector.clone();
        let service_name = service_name_for_connector.clone();

        async move {
            let stream = dial_via_portforward(&client, &namespace, &service_name, grpc_port).await?;
            Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(stream))
        }
    });

    let endpoint = Endpoint::from_static("http://drift-manager.local").timeout(timeout);

    tokio::time::timeout(timeout, endpoint.connect_with_connector(connector))
        .await
        .map_err(|_| SessionError::FailedToEstablish("timed out dialing the traffic manager".to_owned()))?
        .map_err(|error| SessionError::FailedToEstablish(format!("failed to dial the traffic manager: {error}")))
}

async fn dial_via_portforward(
    client: &Client,
    namespace: &str,
    service_name: &str,
    grpc_port: u16,
) -> Result<impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin, std::io::Error> {
    let service_api: Api<Service> = Api::namespaced(client.clone(), namespace);
    let service = service_api
        .get(service_name)
        .await
        .map_err(|error| std::io::Error::other(error.to_string()))?;

    let selector = service
        .spec
        .as_ref()
        .and_then(|s| s.selector.as_ref())
        .ok_or_else(|| std::io::Error::other("manager service has no selector"))?;

    let label_selector = selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");

    let pod_api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pods = pod_api
        .list(&ListParams::default().labels(&label_selector))
        .await
        .map_err(|error| std::io::Error::other(error.to_string()))?;

    let pod_name = pods
        .items
        .into_iter()
        .find(|p| p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running"))
        .and_then(|p| p.metadata.name)
        .ok_or_else(|| std::io::Error::other("no running manager pod found"))?;

    debug!(pod = %pod_name, "port-forwarding to manager pod");

    let mut forwarder = pod_api
        .portforward(&pod_name, &[grpc_port])
        .await
        .map_err(|error| std::io::Error::other(error.to_string()))?;

    forwarder
        .take_stream(grpc_port)
        .ok_or_else(|| std::io::Error::other("port-forward did not yield a stream"))
}

/// The manager RPC surface the rest of the session drives (spec §6).
#[derive(Clone)]
pub struct ManagerHandle {
    client: pb::manager_client::ManagerClient<Channel>,
}

impl ManagerHandle {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: pb::manager_client::ManagerClient::new(channel),
        }
    }

    pub fn raw(&self) -> pb::manager_client::ManagerClient<Channel> {
        self.client.clone()
    }

    pub async fn arrive_as_client(
        &mut self,
        user_at_host: String,
        install_id: String,
        version: String,
    ) -> Result<pb::SessionInfo, SessionError> {
        let response = self
            .client
            .arrive_as_client(pb::ClientInfo {
                user_at_host,
                install_id,
                product: drift_config::PRODUCT.to_owned(),
                version,
            })
            .await?;
        Ok(response.into_inner())
    }

    /// Spec §4.9 step 4: try the cached session first; if the manager still
    /// recognizes it, reuse it instead of arriving fresh.
    pub async fn remain(&mut self, session: pb::SessionInfo, api_key: Option<String>) -> Result<(), SessionError> {
        self.client
            .remain(pb::RemainRequest {
                session: Some(session),
                api_key,
            })
            .await?;
        Ok(())
    }

    pub async fn depart(&mut self, session: pb::SessionInfo) -> Result<(), SessionError> {
        self.client.depart(session).await?;
        Ok(())
    }

    pub async fn get_client_config(
        &mut self,
        session: pb::SessionInfo,
    ) -> Result<drift_config::RemoteConfigPatch, SessionError> {
        let response = self.client.get_client_config(session).await?.into_inner();
        if response.json_patch.is_empty() {
            return Ok(drift_config::RemoteConfigPatch::default());
        }
        serde_json::from_str(&response.json_patch)
            .map_err(|error| SessionError::TrafficManagerError(format!("invalid remote config patch: {error}")))
    }

    pub async fn prepare_intercept(
        &mut self,
        session: pb::SessionInfo,
        spec: pb::InterceptSpec,
    ) -> Result<pb::PrepareInterceptResponse, SessionError> {
        let response = self
            .client
            .prepare_intercept(pb::PrepareInterceptRequest {
                session: Some(session),
                spec: Some(spec),
            })
            .await?
            .into_inner();
        if let Some(error) = response.error.clone().filter(|e| !e.is_empty()) {
            return Err(SessionError::TrafficManagerError(error));
        }
        Ok(response)
    }

    pub async fn create_intercept(
        &mut self,
        session: pb::SessionInfo,
        spec: pb::InterceptSpec,
    ) -> Result<drift_protocol::InterceptRecord, SessionError> {
        let response = self
            .client
            .create_intercept(pb::CreateInterceptRequest {
                session: Some(session),
                spec: Some(spec),
            })
            .await?
            .into_inner();
        Ok(response.into())
    }

    pub async fn remove_intercept(&mut self, session: pb::SessionInfo, name: String) -> Result<(), SessionError> {
        self.client
            .remove_intercept(pb::RemoveInterceptRequest {
                session: Some(session),
                name,
            })
            .await?;
        Ok(())
    }
}

/// A detached-context, bounded-time compensating removal — spec §7 kind 3:
/// "a bounded-time compensating RemoveIntercept runs under a detached
/// context so a cancelled parent does not leak cluster state". Spawned
/// rather than awaited inline so a cancelled caller doesn't abort it.
pub fn spawn_compensating_remove(mut manager: ManagerHandle, session: pb::SessionInfo, name: String, timeout: Duration) {
    tokio::spawn(async move {
        let result = tokio::time::timeout(timeout, manager.remove_intercept(session, name.clone())).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(intercept = %name, %error, "compensating RemoveIntercept failed"),
            Err(_) => warn!(intercept = %name, "compensating RemoveIntercept timed out"),
        }
    });
}
