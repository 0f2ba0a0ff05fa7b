//! The Session Orchestrator (spec §4.9): composes the installer, the
//! watchers, the reconciler, and the manager client into one long-lived
//! object, and exposes the operations the CLI drives (Connect, AddIntercept,
//! RemoveIntercept, ListIntercepts, ListAgents, Disconnect).

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use drift_config::Config;
use drift_kube::{AgentInstaller, AgentSpec, WorkloadKind, WorkloadRef};
use drift_protocol::{pb, AgentRecord, InterceptRecord};
use ipnet::IpNet;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Spec §4.9 "Remain-loop: every 5 s call the manager's keep-alive".
const REMAIN_INTERVAL: Duration = Duration::from_secs(5);

use crate::{
    agents::{self, AgentsState},
    dial_watcher,
    error::SessionError,
    intercepts::{self, InterceptWaitResult, InterceptsState, ReconcileTick},
    manager::{self, ManagerHandle},
    metrics::{Counters, CountersSnapshot},
    reconciler::Reconciler,
    root_daemon::{DnsConfig, OutboundInfo, RootDaemonClient},
    token_cache::TokenCache,
};

/// What the caller wants to create (spec §3 "Intercept" spec fields).
#[derive(Debug, Clone)]
pub struct InterceptSpecInput {
    pub name: String,
    pub workload_namespace: String,
    pub workload_name: String,
    pub target_host: String,
    pub target_port: u16,
    pub mechanism: String,
    pub mechanism_args: Vec<String>,
    pub local_ports: Vec<u16>,
    pub mount_point: Option<String>,
    /// Local-only intercepts drive DNS updates but never reach the manager
    /// or the installer (spec §4.9 "Local-only intercept").
    pub no_agent: bool,
}

/// Everything needed to bring a session up (spec §4.9 Connect steps 1-6).
pub struct ConnectParams {
    pub client: kube::Client,
    pub manager_namespace: String,
    pub manager_service_name: String,
    pub manager_grpc_port: u16,
    pub cluster_host: String,
    pub user_at_host: String,
    pub install_id: String,
    pub client_version: String,
    pub config: Config,
    pub root_daemon: Arc<dyn RootDaemonClient>,
    pub token_cache: TokenCache,
    /// Forced into `never_proxy` regardless of config (spec §6: "the API
    /// server's own address is always appended ... regardless of what's
    /// configured").
    pub api_server_addrs: Vec<IpNet>,
    pub tool_version: semver::Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEndReason {
    Disconnected,
    Expired,
}

pub struct Session {
    client: kube::Client,
    manager: ManagerHandle,
    session_info: pb::SessionInfo,
    config: RwLock<Config>,
    agents: Arc<AgentsState>,
    intercepts: Arc<InterceptsState>,
    reconciler: Arc<Reconciler>,
    watchers: Arc<drift_kube::watcher::NamespaceWatcherSet>,
    installer: AgentInstaller,
    token_cache: TokenCache,
    root_daemon: Arc<dyn RootDaemonClient>,
    counters: Arc<Counters>,
    cancellation: CancellationToken,
    tasks: tokio::sync::Mutex<tokio::task::JoinSet<()>>,
    cluster_host: String,
    mount_point_by_intercept: Arc<DashMap<String, String>>,
    ended_tx: tokio::sync::watch::Sender<Option<SessionEndReason>>,
}

impl Session {
    /// Runs the full Connect sequence (spec §4.9 steps 1-7) and returns a
    /// live session with its task group already running.
    pub async fn connect(params: ConnectParams) -> Result<Arc<Self>, SessionError> {
        manager::verify_manager_service(&params.client, &params.manager_namespace, &params.manager_service_name)
            .await?;

        let channel = manager::connect(
            params.client.clone(),
            params.manager_namespace.clone(),
            params.manager_service_name.clone(),
            params.manager_grpc_port,
            params.config.timeouts.traffic_manager_connect(),
        )
        .await?;

        let mut manager_handle = ManagerHandle::new(channel);

        let cached_id = params.token_cache.load(&params.cluster_host).await.ok().flatten();
        let session_info = match cached_id {
            Some(session_id) => {
                let candidate = pb::SessionInfo {
                    session_id,
                    cluster_host: params.cluster_host.clone(),
                    manager_version: String::new(),
                };
                match manager_handle.remain(candidate.clone(), None).await {
                    Ok(()) => candidate,
                    Err(_) => Self::arrive_fresh(&mut manager_handle, &params).await?,
                }
            }
            None => Self::arrive_fresh(&mut manager_handle, &params).await?,
        };

        let _ = params.token_cache.store(&params.cluster_host, &session_info.session_id).await;

        let mut config = params.config;
        match manager_handle.get_client_config(session_info.clone()).await {
            Ok(patch) => config.merge_remote(patch),
            Err(error) => info!(%error, "manager did not return a remote client config, using local config only"),
        }

        let mut never_proxy = params.api_server_addrs.clone();
        never_proxy.extend(config.never_proxy.clone());
        params
            .root_daemon
            .connect(OutboundInfo {
                session_id: session_info.session_id.clone(),
                never_proxy,
                also_proxy: config.also_proxy.clone(),
                dns_config: DnsConfig::default(),
                kube_flags: Vec::new(),
                home_dir: home::home_dir(),
            })
            .await
            .map_err(|error| SessionError::FailedToEstablish(error.to_string()))?;

        let cancellation = CancellationToken::new();
        let namespaces = Arc::new(RwLock::new(config.mapped_namespaces.clone()));
        let agents = AgentsState::new();
        let intercepts = InterceptsState::new();
        let reconciler = Reconciler::new(manager_handle.raw());
        let watchers = Arc::new(drift_kube::watcher::NamespaceWatcherSet::new(
            params.client.clone(),
            cancellation.clone(),
        ));
        let installer = AgentInstaller::new(params.client.clone(), params.tool_version);
        let counters = Arc::new(Counters::default());
        let mount_point_by_intercept = Arc::new(DashMap::new());
        let (ended_tx, _) = tokio::sync::watch::channel(None);

        let session = Arc::new(Self {
            client: params.client,
            manager: manager_handle.clone(),
            session_info: session_info.clone(),
            config: RwLock::new(config),
            agents: Arc::clone(&agents),
            intercepts: Arc::clone(&intercepts),
            reconciler: Arc::clone(&reconciler),
            watchers,
            installer,
            token_cache: params.token_cache,
            root_daemon: Arc::clone(&params.root_daemon),
            counters: Arc::clone(&counters),
            cancellation: cancellation.clone(),
            tasks: tokio::sync::Mutex::new(tokio::task::JoinSet::new()),
            cluster_host: params.cluster_host,
            mount_point_by_intercept: Arc::clone(&mount_point_by_intercept),
            ended_tx,
        });

        {
            let mut tasks = session.tasks.lock().await;

            tasks.spawn(Self::remain_loop(
                Arc::clone(&session),
                manager_handle.clone(),
                session_info.clone(),
                REMAIN_INTERVAL,
            ));

            tasks.spawn(agents::run(
                Arc::clone(&agents),
                manager_handle.raw(),
                session_info.clone(),
                namespaces,
                cancellation.child_token(),
            ));

            let on_tick = Self::build_on_tick(Arc::clone(&reconciler), Arc::clone(&params.root_daemon), Arc::clone(&mount_point_by_intercept));
            tasks.spawn(intercepts::run(
                Arc::clone(&intercepts),
                manager_handle.raw(),
                session_info.clone(),
                on_tick,
                cancellation.child_token(),
            ));

            let dial_manager = manager_handle.raw();
            let dial_session = session_info.clone();
            let dial_cancellation = cancellation.child_token();
            tasks.spawn(async move {
                if let Err(status) = dial_watcher::run(dial_manager, dial_session, dial_cancellation).await {
                    warn!(%status, "dial watcher exited with an error");
                }
            });
        }

        Ok(session)
    }

    async fn arrive_fresh(manager: &mut ManagerHandle, params: &ConnectParams) -> Result<pb::SessionInfo, SessionError> {
        manager
            .arrive_as_client(
                params.user_at_host.clone(),
                params.install_id.clone(),
                params.client_version.clone(),
            )
            .await
    }

    fn build_on_tick(
        reconciler: Arc<Reconciler>,
        root_daemon: Arc<dyn RootDaemonClient>,
        mount_points: Arc<DashMap<String, String>>,
    ) -> impl Fn(ReconcileTick) + Send + Sync + 'static {
        move |tick: ReconcileTick| {
            let reconciler = Arc::clone(&reconciler);
            let root_daemon = Arc::clone(&root_daemon);
            let mount_points = Arc::clone(&mount_points);

            tokio::spawn(async move {
                reconciler.reconcile(&tick).await;

                for id in &tick.removed_ids {
                    if let Some((_, mount_point)) = mount_points.remove(id) {
                        reconciler.release_mount_point(&mount_point);
                    }
                }

                if let Some(namespace) = tick.namespace_changed.clone() {
                    let namespaces: Vec<String> = namespace.into_iter().collect();
                    if let Err(error) = root_daemon.set_dns_search_path(namespaces.clone(), namespaces).await {
                        warn!(%error, "failed to update root daemon DNS search path");
                    }
                }

                if let Some((first, second)) = &tick.namespace_ambiguity {
                    warn!(
                        %first, %second,
                        "two namespaces are active simultaneously; the later intercept was marked NAMESPACE_AMBIGUITY"
                    );
                }
            });
        }
    }

    /// Every 5 s, calls the manager's keep-alive (spec §4.9 "Remain-loop").
    /// NOT_FOUND is fatal to the session: the sentinel is published on
    /// `ended_tx` and the whole task group is cancelled.
    async fn remain_loop(session: Arc<Session>, mut manager: ManagerHandle, session_info: pb::SessionInfo, interval: Duration) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {},
                _ = session.cancellation.cancelled() => return,
            }

            match manager.remain(session_info.clone(), None).await {
                Ok(()) => {}
                Err(SessionError::NotFound(_)) => {
                    warn!("manager no longer recognizes this session");
                    let _ = session.ended_tx.send(Some(SessionEndReason::Expired));
                    session.cancellation.cancel();
                    return;
                }
                Err(error) => {
                    warn!(%error, "keep-alive failed, will retry");
                    session.counters.record_reconnect();
                }
            }
        }
    }

    /// A channel that resolves once the session ends, for the outer
    /// supervisor to await (spec §7 kind 4: "the session returns a sentinel;
    /// the supervisor tears the session down and forces a reconnect").
    pub fn subscribe_ended(&self) -> tokio::sync::watch::Receiver<Option<SessionEndReason>> {
        self.ended_tx.subscribe()
    }

    pub fn session_id(&self) -> &str {
        &self.session_info.session_id
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    pub fn watchers(&self) -> &Arc<drift_kube::watcher::NamespaceWatcherSet> {
        &self.watchers
    }

    pub fn client(&self) -> &kube::Client {
        &self.client
    }

    pub async fn list_intercepts(&self) -> Vec<InterceptRecord> {
        self.intercepts.snapshot().await.into_values().collect()
    }

    pub async fn list_agents(&self) -> Vec<AgentRecord> {
        self.agents.snapshot().await.agents().to_vec()
    }

    async fn can_intercept(&self, spec: &InterceptSpecInput) -> Result<(), SessionError> {
        {
            let config = self.config.read().await;
            if !config.mapped_namespaces.iter().any(|ns| ns == &spec.workload_namespace) {
                return Err(SessionError::MisconfiguredWorkload(format!(
                    "namespace \"{}\" is not in mapped-namespaces",
                    spec.workload_namespace
                )));
            }
        }

        if self.intercepts.is_local_only(&spec.name).await {
            return Err(SessionError::AlreadyExists(spec.name.clone()));
        }

        let existing = self.intercepts.snapshot().await;
        if existing.values().any(|i| i.name == spec.name) {
            return Err(SessionError::AlreadyExists(spec.name.clone()));
        }
        if existing
            .values()
            .any(|i| i.target_host == spec.target_host && i.target_port == spec.target_port)
        {
            return Err(SessionError::LocalTargetInUse(format!(
                "{}:{}",
                spec.target_host, spec.target_port
            )));
        }

        if let Some(mount_point) = &spec.mount_point {
            self.reconciler.claim_mount_point(mount_point, &spec.name)?;
        }

        Ok(())
    }

    /// Registers `name` as a local-only intercept (spec §4.9): driven by DNS
    /// updates like a real intercept, but never touches the manager or the
    /// installer.
    pub async fn add_local_only_intercept(&self, name: &str, namespace: &str) -> Result<(), SessionError> {
        let config = self.config.read().await;
        if !config.mapped_namespaces.iter().any(|ns| ns == namespace) {
            return Err(SessionError::MisconfiguredWorkload(format!(
                "namespace \"{namespace}\" is not in mapped-namespaces"
            )));
        }
        drop(config);

        if self.intercepts.is_local_only(name).await || self.intercepts.snapshot().await.values().any(|i| i.name == name) {
            return Err(SessionError::AlreadyExists(name.to_owned()));
        }

        self.intercepts.add_local_only(name, namespace).await;
        Ok(())
    }

    pub async fn remove_local_only_intercept(&self, name: &str) {
        self.intercepts.remove_local_only(name).await;
    }

    /// AddIntercept end-to-end (spec §4.9).
    pub async fn add_intercept(&self, spec: InterceptSpecInput) -> Result<InterceptRecord, SessionError> {
        self.can_intercept(&spec).await?;

        let release_mount = |session: &Self| {
            if let Some(mount_point) = &spec.mount_point {
                session.reconciler.release_mount_point(mount_point);
            }
        };

        let pb_spec = pb::InterceptSpec {
            name: spec.name.clone(),
            workload_namespace: spec.workload_namespace.clone(),
            workload_name: spec.workload_name.clone(),
            target_host: spec.target_host.clone(),
            target_port: spec.target_port as u32,
            mechanism: spec.mechanism.clone(),
            mechanism_args: spec.mechanism_args.clone(),
            local_ports: spec.local_ports.iter().map(|p| *p as u32).collect(),
            mount_point: spec.mount_point.clone(),
        };

        let prepared = match self.manager.clone().prepare_intercept(self.session_info.clone(), pb_spec.clone()).await {
            Ok(prepared) => prepared,
            Err(error) => {
                release_mount(self);
                return Err(error);
            }
        };

        if let Err(error) = self.ensure_agent(&spec, &prepared).await {
            release_mount(self);
            return Err(error);
        }

        let mut waiter = match self.intercepts.wait_for_intercept(&spec.name).await {
            Ok(waiter) => waiter,
            Err(error) => {
                release_mount(self);
                return Err(error);
            }
        };

        // Register-then-check (spec §4.3, §9): the intercept may already be
        // reflected in the current snapshot by the time we registered.
        if let Some(existing) = self.intercepts.snapshot().await.values().find(|i| i.name == spec.name).cloned() {
            self.intercepts.cancel_wait(&spec.name).await;
            if existing.disposition == drift_protocol::Disposition::Active {
                if let Some(mount_point) = &spec.mount_point {
                    self.mount_point_by_intercept.insert(existing.id.clone(), mount_point.clone());
                }
                return Ok(existing);
            }
        }

        if let Err(error) = self.manager.clone().create_intercept(self.session_info.clone(), pb_spec).await {
            self.intercepts.cancel_wait(&spec.name).await;
            release_mount(self);
            return Err(error);
        }

        let timeout = self.config.read().await.timeouts.intercept();
        match tokio::time::timeout(timeout, waiter.recv()).await {
            Ok(Some(InterceptWaitResult::Active(record))) => {
                if let Some(mount_point) = &spec.mount_point {
                    self.mount_point_by_intercept.insert(record.id.clone(), mount_point.clone());
                }
                self.verify_dns_best_effort(&record).await;
                Ok(record)
            }
            Ok(Some(InterceptWaitResult::Failed { disposition, message })) => {
                manager::spawn_compensating_remove(
                    self.manager.clone(),
                    self.session_info.clone(),
                    spec.name.clone(),
                    Duration::from_secs(5),
                );
                release_mount(self);
                // Spec §4.6 step 6: two active namespaces surface as their
                // own named category, not a generic manager error.
                let error = if disposition == drift_protocol::Disposition::NamespaceAmbiguity {
                    match parse_namespace_pair(&message) {
                        Some((first, second)) => SessionError::NamespaceAmbiguity { first, second },
                        None => SessionError::TrafficManagerError(format!("{disposition}: {message}")),
                    }
                } else {
                    SessionError::TrafficManagerError(format!("{disposition}: {message}"))
                };
                Err(error)
            }
            Ok(Some(InterceptWaitResult::SessionEnded)) => {
                release_mount(self);
                Err(SessionError::NotFound(self.session_info.session_id.clone()))
            }
            Ok(None) => {
                manager::spawn_compensating_remove(
                    self.manager.clone(),
                    self.session_info.clone(),
                    spec.name.clone(),
                    Duration::from_secs(5),
                );
                release_mount(self);
                Err(SessionError::FailedToEstablish(format!(
                    "intercept \"{}\" waiter closed without a result",
                    spec.name
                )))
            }
            Err(_) => {
                self.intercepts.cancel_wait(&spec.name).await;
                manager::spawn_compensating_remove(
                    self.manager.clone(),
                    self.session_info.clone(),
                    spec.name.clone(),
                    Duration::from_secs(5),
                );
                release_mount(self);
                Err(SessionError::Timeout(format!(
                    "intercept \"{}\" did not become active within {timeout:?}",
                    spec.name
                )))
            }
        }
    }

    async fn ensure_agent(&self, spec: &InterceptSpecInput, prepared: &pb::PrepareInterceptResponse) -> Result<(), SessionError> {
        let kind = match prepared.workload_kind.as_str() {
            "Deployment" => WorkloadKind::Deployment,
            "ReplicaSet" => WorkloadKind::ReplicaSet,
            "StatefulSet" => WorkloadKind::StatefulSet,
            other => {
                return Err(SessionError::MisconfiguredWorkload(format!(
                    "manager reported an unsupported workload kind \"{other}\""
                )))
            }
        };

        let workload_ref = WorkloadRef {
            kind,
            namespace: spec.workload_namespace.clone(),
            name: spec.workload_name.clone(),
        };

        let agent_spec = AgentSpec {
            image: prepared.agent_image.clone(),
            container_name: "drift-agent".to_owned(),
            volume_name: "drift-agent-volume".to_owned(),
            service_port: prepared.service_port as u16,
            app_container: None,
            env_vars: Vec::new(),
            rollout_timeout: self.config.read().await.timeouts.apply(),
        };

        self.installer
            .ensure_agent(&workload_ref, &prepared.service_name, &agent_spec)
            .await?;
        Ok(())
    }

    /// Best-effort DNS verification (spec §4.9: "verify DNS resolves the
    /// intercepted service name (bounded wait, best-effort)"). Never fails
    /// the caller: a negative result is only logged.
    async fn verify_dns_best_effort(&self, record: &InterceptRecord) {
        let host = format!("{}.{}.svc.cluster.local:0", record.workload_name, record.workload_namespace);
        let outcome = tokio::time::timeout(Duration::from_secs(2), tokio::net::lookup_host(host.clone())).await;
        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => warn!(%host, %error, "post-intercept DNS verification failed"),
            Err(_) => warn!(%host, "post-intercept DNS verification timed out"),
        }
    }

    pub async fn remove_intercept(&self, name: &str) -> Result<(), SessionError> {
        if self.intercepts.is_local_only(name).await {
            self.intercepts.remove_local_only(name).await;
            return Ok(());
        }

        self.intercepts.cancel_wait(name).await;
        self.manager
            .clone()
            .remove_intercept(self.session_info.clone(), name.to_owned())
            .await
    }

    /// Disconnect (spec §4.9): cancels every scope, departs the manager, and
    /// clears the cached session token on success.
    pub async fn disconnect(&self) {
        let _ = self.ended_tx.send(Some(SessionEndReason::Disconnected));
        self.cancellation.cancel();

        {
            let mut tasks = self.tasks.lock().await;
            while tasks.join_next().await.is_some() {}
        }

        self.reconciler.drain_all().await;

        match self.manager.clone().depart(self.session_info.clone()).await {
            Ok(()) => {
                let _ = self.token_cache.clear(&self.cluster_host).await;
            }
            Err(error) => warn!(%error, "depart failed, leaving cached session token in place"),
        }

        if let Err(error) = self.root_daemon.disconnect().await {
            warn!(%error, "root daemon disconnect failed");
        }
    }
}

/// Recovers the `(first, second)` namespace pair from the message
/// [`intercepts::InterceptsState::apply_snapshot`] writes for a
/// NAMESPACE_AMBIGUITY disposition. `None` only if that format ever changes
/// out from under this function, in which case the caller falls back to a
/// generic manager error rather than losing the failure entirely.
fn parse_namespace_pair(message: &str) -> Option<(String, String)> {
    let mut quoted = message.split('"').skip(1).step_by(2);
    let first = quoted.next()?.to_owned();
    let second = quoted.next()?.to_owned();
    Some((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_namespace_pair_out_of_the_generated_message() {
        let message = "intercepts are active in both \"ns-1\" and \"ns-2\"";
        assert_eq!(
            parse_namespace_pair(message),
            Some(("ns-1".to_owned(), "ns-2".to_owned()))
        );
    }

    #[test]
    fn returns_none_for_an_unrelated_message() {
        assert_eq!(parse_namespace_pair("something else entirely"), None);
    }
}

