//! Agent Watcher (spec §4.4): a retrying streaming consumer of
//! [`AgentSnapshot`]s that keeps the session's view of agents fresh and
//! wakes anyone waiting for a particular agent to appear.

use std::{sync::Arc, time::Duration};

use drift_protocol::{pb, AgentRecord, AgentSnapshot};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use crate::waiter::WaiterRegistry;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(3);

/// Outcome delivered to an agent-waiter: either the agent showed up, or the
/// stream was torn down (session cancelled) before it did.
#[derive(Debug, Clone)]
pub enum AgentWaitResult {
    Found(AgentRecord),
    SessionEnded,
}

/// Shared state updated by the agent watcher task and read by everything
/// else (spec §5: "the agents map and its init-waiters share a second
/// mutex").
pub struct AgentsState {
    snapshot: RwLock<AgentSnapshot>,
    /// Keyed by `name.namespace` (spec §4.3).
    per_agent_waiters: WaiterRegistry<AgentWaitResult>,
    /// Woken and cleared on every new snapshot, regardless of content —
    /// used by callers waiting for the *first* snapshot to arrive at all.
    init_waiters: Mutex<Vec<tokio::sync::oneshot::Sender<()>>>,
}

impl AgentsState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            snapshot: RwLock::new(AgentSnapshot::default()),
            per_agent_waiters: WaiterRegistry::new(),
            init_waiters: Mutex::new(Vec::new()),
        })
    }

    pub async fn snapshot(&self) -> AgentSnapshot {
        self.snapshot.read().await.clone()
    }

    pub async fn find(&self, name: &str, namespace: &str) -> Option<AgentRecord> {
        self.snapshot.read().await.find(name, namespace).cloned()
    }

    /// Registers a wait for `name.namespace`, per the register-then-check
    /// ordering spec §9 requires. Callers must call [`Self::find`] *after*
    /// this returns to avoid racing a snapshot that already arrived.
    pub async fn wait_for_agent(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<tokio::sync::mpsc::Receiver<AgentWaitResult>, crate::error::SessionError> {
        let key = format!("{name}.{namespace}");
        self.per_agent_waiters.register(&key, 2).await
    }

    /// Blocks until the next snapshot arrives (of any content), used by
    /// callers that just need "a" snapshot rather than a specific agent —
    /// e.g. waiting for the system API to spin up (spec §4.9 step "discover
    /// the system API port").
    pub async fn wait_for_next_snapshot(&self) -> tokio::sync::oneshot::Receiver<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.init_waiters.lock().await.push(tx);
        rx
    }

    async fn replace_snapshot(&self, new: AgentSnapshot) {
        *self.snapshot.write().await = new.clone();

        for tx in self.init_waiters.lock().await.drain(..) {
            let _ = tx.send(());
        }

        for agent in new.agents() {
            let key = agent.key();
            self.per_agent_waiters
                .fulfill(&key, AgentWaitResult::Found(agent.clone()))
                .await;
        }
    }

    async fn end_session(&self) {
        let mut guard = self.init_waiters.lock().await;
        guard.clear();
        drop(guard);
        self.per_agent_waiters.fulfill_all(AgentWaitResult::SessionEnded).await;
    }
}

/// Runs the agent watcher's retry loop until `cancellation` fires (spec
/// §4.4). Prefers the per-namespace variant of the RPC and falls back to
/// the all-namespaces one on UNIMPLEMENTED, matching the manager's
/// evolving contract (spec §6 "WatchAgentsNS ... falls back on
/// UNIMPLEMENTED").
pub async fn run(
    state: Arc<AgentsState>,
    mut client: pb::manager_client::ManagerClient<Channel>,
    session: pb::SessionInfo,
    namespaces: Arc<RwLock<Vec<String>>>,
    cancellation: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;
    let mut use_namespaced = true;

    loop {
        if cancellation.is_cancelled() {
            break;
        }

        let stream_result = if use_namespaced {
            let namespaces = namespaces.read().await.clone();
            client
                .watch_agents_ns(pb::WatchAgentsNsRequest {
                    session: Some(session.clone()),
                    namespaces,
                })
                .await
        } else {
            client.watch_agents(session.clone()).await
        };

        let mut stream = match stream_result {
            Ok(response) => response.into_inner(),
            Err(status) if status.code() == tonic::Code::Unimplemented && use_namespaced => {
                info!("WatchAgentsNS unimplemented by manager, falling back to WatchAgents");
                use_namespaced = false;
                continue;
            }
            Err(status) => {
                if cancellation.is_cancelled() {
                    break;
                }
                warn!(%status, "agent watch stream failed to open, retrying after backoff");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {},
                    _ = cancellation.cancelled() => break,
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        backoff = INITIAL_BACKOFF;

        loop {
            let next = tokio::select! {
                next = futures::StreamExt::next(&mut stream) => next,
                _ = cancellation.cancelled() => {
                    debug!("agent watcher cancelled");
                    state.end_session().await;
                    return;
                }
            };

            match next {
                Some(Ok(snapshot)) => {
                    state.replace_snapshot(snapshot.into()).await;
                }
                Some(Err(status)) => {
                    warn!(%status, "agent watch stream error, re-dialing after backoff");
                    break;
                }
                None => {
                    debug!("agent watch stream closed (EOF)");
                    break;
                }
            }
        }

        if cancellation.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {},
            _ = cancellation.cancelled() => break,
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }

    state.end_session().await;
}
