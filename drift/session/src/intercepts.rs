//! Intercept-side halves of the Data Model (spec §3 "Intercept") and the
//! Rendezvous Registry (spec §4.3) keyed by intercept name, plus the
//! streaming consumer that keeps them current (spec §4.6 step 1).
//!
//! The intercepts map, the intercept-waiters, and the intercepted-namespace
//! field are guarded by one lock (spec §5: "a mutex protects the intercepts
//! map, the waiter registries, and the intercepted-namespace field (all
//! three together because the reconciler mutates them in one step)") —
//! unlike [`crate::agents::AgentsState`], this state does not reuse the
//! generic [`crate::waiter::WaiterRegistry`], since that type owns its own
//! lock and nesting it here would violate "no task holds two of these locks
//! at once".

use std::{collections::HashMap, sync::Arc, time::Duration};

use drift_protocol::{pb, Disposition, InterceptRecord};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, warn};

use crate::error::SessionError;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(3);

/// Delivered to whoever is waiting on a specific intercept name (spec §4.6
/// step 3).
#[derive(Debug, Clone)]
pub enum InterceptWaitResult {
    Active(InterceptRecord),
    Failed { disposition: Disposition, message: String },
    SessionEnded,
}

struct Core {
    intercepts: HashMap<String, InterceptRecord>,
    waiters: HashMap<String, mpsc::Sender<InterceptWaitResult>>,
    intercepted_namespace: Option<String>,
    /// Names registered as local-only (spec §4.9 "Local-only intercept"):
    /// driven by DNS updates like a normal intercept, but with no agent, no
    /// forward, no mount.
    local_only: HashMap<String, String>,
}

pub struct InterceptsState {
    core: Mutex<Core>,
}

/// One tick of reconciliation input: which ids are newly seen, which
/// disappeared, and the full current snapshot — handed to the reconciler
/// so pod-group bookkeeping can react without re-locking [`InterceptsState`]
/// (spec §4.6 steps 1, 4, 5).
pub struct ReconcileTick {
    pub current: HashMap<String, InterceptRecord>,
    pub new_ids: Vec<String>,
    pub removed_ids: Vec<String>,
    /// Set if this tick made two different namespaces active at once (spec
    /// §4.6 step 6). The offending intercept (the later one, in the
    /// manager's own ordering) already has `NAMESPACE_AMBIGUITY` written
    /// into its disposition in `current` by [`InterceptsState::apply_snapshot`];
    /// this field is only here so the caller can log/act on the pair of
    /// namespaces without re-deriving them.
    pub namespace_ambiguity: Option<(String, String)>,
    /// Set when the single active namespace changed since the last tick,
    /// so the root daemon's DNS search path can be refreshed.
    pub namespace_changed: Option<Option<String>>,
}

impl InterceptsState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            core: Mutex::new(Core {
                intercepts: HashMap::new(),
                waiters: HashMap::new(),
                intercepted_namespace: None,
                local_only: HashMap::new(),
            }),
        })
    }

    pub async fn snapshot(&self) -> HashMap<String, InterceptRecord> {
        self.core.lock().await.intercepts.clone()
    }

    pub async fn get(&self, id: &str) -> Option<InterceptRecord> {
        self.core.lock().await.intercepts.get(id).cloned()
    }

    /// Registers a wait for an intercept named `name` becoming ACTIVE or
    /// erroring (spec §4.3, §4.9 "Register an intercept-waiter under the
    /// spec name"). Buffered to at least 2: a WAITING tick and a later
    /// ACTIVE/error tick can both observe this intercept before the waiter
    /// drains the first (spec §5).
    pub async fn wait_for_intercept(&self, name: &str) -> Result<mpsc::Receiver<InterceptWaitResult>, SessionError> {
        let mut guard = self.core.lock().await;
        if guard.waiters.contains_key(name) {
            return Err(SessionError::WaiterAlreadyRegistered(name.to_owned()));
        }
        let (tx, rx) = mpsc::channel(2);
        guard.waiters.insert(name.to_owned(), tx);
        Ok(rx)
    }

    pub async fn cancel_wait(&self, name: &str) {
        self.core.lock().await.waiters.remove(name);
    }

    pub async fn add_local_only(&self, name: &str, namespace: &str) {
        self.core.lock().await.local_only.insert(name.to_owned(), namespace.to_owned());
    }

    pub async fn remove_local_only(&self, name: &str) {
        self.core.lock().await.local_only.remove(name);
    }

    pub async fn is_local_only(&self, name: &str) -> bool {
        self.core.lock().await.local_only.contains_key(name)
    }

    pub async fn local_only_namespaces(&self) -> Vec<String> {
        self.core.lock().await.local_only.values().cloned().collect()
    }

    pub async fn intercepted_namespace(&self) -> Option<String> {
        self.core.lock().await.intercepted_namespace.clone()
    }

    /// Applies one incoming snapshot (spec §4.6 steps 1, 3, 6): replaces the
    /// map, marks any intercept that is ACTIVE in a second namespace with a
    /// NAMESPACE_AMBIGUITY disposition rather than silently preferring one
    /// namespace, fulfills waiters for every disposition that is not
    /// WAITING, and computes the single active namespace (factoring in
    /// local-only intercepts, which count as always-active).
    pub async fn apply_snapshot(&self, new: Vec<InterceptRecord>) -> ReconcileTick {
        let mut guard = self.core.lock().await;

        // Namespace-ambiguity detection needs the manager's original
        // ordering to decide which namespace is "first" (spec §4.6 step 6);
        // `new_by_id` below loses that order.
        let mut established_namespace: Option<String> = guard.local_only.values().next().cloned();
        let mut ambiguity = None;
        let mut overrides: HashMap<String, (String, String)> = HashMap::new();
        for intercept in &new {
            if intercept.disposition != Disposition::Active {
                continue;
            }
            match &established_namespace {
                None => established_namespace = Some(intercept.workload_namespace.clone()),
                Some(current) if current != &intercept.workload_namespace => {
                    let pair = (current.clone(), intercept.workload_namespace.clone());
                    ambiguity = Some(pair.clone());
                    overrides.insert(intercept.id.clone(), pair);
                }
                Some(_) => {}
            }
        }

        let mut new_by_id: HashMap<String, InterceptRecord> =
            new.into_iter().map(|i| (i.id.clone(), i)).collect();

        for (id, (first, second)) in &overrides {
            if let Some(intercept) = new_by_id.get_mut(id) {
                intercept.disposition = Disposition::NamespaceAmbiguity;
                intercept.error_message = format!(
                    "intercepts are active in both \"{first}\" and \"{second}\""
                );
            }
        }

        let new_ids: Vec<String> = new_by_id
            .keys()
            .filter(|id| !guard.intercepts.contains_key(*id))
            .cloned()
            .collect();
        let removed_ids: Vec<String> = guard
            .intercepts
            .keys()
            .filter(|id| !new_by_id.contains_key(*id))
            .cloned()
            .collect();

        for intercept in new_by_id.values() {
            if intercept.disposition == Disposition::Waiting {
                continue;
            }
            let Some(waiter) = guard.waiters.remove(&intercept.name) else {
                continue;
            };
            let result = if intercept.disposition == Disposition::Active {
                InterceptWaitResult::Active(intercept.clone())
            } else {
                InterceptWaitResult::Failed {
                    disposition: intercept.disposition,
                    message: intercept.error_message.clone(),
                }
            };
            let _ = waiter.send(result).await;
        }

        let namespace = established_namespace;
        let namespace_changed = if namespace != guard.intercepted_namespace {
            Some(namespace.clone())
        } else {
            None
        };
        guard.intercepted_namespace = namespace;
        guard.intercepts = new_by_id.clone();

        ReconcileTick {
            current: new_by_id,
            new_ids,
            removed_ids,
            namespace_ambiguity: ambiguity,
            namespace_changed,
        }
    }

    /// Synthesizes an empty snapshot, as if the manager stream had reported
    /// zero intercepts (spec §5 "Failure isolation": "the reconciler
    /// handles stream EOF by synthesizing an empty snapshot so all pod
    /// groups drain cleanly on disconnect").
    pub async fn apply_empty_snapshot(&self) -> ReconcileTick {
        self.apply_snapshot(Vec::new()).await
    }

    pub async fn end_session(&self) {
        let mut guard = self.core.lock().await;
        let waiters: Vec<_> = guard.waiters.drain().collect();
        drop(guard);
        for (_, waiter) in waiters {
            let _ = waiter.send(InterceptWaitResult::SessionEnded).await;
        }
    }
}

/// Runs the intercept watcher's retry loop until `cancellation` fires,
/// applying every received snapshot to `state` (spec §4.6, analogous
/// structure to [`crate::agents::run`] per spec §4.6's opening line: "a
/// retrying streaming consumer analogous to §4.4").
pub async fn run(
    state: Arc<InterceptsState>,
    mut client: pb::manager_client::ManagerClient<Channel>,
    session: pb::SessionInfo,
    on_tick: impl Fn(ReconcileTick) + Send + Sync + 'static,
    cancellation: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if cancellation.is_cancelled() {
            break;
        }

        let mut stream = match client.watch_intercepts(session.clone()).await {
            Ok(response) => response.into_inner(),
            Err(status) => {
                warn!(%status, "intercept watch stream failed to open, retrying after backoff");
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
                    debug!("intercept watcher cancelled");
                    let tick = state.apply_empty_snapshot().await;
                    on_tick(tick);
                    state.end_session().await;
                    return;
                }
            };

            match next {
                Some(Ok(snapshot)) => {
                    let snapshot: drift_protocol::InterceptSnapshot = snapshot.into();
                    let tick = state.apply_snapshot(snapshot.intercepts().to_vec()).await;
                    on_tick(tick);
                }
                Some(Err(status)) => {
                    warn!(%status, "intercept watch stream error, re-dialing after backoff");
                    break;
                }
                None => {
                    debug!("intercept watch stream closed (EOF), synthesizing empty snapshot");
                    let tick = state.apply_empty_snapshot().await;
                    on_tick(tick);
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

#[cfg(test)]
mod tests {
    use super::*;

    fn active(id: &str, name: &str, namespace: &str, pod_ip: &str) -> InterceptRecord {
        InterceptRecord {
            id: id.to_owned(),
            name: name.to_owned(),
            workload_namespace: namespace.to_owned(),
            workload_name: "app".to_owned(),
            target_host: "localhost".to_owned(),
            target_port: 8080,
            mechanism: "tcp".to_owned(),
            mechanism_args: vec![],
            local_ports: vec![8080],
            mount_point: None,
            pod_ip: Some(pod_ip.to_owned()),
            sftp_port: 0,
            ftp_port: 0,
            disposition: Disposition::Active,
            error_message: String::new(),
            environment: Default::default(),
            client_mount_point: None,
            local_mount_bridge_port: None,
        }
    }

    #[tokio::test]
    async fn waiter_is_fulfilled_exactly_once_on_active() {
        let state = InterceptsState::new();
        let mut rx = state.wait_for_intercept("x").await.unwrap();

        state.apply_snapshot(vec![active("id-1", "x", "ns", "1.2.3.4")]).await;

        match rx.recv().await.unwrap() {
            InterceptWaitResult::Active(record) => assert_eq!(record.id, "id-1"),
            other => panic!("expected Active, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn two_active_namespaces_report_ambiguity() {
        let state = InterceptsState::new();
        let tick = state
            .apply_snapshot(vec![
                active("a", "a", "ns-1", "1.1.1.1"),
                active("b", "b", "ns-2", "2.2.2.2"),
            ])
            .await;
        assert!(tick.namespace_ambiguity.is_some());
    }

    /// Spec §4.6 step 6: the second active intercept must be marked with a
    /// NAMESPACE_AMBIGUITY disposition instead of silently keeping ACTIVE.
    #[tokio::test]
    async fn the_later_intercept_is_marked_namespace_ambiguity_not_silently_active() {
        let state = InterceptsState::new();
        let tick = state
            .apply_snapshot(vec![
                active("a", "a", "ns-1", "1.1.1.1"),
                active("b", "b", "ns-2", "2.2.2.2"),
            ])
            .await;

        assert_eq!(tick.current["a"].disposition, Disposition::Active);
        assert_eq!(tick.current["b"].disposition, Disposition::NamespaceAmbiguity);
        assert!(tick.current["b"].error_message.contains("ns-1"));
        assert!(tick.current["b"].error_message.contains("ns-2"));

        // The snapshot stored for later reads (list_intercepts) reflects the
        // same override, not the manager's original ACTIVE disposition.
        let snapshot = state.snapshot().await;
        assert_eq!(snapshot["b"].disposition, Disposition::NamespaceAmbiguity);
    }

    /// A waiter registered for the offending intercept must receive a
    /// `Failed` result carrying the NAMESPACE_AMBIGUITY disposition, not
    /// `Active`.
    #[tokio::test]
    async fn a_waiter_on_the_offending_intercept_is_fulfilled_with_an_error() {
        let state = InterceptsState::new();
        let mut rx = state.wait_for_intercept("b").await.unwrap();

        state
            .apply_snapshot(vec![
                active("a", "a", "ns-1", "1.1.1.1"),
                active("b", "b", "ns-2", "2.2.2.2"),
            ])
            .await;

        match rx.recv().await.unwrap() {
            InterceptWaitResult::Failed { disposition, message } => {
                assert_eq!(disposition, Disposition::NamespaceAmbiguity);
                assert!(message.contains("ns-1") && message.contains("ns-2"));
            }
            other => panic!("expected Failed(NamespaceAmbiguity), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn new_and_removed_ids_are_tracked_across_ticks() {
        let state = InterceptsState::new();
        let first = state.apply_snapshot(vec![active("a", "a", "ns", "1.1.1.1")]).await;
        assert_eq!(first.new_ids, vec!["a".to_string()]);
        assert!(first.removed_ids.is_empty());

        let second = state.apply_snapshot(vec![]).await;
        assert!(second.new_ids.is_empty());
        assert_eq!(second.removed_ids, vec!["a".to_string()]);
    }
}
