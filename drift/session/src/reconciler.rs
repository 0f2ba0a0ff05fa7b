//! Intercept Reconciliation (spec §4.6): turns intercept snapshots into a
//! live set of per-pod forward/mount groups, keyed by (intercept id, pod
//! IP), and serializes mount-point reuse across groups.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
};

use dashmap::DashMap;
use drift_protocol::{pb, Disposition, InterceptRecord};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{info, warn};

use crate::{error::SessionError, forwarder, intercepts::ReconcileTick, mount};

pub type PodGroupKey = (String, String);

struct PodGroup {
    cancellation: CancellationToken,
    tasks: tokio::task::JoinSet<()>,
}

/// Owns the live pod-level groups and the per-mount-point locks that
/// serialize unmount-then-mount across reconciliation ticks (spec §3, §5:
/// "a per-mount-point mutex in the session serializes this").
pub struct Reconciler {
    client: pb::manager_client::ManagerClient<Channel>,
    groups: AsyncMutex<HashMap<PodGroupKey, PodGroup>>,
    /// mount point -> the single async lock serializing mount/unmount for
    /// that point (spec §5: "the mount-point mutexes map is also
    /// concurrent").
    mount_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    /// mount point -> the intercept id currently holding it (spec §3
    /// invariant: "at most one mount process alive for that mount point at
    /// any time"; spec §5: "the mount-point map is a lock-free concurrent
    /// map").
    mount_owners: DashMap<String, String>,
    next_local_port: std::sync::atomic::AtomicU16,
}

impl Reconciler {
    pub fn new(client: pb::manager_client::ManagerClient<Channel>) -> Arc<Self> {
        Arc::new(Self {
            client,
            groups: AsyncMutex::new(HashMap::new()),
            mount_locks: DashMap::new(),
            mount_owners: DashMap::new(),
            next_local_port: std::sync::atomic::AtomicU16::new(15000),
        })
    }

    /// Claims `mount_point` for `intercept_name`, failing with
    /// MOUNT_POINT_BUSY if another intercept already holds it (spec §3
    /// invariant, §8 "Mount-point uniqueness").
    pub fn claim_mount_point(&self, mount_point: &str, intercept_name: &str) -> Result<(), SessionError> {
        match self.mount_owners.entry(mount_point.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(existing) if existing.get() != intercept_name => {
                Err(SessionError::MountPointBusy(mount_point.to_owned()))
            }
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(()),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(intercept_name.to_owned());
                Ok(())
            }
        }
    }

    pub fn release_mount_point(&self, mount_point: &str) {
        self.mount_owners.remove(mount_point);
    }

    /// Applies one reconciliation tick (spec §4.6 steps 4, 5): starts
    /// pod-level groups for newly-active (id, podIp) pairs, and cancels +
    /// awaits groups whose key no longer appears in the snapshot. Step 1-3
    /// (replace map, skip WAITING, fulfill waiters) already happened in
    /// [`crate::intercepts::InterceptsState::apply_snapshot`]; this just
    /// reacts to the result.
    pub async fn reconcile(self: &Arc<Self>, tick: &ReconcileTick) {
        let active_keys: std::collections::HashSet<PodGroupKey> = tick
            .current
            .values()
            .filter(|i| i.disposition == Disposition::Active)
            .filter_map(|i| i.pod_ip.clone().map(|ip| (i.id.clone(), ip)))
            .collect();

        let mut guard = self.groups.lock().await;

        // Step 5: cancel groups no longer present, and drain them *before*
        // the next reconciliation completes (spec §3 invariant).
        let stale: Vec<PodGroupKey> = guard.keys().filter(|k| !active_keys.contains(*k)).cloned().collect();
        for key in stale {
            if let Some(mut group) = guard.remove(&key) {
                group.cancellation.cancel();
                while group.tasks.join_next().await.is_some() {}
            }
        }

        // Step 4: start groups for active pairs not already alive.
        for key in &active_keys {
            if guard.contains_key(key) {
                continue;
            }
            let Some(intercept) = tick.current.get(&key.0) else { continue };
            let group = self.start_pod_group(intercept, &key.1).await;
            guard.insert(key.clone(), group);
        }
    }

    /// Cancels and awaits every live group — used on session disconnect so
    /// nothing outlives the orchestrator (spec §5: "the reconciler handles
    /// stream EOF by synthesizing an empty snapshot so all pod groups
    /// drain cleanly on disconnect").
    pub async fn drain_all(&self) {
        let mut guard = self.groups.lock().await;
        for (_, mut group) in guard.drain() {
            group.cancellation.cancel();
            while group.tasks.join_next().await.is_some() {}
        }
    }

    pub async fn active_group_count(&self) -> usize {
        self.groups.lock().await.len()
    }

    async fn start_pod_group(self: &Arc<Self>, intercept: &InterceptRecord, pod_ip: &str) -> PodGroup {
        let cancellation = CancellationToken::new();
        let mut tasks = tokio::task::JoinSet::new();

        info!(
            intercept = %intercept.name,
            pod_ip,
            local_ports = ?intercept.local_ports,
            "starting pod group"
        );

        for &local_port in &intercept.local_ports {
            let local_addr: SocketAddr = ([127, 0, 0, 1], local_port).into();
            let manager = self.client.clone();
            let pod_ip = pod_ip.to_owned();
            let target_port = intercept.target_port;
            let token = cancellation.child_token();
            let intercept_name = intercept.name.clone();

            tasks.spawn(async move {
                if let Err(error) = forwarder::run(local_addr, pod_ip, target_port, manager, token).await {
                    warn!(intercept = %intercept_name, %local_addr, %error, "forwarder exited with an error");
                }
            });
        }

        if let (Some(mount_point), Some(sftp_port)) = (intercept.client_mount_point.clone(), Some(intercept.sftp_port).filter(|p| *p != 0)) {
            let request = mount::MountRequest {
                intercept_id: intercept.id.clone(),
                pod_ip: pod_ip.to_owned(),
                remote_mount_port: sftp_port,
                remote_mount_path: "/".to_owned(),
                local_mount_point: mount_point.clone().into(),
            };
            let manager = self.client.clone();
            let token = cancellation.child_token();
            let reconciler = Arc::clone(self);

            tasks.spawn(async move {
                let lock = reconciler
                    .mount_locks
                    .entry(mount_point.clone())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                    .clone();
                // Serializes against any previous mount for this exact
                // point: its unmount must finish before we start (spec §5
                // ordering requirement).
                let _guard = lock.lock().await;
                mount::run(request, manager, token).await;
            });
        }

        PodGroup { cancellation, tasks }
    }

    /// Picks a free local port for a pod group's bridge listeners. Simple
    /// monotonically-increasing allocator scoped to the session process;
    /// collisions with ports already in use on the host surface as a bind
    /// error from the forwarder itself.
    pub fn next_local_port(&self) -> u16 {
        self.next_local_port.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconciler() -> Arc<Reconciler> {
        // `connect_lazy` never opens a socket, so these tests exercise the
        // mount-point bookkeeping without any network I/O (spec §8
        // "Mount-point uniqueness").
        let channel = Channel::from_static("http://127.0.0.1:1").connect_lazy();
        Reconciler::new(pb::manager_client::ManagerClient::new(channel))
    }

    #[test]
    fn claim_mount_point_succeeds_for_the_first_owner() {
        let reconciler = reconciler();
        assert!(reconciler.claim_mount_point("/mnt/app", "intercept-a").is_ok());
    }

    #[test]
    fn a_second_intercept_claiming_the_same_point_is_rejected() {
        let reconciler = reconciler();
        reconciler.claim_mount_point("/mnt/app", "intercept-a").unwrap();

        let err = reconciler
            .claim_mount_point("/mnt/app", "intercept-b")
            .unwrap_err();
        assert!(matches!(err, SessionError::MountPointBusy(ref p) if p == "/mnt/app"));
    }

    #[test]
    fn re_claiming_by_the_same_owner_is_a_no_op() {
        let reconciler = reconciler();
        reconciler.claim_mount_point("/mnt/app", "intercept-a").unwrap();
        assert!(reconciler.claim_mount_point("/mnt/app", "intercept-a").is_ok());
    }

    #[test]
    fn releasing_lets_a_different_intercept_claim_the_point() {
        let reconciler = reconciler();
        reconciler.claim_mount_point("/mnt/app", "intercept-a").unwrap();
        reconciler.release_mount_point("/mnt/app");

        assert!(reconciler.claim_mount_point("/mnt/app", "intercept-b").is_ok());
    }

    #[tokio::test]
    async fn a_freshly_constructed_reconciler_has_no_live_groups() {
        let reconciler = reconciler();
        assert_eq!(reconciler.active_group_count().await, 0);
    }
}
