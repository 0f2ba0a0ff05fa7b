use std::{collections::HashSet, sync::LazyLock};

use k8s_openapi::api::core::v1::Container;

use crate::workload::Workload;

/// Service-mesh sidecar/init container names the installer should not treat
/// as the target app container (spec SPEC_FULL §4.2 "[SUPPLEMENT] Mesh
/// detection"). Grounded on the teacher's own `SKIP_NAMES` set.
pub static SKIP_NAMES: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from([
        "istio-proxy",
        "istio-init",
        "linkerd-proxy",
        "linkerd-init",
        "kuma-sidecar",
        "kuma-init",
        "vault-agent",
        "vault-agent-init",
        "queue-proxy",
    ])
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshVendor {
    Istio,
    IstioAmbient,
    Linkerd,
    Kuma,
}

/// Advisory metadata attached to an install plan; never blocks the install.
pub fn detect_mesh(workload: &Workload) -> Option<MeshVendor> {
    const ISTIO: [&str; 2] = ["istio-proxy", "istio-init"];
    const LINKERD: [&str; 2] = ["linkerd-proxy", "linkerd-init"];
    const KUMA: [&str; 2] = ["kuma-sidecar", "kuma-init"];

    if workload
        .pod_template()
        .and_then(|t| t.metadata.as_ref())
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get("ambient.istio.io/redirection"))
        .map(|v| v == "enabled")
        .unwrap_or(false)
    {
        return Some(MeshVendor::IstioAmbient);
    }

    let names: Vec<&str> = workload
        .containers()
        .iter()
        .chain(workload.init_containers().iter())
        .map(|c| c.name.as_str())
        .collect();

    if ISTIO.iter().any(|n| names.contains(n)) {
        Some(MeshVendor::Istio)
    } else if LINKERD.iter().any(|n| names.contains(n)) {
        Some(MeshVendor::Linkerd)
    } else if KUMA.iter().any(|n| names.contains(n)) {
        Some(MeshVendor::Kuma)
    } else {
        None
    }
}

/// Annotation a platform team places on a workload's pod template to
/// declare that an admission webhook (not this tool) is responsible for
/// placing the agent sidecar on its pods (spec §4.2 EnsureAgent: "if the
/// target workload is marked as being injected by an admission webhook").
/// The installer never mutates such a workload's containers or ports; it
/// only checks that the sidecar showed up and nudges a rollout if not.
pub const WEBHOOK_INJECTED_ANNOTATION: &str = "drift.dev/webhook-injected";

pub fn is_webhook_injected(workload: &Workload) -> bool {
    workload
        .pod_template()
        .and_then(|t| t.metadata.as_ref())
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get(WEBHOOK_INJECTED_ANNOTATION))
        .map(|v| v == "true")
        .unwrap_or(false)
}

pub fn has_container_named(workload: &Workload, name: &str) -> bool {
    workload.containers().iter().any(|c| c.name == name)
}

/// Picks the app container to take a port over from (spec SPEC_FULL §4.2
/// "[SUPPLEMENT] Container choice"). Returns the chosen container and
/// whether the choice was ambiguous (more than one non-mesh candidate, or
/// no non-mesh candidate existed and a mesh one was used instead).
pub fn choose_container<'a>(
    container_name: Option<&str>,
    containers: &'a [Container],
) -> (Option<&'a Container>, bool) {
    if let Some(name) = container_name {
        return (containers.iter().find(|c| c.name == name), false);
    }

    let mut candidates = containers.iter().filter(|c| !SKIP_NAMES.contains(c.name.as_str()));
    let Some(first) = candidates.next() else {
        let picked_from_many = containers.len() > 1;
        return (containers.first(), picked_from_many);
    };

    let ambiguous = candidates.next().is_some();
    (Some(first), ambiguous)
}
