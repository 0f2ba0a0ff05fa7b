use std::time::Duration;

use serde::{Deserialize, Serialize};

/// User-visible timeout knobs (spec §6: "timeouts (connect, traffic-manager-
/// connect, api-roundtrip, apply, intercept, endpoint-dial)"). Stored as
/// whole seconds in the config file, exposed as [`Duration`] to callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct Timeouts {
    /// Overall timeout for the `Connect` sequence (spec §4.9).
    pub connect_secs: u64,
    /// Timeout for establishing the port-forward dialer + manager dial
    /// (spec §4.9 steps 2-3).
    pub traffic_manager_connect_secs: u64,
    /// Timeout applied to a single Kubernetes API round trip.
    pub api_roundtrip_secs: u64,
    /// Timeout for a single rollout-convergence poll cycle (spec §4.2).
    pub apply_secs: u64,
    /// Timeout for `AddIntercept` end-to-end (spec §4.9, §5).
    pub intercept_secs: u64,
    /// Timeout for a single forwarder dial to the manager tunnel.
    pub endpoint_dial_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_secs: 20,
            traffic_manager_connect_secs: 20,
            api_roundtrip_secs: 10,
            apply_secs: 120,
            intercept_secs: 30,
            endpoint_dial_secs: 10,
        }
    }
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn traffic_manager_connect(&self) -> Duration {
        Duration::from_secs(self.traffic_manager_connect_secs)
    }

    pub fn api_roundtrip(&self) -> Duration {
        Duration::from_secs(self.api_roundtrip_secs)
    }

    pub fn apply(&self) -> Duration {
        Duration::from_secs(self.apply_secs)
    }

    pub fn intercept(&self) -> Duration {
        Duration::from_secs(self.intercept_secs)
    }

    pub fn endpoint_dial(&self) -> Duration {
        Duration::from_secs(self.endpoint_dial_secs)
    }
}
