//! Persistent configuration loaded by the session (spec §6 "Persistent
//! state on the workstation" / SPEC_FULL §6 "[AMBIENT] Persistent config
//! file").

mod error;
mod timeouts;

use std::path::{Path, PathBuf};

pub use error::ConfigError;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
pub use timeouts::Timeouts;

/// The product name used to compute the default config path and the
/// `product` field sent in `ArriveAsClient` (spec §6).
pub const PRODUCT: &str = "drift";

/// Default max size, in bytes, the gRPC client will accept for a single
/// manager response.
const DEFAULT_GRPC_MAX_RECEIVE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub timeouts: Timeouts,

    /// Max size, in bytes, accepted from the manager for a single response.
    pub grpc_max_receive_size: usize,

    /// Image registry used when constructing the default sidecar image name.
    pub image_registry: String,

    /// Strategy used to pick an intercept's application protocol when the
    /// user did not name a mechanism explicitly.
    pub app_protocol_strategy: AppProtocolStrategy,

    /// Namespaces the session actively watches. Empty means "none yet";
    /// namespaces are added as intercepts target them.
    pub mapped_namespaces: Vec<String>,

    /// CIDRs always routed through the root daemon's proxy, in addition to
    /// whatever the cluster reports.
    pub also_proxy: Vec<IpNet>,

    /// CIDRs never routed through the root daemon's proxy (the Kubernetes
    /// API server's own address is always appended to this list by the
    /// session orchestrator, regardless of what's configured here).
    pub never_proxy: Vec<IpNet>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            grpc_max_receive_size: DEFAULT_GRPC_MAX_RECEIVE_SIZE,
            image_registry: "docker.io/drift".to_owned(),
            app_protocol_strategy: AppProtocolStrategy::default(),
            mapped_namespaces: Vec::new(),
            also_proxy: Vec::new(),
            never_proxy: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AppProtocolStrategy {
    #[default]
    Http1,
    Http2,
    Tcp,
}

impl Config {
    /// Default on-disk location: `$XDG_CONFIG_HOME/drift/config.toml`,
    /// falling back to `~/.config/drift/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            if !xdg.is_empty() {
                return Some(Path::new(&xdg).join(PRODUCT).join("config.toml"));
            }
        }

        home::home_dir().map(|home| home.join(".config").join(PRODUCT).join("config.toml"))
    }

    /// Loads the config file at `path` if it exists, otherwise returns the
    /// default configuration. A present-but-invalid file is always an
    /// error — unlike a missing file, which is not.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(?path, "no config file found, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;

        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Loads from [`Self::default_path`], or returns defaults if there is no
    /// resolvable home directory.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Merges a remote config fragment received from the manager (spec
    /// §4.9 Connect step 5) on top of this one. Remote values win for any
    /// field that round-trips through JSON; `mapped_namespaces` is unioned
    /// rather than replaced, since the user's local selection should not be
    /// silently dropped by a smaller remote list.
    pub fn merge_remote(&mut self, remote: RemoteConfigPatch) {
        if let Some(strategy) = remote.app_protocol_strategy {
            self.app_protocol_strategy = strategy;
        }
        if let Some(size) = remote.grpc_max_receive_size {
            self.grpc_max_receive_size = size;
        }
        for ns in remote.mapped_namespaces {
            if !self.mapped_namespaces.contains(&ns) {
                self.mapped_namespaces.push(ns);
            }
        }
        for cidr in remote.also_proxy {
            if !self.also_proxy.contains(&cidr) {
                self.also_proxy.push(cidr);
            }
        }
        for cidr in remote.never_proxy {
            if !self.never_proxy.contains(&cidr) {
                self.never_proxy.push(cidr);
            }
        }
    }
}

/// The subset of [`Config`] the manager may override remotely (spec §4.9
/// Connect step 5: "ask the manager for a remote client config and merge it
/// into the effective config").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfigPatch {
    pub app_protocol_strategy: Option<AppProtocolStrategy>,
    pub grpc_max_receive_size: Option<usize>,
    #[serde(default)]
    pub mapped_namespaces: Vec<String>,
    #[serde(default)]
    pub also_proxy: Vec<IpNet>,
    #[serde(default)]
    pub never_proxy: Vec<IpNet>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.toml");
        let config = Config::load(&path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "made_up_field = true\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn remote_patch_unions_namespaces_instead_of_replacing() {
        let mut config = Config {
            mapped_namespaces: vec!["a".into()],
            ..Config::default()
        };
        config.merge_remote(RemoteConfigPatch {
            mapped_namespaces: vec!["a".into(), "b".into()],
            ..Default::default()
        });
        assert_eq!(config.mapped_namespaces, vec!["a".to_string(), "b".to_string()]);
    }
}
