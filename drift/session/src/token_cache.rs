//! Cached session tokens, keyed by cluster host (spec §6 "Persistent state
//! on the workstation"). Stored under the app cache directory with
//! private-only permissions, one small JSON file per host.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use fs4::tokio::AsyncFileExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(thiserror::Error, Debug)]
pub enum TokenCacheError {
    #[error("failed to read session token cache at {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("failed to write session token cache at {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },

    #[error("failed to parse session token cache at {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedEntry {
    session_id: String,
}

/// A file-backed map from cluster host to cached manager session id.
pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    pub fn default_path() -> Option<PathBuf> {
        home::home_dir().map(|home| home.join(".cache").join(drift_config::PRODUCT).join("sessions.json"))
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn load(&self, cluster_host: &str) -> Result<Option<String>, TokenCacheError> {
        let entries = self.read_all().await?;
        Ok(entries.get(cluster_host).map(|e| e.session_id.clone()))
    }

    pub async fn store(&self, cluster_host: &str, session_id: &str) -> Result<(), TokenCacheError> {
        let mut entries = self.read_all().await?;
        entries.insert(
            cluster_host.to_owned(),
            CachedEntry {
                session_id: session_id.to_owned(),
            },
        );
        self.write_all(&entries).await
    }

    pub async fn clear(&self, cluster_host: &str) -> Result<(), TokenCacheError> {
        let mut entries = self.read_all().await?;
        if entries.remove(cluster_host).is_some() {
            self.write_all(&entries).await?;
        }
        Ok(())
    }

    async fn read_all(&self) -> Result<HashMap<String, CachedEntry>, TokenCacheError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let mut file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|source| TokenCacheError::Read { path: self.path.clone(), source })?;
        file.lock_shared().map_err(|source| TokenCacheError::Read { path: self.path.clone(), source })?;

        let mut raw = String::new();
        file.read_to_string(&mut raw)
            .await
            .map_err(|source| TokenCacheError::Read { path: self.path.clone(), source })?;

        if raw.trim().is_empty() {
            return Ok(HashMap::new());
        }

        serde_json::from_str(&raw).map_err(|source| TokenCacheError::Parse { path: self.path.clone(), source })
    }

    async fn write_all(&self, entries: &HashMap<String, CachedEntry>) -> Result<(), TokenCacheError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| TokenCacheError::Write { path: self.path.clone(), source })?;
        }

        let raw = serde_json::to_string_pretty(entries).expect("token cache entries always serialize");

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .await
            .map_err(|source| TokenCacheError::Write { path: self.path.clone(), source })?;

        file.lock_exclusive().map_err(|source| TokenCacheError::Write { path: self.path.clone(), source })?;
        file.write_all(raw.as_bytes())
            .await
            .map_err(|source| TokenCacheError::Write { path: self.path.clone(), source })?;

        set_private_permissions(&self.path)
            .await
            .map_err(|source| TokenCacheError::Write { path: self.path.clone(), source })?;

        Ok(())
    }
}

#[cfg(unix)]
async fn set_private_permissions(path: &Path) -> Result<(), std::io::Error> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = std::fs::Permissions::from_mode(0o600);
    tokio::fs::set_permissions(path, permissions).await
}

#[cfg(not(unix))]
async fn set_private_permissions(_path: &Path) -> Result<(), std::io::Error> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_token_through_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::at(dir.path().join("sessions.json"));

        assert_eq!(cache.load("cluster-a").await.unwrap(), None);

        cache.store("cluster-a", "sess-123").await.unwrap();
        assert_eq!(cache.load("cluster-a").await.unwrap(), Some("sess-123".to_owned()));

        cache.clear("cluster-a").await.unwrap();
        assert_eq!(cache.load("cluster-a").await.unwrap(), None);
    }
}
