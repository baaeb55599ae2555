//! Persisted runtime state
//!
//! The orchestrator reads and writes a small TOML state file: whether the
//! tunnel is enabled and whether it should reconnect automatically after a
//! restart. The boot collaborator (external) reads the same file to decide
//! whether to issue a `Connect` command.

use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;

/// State that survives process restarts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// The user last asked for the tunnel to be up
    #[serde(default)]
    pub enabled: bool,
    /// Reconnect automatically after boot or process restart
    #[serde(default)]
    pub auto_reconnect: bool,
}

/// File-backed store for [`PersistedState`].
///
/// Loads and saves hold an internal lock, so a connect that arrives while a
/// load is in flight can wait (bounded) for the store to settle instead of
/// racing it.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Read the persisted state; a missing file yields the defaults.
    pub async fn load(&self) -> Result<PersistedState> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedState::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the state, replacing the previous file contents.
    pub async fn save(&self, state: PersistedState) -> Result<()> {
        let _guard = self.lock.lock().await;
        let contents = toml::to_string(&state)
            .map_err(|e| TunnelError::Other(format!("Failed to serialize state: {e}")))?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, contents).await?;
        Ok(())
    }

    /// Update only the `enabled` flag, keeping the rest of the state.
    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        let mut state = self.load().await?;
        state.enabled = enabled;
        self.save(state).await
    }

    /// Wait (bounded) for any in-flight load or save to finish. Used at the
    /// top of `connect()` so a session never starts against half-written
    /// configuration.
    pub async fn wait_settled(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.lock.lock()).await {
            Ok(_guard) => Ok(()),
            Err(_) => Err(TunnelError::Timeout(
                "Settings store did not settle".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("state.toml"));

        let state = store.load().await.unwrap();
        assert_eq!(state, PersistedState::default());
        assert!(!state.enabled);
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("nested").join("state.toml"));

        store
            .save(PersistedState {
                enabled: true,
                auto_reconnect: true,
            })
            .await
            .unwrap();

        let state = store.load().await.unwrap();
        assert!(state.enabled);
        assert!(state.auto_reconnect);
    }

    #[tokio::test]
    async fn test_set_enabled_preserves_other_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("state.toml"));

        store
            .save(PersistedState {
                enabled: true,
                auto_reconnect: true,
            })
            .await
            .unwrap();
        store.set_enabled(false).await.unwrap();

        let state = store.load().await.unwrap();
        assert!(!state.enabled);
        assert!(state.auto_reconnect);
    }

    #[tokio::test]
    async fn test_wait_settled_times_out_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("state.toml"));

        let _guard = store.lock.lock().await;
        let result = store.wait_settled(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(TunnelError::Timeout(_))));
    }
}
