use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::AppConfig;
use crate::error::{AppError, Result};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "CAMLINK_CONFIG";

/// Default config file name, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "camlink.json";

/// Configuration store backed by a JSON file
///
/// Uses `ArcSwap` for lock-free reads; writes replace the file atomically
/// (temporary file + rename).
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub key: String,
}

impl ConfigStore {
    /// Open the store at `path`. A missing file yields the defaults and is
    /// not created until the first `set`.
    pub async fn open(path: &Path) -> Result<Self> {
        let config = Self::load_file(path).await?;
        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path: path.to_path_buf(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        })
    }

    /// Path from `CAMLINK_CONFIG`, else `camlink.json`
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    async fn load_file(path: &Path) -> Result<AppConfig> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => {
                let config: AppConfig = serde_json::from_str(&json).map_err(|e| {
                    AppError::Config(format!("{}: {}", path.display(), e))
                })?;
                info!("Loaded configuration from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                Ok(AppConfig::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save_file(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(config)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Set entire configuration
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        self.save_file(&config).await?;
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            key: "app_config".to_string(),
        });

        Ok(())
    }

    /// Update configuration with a closure
    ///
    /// Read-modify-write; concurrent updates are last-write-wins.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (**self.cache.load()).clone();
        f(&mut config);
        self.set(config).await
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::CodecKind;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("camlink.json");

        let store = tokio_test::assert_ok!(ConfigStore::open(&path).await);
        assert_eq!(store.get().exchange.codec, CodecKind::Qr);
        assert!(!path.exists());

        let mut changes = store.subscribe();
        store
            .update(|c| {
                c.exchange.codec = CodecKind::Text;
                c.webrtc.gathering_timeout_ms = None;
            })
            .await
            .unwrap();
        assert_eq!(changes.recv().await.unwrap().key, "app_config");

        let config = store.get();
        assert_eq!(config.exchange.codec, CodecKind::Text);
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        // Persistence across instances
        let store2 = ConfigStore::open(&path).await.unwrap();
        let config = store2.get();
        assert_eq!(config.exchange.codec, CodecKind::Text);
        assert_eq!(config.webrtc.gathering_timeout_ms, None);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("camlink.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ConfigStore::open(&path).await,
            Err(AppError::Config(_))
        ));
    }
}
