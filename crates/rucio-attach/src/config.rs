//! Extension configuration and the active-instance store.
//!
//! Configuration is read from a JSON file:
//! - Linux: ~/.config/rucio-attach/config.json
//! - macOS: ~/Library/Application Support/rucio-attach/config.json
//! - Windows: C:\Users\<User>\AppData\Roaming\rucio-attach\config.json
//!
//! `RUCIO_ATTACH_CONFIG` overrides the location. The `active_instance` field
//! is mirrored into an [`ActiveInstance`] store, which the coordinator
//! watches to trigger a forceful re-inject when the user switches instances.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::error::{AttachError, Result};

/// How an instance makes replicas available to the notebook host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum InstanceMode {
    /// Replicas are mounted from a storage element.
    #[default]
    Replica,
    /// Files are downloaded into a local directory.
    Download,
}

/// A configured remote Rucio instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Instance {
    /// Namespace passed to the lookup service.
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub mode: InstanceMode,
}

/// Contents of `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AttachConfig {
    /// Base URL of the Jupyter server hosting the lookup endpoints.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Jupyter server token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Name of the instance attachments are resolved against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_instance: Option<String>,

    #[serde(default)]
    pub instances: Vec<Instance>,
}

fn default_server_url() -> String {
    "http://localhost:8888".to_string()
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            token: None,
            active_instance: None,
            instances: Vec::new(),
        }
    }
}

/// Default config file location, honoring `RUCIO_ATTACH_CONFIG`.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("RUCIO_ATTACH_CONFIG") {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rucio-attach")
        .join("config.json")
}

impl AttachConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("[config] No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Parse and validate a config document.
    pub fn from_json_str(contents: &str) -> Result<Self> {
        let config: AttachConfig = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject an `active_instance` that names no configured instance.
    pub fn validate(&self) -> Result<()> {
        if let Some(ref name) = self.active_instance {
            if !self.instances.iter().any(|i| &i.name == name) {
                return Err(AttachError::Config(format!(
                    "active_instance '{}' is not in instances",
                    name
                )));
            }
        }
        Ok(())
    }

    /// The configured instance selected by `active_instance`.
    pub fn active(&self) -> Option<Instance> {
        let name = self.active_instance.as_ref()?;
        self.instances.iter().find(|i| &i.name == name).cloned()
    }

    /// Look up an instance by name.
    pub fn instance(&self, name: &str) -> Option<Instance> {
        self.instances.iter().find(|i| i.name == name).cloned()
    }

    /// JSON Schema for `config.json`.
    pub fn schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(AttachConfig)).unwrap_or_default()
    }
}

/// Reactive store for the active remote instance.
///
/// `None` is the unconfigured state: every injection attempt is skipped.
/// Subscribers are woken only when the value actually changes.
#[derive(Clone)]
pub struct ActiveInstance {
    tx: Arc<watch::Sender<Option<Instance>>>,
}

impl ActiveInstance {
    pub fn new(initial: Option<Instance>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> Option<Instance> {
        self.tx.borrow().clone()
    }

    /// Replace the active instance. Returns whether it changed.
    pub fn set(&self, instance: Option<Instance>) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == instance {
                false
            } else {
                *current = instance;
                true
            }
        })
    }

    /// Receiver that resolves `changed()` on every distinct update.
    pub fn subscribe(&self) -> watch::Receiver<Option<Instance>> {
        self.tx.subscribe()
    }
}

impl Default for ActiveInstance {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Absolute form of `config_path` and the directory to watch for it.
///
/// The directory is watched rather than the file, and is created when missing.
fn watch_target(config_path: &Path) -> std::io::Result<(PathBuf, PathBuf)> {
    let config_path = std::path::absolute(config_path)?;
    let dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{:?} has no parent directory", config_path),
            )
        })?;
    std::fs::create_dir_all(&dir)?;
    Ok((config_path, dir))
}

/// Re-read `config_path` and mirror its `active_instance` into `active`.
///
/// Returns whether the active instance changed.
async fn apply_config_change(config_path: &Path, active: &ActiveInstance) -> bool {
    let contents = match tokio::fs::read_to_string(config_path).await {
        Ok(c) => c,
        Err(e) => {
            warn!("[config-watch] Cannot read config: {}", e);
            return false;
        }
    };
    let config = match AttachConfig::from_json_str(&contents) {
        Ok(config) => config,
        Err(e) => {
            warn!("[config-watch] Ignoring invalid config: {}", e);
            return false;
        }
    };

    let next = config.active();
    let name = next.as_ref().map(|i| i.name.clone());
    let changed = active.set(next);
    if changed {
        info!("[config-watch] Active instance changed to {:?}", name);
    }
    changed
}

/// Watch `config_path` for external edits and mirror `active_instance`.
///
/// Events are debounced by 500ms. Unreadable or invalid intermediate writes
/// are skipped until the next event.
pub async fn watch_config_file(config_path: PathBuf, active: ActiveInstance) {
    let (config_path, dir) = match watch_target(&config_path) {
        Ok(target) => target,
        Err(e) => {
            error!("[config-watch] Cannot watch {:?}: {}", config_path, e);
            return;
        }
    };

    // notify calls back on its own thread
    let (tx, mut rx) = mpsc::channel::<DebounceEventResult>(16);
    let debouncer = new_debouncer(
        Duration::from_millis(500),
        move |res: DebounceEventResult| {
            let _ = tx.blocking_send(res);
        },
    );
    let mut debouncer = match debouncer {
        Ok(debouncer) => debouncer,
        Err(e) => {
            error!("[config-watch] Failed to create file watcher: {}", e);
            return;
        }
    };
    if let Err(e) = debouncer.watcher().watch(&dir, RecursiveMode::NonRecursive) {
        error!("[config-watch] Failed to watch {:?}: {}", dir, e);
        return;
    }
    info!("[config-watch] Watching {:?}", config_path);

    while let Some(result) = rx.recv().await {
        match result {
            Ok(events) if events.iter().any(|e| e.path == config_path) => {
                apply_config_change(&config_path, &active).await;
            }
            Ok(_) => {}
            Err(e) => warn!("[config-watch] Watch error: {:?}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atlas() -> Instance {
        Instance {
            name: "atlas".to_string(),
            display_name: "ATLAS".to_string(),
            mode: InstanceMode::Replica,
        }
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = AttachConfig::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, AttachConfig::default());
        assert_eq!(config.server_url, "http://localhost:8888");
        assert!(config.active().is_none());
    }

    #[test]
    fn test_load_resolves_active_instance() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "server_url": "http://jupyter:8888",
                "token": "abc",
                "active_instance": "atlas",
                "instances": [
                    {"name": "atlas", "display_name": "ATLAS"},
                    {"name": "cms", "display_name": "CMS", "mode": "download"}
                ]
            }"#,
        )
        .unwrap();

        let config = AttachConfig::load(&path).unwrap();
        assert_eq!(config.active(), Some(atlas()));
        assert_eq!(config.instance("cms").unwrap().mode, InstanceMode::Download);
    }

    #[test]
    fn test_unknown_active_instance_is_rejected() {
        let err = AttachConfig::from_json_str(r#"{"active_instance": "lhcb"}"#).unwrap_err();
        assert!(matches!(err, AttachError::Config(_)));
    }

    #[test]
    fn test_schema_describes_instances() {
        let schema = AttachConfig::schema();
        assert!(schema.to_string().contains("active_instance"));
        assert!(schema.to_string().contains("display_name"));
    }

    #[tokio::test]
    async fn test_active_instance_notifies_only_on_change() {
        let active = ActiveInstance::new(None);
        let mut rx = active.subscribe();

        assert!(!active.set(None));
        assert!(!rx.has_changed().unwrap());

        assert!(active.set(Some(atlas())));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().clone(), Some(atlas()));

        assert!(!active.set(Some(atlas())));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(active.get(), Some(atlas()));
    }

    #[test]
    fn test_relative_config_path_is_made_absolute() {
        let cwd = std::env::current_dir().unwrap();
        let (config_path, dir) = watch_target(Path::new("rucio-attach-missing.json")).unwrap();

        assert!(config_path.is_absolute());
        assert_eq!(config_path, cwd.join("rucio-attach-missing.json"));
        assert_eq!(dir, cwd);
    }

    #[test]
    fn test_watch_target_creates_missing_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let (config_path, watched) = watch_target(&path).unwrap();

        assert_eq!(config_path, path);
        assert_eq!(watched, dir.path().join("nested"));
        assert!(watched.is_dir());
    }

    #[tokio::test]
    async fn test_config_change_updates_active_instance() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let active = ActiveInstance::new(None);

        std::fs::write(
            &path,
            r#"{"active_instance": "atlas", "instances": [{"name": "atlas", "display_name": "ATLAS"}]}"#,
        )
        .unwrap();
        assert!(apply_config_change(&path, &active).await);
        assert_eq!(active.get(), Some(atlas()));

        // Half-written file keeps the current selection
        std::fs::write(&path, r#"{"active_instance": "#).unwrap();
        assert!(!apply_config_change(&path, &active).await);
        assert_eq!(active.get(), Some(atlas()));

        std::fs::write(&path, "{}").unwrap();
        assert!(apply_config_change(&path, &active).await);
        assert_eq!(active.get(), None);
    }
}
