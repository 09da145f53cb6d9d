//! Campaign loader and registry: reads `index.json` plus per-campaign JSON
//! files into an in-memory, hot-reloadable map (§4.1).

use crate::model::{Campaign, CampaignIndex};
use log::{error, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

pub type Registry = HashMap<String, Campaign>;

/// Reads `index.json` under `dir` and every enabled, resolvable campaign
/// file it references. Returns the built registry; per-file errors are
/// logged and the offending entry skipped (non-fatal). A missing or
/// malformed index is the one fatal error (the scheduler cannot start
/// without at least an empty, valid index).
pub fn load_registry(dir: &Path) -> Result<Registry, String> {
    let index_path = dir.join("index.json");
    let index_raw = std::fs::read_to_string(&index_path)
        .map_err(|e| format!("cannot read index {}: {e}", index_path.display()))?;
    let index: CampaignIndex =
        serde_json::from_str(&index_raw).map_err(|e| format!("cannot parse index {}: {e}", index_path.display()))?;

    let mut registry = Registry::new();
    for (id, entry) in index.campaigns {
        if !entry.enabled {
            continue;
        }
        let path = resolve_campaign_path(dir, &entry.file, &id);
        match load_one(&path) {
            Ok(campaign) if campaign.id == id => {
                registry.insert(id, campaign);
            }
            Ok(campaign) => {
                warn!(
                    "campaign_runner::loader::load_registry(...): {} declares id \"{}\" but index key is \"{id}\", skipping",
                    path.display(),
                    campaign.id
                );
            }
            Err(e) => {
                error!("campaign_runner::loader::load_registry(...): failed to load {}: {e}", path.display());
            }
        }
    }
    Ok(registry)
}

fn resolve_campaign_path(dir: &Path, rel_path: &str, id: &str) -> PathBuf {
    if !rel_path.is_empty() {
        let candidate = dir.join(rel_path);
        if candidate.exists() {
            return candidate;
        }
        // Flat config-map mounts: fall back to the basename at the directory root.
        if let Some(basename) = Path::new(rel_path).file_name() {
            return dir.join(basename);
        }
    }
    dir.join(format!("{id}.json"))
}

fn load_one(path: &Path) -> Result<Campaign, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&raw).map_err(|e| e.to_string())
}

/// Atomically-swappable registry handle shared between the loader's hot
/// reload ticker and every registry reader (the scheduler, the API server).
#[derive(Clone)]
pub struct SharedRegistry {
    inner: Arc<RwLock<Registry>>,
}

impl SharedRegistry {
    pub fn new(initial: Registry) -> Self {
        SharedRegistry { inner: Arc::new(RwLock::new(initial)) }
    }

    pub async fn snapshot(&self) -> Registry {
        self.inner.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<Campaign> {
        self.inner.read().await.get(id).cloned()
    }

    async fn swap(&self, new_registry: Registry) {
        *self.inner.write().await = new_registry;
    }

    /// Spawns the 5-minute hot-reload ticker. Loader errors during reload
    /// are logged and the previous registry is kept in place.
    pub fn spawn_hot_reload(&self, dir: PathBuf) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5 * 60));
            ticker.tick().await; // first tick fires immediately; skip it, load_registry already ran at startup
            loop {
                ticker.tick().await;
                match load_registry(&dir) {
                    Ok(fresh) => registry.swap(fresh).await,
                    Err(e) => error!("campaign_runner::loader::spawn_hot_reload(...): reload failed, keeping prior registry: {e}"),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn loads_enabled_campaigns_and_skips_disabled() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "index.json",
            r#"{"version":"1","campaigns":{
                "sweep":{"file":"sweep.json","enabled":true},
                "off":{"file":"off.json","enabled":false}
            }}"#,
        );
        write(tmp.path(), "sweep.json", r#"{"id":"sweep","agent":"gateway-direct"}"#);
        write(tmp.path(), "off.json", r#"{"id":"off","agent":"gateway-direct"}"#);

        let registry = load_registry(tmp.path()).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains_key("sweep"));
    }

    #[test]
    fn skips_campaign_with_mismatched_id() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "index.json",
            r#"{"version":"1","campaigns":{"sweep":{"file":"sweep.json","enabled":true}}}"#,
        );
        write(tmp.path(), "sweep.json", r#"{"id":"other","agent":"gateway-direct"}"#);

        let registry = load_registry(tmp.path()).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn falls_back_to_basename_for_flat_mounts() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "index.json",
            r#"{"version":"1","campaigns":{"sweep":{"file":"nested/sweep.json","enabled":true}}}"#,
        );
        write(tmp.path(), "sweep.json", r#"{"id":"sweep","agent":"gateway-direct"}"#);

        let registry = load_registry(tmp.path()).unwrap();
        assert!(registry.contains_key("sweep"));
    }

    #[test]
    fn missing_index_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load_registry(tmp.path()).is_err());
    }
}
