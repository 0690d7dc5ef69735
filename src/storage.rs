use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    report_seq: u64,
}

/// Durable client-local storage: the report sequence counter in a JSON file,
/// plus cached font payloads next to it. Everything here is best-effort; a
/// failed write degrades, it never aborts the caller.
pub struct LocalStore {
    path: PathBuf,
    data: RwLock<StoreData>,
}

impl LocalStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read store from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            StoreData::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Increments and returns the report sequence counter. The new value is
    /// persisted immediately; a failed write keeps the in-memory counter so
    /// IDs still advance within the session.
    pub fn next_report_seq(&self) -> u64 {
        let mut guard = self.data.write().unwrap();
        guard.report_seq += 1;
        let next = guard.report_seq;
        if let Err(err) = self.persist(&guard) {
            log::warn!("failed to persist report sequence: {err:?}");
        }
        next
    }

    pub fn report_seq(&self) -> u64 {
        self.data.read().unwrap().report_seq
    }

    fn persist(&self, data: &StoreData) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write store to {}", self.path.display()))
    }

    fn font_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.path.with_file_name(format!("{safe}.ttf"))
    }

    pub fn load_cached_font(&self, key: &str) -> Option<Vec<u8>> {
        fs::read(self.font_path(key)).ok()
    }

    pub fn store_cached_font(&self, key: &str, bytes: &[u8]) {
        let path = self.font_path(key);
        if let Err(err) = fs::write(&path, bytes) {
            log::warn!("failed to cache font at {}: {err}", path.display());
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
