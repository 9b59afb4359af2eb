use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Durable string key-value slots kept in one JSON object file.
///
/// Stands in for browser local storage: every value is an opaque string and
/// callers own its encoding.
#[derive(Debug)]
pub struct DataStore {
    pub storage_path: PathBuf,
}

impl DataStore {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let data_dir = data_dir.to_path_buf();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let storage_path = data_dir.join("storage.json");
        if !storage_path.exists() {
            fs::write(&storage_path, "{}")
                .with_context(|| format!("failed to create {}", storage_path.display()))?;
        }

        info!(
            data_dir = %data_dir.display(),
            storage = %storage_path.display(),
            "opened datastore"
        );

        Ok(Self { storage_path })
    }

    #[tracing::instrument(skip(self))]
    pub fn get_item(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut slots = self.load_slots()?;
        Ok(slots.remove(key))
    }

    #[tracing::instrument(skip(self, value), fields(len = value.len()))]
    pub fn set_item(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut slots = self.load_slots()?;
        slots.insert(key.to_string(), value.to_string());
        self.save_slots(&slots)
    }

    fn load_slots(&self) -> anyhow::Result<BTreeMap<String, String>> {
        let path = &self.storage_path;
        debug!(file = %path.display(), "loading storage slots");
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).with_context(|| format!("failed parsing {}", path.display()))
    }

    fn save_slots(&self, slots: &BTreeMap<String, String>) -> anyhow::Result<()> {
        let path = &self.storage_path;
        debug!(file = %path.display(), count = slots.len(), "saving storage slots atomically");

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut temp, slots)?;
        writeln!(temp)?;
        temp.flush()?;

        temp.persist(path)
            .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;

        Ok(())
    }
}
