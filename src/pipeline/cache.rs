/// Persistent step cache
///
/// Layout: `<cache_dir>/steps/<cache_key>/metadata.json` plus an optional
/// `outputs.tar.zst` holding the step's declared outputs.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::descriptor::{Params, ResolvedStep};
use super::executor::ExecutionResult;
use super::outputs::ArchivedOutput;
use crate::error::StrataError;
use crate::logging::{operations, status};

const METADATA_VERSION: u32 = 1;
const METADATA_FILE: &str = "metadata.json";
const ARCHIVE_FILE: &str = "outputs.tar.zst";

/// Cache entry metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub version: u32,
    pub cache_key: String,
    pub step_id: String,
    pub params: Params,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub result: ExecutionResult,
    #[serde(default)]
    pub outputs: Vec<ArchivedOutput>,
}

/// Cache entry with metadata and (optional) output archive
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub metadata: CacheMetadata,
    pub archive_path: Option<PathBuf>,
}

/// Output snapshot produced by a successful step, ready to be stored
pub struct OutputSnapshot<'a> {
    pub archive_path: &'a Path,
    pub outputs: Vec<ArchivedOutput>,
}

/// On-disk cache of successful step results
#[derive(Debug, Clone)]
pub struct StepCache {
    cache_dir: PathBuf,
}

impl StepCache {
    pub fn new(cache_dir: PathBuf) -> Result<Self> {
        let steps_dir = cache_dir.join("steps");
        fs::create_dir_all(&steps_dir).with_context(|| {
            format!("Failed to create cache directory: {}", steps_dir.display())
        })?;

        Ok(Self {
            cache_dir: steps_dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Look up a prior successful result for this exact step binding
    ///
    /// Corrupt entries are logged, removed and reported as a miss. An entry
    /// recorded for a different descriptor body or parameter set is a miss too.
    pub fn lookup(&self, step: &ResolvedStep) -> Option<CacheEntry> {
        let key = step.cache_key();

        let entry = match self.get(&key) {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                warn!(
                    operation = operations::LOOKUP,
                    status = status::CORRUPT,
                    cache_key = %key,
                    error = %e,
                    "ignoring unreadable cache entry"
                );
                let _ = self.remove(&key);
                return None;
            }
        };

        if entry.metadata.params != *step.params() {
            debug!(cache_key = %key, step_id = step.id(), "cache entry parameters differ");
            return None;
        }

        if entry.metadata.fingerprint != step.fingerprint() {
            debug!(cache_key = %key, step_id = step.id(), "step definition changed since cached");
            return None;
        }

        if !entry.metadata.result.succeeded() {
            return None;
        }

        Some(entry)
    }

    /// Read an entry by key
    pub fn get(&self, cache_key: &str) -> std::result::Result<Option<CacheEntry>, StrataError> {
        let entry_dir = self.cache_dir.join(cache_key);
        let metadata_path = entry_dir.join(METADATA_FILE);

        if !metadata_path.exists() {
            return Ok(None);
        }

        let corrupt = |reason: String| StrataError::CacheCorruption {
            key: cache_key.to_string(),
            reason,
        };

        let metadata_json = fs::read_to_string(&metadata_path).map_err(|e| corrupt(e.to_string()))?;
        let metadata: CacheMetadata =
            serde_json::from_str(&metadata_json).map_err(|e| corrupt(e.to_string()))?;

        if metadata.version != METADATA_VERSION {
            return Err(corrupt(format!("unsupported version {}", metadata.version)));
        }
        if metadata.cache_key != cache_key {
            return Err(corrupt(format!("entry records key {}", metadata.cache_key)));
        }

        let archive_path = entry_dir.join(ARCHIVE_FILE);
        let archive_path = if metadata.outputs.is_empty() {
            None
        } else if archive_path.exists() {
            Some(archive_path)
        } else {
            return Err(corrupt("output archive missing".to_string()));
        };

        Ok(Some(CacheEntry {
            metadata,
            archive_path,
        }))
    }

    /// Store a successful result, replacing any prior entry for the same key
    pub fn store(
        &self,
        step: &ResolvedStep,
        result: &ExecutionResult,
        snapshot: Option<OutputSnapshot<'_>>,
    ) -> Result<()> {
        let key = step.cache_key();
        let entry_dir = self.cache_dir.join(&key);

        if entry_dir.exists() {
            fs::remove_dir_all(&entry_dir).with_context(|| {
                format!("Failed to replace cache entry: {}", entry_dir.display())
            })?;
        }
        fs::create_dir_all(&entry_dir).with_context(|| {
            format!("Failed to create entry directory: {}", entry_dir.display())
        })?;

        let mut stored = result.clone();
        stored.cache_hit = false;

        let outputs = match snapshot {
            Some(snapshot) => {
                let dest = entry_dir.join(ARCHIVE_FILE);
                fs::copy(snapshot.archive_path, &dest)
                    .with_context(|| format!("Failed to copy archive to: {}", dest.display()))?;
                snapshot.outputs
            }
            None => Vec::new(),
        };

        let metadata = CacheMetadata {
            version: METADATA_VERSION,
            cache_key: key.clone(),
            step_id: step.id().to_string(),
            params: step.params().clone(),
            fingerprint: step.fingerprint(),
            created_at: Utc::now(),
            result: stored,
            outputs,
        };

        // Metadata goes last and lands atomically; a half-written entry reads as a miss
        let json =
            serde_json::to_vec_pretty(&metadata).context("Failed to serialize metadata")?;
        let mut tmp = tempfile::NamedTempFile::new_in(&entry_dir)
            .context("Failed to create temporary metadata file")?;
        tmp.write_all(&json).context("Failed to write metadata")?;
        tmp.persist(entry_dir.join(METADATA_FILE))
            .context("Failed to persist metadata")?;

        debug!(
            operation = operations::STORE,
            status = status::SUCCESS,
            cache_key = %key,
            step_id = step.id(),
            "stored step result"
        );

        Ok(())
    }

    /// Remove an entry by key
    pub fn remove(&self, cache_key: &str) -> Result<()> {
        let entry_dir = self.cache_dir.join(cache_key);

        if entry_dir.exists() {
            fs::remove_dir_all(&entry_dir).with_context(|| {
                format!("Failed to remove cache entry: {}", entry_dir.display())
            })?;
        }

        Ok(())
    }

    /// Remove every entry recorded for a step id; returns how many were removed
    pub fn remove_step(&self, step_id: &str) -> Result<usize> {
        let mut removed = 0;
        for metadata in self.list()? {
            if metadata.step_id == step_id {
                self.remove(&metadata.cache_key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// List readable entries, sorted by step id then key
    pub fn list(&self) -> Result<Vec<CacheMetadata>> {
        let mut entries = Vec::new();

        for key in self.keys()? {
            match self.get(&key) {
                Ok(Some(entry)) => entries.push(entry.metadata),
                Ok(None) => {}
                Err(e) => warn!(cache_key = %key, error = %e, "skipping unreadable cache entry"),
            }
        }

        entries.sort_by(|a, b| {
            a.step_id
                .cmp(&b.step_id)
                .then_with(|| a.cache_key.cmp(&b.cache_key))
        });
        Ok(entries)
    }

    /// Cache statistics
    pub fn stats(&self) -> Result<CacheStats> {
        let keys = self.keys()?;
        let mut total_size_bytes = 0;

        for key in &keys {
            for entry in walkdir::WalkDir::new(self.cache_dir.join(key)) {
                let entry = entry?;
                if entry.file_type().is_file() {
                    total_size_bytes += entry.metadata()?.len();
                }
            }
        }

        Ok(CacheStats {
            total_entries: keys.len(),
            total_size_bytes,
        })
    }

    /// Remove all entries
    pub fn clean_all(&self) -> Result<()> {
        if self.cache_dir.exists() {
            fs::remove_dir_all(&self.cache_dir).with_context(|| {
                format!(
                    "Failed to remove cache directory: {}",
                    self.cache_dir.display()
                )
            })?;
        }
        fs::create_dir_all(&self.cache_dir).with_context(|| {
            format!(
                "Failed to recreate cache directory: {}",
                self.cache_dir.display()
            )
        })?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();

        for entry in fs::read_dir(&self.cache_dir).with_context(|| {
            format!(
                "Failed to read cache directory: {}",
                self.cache_dir.display()
            )
        })? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    keys.push(name.to_string());
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::descriptor::{DescriptorStore, StepDescriptor};
    use crate::pipeline::executor::StepOutcome;
    use std::time::Duration;
    use tempfile::TempDir;

    fn resolve(store: &DescriptorStore, id: &str, version: &str) -> ResolvedStep {
        let mut params = Params::new();
        params.insert("version".into(), version.into());
        store.resolve(id, &params).unwrap()
    }

    fn success(step: &ResolvedStep) -> ExecutionResult {
        ExecutionResult {
            step_id: step.id().to_string(),
            cache_key: step.cache_key(),
            outcome: StepOutcome::Succeeded,
            exit_code: 0,
            stdout: "installed\n".into(),
            stderr: String::new(),
            duration: Duration::from_millis(1500),
            cache_hit: false,
        }
    }

    fn neovim_store(command: &str) -> DescriptorStore {
        let mut store = DescriptorStore::new();
        store
            .register(StepDescriptor::new("install-neovim", command))
            .unwrap();
        store
    }

    #[test]
    fn test_store_and_lookup() {
        let temp = TempDir::new().unwrap();
        let cache = StepCache::new(temp.path().join("cache")).unwrap();
        let store = neovim_store("install nvim {{version}}");
        let step = resolve(&store, "install-neovim", "0.10.4");

        assert!(cache.lookup(&step).is_none());

        cache.store(&step, &success(&step), None).unwrap();

        let entry = cache.lookup(&step).unwrap();
        assert_eq!(entry.metadata.step_id, "install-neovim");
        assert_eq!(entry.metadata.result.stdout, "installed\n");
        assert!(entry.archive_path.is_none());

        // A different parameter value is a different entry
        let other = resolve(&store, "install-neovim", "0.9.5");
        assert!(cache.lookup(&other).is_none());
    }

    #[test]
    fn test_cache_persists_across_instances() {
        let temp = TempDir::new().unwrap();
        let store = neovim_store("install nvim {{version}}");
        let step = resolve(&store, "install-neovim", "0.10.4");

        StepCache::new(temp.path().to_path_buf())
            .unwrap()
            .store(&step, &success(&step), None)
            .unwrap();

        let reopened = StepCache::new(temp.path().to_path_buf()).unwrap();
        assert!(reopened.lookup(&step).is_some());
    }

    #[test]
    fn test_descriptor_change_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let cache = StepCache::new(temp.path().to_path_buf()).unwrap();

        let old = neovim_store("install nvim {{version}}");
        let step = resolve(&old, "install-neovim", "0.10.4");
        cache.store(&step, &success(&step), None).unwrap();

        let edited = neovim_store("install nvim {{version}} --verify");
        let edited_step = resolve(&edited, "install-neovim", "0.10.4");

        assert_eq!(step.cache_key(), edited_step.cache_key());
        assert!(cache.lookup(&edited_step).is_none());
    }

    #[test]
    fn test_corrupt_entry_is_a_miss_and_removed() {
        let temp = TempDir::new().unwrap();
        let cache = StepCache::new(temp.path().to_path_buf()).unwrap();
        let store = neovim_store("install nvim {{version}}");
        let step = resolve(&store, "install-neovim", "0.10.4");

        cache.store(&step, &success(&step), None).unwrap();
        let metadata_path = cache.dir().join(step.cache_key()).join(METADATA_FILE);
        fs::write(&metadata_path, "{ not json").unwrap();

        assert!(matches!(
            cache.get(&step.cache_key()),
            Err(StrataError::CacheCorruption { .. })
        ));
        assert!(cache.lookup(&step).is_none());
        assert!(!metadata_path.exists());
    }

    #[test]
    fn test_store_overwrites() {
        let temp = TempDir::new().unwrap();
        let cache = StepCache::new(temp.path().to_path_buf()).unwrap();
        let store = neovim_store("install nvim {{version}}");
        let step = resolve(&store, "install-neovim", "0.10.4");

        let mut first = success(&step);
        first.stdout = "first".into();
        cache.store(&step, &first, None).unwrap();

        let mut second = success(&step);
        second.stdout = "second".into();
        cache.store(&step, &second, None).unwrap();

        assert_eq!(cache.lookup(&step).unwrap().metadata.result.stdout, "second");
        assert_eq!(cache.stats().unwrap().total_entries, 1);
    }

    #[test]
    fn test_list_remove_step_and_clean() {
        let temp = TempDir::new().unwrap();
        let cache = StepCache::new(temp.path().to_path_buf()).unwrap();
        let store = neovim_store("install nvim {{version}}");

        for version in ["0.9.5", "0.10.4"] {
            let step = resolve(&store, "install-neovim", version);
            cache.store(&step, &success(&step), None).unwrap();
        }

        let entries = cache.list().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(cache.stats().unwrap().total_size_bytes > 0);

        assert_eq!(cache.remove_step("install-neovim").unwrap(), 2);
        assert!(cache.list().unwrap().is_empty());

        let step = resolve(&store, "install-neovim", "0.9.5");
        cache.store(&step, &success(&step), None).unwrap();
        cache.clean_all().unwrap();
        assert_eq!(cache.stats().unwrap().total_entries, 0);
    }
}
