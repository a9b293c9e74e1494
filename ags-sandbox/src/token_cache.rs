//! On-disk cache of data plane access tokens
//!
//! Tokens are stored per instance id in `~/.ags/tokens.json` so a sandbox
//! created by one invocation can be reused by a later `--instance` run.

use crate::error::{Result, SandboxError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

const CACHE_FILE: &str = "tokens.json";
const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenEntry {
    access_token: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheData {
    version: u32,
    #[serde(default)]
    tokens: HashMap<String, TokenEntry>,
}

impl Default for CacheData {
    fn default() -> Self {
        Self {
            version: CACHE_VERSION,
            tokens: HashMap::new(),
        }
    }
}

/// File-backed token cache; safe to share between tasks
#[derive(Debug)]
pub struct TokenCache {
    path: PathBuf,
    lock: RwLock<()>,
}

impl TokenCache {
    /// Cache in the default location under the home directory
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| SandboxError::Cache("cannot determine home directory".to_string()))?;
        Ok(Self::at(
            home.join(ags_common::config::CONFIG_DIR).join(CACHE_FILE),
        ))
    }

    /// Cache at an explicit path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, instance_id: &str) -> Option<String> {
        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());
        self.load()
            .tokens
            .get(instance_id)
            .map(|entry| entry.access_token.clone())
    }

    pub fn set(&self, instance_id: &str, token: &str) -> Result<()> {
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());
        let mut data = self.load();
        data.tokens.insert(
            instance_id.to_string(),
            TokenEntry {
                access_token: token.to_string(),
                created_at: Utc::now(),
            },
        );
        self.save(&data)
    }

    pub fn delete(&self, instance_id: &str) -> Result<()> {
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());
        let mut data = self.load();
        if data.tokens.remove(instance_id).is_none() {
            return Ok(());
        }
        self.save(&data)
    }

    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());
        self.save(&CacheData::default())
    }

    /// Cached instance ids, sorted
    pub fn list(&self) -> Vec<String> {
        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = self.load().tokens.into_keys().collect();
        ids.sort();
        ids
    }

    // Missing or unreadable files are treated as an empty cache.
    fn load(&self) -> CacheData {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return CacheData::default(),
        };
        match serde_json::from_str(&content) {
            Ok(data) => data,
            Err(e) => {
                warn!(path = %self.path.display(), "Ignoring corrupt token cache: {}", e);
                CacheData::default()
            }
        }
    }

    // Written to a 0600 temp file next to the cache, then renamed over it.
    fn save(&self, data: &CacheData) -> Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        create_private_dir(parent).map_err(|e| {
            SandboxError::Cache(format!("failed to create {}: {}", parent.display(), e))
        })?;

        let content = serde_json::to_string_pretty(data)?;
        let write_err = |e: std::io::Error| {
            SandboxError::Cache(format!("failed to write {}: {}", self.path.display(), e))
        };
        let mut file = tempfile::NamedTempFile::new_in(parent).map_err(write_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(write_err)?;
        }
        file.write_all(content.as_bytes()).map_err(write_err)?;
        file.as_file().sync_all().map_err(write_err)?;
        file.persist(&self.path).map_err(|e| write_err(e.error))?;

        debug!(path = %self.path.display(), entries = data.tokens.len(), "Saved token cache");
        Ok(())
    }
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::at(dir.path().join("nested").join("tokens.json"));

        assert_eq!(cache.get("sbx-1"), None);
        cache.set("sbx-1", "tok-1").unwrap();
        cache.set("sbx-2", "tok-2").unwrap();
        assert_eq!(cache.get("sbx-1").as_deref(), Some("tok-1"));
        assert_eq!(cache.list(), vec!["sbx-1".to_string(), "sbx-2".to_string()]);

        cache.delete("sbx-1").unwrap();
        assert_eq!(cache.get("sbx-1"), None);
        cache.delete("never-existed").unwrap();

        cache.clear().unwrap();
        assert!(cache.list().is_empty());
    }

    #[test]
    fn test_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        TokenCache::at(&path).set("sbx", "tok").unwrap();
        assert_eq!(TokenCache::at(&path).get("sbx").as_deref(), Some("tok"));
    }

    #[test]
    fn test_corrupt_file_is_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, "{not json").unwrap();

        let cache = TokenCache::at(&path);
        assert_eq!(cache.get("sbx"), None);
        cache.set("sbx", "tok").unwrap();
        assert_eq!(cache.get("sbx").as_deref(), Some("tok"));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        TokenCache::at(&path).set("sbx", "tok").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_new_directory_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join(".ags");
        let path = cache_dir.join("tokens.json");
        TokenCache::at(&path).set("sbx", "tok").unwrap();

        let mode = std::fs::metadata(&cache_dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let cache = TokenCache::at(&path);
        cache.set("sbx-1", "tok-1").unwrap();
        cache.set("sbx-2", "tok-2").unwrap();
        cache.delete("sbx-1").unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["tokens.json".to_string()]);
        assert_eq!(cache.list(), vec!["sbx-2".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_rewrite_replaces_loose_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, "{}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        TokenCache::at(&path).set("sbx", "tok").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
