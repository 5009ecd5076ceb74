//! Dependency cache keyed by a content hash of the dependency manifests
//!
//! Layout: `<root>/<key>/meta.json` plus `<root>/<key>/data/<path>` for every
//! cached checkout-relative path. Entries are written to a temporary
//! directory first and renamed into place, so readers never see a partial
//! entry.

use crate::error::{FixtureError, Result};
use crate::fsutil::{copy_path, remove_path};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const META_FILE: &str = "meta.json";
const DATA_DIR: &str = "data";

/// `<prefix>-<sha256 hex>` over the dependency manifests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    prefix: String,
    digest: String,
}

impl CacheKey {
    /// Hash `manifests` (checkout-relative, in the given order). A missing
    /// manifest hashes differently from an empty one. The prefix becomes part
    /// of a directory name, so it must be a single path component.
    pub fn compute(prefix: &str, checkout: &Path, manifests: &[String]) -> Result<Self> {
        let valid_prefix = !prefix.is_empty()
            && prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            && prefix != "."
            && prefix != "..";
        if !valid_prefix {
            return Err(FixtureError::cache(format!(
                "Invalid cache key prefix '{}'",
                prefix
            )));
        }

        let mut hasher = Sha256::new();
        for manifest in manifests {
            hasher.update(manifest.as_bytes());
            hasher.update(b"\0");
            match std::fs::read(checkout.join(manifest)) {
                Ok(contents) => {
                    hasher.update(b"present\0");
                    hasher.update(&contents);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(manifest = %manifest, "Dependency manifest not found");
                    hasher.update(b"missing\0");
                }
                Err(e) => return Err(e.into()),
            }
            hasher.update(b"\0");
        }

        Ok(CacheKey {
            prefix: prefix.to_string(),
            digest: hex::encode(hasher.finalize()),
        })
    }

    /// Key prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.prefix, self.digest)
    }
}

/// Metadata of a stored entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Full key
    pub key: String,
    /// Prefix of the key
    pub prefix: String,
    /// When the entry was saved
    pub created_at: DateTime<Utc>,
    /// Checkout-relative paths stored in the entry
    pub paths: Vec<String>,
}

/// Result of a restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CacheOutcome {
    /// The exact key was restored
    Hit {
        /// Restored key
        key: String,
    },
    /// Another entry was restored in place of the missing key
    Fallback {
        /// Requested key
        key: String,
        /// Key actually restored
        from: String,
    },
    /// Nothing was restored
    Miss {
        /// Requested key
        key: String,
    },
    /// Caching is turned off
    Disabled,
}

impl CacheOutcome {
    /// True only for an exact hit
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheOutcome::Hit { .. })
    }
}

/// Directory-backed cache store
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Store rooted at `root`; created on first save
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// All readable entries, newest first. Unreadable entries are skipped.
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let dir = match std::fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for item in dir {
            let path = item?.path();
            let meta = path.join(META_FILE);
            if !meta.is_file() {
                continue;
            }
            match std::fs::read(&meta)
                .map_err(FixtureError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<CacheEntry>(&bytes)?))
            {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(path = %meta.display(), "Skipping unreadable cache entry: {}", e),
            }
        }

        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.key.cmp(&b.key)));
        Ok(entries)
    }

    /// The entry to restore for `key`: the exact key, else the newest entry
    /// with the same prefix, else the newest entry overall
    pub fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let wanted = key.to_string();
        let entries = self.entries()?;

        if let Some(exact) = entries.iter().find(|e| e.key == wanted) {
            return Ok(Some(exact.clone()));
        }
        if let Some(same_prefix) = entries.iter().find(|e| e.prefix == key.prefix()) {
            return Ok(Some(same_prefix.clone()));
        }
        Ok(entries.into_iter().next())
    }

    /// Restore the entry for `key` into `checkout`
    pub fn restore(&self, key: &CacheKey, checkout: &Path) -> Result<CacheOutcome> {
        let wanted = key.to_string();
        let Some(entry) = self.lookup(key)? else {
            info!(key = %wanted, "Cache miss, nothing to restore");
            return Ok(CacheOutcome::Miss { key: wanted });
        };

        let data = self.root.join(&entry.key).join(DATA_DIR);
        for path in &entry.paths {
            let source = data.join(path);
            if !source.exists() {
                continue;
            }
            let target = checkout.join(path);
            remove_path(&target)?;
            copy_path(&source, &target)?;
            debug!(path = %path, "Restored cached path");
        }

        if entry.key == wanted {
            info!(key = %wanted, "Cache hit");
            Ok(CacheOutcome::Hit { key: wanted })
        } else {
            info!(key = %wanted, from = %entry.key, "Cache miss, restored fallback entry");
            Ok(CacheOutcome::Fallback {
                key: wanted,
                from: entry.key,
            })
        }
    }

    /// Store `paths` of `checkout` under `key`, replacing an existing entry
    pub fn save(&self, key: &CacheKey, checkout: &Path, paths: &[String]) -> Result<CacheEntry> {
        std::fs::create_dir_all(&self.root)?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.root)?;

        let data = staging.path().join(DATA_DIR);
        std::fs::create_dir_all(&data)?;
        let mut saved = Vec::new();
        for path in paths {
            let source = checkout.join(path);
            if !source.exists() {
                warn!(path = %path, "Cache path does not exist, skipping");
                continue;
            }
            copy_path(&source, &data.join(path))?;
            saved.push(path.clone());
        }

        let entry = CacheEntry {
            key: key.to_string(),
            prefix: key.prefix().to_string(),
            created_at: Utc::now(),
            paths: saved,
        };
        std::fs::write(
            staging.path().join(META_FILE),
            serde_json::to_vec_pretty(&entry)?,
        )?;

        let target = self.root.join(&entry.key);
        remove_path(&target)?;
        // The emptied staging dir is ignored by TempDir's drop
        std::fs::rename(staging.path(), &target).map_err(|e| {
            FixtureError::cache(format!("Failed to move cache entry into place: {}", e))
        })?;

        info!(key = %entry.key, paths = entry.paths.len(), "Saved cache entry");
        Ok(entry)
    }
}
