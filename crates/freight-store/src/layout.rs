use crate::{fsync_dir, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current repository format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";
const CONFIG_FILE: &str = "config.json";

/// How checked-out content relates to the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoMode {
    /// Objects only; deploys are materialized elsewhere.
    Archive,
    /// Objects are checkout-ready; deploys hardlink into the store.
    Bare,
}

#[derive(Debug, Serialize, Deserialize)]
struct RepoVersion {
    format_version: u32,
}

/// Persisted repository configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct RepoConfig {
    #[serde(default)]
    pub mode: RepoMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(default)]
    pub disable_fsync: bool,
}

impl Default for RepoMode {
    fn default() -> Self {
        RepoMode::Bare
    }
}

/// Directory layout for a freight content-addressed repository.
///
/// All subdirectories are created lazily on [`initialize`](Self::initialize).
#[derive(Debug, Clone)]
pub struct RepoLayout {
    root: PathBuf,
}

impl RepoLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    #[inline]
    pub fn refs_dir(&self) -> PathBuf {
        self.root.join("refs").join("heads")
    }

    #[inline]
    pub fn deltas_dir(&self) -> PathBuf {
        self.root.join("deltas")
    }

    #[inline]
    pub fn signatures_dir(&self) -> PathBuf {
        self.root.join("signatures")
    }

    /// Sidecar markers for in-progress pulls (`{commit}.commitpartial`).
    #[inline]
    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    /// Temporary staging area for transactions and checkouts.
    #[inline]
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    #[inline]
    pub fn summary_path(&self) -> PathBuf {
        self.root.join("summary")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    #[inline]
    pub(crate) fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.objects_dir())?;
        fs::create_dir_all(self.refs_dir())?;
        fs::create_dir_all(self.deltas_dir())?;
        fs::create_dir_all(self.signatures_dir())?;
        fs::create_dir_all(self.state_dir())?;
        fs::create_dir_all(self.staging_dir())?;

        let version_path = self.root.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = RepoVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            self.write_atomic(&version_path, content.as_bytes())?;
        }
        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.root.join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)
            .map_err(|e| StoreError::io_at(&version_path, e))?;
        let ver: RepoVersion = serde_json::from_str(&content)?;
        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }

    pub(crate) fn load_config(&self) -> Result<RepoConfig, StoreError> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(RepoConfig::default());
        }
        let content = fs::read_to_string(&path).map_err(|e| StoreError::io_at(&path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub(crate) fn save_config(&self, config: &RepoConfig) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(config)?;
        self.write_atomic(&self.config_path(), content.as_bytes())
    }

    /// Atomic write via tempfile + rename + parent fsync.
    pub(crate) fn write_atomic(&self, dest: &Path, data: &[u8]) -> Result<(), StoreError> {
        let dir = dest
            .parent()
            .ok_or_else(|| StoreError::InvalidData("destination has no parent".to_owned()))?;
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_correct() {
        let layout = RepoLayout::new("/tmp/freight-test/repo");
        assert_eq!(
            layout.objects_dir(),
            PathBuf::from("/tmp/freight-test/repo/objects")
        );
        assert_eq!(
            layout.refs_dir(),
            PathBuf::from("/tmp/freight-test/repo/refs/heads")
        );
        assert_eq!(
            layout.deltas_dir(),
            PathBuf::from("/tmp/freight-test/repo/deltas")
        );
        assert_eq!(
            layout.summary_path(),
            PathBuf::from("/tmp/freight-test/repo/summary")
        );
    }

    #[test]
    fn initialize_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(dir.path());
        layout.initialize().unwrap();
        assert!(layout.objects_dir().is_dir());
        assert!(layout.refs_dir().is_dir());
        assert!(layout.deltas_dir().is_dir());
        assert!(layout.staging_dir().is_dir());
    }

    #[test]
    fn initialize_writes_version() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(dir.path());
        layout.initialize().unwrap();
        layout.verify_version().unwrap();
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(dir.path());
        layout.initialize().unwrap();
        layout.initialize().unwrap();
        layout.verify_version().unwrap();
    }

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(dir.path());
        layout.initialize().unwrap();
        let mut cfg = layout.load_config().unwrap();
        assert!(cfg.collection_id.is_none());
        cfg.collection_id = Some("org.test.Collection".to_owned());
        cfg.mode = RepoMode::Archive;
        layout.save_config(&cfg).unwrap();
        let back = layout.load_config().unwrap();
        assert_eq!(back.collection_id.as_deref(), Some("org.test.Collection"));
        assert_eq!(back.mode, RepoMode::Archive);
    }
}
