use crate::layout::RepoLayout;
use crate::{fsync_dir, sha256_hex, StoreError};
use std::fs;
use std::io::Write;
use tempfile::NamedTempFile;

/// Content-addressable object store backed by sha-256 hashing.
///
/// Objects are stored as files named by their sha-256 hash. Writes are atomic
/// via `NamedTempFile`, and reads verify integrity by recomputing the hash.
pub struct ObjectStore {
    layout: RepoLayout,
    disable_fsync: bool,
}

impl ObjectStore {
    pub fn new(layout: RepoLayout) -> Self {
        Self {
            layout,
            disable_fsync: false,
        }
    }

    pub fn set_disable_fsync(&mut self, disable: bool) {
        self.disable_fsync = disable;
    }

    /// Store data and return its sha-256 hash. Idempotent — existing objects are skipped.
    pub fn put(&self, data: &[u8]) -> Result<String, StoreError> {
        let hash = sha256_hex(data);
        self.put_with_hash(&hash, data)?;
        Ok(hash)
    }

    /// Store data under a caller-asserted hash, verifying it first.
    pub fn put_with_hash(&self, hash: &str, data: &[u8]) -> Result<(), StoreError> {
        let actual = sha256_hex(data);
        if actual != hash {
            return Err(StoreError::IntegrityFailure {
                hash: hash.to_owned(),
                expected: hash.to_owned(),
                actual,
            });
        }
        let dir = self.layout.objects_dir();
        let dest = dir.join(hash);
        if dest.exists() {
            return Ok(());
        }
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        if !self.disable_fsync {
            tmp.as_file().sync_all()?;
        }
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        if !self.disable_fsync {
            fsync_dir(&dir)?;
        }
        Ok(())
    }

    /// Retrieve data by hash, verifying integrity on read.
    pub fn get(&self, hash: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.layout.objects_dir().join(hash);
        if !path.exists() {
            return Err(StoreError::ObjectNotFound(hash.to_owned()));
        }
        let data = fs::read(&path).map_err(|e| StoreError::io_at(&path, e))?;
        let actual = sha256_hex(&data);
        if actual != hash {
            return Err(StoreError::IntegrityFailure {
                hash: hash.to_owned(),
                expected: hash.to_owned(),
                actual,
            });
        }
        Ok(data)
    }

    pub fn exists(&self, hash: &str) -> bool {
        self.layout.objects_dir().join(hash).exists()
    }

    /// On-disk size of an object, without reading it.
    pub fn size(&self, hash: &str) -> Result<u64, StoreError> {
        let path = self.layout.objects_dir().join(hash);
        let meta = fs::metadata(&path).map_err(|_| StoreError::ObjectNotFound(hash.to_owned()))?;
        Ok(meta.len())
    }

    /// Absolute path of the stored object, for hardlink checkouts.
    pub fn object_path(&self, hash: &str) -> std::path::PathBuf {
        self.layout.objects_dir().join(hash)
    }

    pub fn remove(&self, hash: &str) -> Result<(), StoreError> {
        let path = self.layout.objects_dir().join(hash);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| StoreError::io_at(&path, e))?;
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.layout.objects_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut hashes = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| StoreError::io_at(&dir, e))? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    hashes.push(name.to_owned());
                }
            }
        }
        hashes.sort();
        Ok(hashes)
    }
}
