//! Deploy-level state: the origin keyfile, per-deploy locks, and the
//! subpaths digest that distinguishes partial checkouts.

use crate::InstallError;
use freight_schema::KeyFile;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

pub const ORIGIN_FILE: &str = "origin";
pub const DEPLOY_LOCK_FILE: &str = ".lock";
const GROUP_ORIGIN: &str = "Origin";

/// What a deploy records about where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginInfo {
    pub remote: String,
    pub ref_name: String,
    pub subpaths: Vec<String>,
    pub installed_size: u64,
}

impl OriginInfo {
    pub fn load(deploy_dir: &Path) -> Result<Self, InstallError> {
        let path = deploy_dir.join(ORIGIN_FILE);
        let text = std::fs::read_to_string(&path).map_err(|e| InstallError::io_at(&path, e))?;
        let kf = KeyFile::parse(&text)?;
        Ok(Self {
            remote: kf.require(GROUP_ORIGIN, "remote")?.to_owned(),
            ref_name: kf.require(GROUP_ORIGIN, "ref")?.to_owned(),
            subpaths: kf.get_list(GROUP_ORIGIN, "subpaths"),
            installed_size: kf.get_u64(GROUP_ORIGIN, "installed-size")?.unwrap_or(0),
        })
    }

    pub fn save(&self, deploy_dir: &Path) -> Result<(), InstallError> {
        let mut kf = KeyFile::new();
        kf.set(GROUP_ORIGIN, "remote", self.remote.clone());
        kf.set(GROUP_ORIGIN, "ref", self.ref_name.clone());
        if !self.subpaths.is_empty() {
            kf.set_list(GROUP_ORIGIN, "subpaths", &self.subpaths);
        }
        kf.set(GROUP_ORIGIN, "installed-size", self.installed_size.to_string());
        let path = deploy_dir.join(ORIGIN_FILE);
        std::fs::write(&path, kf.to_text()).map_err(|e| InstallError::io_at(&path, e))?;
        Ok(())
    }
}

/// Digest suffix appended to a deploy directory name when the checkout is
/// restricted to subpaths, so differently-subsetted deploys of the same
/// commit coexist.
pub fn subpaths_digest(subpaths: &[String]) -> Option<String> {
    if subpaths.is_empty() {
        return None;
    }
    let mut sorted = subpaths.to_vec();
    sorted.sort();
    let joined = sorted.join("\n");
    Some(freight_store::sha256_hex(joined.as_bytes())[..12].to_owned())
}

/// Name of the deploy directory for a commit and subpath set.
pub fn deploy_dir_name(commit: &str, subpaths: &[String]) -> String {
    match subpaths_digest(subpaths) {
        Some(digest) => format!("{commit}-{digest}"),
        None => commit.to_owned(),
    }
}

/// Advisory lock on one deploy directory.
///
/// Running instances hold the lock shared; undeploy upgrades to exclusive
/// and fails fast when any shared holder exists.
pub struct DeployLock {
    _file: File,
}

impl DeployLock {
    fn open(deploy_dir: &Path) -> Result<File, InstallError> {
        let path = deploy_dir.join(DEPLOY_LOCK_FILE);
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| InstallError::io_at(&path, e))
    }

    /// Shared lock held while an app from this deploy is running.
    pub fn acquire_shared(deploy_dir: &Path) -> Result<Self, InstallError> {
        let file = Self::open(deploy_dir)?;
        file.lock_shared()
            .map_err(|e| InstallError::LockFailed(e.to_string()))?;
        Ok(Self { _file: file })
    }

    /// Exclusive lock for mutation; `None` when a shared holder exists.
    pub fn try_acquire_exclusive(deploy_dir: &Path) -> Result<Option<Self>, InstallError> {
        let file = Self::open(deploy_dir)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { _file: file })),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let origin = OriginInfo {
            remote: "test-repo".to_owned(),
            ref_name: "app/org.test.Hello/x86_64/master".to_owned(),
            subpaths: vec!["/de".to_owned(), "/fr".to_owned()],
            installed_size: 4096,
        };
        origin.save(dir.path()).unwrap();
        let back = OriginInfo::load(dir.path()).unwrap();
        assert_eq!(back, origin);
    }

    #[test]
    fn origin_without_subpaths() {
        let dir = tempfile::tempdir().unwrap();
        let origin = OriginInfo {
            remote: "r".to_owned(),
            ref_name: "app/a.b.C/x86_64/master".to_owned(),
            subpaths: vec![],
            installed_size: 0,
        };
        origin.save(dir.path()).unwrap();
        assert!(OriginInfo::load(dir.path()).unwrap().subpaths.is_empty());
    }

    #[test]
    fn subpaths_digest_is_order_insensitive() {
        let a = subpaths_digest(&["/de".to_owned(), "/fr".to_owned()]);
        let b = subpaths_digest(&["/fr".to_owned(), "/de".to_owned()]);
        assert_eq!(a, b);
        assert!(a.is_some());
        assert_eq!(subpaths_digest(&[]), None);
    }

    #[test]
    fn deploy_dir_name_with_and_without_digest() {
        let commit = "ab".repeat(32);
        assert_eq!(deploy_dir_name(&commit, &[]), commit);
        let named = deploy_dir_name(&commit, &["/de".to_owned()]);
        assert!(named.starts_with(&commit));
        assert_eq!(named.len(), commit.len() + 1 + 12);
    }

    #[test]
    fn shared_holder_blocks_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let _shared = DeployLock::acquire_shared(dir.path()).unwrap();
        let exclusive = DeployLock::try_acquire_exclusive(dir.path()).unwrap();
        assert!(exclusive.is_none());
    }

    #[test]
    fn exclusive_after_shared_released() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _shared = DeployLock::acquire_shared(dir.path()).unwrap();
        }
        assert!(DeployLock::try_acquire_exclusive(dir.path())
            .unwrap()
            .is_some());
    }
}
