//! The repository facade: refs, commits, transactions, and pruning over the
//! object store.

use crate::commit::CommitRecord;
use crate::layout::{RepoConfig, RepoLayout, RepoMode};
use crate::objects::ObjectStore;
use crate::tree::{tree_closure, TreeRecord};
use crate::{CancelToken, StoreError};
use freight_schema::{CommitMetadata, CommitId};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// A loaded commit plus its pull-state flag.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub record: CommitRecord,
    /// Set while a pull is in flight; partial commits are rejected by
    /// deploy and publish paths.
    pub partial: bool,
}

/// Result of a prune pass.
#[derive(Debug, Default)]
pub struct PruneReport {
    pub objects_scanned: usize,
    pub objects_removed: usize,
    pub bytes_freed: u64,
}

/// An opened repository.
pub struct Repo {
    layout: RepoLayout,
    objects: ObjectStore,
    config: RepoConfig,
}

impl Repo {
    /// Open an existing repository, creating the layout if absent.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let layout = RepoLayout::new(path);
        layout.initialize()?;
        let config = layout.load_config()?;
        let mut objects = ObjectStore::new(layout.clone());
        objects.set_disable_fsync(config.disable_fsync);
        Ok(Self {
            layout,
            objects,
            config,
        })
    }

    /// Create a repository with an explicit mode.
    pub fn create(path: impl Into<PathBuf>, mode: RepoMode) -> Result<Self, StoreError> {
        let mut repo = Self::open(path)?;
        repo.config.mode = mode;
        repo.layout.save_config(&repo.config)?;
        Ok(repo)
    }

    pub fn layout(&self) -> &RepoLayout {
        &self.layout
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    pub fn mode(&self) -> RepoMode {
        self.config.mode
    }

    pub fn collection_id(&self) -> Option<&str> {
        self.config.collection_id.as_deref()
    }

    pub fn set_collection_id(&mut self, id: Option<String>) -> Result<(), StoreError> {
        self.config.collection_id = id;
        self.layout.save_config(&self.config)
    }

    pub fn set_disable_fsync(&mut self, disable: bool) -> Result<(), StoreError> {
        self.config.disable_fsync = disable;
        self.objects.set_disable_fsync(disable);
        self.layout.save_config(&self.config)
    }

    fn ref_path(&self, refstr: &str) -> PathBuf {
        let mut path = self.layout.refs_dir();
        for part in refstr.split('/') {
            path.push(part);
        }
        path
    }

    /// Enumerate refs, optionally restricted to a `/`-separated prefix.
    pub fn list_refs(&self, prefix: Option<&str>) -> Result<BTreeMap<String, String>, StoreError> {
        let mut out = BTreeMap::new();
        let base = self.layout.refs_dir();
        if !base.exists() {
            return Ok(out);
        }
        let mut stack = vec![base.clone()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir).map_err(|e| StoreError::io_at(&dir, e))? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&base) {
                    let Some(refstr) = rel.to_str() else { continue };
                    if let Some(p) = prefix {
                        if !(refstr == p || refstr.starts_with(&format!("{p}/"))) {
                            continue;
                        }
                    }
                    let commit = fs::read_to_string(&path)
                        .map_err(|e| StoreError::io_at(&path, e))?
                        .trim()
                        .to_owned();
                    out.insert(refstr.to_owned(), commit);
                }
            }
        }
        Ok(out)
    }

    /// Resolve a ref to its commit id.
    ///
    /// With `allow_missing`, an absent ref yields `Ok(None)` instead of
    /// [`StoreError::RefNotFound`].
    pub fn resolve_rev(
        &self,
        refstr: &str,
        allow_missing: bool,
    ) -> Result<Option<String>, StoreError> {
        let path = self.ref_path(refstr);
        if !path.exists() {
            if allow_missing {
                return Ok(None);
            }
            return Err(StoreError::RefNotFound(refstr.to_owned()));
        }
        let commit = fs::read_to_string(&path)
            .map_err(|e| StoreError::io_at(&path, e))?
            .trim()
            .to_owned();
        Ok(Some(commit))
    }

    /// Point a ref at a commit, or delete it with `commit = None`.
    ///
    /// `collection` is recorded for diagnostics only; refs live in a single
    /// namespace and the collection binding travels in commit metadata.
    pub fn set_ref(
        &self,
        collection: Option<&str>,
        refstr: &str,
        commit: Option<&str>,
    ) -> Result<(), StoreError> {
        let path = self.ref_path(refstr);
        match commit {
            Some(id) => {
                if !CommitId::is_valid(id) {
                    return Err(StoreError::InvalidData(format!(
                        "'{id}' is not a valid commit checksum"
                    )));
                }
                debug!(
                    "set ref {refstr} -> {} (collection {:?})",
                    &id[..8],
                    collection
                );
                self.layout.write_atomic(&path, format!("{id}\n").as_bytes())?;
            }
            None => {
                if path.exists() {
                    fs::remove_file(&path).map_err(|e| StoreError::io_at(&path, e))?;
                }
                // Drop now-empty parents up to refs/heads.
                let base = self.layout.refs_dir();
                let mut dir = path.parent().map(PathBuf::from);
                while let Some(d) = dir {
                    if d == base || fs::remove_dir(&d).is_err() {
                        break;
                    }
                    dir = d.parent().map(PathBuf::from);
                }
            }
        }
        Ok(())
    }

    pub fn load_commit(&self, commit_id: &str) -> Result<CommitInfo, StoreError> {
        let record = CommitRecord::load(&self.objects, commit_id)?;
        Ok(CommitInfo {
            record,
            partial: self.is_partial(commit_id),
        })
    }

    /// Load the root tree of a commit.
    pub fn read_commit(&self, commit_id: &str) -> Result<TreeRecord, StoreError> {
        let info = self.load_commit(commit_id)?;
        TreeRecord::load(&self.objects, &info.record.root_tree)
    }

    /// Write a commit object. The caller has already finalized the root tree.
    pub fn write_commit(
        &self,
        parent: Option<&str>,
        subject: &str,
        body: &str,
        metadata: CommitMetadata,
        root_tree: &str,
        timestamp: Option<i64>,
    ) -> Result<String, StoreError> {
        let record = CommitRecord {
            parent: parent.map(str::to_owned),
            subject: subject.to_owned(),
            body: body.to_owned(),
            metadata,
            root_tree: root_tree.to_owned(),
            timestamp: timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp()),
        };
        let id = record.store(&self.objects)?;
        info!("wrote commit {}", &id[..8]);
        Ok(id)
    }

    fn partial_marker(&self, commit_id: &str) -> PathBuf {
        self.layout
            .state_dir()
            .join(format!("{commit_id}.commitpartial"))
    }

    pub fn is_partial(&self, commit_id: &str) -> bool {
        self.partial_marker(commit_id).exists()
    }

    pub fn mark_partial(&self, commit_id: &str, partial: bool) -> Result<(), StoreError> {
        let marker = self.partial_marker(commit_id);
        if partial {
            self.layout.write_atomic(&marker, b"")?;
        } else if marker.exists() {
            fs::remove_file(&marker).map_err(|e| StoreError::io_at(&marker, e))?;
        }
        Ok(())
    }

    /// Number of stored objects in a commit closure that currently have
    /// additional hardlinks (i.e. are shared with live checkouts).
    pub fn scan_hardlinks(&self, commit_id: &str) -> Result<usize, StoreError> {
        use std::os::unix::fs::MetadataExt;
        let info = self.load_commit(commit_id)?;
        let mut shared = 0;
        for id in tree_closure(&self.objects, &info.record.root_tree)? {
            let path = self.objects.object_path(&id);
            if let Ok(meta) = fs::metadata(&path) {
                if meta.nlink() > 1 {
                    shared += 1;
                }
            }
        }
        Ok(shared)
    }

    /// Begin a scoped ref transaction guarded by the repository lock.
    pub fn transaction(&self) -> Result<RepoTransaction<'_>, StoreError> {
        let lock_path = self.layout.lock_file();
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StoreError::io_at(&lock_path, e))?;
        file.lock_exclusive()
            .map_err(|e| StoreError::LockFailed(e.to_string()))?;
        Ok(RepoTransaction {
            repo: self,
            _lock: file,
            staged: Vec::new(),
            committed: false,
        })
    }

    /// Remove objects unreachable from any ref, plus stale partial markers.
    pub fn prune(&self, cancel: &CancelToken) -> Result<PruneReport, StoreError> {
        let mut live: std::collections::HashSet<String> = std::collections::HashSet::new();
        for commit_id in self.list_refs(None)?.values() {
            cancel.check()?;
            live.insert(commit_id.clone());
            match self.load_commit(commit_id) {
                Ok(info) => {
                    for id in tree_closure(&self.objects, &info.record.root_tree)? {
                        live.insert(id);
                    }
                }
                Err(e) => warn!("prune: skipping unreadable commit {commit_id}: {e}"),
            }
        }

        let mut report = PruneReport::default();
        for hash in self.objects.list()? {
            cancel.check()?;
            report.objects_scanned += 1;
            if !live.contains(&hash) {
                let bytes = self.objects.size(&hash).unwrap_or(0);
                self.objects.remove(&hash)?;
                if self.is_partial(&hash) {
                    self.mark_partial(&hash, false)?;
                }
                report.objects_removed += 1;
                report.bytes_freed += bytes;
            }
        }
        info!(
            "prune: removed {} of {} objects ({} bytes)",
            report.objects_removed, report.objects_scanned, report.bytes_freed
        );
        Ok(report)
    }

    /// Sign a commit with an external gpg key; the detached signature is
    /// stored under `signatures/`.
    pub fn sign_commit(
        &self,
        commit_id: &str,
        key_id: &str,
        homedir: Option<&std::path::Path>,
    ) -> Result<(), StoreError> {
        let data = self.objects.get(commit_id)?;
        let sig = crate::sign::sign_detached(&data, key_id, homedir)?;
        let path = self.layout.signatures_dir().join(format!("{commit_id}.sig"));
        self.layout.write_atomic(&path, &sig)
    }
}

/// Scoped ref-update transaction: updates stage in memory and apply on
/// [`commit`](Self::commit); dropping without committing discards them and
/// releases the repository lock.
pub struct RepoTransaction<'a> {
    repo: &'a Repo,
    _lock: fs::File,
    staged: Vec<(Option<String>, String, Option<String>)>,
    committed: bool,
}

impl RepoTransaction<'_> {
    pub fn set_ref(&mut self, collection: Option<&str>, refstr: &str, commit: Option<&str>) {
        self.staged.push((
            collection.map(str::to_owned),
            refstr.to_owned(),
            commit.map(str::to_owned),
        ));
    }

    pub fn commit(mut self) -> Result<(), StoreError> {
        for (collection, refstr, commit) in std::mem::take(&mut self.staged) {
            self.repo
                .set_ref(collection.as_deref(), &refstr, commit.as_deref())?;
        }
        self.committed = true;
        Ok(())
    }

    pub fn abort(self) {
        // Drop releases the lock; staged updates are discarded.
    }
}

impl Drop for RepoTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.staged.is_empty() {
            debug!("repo transaction dropped; {} staged ref updates discarded", self.staged.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::MutableTree;
    use freight_schema::variant::{Variant, XA_REF};

    fn test_repo() -> (tempfile::TempDir, Repo) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("repo")).unwrap();
        (dir, repo)
    }

    fn write_sample_commit(dir: &std::path::Path, repo: &Repo, content: &[u8]) -> String {
        let build = dir.join("build");
        fs::create_dir_all(build.join("files")).unwrap();
        fs::write(build.join("files/data"), content).unwrap();
        let mut mtree = MutableTree::new();
        mtree.write_directory(repo.objects(), &build, None).unwrap();
        let root = mtree.finalize(repo.objects()).unwrap();
        let mut metadata = CommitMetadata::new();
        metadata.insert(XA_REF.to_owned(), Variant::str("app/org.test.Hello/x86_64/master"));
        repo.write_commit(None, "test", "", metadata, &root, Some(1_700_000_000))
            .unwrap()
    }

    #[test]
    fn set_and_resolve_ref() {
        let (dir, repo) = test_repo();
        let commit = write_sample_commit(dir.path(), &repo, b"x");
        repo.set_ref(None, "app/org.test.Hello/x86_64/master", Some(&commit))
            .unwrap();
        let resolved = repo
            .resolve_rev("app/org.test.Hello/x86_64/master", false)
            .unwrap();
        assert_eq!(resolved.as_deref(), Some(commit.as_str()));
    }

    #[test]
    fn resolve_missing_ref() {
        let (_dir, repo) = test_repo();
        assert!(repo
            .resolve_rev("app/org.x.Y/x86_64/master", true)
            .unwrap()
            .is_none());
        assert!(matches!(
            repo.resolve_rev("app/org.x.Y/x86_64/master", false),
            Err(StoreError::RefNotFound(_))
        ));
    }

    #[test]
    fn set_ref_rejects_bad_checksum() {
        let (_dir, repo) = test_repo();
        assert!(repo
            .set_ref(None, "app/org.x.Y/x86_64/master", Some("nothex"))
            .is_err());
    }

    #[test]
    fn delete_ref_cleans_empty_dirs() {
        let (dir, repo) = test_repo();
        let commit = write_sample_commit(dir.path(), &repo, b"x");
        repo.set_ref(None, "app/org.test.Hello/x86_64/master", Some(&commit))
            .unwrap();
        repo.set_ref(None, "app/org.test.Hello/x86_64/master", None)
            .unwrap();
        assert!(repo.list_refs(None).unwrap().is_empty());
        assert!(!repo.layout().refs_dir().join("app").exists());
    }

    #[test]
    fn list_refs_with_prefix() {
        let (dir, repo) = test_repo();
        let commit = write_sample_commit(dir.path(), &repo, b"x");
        repo.set_ref(None, "app/org.test.Hello/x86_64/master", Some(&commit))
            .unwrap();
        repo.set_ref(None, "runtime/org.test.Platform/x86_64/master", Some(&commit))
            .unwrap();
        let apps = repo.list_refs(Some("app")).unwrap();
        assert_eq!(apps.len(), 1);
        let all = repo.list_refs(None).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn partial_marker_roundtrip() {
        let (dir, repo) = test_repo();
        let commit = write_sample_commit(dir.path(), &repo, b"x");
        assert!(!repo.is_partial(&commit));
        repo.mark_partial(&commit, true).unwrap();
        assert!(repo.load_commit(&commit).unwrap().partial);
        repo.mark_partial(&commit, false).unwrap();
        assert!(!repo.is_partial(&commit));
    }

    #[test]
    fn transaction_applies_on_commit() {
        let (dir, repo) = test_repo();
        let commit = write_sample_commit(dir.path(), &repo, b"x");
        let mut tx = repo.transaction().unwrap();
        tx.set_ref(None, "app/org.test.Hello/x86_64/master", Some(&commit));
        tx.commit().unwrap();
        assert_eq!(repo.list_refs(None).unwrap().len(), 1);
    }

    #[test]
    fn transaction_abort_discards() {
        let (dir, repo) = test_repo();
        let commit = write_sample_commit(dir.path(), &repo, b"x");
        {
            let mut tx = repo.transaction().unwrap();
            tx.set_ref(None, "app/org.test.Hello/x86_64/master", Some(&commit));
            tx.abort();
        }
        assert!(repo.list_refs(None).unwrap().is_empty());
    }

    #[test]
    fn prune_removes_unreferenced_objects() {
        let (dir, repo) = test_repo();
        let live = write_sample_commit(dir.path(), &repo, b"live");
        repo.set_ref(None, "app/org.test.Hello/x86_64/master", Some(&live))
            .unwrap();
        // An orphan object with no referencing commit.
        repo.objects().put(b"orphan data").unwrap();

        let report = repo.prune(&CancelToken::new()).unwrap();
        assert_eq!(report.objects_removed, 1);
        assert!(report.bytes_freed > 0);
        // Referenced commit closure survives.
        assert!(repo.load_commit(&live).is_ok());
    }

    #[test]
    fn prune_observes_cancellation() {
        let (_dir, repo) = test_repo();
        repo.objects().put(b"data").unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            repo.prune(&cancel),
            Err(StoreError::Cancelled)
        ));
    }

    #[test]
    fn collection_id_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut repo = Repo::open(dir.path().join("repo")).unwrap();
            repo.set_collection_id(Some("org.test.Collection".to_owned()))
                .unwrap();
        }
        let repo = Repo::open(dir.path().join("repo")).unwrap();
        assert_eq!(repo.collection_id(), Some("org.test.Collection"));
    }
}
