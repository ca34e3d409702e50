//! The summary index a repository publishes: every ref, its current commit,
//! sizes, and enough metadata for dependency resolution without a pull.

use crate::repo::Repo;
use crate::{CancelToken, StoreError};
use freight_schema::variant::{
    Variant, OSTREE_ENDOFLIFE, OSTREE_ENDOFLIFE_REBASE, XA_DOWNLOAD_SIZE, XA_INSTALLED_SIZE,
    XA_METADATA, XA_TOKEN_TYPE,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Per-ref entry in the summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRef {
    pub commit: String,
    #[serde(default)]
    pub installed_size: u64,
    #[serde(default)]
    pub download_size: u64,
    /// Contents of the artifact's metadata keyfile, for resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eol_rebase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<i32>,
}

/// The signed index listing every ref a remote publishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    pub refs: BTreeMap<String, SummaryRef>,
    #[serde(default)]
    pub generated_at: i64,
}

impl Summary {
    pub fn from_bytes(data: &[u8]) -> Result<Self, StoreError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Load the summary stored at the repository root, if any.
    pub fn load(repo: &Repo) -> Result<Option<Self>, StoreError> {
        let path = repo.layout().summary_path();
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&path).map_err(|e| StoreError::io_at(&path, e))?;
        Ok(Some(Self::from_bytes(&data)?))
    }

    /// Rebuild the summary from the repository's refs and write it atomically.
    pub fn regenerate(repo: &Repo, cancel: &CancelToken) -> Result<Self, StoreError> {
        let mut summary = Summary {
            collection_id: repo.collection_id().map(str::to_owned),
            refs: BTreeMap::new(),
            generated_at: chrono::Utc::now().timestamp(),
        };
        for (refstr, commit_id) in repo.list_refs(None)? {
            cancel.check()?;
            let info = match repo.load_commit(&commit_id) {
                Ok(info) => info,
                Err(e) => {
                    warn!("summary: skipping {refstr}: {e}");
                    continue;
                }
            };
            if info.partial {
                warn!("summary: skipping partial commit for {refstr}");
                continue;
            }
            let md = &info.record.metadata;
            summary.refs.insert(
                refstr,
                SummaryRef {
                    commit: commit_id,
                    installed_size: md.get(XA_INSTALLED_SIZE).and_then(Variant::as_u64).unwrap_or(0),
                    download_size: md.get(XA_DOWNLOAD_SIZE).and_then(Variant::as_u64).unwrap_or(0),
                    metadata: md.get(XA_METADATA).and_then(|v| v.as_str()).map(str::to_owned),
                    eol: md.get(OSTREE_ENDOFLIFE).and_then(|v| v.as_str()).map(str::to_owned),
                    eol_rebase: md
                        .get(OSTREE_ENDOFLIFE_REBASE)
                        .and_then(|v| v.as_str())
                        .map(str::to_owned),
                    token_type: md.get(XA_TOKEN_TYPE).and_then(|v| match v {
                        Variant::I32(t) => Some(*t),
                        _ => None,
                    }),
                },
            );
        }
        let path = repo.layout().summary_path();
        repo.layout().write_atomic(&path, &summary.to_bytes()?)?;
        info!("summary regenerated with {} refs", summary.refs.len());
        Ok(summary)
    }

    /// Sign the stored summary, writing `summary.sig` beside it.
    pub fn sign(repo: &Repo, key_id: &str, homedir: Option<&std::path::Path>) -> Result<(), StoreError> {
        let path = repo.layout().summary_path();
        let data = std::fs::read(&path).map_err(|e| StoreError::io_at(&path, e))?;
        let sig = crate::sign::sign_detached(&data, key_id, homedir)?;
        let sig_path = path.with_extension("sig");
        repo.layout().write_atomic(&sig_path, &sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::MutableTree;
    use freight_schema::CommitMetadata;

    fn repo_with_ref() -> (tempfile::TempDir, Repo, String) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("repo")).unwrap();
        let build = dir.path().join("build");
        std::fs::create_dir_all(build.join("files")).unwrap();
        std::fs::write(build.join("files/a"), b"content").unwrap();
        let mut mtree = MutableTree::new();
        mtree.write_directory(repo.objects(), &build, None).unwrap();
        let root = mtree.finalize(repo.objects()).unwrap();
        let mut metadata = CommitMetadata::new();
        metadata.insert(XA_INSTALLED_SIZE.to_owned(), Variant::U64(7));
        metadata.insert(XA_DOWNLOAD_SIZE.to_owned(), Variant::U64(100));
        metadata.insert(XA_METADATA.to_owned(), Variant::str("[Application]\nname=org.test.Hello\n"));
        let commit = repo
            .write_commit(None, "s", "", metadata, &root, Some(1_700_000_000))
            .unwrap();
        repo.set_ref(None, "app/org.test.Hello/x86_64/master", Some(&commit))
            .unwrap();
        (dir, repo, commit)
    }

    #[test]
    fn regenerate_lists_refs_with_sizes() {
        let (_dir, repo, commit) = repo_with_ref();
        let summary = Summary::regenerate(&repo, &CancelToken::new()).unwrap();
        let entry = &summary.refs["app/org.test.Hello/x86_64/master"];
        assert_eq!(entry.commit, commit);
        assert_eq!(entry.installed_size, 7);
        assert_eq!(entry.download_size, 100);
        assert!(entry.metadata.as_deref().unwrap().contains("org.test.Hello"));
    }

    #[test]
    fn regenerate_writes_loadable_file() {
        let (_dir, repo, _commit) = repo_with_ref();
        let written = Summary::regenerate(&repo, &CancelToken::new()).unwrap();
        let loaded = Summary::load(&repo).unwrap().unwrap();
        assert_eq!(loaded, written);
    }

    #[test]
    fn load_absent_summary_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("repo")).unwrap();
        assert!(Summary::load(&repo).unwrap().is_none());
    }

    #[test]
    fn partial_commits_are_skipped() {
        let (_dir, repo, commit) = repo_with_ref();
        repo.mark_partial(&commit, true).unwrap();
        let summary = Summary::regenerate(&repo, &CancelToken::new()).unwrap();
        assert!(summary.refs.is_empty());
    }

    #[test]
    fn bytes_roundtrip() {
        let (_dir, repo, _commit) = repo_with_ref();
        let summary = Summary::regenerate(&repo, &CancelToken::new()).unwrap();
        let bytes = summary.to_bytes().unwrap();
        assert_eq!(Summary::from_bytes(&bytes).unwrap(), summary);
    }
}
