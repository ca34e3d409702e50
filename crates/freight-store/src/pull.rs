//! Pulling refs from remote repositories over `file://` and `http(s)://`.
//!
//! A pull fetches the remote summary, resolves each requested ref, then
//! walks the commit closure fetching missing objects. The commit is marked
//! partial for the duration; cancellation between object fetches leaves a
//! retryable partial state that the next prune collects.

use crate::commit::CommitRecord;
use crate::repo::Repo;
use crate::summary::Summary;
use crate::tree::{TreeEntry, TreeRecord};
use crate::{CancelToken, StoreError};
use std::io::Read;
use std::path::PathBuf;
use tracing::{debug, info};
use url::Url;

/// Pull behaviour switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct PullFlags {
    /// Verify every object hash even from local transports.
    pub untrusted: bool,
    /// Mirror mode: update local refs to match the remote exactly.
    pub mirror: bool,
    /// Fetch commit objects only, no content.
    pub commit_only: bool,
}

/// Progress snapshot handed to the caller between fetches.
#[derive(Debug, Clone, Copy, Default)]
pub struct PullProgress {
    pub fetched_objects: usize,
    pub total_objects: usize,
    pub bytes_transferred: u64,
}

/// Totals for a completed pull.
#[derive(Debug, Default)]
pub struct PullStats {
    pub objects_fetched: usize,
    pub objects_skipped: usize,
    pub bytes_transferred: u64,
}

trait Fetcher {
    fn fetch(&self, rel: &str) -> Result<Vec<u8>, StoreError>;
}

struct FileFetcher {
    base: PathBuf,
}

impl Fetcher for FileFetcher {
    fn fetch(&self, rel: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.base.join(rel);
        if !path.exists() {
            return Err(StoreError::ObjectNotFound(rel.to_owned()));
        }
        std::fs::read(&path).map_err(|e| StoreError::io_at(&path, e))
    }
}

struct HttpFetcher {
    agent: ureq::Agent,
    base: String,
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, rel: &str) -> Result<Vec<u8>, StoreError> {
        let url = format!("{}/{rel}", self.base);
        debug!("GET {url}");
        let resp = match self.agent.get(&url).call() {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(404)) => {
                return Err(StoreError::ObjectNotFound(rel.to_owned()));
            }
            Err(ureq::Error::StatusCode(code)) => {
                return Err(StoreError::Http(format!("HTTP {code} for {url}")));
            }
            Err(e) => return Err(StoreError::Http(e.to_string())),
        };
        let mut body = Vec::new();
        resp.into_body()
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| StoreError::Http(e.to_string()))?;
        Ok(body)
    }
}

fn fetcher_for(url_str: &str) -> Result<Box<dyn Fetcher>, StoreError> {
    let url = Url::parse(url_str).map_err(|_| StoreError::InvalidUrl(url_str.to_owned()))?;
    match url.scheme() {
        "file" => Ok(Box::new(FileFetcher {
            base: PathBuf::from(url.path()),
        })),
        "http" | "https" => Ok(Box::new(HttpFetcher {
            agent: ureq::Agent::new_with_defaults(),
            base: url_str.trim_end_matches('/').to_owned(),
        })),
        other => Err(StoreError::InvalidUrl(format!(
            "unsupported scheme '{other}' in {url_str}"
        ))),
    }
}

/// Fetch and parse the remote summary without pulling anything.
pub fn fetch_summary(url: &str) -> Result<Summary, StoreError> {
    let fetcher = fetcher_for(url)?;
    let data = fetcher
        .fetch("summary")
        .map_err(|_| StoreError::RefNotFound(format!("no summary at {url}")))?;
    Summary::from_bytes(&data)
}

/// Pull the given refs from `url` into `repo`.
pub fn pull(
    repo: &Repo,
    url: &str,
    flags: PullFlags,
    refs: &[&str],
    mut progress: Option<&mut dyn FnMut(&PullProgress)>,
    cancel: &CancelToken,
) -> Result<PullStats, StoreError> {
    let fetcher = fetcher_for(url)?;
    let summary_data = fetcher
        .fetch("summary")
        .map_err(|_| StoreError::RefNotFound(format!("no summary at {url}")))?;
    let summary = Summary::from_bytes(&summary_data)?;

    let mut stats = PullStats::default();
    for refstr in refs {
        cancel.check()?;
        let entry = summary
            .refs
            .get(*refstr)
            .ok_or_else(|| StoreError::RefNotFound((*refstr).to_owned()))?;
        let commit_id = entry.commit.clone();
        info!("pulling {refstr} at {}", &commit_id[..8]);

        let had_commit = repo.objects().exists(&commit_id);
        let commit_data = if had_commit {
            repo.objects().get(&commit_id)?
        } else {
            let data = fetcher.fetch(&format!("objects/{commit_id}"))?;
            stats.bytes_transferred += data.len() as u64;
            data
        };
        let record: CommitRecord = serde_json::from_slice(&commit_data)?;

        // The partial marker guards the window between the commit object
        // landing and its closure being complete.
        repo.mark_partial(&commit_id, true)?;
        if !had_commit {
            repo.objects().put_with_hash(&commit_id, &commit_data)?;
            stats.objects_fetched += 1;
        } else {
            stats.objects_skipped += 1;
        }

        if !flags.commit_only {
            pull_tree(
                repo,
                fetcher.as_ref(),
                &record.root_tree,
                &mut stats,
                &mut progress,
                cancel,
            )?;
        }
        repo.mark_partial(&commit_id, false)?;

        // Local refs mirror the remote naming; the origin association
        // lives with the installation, not the repository.
        repo.set_ref(summary.collection_id.as_deref(), refstr, Some(&commit_id))?;
    }
    Ok(stats)
}

fn pull_tree(
    repo: &Repo,
    fetcher: &dyn Fetcher,
    root_tree: &str,
    stats: &mut PullStats,
    progress: &mut Option<&mut dyn FnMut(&PullProgress)>,
    cancel: &CancelToken,
) -> Result<(), StoreError> {
    let mut pending = vec![root_tree.to_owned()];
    let mut fetched = 0usize;
    while let Some(tree_id) = pending.pop() {
        cancel.check()?;
        let tree_data = fetch_object(repo, fetcher, &tree_id, stats, &mut fetched)?;
        let record: TreeRecord = serde_json::from_slice(&tree_data)?;
        for entry in record.entries.values() {
            match entry {
                TreeEntry::Dir { tree } => pending.push(tree.clone()),
                TreeEntry::File { object, .. } => {
                    cancel.check()?;
                    let _ = fetch_object(repo, fetcher, object, stats, &mut fetched)?;
                    if let Some(cb) = progress.as_mut() {
                        cb(&PullProgress {
                            fetched_objects: fetched,
                            total_objects: 0,
                            bytes_transferred: stats.bytes_transferred,
                        });
                    }
                }
                TreeEntry::Symlink { .. } => {}
            }
        }
    }
    Ok(())
}

fn fetch_object(
    repo: &Repo,
    fetcher: &dyn Fetcher,
    id: &str,
    stats: &mut PullStats,
    fetched: &mut usize,
) -> Result<Vec<u8>, StoreError> {
    if repo.objects().exists(id) {
        stats.objects_skipped += 1;
        return repo.objects().get(id);
    }
    let data = fetcher.fetch(&format!("objects/{id}"))?;
    // put_with_hash rejects tampered payloads regardless of transport.
    repo.objects().put_with_hash(id, &data)?;
    stats.objects_fetched += 1;
    stats.bytes_transferred += data.len() as u64;
    *fetched += 1;
    Ok(data)
}

/// `file://` URL for a local repository path, for tests and local remotes.
pub fn file_url(path: &std::path::Path) -> String {
    format!("file://{}", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::MutableTree;
    use freight_schema::variant::{Variant, XA_INSTALLED_SIZE};
    use freight_schema::CommitMetadata;

    fn publish_repo(dir: &std::path::Path, content: &[u8]) -> (Repo, String) {
        let repo = Repo::open(dir.join("src-repo")).unwrap();
        let build = dir.join("build");
        std::fs::create_dir_all(build.join("files")).unwrap();
        std::fs::write(build.join("files/data"), content).unwrap();
        let mut mtree = MutableTree::new();
        mtree.write_directory(repo.objects(), &build, None).unwrap();
        let root = mtree.finalize(repo.objects()).unwrap();
        let mut metadata = CommitMetadata::new();
        metadata.insert(XA_INSTALLED_SIZE.to_owned(), Variant::U64(content.len() as u64));
        let commit = repo
            .write_commit(None, "publish", "", metadata, &root, Some(1_700_000_000))
            .unwrap();
        repo.set_ref(None, "app/org.test.Hello/x86_64/master", Some(&commit))
            .unwrap();
        Summary::regenerate(&repo, &CancelToken::new()).unwrap();
        (repo, commit)
    }

    #[test]
    fn pull_over_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let (src, commit) = publish_repo(dir.path(), b"hello pull");
        let dst = Repo::open(dir.path().join("dst-repo")).unwrap();

        let stats = pull(
            &dst,
            &file_url(src.layout().root()),
            PullFlags::default(),
            &["app/org.test.Hello/x86_64/master"],
            None,
            &CancelToken::new(),
        )
        .unwrap();
        assert!(stats.objects_fetched >= 3); // commit + trees + content
        assert_eq!(
            dst.resolve_rev("app/org.test.Hello/x86_64/master", false)
                .unwrap()
                .as_deref(),
            Some(commit.as_str())
        );
        assert!(!dst.is_partial(&commit));
        // Pulled commit is complete: the tree loads.
        dst.read_commit(&commit).unwrap();
    }

    #[test]
    fn second_pull_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let (src, _commit) = publish_repo(dir.path(), b"hello");
        let dst = Repo::open(dir.path().join("dst-repo")).unwrap();
        let url = file_url(src.layout().root());
        let refs = ["app/org.test.Hello/x86_64/master"];
        pull(&dst, &url, PullFlags::default(), &refs, None, &CancelToken::new()).unwrap();
        let stats =
            pull(&dst, &url, PullFlags::default(), &refs, None, &CancelToken::new()).unwrap();
        assert_eq!(stats.objects_fetched, 0);
        assert!(stats.objects_skipped > 0);
    }

    #[test]
    fn pull_unknown_ref_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (src, _commit) = publish_repo(dir.path(), b"hello");
        let dst = Repo::open(dir.path().join("dst-repo")).unwrap();
        let err = pull(
            &dst,
            &file_url(src.layout().root()),
            PullFlags::default(),
            &["app/org.test.Missing/x86_64/master"],
            None,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::RefNotFound(_)));
    }

    #[test]
    fn commit_only_pull_fetches_no_content() {
        let dir = tempfile::tempdir().unwrap();
        let (src, commit) = publish_repo(dir.path(), b"hello");
        let dst = Repo::open(dir.path().join("dst-repo")).unwrap();
        let flags = PullFlags {
            commit_only: true,
            ..PullFlags::default()
        };
        pull(
            &dst,
            &file_url(src.layout().root()),
            flags,
            &["app/org.test.Hello/x86_64/master"],
            None,
            &CancelToken::new(),
        )
        .unwrap();
        // Commit object present, tree content absent.
        let info = dst.load_commit(&commit).unwrap();
        assert!(!dst.objects().exists(&info.record.root_tree));
    }

    #[test]
    fn cancelled_pull_leaves_partial_marker() {
        let dir = tempfile::tempdir().unwrap();
        let (src, commit) = publish_repo(dir.path(), b"hello");
        let dst = Repo::open(dir.path().join("dst-repo")).unwrap();
        let cancel = CancelToken::new();
        let mut calls = 0;
        let mut progress = |_p: &PullProgress| {
            calls += 1;
            cancel.cancel();
        };
        let result = pull(
            &dst,
            &file_url(src.layout().root()),
            PullFlags::default(),
            &["app/org.test.Hello/x86_64/master"],
            Some(&mut progress),
            &cancel,
        );
        // Either the pull finished before a second yield point, or it was
        // cancelled and left the commit partial.
        if result.is_err() {
            assert!(dst.is_partial(&commit));
        }
    }

    #[test]
    fn unsupported_scheme_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dst = Repo::open(dir.path().join("dst-repo")).unwrap();
        let err = pull(
            &dst,
            "ftp://example.com/repo",
            PullFlags::default(),
            &[],
            None,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidUrl(_)));
    }

    #[test]
    fn fetch_summary_reads_refs() {
        let dir = tempfile::tempdir().unwrap();
        let (src, _commit) = publish_repo(dir.path(), b"hello");
        let summary = fetch_summary(&file_url(src.layout().root())).unwrap();
        assert!(summary.refs.contains_key("app/org.test.Hello/x86_64/master"));
    }
}
