//! Content-addressed repository layer for freight.
//!
//! This crate provides the Object Store Adapter: a sha-256 content-addressed
//! `ObjectStore` with atomic writes, tree and commit records with a
//! deterministic canonical encoding, ref storage with scoped transactions,
//! pull over `file://` and `http(s)://`, static delta superblocks, the
//! summary index a remote publishes, and the single-file bundle container.

pub mod bundle;
pub mod commit;
pub mod delta;
pub mod layout;
pub mod objects;
pub mod pull;
pub mod repo;
pub mod sign;
pub mod summary;
pub mod tree;

pub use bundle::{create_bundle, import_bundle, load_bundle, BundleInfo};
pub use commit::CommitRecord;
pub use delta::{
    apply_static_delta, delta_name, generate_static_delta, list_deltas, read_delta_superblock,
    rehome_delta, write_delta_superblock, DeltaPart, DeltaSuperblock,
};
pub use layout::{RepoLayout, RepoMode, STORE_FORMAT_VERSION};
pub use objects::ObjectStore;
pub use pull::{fetch_summary, file_url, pull, PullFlags, PullProgress, PullStats};
pub use repo::{CommitInfo, PruneReport, Repo, RepoTransaction};
pub use summary::{Summary, SummaryRef};
pub use tree::{
    checkout, closure_bytes, copy_tree, installed_size, tree_closure, CheckoutMode, CommitFilter,
    FileInfo, FilterResult, MutableTree, TreeEntry, TreeRecord,
};

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// On Linux with ext4 `data=ordered` (the default), renames are usually
/// durable without an explicit dir fsync, but POSIX does not guarantee this.
/// Calling `fsync()` on the parent directory makes the rename durable on
/// all filesystems and mount configurations.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Cooperative cancellation token passed into every long-running operation.
///
/// Cancellation is observed at suspension points (between object fetches,
/// between ref updates); the interrupted operation returns
/// [`StoreError::Cancelled`] and leaves the repository in a
/// pulled-but-not-deployed state that is safe to retry or prune.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), StoreError> {
        if self.is_cancelled() {
            Err(StoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("I/O error at {path}: {source}")]
    IoAt {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("integrity check failed for object '{hash}': expected {expected}, got {actual}")]
    IntegrityFailure {
        hash: String,
        expected: String,
        actual: String,
    },
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    #[error("ref not found: {0}")]
    RefNotFound(String),
    #[error("commit not found: {0}")]
    CommitNotFound(String),
    #[error("commit {0} is partial")]
    PartialCommit(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("invalid remote URL '{0}'")]
    InvalidUrl(String),
    #[error("signing failed: {0}")]
    SignFailed(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
}

impl StoreError {
    pub(crate) fn io_at(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        Self::IoAt {
            path: path.into(),
            source,
        }
    }
}

/// Lowercase sha-256 hex digest of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}
