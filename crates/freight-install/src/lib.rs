//! Installation directories for freight: on-disk layout, deploys, the
//! exports overlay, locking, and remote configuration.
//!
//! An installation hosts a content-addressed repository plus per-ref deploy
//! directories, a merged `exports/` symlink tree for desktop integration,
//! per-app overrides, and a keyfile config naming its remotes.

pub mod config;
pub mod deploy;
pub mod exports;
pub mod host;
pub mod installation;
pub mod monitor;

pub use config::{InstallationConfig, Remote, RemoteType};
pub use deploy::{subpaths_digest, DeployLock, OriginInfo};
pub use exports::update_exports;
pub use host::{
    installations_dir, HostContext, InstallationInfo, StorageType, SYSTEM_INSTALLATION_ID,
};
pub use installation::{InstalledRef, Installation, InstallationLock};
pub use monitor::FileMonitor;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("store error: {0}")]
    Store(#[from] freight_store::StoreError),
    #[error("keyfile error: {0}")]
    KeyFile(#[from] freight_schema::KeyFileError),
    #[error("ref error: {0}")]
    Ref(#[from] freight_schema::RefError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("I/O error at {path}: {source}")]
    IoAt {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("remote '{0}' not found")]
    RemoteNotFound(String),
    #[error("remote '{0}' has no valid URL")]
    InvalidRemote(String),
    #[error("ref '{0}' is not installed")]
    NotInstalled(String),
    #[error("ref '{0}' is already installed")]
    AlreadyInstalled(String),
    #[error("deploy of '{0}' is in use by a running instance")]
    DeployInUse(String),
    #[error("commit {0} is only partially pulled")]
    PartialCommit(String),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("invalid installation configuration: {0}")]
    InvalidConfig(String),
}

impl InstallError {
    pub(crate) fn io_at(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        Self::IoAt {
            path: path.into(),
            source,
        }
    }
}
