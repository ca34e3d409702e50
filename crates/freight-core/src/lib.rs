//! The transaction engine and dependency resolver for freight.
//!
//! A transaction is built from user intents (install, update, uninstall,
//! install-bundle), expanded by the resolver into a dependency-ordered
//! operation graph, and run against an installation with synchronous hook
//! callbacks at every decision point.

pub mod concurrency;
pub mod resolver;
pub mod transaction;

pub use concurrency::{install_signal_handler, shutdown_token};
pub use resolver::{related_refs_for, RelatedRef};
pub use transaction::{
    OpKind, OpResult, Operation, Transaction, TransactionHooks, TransactionState,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("ref error: {0}")]
    Ref(#[from] freight_schema::RefError),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("keyfile error: {0}")]
    KeyFile(#[from] freight_schema::KeyFileError),
    #[error("metadata error: {0}")]
    Metadata(#[from] freight_schema::MetadataError),
    #[error("store error: {0}")]
    Store(#[from] freight_store::StoreError),
    #[error("installation error: {0}")]
    Install(#[from] freight_install::InstallError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("remote '{0}' not found")]
    RemoteNotFound(String),
    #[error("'{0}' is already installed")]
    AlreadyInstalled(String),
    #[error("'{0}' is not installed")]
    NotInstalled(String),
    #[error("content for '{0}' was pulled but not deployed")]
    OnlyPulled(String),
    #[error("runtime '{runtime}' is used by '{used_by}'")]
    RuntimeUsed { runtime: String, used_by: String },
    #[error("'{ref_name}' is available from remote '{available}' rather than '{requested}'")]
    DifferentRemote {
        ref_name: String,
        requested: String,
        available: String,
    },
    #[error("transaction aborted")]
    Aborted,
    #[error("'{0}' requires a newer client (needs {1})")]
    NeedNewFormat(String, String),
    #[error("authentication failed for '{0}'")]
    AuthenticationFailed(String),
    #[error("circular dependency involving '{0}'")]
    CircularDependency(String),
    #[error("operation on '{ref_name}' from '{remote}' failed: {source}")]
    OpFailed {
        ref_name: String,
        remote: String,
        #[source]
        source: Box<CoreError>,
    },
}

impl CoreError {
    /// Wrap an operation failure with its ref and remote context.
    pub(crate) fn in_op(self, ref_name: &str, remote: &str) -> Self {
        CoreError::OpFailed {
            ref_name: ref_name.to_owned(),
            remote: remote.to_owned(),
            source: Box::new(self),
        }
    }
}
