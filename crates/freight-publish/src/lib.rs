//! Publishing: build-tree export into commits, commit rewriting between
//! repositories, and appstream index generation.

pub mod appstream;
pub mod commit_from;
pub mod export;
pub mod glob;

pub use appstream::regenerate_appstream;
pub use commit_from::{commit_from, CommitFromOptions, CommitFromOutcome};
pub use export::{export, ExportOptions};
pub use glob::glob_match;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("store error: {0}")]
    Store(#[from] freight_store::StoreError),
    #[error("metadata error: {0}")]
    Metadata(#[from] freight_schema::MetadataError),
    #[error("keyfile error: {0}")]
    KeyFile(#[from] freight_schema::KeyFileError),
    #[error("ref error: {0}")]
    Ref(#[from] freight_schema::RefError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("build directory is missing '{0}'")]
    MissingBuildInput(String),
    #[error("invalid desktop file '{file}': {reason}")]
    InvalidDesktopFile { file: String, reason: String },
    #[error("icon validation failed for '{0}'")]
    InvalidIcon(String),
    #[error("'{0}' already exists with a different kind")]
    ConflictingRef(String),
    #[error("source commit {0} is only partially pulled")]
    PartialCommit(String),
}
