//! The process-launch contract and instance registry for freight.
//!
//! The core never spawns the sandbox itself: it builds a launch descriptor
//! (argv/env/mounts for the external bubble-wrapper binary plus an instance
//! info keyfile) and tracks live instances in a per-boot registry.

pub mod instance;
pub mod launch;

pub use instance::{Instance, InstanceRegistry};
pub use launch::{build_launch_descriptor, bwrap_path, LaunchDescriptor, LaunchOptions};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("installation error: {0}")]
    Install(#[from] freight_install::InstallError),
    #[error("keyfile error: {0}")]
    KeyFile(#[from] freight_schema::KeyFileError),
    #[error("metadata error: {0}")]
    Metadata(#[from] freight_schema::MetadataError),
    #[error("ref error: {0}")]
    Ref(#[from] freight_schema::RefError),
    #[error("app '{0}' is not installed")]
    NotInstalled(String),
    #[error("app '{0}' declares no command")]
    NoCommand(String),
    #[error("runtime '{0}' is not installed")]
    RuntimeMissing(String),
    #[error("instance {0} not found")]
    InstanceNotFound(u64),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
}
