//! Ref model, keyfile wire format, application metadata, and commit metadata
//! variants for freight.
//!
//! This crate provides the naming layer: the four-tuple `Ref` with parsing,
//! validation and cached formatting, the GKeyFile-style `KeyFile` used by
//! every on-disk configuration surface, the application `metadata` model
//! (extensions, extra-data sources), the `Variant` values attached to every
//! published commit, and the per-app `Overrides` model.

pub mod keyfile;
pub mod metadata;
pub mod overrides;
pub mod refs;
pub mod types;
pub mod variant;

pub use keyfile::{KeyFile, KeyFileError};
pub use metadata::{
    parse_metadata, AppMetadata, ExtensionInfo, ExtraDataSource, MetadataError,
};
pub use overrides::{BusPolicy, Overrides, PermissionToggle};
pub use refs::{Decomposed, Ref, RefError, RefKind};
pub use types::{CollectionId, CommitId};
pub use variant::{CommitMetadata, ExtraDataRecord, Variant, VariantError};
