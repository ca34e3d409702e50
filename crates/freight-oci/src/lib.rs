//! OCI interop: typed image-spec schemas and the two-way mapping between
//! commit metadata and OCI annotations/labels.

pub mod annotations;
pub mod arch;
pub mod delta;
pub mod spec;

pub use annotations::{CommitAnnotations, LABEL_KEYS};
pub use arch::{arch_to_oci, oci_to_arch};
pub use delta::{find_delta_layer, find_delta_manifest};
pub use spec::{
    Descriptor, Image, ImageConfig, Index, Manifest, Platform, RootFs, Signature,
    SignatureCritical, SignatureImage,
};

use thiserror::Error;

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_MANIFEST_DOCKER: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

pub const ANNOTATION_REF: &str = "org.flatpak.ref";
pub const ANNOTATION_COMMIT: &str = "org.flatpak.commit";
pub const ANNOTATION_PARENT_COMMIT: &str = "org.flatpak.parent-commit";
pub const ANNOTATION_TIMESTAMP: &str = "org.flatpak.timestamp";
pub const ANNOTATION_SUBJECT: &str = "org.flatpak.subject";
pub const ANNOTATION_BODY: &str = "org.flatpak.body";
pub const ANNOTATION_METADATA_PREFIX: &str = "org.flatpak.metadata.";

pub const LABEL_INSTALLED_SIZE: &str = "org.flatpak.installed-size";
pub const LABEL_DOWNLOAD_SIZE: &str = "org.flatpak.download-size";
pub const LABEL_METADATA: &str = "org.flatpak.metadata";

pub const DELTA_ANNOTATION_FROM: &str = "io.github.containers.delta.from";
pub const DELTA_ANNOTATION_TO: &str = "io.github.containers.delta.to";
pub const DELTA_ANNOTATION_TARGET: &str = "io.github.containers.delta.target";

#[derive(Debug, Error)]
pub enum OciError {
    #[error("invalid OCI document: {0}")]
    InvalidData(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unsupported media type '{0}'")]
    UnsupportedMediaType(String),
    #[error("variant error: {0}")]
    Variant(#[from] freight_schema::VariantError),
}

/// `sha256:`-prefixed digest of a serialized blob.
pub fn blob_digest(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_digest_has_prefix() {
        let d = blob_digest(b"");
        assert!(d.starts_with("sha256:"));
        assert_eq!(d.len(), 7 + 64);
    }
}
