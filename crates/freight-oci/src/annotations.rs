//! The annotation/label mapping between commit metadata and OCI documents.
//!
//! Commit facts travel as `org.flatpak.*` annotations on the manifest; each
//! metadata entry is carried as `org.flatpak.metadata.<key>` holding the
//! base64 of the entry's serialized variant bytes. Registries that index
//! labels rather than annotations get the same information replicated into
//! the image config, plus human-readable size and metadata labels.

use crate::{
    OciError, ANNOTATION_BODY, ANNOTATION_COMMIT, ANNOTATION_METADATA_PREFIX,
    ANNOTATION_PARENT_COMMIT, ANNOTATION_REF, ANNOTATION_SUBJECT, ANNOTATION_TIMESTAMP,
    LABEL_DOWNLOAD_SIZE, LABEL_INSTALLED_SIZE, LABEL_METADATA,
};
use base64::Engine;
use freight_schema::variant::{Variant, XA_DOWNLOAD_SIZE, XA_INSTALLED_SIZE, XA_METADATA};
use freight_schema::CommitMetadata;
use std::collections::BTreeMap;
use tracing::warn;

/// Label keys replicated from commit metadata when present.
pub const LABEL_KEYS: &[&str] = &[
    crate::ANNOTATION_REF,
    LABEL_INSTALLED_SIZE,
    LABEL_DOWNLOAD_SIZE,
    LABEL_METADATA,
];

/// The commit facts carried on an OCI image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitAnnotations {
    pub ref_name: Option<String>,
    pub commit: Option<String>,
    pub parent_commit: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<i64>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub metadata: CommitMetadata,
}

impl CommitAnnotations {
    /// Serialize into manifest annotations.
    pub fn to_annotations(&self) -> BTreeMap<String, String> {
        let engine = base64::engine::general_purpose::STANDARD;
        let mut out = BTreeMap::new();
        if let Some(ref r) = self.ref_name {
            out.insert(ANNOTATION_REF.to_owned(), r.clone());
        }
        if let Some(ref c) = self.commit {
            out.insert(ANNOTATION_COMMIT.to_owned(), c.clone());
        }
        if let Some(ref p) = self.parent_commit {
            out.insert(ANNOTATION_PARENT_COMMIT.to_owned(), p.clone());
        }
        if let Some(ts) = self.timestamp {
            out.insert(ANNOTATION_TIMESTAMP.to_owned(), ts.to_string());
        }
        if let Some(ref s) = self.subject {
            out.insert(ANNOTATION_SUBJECT.to_owned(), s.clone());
        }
        if let Some(ref b) = self.body {
            out.insert(ANNOTATION_BODY.to_owned(), b.clone());
        }
        for (key, value) in &self.metadata {
            out.insert(
                format!("{ANNOTATION_METADATA_PREFIX}{key}"),
                engine.encode(value.to_bytes()),
            );
        }
        out
    }

    /// Reconstruct from manifest annotations. Missing fields are tolerated;
    /// undecodable metadata entries are dropped with a warning.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        let engine = base64::engine::general_purpose::STANDARD;
        let mut result = Self {
            ref_name: annotations.get(ANNOTATION_REF).cloned(),
            commit: annotations.get(ANNOTATION_COMMIT).cloned(),
            parent_commit: annotations.get(ANNOTATION_PARENT_COMMIT).cloned(),
            timestamp: annotations
                .get(ANNOTATION_TIMESTAMP)
                .and_then(|t| t.parse().ok()),
            subject: annotations.get(ANNOTATION_SUBJECT).cloned(),
            body: annotations.get(ANNOTATION_BODY).cloned(),
            metadata: CommitMetadata::new(),
        };
        for (key, value) in annotations {
            let Some(meta_key) = key.strip_prefix(ANNOTATION_METADATA_PREFIX) else {
                continue;
            };
            let decoded = match engine.decode(value) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("dropping undecodable metadata annotation '{key}': {e}");
                    continue;
                }
            };
            match Variant::from_bytes(&decoded) {
                Ok(variant) => {
                    result.metadata.insert(meta_key.to_owned(), variant);
                }
                Err(e) => warn!("dropping malformed metadata annotation '{key}': {e}"),
            }
        }
        result
    }

    /// Replicate into image-config labels: the full annotation set plus the
    /// well-known readable keys when the metadata carries them.
    pub fn to_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.to_annotations();
        if let Some(size) = self.metadata.get(XA_INSTALLED_SIZE).and_then(Variant::as_u64) {
            labels.insert(LABEL_INSTALLED_SIZE.to_owned(), size.to_string());
        }
        if let Some(size) = self.metadata.get(XA_DOWNLOAD_SIZE).and_then(Variant::as_u64) {
            labels.insert(LABEL_DOWNLOAD_SIZE.to_owned(), size.to_string());
        }
        if let Some(md) = self.metadata.get(XA_METADATA).and_then(Variant::as_str) {
            labels.insert(LABEL_METADATA.to_owned(), md.to_owned());
        }
        labels
    }

    /// Reconstruct from labels; the readable duplicates are ignored in
    /// favour of the encoded metadata entries.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        Self::from_annotations(labels)
    }

    /// Strict parse for callers that need the commit id present.
    pub fn require_commit(&self) -> Result<&str, OciError> {
        self.commit
            .as_deref()
            .ok_or_else(|| OciError::InvalidData("missing org.flatpak.commit annotation".to_owned()))
    }
}
