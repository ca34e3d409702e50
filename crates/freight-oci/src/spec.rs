//! Typed OCI image-spec documents: descriptor, manifest, index, image
//! configuration, and the signature envelope.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn is_empty_map(map: &BTreeMap<String, String>) -> bool {
    map.is_empty()
}

/// A content descriptor referencing a blob by digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "is_empty_map")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

/// `application/vnd.oci.image.manifest.v1+json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "is_empty_map")]
    pub annotations: BTreeMap<String, String>,
}

impl Manifest {
    pub fn new(config: Descriptor) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(crate::MEDIA_TYPE_MANIFEST.to_owned()),
            config,
            layers: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, crate::OciError> {
        let manifest: Self = serde_json::from_slice(data)?;
        if let Some(ref mt) = manifest.media_type {
            if mt != crate::MEDIA_TYPE_MANIFEST && mt != crate::MEDIA_TYPE_MANIFEST_DOCKER {
                return Err(crate::OciError::UnsupportedMediaType(mt.clone()));
            }
        }
        Ok(manifest)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, crate::OciError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// `application/vnd.oci.image.index.v1+json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "is_empty_map")]
    pub annotations: BTreeMap<String, String>,
}

impl Index {
    pub fn new() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(crate::MEDIA_TYPE_INDEX.to_owned()),
            manifests: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, crate::OciError> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "is_empty_map")]
    pub labels: BTreeMap<String, String>,
}

/// `application/vnd.oci.image.config.v1+json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub config: ImageConfig,
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
}

impl Image {
    pub fn parse(data: &[u8]) -> Result<Self, crate::OciError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, crate::OciError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// The image being attested by a signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SignatureImage {
    pub docker_manifest_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SignatureCritical {
    #[serde(rename = "type")]
    pub sig_type: String,
    pub image: SignatureImage,
    pub identity: BTreeMap<String, String>,
}

/// A container signature payload in the atomic container-signature layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub critical: SignatureCritical,
    #[serde(default, skip_serializing_if = "is_empty_map")]
    pub optional: BTreeMap<String, String>,
}

impl Signature {
    pub fn for_manifest(digest: &str, reference: &str) -> Self {
        let mut identity = BTreeMap::new();
        identity.insert("docker-reference".to_owned(), reference.to_owned());
        Self {
            critical: SignatureCritical {
                sig_type: "atomic container signature".to_owned(),
                image: SignatureImage {
                    docker_manifest_digest: digest.to_owned(),
                },
                identity,
            },
            optional: BTreeMap::new(),
        }
    }
}
