//! Commit metadata values and their canonical binary encoding.
//!
//! Commit metadata is a sorted map of string keys to typed [`Variant`]
//! values. In the store, commits are serialized as canonical JSON; the
//! binary encoding here is used where the wire demands raw bytes: OCI
//! annotation payloads (base64) and the bundle superblock. Integer widths
//! follow the published format: `u64` big-endian, `i32` little-endian.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata attached to every published commit, keyed by well-known names.
pub type CommitMetadata = BTreeMap<String, Variant>;

/// Deprecated single-ref binding.
pub const XA_REF: &str = "xa.ref";
/// Contents of the application metadata keyfile.
pub const XA_METADATA: &str = "xa.metadata";
/// Sum of regular-file sizes over the commit's tree, big-endian u64.
pub const XA_INSTALLED_SIZE: &str = "xa.installed-size";
/// Total serialized object bytes of the commit closure, big-endian u64.
pub const XA_DOWNLOAD_SIZE: &str = "xa.download-size";
/// Authenticator token type, little-endian i32.
pub const XA_TOKEN_TYPE: &str = "xa.token-type";
/// Subset names this commit participates in.
pub const XA_SUBSETS: &str = "xa.subsets";
/// External download sources verified by sha-256.
pub const XA_EXTRA_DATA_SOURCES: &str = "xa.extra-data-sources";
/// Source commit recorded by the commit rewriter.
pub const XA_FROM_COMMIT: &str = "xa.from_commit";
/// Every ref this commit may be installed under.
pub const OSTREE_REF_BINDING: &str = "ostree.ref-binding";
/// Collection this commit is bound to, or absent.
pub const OSTREE_COLLECTION_BINDING: &str = "ostree.collection-binding";
/// Extra collection/ref pairs recorded by the commit rewriter.
pub const OSTREE_COLLECTION_REFS_BINDING: &str = "ostree.collection-refs-binding";
pub const OSTREE_ENDOFLIFE: &str = "ostree.endoflife";
pub const OSTREE_ENDOFLIFE_REBASE: &str = "ostree.endoflife-rebase";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VariantError {
    #[error("truncated variant payload")]
    Truncated,
    #[error("unknown variant tag {0}")]
    UnknownTag(u8),
    #[error("invalid UTF-8 in variant string")]
    InvalidUtf8,
    #[error("trailing bytes after variant payload")]
    TrailingBytes,
}

/// One external download source: `(name, size, installed_size, sha256, uri)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraDataRecord {
    pub name: String,
    pub size: u64,
    pub installed_size: u64,
    #[serde(with = "hex_bytes")]
    pub checksum: [u8; 32],
    pub uri: String,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(d)?;
        let raw = hex::decode(&text).map_err(serde::de::Error::custom)?;
        raw.try_into()
            .map_err(|_| serde::de::Error::custom("checksum must be 32 bytes"))
    }
}

/// A typed commit metadata value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum Variant {
    Str(String),
    StrList(Vec<String>),
    U64(u64),
    I32(i32),
    Bytes(Vec<u8>),
    ExtraData(Vec<ExtraDataRecord>),
}

const TAG_STR: u8 = 1;
const TAG_STR_LIST: u8 = 2;
const TAG_U64: u8 = 3;
const TAG_I32: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_EXTRA_DATA: u8 = 6;

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], VariantError> {
    if input.len() < n {
        return Err(VariantError::Truncated);
    }
    let (head, rest) = input.split_at(n);
    *input = rest;
    Ok(head)
}

fn take_u32(input: &mut &[u8]) -> Result<u32, VariantError> {
    let raw = take(input, 4)?;
    Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn take_str(input: &mut &[u8]) -> Result<String, VariantError> {
    let len = take_u32(input)? as usize;
    let raw = take(input, len)?;
    String::from_utf8(raw.to_vec()).map_err(|_| VariantError::InvalidUtf8)
}

impl Variant {
    pub fn str(s: impl Into<String>) -> Self {
        Variant::Str(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str_list(&self) -> Option<&[String]> {
        match self {
            Variant::StrList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Variant::U64(v) => Some(*v),
            _ => None,
        }
    }

    /// Canonical byte encoding: one tag byte followed by the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Variant::Str(s) => {
                out.push(TAG_STR);
                out.extend_from_slice(s.as_bytes());
            }
            Variant::StrList(items) => {
                out.push(TAG_STR_LIST);
                out.extend_from_slice(&(items.len() as u32).to_be_bytes());
                for item in items {
                    put_str(&mut out, item);
                }
            }
            Variant::U64(v) => {
                out.push(TAG_U64);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Variant::I32(v) => {
                out.push(TAG_I32);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Variant::Bytes(b) => {
                out.push(TAG_BYTES);
                out.extend_from_slice(b);
            }
            Variant::ExtraData(records) => {
                out.push(TAG_EXTRA_DATA);
                out.extend_from_slice(&(records.len() as u32).to_be_bytes());
                for r in records {
                    put_str(&mut out, &r.name);
                    out.extend_from_slice(&r.size.to_be_bytes());
                    out.extend_from_slice(&r.installed_size.to_be_bytes());
                    out.extend_from_slice(&r.checksum);
                    put_str(&mut out, &r.uri);
                }
            }
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, VariantError> {
        let mut input = data;
        let tag = *take(&mut input, 1)?.first().ok_or(VariantError::Truncated)?;
        let value = match tag {
            TAG_STR => {
                let s = String::from_utf8(input.to_vec()).map_err(|_| VariantError::InvalidUtf8)?;
                input = &[];
                Variant::Str(s)
            }
            TAG_STR_LIST => {
                let count = take_u32(&mut input)?;
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(take_str(&mut input)?);
                }
                Variant::StrList(items)
            }
            TAG_U64 => {
                let raw = take(&mut input, 8)?;
                let mut b = [0u8; 8];
                b.copy_from_slice(raw);
                Variant::U64(u64::from_be_bytes(b))
            }
            TAG_I32 => {
                let raw = take(&mut input, 4)?;
                Variant::I32(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            }
            TAG_BYTES => {
                let b = input.to_vec();
                input = &[];
                Variant::Bytes(b)
            }
            TAG_EXTRA_DATA => {
                let count = take_u32(&mut input)?;
                let mut records = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let name = take_str(&mut input)?;
                    let size_raw = take(&mut input, 8)?;
                    let mut size_b = [0u8; 8];
                    size_b.copy_from_slice(size_raw);
                    let installed_raw = take(&mut input, 8)?;
                    let mut installed_b = [0u8; 8];
                    installed_b.copy_from_slice(installed_raw);
                    let checksum_raw = take(&mut input, 32)?;
                    let mut checksum = [0u8; 32];
                    checksum.copy_from_slice(checksum_raw);
                    let uri = take_str(&mut input)?;
                    records.push(ExtraDataRecord {
                        name,
                        size: u64::from_be_bytes(size_b),
                        installed_size: u64::from_be_bytes(installed_b),
                        checksum,
                        uri,
                    });
                }
                Variant::ExtraData(records)
            }
            other => return Err(VariantError::UnknownTag(other)),
        };
        if !input.is_empty() {
            return Err(VariantError::TrailingBytes);
        }
        Ok(value)
    }
}
