//! The four-tuple reference model: `kind/name/arch/branch`.
//!
//! Refs are immutable values comparing by field equality. The canonical
//! string form is produced by [`Ref::format`]; [`Ref::format_cached`] returns
//! a borrowed string that is computed once per value and reused afterwards.

use crate::types::{CollectionId, CommitId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Longest accepted `name` field, in bytes.
pub const MAX_NAME_LEN: usize = 255;
/// Longest accepted `arch` or `branch` field, in bytes.
pub const MAX_SEGMENT_LEN: usize = 255;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RefError {
    #[error("invalid ref '{text}': {reason}")]
    InvalidRef { text: String, reason: String },
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
}

impl RefError {
    fn invalid(text: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRef {
            text: text.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Whether a ref points at an application or a shared runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    App,
    Runtime,
}

impl RefKind {
    pub fn tag(self) -> &'static str {
        match self {
            RefKind::App => "app",
            RefKind::Runtime => "runtime",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "app" => Some(RefKind::App),
            "runtime" => Some(RefKind::Runtime),
            _ => None,
        }
    }
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Validate a reverse-DNS application or runtime name.
///
/// Dot-separated segments of `[A-Za-z0-9_-]`; the first segment must not
/// start with a digit, subsequent segments may. 1–255 bytes overall.
pub fn validate_name(name: &str) -> Result<(), RefError> {
    let err = |reason: &str| RefError::InvalidName {
        name: name.to_owned(),
        reason: reason.to_owned(),
    };
    if name.is_empty() {
        return Err(err("name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(err("name exceeds 255 bytes"));
    }
    for (i, segment) in name.split('.').enumerate() {
        if segment.is_empty() {
            return Err(err("empty dot-segment"));
        }
        let first = segment.as_bytes()[0];
        if i == 0 && !(first.is_ascii_alphabetic() || first == b'_') {
            return Err(err("first segment must start with a letter or underscore"));
        }
        if !segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(err("segments must match [A-Za-z0-9_-]"));
        }
    }
    Ok(())
}

fn validate_arch(arch: &str, text: &str) -> Result<(), RefError> {
    if arch.is_empty() {
        return Err(RefError::invalid(text, "arch is empty"));
    }
    if arch.len() > MAX_SEGMENT_LEN {
        return Err(RefError::invalid(text, "arch exceeds 255 bytes"));
    }
    if !arch
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(RefError::invalid(text, "arch must match [A-Za-z0-9_-]"));
    }
    Ok(())
}

fn validate_branch(branch: &str, text: &str) -> Result<(), RefError> {
    if branch.is_empty() {
        return Err(RefError::invalid(text, "branch is empty"));
    }
    if branch.len() > MAX_SEGMENT_LEN {
        return Err(RefError::invalid(text, "branch exceeds 255 bytes"));
    }
    if !branch
        .bytes()
        .all(|b| b.is_ascii_graphic() && b != b'/')
    {
        return Err(RefError::invalid(
            text,
            "branch must be printable and contain no '/'",
        ));
    }
    Ok(())
}

/// An immutable `kind/name/arch/branch` reference, optionally pinned to a
/// commit and bound to a collection.
#[derive(Debug, Serialize, Deserialize)]
pub struct Ref {
    kind: RefKind,
    name: String,
    arch: String,
    branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    commit: Option<CommitId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    collection_id: Option<CollectionId>,
    #[serde(skip)]
    formatted: OnceLock<String>,
}

impl Ref {
    pub fn new(
        kind: RefKind,
        name: impl Into<String>,
        arch: impl Into<String>,
        branch: impl Into<String>,
    ) -> Result<Self, RefError> {
        let name = name.into();
        let arch = arch.into();
        let branch = branch.into();
        validate_name(&name)?;
        validate_arch(&arch, &name)?;
        validate_branch(&branch, &name)?;
        Ok(Self {
            kind,
            name,
            arch,
            branch,
            commit: None,
            collection_id: None,
            formatted: OnceLock::new(),
        })
    }

    /// Parse a canonical `app|runtime/name/arch/branch` string.
    pub fn parse(text: &str) -> Result<Self, RefError> {
        let d = Decomposed::parse(text)?;
        let mut r = Self::new(d.kind, d.name, d.arch, d.branch)
            .map_err(|e| match e {
                RefError::InvalidName { reason, .. } => RefError::invalid(text, reason),
                other => other,
            })?;
        // Seed the cache with the already-canonical input.
        if r.format() == text {
            r.formatted = OnceLock::new();
            let _ = r.formatted.set(text.to_owned());
        }
        Ok(r)
    }

    pub fn kind(&self) -> RefKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn commit(&self) -> Option<&CommitId> {
        self.commit.as_ref()
    }

    pub fn collection_id(&self) -> Option<&CollectionId> {
        self.collection_id.as_ref()
    }

    /// Return a copy pinned to the given commit.
    #[must_use]
    pub fn with_commit(&self, commit: CommitId) -> Self {
        let mut r = self.clone();
        r.commit = Some(commit);
        r
    }

    /// Return a copy bound to the given collection.
    #[must_use]
    pub fn with_collection(&self, collection: CollectionId) -> Self {
        let mut r = self.clone();
        r.collection_id = Some(collection);
        r
    }

    /// Canonical string form, newly allocated.
    pub fn format(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.kind.tag(),
            self.name,
            self.arch,
            self.branch
        )
    }

    /// Canonical string form, computed once and borrowed afterwards.
    ///
    /// Thread-safe and idempotent; hot paths walking summaries use this to
    /// avoid reformatting on every comparison.
    pub fn format_cached(&self) -> &str {
        self.formatted.get_or_init(|| self.format())
    }

    /// Relative on-disk path of this ref's deploy subtree:
    /// `{kind}/{name}/{arch}/{branch}`.
    pub fn deploy_path(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(self.kind.tag())
            .join(&self.name)
            .join(&self.arch)
            .join(&self.branch)
    }
}

impl Clone for Ref {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            name: self.name.clone(),
            arch: self.arch.clone(),
            branch: self.branch.clone(),
            commit: self.commit.clone(),
            collection_id: self.collection_id.clone(),
            formatted: OnceLock::new(),
        }
    }
}

impl PartialEq for Ref {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.name == other.name
            && self.arch == other.arch
            && self.branch == other.branch
            && self.commit == other.commit
            && self.collection_id == other.collection_id
    }
}

impl Eq for Ref {}

impl std::hash::Hash for Ref {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.name.hash(state);
        self.arch.hash(state);
        self.branch.hash(state);
        self.commit.hash(state);
        self.collection_id.hash(state);
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.format_cached())
    }
}

/// Zero-copy view of the four fields of a ref string.
///
/// Used on hot paths (summary walking) where allocating a full [`Ref`] per
/// entry would dominate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decomposed<'a> {
    pub kind: RefKind,
    pub name: &'a str,
    pub arch: &'a str,
    pub branch: &'a str,
}

impl<'a> Decomposed<'a> {
    /// Split and structurally validate a ref string without allocating.
    ///
    /// Field contents are checked for emptiness and separators only; full
    /// name validation happens when a [`Ref`] is constructed.
    pub fn parse(text: &'a str) -> Result<Self, RefError> {
        let mut parts = text.split('/');
        let (kind_tag, name, arch, branch) = match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(k), Some(n), Some(a), Some(b), None) => (k, n, a, b),
            _ => {
                return Err(RefError::invalid(
                    text,
                    "expected exactly kind/name/arch/branch",
                ))
            }
        };
        let kind = RefKind::from_tag(kind_tag)
            .ok_or_else(|| RefError::invalid(text, "kind must be 'app' or 'runtime'"))?;
        if name.is_empty() || arch.is_empty() || branch.is_empty() {
            return Err(RefError::invalid(text, "empty field"));
        }
        Ok(Self {
            kind,
            name,
            arch,
            branch,
        })
    }

    /// Whether this view matches the given ref value field-for-field.
    pub fn matches(&self, r: &Ref) -> bool {
        self.kind == r.kind() && self.name == r.name() && self.arch == r.arch() && self.branch == r.branch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_format_roundtrip() {
        let r = Ref::parse("app/org.test.Hello/x86_64/master").unwrap();
        assert_eq!(r.kind(), RefKind::App);
        assert_eq!(r.name(), "org.test.Hello");
        assert_eq!(r.arch(), "x86_64");
        assert_eq!(r.branch(), "master");
        assert_eq!(r.format(), "app/org.test.Hello/x86_64/master");
        assert_eq!(Ref::parse(&r.format()).unwrap(), r);
    }

    #[test]
    fn runtime_kind_parses() {
        let r = Ref::parse("runtime/org.test.Platform/x86_64/stable").unwrap();
        assert_eq!(r.kind(), RefKind::Runtime);
    }

    #[test]
    fn format_cached_is_idempotent() {
        let r = Ref::new(RefKind::App, "org.test.Hello", "x86_64", "master").unwrap();
        let a = r.format_cached() as *const str;
        let b = r.format_cached() as *const str;
        assert!(std::ptr::eq(a, b));
        assert_eq!(r.format_cached(), "app/org.test.Hello/x86_64/master");
    }

    #[test]
    fn rejects_wrong_separator_count() {
        assert!(Ref::parse("app/org.test.Hello/x86_64").is_err());
        assert!(Ref::parse("app/org.test.Hello/x86_64/master/extra").is_err());
        assert!(Ref::parse("").is_err());
    }

    #[test]
    fn rejects_bad_kind() {
        assert!(Ref::parse("bundle/org.test.Hello/x86_64/master").is_err());
    }

    #[test]
    fn rejects_empty_fields() {
        assert!(Ref::parse("app//x86_64/master").is_err());
        assert!(Ref::parse("app/org.test.Hello//master").is_err());
        assert!(Ref::parse("app/org.test.Hello/x86_64/").is_err());
    }

    #[test]
    fn name_with_leading_digit_rejected() {
        assert!(validate_name("0abc").is_err());
        assert!(Ref::parse("app/0abc.def/x86_64/master").is_err());
    }

    #[test]
    fn later_segments_may_start_with_digit() {
        assert!(validate_name("org.7zip.Archiver").is_ok());
    }

    #[test]
    fn underscore_leading_name_accepted() {
        assert!(validate_name("_org.test.App").is_ok());
    }

    #[test]
    fn name_length_boundary() {
        // 255 chars: accepted. 256: rejected.
        let long_tail = "a".repeat(255 - "org.".len());
        let name_255 = format!("org.{long_tail}");
        assert_eq!(name_255.len(), 255);
        assert!(validate_name(&name_255).is_ok());
        let name_256 = format!("org.{long_tail}a");
        assert!(validate_name(&name_256).is_err());
    }

    #[test]
    fn name_with_empty_segment_rejected() {
        assert!(validate_name("org..App").is_err());
        assert!(validate_name(".org.App").is_err());
        assert!(validate_name("org.App.").is_err());
    }

    #[test]
    fn branch_rejects_nonprintable_and_slash() {
        assert!(Ref::new(RefKind::App, "org.test.A", "x86_64", "br\x01anch").is_err());
        assert!(Ref::new(RefKind::App, "org.test.A", "x86_64", "a b").is_err());
    }

    #[test]
    fn equality_ignores_format_cache() {
        let a = Ref::parse("app/org.test.Hello/x86_64/master").unwrap();
        let b = Ref::new(RefKind::App, "org.test.Hello", "x86_64", "master").unwrap();
        let _ = a.format_cached();
        assert_eq!(a, b);
    }

    #[test]
    fn with_commit_distinguishes_refs() {
        let a = Ref::parse("app/org.test.Hello/x86_64/master").unwrap();
        let b = a.with_commit(CommitId::new("ab".repeat(32)));
        assert_ne!(a, b);
        assert_eq!(b.commit().unwrap().as_str(), "ab".repeat(32));
        // base fields unchanged
        assert_eq!(a.format(), b.format());
    }

    #[test]
    fn decomposed_borrows_fields() {
        let text = "runtime/org.test.Platform/aarch64/stable";
        let d = Decomposed::parse(text).unwrap();
        assert_eq!(d.kind, RefKind::Runtime);
        assert_eq!(d.name, "org.test.Platform");
        assert_eq!(d.arch, "aarch64");
        assert_eq!(d.branch, "stable");
        let r = Ref::parse(text).unwrap();
        assert!(d.matches(&r));
    }

    #[test]
    fn deploy_path_layout() {
        let r = Ref::parse("app/org.test.Hello/x86_64/master").unwrap();
        assert_eq!(
            r.deploy_path(),
            std::path::Path::new("app/org.test.Hello/x86_64/master")
        );
    }

    #[test]
    fn serde_roundtrip() {
        let r = Ref::parse("app/org.test.Hello/x86_64/master")
            .unwrap()
            .with_collection(CollectionId::new("org.test.Collection"));
        let json = serde_json::to_string(&r).unwrap();
        let back: Ref = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
