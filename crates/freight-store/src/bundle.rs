//! Single-file bundles: one commit and its objects in a tar container with
//! a detached superblock entry.
//!
//! A bundle is a self-contained repository slice. Loading reads only the
//! superblock; installing imports the objects, verifies the embedded commit
//! id, and leaves ref assignment to the caller (which may also auto-add an
//! `{app-id}-origin` remote from the recorded origin URL).

use crate::commit::CommitRecord;
use crate::repo::Repo;
use crate::tree::tree_closure;
use crate::StoreError;
use freight_schema::variant::{Variant, XA_INSTALLED_SIZE, XA_METADATA};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::info;

const SUPERBLOCK_ENTRY: &str = "superblock";
const OBJECTS_PREFIX: &str = "objects/";

/// The detached superblock carried at the front of a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleInfo {
    /// Canonical ref string this bundle installs.
    pub ref_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    /// Remote to suggest for future updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_url: Option<String>,
    /// Remote carrying the runtimes this app needs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_repo_url: Option<String>,
    /// Contents of the artifact's metadata keyfile.
    pub metadata: String,
    pub installed_size: u64,
    /// Embedded trusted key material, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpg_keys: Option<Vec<u8>>,
    /// The embedded commit id.
    pub commit: String,
}

/// Serialize one commit of `repo` into a bundle file at `path`.
pub fn create_bundle(
    repo: &Repo,
    refstr: &str,
    path: &Path,
    origin_url: Option<&str>,
    runtime_repo_url: Option<&str>,
    gpg_keys: Option<&[u8]>,
) -> Result<BundleInfo, StoreError> {
    let commit_id = repo
        .resolve_rev(refstr, false)?
        .ok_or_else(|| StoreError::RefNotFound(refstr.to_owned()))?;
    let info = repo.load_commit(&commit_id)?;
    if info.partial {
        return Err(StoreError::PartialCommit(commit_id.clone()));
    }

    let superblock = BundleInfo {
        ref_name: refstr.to_owned(),
        collection_id: repo.collection_id().map(str::to_owned),
        origin_url: origin_url.map(str::to_owned),
        runtime_repo_url: runtime_repo_url.map(str::to_owned),
        metadata: info
            .record
            .metadata
            .get(XA_METADATA)
            .and_then(Variant::as_str)
            .unwrap_or_default()
            .to_owned(),
        installed_size: info
            .record
            .metadata
            .get(XA_INSTALLED_SIZE)
            .and_then(Variant::as_u64)
            .unwrap_or(0),
        gpg_keys: gpg_keys.map(<[u8]>::to_vec),
        commit: commit_id.clone(),
    };

    let file = fs::File::create(path).map_err(|e| StoreError::io_at(path, e))?;
    let mut builder = tar::Builder::new(file);

    let superblock_bytes = serde_json::to_vec_pretty(&superblock)?;
    append_entry(&mut builder, SUPERBLOCK_ENTRY, &superblock_bytes)?;

    let mut objects = tree_closure(repo.objects(), &info.record.root_tree)?;
    objects.push(commit_id.clone());
    for id in &objects {
        let data = repo.objects().get(id)?;
        append_entry(&mut builder, &format!("{OBJECTS_PREFIX}{id}"), &data)?;
    }
    builder.finish().map_err(StoreError::Io)?;
    info!(
        "bundled {refstr} at {} ({} objects)",
        &commit_id[..8],
        objects.len()
    );
    Ok(superblock)
}

fn append_entry<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
) -> Result<(), StoreError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data).map_err(StoreError::Io)
}

/// Read only the superblock of a bundle file.
pub fn load_bundle(path: &Path) -> Result<BundleInfo, StoreError> {
    let file = fs::File::open(path).map_err(|e| StoreError::io_at(path, e))?;
    let mut archive = tar::Archive::new(file);
    for entry in archive.entries().map_err(StoreError::Io)? {
        let mut entry = entry.map_err(StoreError::Io)?;
        let name = entry
            .path()
            .map_err(StoreError::Io)?
            .to_string_lossy()
            .into_owned();
        if name == SUPERBLOCK_ENTRY {
            let mut data = Vec::new();
            entry.read_to_end(&mut data).map_err(StoreError::Io)?;
            return Ok(serde_json::from_slice(&data)?);
        }
    }
    Err(StoreError::InvalidData(format!(
        "no superblock in bundle {}",
        path.display()
    )))
}

/// Import a bundle's objects into `repo`, verifying the embedded commit.
///
/// Returns the superblock; the caller decides the ref and origin handling.
pub fn import_bundle(repo: &Repo, path: &Path) -> Result<BundleInfo, StoreError> {
    let file = fs::File::open(path).map_err(|e| StoreError::io_at(path, e))?;
    let mut archive = tar::Archive::new(file);
    let mut superblock: Option<BundleInfo> = None;
    for entry in archive.entries().map_err(StoreError::Io)? {
        let mut entry = entry.map_err(StoreError::Io)?;
        let name = entry
            .path()
            .map_err(StoreError::Io)?
            .to_string_lossy()
            .into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).map_err(StoreError::Io)?;
        if name == SUPERBLOCK_ENTRY {
            superblock = Some(serde_json::from_slice(&data)?);
        } else if let Some(id) = name.strip_prefix(OBJECTS_PREFIX) {
            repo.objects().put_with_hash(id, &data)?;
        }
    }
    let superblock = superblock.ok_or_else(|| {
        StoreError::InvalidData(format!("no superblock in bundle {}", path.display()))
    })?;

    // The commit must exist, hash correctly, and reference a complete tree.
    let record = CommitRecord::load(repo.objects(), &superblock.commit)?;
    for id in tree_closure(repo.objects(), &record.root_tree)? {
        if !repo.objects().exists(&id) {
            return Err(StoreError::ObjectNotFound(id));
        }
    }
    Ok(superblock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::MutableTree;
    use freight_schema::CommitMetadata;

    fn publish(dir: &Path) -> (Repo, String, String) {
        let repo = Repo::open(dir.join("src-repo")).unwrap();
        let build = dir.join("build");
        fs::create_dir_all(build.join("files")).unwrap();
        fs::write(build.join("files/payload"), b"bundle me").unwrap();
        let mut mtree = MutableTree::new();
        mtree.write_directory(repo.objects(), &build, None).unwrap();
        let root = mtree.finalize(repo.objects()).unwrap();
        let mut metadata = CommitMetadata::new();
        metadata.insert(
            XA_METADATA.to_owned(),
            Variant::str("[Application]\nname=org.test.Hello\n"),
        );
        metadata.insert(XA_INSTALLED_SIZE.to_owned(), Variant::U64(9));
        let commit = repo
            .write_commit(None, "bundle", "", metadata, &root, Some(1_700_000_000))
            .unwrap();
        let refstr = "app/org.test.Hello/x86_64/master".to_owned();
        repo.set_ref(None, &refstr, Some(&commit)).unwrap();
        (repo, refstr, commit)
    }

    #[test]
    fn create_load_import_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, refstr, commit) = publish(dir.path());
        let bundle_path = dir.path().join("hello.bundle");

        let created = create_bundle(
            &repo,
            &refstr,
            &bundle_path,
            Some("https://repo.example.com/stable"),
            None,
            None,
        )
        .unwrap();
        assert_eq!(created.commit, commit);
        assert_eq!(created.installed_size, 9);

        let loaded = load_bundle(&bundle_path).unwrap();
        assert_eq!(loaded, created);

        let dst = Repo::open(dir.path().join("dst-repo")).unwrap();
        let imported = import_bundle(&dst, &bundle_path).unwrap();
        assert_eq!(imported.commit, commit);
        // Installed commit id and metadata equal the original.
        let info = dst.load_commit(&commit).unwrap();
        assert_eq!(
            info.record.metadata.get(XA_METADATA).and_then(Variant::as_str),
            Some("[Application]\nname=org.test.Hello\n")
        );
    }

    #[test]
    fn bundle_with_gpg_keys() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, refstr, _commit) = publish(dir.path());
        let bundle_path = dir.path().join("hello.bundle");
        create_bundle(&repo, &refstr, &bundle_path, None, None, Some(b"KEYBLOCK")).unwrap();
        let loaded = load_bundle(&bundle_path).unwrap();
        assert_eq!(loaded.gpg_keys.as_deref(), Some(&b"KEYBLOCK"[..]));
    }

    #[test]
    fn missing_ref_fails() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("repo")).unwrap();
        let err = create_bundle(
            &repo,
            "app/org.x.Y/x86_64/master",
            &dir.path().join("x.bundle"),
            None,
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::RefNotFound(_)));
    }

    #[test]
    fn corrupt_bundle_object_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, refstr, _commit) = publish(dir.path());
        let bundle_path = dir.path().join("hello.bundle");
        create_bundle(&repo, &refstr, &bundle_path, None, None, None).unwrap();

        // Flip a byte inside the stored content object's payload.
        let mut data = fs::read(&bundle_path).unwrap();
        let needle = b"bundle me";
        let idx = data
            .windows(needle.len())
            .position(|w| w == needle)
            .expect("content payload present in archive");
        data[idx] ^= 0xFF;
        fs::write(&bundle_path, &data).unwrap();

        let dst = Repo::open(dir.path().join("dst-repo")).unwrap();
        assert!(import_bundle(&dst, &bundle_path).is_err());
    }

    #[test]
    fn plain_file_is_not_a_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-bundle");
        fs::write(&path, b"junk").unwrap();
        assert!(load_bundle(&path).is_err());
    }
}
