//! Static deltas: precomputed object bundles between two commits.
//!
//! A delta lives under `deltas/{from-to}/` as a JSON superblock plus one or
//! more tar part payloads holding the objects present in `to` but not in
//! `from`. The superblock embeds the target commit record and its detached
//! metadata so a consumer can materialize the commit without a full pull;
//! the commit rewriter splices new values into both when re-homing a delta.

use crate::commit::CommitRecord;
use crate::repo::Repo;
use crate::tree::tree_closure;
use crate::StoreError;
use freight_schema::CommitMetadata;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const SUPERBLOCK_FILE: &str = "superblock";

/// One payload file of a delta: the objects it carries and its byte size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaPart {
    pub objects: Vec<String>,
    pub size: u64,
}

/// The detached index of a static delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaSuperblock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: String,
    /// The target commit record, embedded verbatim.
    pub commit: CommitRecord,
    /// Detached metadata entry accompanying the commit.
    #[serde(default)]
    pub detached_metadata: CommitMetadata,
    pub parts: Vec<DeltaPart>,
}

/// Directory name for a delta: `{from}-{to}`, or just `{to}` for a
/// from-scratch delta.
pub fn delta_name(from: Option<&str>, to: &str) -> String {
    match from {
        Some(f) => format!("{f}-{to}"),
        None => to.to_owned(),
    }
}

fn part_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(index.to_string())
}

pub fn read_delta_superblock(path: &Path) -> Result<DeltaSuperblock, StoreError> {
    let data = fs::read(path).map_err(|e| StoreError::io_at(path, e))?;
    Ok(serde_json::from_slice(&data)?)
}

pub fn write_delta_superblock(path: &Path, superblock: &DeltaSuperblock) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io_at(parent, e))?;
    }
    let data = serde_json::to_vec_pretty(superblock)?;
    fs::write(path, data).map_err(|e| StoreError::io_at(path, e))
}

/// Generate a static delta in `repo` carrying the objects of `to` that are
/// absent from `from`'s closure. Returns the superblock.
pub fn generate_static_delta(
    repo: &Repo,
    from: Option<&str>,
    to: &str,
) -> Result<DeltaSuperblock, StoreError> {
    let to_info = repo.load_commit(to)?;
    if to_info.partial {
        return Err(StoreError::PartialCommit(to.to_owned()));
    }
    let mut objects = tree_closure(repo.objects(), &to_info.record.root_tree)?;
    if let Some(from_id) = from {
        let from_info = repo.load_commit(from_id)?;
        let from_set: HashSet<String> =
            tree_closure(repo.objects(), &from_info.record.root_tree)?
                .into_iter()
                .collect();
        objects.retain(|o| !from_set.contains(o));
    }

    let dir = repo.layout().deltas_dir().join(delta_name(from, to));
    fs::create_dir_all(&dir).map_err(|e| StoreError::io_at(&dir, e))?;

    let part_file = part_path(&dir, 0);
    let mut builder = tar::Builder::new(
        fs::File::create(&part_file).map_err(|e| StoreError::io_at(&part_file, e))?,
    );
    for id in &objects {
        let data = repo.objects().get(id)?;
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, id, data.as_slice())
            .map_err(StoreError::Io)?;
    }
    builder.finish().map_err(StoreError::Io)?;
    let size = fs::metadata(&part_file)
        .map_err(|e| StoreError::io_at(&part_file, e))?
        .len();

    let superblock = DeltaSuperblock {
        from: from.map(str::to_owned),
        to: to.to_owned(),
        commit: to_info.record.clone(),
        detached_metadata: to_info.record.metadata.clone(),
        parts: vec![DeltaPart {
            objects: objects.clone(),
            size,
        }],
    };
    write_delta_superblock(&dir.join(SUPERBLOCK_FILE), &superblock)?;
    info!(
        "generated delta {} with {} objects ({size} bytes)",
        delta_name(from, to),
        objects.len()
    );
    Ok(superblock)
}

/// List delta directory names present in a repository.
pub fn list_deltas(repo: &Repo) -> Result<Vec<String>, StoreError> {
    let dir = repo.layout().deltas_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(&dir).map_err(|e| StoreError::io_at(&dir, e))? {
        let entry = entry?;
        if entry.path().is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_owned());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Copy a delta's parts verbatim from one repository into another under a
/// rewritten superblock. Used by the commit rewriter; signatures are never
/// carried over.
pub fn rehome_delta(
    src_repo: &Repo,
    src_name: &str,
    dst_repo: &Repo,
    superblock: &DeltaSuperblock,
) -> Result<(), StoreError> {
    let src_dir = src_repo.layout().deltas_dir().join(src_name);
    let dst_dir = dst_repo
        .layout()
        .deltas_dir()
        .join(delta_name(superblock.from.as_deref(), &superblock.to));
    fs::create_dir_all(&dst_dir).map_err(|e| StoreError::io_at(&dst_dir, e))?;
    for (i, _part) in superblock.parts.iter().enumerate() {
        let src_part = part_path(&src_dir, i);
        let dst_part = part_path(&dst_dir, i);
        fs::copy(&src_part, &dst_part).map_err(|e| StoreError::io_at(&src_part, e))?;
    }
    write_delta_superblock(&dst_dir.join(SUPERBLOCK_FILE), superblock)
}

/// Import a delta's objects into the repository, verifying each hash.
pub fn apply_static_delta(repo: &Repo, delta_dir: &Path) -> Result<DeltaSuperblock, StoreError> {
    let superblock = read_delta_superblock(&delta_dir.join(SUPERBLOCK_FILE))?;
    for (i, part) in superblock.parts.iter().enumerate() {
        let path = part_path(delta_dir, i);
        let file = fs::File::open(&path).map_err(|e| StoreError::io_at(&path, e))?;
        let mut archive = tar::Archive::new(file);
        for entry in archive.entries().map_err(StoreError::Io)? {
            let mut entry = entry.map_err(StoreError::Io)?;
            let id = entry
                .path()
                .map_err(StoreError::Io)?
                .to_string_lossy()
                .into_owned();
            if !part.objects.contains(&id) {
                return Err(StoreError::InvalidData(format!(
                    "delta part {i} carries undeclared object {id}"
                )));
            }
            let mut data = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut data).map_err(StoreError::Io)?;
            repo.objects().put_with_hash(&id, &data)?;
        }
    }
    // Materialize the embedded commit object itself.
    let commit_id = superblock.commit.store(repo.objects())?;
    if commit_id != superblock.to {
        return Err(StoreError::IntegrityFailure {
            hash: superblock.to.clone(),
            expected: superblock.to.clone(),
            actual: commit_id,
        });
    }
    Ok(superblock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::MutableTree;

    fn publish(repo: &Repo, dir: &Path, files: &[(&str, &[u8])]) -> String {
        let build = dir.join(format!("build-{}", files.len()));
        for (name, content) in files {
            let path = build.join("files").join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
        }
        let mut mtree = MutableTree::new();
        mtree.write_directory(repo.objects(), &build, None).unwrap();
        let root = mtree.finalize(repo.objects()).unwrap();
        repo.write_commit(None, "delta test", "", CommitMetadata::new(), &root, Some(1_700_000_000))
            .unwrap()
    }

    #[test]
    fn generate_from_scratch_and_apply() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("src")).unwrap();
        let commit = publish(&repo, dir.path(), &[("a", b"alpha")]);

        let superblock = generate_static_delta(&repo, None, &commit).unwrap();
        assert_eq!(superblock.to, commit);
        assert!(superblock.from.is_none());
        assert_eq!(superblock.parts.len(), 1);

        let dst = Repo::open(dir.path().join("dst")).unwrap();
        let delta_dir = repo.layout().deltas_dir().join(delta_name(None, &commit));
        // Parts alone do not carry the commit object; apply embeds it.
        let applied = apply_static_delta(&dst, &delta_dir).unwrap();
        assert_eq!(applied.to, commit);
        dst.read_commit(&commit).unwrap();
    }

    #[test]
    fn incremental_delta_excludes_shared_objects() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("src")).unwrap();
        let c1 = publish(&repo, dir.path(), &[("a", b"alpha")]);
        let c2 = publish(&repo, dir.path(), &[("a", b"alpha"), ("b", b"beta")]);

        let full = generate_static_delta(&repo, None, &c2).unwrap();
        let incr = generate_static_delta(&repo, Some(&c1), &c2).unwrap();
        assert!(incr.parts[0].objects.len() < full.parts[0].objects.len());
        // The shared content object for "a" must not be carried.
        let a_hash = crate::sha256_hex(b"alpha");
        assert!(!incr.parts[0].objects.contains(&a_hash));
    }

    #[test]
    fn superblock_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("src")).unwrap();
        let commit = publish(&repo, dir.path(), &[("a", b"alpha")]);
        let superblock = generate_static_delta(&repo, None, &commit).unwrap();
        let path = repo
            .layout()
            .deltas_dir()
            .join(delta_name(None, &commit))
            .join("superblock");
        let loaded = read_delta_superblock(&path).unwrap();
        assert_eq!(loaded, superblock);
    }

    #[test]
    fn partial_commit_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("src")).unwrap();
        let commit = publish(&repo, dir.path(), &[("a", b"alpha")]);
        repo.mark_partial(&commit, true).unwrap();
        assert!(matches!(
            generate_static_delta(&repo, None, &commit),
            Err(StoreError::PartialCommit(_))
        ));
    }

    #[test]
    fn list_deltas_names() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("src")).unwrap();
        let commit = publish(&repo, dir.path(), &[("a", b"alpha")]);
        generate_static_delta(&repo, None, &commit).unwrap();
        let names = list_deltas(&repo).unwrap();
        assert_eq!(names, vec![delta_name(None, &commit)]);
    }
}
