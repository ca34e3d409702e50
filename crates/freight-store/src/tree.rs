//! Tree records and the mutable tree builder.
//!
//! A tree is a sorted mapping of entry names to files (content object +
//! mode + size), subtrees, or symlinks, serialized as canonical JSON and
//! stored content-addressed like any other object. Entry order is fixed by
//! the `BTreeMap`, so identical directory contents always produce identical
//! tree ids.

use crate::objects::ObjectStore;
use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// One entry in a tree record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TreeEntry {
    File { object: String, mode: u32, size: u64 },
    Dir { tree: String },
    Symlink { target: String },
}

/// A stored tree object: sorted entries keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeRecord {
    pub entries: BTreeMap<String, TreeEntry>,
}

impl TreeRecord {
    pub fn load(objects: &ObjectStore, tree_id: &str) -> Result<Self, StoreError> {
        let data = objects.get(tree_id)?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn store(&self, objects: &ObjectStore) -> Result<String, StoreError> {
        let data = serde_json::to_vec(self)?;
        objects.put(&data)
    }
}

/// File facts handed to a commit filter, which may rewrite ownership and mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub is_dir: bool,
    pub is_symlink: bool,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
}

/// Filter verdict for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    Allow,
    Skip,
}

/// Callback applied to every path while building a tree from a directory.
pub type CommitFilter<'a> = &'a mut dyn FnMut(&Path, &mut FileInfo) -> FilterResult;

/// How checkout materializes file content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutMode {
    /// Hardlink into the object store where possible (mode 0644 files).
    Hardlink,
    /// Always copy.
    Copy,
}

#[derive(Debug, Clone)]
enum TreeNode {
    Dir(BTreeMap<String, TreeNode>),
    File { object: String, mode: u32, size: u64 },
    Symlink { target: String },
    /// An already-finalized subtree referenced by id.
    Stored { tree: String },
}

/// In-memory tree under construction, finalized into stored tree records.
pub struct MutableTree {
    root: BTreeMap<String, TreeNode>,
}

impl Default for MutableTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MutableTree {
    pub fn new() -> Self {
        Self {
            root: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Walk `dir` recursively, storing file contents into `objects` and
    /// recording entries. The filter sees every path (relative to `dir`)
    /// and may skip it or rewrite its mode/ownership.
    pub fn write_directory(
        &mut self,
        objects: &ObjectStore,
        dir: &Path,
        mut filter: Option<CommitFilter<'_>>,
    ) -> Result<(), StoreError> {
        let mut root = std::mem::take(&mut self.root);
        Self::walk(objects, dir, Path::new(""), &mut root, &mut filter)?;
        self.root = root;
        Ok(())
    }

    fn walk(
        objects: &ObjectStore,
        dir: &Path,
        rel: &Path,
        into: &mut BTreeMap<String, TreeNode>,
        filter: &mut Option<CommitFilter<'_>>,
    ) -> Result<(), StoreError> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .map_err(|e| StoreError::io_at(dir, e))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|e| e.file_name())
            .collect();
        names.sort();

        for name in names {
            let Some(name_str) = name.to_str() else {
                return Err(StoreError::InvalidData(format!(
                    "non-UTF-8 file name under {}",
                    dir.display()
                )));
            };
            let path = dir.join(&name);
            let rel_path = rel.join(name_str);
            let meta = fs::symlink_metadata(&path).map_err(|e| StoreError::io_at(&path, e))?;

            let mut info = FileInfo {
                is_dir: meta.is_dir(),
                is_symlink: meta.file_type().is_symlink(),
                mode: meta.permissions().mode() & 0o7777,
                uid: meta.uid(),
                gid: meta.gid(),
                size: meta.len(),
            };
            if let Some(f) = filter.as_mut() {
                if f(&rel_path, &mut info) == FilterResult::Skip {
                    continue;
                }
            }

            if info.is_symlink {
                let target = fs::read_link(&path).map_err(|e| StoreError::io_at(&path, e))?;
                let target = target.to_str().ok_or_else(|| {
                    StoreError::InvalidData(format!("non-UTF-8 symlink target at {}", path.display()))
                })?;
                into.insert(
                    name_str.to_owned(),
                    TreeNode::Symlink {
                        target: target.to_owned(),
                    },
                );
            } else if info.is_dir {
                let mut children = BTreeMap::new();
                Self::walk(objects, &path, &rel_path, &mut children, filter)?;
                into.insert(name_str.to_owned(), TreeNode::Dir(children));
            } else {
                let data = fs::read(&path).map_err(|e| StoreError::io_at(&path, e))?;
                let object = objects.put(&data)?;
                into.insert(
                    name_str.to_owned(),
                    TreeNode::File {
                        object,
                        mode: info.mode,
                        size: data.len() as u64,
                    },
                );
            }
        }
        Ok(())
    }

    /// Insert a file at a `/`-separated path, creating intermediate directories.
    pub fn insert_file(
        &mut self,
        path: &str,
        object: impl Into<String>,
        mode: u32,
        size: u64,
    ) -> Result<(), StoreError> {
        let mut parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let Some(file_name) = parts.pop() else {
            return Err(StoreError::InvalidData("empty insert path".to_owned()));
        };
        let mut node = &mut self.root;
        for part in parts {
            let child = node
                .entry(part.to_owned())
                .or_insert_with(|| TreeNode::Dir(BTreeMap::new()));
            match child {
                TreeNode::Dir(children) => node = children,
                _ => {
                    return Err(StoreError::InvalidData(format!(
                        "path component '{part}' is not a directory"
                    )))
                }
            }
        }
        node.insert(
            file_name.to_owned(),
            TreeNode::File {
                object: object.into(),
                mode,
                size,
            },
        );
        Ok(())
    }

    /// Mount an already-finalized tree id at a `/`-separated path.
    pub fn insert_tree(
        &mut self,
        path: &str,
        tree_id: impl Into<String>,
    ) -> Result<(), StoreError> {
        let mut parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let Some(last) = parts.pop() else {
            return Err(StoreError::InvalidData("empty insert path".to_owned()));
        };
        let mut node = &mut self.root;
        for part in parts {
            let child = node
                .entry(part.to_owned())
                .or_insert_with(|| TreeNode::Dir(BTreeMap::new()));
            match child {
                TreeNode::Dir(children) => node = children,
                _ => {
                    return Err(StoreError::InvalidData(format!(
                        "path component '{part}' is not a directory"
                    )))
                }
            }
        }
        node.insert(
            last.to_owned(),
            TreeNode::Stored {
                tree: tree_id.into(),
            },
        );
        Ok(())
    }

    /// Write all tree records bottom-up and return the root tree id.
    pub fn finalize(&self, objects: &ObjectStore) -> Result<String, StoreError> {
        Self::finalize_node(&self.root, objects)
    }

    fn finalize_node(
        node: &BTreeMap<String, TreeNode>,
        objects: &ObjectStore,
    ) -> Result<String, StoreError> {
        let mut record = TreeRecord::default();
        for (name, child) in node {
            let entry = match child {
                TreeNode::Dir(children) => TreeEntry::Dir {
                    tree: Self::finalize_node(children, objects)?,
                },
                TreeNode::File { object, mode, size } => TreeEntry::File {
                    object: object.clone(),
                    mode: *mode,
                    size: *size,
                },
                TreeNode::Symlink { target } => TreeEntry::Symlink {
                    target: target.clone(),
                },
                TreeNode::Stored { tree } => TreeEntry::Dir { tree: tree.clone() },
            };
            record.entries.insert(name.clone(), entry);
        }
        record.store(objects)
    }
}

/// All object ids reachable from a tree (content objects and tree records,
/// including the root tree itself).
pub fn tree_closure(objects: &ObjectStore, tree_id: &str) -> Result<Vec<String>, StoreError> {
    let mut out = Vec::new();
    let mut stack = vec![tree_id.to_owned()];
    while let Some(id) = stack.pop() {
        let record = TreeRecord::load(objects, &id)?;
        out.push(id);
        for entry in record.entries.values() {
            match entry {
                TreeEntry::File { object, .. } => out.push(object.clone()),
                TreeEntry::Dir { tree } => stack.push(tree.clone()),
                TreeEntry::Symlink { .. } => {}
            }
        }
    }
    out.sort();
    out.dedup();
    Ok(out)
}

/// Sum of regular-file sizes over the tree.
pub fn installed_size(objects: &ObjectStore, tree_id: &str) -> Result<u64, StoreError> {
    let record = TreeRecord::load(objects, tree_id)?;
    let mut total = 0u64;
    for entry in record.entries.values() {
        match entry {
            TreeEntry::File { size, .. } => total += size,
            TreeEntry::Dir { tree } => total += installed_size(objects, tree)?,
            TreeEntry::Symlink { .. } => {}
        }
    }
    Ok(total)
}

/// Total serialized byte size of the tree closure (content + tree objects).
pub fn closure_bytes(objects: &ObjectStore, tree_id: &str) -> Result<u64, StoreError> {
    let mut total = 0u64;
    for id in tree_closure(objects, tree_id)? {
        total += objects.size(&id)?;
    }
    Ok(total)
}

/// Materialize a tree at `dest`.
///
/// `path_filter`, when given, decides per relative path whether the entry is
/// materialized; a skipped directory is not descended into. Mode-0644 files
/// are hardlinked from the object store in [`CheckoutMode::Hardlink`];
/// executables and filtered modes are copied so the store object keeps its
/// canonical permissions.
pub fn checkout(
    objects: &ObjectStore,
    tree_id: &str,
    dest: &Path,
    mode: CheckoutMode,
    path_filter: Option<&dyn Fn(&Path) -> bool>,
) -> Result<(), StoreError> {
    fs::create_dir_all(dest).map_err(|e| StoreError::io_at(dest, e))?;
    checkout_inner(objects, tree_id, dest, Path::new(""), mode, path_filter)
}

fn checkout_inner(
    objects: &ObjectStore,
    tree_id: &str,
    dest: &Path,
    rel: &Path,
    mode: CheckoutMode,
    path_filter: Option<&dyn Fn(&Path) -> bool>,
) -> Result<(), StoreError> {
    let record = TreeRecord::load(objects, tree_id)?;
    for (name, entry) in &record.entries {
        let rel_path = rel.join(name);
        if let Some(filter) = path_filter {
            if !filter(&rel_path) {
                continue;
            }
        }
        let target = dest.join(name);
        match entry {
            TreeEntry::Dir { tree } => {
                fs::create_dir_all(&target).map_err(|e| StoreError::io_at(&target, e))?;
                checkout_inner(objects, tree, &target, &rel_path, mode, path_filter)?;
            }
            TreeEntry::Symlink { target: link } => {
                if target.symlink_metadata().is_ok() {
                    fs::remove_file(&target).map_err(|e| StoreError::io_at(&target, e))?;
                }
                std::os::unix::fs::symlink(link, &target)
                    .map_err(|e| StoreError::io_at(&target, e))?;
            }
            TreeEntry::File {
                object,
                mode: file_mode,
                ..
            } => {
                let src = objects.object_path(object);
                if !src.exists() {
                    return Err(StoreError::ObjectNotFound(object.clone()));
                }
                if target.symlink_metadata().is_ok() {
                    fs::remove_file(&target).map_err(|e| StoreError::io_at(&target, e))?;
                }
                let hardlinkable = mode == CheckoutMode::Hardlink && *file_mode == 0o644;
                if hardlinkable && fs::hard_link(&src, &target).is_ok() {
                    continue;
                }
                fs::copy(&src, &target).map_err(|e| StoreError::io_at(&target, e))?;
                let perms = fs::Permissions::from_mode(*file_mode);
                fs::set_permissions(&target, perms).map_err(|e| StoreError::io_at(&target, e))?;
            }
        }
    }
    Ok(())
}

/// Copy every object in a tree closure from one store into another.
pub fn copy_tree(src: &ObjectStore, dst: &ObjectStore, tree_id: &str) -> Result<(), StoreError> {
    for id in tree_closure(src, tree_id)? {
        if !dst.exists(&id) {
            let data = src.get(&id)?;
            dst.put_with_hash(&id, &data)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::RepoLayout;

    fn test_store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(dir.path().join("repo"));
        layout.initialize().unwrap();
        (dir, ObjectStore::new(layout))
    }

    fn build_dir(root: &Path) {
        fs::create_dir_all(root.join("files/sub")).unwrap();
        fs::write(root.join("files/hello.txt"), b"hello").unwrap();
        fs::write(root.join("files/sub/data.bin"), b"abc").unwrap();
        fs::write(root.join("metadata"), b"[Application]\nname=a.b.C\n").unwrap();
        std::os::unix::fs::symlink("hello.txt", root.join("files/link")).unwrap();
    }

    #[test]
    fn directory_tree_roundtrip() {
        let (dir, objects) = test_store();
        let src = dir.path().join("build");
        build_dir(&src);

        let mut mtree = MutableTree::new();
        mtree.write_directory(&objects, &src, None).unwrap();
        let root_id = mtree.finalize(&objects).unwrap();

        let out = dir.path().join("out");
        checkout(&objects, &root_id, &out, CheckoutMode::Copy, None).unwrap();
        assert_eq!(fs::read(out.join("files/hello.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(out.join("files/sub/data.bin")).unwrap(), b"abc");
        assert_eq!(
            fs::read_link(out.join("files/link")).unwrap(),
            PathBuf::from("hello.txt")
        );
    }

    #[test]
    fn tree_id_is_deterministic() {
        let (dir, objects) = test_store();
        let src = dir.path().join("build");
        build_dir(&src);

        let mut a = MutableTree::new();
        a.write_directory(&objects, &src, None).unwrap();
        let mut b = MutableTree::new();
        b.write_directory(&objects, &src, None).unwrap();
        assert_eq!(a.finalize(&objects).unwrap(), b.finalize(&objects).unwrap());
    }

    #[test]
    fn filter_skips_and_rewrites() {
        let (dir, objects) = test_store();
        let src = dir.path().join("build");
        build_dir(&src);

        let mut filter = |path: &Path, info: &mut FileInfo| {
            if path.ends_with("data.bin") {
                return FilterResult::Skip;
            }
            if !info.is_dir && !info.is_symlink {
                info.mode = 0o600;
            }
            FilterResult::Allow
        };
        let mut mtree = MutableTree::new();
        mtree
            .write_directory(&objects, &src, Some(&mut filter))
            .unwrap();
        let root_id = mtree.finalize(&objects).unwrap();

        let record = TreeRecord::load(&objects, &root_id).unwrap();
        let TreeEntry::Dir { tree: files_tree } = &record.entries["files"] else {
            panic!("files must be a directory");
        };
        let files = TreeRecord::load(&objects, files_tree).unwrap();
        let TreeEntry::Dir { tree: sub_tree } = &files.entries["sub"] else {
            panic!("sub must be a directory");
        };
        let sub = TreeRecord::load(&objects, sub_tree).unwrap();
        assert!(sub.entries.is_empty(), "data.bin must be filtered out");
        let TreeEntry::File { mode, .. } = &files.entries["hello.txt"] else {
            panic!("hello.txt must be a file");
        };
        assert_eq!(*mode, 0o600);
    }

    #[test]
    fn closure_contains_all_objects() {
        let (dir, objects) = test_store();
        let src = dir.path().join("build");
        build_dir(&src);

        let mut mtree = MutableTree::new();
        mtree.write_directory(&objects, &src, None).unwrap();
        let root_id = mtree.finalize(&objects).unwrap();

        let closure = tree_closure(&objects, &root_id).unwrap();
        // content: hello, abc, metadata; trees: root, files, sub
        assert_eq!(closure.len(), 6);
        for id in &closure {
            assert!(objects.exists(id));
        }
    }

    #[test]
    fn installed_size_sums_regular_files() {
        let (dir, objects) = test_store();
        let src = dir.path().join("build");
        build_dir(&src);
        let mut mtree = MutableTree::new();
        mtree.write_directory(&objects, &src, None).unwrap();
        let root_id = mtree.finalize(&objects).unwrap();
        // hello (5) + abc (3) + metadata (25)
        let metadata_len = fs::metadata(src.join("metadata")).unwrap().len();
        assert_eq!(
            installed_size(&objects, &root_id).unwrap(),
            5 + 3 + metadata_len
        );
    }

    #[test]
    fn checkout_with_path_filter() {
        let (dir, objects) = test_store();
        let src = dir.path().join("build");
        build_dir(&src);
        let mut mtree = MutableTree::new();
        mtree.write_directory(&objects, &src, None).unwrap();
        let root_id = mtree.finalize(&objects).unwrap();

        let out = dir.path().join("out");
        let filter = |p: &Path| !p.starts_with("files/sub");
        checkout(&objects, &root_id, &out, CheckoutMode::Copy, Some(&filter)).unwrap();
        assert!(out.join("files/hello.txt").exists());
        assert!(!out.join("files/sub").exists());
    }

    #[test]
    fn checkout_executable_is_copied_with_mode() {
        let (dir, objects) = test_store();
        let src = dir.path().join("build");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("run.sh"), b"#!/bin/sh\n").unwrap();
        let mut filter = |_p: &Path, info: &mut FileInfo| {
            if !info.is_dir {
                info.mode = 0o755;
            }
            FilterResult::Allow
        };
        let mut mtree = MutableTree::new();
        mtree
            .write_directory(&objects, &src, Some(&mut filter))
            .unwrap();
        let root_id = mtree.finalize(&objects).unwrap();

        let out = dir.path().join("out");
        checkout(&objects, &root_id, &out, CheckoutMode::Hardlink, None).unwrap();
        let mode = fs::metadata(out.join("run.sh")).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn insert_file_creates_parents() {
        let (_dir, objects) = test_store();
        let obj = objects.put(b"payload").unwrap();
        let mut mtree = MutableTree::new();
        mtree.insert_file("files/extra/blob.bin", &obj, 0o644, 7).unwrap();
        let root_id = mtree.finalize(&objects).unwrap();
        let root = TreeRecord::load(&objects, &root_id).unwrap();
        assert!(matches!(root.entries["files"], TreeEntry::Dir { .. }));
    }

    #[test]
    fn copy_tree_between_stores() {
        let (dir, objects) = test_store();
        let src = dir.path().join("build");
        build_dir(&src);
        let mut mtree = MutableTree::new();
        mtree.write_directory(&objects, &src, None).unwrap();
        let root_id = mtree.finalize(&objects).unwrap();

        let dst_dir = tempfile::tempdir().unwrap();
        let dst_layout = RepoLayout::new(dst_dir.path());
        dst_layout.initialize().unwrap();
        let dst = ObjectStore::new(dst_layout);
        copy_tree(&objects, &dst, &root_id).unwrap();
        for id in tree_closure(&objects, &root_id).unwrap() {
            assert!(dst.exists(&id));
        }
    }
}
