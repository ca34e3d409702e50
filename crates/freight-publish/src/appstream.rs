//! Appstream branch generation: merge per-app component XML into a single
//! `appstream/{arch}` ref for software-center discovery.

use crate::PublishError;
use freight_schema::Decomposed;
use freight_store::{
    CancelToken, MutableTree, Repo, TreeEntry, TreeRecord,
};
use tracing::{info, warn};

const APPSTREAM_XML_DIRS: &[&str] = &["export/share/metainfo", "export/share/appdata"];

/// Read a file's bytes out of a committed tree by `/`-separated path.
fn read_tree_file(repo: &Repo, tree_id: &str, path: &str) -> Result<Option<Vec<u8>>, PublishError> {
    let mut record = TreeRecord::load(repo.objects(), tree_id)?;
    let mut parts = path.split('/').filter(|p| !p.is_empty()).peekable();
    while let Some(part) = parts.next() {
        match record.entries.get(part) {
            Some(TreeEntry::Dir { tree }) if parts.peek().is_some() => {
                record = TreeRecord::load(repo.objects(), tree)?;
            }
            Some(TreeEntry::File { object, .. }) if parts.peek().is_none() => {
                return Ok(Some(repo.objects().get(object)?));
            }
            _ => return Ok(None),
        }
    }
    Ok(None)
}

fn list_tree_dir(repo: &Repo, tree_id: &str, path: &str) -> Result<Vec<String>, PublishError> {
    let mut record = TreeRecord::load(repo.objects(), tree_id)?;
    for part in path.split('/').filter(|p| !p.is_empty()) {
        match record.entries.get(part) {
            Some(TreeEntry::Dir { tree }) => {
                record = TreeRecord::load(repo.objects(), tree)?;
            }
            _ => return Ok(Vec::new()),
        }
    }
    Ok(record.entries.keys().cloned().collect())
}

/// Strip the XML prolog and outer whitespace of one component document.
fn component_body(xml: &str) -> String {
    let mut body = xml.trim();
    if body.starts_with("<?xml") {
        if let Some(end) = body.find("?>") {
            body = body[end + 2..].trim();
        }
    }
    body.to_owned()
}

/// Rebuild `appstream/{arch}` from every app ref of that arch.
///
/// Returns the new commit id, or `None` when no app carries appstream data.
pub fn regenerate_appstream(
    repo: &Repo,
    arch: &str,
    cancel: &CancelToken,
) -> Result<Option<String>, PublishError> {
    let mut components = Vec::new();
    for (refstr, commit_id) in repo.list_refs(Some("app"))? {
        cancel.check()?;
        let Ok(decomposed) = Decomposed::parse(&refstr) else {
            continue;
        };
        if decomposed.arch != arch {
            continue;
        }
        let info = match repo.load_commit(&commit_id) {
            Ok(info) if !info.partial => info,
            _ => {
                warn!("appstream: skipping {refstr}");
                continue;
            }
        };
        for dir in APPSTREAM_XML_DIRS {
            for name in list_tree_dir(repo, &info.record.root_tree, dir)? {
                if !name.ends_with(".xml") {
                    continue;
                }
                if let Some(bytes) =
                    read_tree_file(repo, &info.record.root_tree, &format!("{dir}/{name}"))?
                {
                    match String::from_utf8(bytes) {
                        Ok(xml) => components.push(component_body(&xml)),
                        Err(_) => warn!("appstream: {refstr} ships non-UTF-8 XML {name}"),
                    }
                }
            }
        }
    }

    if components.is_empty() {
        return Ok(None);
    }

    let mut merged = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    merged.push_str("<components version=\"0.8\" origin=\"flatpak\">\n");
    for component in &components {
        merged.push_str(component);
        merged.push('\n');
    }
    merged.push_str("</components>\n");

    let object = repo.objects().put(merged.as_bytes())?;
    let mut mtree = MutableTree::new();
    mtree.insert_file("appstream.xml", &object, 0o644, merged.len() as u64)?;
    let root_tree = mtree.finalize(repo.objects())?;

    let refstr = format!("appstream/{arch}");
    let parent = repo.resolve_rev(&refstr, true)?;
    let commit = repo.write_commit(
        parent.as_deref(),
        &format!("Update {refstr}"),
        "",
        freight_schema::CommitMetadata::new(),
        &root_tree,
        None,
    )?;
    let mut tx = repo.transaction()?;
    tx.set_ref(repo.collection_id(), &refstr, Some(&commit));
    tx.commit()?;
    info!("regenerated {refstr} with {} components", components.len());
    Ok(Some(commit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{export, ExportOptions};
    use std::path::Path;

    fn publish_app_with_metainfo(dir: &Path, repo: &Repo, id: &str) {
        let build = dir.join(format!("build-{id}"));
        std::fs::create_dir_all(build.join("files/bin")).unwrap();
        std::fs::write(build.join("files/bin/run.sh"), b"#!/bin/sh\n").unwrap();
        std::fs::write(
            build.join("metadata"),
            format!("[Application]\nname={id}\n"),
        )
        .unwrap();
        let metainfo = build.join("export/share/metainfo");
        std::fs::create_dir_all(&metainfo).unwrap();
        std::fs::write(
            metainfo.join(format!("{id}.metainfo.xml")),
            format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<component type=\"desktop\"><id>{id}</id></component>\n"
            ),
        )
        .unwrap();
        export(
            repo,
            &build,
            &ExportOptions {
                arch: "x86_64".to_owned(),
                branch: "master".to_owned(),
                timestamp: Some(1_700_000_000),
                ..ExportOptions::default()
            },
        )
        .unwrap();
    }

    #[test]
    fn merges_components_into_appstream_ref() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("repo")).unwrap();
        publish_app_with_metainfo(dir.path(), &repo, "org.test.Hello");
        publish_app_with_metainfo(dir.path(), &repo, "org.test.Other");

        let commit = regenerate_appstream(&repo, "x86_64", &CancelToken::new())
            .unwrap()
            .unwrap();
        assert_eq!(
            repo.resolve_rev("appstream/x86_64", false).unwrap().as_deref(),
            Some(commit.as_str())
        );
        let info = repo.load_commit(&commit).unwrap();
        let xml = read_tree_file(&repo, &info.record.root_tree, "appstream.xml")
            .unwrap()
            .unwrap();
        let text = String::from_utf8(xml).unwrap();
        assert!(text.contains("<id>org.test.Hello</id>"));
        assert!(text.contains("<id>org.test.Other</id>"));
        assert!(text.starts_with("<?xml"));
        // Single prolog only.
        assert_eq!(text.matches("<?xml").count(), 1);
    }

    #[test]
    fn no_appstream_data_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("repo")).unwrap();
        assert!(regenerate_appstream(&repo, "x86_64", &CancelToken::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn other_arch_refs_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("repo")).unwrap();
        publish_app_with_metainfo(dir.path(), &repo, "org.test.Hello");
        assert!(regenerate_appstream(&repo, "aarch64", &CancelToken::new())
            .unwrap()
            .is_none());
    }
}
