//! Export a build tree into a published commit.
//!
//! The exporter applies the canonical permission filter, validates desktop
//! files and icons, collects extra-data sources, computes size metadata,
//! writes the commit, signs it, and sets the ref transactionally.

use crate::glob::glob_match;
use crate::PublishError;
use freight_schema::variant::{
    Variant, OSTREE_COLLECTION_BINDING, OSTREE_ENDOFLIFE, OSTREE_ENDOFLIFE_REBASE,
    OSTREE_REF_BINDING, XA_DOWNLOAD_SIZE, XA_EXTRA_DATA_SOURCES, XA_INSTALLED_SIZE, XA_METADATA,
    XA_REF, XA_SUBSETS, XA_TOKEN_TYPE,
};
use freight_schema::{parse_metadata, AppMetadata, CommitMetadata, KeyFile};
use freight_store::{
    closure_bytes, installed_size, CancelToken, FileInfo, FilterResult, MutableTree, Repo, Summary,
};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

const ICON_MAX_DIM: u32 = 512;

/// Knobs for one export run.
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub arch: String,
    pub branch: String,
    pub subject: Option<String>,
    pub body: Option<String>,
    /// Commit timestamp override; defaults to now.
    pub timestamp: Option<i64>,
    pub token_type: Option<i32>,
    pub subsets: Vec<String>,
    pub end_of_life: Option<String>,
    pub end_of_life_rebase: Option<String>,
    /// Key ids to sign the commit with.
    pub gpg_keys: Vec<String>,
    pub gpg_homedir: Option<PathBuf>,
    /// Paths under `files/` matching these globs are skipped...
    pub exclude: Vec<String>,
    /// ...unless they also match one of these.
    pub include: Vec<String>,
    /// External icon validator; defaults to `FLATPAK_VALIDATE_ICON`.
    pub icon_validator: Option<PathBuf>,
    /// Regenerate the summary after committing.
    pub update_summary: bool,
}

/// Export `build_dir` into `repo`, returning the new commit id.
pub fn export(repo: &Repo, build_dir: &Path, options: &ExportOptions) -> Result<String, PublishError> {
    let metadata_path = build_dir.join("metadata");
    if !metadata_path.is_file() {
        return Err(PublishError::MissingBuildInput("metadata".to_owned()));
    }
    let metadata_text =
        std::fs::read_to_string(&metadata_path).map_err(PublishError::Io)?;
    let app = parse_metadata(&metadata_text)?;

    // Apps build into files/, runtimes may build into usr/.
    let files_src = if build_dir.join("files").is_dir() {
        build_dir.join("files")
    } else if build_dir.join("usr").is_dir() {
        build_dir.join("usr")
    } else {
        return Err(PublishError::MissingBuildInput("files/ (or usr/)".to_owned()));
    };
    let export_src = build_dir.join("export");

    validate_desktop_files(&app, &export_src, &files_src)?;
    validate_icons(
        &export_src,
        options
            .icon_validator
            .clone()
            .or_else(|| std::env::var_os("FLATPAK_VALIDATE_ICON").map(PathBuf::from))
            .as_deref(),
    )?;

    let refstr = format!(
        "{}/{}/{}/{}",
        app.kind.tag(),
        app.id,
        options.arch,
        options.branch
    );
    // (name, arch, branch) is unique across kinds within a collection.
    let other_kind = match app.kind {
        freight_schema::RefKind::App => "runtime",
        freight_schema::RefKind::Runtime => "app",
    };
    let conflicting = format!("{other_kind}/{}/{}/{}", app.id, options.arch, options.branch);
    if repo.resolve_rev(&conflicting, true)?.is_some() {
        return Err(PublishError::ConflictingRef(conflicting));
    }

    let mut mtree = MutableTree::new();
    let exclude = options.exclude.clone();
    let include = options.include.clone();
    let mut filter = move |path: &Path, info: &mut FileInfo| {
        let rel = path.to_string_lossy();
        if exclude.iter().any(|g| glob_match(g, &rel))
            && !include.iter().any(|g| glob_match(g, &rel))
        {
            return FilterResult::Skip;
        }
        canonicalize_info(info);
        FilterResult::Allow
    };

    // The committed tree always names the payload "files", whatever the
    // build dir called it.
    let objects = repo.objects();
    let mut files_tree = MutableTree::new();
    files_tree.write_directory(objects, &files_src, Some(&mut filter))?;
    mtree.insert_tree("files", files_tree.finalize(objects)?)?;
    if export_src.is_dir() {
        let mut export_tree = MutableTree::new();
        export_tree.write_directory(objects, &export_src, Some(&mut filter))?;
        mtree.insert_tree("export", export_tree.finalize(objects)?)?;
    }
    let metadata_object = objects.put(metadata_text.as_bytes())?;
    mtree.insert_file("metadata", &metadata_object, 0o644, metadata_text.len() as u64)?;

    let root_tree = mtree.finalize(objects)?;

    let tree_installed = installed_size(objects, &root_tree)?;
    let tree_download = closure_bytes(objects, &root_tree)?;
    let extra_installed: u64 = app.extra_data.iter().map(|e| e.installed_size).sum();
    let extra_download: u64 = app.extra_data.iter().map(|e| e.size).sum();

    let mut commit_metadata = CommitMetadata::new();
    commit_metadata.insert(XA_REF.to_owned(), Variant::str(&refstr));
    commit_metadata.insert(
        OSTREE_REF_BINDING.to_owned(),
        Variant::StrList(vec![refstr.clone()]),
    );
    commit_metadata.insert(
        OSTREE_COLLECTION_BINDING.to_owned(),
        Variant::str(repo.collection_id().unwrap_or_default()),
    );
    commit_metadata.insert(XA_METADATA.to_owned(), Variant::str(&metadata_text));
    commit_metadata.insert(
        XA_INSTALLED_SIZE.to_owned(),
        Variant::U64(tree_installed + extra_installed),
    );
    commit_metadata.insert(
        XA_DOWNLOAD_SIZE.to_owned(),
        Variant::U64(tree_download + extra_download),
    );
    if let Some(token_type) = options.token_type {
        commit_metadata.insert(XA_TOKEN_TYPE.to_owned(), Variant::I32(token_type));
    }
    let subsets: Vec<String> = options
        .subsets
        .iter()
        .filter(|s| !s.is_empty())
        .cloned()
        .collect();
    if !subsets.is_empty() {
        commit_metadata.insert(XA_SUBSETS.to_owned(), Variant::StrList(subsets));
    }
    if !app.extra_data.is_empty() {
        commit_metadata.insert(
            XA_EXTRA_DATA_SOURCES.to_owned(),
            Variant::ExtraData(app.extra_data.iter().map(|e| e.to_record()).collect()),
        );
    }
    if let Some(ref eol) = options.end_of_life {
        commit_metadata.insert(OSTREE_ENDOFLIFE.to_owned(), Variant::str(eol));
    }
    if let Some(ref rebase) = options.end_of_life_rebase {
        commit_metadata.insert(OSTREE_ENDOFLIFE_REBASE.to_owned(), Variant::str(rebase));
    }

    let parent = repo.resolve_rev(&refstr, true)?;
    let subject = options
        .subject
        .clone()
        .unwrap_or_else(|| format!("Export {}", app.id));
    let commit_id = repo.write_commit(
        parent.as_deref(),
        &subject,
        options.body.as_deref().unwrap_or(""),
        commit_metadata,
        &root_tree,
        options.timestamp,
    )?;

    for key in &options.gpg_keys {
        repo.sign_commit(&commit_id, key, options.gpg_homedir.as_deref())?;
    }

    let mut tx = repo.transaction()?;
    tx.set_ref(repo.collection_id(), &refstr, Some(&commit_id));
    tx.commit()?;

    if options.update_summary {
        Summary::regenerate(repo, &CancelToken::new())?;
    }
    info!("exported {refstr} as {}", &commit_id[..8]);
    Ok(commit_id)
}

/// The canonical permission rewrite: root-owned, stripped xattrs, 0755
/// directories, 0755/0644 files by the user-executable bit. Idempotent.
fn canonicalize_info(info: &mut FileInfo) {
    info.uid = 0;
    info.gid = 0;
    if info.is_dir {
        info.mode = 0o755;
    } else if !info.is_symlink {
        info.mode = if info.mode & 0o100 != 0 { 0o755 } else { 0o644 };
    }
}

fn validate_desktop_files(
    app: &AppMetadata,
    export_src: &Path,
    files_src: &Path,
) -> Result<(), PublishError> {
    let desktop_path = export_src
        .join("share/applications")
        .join(format!("{}.desktop", app.id));
    if !desktop_path.is_file() {
        return Ok(());
    }
    let file_name = desktop_path.to_string_lossy().into_owned();
    let text = std::fs::read_to_string(&desktop_path).map_err(PublishError::Io)?;
    let kf = KeyFile::parse(&text)?;
    let group = "Desktop Entry";

    if let Some(exec) = kf.get(group, "Exec") {
        let argv0 = exec.split_whitespace().next().unwrap_or("");
        let resolved = files_src.join("bin").join(argv0);
        if !argv0.starts_with('/') && !resolved.is_file() {
            warn!("desktop Exec '{argv0}' does not resolve under files/bin");
        }
    }

    if let Some(icon) = kf.get(group, "Icon") {
        if !icon.starts_with(&app.id) {
            return Err(PublishError::InvalidDesktopFile {
                file: file_name,
                reason: format!("Icon '{icon}' lacks the '{}' prefix", app.id),
            });
        }
    }

    if kf.get_bool(group, "DBusActivatable").ok().flatten() == Some(true) {
        let service_path = export_src
            .join("share/dbus-1/services")
            .join(format!("{}.service", app.id));
        if !service_path.is_file() {
            return Err(PublishError::InvalidDesktopFile {
                file: file_name,
                reason: "DBusActivatable set but no exported D-Bus service file".to_owned(),
            });
        }
        let service_text = std::fs::read_to_string(&service_path).map_err(PublishError::Io)?;
        let service = KeyFile::parse(&service_text)?;
        if service.get("D-BUS Service", "Name") != Some(app.id.as_str()) {
            return Err(PublishError::InvalidDesktopFile {
                file: service_path.to_string_lossy().into_owned(),
                reason: format!("service Name must equal '{}'", app.id),
            });
        }
    }
    Ok(())
}

fn validate_icons(export_src: &Path, validator: Option<&Path>) -> Result<(), PublishError> {
    let icons_root = export_src.join("share/icons/hicolor");
    if !icons_root.is_dir() {
        return Ok(());
    }
    let Some(validator) = validator else {
        debug!("no icon validator configured; skipping icon validation");
        return Ok(());
    };
    let mut stack = vec![icons_root];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).map_err(PublishError::Io)? {
            let entry = entry.map_err(PublishError::Io)?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let status = Command::new(validator)
                    .arg(ICON_MAX_DIM.to_string())
                    .arg(ICON_MAX_DIM.to_string())
                    .arg(&path)
                    .status()
                    .map_err(PublishError::Io)?;
                if !status.success() {
                    return Err(PublishError::InvalidIcon(
                        path.to_string_lossy().into_owned(),
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use freight_store::{checkout, CheckoutMode, TreeEntry, TreeRecord};
    use std::os::unix::fs::PermissionsExt;

    fn write_build_tree(dir: &Path, metadata: &str) -> PathBuf {
        let build = dir.join("build");
        std::fs::create_dir_all(build.join("files/bin")).unwrap();
        std::fs::write(build.join("files/bin/hello.sh"), b"#!/bin/sh\necho hi\n").unwrap();
        std::fs::set_permissions(
            build.join("files/bin/hello.sh"),
            std::fs::Permissions::from_mode(0o700),
        )
        .unwrap();
        std::fs::write(build.join("files/readme"), b"docs").unwrap();
        std::fs::set_permissions(
            build.join("files/readme"),
            std::fs::Permissions::from_mode(0o600),
        )
        .unwrap();
        std::fs::write(build.join("metadata"), metadata).unwrap();
        build
    }

    fn app_metadata() -> &'static str {
        "[Application]\nname=org.test.Hello\nruntime=org.test.Platform/x86_64/master\ncommand=hello.sh\n"
    }

    fn options() -> ExportOptions {
        ExportOptions {
            arch: "x86_64".to_owned(),
            branch: "master".to_owned(),
            timestamp: Some(1_700_000_000),
            ..ExportOptions::default()
        }
    }

    fn load_file_entry(repo: &Repo, commit: &str, path: &[&str]) -> TreeEntry {
        let mut record = repo.read_commit(commit).unwrap();
        for (i, part) in path.iter().enumerate() {
            let entry = record.entries.get(*part).cloned().unwrap();
            if i == path.len() - 1 {
                return entry;
            }
            match entry {
                TreeEntry::Dir { tree } => {
                    record = TreeRecord::load(repo.objects(), &tree).unwrap();
                }
                other => return other,
            }
        }
        unreachable!("empty path");
    }

    #[test]
    fn export_sets_ref_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("repo")).unwrap();
        let build = write_build_tree(dir.path(), app_metadata());
        let commit = export(&repo, &build, &options()).unwrap();

        let resolved = repo
            .resolve_rev("app/org.test.Hello/x86_64/master", false)
            .unwrap();
        assert_eq!(resolved.as_deref(), Some(commit.as_str()));

        let info = repo.load_commit(&commit).unwrap();
        let md = &info.record.metadata;
        assert_eq!(
            md.get(XA_REF).and_then(Variant::as_str),
            Some("app/org.test.Hello/x86_64/master")
        );
        let binding = md.get(OSTREE_REF_BINDING).unwrap();
        assert_eq!(
            binding.as_str_list().unwrap(),
            &["app/org.test.Hello/x86_64/master".to_owned()]
        );
        assert!(md.get(XA_INSTALLED_SIZE).and_then(Variant::as_u64).unwrap() > 0);
        assert!(md.get(XA_DOWNLOAD_SIZE).and_then(Variant::as_u64).unwrap() > 0);
    }

    #[test]
    fn canonical_permissions_applied() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("repo")).unwrap();
        let build = write_build_tree(dir.path(), app_metadata());
        let commit = export(&repo, &build, &options()).unwrap();

        // 0700 executable becomes 0755, 0600 file becomes 0644.
        let TreeEntry::File { mode, .. } = load_file_entry(&repo, &commit, &["files", "bin", "hello.sh"])
        else {
            panic!("hello.sh must be a file");
        };
        assert_eq!(mode, 0o755);
        let TreeEntry::File { mode, .. } = load_file_entry(&repo, &commit, &["files", "readme"])
        else {
            panic!("readme must be a file");
        };
        assert_eq!(mode, 0o644);
    }

    #[test]
    fn export_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let repo_a = Repo::open(dir.path().join("a")).unwrap();
        let repo_b = Repo::open(dir.path().join("b")).unwrap();
        let build = write_build_tree(dir.path(), app_metadata());
        let c1 = export(&repo_a, &build, &options()).unwrap();
        let c2 = export(&repo_b, &build, &options()).unwrap();
        assert_eq!(c1, c2);
    }

    #[test]
    fn reexport_is_idempotent_tree() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("repo")).unwrap();
        let build = write_build_tree(dir.path(), app_metadata());
        let c1 = export(&repo, &build, &options()).unwrap();

        // Re-export the checked-out deploy of the first commit; mode
        // canonicalisation is idempotent, so the tree id is unchanged.
        let info1 = repo.load_commit(&c1).unwrap();
        let build2 = dir.path().join("build2");
        checkout(
            repo.objects(),
            &info1.record.root_tree,
            &build2,
            CheckoutMode::Copy,
            None,
        )
        .unwrap();
        let c2 = export(&repo, &build2, &options()).unwrap();
        let info2 = repo.load_commit(&c2).unwrap();
        assert_eq!(info1.record.root_tree, info2.record.root_tree);
        // Second export has the first as parent.
        assert_eq!(info2.record.parent.as_deref(), Some(c1.as_str()));
    }

    #[test]
    fn exclude_globs_skip_files() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("repo")).unwrap();
        let build = write_build_tree(dir.path(), app_metadata());
        let mut opts = options();
        opts.exclude = vec!["readme".to_owned()];
        let commit = export(&repo, &build, &opts).unwrap();

        let TreeEntry::Dir { tree } = load_file_entry(&repo, &commit, &["files"]) else {
            panic!("files must be a dir");
        };
        let files = TreeRecord::load(repo.objects(), &tree).unwrap();
        assert!(!files.entries.contains_key("readme"));
        assert!(files.entries.contains_key("bin"));
    }

    #[test]
    fn include_glob_overrides_exclude() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("repo")).unwrap();
        let build = write_build_tree(dir.path(), app_metadata());
        let mut opts = options();
        opts.exclude = vec!["*".to_owned()];
        opts.include = vec!["bin".to_owned(), "bin/**".to_owned()];
        let commit = export(&repo, &build, &opts).unwrap();
        let TreeEntry::Dir { tree } = load_file_entry(&repo, &commit, &["files"]) else {
            panic!("files must be a dir");
        };
        let files = TreeRecord::load(repo.objects(), &tree).unwrap();
        assert!(files.entries.contains_key("bin"));
        assert!(!files.entries.contains_key("readme"));
    }

    #[test]
    fn runtime_usr_dir_becomes_files() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("repo")).unwrap();
        let build = dir.path().join("build");
        std::fs::create_dir_all(build.join("usr/lib")).unwrap();
        std::fs::write(build.join("usr/lib/libplatform.so"), b"ELF").unwrap();
        std::fs::write(build.join("metadata"), "[Runtime]\nname=org.test.Platform\n").unwrap();
        let commit = export(&repo, &build, &options()).unwrap();
        assert!(repo
            .resolve_rev("runtime/org.test.Platform/x86_64/master", true)
            .unwrap()
            .is_some());
        assert!(matches!(
            load_file_entry(&repo, &commit, &["files"]),
            TreeEntry::Dir { .. }
        ));
    }

    #[test]
    fn extra_data_lands_in_commit_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("repo")).unwrap();
        let metadata = format!(
            "[Application]\nname=org.test.Hello\n\n[Extra Data]\nname=blob\nuri=https://example.com/blob\nchecksum={}\nsize=100\ninstalled-size=200\n",
            "ab".repeat(32)
        );
        let build = write_build_tree(dir.path(), &metadata);
        let commit = export(&repo, &build, &options()).unwrap();
        let info = repo.load_commit(&commit).unwrap();
        let Variant::ExtraData(sources) = info
            .record
            .metadata
            .get(XA_EXTRA_DATA_SOURCES)
            .unwrap()
            .clone()
        else {
            panic!("extra data sources must be present");
        };
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].size, 100);
        // Sizes account for the extra data.
        let installed = info
            .record
            .metadata
            .get(XA_INSTALLED_SIZE)
            .and_then(Variant::as_u64)
            .unwrap();
        assert!(installed >= 200);
    }

    #[test]
    fn missing_metadata_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("repo")).unwrap();
        std::fs::create_dir_all(dir.path().join("empty/files")).unwrap();
        let err = export(&repo, &dir.path().join("empty"), &options()).unwrap_err();
        assert!(matches!(err, PublishError::MissingBuildInput(_)));
    }

    #[test]
    fn desktop_icon_prefix_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("repo")).unwrap();
        let build = write_build_tree(dir.path(), app_metadata());
        let apps = build.join("export/share/applications");
        std::fs::create_dir_all(&apps).unwrap();
        std::fs::write(
            apps.join("org.test.Hello.desktop"),
            "[Desktop Entry]\nExec=hello.sh\nIcon=wrong-name\n",
        )
        .unwrap();
        let err = export(&repo, &build, &options()).unwrap_err();
        assert!(matches!(err, PublishError::InvalidDesktopFile { .. }));
    }

    #[test]
    fn dbus_activatable_requires_service_file() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("repo")).unwrap();
        let build = write_build_tree(dir.path(), app_metadata());
        let apps = build.join("export/share/applications");
        std::fs::create_dir_all(&apps).unwrap();
        std::fs::write(
            apps.join("org.test.Hello.desktop"),
            "[Desktop Entry]\nExec=hello.sh\nIcon=org.test.Hello\nDBusActivatable=true\n",
        )
        .unwrap();
        assert!(export(&repo, &build, &options()).is_err());

        // With a matching service file the export goes through.
        let services = build.join("export/share/dbus-1/services");
        std::fs::create_dir_all(&services).unwrap();
        std::fs::write(
            services.join("org.test.Hello.service"),
            "[D-BUS Service]\nName=org.test.Hello\nExec=/app/bin/hello.sh\n",
        )
        .unwrap();
        assert!(export(&repo, &build, &options()).is_ok());
    }

    #[test]
    fn cross_kind_ref_conflict_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("repo")).unwrap();
        let build = write_build_tree(dir.path(), app_metadata());
        export(&repo, &build, &options()).unwrap();

        // A runtime under the same (name, arch, branch) is refused.
        let clash = dir.path().join("clash");
        std::fs::create_dir_all(clash.join("usr")).unwrap();
        std::fs::write(clash.join("usr/lib.so"), b"ELF").unwrap();
        std::fs::write(clash.join("metadata"), "[Runtime]\nname=org.test.Hello\n").unwrap();
        let err = export(&repo, &clash, &options()).unwrap_err();
        assert!(matches!(err, PublishError::ConflictingRef(_)));
    }

    #[test]
    fn update_summary_publishes_index() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::open(dir.path().join("repo")).unwrap();
        let build = write_build_tree(dir.path(), app_metadata());
        let mut opts = options();
        opts.update_summary = true;
        export(&repo, &build, &opts).unwrap();
        let summary = Summary::load(&repo).unwrap().unwrap();
        assert!(summary.refs.contains_key("app/org.test.Hello/x86_64/master"));
    }
}
