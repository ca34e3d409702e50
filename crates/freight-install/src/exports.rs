//! The merged exports overlay: symlinks from `exports/` into the current
//! deploy of each app, making desktop files, icons, D-Bus services, and
//! MIME XML visible to the host.

use crate::InstallError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const EXPORTS_DIR: &str = "exports";

/// Subtrees of a deploy's `export/` directory that are merged.
const EXPORTED_SUBTREES: &[&str] = &[
    "share/applications",
    "share/icons",
    "share/dbus-1/services",
    "share/mime/packages",
];

/// Rebuild the overlay contribution of one app.
///
/// All existing links pointing into any deploy of `app_name` are dropped,
/// then the given export dir (the active deploy of the current branch, or
/// `None` when the app is gone) is re-linked. Only the current branch
/// contributes; other installed branches are invisible to the host.
pub fn update_exports(
    root: &Path,
    app_name: &str,
    export_dir: Option<&Path>,
) -> Result<(), InstallError> {
    let exports_root = root.join(EXPORTS_DIR);
    let app_prefix = root.join("app").join(app_name);
    remove_links_into(&exports_root, &app_prefix)?;

    if let Some(export_dir) = export_dir {
        for subtree in EXPORTED_SUBTREES {
            let src_base = export_dir.join(subtree);
            if !src_base.is_dir() {
                continue;
            }
            link_tree(&src_base, &exports_root.join(subtree))?;
        }
    }
    prune_empty_dirs(&exports_root)?;
    Ok(())
}

fn link_tree(src: &Path, dest: &Path) -> Result<(), InstallError> {
    fs::create_dir_all(dest).map_err(|e| InstallError::io_at(dest, e))?;
    for entry in fs::read_dir(src).map_err(|e| InstallError::io_at(src, e))? {
        let entry = entry?;
        let src_path = entry.path();
        let dest_path = dest.join(entry.file_name());
        if src_path.is_dir() {
            link_tree(&src_path, &dest_path)?;
        } else {
            if dest_path.symlink_metadata().is_ok() {
                fs::remove_file(&dest_path).map_err(|e| InstallError::io_at(&dest_path, e))?;
            }
            debug!("export {} -> {}", dest_path.display(), src_path.display());
            std::os::unix::fs::symlink(&src_path, &dest_path)
                .map_err(|e| InstallError::io_at(&dest_path, e))?;
        }
    }
    Ok(())
}

fn remove_links_into(dir: &Path, target_prefix: &Path) -> Result<(), InstallError> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir).map_err(|e| InstallError::io_at(dir, e))? {
        let entry = entry?;
        let path = entry.path();
        let meta = path.symlink_metadata().map_err(|e| InstallError::io_at(&path, e))?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&path).map_err(|e| InstallError::io_at(&path, e))?;
            // Also drop dangling links, whatever their target.
            if target.starts_with(target_prefix) || !target.exists() {
                fs::remove_file(&path).map_err(|e| InstallError::io_at(&path, e))?;
            }
        } else if meta.is_dir() {
            remove_links_into(&path, target_prefix)?;
        }
    }
    Ok(())
}

fn prune_empty_dirs(dir: &Path) -> Result<(), InstallError> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir).map_err(|e| InstallError::io_at(dir, e))? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            prune_empty_dirs(&path)?;
            let _ = fs::remove_dir(&path);
        }
    }
    Ok(())
}

/// Every exported file currently visible in the overlay, relative to
/// `exports/`.
pub fn list_exports(root: &Path) -> Result<Vec<PathBuf>, InstallError> {
    let exports_root = root.join(EXPORTS_DIR);
    let mut out = Vec::new();
    if !exports_root.exists() {
        return Ok(out);
    }
    let mut stack = vec![exports_root.clone()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).map_err(|e| InstallError::io_at(&dir, e))? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && !path.symlink_metadata()?.file_type().is_symlink() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(&exports_root) {
                out.push(rel.to_path_buf());
            }
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_deploy(root: &Path, app: &str, branch: &str, desktop: &str) -> PathBuf {
        let deploy = root
            .join("app")
            .join(app)
            .join("x86_64")
            .join(branch)
            .join("c0".repeat(32));
        let export = deploy.join("export");
        let apps_dir = export.join("share/applications");
        fs::create_dir_all(&apps_dir).unwrap();
        fs::write(apps_dir.join(desktop), b"[Desktop Entry]\n").unwrap();
        let icons = export.join("share/icons/hicolor/64x64/apps");
        fs::create_dir_all(&icons).unwrap();
        fs::write(icons.join(format!("{app}.png")), b"PNG").unwrap();
        export
    }

    #[test]
    fn exports_link_desktop_and_icons() {
        let dir = tempfile::tempdir().unwrap();
        let export = fake_deploy(dir.path(), "org.test.Hello", "master", "org.test.Hello.desktop");
        update_exports(dir.path(), "org.test.Hello", Some(&export)).unwrap();

        let link = dir
            .path()
            .join("exports/share/applications/org.test.Hello.desktop");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        let files = list_exports(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn removing_app_clears_its_links() {
        let dir = tempfile::tempdir().unwrap();
        let export = fake_deploy(dir.path(), "org.test.Hello", "master", "org.test.Hello.desktop");
        update_exports(dir.path(), "org.test.Hello", Some(&export)).unwrap();
        update_exports(dir.path(), "org.test.Hello", None).unwrap();
        assert!(list_exports(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn switching_branch_replaces_links() {
        let dir = tempfile::tempdir().unwrap();
        let master = fake_deploy(dir.path(), "org.test.Hello", "master", "org.test.Hello.desktop");
        update_exports(dir.path(), "org.test.Hello", Some(&master)).unwrap();
        let beta = fake_deploy(dir.path(), "org.test.Hello", "beta", "org.test.Hello.desktop");
        update_exports(dir.path(), "org.test.Hello", Some(&beta)).unwrap();

        let link = dir
            .path()
            .join("exports/share/applications/org.test.Hello.desktop");
        let target = fs::read_link(&link).unwrap();
        assert!(target.starts_with(dir.path().join("app/org.test.Hello/x86_64/beta")));
    }

    #[test]
    fn other_apps_links_survive() {
        let dir = tempfile::tempdir().unwrap();
        let hello = fake_deploy(dir.path(), "org.test.Hello", "master", "org.test.Hello.desktop");
        let other = fake_deploy(dir.path(), "org.test.Other", "master", "org.test.Other.desktop");
        update_exports(dir.path(), "org.test.Hello", Some(&hello)).unwrap();
        update_exports(dir.path(), "org.test.Other", Some(&other)).unwrap();
        update_exports(dir.path(), "org.test.Hello", None).unwrap();

        let files = list_exports(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files
            .iter()
            .all(|f| f.to_string_lossy().contains("Other")));
    }

    #[test]
    fn dangling_links_are_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let apps = dir.path().join("exports/share/applications");
        fs::create_dir_all(&apps).unwrap();
        std::os::unix::fs::symlink("/nonexistent/target", apps.join("stale.desktop")).unwrap();
        update_exports(dir.path(), "org.test.Hello", None).unwrap();
        assert!(list_exports(dir.path()).unwrap().is_empty());
    }
}
