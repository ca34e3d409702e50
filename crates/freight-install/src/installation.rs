//! An installation: repository, deploys, active/current selection, locks,
//! and lifecycle operations.

use crate::config::InstallationConfig;
use crate::deploy::{deploy_dir_name, DeployLock, OriginInfo};
use crate::exports::update_exports;
use crate::monitor::{bump_counter, FileMonitor};
use crate::InstallError;
use freight_schema::{Overrides, Ref, RefKind};
use freight_store::{CancelToken, CheckoutMode, PruneReport, Repo};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

const REPO_DIR: &str = "repo";
const CURRENT_LINK: &str = "current";
const ACTIVE_LINK: &str = "active";
const REF_LOCK_FILE: &str = ".ref-lock";
const OVERRIDES_DIR: &str = "overrides";
const TRIGGERS_DIR: &str = "triggers";

/// Advisory lock over a whole installation.
///
/// Shared for reads, exclusive for repo-structural writes (prune, summary
/// regeneration). Dropped on scope exit.
pub struct InstallationLock {
    _file: File,
}

/// A resolved installed ref.
#[derive(Debug, Clone)]
pub struct InstalledRef {
    pub ref_: Ref,
    pub deploy_dir: PathBuf,
    pub origin: OriginInfo,
    pub active_commit: String,
    /// Whether this branch is the one exposed by the exports overlay.
    pub is_current: bool,
}

/// A per-installation root hosting a repository and deploys.
pub struct Installation {
    id: String,
    root: PathBuf,
    repo: Repo,
    config: InstallationConfig,
}

impl Installation {
    /// Open (and create if needed) an installation at `root`.
    pub fn open(id: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self, InstallError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| InstallError::io_at(&root, e))?;
        fs::create_dir_all(root.join(OVERRIDES_DIR))?;
        fs::create_dir_all(root.join(TRIGGERS_DIR))?;
        let mut repo = Repo::open(root.join(REPO_DIR))?;
        let config = InstallationConfig::load(&root)?;
        if config.disable_fsync() {
            repo.set_disable_fsync(true)?;
        }
        Ok(Self {
            id: id.into(),
            root,
            repo,
            config,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo(&self) -> &Repo {
        &self.repo
    }

    pub fn config(&self) -> &InstallationConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut InstallationConfig {
        &mut self.config
    }

    pub fn save_config(&self) -> Result<(), InstallError> {
        self.config.save(&self.root)
    }

    /// Reload config from disk (after an external mutation).
    pub fn reload_config(&mut self) -> Result<(), InstallError> {
        self.config = InstallationConfig::load(&self.root)?;
        Ok(())
    }

    fn installation_lock(&self, exclusive: bool) -> Result<InstallationLock, InstallError> {
        let path = self.root.join("lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| InstallError::io_at(&path, e))?;
        let result = if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        };
        result.map_err(|e| InstallError::LockFailed(e.to_string()))?;
        Ok(InstallationLock { _file: file })
    }

    pub fn lock_shared(&self) -> Result<InstallationLock, InstallError> {
        self.installation_lock(false)
    }

    pub fn lock_exclusive(&self) -> Result<InstallationLock, InstallError> {
        self.installation_lock(true)
    }

    /// Branch-level directory of a ref: `{kind}/{name}/{arch}/{branch}`.
    pub fn ref_dir(&self, r: &Ref) -> PathBuf {
        self.root.join(r.deploy_path())
    }

    fn ref_lock(&self, r: &Ref) -> Result<File, InstallError> {
        let dir = self.ref_dir(r);
        fs::create_dir_all(&dir).map_err(|e| InstallError::io_at(&dir, e))?;
        let path = dir.join(REF_LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| InstallError::io_at(&path, e))?;
        file.lock_exclusive()
            .map_err(|e| InstallError::LockFailed(e.to_string()))?;
        Ok(file)
    }

    /// Name of the active deploy directory, if any.
    pub fn active_deploy_name(&self, r: &Ref) -> Option<String> {
        let link = self.ref_dir(r).join(ACTIVE_LINK);
        fs::read_link(link)
            .ok()
            .map(|t| t.to_string_lossy().into_owned())
    }

    /// Commit checksum of the active deploy, if any.
    pub fn active_commit(&self, r: &Ref) -> Option<String> {
        self.active_deploy_name(r).map(|name| name[..64.min(name.len())].to_owned())
    }

    /// Absolute path of the active deploy directory.
    pub fn deploy_dir(&self, r: &Ref) -> Option<PathBuf> {
        let name = self.active_deploy_name(r)?;
        let dir = self.ref_dir(r).join(name);
        dir.is_dir().then_some(dir)
    }

    pub fn is_installed(&self, r: &Ref) -> bool {
        self.deploy_dir(r).is_some()
    }

    fn atomic_symlink(dir: &Path, link_name: &str, target: &str) -> Result<(), InstallError> {
        let tmp = dir.join(format!(".{link_name}.tmp"));
        if tmp.symlink_metadata().is_ok() {
            fs::remove_file(&tmp).map_err(|e| InstallError::io_at(&tmp, e))?;
        }
        std::os::unix::fs::symlink(target, &tmp).map_err(|e| InstallError::io_at(&tmp, e))?;
        fs::rename(&tmp, dir.join(link_name)).map_err(|e| InstallError::io_at(dir, e))?;
        Ok(())
    }

    /// Point `active` at a deploy directory name, or clear it.
    pub fn set_active(&self, r: &Ref, deploy_name: Option<&str>) -> Result<(), InstallError> {
        let dir = self.ref_dir(r);
        match deploy_name {
            Some(name) => Self::atomic_symlink(&dir, ACTIVE_LINK, name)?,
            None => {
                let link = dir.join(ACTIVE_LINK);
                if link.symlink_metadata().is_ok() {
                    fs::remove_file(&link).map_err(|e| InstallError::io_at(&link, e))?;
                }
            }
        }
        Ok(())
    }

    /// The currently exposed `{arch}/{branch}` of an app, if set.
    pub fn current_branch(&self, name: &str) -> Option<(String, String)> {
        let link = self.root.join("app").join(name).join(CURRENT_LINK);
        let target = fs::read_link(link).ok()?;
        let mut parts = target
            .components()
            .filter_map(|c| match c {
                Component::Normal(p) => p.to_str().map(str::to_owned),
                _ => None,
            })
            .collect::<Vec<_>>()
            .into_iter();
        match (parts.next(), parts.next()) {
            (Some(arch), Some(branch)) => Some((arch, branch)),
            _ => None,
        }
    }

    /// Set or clear the exposed branch of an app. Atomic: temp symlink,
    /// rename over.
    pub fn set_current(&self, name: &str, target: Option<(&str, &str)>) -> Result<(), InstallError> {
        let dir = self.root.join("app").join(name);
        match target {
            Some((arch, branch)) => {
                fs::create_dir_all(&dir).map_err(|e| InstallError::io_at(&dir, e))?;
                Self::atomic_symlink(&dir, CURRENT_LINK, &format!("{arch}/{branch}"))?;
            }
            None => {
                let link = dir.join(CURRENT_LINK);
                if link.symlink_metadata().is_ok() {
                    fs::remove_file(&link).map_err(|e| InstallError::io_at(&link, e))?;
                }
            }
        }
        self.mark_changed()?;
        Ok(())
    }

    /// Enumerate installed refs.
    pub fn list_refs(&self, kind: Option<RefKind>) -> Result<Vec<Ref>, InstallError> {
        let mut out = Vec::new();
        let kinds: &[RefKind] = match kind {
            Some(RefKind::App) => &[RefKind::App],
            Some(RefKind::Runtime) => &[RefKind::Runtime],
            None => &[RefKind::App, RefKind::Runtime],
        };
        for k in kinds {
            let kind_dir = self.root.join(k.tag());
            if !kind_dir.is_dir() {
                continue;
            }
            for name in sorted_dirs(&kind_dir)? {
                for arch in sorted_dirs(&kind_dir.join(&name))? {
                    for branch in sorted_dirs(&kind_dir.join(&name).join(&arch))? {
                        let Ok(r) = Ref::new(*k, &name, &arch, &branch) else {
                            continue;
                        };
                        if self.is_installed(&r) {
                            out.push(r);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn get_origin(&self, r: &Ref) -> Result<OriginInfo, InstallError> {
        let dir = self
            .deploy_dir(r)
            .ok_or_else(|| InstallError::NotInstalled(r.format()))?;
        OriginInfo::load(&dir)
    }

    pub fn installed_ref(&self, r: &Ref) -> Result<InstalledRef, InstallError> {
        let deploy_dir = self
            .deploy_dir(r)
            .ok_or_else(|| InstallError::NotInstalled(r.format()))?;
        let origin = OriginInfo::load(&deploy_dir)?;
        let active_commit = self
            .active_commit(r)
            .ok_or_else(|| InstallError::NotInstalled(r.format()))?;
        let is_current = r.kind() == RefKind::App
            && self.current_branch(r.name())
                == Some((r.arch().to_owned(), r.branch().to_owned()));
        Ok(InstalledRef {
            ref_: r.clone(),
            deploy_dir,
            origin,
            active_commit,
            is_current,
        })
    }

    pub fn list_installed(&self, kind: Option<RefKind>) -> Result<Vec<InstalledRef>, InstallError> {
        self.list_refs(kind)?
            .iter()
            .map(|r| self.installed_ref(r))
            .collect()
    }

    /// Deploy a pulled commit for a ref.
    ///
    /// The checkout lands in a staging sibling and is renamed into place;
    /// `active` then flips atomically. For apps with no current branch, the
    /// deployed branch becomes current. Idempotent when the same deploy
    /// already exists.
    pub fn deploy(
        &self,
        r: &Ref,
        commit: &str,
        subpaths: &[String],
        remote_name: &str,
    ) -> Result<PathBuf, InstallError> {
        let _ref_lock = self.ref_lock(r)?;
        if self.repo.is_partial(commit) {
            return Err(InstallError::PartialCommit(commit.to_owned()));
        }
        let info = self.repo.load_commit(commit)?;

        let branch_dir = self.ref_dir(r);
        let dir_name = deploy_dir_name(commit, subpaths);
        let target = branch_dir.join(&dir_name);

        if !target.is_dir() {
            let staging = tempfile::Builder::new()
                .prefix(".deploy-")
                .tempdir_in(&branch_dir)
                .map_err(|e| InstallError::io_at(&branch_dir, e))?;

            let filter = subpath_filter(subpaths);
            let filter_ref: Option<&dyn Fn(&Path) -> bool> = if subpaths.is_empty() {
                None
            } else {
                Some(&filter)
            };
            freight_store::checkout(
                self.repo.objects(),
                &info.record.root_tree,
                staging.path(),
                CheckoutMode::Hardlink,
                filter_ref,
            )?;

            let installed_size = freight_store::installed_size(self.repo.objects(), &info.record.root_tree)?;
            let origin = OriginInfo {
                remote: remote_name.to_owned(),
                ref_name: r.format(),
                subpaths: subpaths.to_vec(),
                installed_size,
            };
            origin.save(staging.path())?;

            // Keep the staging dir from being deleted on drop; rename it over.
            let staging_path = staging.keep();
            fs::rename(&staging_path, &target).map_err(|e| InstallError::io_at(&target, e))?;
        }

        // The repository ref always tracks the deployed commit.
        self.repo.set_ref(None, &r.format(), Some(commit))?;
        self.set_active(r, Some(&dir_name))?;
        if r.kind() == RefKind::App && self.current_branch(r.name()).is_none() {
            self.set_current(r.name(), Some((r.arch(), r.branch())))?;
        }
        if r.kind() == RefKind::App {
            self.update_exports_for(r.name())?;
        }
        self.mark_changed()?;
        info!("deployed {} at {}", r.format_cached(), &commit[..8]);
        Ok(target)
    }

    /// Remove every deploy of a ref, its repo ref, and its branch directory.
    ///
    /// Refuses while any deploy holds a shared (running) lock unless
    /// `force_if_running`.
    pub fn undeploy_all(&self, r: &Ref, force_if_running: bool) -> Result<(), InstallError> {
        let branch_dir = self.ref_dir(r);
        if !branch_dir.is_dir() {
            return Err(InstallError::NotInstalled(r.format()));
        }
        let ref_lock = self.ref_lock(r)?;

        for deploy in sorted_dirs(&branch_dir)? {
            let deploy_dir = branch_dir.join(&deploy);
            if !force_if_running {
                let guard = DeployLock::try_acquire_exclusive(&deploy_dir)?;
                if guard.is_none() {
                    return Err(InstallError::DeployInUse(r.format()));
                }
            }
        }

        // Clear active first so a crash mid-removal never leaves a live
        // symlink at a half-deleted deploy.
        self.set_active(r, None)?;
        for deploy in sorted_dirs(&branch_dir)? {
            let deploy_dir = branch_dir.join(&deploy);
            debug!("removing deploy {}", deploy_dir.display());
            fs::remove_dir_all(&deploy_dir).map_err(|e| InstallError::io_at(&deploy_dir, e))?;
        }
        drop(ref_lock);
        fs::remove_dir_all(&branch_dir).map_err(|e| InstallError::io_at(&branch_dir, e))?;

        self.repo.set_ref(None, &r.format(), None)?;

        if r.kind() == RefKind::App {
            let was_current = self.current_branch(r.name())
                == Some((r.arch().to_owned(), r.branch().to_owned()));
            if was_current {
                // Expose another installed branch if one remains.
                let remaining: Vec<Ref> = self
                    .list_refs(Some(RefKind::App))?
                    .into_iter()
                    .filter(|other| other.name() == r.name())
                    .collect();
                match remaining.first() {
                    Some(next) => self.set_current(r.name(), Some((next.arch(), next.branch())))?,
                    None => self.set_current(r.name(), None)?,
                }
            }
            self.update_exports_for(r.name())?;
        }

        // Drop now-empty name/arch parents.
        remove_empty_parents(&branch_dir, &self.root);
        self.mark_changed()?;
        info!("undeployed {}", r.format_cached());
        Ok(())
    }

    /// Rebuild the exports overlay for one app from its current branch.
    pub fn update_exports_for(&self, app_name: &str) -> Result<(), InstallError> {
        let export_dir = self.current_branch(app_name).and_then(|(arch, branch)| {
            let r = Ref::new(RefKind::App, app_name, arch, branch).ok()?;
            let deploy = self.deploy_dir(&r)?;
            let export = deploy.join("export");
            export.is_dir().then_some(export)
        });
        update_exports(&self.root, app_name, export_dir.as_deref())?;
        self.touch_triggers()?;
        Ok(())
    }

    fn touch_triggers(&self) -> Result<(), InstallError> {
        let stamp = self.root.join(TRIGGERS_DIR).join("exports-changed");
        fs::write(&stamp, chrono::Utc::now().to_rfc3339())
            .map_err(|e| InstallError::io_at(&stamp, e))?;
        Ok(())
    }

    /// Remove unreachable repository objects.
    pub fn prune(&self, cancel: &CancelToken) -> Result<PruneReport, InstallError> {
        let _lock = self.lock_exclusive()?;
        Ok(self.repo.prune(cancel)?)
    }

    /// Drop auto-added `*-origin` remotes that no installed ref uses.
    pub fn cleanup_removed(&mut self) -> Result<(), InstallError> {
        let in_use: Vec<String> = self
            .list_installed(None)?
            .into_iter()
            .map(|ir| ir.origin.remote)
            .collect();
        let mut removed = false;
        for name in self.config.remote_names() {
            if !name.ends_with("-origin") || in_use.iter().any(|r| r == &name) {
                continue;
            }
            let Ok(remote) = self.config.get_remote(&name) else {
                continue;
            };
            if remote.noenumerate {
                debug!("removing unused origin remote '{name}'");
                self.config.remove_remote(&name)?;
                removed = true;
            }
        }
        if removed {
            self.save_config()?;
            self.mark_changed()?;
        }
        Ok(())
    }

    pub fn mark_changed(&self) -> Result<(), InstallError> {
        bump_counter(&self.root)?;
        Ok(())
    }

    pub fn changed_counter(&self) -> u64 {
        crate::monitor::read_counter(&self.root)
    }

    pub fn file_monitor(&self) -> FileMonitor {
        FileMonitor::new(&self.root)
    }

    /// Load the per-app overrides, empty when absent.
    pub fn load_overrides(&self, app_id: &str) -> Result<Overrides, InstallError> {
        let path = self.root.join(OVERRIDES_DIR).join(app_id);
        if !path.exists() {
            return Ok(Overrides::default());
        }
        let text = fs::read_to_string(&path).map_err(|e| InstallError::io_at(&path, e))?;
        Ok(Overrides::parse(&text)?)
    }

    pub fn save_overrides(&self, app_id: &str, overrides: &Overrides) -> Result<(), InstallError> {
        let path = self.root.join(OVERRIDES_DIR).join(app_id);
        fs::write(&path, overrides.to_keyfile().to_text())
            .map_err(|e| InstallError::io_at(&path, e))?;
        self.mark_changed()?;
        Ok(())
    }
}

fn sorted_dirs(dir: &Path) -> Result<Vec<String>, InstallError> {
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir).map_err(|e| InstallError::io_at(dir, e))? {
        let entry = entry?;
        let meta = entry.path().symlink_metadata()?;
        if meta.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    out.push(name.to_owned());
                }
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Include-filter for subpath deploys: everything outside `files/` plus the
/// selected `files/` subtrees (and their ancestors).
fn subpath_filter(subpaths: &[String]) -> impl Fn(&Path) -> bool {
    let normalized: Vec<PathBuf> = subpaths
        .iter()
        .map(|s| Path::new("files").join(s.trim_start_matches('/')))
        .collect();
    move |rel: &Path| {
        if !rel.starts_with("files") || rel == Path::new("files") {
            return true;
        }
        normalized
            .iter()
            .any(|sub| rel.starts_with(sub) || sub.starts_with(rel))
    }
}

fn remove_empty_parents(branch_dir: &Path, stop: &Path) {
    let mut dir = branch_dir.parent().map(Path::to_path_buf);
    while let Some(d) = dir {
        if d == stop || fs::remove_dir(&d).is_err() {
            break;
        }
        dir = d.parent().map(Path::to_path_buf);
    }
}
