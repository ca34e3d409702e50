//! The transaction engine: an arena of operations with dependency edges,
//! resolved against remote summaries and executed in topological order with
//! synchronous hooks.

use crate::resolver::related_refs_for;
use crate::CoreError;
use freight_install::Installation;
use freight_schema::{parse_metadata, KeyFile, Ref, RefKind};
use freight_store::{fetch_summary, CancelToken, PullFlags, Summary};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Handle of an operation inside the transaction's arena.
pub type OpId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Install,
    Update,
    InstallBundle,
    Uninstall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    Ok,
    NoChange,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Building,
    Ready,
    Running,
    Done,
    Aborted,
}

/// One node of the operation graph.
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OpKind,
    pub ref_: Ref,
    pub remote: String,
    pub commit: Option<String>,
    pub subpaths: Vec<String>,
    pub bundle_path: Option<PathBuf>,
    pub download_size: u64,
    /// Ops that must complete before this one.
    pub(crate) depends_on: Vec<OpId>,
    /// Runtime ref string this artifact executes against, once resolved.
    pub(crate) runtime_dep: Option<String>,
    /// Whether resolution already ran (ops added mid-resolve are resolved
    /// inline and must not re-fire hooks).
    pub(crate) resolved: bool,
    /// Remote to create before executing (flatpakref / bundle install).
    pub(crate) suggested_remote: Option<(String, String)>,
}

impl Operation {
    fn new(kind: OpKind, ref_: Ref, remote: String) -> Self {
        Self {
            kind,
            ref_,
            remote,
            commit: None,
            subpaths: Vec::new(),
            bundle_path: None,
            download_size: 0,
            depends_on: Vec::new(),
            runtime_dep: None,
            resolved: false,
            suggested_remote: None,
        }
    }
}

/// Synchronous callbacks invoked by [`Transaction::run`] on the caller's
/// thread. Every hook is optional; absent hooks take the documented
/// default.
#[derive(Default)]
pub struct TransactionHooks<'a> {
    /// After resolution, before any pull. Return `false` to abort.
    pub ready: Option<Box<dyn FnMut(&[Operation]) -> bool + 'a>>,
    /// Before each operation runs.
    pub new_operation: Option<Box<dyn FnMut(&Operation) + 'a>>,
    /// After each operation, with the deployed commit (empty for
    /// uninstalls) and the result.
    pub operation_done: Option<Box<dyn FnMut(&Operation, &str, OpResult) + 'a>>,
    /// On operation failure. Return `true` to continue with remaining ops.
    pub operation_error: Option<Box<dyn FnMut(&Operation, &CoreError) -> bool + 'a>>,
    /// Pick among candidate remotes for a dependency; return the index or
    /// -1 to skip the dependency.
    pub choose_remote_for_ref: Option<Box<dyn FnMut(&Ref, &str, &[String]) -> i32 + 'a>>,
    /// A flatpakref or bundle suggests a new remote `(reason, from_id,
    /// name, url)`. Return `true` to add it.
    pub add_new_remote: Option<Box<dyn FnMut(&str, &str, &str, &str) -> bool + 'a>>,
    /// End-of-life metadata discovered for a ref.
    pub end_of_lifed: Option<Box<dyn FnMut(&Ref, &str, Option<&str>) + 'a>>,
    /// A token-typed ref needs an authenticator. Return `true` once it is
    /// available.
    pub install_authenticator: Option<Box<dyn FnMut(&str, &str) -> bool + 'a>>,
}

/// A unit of work against one installation.
pub struct Transaction {
    installation: Installation,
    dependency_sources: Vec<Installation>,
    ops: Vec<Operation>,
    state: TransactionState,
    disable_dependencies: bool,
    disable_related: bool,
    disable_prune: bool,
    disable_deploy: bool,
    no_pull: bool,
    reinstall: bool,
    force_uninstall: bool,
    default_arch: String,
    cancel: CancelToken,
    summaries: BTreeMap<String, Summary>,
    current_op: Option<OpId>,
}

impl Transaction {
    pub fn new(installation: Installation) -> Self {
        let default_arch = installation
            .config()
            .default_arch()
            .unwrap_or(std::env::consts::ARCH)
            .to_owned();
        Self {
            installation,
            dependency_sources: Vec::new(),
            ops: Vec::new(),
            state: TransactionState::Building,
            disable_dependencies: false,
            disable_related: false,
            disable_prune: false,
            disable_deploy: false,
            no_pull: false,
            reinstall: false,
            force_uninstall: false,
            default_arch,
            cancel: CancelToken::new(),
            summaries: BTreeMap::new(),
            current_op: None,
        }
    }

    pub fn installation(&self) -> &Installation {
        &self.installation
    }

    /// Tear down and hand the installation back.
    pub fn into_installation(self) -> Installation {
        self.installation
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn set_disable_dependencies(&mut self, v: bool) {
        self.disable_dependencies = v;
    }

    pub fn set_disable_related(&mut self, v: bool) {
        self.disable_related = v;
    }

    pub fn set_disable_prune(&mut self, v: bool) {
        self.disable_prune = v;
    }

    /// Pull content but do not deploy it.
    pub fn set_disable_deploy(&mut self, v: bool) {
        self.disable_deploy = v;
    }

    pub fn set_no_pull(&mut self, v: bool) {
        self.no_pull = v;
    }

    pub fn set_reinstall(&mut self, v: bool) {
        self.reinstall = v;
    }

    pub fn set_force_uninstall(&mut self, v: bool) {
        self.force_uninstall = v;
    }

    pub fn set_default_arch(&mut self, arch: &str) {
        self.default_arch = arch.to_owned();
    }

    /// Additional read-only installations consulted when deciding whether a
    /// dependency is already satisfied.
    pub fn add_dependency_source(&mut self, installation: Installation) {
        self.dependency_sources.push(installation);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.ops
    }

    /// The operation currently executing, while [`run`](Self::run) is live.
    pub fn current_operation(&self) -> Option<&Operation> {
        self.current_op.map(|id| &self.ops[id])
    }

    fn find_op(&self, r: &Ref) -> Option<OpId> {
        self.ops.iter().position(|op| {
            op.ref_.kind() == r.kind()
                && op.ref_.name() == r.name()
                && op.ref_.arch() == r.arch()
                && op.ref_.branch() == r.branch()
        })
    }

    fn is_installed_anywhere(&self, r: &Ref) -> bool {
        self.installation.is_installed(r)
            || self.dependency_sources.iter().any(|i| i.is_installed(r))
    }

    pub fn add_install(
        &mut self,
        remote: &str,
        refstr: &str,
        subpaths: &[String],
    ) -> Result<(), CoreError> {
        self.installation
            .config()
            .get_remote(remote)
            .map_err(|_| CoreError::RemoteNotFound(remote.to_owned()))?;
        let r = Ref::parse(refstr)?;
        if let Some(existing) = self.find_op(&r) {
            // An install supersedes a queued update of the same ref.
            let op = &mut self.ops[existing];
            if op.kind == OpKind::Update {
                op.kind = OpKind::Install;
            }
            for sp in subpaths {
                if !op.subpaths.contains(sp) {
                    op.subpaths.push(sp.clone());
                }
            }
            return Ok(());
        }
        let mut op = Operation::new(OpKind::Install, r, remote.to_owned());
        op.subpaths = subpaths.to_vec();
        self.ops.push(op);
        Ok(())
    }

    pub fn add_update(
        &mut self,
        refstr: &str,
        subpaths: Option<&[String]>,
        commit: Option<&str>,
    ) -> Result<(), CoreError> {
        let r = Ref::parse(refstr)?;
        let origin = self
            .installation
            .get_origin(&r)
            .map_err(|_| CoreError::NotInstalled(refstr.to_owned()))?;
        if let Some(existing) = self.find_op(&r) {
            // Collapses into a queued install at the latest commit.
            if let Some(c) = commit {
                self.ops[existing].commit = Some(c.to_owned());
            }
            return Ok(());
        }
        let mut op = Operation::new(OpKind::Update, r, origin.remote.clone());
        op.subpaths = subpaths.map_or(origin.subpaths, <[String]>::to_vec);
        op.commit = commit.map(str::to_owned);
        self.ops.push(op);
        Ok(())
    }

    pub fn add_uninstall(&mut self, refstr: &str) -> Result<(), CoreError> {
        let r = Ref::parse(refstr)?;
        if !self.installation.is_installed(&r) {
            return Err(CoreError::NotInstalled(refstr.to_owned()));
        }
        let origin = self.installation.get_origin(&r)?;
        if self.find_op(&r).is_some() {
            return Ok(());
        }
        self.ops
            .push(Operation::new(OpKind::Uninstall, r, origin.remote));
        Ok(())
    }

    pub fn add_install_bundle(&mut self, path: &std::path::Path) -> Result<(), CoreError> {
        let bundle = freight_store::load_bundle(path)?;
        let r = Ref::parse(&bundle.ref_name)?;
        let (remote_name, suggested) = match bundle
            .origin_url
            .as_ref()
            .and_then(|url| self.remote_name_for_url(url))
        {
            Some(existing) => (existing, None),
            None => {
                let name = format!("{}-origin", r.name());
                (
                    name.clone(),
                    bundle.origin_url.clone().map(|url| (name, url)),
                )
            }
        };
        let mut op = Operation::new(OpKind::InstallBundle, r, remote_name);
        op.bundle_path = Some(path.to_path_buf());
        op.commit = Some(bundle.commit.clone());
        op.download_size = bundle.installed_size;
        op.suggested_remote = suggested;
        self.ops.push(op);
        Ok(())
    }

    /// Queue an install described by a `.flatpakref` file.
    pub fn add_install_flatpakref(&mut self, data: &[u8]) -> Result<(), CoreError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| CoreError::InvalidData("flatpakref is not UTF-8".to_owned()))?;
        let kf = KeyFile::parse(text)?;
        let group = "Flatpak Ref";
        let name = kf.require(group, "Name")?.to_owned();
        let url = kf.require(group, "Url")?.to_owned();
        let branch = kf.get(group, "Branch").unwrap_or("master").to_owned();
        let is_runtime = kf.get_bool(group, "IsRuntime")?.unwrap_or(false);
        let kind = if is_runtime {
            RefKind::Runtime
        } else {
            RefKind::App
        };
        let r = Ref::new(kind, name.clone(), self.default_arch.clone(), branch)?;

        let (remote_name, suggested) = match self.remote_name_for_url(&url) {
            Some(existing) => (existing, None),
            None => {
                let suggested_name = kf
                    .get(group, "SuggestRemoteName")
                    .map_or_else(|| format!("{name}-origin"), str::to_owned);
                (suggested_name.clone(), Some((suggested_name, url)))
            }
        };
        let mut op = Operation::new(OpKind::Install, r, remote_name);
        op.suggested_remote = suggested;
        self.ops.push(op);
        Ok(())
    }

    fn remote_name_for_url(&self, url: &str) -> Option<String> {
        let trimmed = url.trim_end_matches('/');
        self.installation
            .config()
            .remote_names()
            .into_iter()
            .find(|name| {
                self.installation
                    .config()
                    .get_remote(name)
                    .is_ok_and(|r| r.url.trim_end_matches('/') == trimmed)
            })
    }

    fn summary_for(&mut self, remote_name: &str) -> Result<&Summary, CoreError> {
        if !self.summaries.contains_key(remote_name) {
            let remote = self
                .installation
                .config()
                .get_remote(remote_name)
                .map_err(|_| CoreError::RemoteNotFound(remote_name.to_owned()))?;
            let summary = fetch_summary(&remote.url)?;
            self.summaries.insert(remote_name.to_owned(), summary);
        }
        Ok(&self.summaries[remote_name])
    }

    /// Resolve the op graph: commits, dependencies, related refs, conflicts
    /// and ordering. Performs no mutation of the installation.
    fn resolve(&mut self, hooks: &mut TransactionHooks<'_>) -> Result<(), CoreError> {
        let languages = self.installation.config().languages();
        let mut i = 0;
        while i < self.ops.len() {
            self.cancel.check().map_err(CoreError::Store)?;
            let kind = self.ops[i].kind;
            match kind {
                OpKind::Uninstall | OpKind::InstallBundle => {}
                OpKind::Install | OpKind::Update => {
                    // Ops created from a flatpakref have no remote yet;
                    // their summary is only reachable once the remote is
                    // added at execution time, so resolution is skipped.
                    if self.ops[i].suggested_remote.is_some() || self.ops[i].resolved {
                        i += 1;
                        continue;
                    }
                    self.resolve_remote_op(i, hooks, &languages)?;
                }
            }
            i += 1;
        }

        self.detect_conflicts()?;
        self.order_uninstalls();
        self.check_acyclic()?;
        Ok(())
    }

    fn resolve_remote_op(
        &mut self,
        id: OpId,
        hooks: &mut TransactionHooks<'_>,
        languages: &[String],
    ) -> Result<(), CoreError> {
        let remote_name = self.ops[id].remote.clone();
        let ref_string = self.ops[id].ref_.format();
        self.ops[id].resolved = true;
        let entry = {
            let found = self.summary_for(&remote_name)?.refs.get(&ref_string).cloned();
            match found {
                Some(entry) => entry,
                None => {
                    // Point the caller at a remote that actually has it.
                    if let Some(other) = self.find_ref_elsewhere(&ref_string, &remote_name) {
                        return Err(CoreError::DifferentRemote {
                            ref_name: ref_string,
                            requested: remote_name,
                            available: other,
                        });
                    }
                    return Err(CoreError::NotFound(format!("{ref_string} in {remote_name}")));
                }
            }
        };

        if self.ops[id].commit.is_none() {
            self.ops[id].commit = Some(entry.commit.clone());
        }
        self.ops[id].download_size = entry.download_size;

        if let Some(ref eol) = entry.eol {
            if let Some(cb) = hooks.end_of_lifed.as_mut() {
                cb(&self.ops[id].ref_, eol, entry.eol_rebase.as_deref());
            }
        } else if let Some(ref rebase) = entry.eol_rebase {
            if let Some(cb) = hooks.end_of_lifed.as_mut() {
                cb(&self.ops[id].ref_, "", Some(rebase));
            }
        }

        if entry.token_type.unwrap_or(0) > 0 {
            let ready = hooks
                .install_authenticator
                .as_mut()
                .is_some_and(|cb| cb(&remote_name, &ref_string));
            if !ready {
                return Err(CoreError::AuthenticationFailed(ref_string));
            }
        }

        let Some(metadata_text) = entry.metadata else {
            return Ok(());
        };
        let metadata = parse_metadata(&metadata_text)?;

        if let Some(ref needed) = metadata.required_version {
            if version_newer_than_self(needed) {
                return Err(CoreError::NeedNewFormat(ref_string, needed.clone()));
            }
        }

        if !self.disable_dependencies {
            if let Some(runtime) = metadata.runtime.clone() {
                self.resolve_runtime_dep(id, &runtime, hooks)?;
            }
        }

        if !self.disable_related {
            let parent = self.ops[id].ref_.clone();
            let related = {
                let summary = self.summary_for(&remote_name)?;
                related_refs_for(&metadata, &parent, summary, languages)
            };
            for rel in related {
                if !rel.should_download {
                    continue;
                }
                if self.find_op(&rel.ref_).is_some() {
                    continue;
                }
                let rel_entry = self
                    .summary_for(&remote_name)?
                    .refs
                    .get(rel.ref_.format_cached())
                    .cloned();
                let Some(rel_entry) = rel_entry else {
                    continue;
                };
                if let Some(active) = self.installation.active_commit(&rel.ref_) {
                    let origin = self.installation.get_origin(&rel.ref_)?;
                    if active == rel_entry.commit && origin.subpaths == rel.subpaths {
                        continue;
                    }
                    let mut op =
                        Operation::new(OpKind::Update, rel.ref_.clone(), remote_name.clone());
                    op.subpaths = rel.subpaths.clone();
                    op.commit = Some(rel_entry.commit);
                    op.download_size = rel_entry.download_size;
                    self.ops.push(op);
                } else if !self.is_installed_anywhere(&rel.ref_) {
                    let mut op =
                        Operation::new(OpKind::Install, rel.ref_.clone(), remote_name.clone());
                    op.subpaths = rel.subpaths.clone();
                    op.commit = Some(rel_entry.commit);
                    op.download_size = rel_entry.download_size;
                    self.ops.push(op);
                }
            }
        }
        Ok(())
    }

    /// First other enumerable remote publishing a ref, if any.
    fn find_ref_elsewhere(&mut self, ref_string: &str, requested: &str) -> Option<String> {
        let remotes = self.installation.config().enumerable_remotes();
        for remote in remotes {
            if remote.name == requested {
                continue;
            }
            if let Ok(summary) = self.summary_for(&remote.name) {
                if summary.refs.contains_key(ref_string) {
                    return Some(remote.name);
                }
            }
        }
        None
    }

    /// Queue the runtime an artifact needs, selecting a remote.
    fn resolve_runtime_dep(
        &mut self,
        dependent: OpId,
        runtime: &str,
        hooks: &mut TransactionHooks<'_>,
    ) -> Result<(), CoreError> {
        let runtime_ref = Ref::parse(&format!("runtime/{runtime}"))?;
        self.ops[dependent].runtime_dep = Some(runtime_ref.format());

        if let Some(existing) = self.find_op(&runtime_ref) {
            if matches!(self.ops[existing].kind, OpKind::Install | OpKind::Update) {
                self.ops[dependent].depends_on.push(existing);
            }
            return Ok(());
        }
        if self.is_installed_anywhere(&runtime_ref) {
            return Ok(());
        }

        // Prefer the dependent's own remote; otherwise every enabled
        // non-nodeps remote that publishes the runtime is a candidate.
        let target_remote = self.ops[dependent].remote.clone();
        let mut candidates: Vec<String> = Vec::new();
        if self
            .summary_for(&target_remote)?
            .refs
            .contains_key(runtime_ref.format_cached())
        {
            candidates.push(target_remote.clone());
        } else {
            let dep_remotes = self.installation.config().dependency_remotes();
            for remote in dep_remotes {
                match self.summary_for(&remote.name) {
                    Ok(summary) => {
                        if summary.refs.contains_key(runtime_ref.format_cached()) {
                            candidates.push(remote.name);
                        }
                    }
                    Err(e) => warn!("skipping remote '{}': {e}", remote.name),
                }
            }
        }

        let chosen = match candidates.len() {
            0 => {
                return Err(CoreError::NotFound(format!(
                    "runtime {} in any configured remote",
                    runtime_ref.format_cached()
                )))
            }
            1 => candidates.remove(0),
            _ => {
                let index = hooks
                    .choose_remote_for_ref
                    .as_mut()
                    .map_or(0, |cb| cb(&runtime_ref, runtime, &candidates));
                if index < 0 {
                    debug!("dependency {} skipped by chooser", runtime_ref.format_cached());
                    return Ok(());
                }
                candidates
                    .get(index as usize)
                    .cloned()
                    .ok_or_else(|| CoreError::InvalidData("remote chooser index out of range".to_owned()))?
            }
        };

        let op = Operation::new(OpKind::Install, runtime_ref, chosen);
        let new_id = self.ops.len();
        self.ops.push(op);
        self.ops[dependent].depends_on.push(new_id);
        // Resolve the new runtime op in place (its own related refs etc.).
        let languages = self.installation.config().languages();
        self.resolve_remote_op(new_id, hooks, &languages)?;
        Ok(())
    }

    /// An uninstall of a runtime still referenced by an installed or queued
    /// app aborts, unless the app is queued for uninstall too.
    fn detect_conflicts(&mut self) -> Result<(), CoreError> {
        let uninstalled_runtimes: Vec<(OpId, String)> = self
            .ops
            .iter()
            .enumerate()
            .filter(|(_, op)| op.kind == OpKind::Uninstall && op.ref_.kind() == RefKind::Runtime)
            .map(|(id, op)| (id, op.ref_.format()))
            .collect();
        if uninstalled_runtimes.is_empty() {
            return Ok(());
        }
        let queued_uninstalls: Vec<String> = self
            .ops
            .iter()
            .filter(|op| op.kind == OpKind::Uninstall)
            .map(|op| op.ref_.format())
            .collect();

        for (_, runtime) in &uninstalled_runtimes {
            // Installed apps that keep needing the runtime.
            for installed in self.installation.list_installed(Some(RefKind::App))? {
                let app_ref = installed.ref_.format();
                if queued_uninstalls.contains(&app_ref) {
                    continue;
                }
                if let Some(needed) = installed_runtime_dep(&installed.deploy_dir) {
                    if &needed == runtime {
                        return Err(CoreError::RuntimeUsed {
                            runtime: runtime.clone(),
                            used_by: app_ref,
                        });
                    }
                }
            }
            // Queued installs that need it.
            for op in &self.ops {
                if matches!(op.kind, OpKind::Install | OpKind::Update)
                    && op.runtime_dep.as_deref() == Some(runtime.as_str())
                {
                    return Err(CoreError::RuntimeUsed {
                        runtime: runtime.clone(),
                        used_by: op.ref_.format(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Uninstall-of-app runs before uninstall-of-its-runtime.
    fn order_uninstalls(&mut self) {
        let app_uninstalls: Vec<(OpId, Option<String>)> = self
            .ops
            .iter()
            .enumerate()
            .filter(|(_, op)| op.kind == OpKind::Uninstall && op.ref_.kind() == RefKind::App)
            .map(|(id, op)| {
                let dep = self
                    .installation
                    .deploy_dir(&op.ref_)
                    .and_then(|d| installed_runtime_dep(&d));
                (id, dep)
            })
            .collect();
        for i in 0..self.ops.len() {
            if self.ops[i].kind != OpKind::Uninstall || self.ops[i].ref_.kind() != RefKind::Runtime
            {
                continue;
            }
            let runtime = self.ops[i].ref_.format();
            for (app_id, dep) in &app_uninstalls {
                if dep.as_deref() == Some(runtime.as_str()) {
                    self.ops[i].depends_on.push(*app_id);
                }
            }
        }
    }

    fn check_acyclic(&self) -> Result<(), CoreError> {
        // 0 = unvisited, 1 = on stack, 2 = done
        fn visit(ops: &[Operation], id: OpId, state: &mut [u8]) -> Result<(), OpId> {
            match state[id] {
                1 => return Err(id),
                2 => return Ok(()),
                _ => {}
            }
            state[id] = 1;
            for &dep in &ops[id].depends_on {
                visit(ops, dep, state)?;
            }
            state[id] = 2;
            Ok(())
        }
        let mut state = vec![0u8; self.ops.len()];
        for id in 0..self.ops.len() {
            if let Err(node) = visit(&self.ops, id, &mut state) {
                return Err(CoreError::CircularDependency(self.ops[node].ref_.format()));
            }
        }
        Ok(())
    }

    fn topo_order(&self) -> Vec<OpId> {
        fn visit(ops: &[Operation], id: OpId, seen: &mut [bool], out: &mut Vec<OpId>) {
            if seen[id] {
                return;
            }
            seen[id] = true;
            for &dep in &ops[id].depends_on {
                visit(ops, dep, seen, out);
            }
            out.push(id);
        }
        let mut seen = vec![false; self.ops.len()];
        let mut out = Vec::with_capacity(self.ops.len());
        for id in 0..self.ops.len() {
            visit(&self.ops, id, &mut seen, &mut out);
        }
        out
    }

    /// Resolve, confirm via `ready`, then execute every operation.
    pub fn run(&mut self, hooks: &mut TransactionHooks<'_>) -> Result<(), CoreError> {
        self.resolve(hooks)?;
        self.state = TransactionState::Ready;

        if let Some(ready) = hooks.ready.as_mut() {
            if !ready(&self.ops) {
                self.state = TransactionState::Aborted;
                return Err(CoreError::Aborted);
            }
        }

        self.state = TransactionState::Running;
        let order = self.topo_order();
        let mut any_uninstall = false;

        for id in order {
            if self.cancel.is_cancelled() {
                // Signals are never raised after cancellation.
                self.state = TransactionState::Aborted;
                return Err(CoreError::Store(freight_store::StoreError::Cancelled));
            }
            self.current_op = Some(id);
            let op_snapshot = self.ops[id].clone();
            if let Some(cb) = hooks.new_operation.as_mut() {
                cb(&op_snapshot);
            }
            match self.execute_op(id, hooks) {
                Ok(result) => {
                    if self.ops[id].kind == OpKind::Uninstall {
                        any_uninstall = true;
                    }
                    let commit = self.ops[id].commit.clone().unwrap_or_default();
                    if let Some(cb) = hooks.operation_done.as_mut() {
                        cb(&self.ops[id], &commit, result);
                    }
                }
                Err(e) => {
                    let wrapped = e.in_op(&op_snapshot.ref_.format(), &op_snapshot.remote);
                    let keep_going = hooks
                        .operation_error
                        .as_mut()
                        .is_some_and(|cb| cb(&op_snapshot, &wrapped));
                    if !keep_going {
                        self.state = TransactionState::Aborted;
                        return Err(wrapped);
                    }
                    warn!("continuing past failed operation: {wrapped}");
                }
            }
        }

        self.current_op = None;
        if any_uninstall && !self.disable_prune {
            self.installation.prune(&self.cancel)?;
        }
        self.installation.cleanup_removed()?;
        self.state = TransactionState::Done;
        info!("transaction complete: {} operations", self.ops.len());
        Ok(())
    }

    fn ensure_suggested_remote(
        &mut self,
        id: OpId,
        hooks: &mut TransactionHooks<'_>,
    ) -> Result<(), CoreError> {
        let Some((name, url)) = self.ops[id].suggested_remote.clone() else {
            return Ok(());
        };
        let from_id = self.ops[id].ref_.name().to_owned();
        let accepted = hooks
            .add_new_remote
            .as_mut()
            .is_some_and(|cb| cb("install", &from_id, &name, &url));
        if !accepted {
            return Err(CoreError::RemoteNotFound(name));
        }
        let mut remote = freight_install::Remote::new(&name, &url);
        remote.noenumerate = true;
        remote.gpg_verify = false;
        remote.gpg_verify_summary = false;
        self.installation.config_mut().set_remote(&remote)?;
        self.installation.save_config()?;
        self.ops[id].suggested_remote = None;

        // With the remote in place the op can finally resolve.
        if self.ops[id].kind == OpKind::Install && self.ops[id].commit.is_none() {
            let languages = self.installation.config().languages();
            self.resolve_remote_op(id, hooks, &languages)?;
        }
        Ok(())
    }

    fn execute_op(
        &mut self,
        id: OpId,
        hooks: &mut TransactionHooks<'_>,
    ) -> Result<OpResult, CoreError> {
        self.ensure_suggested_remote(id, hooks)?;
        let op = self.ops[id].clone();
        match op.kind {
            OpKind::Uninstall => {
                self.installation
                    .undeploy_all(&op.ref_, self.force_uninstall)?;
                Ok(OpResult::Ok)
            }
            OpKind::InstallBundle => {
                let path = op
                    .bundle_path
                    .as_ref()
                    .ok_or_else(|| CoreError::InvalidData("bundle op without a path".to_owned()))?;
                let bundle = freight_store::import_bundle(self.installation.repo(), path)?;
                self.installation
                    .repo()
                    .set_ref(None, &op.ref_.format(), Some(&bundle.commit))?;
                if self.disable_deploy {
                    return Ok(OpResult::Ok);
                }
                self.installation
                    .deploy(&op.ref_, &bundle.commit, &[], &op.remote)?;
                Ok(OpResult::Ok)
            }
            OpKind::Install | OpKind::Update => {
                let commit = op
                    .commit
                    .clone()
                    .ok_or_else(|| CoreError::InvalidData("unresolved operation".to_owned()))?;

                let active = self.installation.active_commit(&op.ref_);
                if let Some(active) = &active {
                    let origin = self.installation.get_origin(&op.ref_)?;
                    if *active == commit && origin.subpaths == op.subpaths {
                        if op.kind == OpKind::Install && !self.reinstall {
                            return Err(CoreError::AlreadyInstalled(op.ref_.format()));
                        }
                        return Ok(OpResult::NoChange);
                    }
                    if op.kind == OpKind::Install && !self.reinstall {
                        return Err(CoreError::AlreadyInstalled(op.ref_.format()));
                    }
                }

                if !self.no_pull {
                    let remote = self.installation.config().get_remote(&op.remote)?;
                    freight_store::pull(
                        self.installation.repo(),
                        &remote.url,
                        PullFlags::default(),
                        &[&op.ref_.format()],
                        None,
                        &self.cancel,
                    )?;
                }
                if self.disable_deploy {
                    // Content is in the repository but no deploy exists;
                    // callers treat this as success.
                    debug!("{}: pulled only", op.ref_.format_cached());
                    return Ok(OpResult::Ok);
                }
                self.installation
                    .deploy(&op.ref_, &commit, &op.subpaths, &op.remote)?;
                Ok(OpResult::Ok)
            }
        }
    }
}

/// Runtime ref string an installed deploy declares, read from its metadata.
fn installed_runtime_dep(deploy_dir: &std::path::Path) -> Option<String> {
    let text = std::fs::read_to_string(deploy_dir.join("metadata")).ok()?;
    let metadata = parse_metadata(&text).ok()?;
    metadata.runtime.map(|r| format!("runtime/{r}"))
}

/// Whether `required` names a version newer than this client.
fn version_newer_than_self(required: &str) -> bool {
    fn parse(v: &str) -> Vec<u64> {
        v.split('.').map(|p| p.parse().unwrap_or(0)).collect()
    }
    let ours = parse(env!("CARGO_PKG_VERSION"));
    let needed = parse(required);
    needed > ours
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_comparison() {
        assert!(version_newer_than_self("99.0.0"));
        assert!(!version_newer_than_self("0.0.1"));
        assert!(!version_newer_than_self(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn empty_transaction_reports_empty() {
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open("default", dir.path().join("inst")).unwrap();
        let tx = Transaction::new(installation);
        assert!(tx.is_empty());
        assert_eq!(tx.state(), TransactionState::Building);
    }

    #[test]
    fn add_install_requires_known_remote() {
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open("default", dir.path().join("inst")).unwrap();
        let mut tx = Transaction::new(installation);
        let err = tx
            .add_install("nowhere", "app/org.test.Hello/x86_64/master", &[])
            .unwrap_err();
        assert!(matches!(err, CoreError::RemoteNotFound(_)));
    }

    #[test]
    fn add_update_requires_installed_ref() {
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open("default", dir.path().join("inst")).unwrap();
        let mut tx = Transaction::new(installation);
        let err = tx
            .add_update("app/org.test.Hello/x86_64/master", None, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::NotInstalled(_)));
    }

    #[test]
    fn add_uninstall_requires_installed_ref() {
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open("default", dir.path().join("inst")).unwrap();
        let mut tx = Transaction::new(installation);
        let err = tx.add_uninstall("app/org.test.Hello/x86_64/master").unwrap_err();
        assert!(matches!(err, CoreError::NotInstalled(_)));
    }

    #[test]
    fn install_supersedes_queued_update() {
        let dir = tempfile::tempdir().unwrap();
        let mut installation = Installation::open("default", dir.path().join("inst")).unwrap();
        installation
            .config_mut()
            .set_remote(&freight_install::Remote::new(
                "test-repo",
                "https://example.com/repo",
            ))
            .unwrap();
        let mut tx = Transaction::new(installation);
        tx.add_install("test-repo", "app/org.test.Hello/x86_64/master", &[])
            .unwrap();
        tx.add_install("test-repo", "app/org.test.Hello/x86_64/master", &[])
            .unwrap();
        assert_eq!(tx.operations().len(), 1);
        assert_eq!(tx.operations()[0].kind, OpKind::Install);
    }

    #[test]
    fn cycle_detection_trips() {
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open("default", dir.path().join("inst")).unwrap();
        let mut tx = Transaction::new(installation);
        let a = Ref::parse("app/org.test.A/x86_64/master").unwrap();
        let b = Ref::parse("app/org.test.B/x86_64/master").unwrap();
        tx.ops.push(Operation::new(OpKind::Install, a, "r".to_owned()));
        tx.ops.push(Operation::new(OpKind::Install, b, "r".to_owned()));
        tx.ops[0].depends_on.push(1);
        tx.ops[1].depends_on.push(0);
        assert!(matches!(
            tx.check_acyclic(),
            Err(CoreError::CircularDependency(_))
        ));
    }

    #[test]
    fn topo_order_puts_dependencies_first() {
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open("default", dir.path().join("inst")).unwrap();
        let mut tx = Transaction::new(installation);
        let a = Ref::parse("app/org.test.A/x86_64/master").unwrap();
        let b = Ref::parse("runtime/org.test.B/x86_64/master").unwrap();
        tx.ops.push(Operation::new(OpKind::Install, a, "r".to_owned()));
        tx.ops.push(Operation::new(OpKind::Install, b, "r".to_owned()));
        tx.ops[0].depends_on.push(1);
        let order = tx.topo_order();
        assert_eq!(order, vec![1, 0]);
    }
}
