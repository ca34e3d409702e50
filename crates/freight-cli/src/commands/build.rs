use super::CmdResult;
use console::style;
use freight_publish::{regenerate_appstream, CommitFromOptions, ExportOptions};
use freight_schema::{Decomposed, KeyFile};
use freight_store::{CancelToken, Repo, Summary};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Scaffold a build directory: `files/`, `var/`, and a metadata skeleton.
pub fn init(
    directory: &Path,
    app_id: &str,
    sdk: &str,
    runtime: &str,
    arch: Option<&str>,
    branch: &str,
) -> CmdResult {
    if directory.join("metadata").exists() {
        return Err(format!("{} is already initialized", directory.display()).into());
    }
    std::fs::create_dir_all(directory.join("files"))?;
    std::fs::create_dir_all(directory.join("var"))?;

    let arch = arch.unwrap_or(std::env::consts::ARCH);
    let mut metadata = KeyFile::new();
    metadata.set("Application", "name", app_id);
    metadata.set("Application", "runtime", format!("{runtime}/{arch}/{branch}"));
    metadata.set("Application", "sdk", format!("{sdk}/{arch}/{branch}"));
    std::fs::write(directory.join("metadata"), metadata.to_text())?;
    println!("Initialized build directory {}", directory.display());
    Ok(ExitCode::SUCCESS)
}

/// Finalize a build: record the command and collect `files/share` exports.
pub fn finish(directory: &Path, command: Option<&str>) -> CmdResult {
    let metadata_path = directory.join("metadata");
    let text = std::fs::read_to_string(&metadata_path)?;
    let mut metadata = KeyFile::parse(&text)?;
    let group = if metadata.has_group("Runtime") {
        "Runtime"
    } else {
        "Application"
    };
    if let Some(command) = command {
        metadata.set(group, "command", command);
    }
    std::fs::write(&metadata_path, metadata.to_text())?;

    // Collect exportable data from files/share into export/.
    for subtree in ["applications", "icons", "dbus-1/services", "mime/packages"] {
        let src = directory.join("files/share").join(subtree);
        if !src.is_dir() {
            continue;
        }
        let dest = directory.join("export/share").join(subtree);
        copy_dir(&src, &dest)?;
    }
    println!("Finished build directory {}", directory.display());
    Ok(ExitCode::SUCCESS)
}

fn copy_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

pub struct ExportArgs {
    pub repo: PathBuf,
    pub directory: PathBuf,
    pub arch: Option<String>,
    pub branch: String,
    pub gpg_sign: Vec<String>,
    pub gpg_homedir: Option<PathBuf>,
    pub end_of_life: Option<String>,
    pub end_of_life_rebase: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub exclude: Vec<String>,
    pub include: Vec<String>,
    pub update_summary: bool,
}

pub fn export(args: ExportArgs) -> CmdResult {
    let repo = Repo::open(&args.repo)?;
    let options = ExportOptions {
        arch: args
            .arch
            .unwrap_or_else(|| std::env::consts::ARCH.to_owned()),
        branch: args.branch,
        subject: args.subject,
        body: args.body,
        gpg_keys: args.gpg_sign,
        gpg_homedir: args.gpg_homedir,
        end_of_life: args.end_of_life,
        end_of_life_rebase: args.end_of_life_rebase,
        exclude: args.exclude,
        include: args.include,
        update_summary: args.update_summary,
        ..ExportOptions::default()
    };
    let commit = freight_publish::export(&repo, &args.directory, &options)?;
    println!("Exported commit {}", style(&commit[..8]).green());
    Ok(ExitCode::SUCCESS)
}

pub fn bundle(
    repo_path: &Path,
    filename: &Path,
    refstr: &str,
    repo_url: Option<&str>,
    runtime_repo: Option<&str>,
) -> CmdResult {
    let repo = Repo::open(repo_path)?;
    let info = freight_store::create_bundle(&repo, refstr, filename, repo_url, runtime_repo, None)?;
    println!(
        "Wrote bundle {} ({} at {})",
        filename.display(),
        info.ref_name,
        &info.commit[..8]
    );
    Ok(ExitCode::SUCCESS)
}

pub struct CommitFromArgs {
    pub dst_repo: PathBuf,
    pub src_repo: PathBuf,
    pub src_ref: Option<String>,
    pub refs: Vec<String>,
    pub force: bool,
    pub timestamp: Option<i64>,
    pub end_of_life: Option<String>,
    pub end_of_life_rebase: Option<String>,
    pub gpg_sign: Vec<String>,
    pub update_summary: bool,
}

pub fn commit_from(args: CommitFromArgs) -> CmdResult {
    if args.src_ref.is_some() && args.refs.len() != 1 {
        return Err("--src-ref requires exactly one destination ref".into());
    }
    let src = Repo::open(&args.src_repo)?;
    let dst = Repo::open(&args.dst_repo)?;
    let options = CommitFromOptions {
        force: args.force,
        timestamp: args.timestamp,
        end_of_life: args.end_of_life.clone(),
        end_of_life_rebase: args.end_of_life_rebase.clone(),
        gpg_keys: args.gpg_sign.clone(),
        update_summary: false,
        ..CommitFromOptions::default()
    };
    for dst_ref in &args.refs {
        let src_ref = args.src_ref.as_deref().unwrap_or(dst_ref);
        let outcome = freight_publish::commit_from(&src, src_ref, &dst, dst_ref, &options)?;
        if outcome.changed {
            println!("{dst_ref}: {}", style(&outcome.commit[..8]).green());
        } else {
            println!("{dst_ref}: no change");
        }
    }
    if args.update_summary {
        Summary::regenerate(&dst, &CancelToken::new())?;
    }
    Ok(ExitCode::SUCCESS)
}

pub fn sign(
    repo_path: &Path,
    refstr: &str,
    keys: &[String],
    gpg_homedir: Option<&Path>,
) -> CmdResult {
    let repo = Repo::open(repo_path)?;
    let commit = repo
        .resolve_rev(refstr, false)?
        .ok_or_else(|| format!("no such ref {refstr}"))?;
    for key in keys {
        repo.sign_commit(&commit, key, gpg_homedir)?;
    }
    println!("Signed {} with {} key(s)", &commit[..8], keys.len());
    Ok(ExitCode::SUCCESS)
}

pub fn update_repo(repo_path: &Path, keys: &[String], gpg_homedir: Option<&Path>) -> CmdResult {
    let repo = Repo::open(repo_path)?;
    let cancel = CancelToken::new();
    let summary = Summary::regenerate(&repo, &cancel)?;

    // One appstream branch per published arch.
    let arches: BTreeSet<String> = summary
        .refs
        .keys()
        .filter_map(|r| Decomposed::parse(r).ok().map(|d| d.arch.to_owned()))
        .collect();
    for arch in arches {
        if regenerate_appstream(&repo, &arch, &cancel)?.is_some() {
            println!("Updated appstream/{arch}");
        }
    }
    // Appstream commits are new refs; refresh the index to include them.
    let summary = Summary::regenerate(&repo, &cancel)?;
    for key in keys {
        Summary::sign(&repo, key, gpg_homedir)?;
    }
    println!("Summary lists {} refs", summary.refs.len());
    Ok(ExitCode::SUCCESS)
}
