pub mod build;
pub mod info;
pub mod install;
pub mod list;
pub mod make_current;
pub mod override_cmd;
pub mod ps;
pub mod remote;
pub mod run_app;
pub mod uninstall;
pub mod update;

use console::style;
use freight_core::{OpKind, OpResult, Transaction, TransactionHooks};
use freight_install::{HostContext, Installation};
use freight_schema::{Ref, RefKind};
use std::process::ExitCode;

pub const EXIT_FAILURE: u8 = 1;
/// Conventional exit status for skipped / unavailable operations.
pub const EXIT_SKIPPED: u8 = 77;

pub type CmdResult = Result<ExitCode, Box<dyn std::error::Error>>;

/// Which installation the global flags select.
#[derive(Debug, Clone, Default)]
pub struct InstallationSelector {
    pub user: bool,
    pub system: bool,
    pub installation: Option<String>,
}

impl InstallationSelector {
    pub fn open(&self) -> Result<Installation, Box<dyn std::error::Error>> {
        let ctx = HostContext::from_env();
        if self.user {
            let home = std::env::var("HOME")?;
            let root = std::path::PathBuf::from(home).join(".local/share/freight");
            return Ok(Installation::open("user", root)?);
        }
        if let Some(ref id) = self.installation {
            let info = ctx.installation_by_id(id)?;
            return Ok(Installation::open(info.id, info.path)?);
        }
        let info = ctx.installation_by_id(freight_install::SYSTEM_INSTALLATION_ID)?;
        Ok(Installation::open(info.id, info.path)?)
    }
}

/// Default arch for partial refs: the configured one, else the host's.
pub fn effective_arch(installation: &Installation, arch: Option<&str>) -> String {
    arch.map(str::to_owned)
        .or_else(|| installation.config().default_arch().map(str::to_owned))
        .unwrap_or_else(|| std::env::consts::ARCH.to_owned())
}

/// Expand a user-typed ref: either the full `kind/name/arch/branch` form or
/// a bare name completed with `--arch`/`--branch` defaults. Bare names
/// prefer whatever is actually installed.
pub fn resolve_ref_arg(
    installation: &Installation,
    input: &str,
    arch: Option<&str>,
    branch: Option<&str>,
) -> Result<Ref, Box<dyn std::error::Error>> {
    if input.contains('/') {
        return Ok(Ref::parse(input)?);
    }
    let arch = effective_arch(installation, arch);
    let branch = branch.unwrap_or("master");
    let app = Ref::new(RefKind::App, input, &arch, branch)?;
    if installation.is_installed(&app) {
        return Ok(app);
    }
    let runtime = Ref::new(RefKind::Runtime, input, &arch, branch)?;
    if installation.is_installed(&runtime) {
        return Ok(runtime);
    }
    Ok(app)
}

fn op_verb(kind: OpKind) -> &'static str {
    match kind {
        OpKind::Install | OpKind::InstallBundle => "Installing",
        OpKind::Update => "Updating",
        OpKind::Uninstall => "Uninstalling",
    }
}

/// Drive a resolved transaction with progress output and an optional
/// interactive confirmation of the operation list.
pub fn run_transaction(mut tx: Transaction, assumeyes: bool) -> CmdResult {
    let mut hooks = TransactionHooks::default();
    hooks.ready = Some(Box::new(move |ops| {
        println!("{}", style("Proposed changes:").bold());
        for op in ops {
            println!("  {:<12} {}", op_verb(op.kind), op.ref_.format());
        }
        if assumeyes || ops.iter().all(|op| op.kind == OpKind::Uninstall) {
            return true;
        }
        dialoguer::Confirm::new()
            .with_prompt("Proceed with these changes?")
            .default(true)
            .interact()
            .unwrap_or(false)
    }));
    let spinner = indicatif::ProgressBar::new_spinner();
    spinner.set_style(
        indicatif::ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_spinner()),
    );
    let op_spinner = spinner.clone();
    hooks.new_operation = Some(Box::new(move |op| {
        op_spinner.set_message(format!("{} {}", op_verb(op.kind), op.ref_.format()));
        op_spinner.tick();
    }));
    let done_spinner = spinner.clone();
    hooks.operation_done = Some(Box::new(move |op, commit, result| {
        let spinner = &done_spinner;
        let commit_note = if commit.is_empty() {
            String::new()
        } else {
            format!(" ({})", &commit[..8.min(commit.len())])
        };
        match result {
            OpResult::Ok => {
                spinner.println(format!(
                    "  {} {}{commit_note}",
                    style("done").green(),
                    op.ref_.format()
                ));
            }
            OpResult::NoChange => {
                spinner.println(format!(
                    "  {} {} is up to date",
                    style("ok").green(),
                    op.ref_.format()
                ));
            }
            OpResult::Skipped => {
                spinner.println(format!("  {} {}", style("skipped").yellow(), op.ref_.format()));
            }
        }
    }));
    hooks.operation_error = Some(Box::new(|op, err| {
        eprintln!(
            "{} {}: {err}",
            style("failed:").red().bold(),
            op.ref_.format()
        );
        false
    }));
    hooks.end_of_lifed = Some(Box::new(|r, reason, rebase| {
        eprintln!(
            "{} {} is end-of-life: {reason}{}",
            style("note:").yellow(),
            r.format(),
            rebase.map(|t| format!(" (replaced by {t})")).unwrap_or_default()
        );
    }));
    hooks.choose_remote_for_ref = Some(Box::new(|r, _runtime, candidates| {
        let selection = dialoguer::Select::new()
            .with_prompt(format!("Remotes providing {}", r.format()))
            .items(candidates)
            .default(0)
            .interact();
        selection.map_or(-1, |i| i as i32)
    }));
    hooks.add_new_remote = Some(Box::new(|_reason, from_id, name, url| {
        println!(
            "Adding remote '{name}' ({url}) suggested by {from_id}"
        );
        true
    }));

    let result = tx.run(&mut hooks);
    spinner.finish_and_clear();
    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(freight_core::CoreError::Aborted) => {
            eprintln!("{}", style("Aborted.").yellow());
            Ok(ExitCode::from(EXIT_SKIPPED))
        }
        Err(e) => Err(e.into()),
    }
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "kB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_size_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 kB");
        assert_eq!(format_size(3_500_000), "3.5 MB");
    }

    #[test]
    fn resolve_full_ref_arg() {
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open("default", dir.path().join("inst")).unwrap();
        let r = resolve_ref_arg(
            &installation,
            "app/org.test.Hello/x86_64/master",
            None,
            None,
        )
        .unwrap();
        assert_eq!(r.name(), "org.test.Hello");
    }

    #[test]
    fn resolve_bare_name_defaults_to_app() {
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open("default", dir.path().join("inst")).unwrap();
        let r = resolve_ref_arg(&installation, "org.test.Hello", Some("x86_64"), None).unwrap();
        assert_eq!(r.format(), "app/org.test.Hello/x86_64/master");
    }
}
