use super::{format_size, CmdResult, InstallationSelector};
use freight_schema::RefKind;
use std::process::ExitCode;

pub fn run(selector: &InstallationSelector, apps_only: bool, runtimes_only: bool) -> CmdResult {
    let installation = selector.open()?;
    let kind = if apps_only {
        Some(RefKind::App)
    } else if runtimes_only {
        Some(RefKind::Runtime)
    } else {
        None
    };
    let installed = installation.list_installed(kind)?;
    if installed.is_empty() {
        println!("Nothing installed.");
        return Ok(ExitCode::SUCCESS);
    }
    println!(
        "{:<40} {:<10} {:<12} {:<10} {:>10}  {}",
        "Ref", "Arch", "Branch", "Origin", "Size", "Active"
    );
    for ir in installed {
        let current_marker = if ir.is_current { " (current)" } else { "" };
        println!(
            "{:<40} {:<10} {:<12} {:<10} {:>10}  {}{current_marker}",
            format!("{}/{}", ir.ref_.kind(), ir.ref_.name()),
            ir.ref_.arch(),
            ir.ref_.branch(),
            ir.origin.remote,
            format_size(ir.origin.installed_size),
            &ir.active_commit[..8.min(ir.active_commit.len())],
        );
    }
    Ok(ExitCode::SUCCESS)
}
