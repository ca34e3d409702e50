use super::{format_size, resolve_ref_arg, CmdResult, InstallationSelector};
use std::process::ExitCode;

pub fn run(
    selector: &InstallationSelector,
    input: &str,
    arch: Option<&str>,
    branch: Option<&str>,
) -> CmdResult {
    let installation = selector.open()?;
    let r = resolve_ref_arg(&installation, input, arch, branch)?;
    let ir = installation.installed_ref(&r)?;

    println!("Ref: {}", ir.ref_.format());
    println!("Origin: {}", ir.origin.remote);
    println!("Commit: {}", ir.active_commit);
    println!("Deploy: {}", ir.deploy_dir.display());
    println!("Installed size: {}", format_size(ir.origin.installed_size));
    if !ir.origin.subpaths.is_empty() {
        println!("Subpaths: {}", ir.origin.subpaths.join(";"));
    }
    if ir.is_current {
        println!("Current: yes");
    }
    Ok(ExitCode::SUCCESS)
}
