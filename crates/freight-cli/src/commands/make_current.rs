use super::{effective_arch, CmdResult, InstallationSelector};
use freight_schema::{Ref, RefKind};
use std::process::ExitCode;

pub fn run(
    selector: &InstallationSelector,
    app_id: &str,
    branch: &str,
    arch: Option<&str>,
) -> CmdResult {
    let installation = selector.open()?;
    let arch = effective_arch(&installation, arch);
    let r = Ref::new(RefKind::App, app_id, &arch, branch)?;
    if !installation.is_installed(&r) {
        return Err(format!("{} is not installed", r.format()).into());
    }
    installation.set_current(app_id, Some((arch.as_str(), branch)))?;
    installation.update_exports_for(app_id)?;
    println!("{app_id} now exposes {arch}/{branch}");
    Ok(ExitCode::SUCCESS)
}
