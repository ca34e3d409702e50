use super::{CmdResult, InstallationSelector};
use freight_schema::PermissionToggle;
use std::process::ExitCode;

#[allow(clippy::too_many_arguments)]
pub fn run(
    selector: &InstallationSelector,
    app_id: &str,
    devices: &[String],
    shares: &[String],
    filesystems: &[String],
    env: &[String],
    show: bool,
) -> CmdResult {
    let installation = selector.open()?;
    let mut overrides = installation.load_overrides(app_id)?;

    if show {
        print!("{}", overrides.to_keyfile().to_text());
        return Ok(ExitCode::SUCCESS);
    }

    let apply = |list: &mut Vec<PermissionToggle>, inputs: &[String]| {
        for raw in inputs {
            let toggle = PermissionToggle::parse(raw);
            if let Some(existing) = list.iter_mut().find(|t| t.name == toggle.name) {
                existing.enabled = toggle.enabled;
            } else {
                list.push(toggle);
            }
        }
    };
    apply(&mut overrides.devices, devices);
    apply(&mut overrides.shared, shares);
    apply(&mut overrides.filesystems, filesystems);
    for pair in env {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("--env takes VAR=VALUE, got '{pair}'"))?;
        overrides.environment.insert(key.to_owned(), value.to_owned());
    }

    installation.save_overrides(app_id, &overrides)?;
    println!("Updated overrides for {app_id}");
    Ok(ExitCode::SUCCESS)
}
