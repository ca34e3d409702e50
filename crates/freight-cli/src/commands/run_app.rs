use super::{resolve_ref_arg, CmdResult, InstallationSelector};
use freight_runtime::{build_launch_descriptor, bwrap_path, InstanceRegistry, LaunchOptions};
use std::process::{Command, ExitCode};
use tracing::debug;

pub fn run(
    selector: &InstallationSelector,
    input: &str,
    arch: Option<&str>,
    branch: Option<&str>,
    command: Option<&str>,
    args: &[String],
) -> CmdResult {
    let installation = selector.open()?;
    let app_ref = resolve_ref_arg(&installation, input, arch, branch)?;

    let options = LaunchOptions {
        command: command.map(str::to_owned),
        args: args.to_vec(),
        ..LaunchOptions::default()
    };
    let descriptor = build_launch_descriptor(&installation, &bwrap_path(), &app_ref, &options)?;
    debug!("spawning sandbox: {:?}", descriptor.argv);

    let mut child = Command::new(&descriptor.argv[0])
        .args(&descriptor.argv[1..])
        .envs(&descriptor.env)
        .spawn()?;

    let registry = InstanceRegistry::from_env();
    let instance = registry.allocate(&descriptor.info, child.id(), false)?;
    debug!("instance {} running as pid {}", instance.id, child.id());

    let status = child.wait()?;
    Ok(ExitCode::from(
        status.code().map_or(super::EXIT_FAILURE, |c| c as u8),
    ))
}
