use super::CmdResult;
use freight_runtime::InstanceRegistry;
use std::process::ExitCode;

pub fn run() -> CmdResult {
    let registry = InstanceRegistry::from_env();
    let instances = registry.get_all()?;
    if instances.is_empty() {
        println!("No running instances.");
        return Ok(ExitCode::SUCCESS);
    }
    println!(
        "{:<6} {:<30} {:<10} {:<10} {:<40}",
        "Id", "Application", "PID", "Child", "Runtime"
    );
    for inst in instances {
        println!(
            "{:<6} {:<30} {:<10} {:<10} {:<40}",
            inst.id, inst.app, inst.pid, inst.child_pid, inst.runtime
        );
    }
    Ok(ExitCode::SUCCESS)
}
