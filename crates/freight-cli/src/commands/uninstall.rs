use super::{resolve_ref_arg, run_transaction, CmdResult, InstallationSelector};
use console::style;
use freight_core::Transaction;

pub fn run(
    selector: &InstallationSelector,
    refs: &[String],
    arch: Option<&str>,
    branch: Option<&str>,
    force_remove: bool,
    assumeyes: bool,
) -> CmdResult {
    let installation = selector.open()?;

    if !assumeyes {
        println!("{}", style("About to uninstall:").bold());
        for input in refs {
            println!("  {input}");
        }
        let confirmed = dialoguer::Confirm::new()
            .with_prompt("Proceed?")
            .default(true)
            .interact()
            .unwrap_or(false);
        if !confirmed {
            return Ok(std::process::ExitCode::from(super::EXIT_SKIPPED));
        }
    }

    let mut tx = Transaction::new(installation);
    tx.set_force_uninstall(force_remove);
    for input in refs {
        let r = resolve_ref_arg(tx.installation(), input, arch, branch)?;
        tx.add_uninstall(&r.format())?;
    }
    run_transaction(tx, true)
}
