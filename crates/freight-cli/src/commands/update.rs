use super::{resolve_ref_arg, run_transaction, CmdResult, InstallationSelector};
use freight_core::Transaction;
use freight_schema::Ref;

pub fn run(
    selector: &InstallationSelector,
    refs: &[String],
    arch: Option<&str>,
    branch: Option<&str>,
    no_deploy: bool,
    no_related: bool,
    assumeyes: bool,
) -> CmdResult {
    let installation = selector.open()?;
    let targets: Vec<Ref> = if refs.is_empty() {
        installation.list_refs(None)?
    } else {
        refs.iter()
            .map(|input| resolve_ref_arg(&installation, input, arch, branch))
            .collect::<Result<_, _>>()?
    };

    let mut tx = Transaction::new(installation);
    tx.set_disable_deploy(no_deploy);
    tx.set_disable_related(no_related);
    for r in &targets {
        tx.add_update(&r.format(), None, None)?;
    }
    if tx.is_empty() {
        println!("Nothing to update.");
        return Ok(std::process::ExitCode::SUCCESS);
    }
    run_transaction(tx, assumeyes)
}
