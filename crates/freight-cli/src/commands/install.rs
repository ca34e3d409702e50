use super::{resolve_ref_arg, run_transaction, CmdResult, InstallationSelector};
use freight_core::Transaction;
use std::path::Path;

#[allow(clippy::too_many_arguments, clippy::fn_params_excessive_bools)]
pub fn run(
    selector: &InstallationSelector,
    remote: &str,
    refs: &[String],
    arch: Option<&str>,
    branch: Option<&str>,
    no_deploy: bool,
    no_deps: bool,
    no_related: bool,
    reinstall: bool,
    assumeyes: bool,
) -> CmdResult {
    let installation = selector.open()?;
    let mut tx = Transaction::new(installation);
    tx.set_disable_deploy(no_deploy);
    tx.set_disable_dependencies(no_deps);
    tx.set_disable_related(no_related);
    tx.set_reinstall(reinstall);

    for input in refs {
        // Bundles and flatpakref files install directly from disk.
        let path = Path::new(input);
        if path.is_file() {
            if input.ends_with(".flatpakref") {
                tx.add_install_flatpakref(&std::fs::read(path)?)?;
            } else {
                tx.add_install_bundle(path)?;
            }
            continue;
        }
        let r = resolve_ref_arg(tx.installation(), input, arch, branch)?;
        tx.add_install(remote, &r.format(), &[])?;
    }
    run_transaction(tx, assumeyes)
}
