use super::{format_size, CmdResult, InstallationSelector};
use clap::Subcommand;
use console::style;
use freight_install::Remote;
use freight_store::fetch_summary;
use std::process::ExitCode;

#[derive(Debug, Subcommand)]
pub enum RemoteCommands {
    /// Add a remote.
    Add {
        name: String,
        url: String,
        #[arg(long = "no-gpg-verify", default_value_t = false)]
        no_gpg_verify: bool,
        #[arg(long)]
        collection_id: Option<String>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long, default_value_t = 1)]
        prio: i32,
        #[arg(long, default_value_t = false)]
        no_enumerate: bool,
        #[arg(long, default_value_t = false)]
        no_deps: bool,
        #[arg(long)]
        default_branch: Option<String>,
    },
    /// Modify an existing remote.
    Modify {
        name: String,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        prio: Option<i32>,
        #[arg(long)]
        disable: Option<bool>,
        #[arg(long = "no-gpg-verify", default_value_t = false)]
        no_gpg_verify: bool,
    },
    /// Delete a remote.
    Delete {
        name: String,
        #[arg(short = 'y', long, default_value_t = false)]
        assumeyes: bool,
    },
    /// List configured remotes.
    List {
        /// Include disabled and hidden remotes.
        #[arg(long, default_value_t = false)]
        show_disabled: bool,
    },
    /// List the refs a remote publishes.
    ListRefs { name: String },
}

pub fn run(selector: &InstallationSelector, cmd: RemoteCommands) -> CmdResult {
    let mut installation = selector.open()?;
    match cmd {
        RemoteCommands::Add {
            name,
            url,
            no_gpg_verify,
            collection_id,
            title,
            prio,
            no_enumerate,
            no_deps,
            default_branch,
        } => {
            let mut remote = Remote::new(&name, &url);
            remote.gpg_verify = !no_gpg_verify;
            remote.gpg_verify_summary = !no_gpg_verify;
            remote.collection_id = collection_id;
            remote.title = title;
            remote.prio = prio;
            remote.noenumerate = no_enumerate;
            remote.nodeps = no_deps;
            remote.default_branch = default_branch;
            installation.config_mut().set_remote(&remote)?;
            installation.save_config()?;
            installation.mark_changed()?;
            println!("Added remote {name}");
            Ok(ExitCode::SUCCESS)
        }
        RemoteCommands::Modify {
            name,
            url,
            title,
            prio,
            disable,
            no_gpg_verify,
        } => {
            let mut remote = installation.config().get_remote(&name)?;
            if let Some(url) = url {
                remote.url = url;
            }
            if let Some(title) = title {
                remote.title = Some(title);
            }
            if let Some(prio) = prio {
                remote.prio = prio;
            }
            if let Some(disable) = disable {
                remote.disabled = disable;
            }
            if no_gpg_verify {
                remote.gpg_verify = false;
                remote.gpg_verify_summary = false;
            }
            installation.config_mut().set_remote(&remote)?;
            installation.save_config()?;
            installation.mark_changed()?;
            println!("Modified remote {name}");
            Ok(ExitCode::SUCCESS)
        }
        RemoteCommands::Delete { name, assumeyes } => {
            // Surfaces RemoteNotFound before prompting.
            installation.config().get_remote(&name)?;
            if !assumeyes {
                let confirmed = dialoguer::Confirm::new()
                    .with_prompt(format!("Delete remote '{name}'?"))
                    .default(false)
                    .interact()
                    .unwrap_or(false);
                if !confirmed {
                    return Ok(ExitCode::from(super::EXIT_SKIPPED));
                }
            }
            installation.config_mut().remove_remote(&name)?;
            installation.save_config()?;
            installation.mark_changed()?;
            println!("Deleted remote {name}");
            Ok(ExitCode::SUCCESS)
        }
        RemoteCommands::List { show_disabled } => {
            let config = installation.config();
            let names = config.remote_names();
            if names.is_empty() {
                println!("No remotes configured.");
                return Ok(ExitCode::SUCCESS);
            }
            println!("{:<20} {:<50} {:>6}  {}", "Name", "URL", "Prio", "Options");
            for name in names {
                let remote = config.get_remote(&name)?;
                if (remote.disabled || remote.noenumerate) && !show_disabled {
                    continue;
                }
                let mut options = Vec::new();
                if !remote.gpg_verify {
                    options.push("no-gpg-verify");
                }
                if remote.disabled {
                    options.push("disabled");
                }
                if remote.noenumerate {
                    options.push("no-enumerate");
                }
                if remote.nodeps {
                    options.push("no-deps");
                }
                println!(
                    "{:<20} {:<50} {:>6}  {}",
                    remote.name,
                    remote.url,
                    remote.prio,
                    options.join(",")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        RemoteCommands::ListRefs { name } => {
            let remote = installation.config().get_remote(&name)?;
            let summary = fetch_summary(&remote.url)?;
            if summary.refs.is_empty() {
                println!("{}", style("Remote publishes no refs.").yellow());
                return Ok(ExitCode::SUCCESS);
            }
            println!("{:<60} {:<10} {:>12}", "Ref", "Commit", "Download");
            for (refstr, entry) in &summary.refs {
                println!(
                    "{:<60} {:<10} {:>12}",
                    refstr,
                    &entry.commit[..8.min(entry.commit.len())],
                    format_size(entry.download_size)
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
