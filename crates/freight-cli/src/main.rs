mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{InstallationSelector, EXIT_FAILURE};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "freight",
    version,
    about = "Install, update and run sandboxed applications and runtimes"
)]
struct Cli {
    /// Work on the per-user installation.
    #[arg(long, global = true, conflicts_with_all = ["system", "installation"])]
    user: bool,

    /// Work on the default system installation.
    #[arg(long, global = true, conflicts_with = "installation")]
    system: bool,

    /// Work on a named system installation.
    #[arg(long, global = true, value_name = "ID")]
    installation: Option<String>,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, global = true, default_value_t = false)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Install applications or runtimes from a remote.
    Install {
        /// Remote name the refs come from.
        remote: String,
        /// Refs (full, or name with --arch/--branch).
        #[arg(required = true)]
        refs: Vec<String>,
        #[arg(long)]
        arch: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        /// Pull but do not deploy.
        #[arg(long, default_value_t = false)]
        no_deploy: bool,
        /// Do not install dependencies.
        #[arg(long, default_value_t = false)]
        no_deps: bool,
        /// Do not install related refs.
        #[arg(long, default_value_t = false)]
        no_related: bool,
        #[arg(long, default_value_t = false)]
        reinstall: bool,
        /// Skip the interactive confirmation.
        #[arg(short = 'y', long, default_value_t = false)]
        assumeyes: bool,
    },
    /// Update installed refs (all of them when none are given).
    Update {
        refs: Vec<String>,
        #[arg(long)]
        arch: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long, default_value_t = false)]
        no_deploy: bool,
        #[arg(long, default_value_t = false)]
        no_related: bool,
        #[arg(short = 'y', long, default_value_t = false)]
        assumeyes: bool,
    },
    /// Uninstall installed refs.
    Uninstall {
        #[arg(required = true)]
        refs: Vec<String>,
        #[arg(long)]
        arch: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        /// Remove even while instances are running.
        #[arg(long, default_value_t = false)]
        force_remove: bool,
        #[arg(short = 'y', long, default_value_t = false)]
        assumeyes: bool,
    },
    /// List installed refs.
    List {
        /// Only applications.
        #[arg(long, conflicts_with = "runtime")]
        app: bool,
        /// Only runtimes.
        #[arg(long)]
        runtime: bool,
    },
    /// Show details of an installed ref.
    Info {
        r#ref: String,
        #[arg(long)]
        arch: Option<String>,
        #[arg(long)]
        branch: Option<String>,
    },
    /// Run an installed application inside the sandbox.
    Run {
        r#ref: String,
        #[arg(long)]
        arch: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        /// Command to run instead of the one named by the app.
        #[arg(long)]
        command: Option<String>,
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// List running instances.
    Ps,
    /// Show or change per-app sandbox overrides.
    Override {
        app_id: String,
        /// Grant access to a device (e.g. dri), prefix with ! to revoke.
        #[arg(long = "device")]
        devices: Vec<String>,
        /// Share a context (e.g. network).
        #[arg(long = "share")]
        shares: Vec<String>,
        /// Expose a filesystem (home, host, or a path).
        #[arg(long = "filesystem")]
        filesystems: Vec<String>,
        /// Set an environment variable (VAR=VALUE).
        #[arg(long = "env")]
        env: Vec<String>,
        /// Print the merged overrides and exit.
        #[arg(long, default_value_t = false)]
        show: bool,
    },
    /// Expose a different installed branch of an app.
    MakeCurrent {
        app_id: String,
        branch: String,
        #[arg(long)]
        arch: Option<String>,
    },
    /// Manage configured remotes.
    #[command(subcommand)]
    Remote(commands::remote::RemoteCommands),
    /// Initialize a build directory.
    BuildInit {
        directory: PathBuf,
        app_id: String,
        sdk: String,
        runtime: String,
        #[arg(long)]
        arch: Option<String>,
        #[arg(long, default_value = "master")]
        branch: String,
    },
    /// Finalize a build directory (command, exports).
    BuildFinish {
        directory: PathBuf,
        #[arg(long)]
        command: Option<String>,
    },
    /// Export a build directory into a repository.
    BuildExport {
        repo: PathBuf,
        directory: PathBuf,
        #[arg(long)]
        arch: Option<String>,
        #[arg(long, default_value = "master")]
        branch: String,
        #[arg(long = "gpg-sign")]
        gpg_sign: Vec<String>,
        #[arg(long)]
        gpg_homedir: Option<PathBuf>,
        #[arg(long = "end-of-life")]
        end_of_life: Option<String>,
        #[arg(long = "end-of-life-rebase")]
        end_of_life_rebase: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        body: Option<String>,
        #[arg(long)]
        exclude: Vec<String>,
        #[arg(long)]
        include: Vec<String>,
        /// Do not regenerate the summary afterwards.
        #[arg(long, default_value_t = false)]
        no_update_summary: bool,
    },
    /// Create a single-file bundle from a repository ref.
    BuildBundle {
        repo: PathBuf,
        filename: PathBuf,
        r#ref: String,
        #[arg(long = "repo-url")]
        repo_url: Option<String>,
        #[arg(long = "runtime-repo")]
        runtime_repo: Option<String>,
    },
    /// Rewrite refs from one repository into another.
    BuildCommitFrom {
        dst_repo: PathBuf,
        #[arg(long = "src-repo")]
        src_repo: PathBuf,
        #[arg(long = "src-ref")]
        src_ref: Option<String>,
        #[arg(required = true)]
        refs: Vec<String>,
        #[arg(long, default_value_t = false)]
        force: bool,
        #[arg(long)]
        timestamp: Option<i64>,
        #[arg(long = "end-of-life")]
        end_of_life: Option<String>,
        #[arg(long = "end-of-life-rebase")]
        end_of_life_rebase: Option<String>,
        #[arg(long = "gpg-sign")]
        gpg_sign: Vec<String>,
        #[arg(long, default_value_t = false)]
        no_update_summary: bool,
    },
    /// Sign a commit in a repository.
    BuildSign {
        repo: PathBuf,
        r#ref: String,
        #[arg(long = "gpg-sign", required = true)]
        gpg_sign: Vec<String>,
        #[arg(long)]
        gpg_homedir: Option<PathBuf>,
    },
    /// Regenerate the summary and appstream branches of a repository.
    BuildUpdateRepo {
        repo: PathBuf,
        #[arg(long = "gpg-sign")]
        gpg_sign: Vec<String>,
        #[arg(long)]
        gpg_homedir: Option<PathBuf>,
    },
    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_logging(verbose: bool, trace: bool) {
    let level = if trace {
        "trace"
    } else if verbose {
        "debug"
    } else {
        "warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.trace);
    freight_core::install_signal_handler();

    let selector = InstallationSelector {
        user: cli.user,
        system: cli.system,
        installation: cli.installation.clone(),
    };

    let result = match cli.command {
        Commands::Install {
            remote,
            refs,
            arch,
            branch,
            no_deploy,
            no_deps,
            no_related,
            reinstall,
            assumeyes,
        } => commands::install::run(
            &selector,
            &remote,
            &refs,
            arch.as_deref(),
            branch.as_deref(),
            no_deploy,
            no_deps,
            no_related,
            reinstall,
            assumeyes,
        ),
        Commands::Update {
            refs,
            arch,
            branch,
            no_deploy,
            no_related,
            assumeyes,
        } => commands::update::run(
            &selector,
            &refs,
            arch.as_deref(),
            branch.as_deref(),
            no_deploy,
            no_related,
            assumeyes,
        ),
        Commands::Uninstall {
            refs,
            arch,
            branch,
            force_remove,
            assumeyes,
        } => commands::uninstall::run(
            &selector,
            &refs,
            arch.as_deref(),
            branch.as_deref(),
            force_remove,
            assumeyes,
        ),
        Commands::List { app, runtime } => commands::list::run(&selector, app, runtime),
        Commands::Info { r#ref, arch, branch } => {
            commands::info::run(&selector, &r#ref, arch.as_deref(), branch.as_deref())
        }
        Commands::Run {
            r#ref,
            arch,
            branch,
            command,
            args,
        } => commands::run_app::run(
            &selector,
            &r#ref,
            arch.as_deref(),
            branch.as_deref(),
            command.as_deref(),
            &args,
        ),
        Commands::Ps => commands::ps::run(),
        Commands::Override {
            app_id,
            devices,
            shares,
            filesystems,
            env,
            show,
        } => commands::override_cmd::run(&selector, &app_id, &devices, &shares, &filesystems, &env, show),
        Commands::MakeCurrent { app_id, branch, arch } => {
            commands::make_current::run(&selector, &app_id, &branch, arch.as_deref())
        }
        Commands::Remote(cmd) => commands::remote::run(&selector, cmd),
        Commands::BuildInit {
            directory,
            app_id,
            sdk,
            runtime,
            arch,
            branch,
        } => commands::build::init(&directory, &app_id, &sdk, &runtime, arch.as_deref(), &branch),
        Commands::BuildFinish { directory, command } => {
            commands::build::finish(&directory, command.as_deref())
        }
        Commands::BuildExport {
            repo,
            directory,
            arch,
            branch,
            gpg_sign,
            gpg_homedir,
            end_of_life,
            end_of_life_rebase,
            subject,
            body,
            exclude,
            include,
            no_update_summary,
        } => commands::build::export(commands::build::ExportArgs {
            repo,
            directory,
            arch,
            branch,
            gpg_sign,
            gpg_homedir,
            end_of_life,
            end_of_life_rebase,
            subject,
            body,
            exclude,
            include,
            update_summary: !no_update_summary,
        }),
        Commands::BuildBundle {
            repo,
            filename,
            r#ref,
            repo_url,
            runtime_repo,
        } => commands::build::bundle(&repo, &filename, &r#ref, repo_url.as_deref(), runtime_repo.as_deref()),
        Commands::BuildCommitFrom {
            dst_repo,
            src_repo,
            src_ref,
            refs,
            force,
            timestamp,
            end_of_life,
            end_of_life_rebase,
            gpg_sign,
            no_update_summary,
        } => commands::build::commit_from(commands::build::CommitFromArgs {
            dst_repo,
            src_repo,
            src_ref,
            refs,
            force,
            timestamp,
            end_of_life,
            end_of_life_rebase,
            gpg_sign,
            update_summary: !no_update_summary,
        }),
        Commands::BuildSign {
            repo,
            r#ref,
            gpg_sign,
            gpg_homedir,
        } => commands::build::sign(&repo, &r#ref, &gpg_sign, gpg_homedir.as_deref()),
        Commands::BuildUpdateRepo {
            repo,
            gpg_sign,
            gpg_homedir,
        } => commands::build::update_repo(&repo, &gpg_sign, gpg_homedir.as_deref()),
        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "freight",
                &mut std::io::stdout(),
            );
            Ok(ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e}", console::style("error:").red().bold());
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
