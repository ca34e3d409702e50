//! Build the launch descriptor handed to the external sandbox runner.

use crate::RuntimeError;
use freight_install::Installation;
use freight_schema::{parse_metadata, KeyFile, Overrides, Ref, RefKind};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Caller-supplied launch knobs.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Override the command named by the app metadata.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub extra_env: BTreeMap<String, String>,
}

/// Everything needed to spawn the sandbox: the runner argv, the child
/// environment, and the instance info keyfile.
#[derive(Debug, Clone)]
pub struct LaunchDescriptor {
    /// Full argv, `argv[0]` being the sandbox runner binary.
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub info: KeyFile,
    pub app_ref: Ref,
    pub app_commit: String,
    pub runtime_ref: Ref,
    pub runtime_commit: String,
}

/// Assemble the descriptor for launching an installed app.
///
/// Read-only binds expose the runtime deploy at `/usr` and the app deploy
/// at `/app`; per-app overrides drive devices, filesystems, network, and
/// environment.
pub fn build_launch_descriptor(
    installation: &Installation,
    bwrap: &Path,
    app_ref: &Ref,
    options: &LaunchOptions,
) -> Result<LaunchDescriptor, RuntimeError> {
    let app = installation
        .installed_ref(app_ref)
        .map_err(|_| RuntimeError::NotInstalled(app_ref.format()))?;
    let metadata_text = std::fs::read_to_string(app.deploy_dir.join("metadata"))?;
    let metadata = parse_metadata(&metadata_text)?;

    let runtime_spec = metadata
        .runtime
        .clone()
        .ok_or_else(|| RuntimeError::RuntimeMissing(app_ref.format()))?;
    let runtime_ref = Ref::parse(&format!("runtime/{runtime_spec}"))?;
    let runtime = installation
        .installed_ref(&runtime_ref)
        .map_err(|_| RuntimeError::RuntimeMissing(runtime_ref.format()))?;

    let command = options
        .command
        .clone()
        .or_else(|| metadata.command.clone())
        .ok_or_else(|| RuntimeError::NoCommand(app_ref.format()))?;

    // App metadata context overlaid by the per-app user overrides.
    let app_context = Overrides::from_keyfile(&metadata.keyfile)?;
    let overrides = app_context.merged_with(&installation.load_overrides(&metadata.id)?);

    let mut argv: Vec<String> = vec![bwrap.to_string_lossy().into_owned()];
    let bind = |argv: &mut Vec<String>, flag: &str, a: &str, b: &str| {
        argv.push(flag.to_owned());
        argv.push(a.to_owned());
        argv.push(b.to_owned());
    };
    let runtime_files = runtime.deploy_dir.join("files");
    let app_files = app.deploy_dir.join("files");
    bind(&mut argv, "--ro-bind", &runtime_files.to_string_lossy(), "/usr");
    bind(&mut argv, "--ro-bind", &app_files.to_string_lossy(), "/app");
    argv.push("--proc".to_owned());
    argv.push("/proc".to_owned());
    argv.push("--dev".to_owned());
    argv.push("/dev".to_owned());
    argv.push("--tmpfs".to_owned());
    argv.push("/tmp".to_owned());
    argv.push("--unshare-pid".to_owned());

    if !Overrides::enabled(&overrides.shared).contains(&"network") {
        argv.push("--unshare-net".to_owned());
    }
    for device in Overrides::enabled(&overrides.devices) {
        match device {
            "all" => bind(&mut argv, "--dev-bind", "/dev", "/dev"),
            name => {
                let path = format!("/dev/{name}");
                bind(&mut argv, "--dev-bind-try", &path, &path);
            }
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_owned());
    for fs in Overrides::enabled(&overrides.filesystems) {
        match fs {
            "home" => bind(&mut argv, "--bind", &home, &home),
            "host" => bind(&mut argv, "--bind", "/", "/run/host"),
            path => bind(&mut argv, "--bind-try", path, path),
        }
    }

    let mut env = BTreeMap::new();
    env.insert("FLATPAK_ID".to_owned(), metadata.id.clone());
    env.insert("PATH".to_owned(), "/app/bin:/usr/bin".to_owned());
    env.insert("HOME".to_owned(), home);
    for (k, v) in &overrides.environment {
        env.insert(k.clone(), v.clone());
    }
    for (k, v) in &options.extra_env {
        env.insert(k.clone(), v.clone());
    }
    for (k, v) in &env {
        argv.push("--setenv".to_owned());
        argv.push(k.clone());
        argv.push(v.clone());
    }

    let command_path = if command.starts_with('/') {
        command.clone()
    } else {
        format!("/app/bin/{command}")
    };
    argv.push(command_path);
    argv.extend(options.args.iter().cloned());

    let mut info = KeyFile::new();
    info.set("Application", "name", metadata.id.clone());
    info.set("Application", "runtime", runtime_ref.format());
    info.set("Instance", "app-path", app.deploy_dir.to_string_lossy());
    info.set("Instance", "app-commit", app.active_commit.clone());
    info.set("Instance", "arch", app_ref.arch());
    info.set("Instance", "branch", app_ref.branch());
    info.set(
        "Instance",
        "runtime-path",
        runtime.deploy_dir.to_string_lossy(),
    );
    info.set("Instance", "runtime-commit", runtime.active_commit.clone());
    for (bus_name, policy) in &overrides.session_bus {
        info.set("Session Bus Policy", bus_name, policy.as_str());
    }
    for (bus_name, policy) in &overrides.system_bus {
        info.set("System Bus Policy", bus_name, policy.as_str());
    }

    debug!("launch argv for {}: {} args", metadata.id, argv.len());
    Ok(LaunchDescriptor {
        argv,
        env,
        info,
        app_ref: app_ref.clone(),
        app_commit: app.active_commit,
        runtime_ref,
        runtime_commit: runtime.active_commit,
    })
}

/// The sandbox runner binary, honouring `FLATPAK_BWRAP`.
pub fn bwrap_path() -> PathBuf {
    std::env::var_os("FLATPAK_BWRAP")
        .map_or_else(|| PathBuf::from("bwrap"), PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use freight_schema::CommitMetadata;
    use freight_store::MutableTree;

    const APP_METADATA: &str = "[Application]\nname=org.test.Hello\nruntime=org.test.Platform/x86_64/master\ncommand=hello.sh\n\n[Context]\nshared=network;\ndevices=dri;\n";

    fn deploy_tree(
        installation: &Installation,
        scratch: &Path,
        refstr: &str,
        metadata: &str,
    ) -> Ref {
        let r = Ref::parse(refstr).unwrap();
        let build = scratch.join(format!("build-{}", r.name()));
        std::fs::create_dir_all(build.join("files/bin")).unwrap();
        std::fs::write(build.join("files/bin/hello.sh"), b"#!/bin/sh\n").unwrap();
        std::fs::write(build.join("metadata"), metadata).unwrap();
        let mut mtree = MutableTree::new();
        mtree
            .write_directory(installation.repo().objects(), &build, None)
            .unwrap();
        let root = mtree.finalize(installation.repo().objects()).unwrap();
        let commit = installation
            .repo()
            .write_commit(None, "t", "", CommitMetadata::new(), &root, Some(1_700_000_000))
            .unwrap();
        installation.deploy(&r, &commit, &[], "test-repo").unwrap();
        r
    }

    fn setup() -> (tempfile::TempDir, Installation, Ref) {
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open("default", dir.path().join("inst")).unwrap();
        deploy_tree(
            &installation,
            dir.path(),
            "runtime/org.test.Platform/x86_64/master",
            "[Runtime]\nname=org.test.Platform\n",
        );
        let app = deploy_tree(
            &installation,
            dir.path(),
            "app/org.test.Hello/x86_64/master",
            APP_METADATA,
        );
        (dir, installation, app)
    }

    #[test]
    fn descriptor_binds_runtime_and_app() {
        let (_dir, installation, app) = setup();
        let d = build_launch_descriptor(
            &installation,
            Path::new("/usr/bin/bwrap"),
            &app,
            &LaunchOptions::default(),
        )
        .unwrap();

        assert_eq!(d.argv[0], "/usr/bin/bwrap");
        let joined = d.argv.join(" ");
        assert!(joined.contains("--ro-bind"));
        assert!(joined.contains(" /usr"));
        assert!(joined.contains(" /app"));
        // network shared: no unshare-net; dri device bound.
        assert!(!d.argv.contains(&"--unshare-net".to_owned()));
        assert!(joined.contains("/dev/dri"));
        // Command resolves inside the app prefix.
        assert_eq!(d.argv.last().unwrap(), "/app/bin/hello.sh");
    }

    #[test]
    fn descriptor_records_instance_info() {
        let (_dir, installation, app) = setup();
        let d = build_launch_descriptor(
            &installation,
            Path::new("bwrap"),
            &app,
            &LaunchOptions::default(),
        )
        .unwrap();
        assert_eq!(d.info.get("Application", "name"), Some("org.test.Hello"));
        assert_eq!(
            d.info.get("Application", "runtime"),
            Some("runtime/org.test.Platform/x86_64/master")
        );
        assert_eq!(
            d.info.get("Instance", "app-commit"),
            Some(d.app_commit.as_str())
        );
        assert_eq!(d.runtime_ref.kind(), RefKind::Runtime);
    }

    #[test]
    fn overrides_disable_devices_and_add_env() {
        let (_dir, installation, app) = setup();
        let mut o = Overrides::parse("[Context]\ndevices=!dri;\n\n[Environment]\nDEBUG=1\n").unwrap();
        o.environment
            .insert("DEBUG".to_owned(), "1".to_owned());
        installation.save_overrides("org.test.Hello", &o).unwrap();

        let d = build_launch_descriptor(
            &installation,
            Path::new("bwrap"),
            &app,
            &LaunchOptions::default(),
        )
        .unwrap();
        assert!(!d.argv.join(" ").contains("/dev/dri"));
        assert_eq!(d.env.get("DEBUG").map(String::as_str), Some("1"));
    }

    #[test]
    fn missing_runtime_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open("default", dir.path().join("inst")).unwrap();
        let app = deploy_tree(
            &installation,
            dir.path(),
            "app/org.test.Hello/x86_64/master",
            APP_METADATA,
        );
        let err = build_launch_descriptor(
            &installation,
            Path::new("bwrap"),
            &app,
            &LaunchOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::RuntimeMissing(_)));
    }

    #[test]
    fn command_override_wins() {
        let (_dir, installation, app) = setup();
        let options = LaunchOptions {
            command: Some("sh".to_owned()),
            args: vec!["-c".to_owned(), "true".to_owned()],
            ..LaunchOptions::default()
        };
        let d = build_launch_descriptor(&installation, Path::new("bwrap"), &app, &options).unwrap();
        let n = d.argv.len();
        assert_eq!(&d.argv[n - 3..], &["/app/bin/sh", "-c", "true"]);
    }
}
