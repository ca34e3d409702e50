//! The per-boot registry of running instances.
//!
//! Each instance is a numbered directory under the runtime dir holding the
//! info keyfile and pid files. Ids are allocated monotonically under an
//! allocation lock; `child_pid` becomes non-zero once the sandbox has
//! forked the payload. Dead instances are reaped on enumeration unless
//! they carry a no-reap marker.

use crate::RuntimeError;
use freight_schema::KeyFile;
use fs2::FileExt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const INFO_FILE: &str = "info";
const PID_FILE: &str = "pid";
const CHILD_PID_FILE: &str = "child-pid";
const NO_REAP_FILE: &str = ".no-reap";
const ALLOC_LOCK: &str = ".alloc-lock";

/// A running (or recently dead) application instance.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: u64,
    pub app: String,
    pub arch: String,
    pub branch: String,
    pub commit: String,
    pub runtime: String,
    pub runtime_commit: String,
    pub pid: u32,
    pub child_pid: u32,
    pub info: KeyFile,
    dir: PathBuf,
}

impl Instance {
    fn load(dir: &Path, id: u64) -> Result<Self, RuntimeError> {
        let info_text = fs::read_to_string(dir.join(INFO_FILE))?;
        let info = KeyFile::parse(&info_text)?;
        let read_pid = |name: &str| -> u32 {
            fs::read_to_string(dir.join(name))
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0)
        };
        Ok(Self {
            id,
            app: info.get("Application", "name").unwrap_or_default().to_owned(),
            arch: info.get("Instance", "arch").unwrap_or_default().to_owned(),
            branch: info.get("Instance", "branch").unwrap_or_default().to_owned(),
            commit: info
                .get("Instance", "app-commit")
                .unwrap_or_default()
                .to_owned(),
            runtime: info
                .get("Application", "runtime")
                .unwrap_or_default()
                .to_owned(),
            runtime_commit: info
                .get("Instance", "runtime-commit")
                .unwrap_or_default()
                .to_owned(),
            pid: read_pid(PID_FILE),
            child_pid: read_pid(CHILD_PID_FILE),
            info,
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Whether a pid refers to a live process.
fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // kill(pid, 0) probes for existence without signalling; EPERM still
    // means the process exists.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid as i32, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Registry over the per-boot instance directory.
pub struct InstanceRegistry {
    base: PathBuf,
}

impl InstanceRegistry {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Default registry location: `$XDG_RUNTIME_DIR/.freight/instance`,
    /// falling back to a uid-scoped path under /tmp.
    pub fn from_env() -> Self {
        let base = std::env::var_os("XDG_RUNTIME_DIR").map_or_else(
            || {
                #[allow(unsafe_code)]
                let uid = unsafe { libc::getuid() };
                PathBuf::from(format!("/tmp/freight-{uid}"))
            },
            PathBuf::from,
        );
        Self::new(base.join(".freight").join("instance"))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Register a new instance for a launched sandbox pid, allocating the
    /// next monotonic id.
    pub fn allocate(
        &self,
        info: &KeyFile,
        pid: u32,
        do_not_reap: bool,
    ) -> Result<Instance, RuntimeError> {
        fs::create_dir_all(&self.base)?;
        let lock_path = self.base.join(ALLOC_LOCK);
        let lock = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        lock.lock_exclusive()
            .map_err(|e| RuntimeError::LockFailed(e.to_string()))?;

        let next_id = self
            .existing_ids()?
            .last()
            .copied()
            .unwrap_or(0)
            + 1;
        let dir = self.base.join(next_id.to_string());
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(INFO_FILE), info.to_text())?;
        fs::write(dir.join(PID_FILE), pid.to_string())?;
        if do_not_reap {
            fs::write(dir.join(NO_REAP_FILE), b"")?;
        }
        debug!("registered instance {next_id} (pid {pid})");
        Instance::load(&dir, next_id)
    }

    fn existing_ids(&self) -> Result<Vec<u64>, RuntimeError> {
        let mut ids = Vec::new();
        if !self.base.exists() {
            return Ok(ids);
        }
        for entry in fs::read_dir(&self.base)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn get(&self, id: u64) -> Result<Instance, RuntimeError> {
        let dir = self.base.join(id.to_string());
        if !dir.is_dir() {
            return Err(RuntimeError::InstanceNotFound(id));
        }
        Instance::load(&dir, id)
    }

    /// Every registered instance, reaping dead ones along the way.
    pub fn get_all(&self) -> Result<Vec<Instance>, RuntimeError> {
        let mut out = Vec::new();
        for id in self.existing_ids()? {
            let dir = self.base.join(id.to_string());
            let instance = Instance::load(&dir, id)?;
            if !pid_alive(instance.pid) && !dir.join(NO_REAP_FILE).exists() {
                debug!("reaping dead instance {id}");
                let _ = fs::remove_dir_all(&dir);
                continue;
            }
            out.push(instance);
        }
        Ok(out)
    }

    pub fn is_running(&self, id: u64) -> bool {
        self.get(id).map(|i| pid_alive(i.pid)).unwrap_or(false)
    }

    /// Record the payload pid once the sandbox has forked it.
    pub fn set_child_pid(&self, id: u64, child_pid: u32) -> Result<(), RuntimeError> {
        let dir = self.base.join(id.to_string());
        if !dir.is_dir() {
            return Err(RuntimeError::InstanceNotFound(id));
        }
        fs::write(dir.join(CHILD_PID_FILE), child_pid.to_string())?;
        Ok(())
    }

    pub fn get_child_pid(&self, id: u64) -> Result<u32, RuntimeError> {
        Ok(self.get(id)?.child_pid)
    }
}
