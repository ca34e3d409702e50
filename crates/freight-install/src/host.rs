//! Host context: environment-variable roots and multi-installation discovery.
//!
//! Process-wide configuration is concentrated here instead of being read
//! ad hoc, so tests can instantiate isolated host contexts pointing at
//! scratch directories.

use crate::InstallError;
use freight_schema::KeyFile;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Reserved id of the built-in system installation.
pub const SYSTEM_INSTALLATION_ID: &str = "default";

const ENV_SYSTEM_DIR: &str = "FLATPAK_SYSTEM_DIR";
const ENV_SYSTEM_CACHE_DIR: &str = "FLATPAK_SYSTEM_CACHE_DIR";
const ENV_CONFIG_DIR: &str = "FLATPAK_CONFIG_DIR";
const ENV_BWRAP: &str = "FLATPAK_BWRAP";
const ENV_VALIDATE_ICON: &str = "FLATPAK_VALIDATE_ICON";

const DEFAULT_SYSTEM_DIR: &str = "/var/lib/flatpak";
const DEFAULT_CONFIG_DIR: &str = "/etc/flatpak";
const DEFAULT_BWRAP: &str = "bwrap";

/// Media class backing an installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageType {
    #[default]
    Default,
    HardDisk,
    SdCard,
    Mmc,
    Network,
}

impl StorageType {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "harddisk" | "hard-disk" => Self::HardDisk,
            "sdcard" | "sd-card" => Self::SdCard,
            "mmc" => Self::Mmc,
            "network" => Self::Network,
            _ => Self::Default,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::HardDisk => "harddisk",
            Self::SdCard => "sdcard",
            Self::Mmc => "mmc",
            Self::Network => "network",
        }
    }
}

/// One discovered system installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationInfo {
    pub id: String,
    pub display_name: String,
    pub storage_type: StorageType,
    pub priority: i32,
    pub path: PathBuf,
}

/// Process-wide roots, resolved once from the environment.
#[derive(Debug, Clone)]
pub struct HostContext {
    pub system_dir: PathBuf,
    pub system_cache_dir: Option<PathBuf>,
    pub config_dir: PathBuf,
    pub bwrap_path: PathBuf,
    pub icon_validator: Option<PathBuf>,
}

impl HostContext {
    /// Resolve from the process environment.
    pub fn from_env() -> Self {
        let env_path = |name: &str| std::env::var_os(name).map(PathBuf::from);
        Self {
            system_dir: env_path(ENV_SYSTEM_DIR)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SYSTEM_DIR)),
            system_cache_dir: env_path(ENV_SYSTEM_CACHE_DIR),
            config_dir: env_path(ENV_CONFIG_DIR).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR)),
            bwrap_path: env_path(ENV_BWRAP).unwrap_or_else(|| PathBuf::from(DEFAULT_BWRAP)),
            icon_validator: env_path(ENV_VALIDATE_ICON),
        }
    }

    /// An isolated context rooted at a scratch directory, for tests.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            system_dir: root.join("system"),
            system_cache_dir: None,
            config_dir: root.join("config"),
            bwrap_path: PathBuf::from(DEFAULT_BWRAP),
            icon_validator: None,
        }
    }

    /// The built-in system installation plus every installation declared in
    /// `installations.d`, sorted by descending priority (system first on tie).
    pub fn system_installations(&self) -> Result<Vec<InstallationInfo>, InstallError> {
        let mut installations = vec![InstallationInfo {
            id: SYSTEM_INSTALLATION_ID.to_owned(),
            display_name: "Default system installation".to_owned(),
            storage_type: StorageType::Default,
            priority: 0,
            path: self.system_dir.clone(),
        }];
        for info in read_installations_dir(&installations_dir(&self.config_dir))? {
            if info.id == SYSTEM_INSTALLATION_ID {
                warn!("installations.d declares reserved id 'default'; ignoring");
                continue;
            }
            if installations.iter().any(|i| i.id == info.id) {
                warn!("duplicate installation id '{}'; keeping the first", info.id);
                continue;
            }
            installations.push(info);
        }
        installations.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(installations)
    }

    /// Resolve an installation by id.
    pub fn installation_by_id(&self, id: &str) -> Result<InstallationInfo, InstallError> {
        self.system_installations()?
            .into_iter()
            .find(|i| i.id == id)
            .ok_or_else(|| InstallError::InvalidConfig(format!("no installation with id '{id}'")))
    }
}

/// Directory holding `*.conf` keyfiles declaring extra installations.
pub fn installations_dir(config_dir: &Path) -> PathBuf {
    config_dir.join("installations.d")
}

fn read_installations_dir(dir: &Path) -> Result<Vec<InstallationInfo>, InstallError> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| InstallError::io_at(dir, e))?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "conf"))
        .collect();
    paths.sort();

    for path in paths {
        let text = std::fs::read_to_string(&path).map_err(|e| InstallError::io_at(&path, e))?;
        let kf = match KeyFile::parse(&text) {
            Ok(kf) => kf,
            Err(e) => {
                warn!("skipping malformed installation config {}: {e}", path.display());
                continue;
            }
        };
        for group in kf.group_names() {
            let Some(id) = group
                .strip_prefix("Installation \"")
                .and_then(|rest| rest.strip_suffix('"'))
            else {
                continue;
            };
            let Some(inst_path) = kf.get(group, "Path") else {
                warn!("installation '{id}' in {} has no Path; skipping", path.display());
                continue;
            };
            out.push(InstallationInfo {
                id: id.to_owned(),
                display_name: kf
                    .get(group, "DisplayName")
                    .unwrap_or(id)
                    .to_owned(),
                storage_type: StorageType::parse(kf.get(group, "StorageType").unwrap_or("")),
                priority: kf
                    .get(group, "Priority")
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(0),
                path: PathBuf::from(inst_path),
            });
        }
    }
    Ok(out)
}
