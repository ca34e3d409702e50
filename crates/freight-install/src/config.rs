//! Installation configuration: the `[core]` group and `[remote "..."]`
//! declarations, persisted as a keyfile at the installation root.

use crate::InstallError;
use freight_schema::KeyFile;
use std::path::Path;
use url::Url;

pub const CONFIG_FILE: &str = "config";
const GROUP_CORE: &str = "core";

/// Transport class of a remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemoteType {
    #[default]
    Static,
    Lan,
    Usb,
}

impl RemoteType {
    fn parse(raw: &str) -> Self {
        match raw {
            "lan" => Self::Lan,
            "usb" => Self::Usb,
            _ => Self::Static,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Lan => "lan",
            Self::Usb => "usb",
        }
    }
}

/// A named outbound endpoint publishing refs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub name: String,
    pub url: String,
    pub collection_id: Option<String>,
    pub gpg_verify: bool,
    pub gpg_verify_summary: bool,
    /// Hidden from listings.
    pub noenumerate: bool,
    /// Not consulted for dependency resolution.
    pub nodeps: bool,
    pub disabled: bool,
    /// Higher wins remote-selection ties.
    pub prio: i32,
    pub title: Option<String>,
    pub default_branch: Option<String>,
    pub remote_type: RemoteType,
}

impl Remote {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            collection_id: None,
            gpg_verify: true,
            gpg_verify_summary: true,
            noenumerate: false,
            nodeps: false,
            disabled: false,
            prio: 1,
            title: None,
            default_branch: None,
            remote_type: RemoteType::Static,
        }
    }

    /// A remote must carry a valid URL before it may be persisted.
    pub fn validate(&self) -> Result<(), InstallError> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(InstallError::InvalidRemote(self.name.clone()));
        }
        Url::parse(&self.url).map_err(|_| InstallError::InvalidRemote(self.name.clone()))?;
        Ok(())
    }

    fn group(&self) -> String {
        format!("remote \"{}\"", self.name)
    }
}

/// The parsed installation config.
#[derive(Debug, Clone, Default)]
pub struct InstallationConfig {
    keyfile: KeyFile,
}

impl InstallationConfig {
    pub fn load(root: &Path) -> Result<Self, InstallError> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path).map_err(|e| InstallError::io_at(&path, e))?;
        Ok(Self {
            keyfile: KeyFile::parse(&text)?,
        })
    }

    pub fn save(&self, root: &Path) -> Result<(), InstallError> {
        let path = root.join(CONFIG_FILE);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, self.keyfile.to_text()).map_err(|e| InstallError::io_at(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| InstallError::io_at(&path, e))?;
        Ok(())
    }

    pub fn default_arch(&self) -> Option<&str> {
        self.keyfile.get(GROUP_CORE, "default-arch")
    }

    pub fn set_default_arch(&mut self, arch: &str) {
        self.keyfile.set(GROUP_CORE, "default-arch", arch);
    }

    /// Configured locale subsets; `en` when unset.
    pub fn languages(&self) -> Vec<String> {
        let langs = self.keyfile.get_list(GROUP_CORE, "languages");
        if langs.is_empty() {
            vec!["en".to_owned()]
        } else {
            langs
        }
    }

    pub fn set_languages(&mut self, languages: &[String]) {
        self.keyfile.set_list(GROUP_CORE, "languages", languages);
    }

    pub fn disable_fsync(&self) -> bool {
        self.keyfile
            .get_bool(GROUP_CORE, "disable-fsync")
            .ok()
            .flatten()
            .unwrap_or(false)
    }

    /// Remote names, in declaration order, hidden ones included.
    pub fn remote_names(&self) -> Vec<String> {
        self.keyfile
            .group_names()
            .filter_map(|g| {
                g.strip_prefix("remote \"")
                    .and_then(|rest| rest.strip_suffix('"'))
                    .map(str::to_owned)
            })
            .collect()
    }

    pub fn get_remote(&self, name: &str) -> Result<Remote, InstallError> {
        let group = format!("remote \"{name}\"");
        if !self.keyfile.has_group(&group) {
            return Err(InstallError::RemoteNotFound(name.to_owned()));
        }
        let get_bool = |key: &str, default: bool| {
            self.keyfile
                .get_bool(&group, key)
                .ok()
                .flatten()
                .unwrap_or(default)
        };
        Ok(Remote {
            name: name.to_owned(),
            url: self.keyfile.get(&group, "url").unwrap_or_default().to_owned(),
            collection_id: self.keyfile.get(&group, "collection-id").map(str::to_owned),
            gpg_verify: get_bool("gpg-verify", true),
            gpg_verify_summary: get_bool("gpg-verify-summary", true),
            noenumerate: get_bool("xa.noenumerate", false),
            nodeps: get_bool("xa.nodeps", false),
            disabled: get_bool("xa.disable", false),
            prio: self
                .keyfile
                .get(&group, "xa.prio")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            title: self.keyfile.get(&group, "xa.title").map(str::to_owned),
            default_branch: self
                .keyfile
                .get(&group, "xa.default-branch")
                .map(str::to_owned),
            remote_type: RemoteType::parse(self.keyfile.get(&group, "xa.type").unwrap_or("")),
        })
    }

    /// Validate-and-replace: the only mutation path for remotes.
    pub fn set_remote(&mut self, remote: &Remote) -> Result<(), InstallError> {
        remote.validate()?;
        let group = remote.group();
        self.keyfile.remove_group(&group);
        self.keyfile.set(&group, "url", remote.url.clone());
        if let Some(ref c) = remote.collection_id {
            self.keyfile.set(&group, "collection-id", c.clone());
        }
        self.keyfile.set_bool(&group, "gpg-verify", remote.gpg_verify);
        self.keyfile
            .set_bool(&group, "gpg-verify-summary", remote.gpg_verify_summary);
        if remote.noenumerate {
            self.keyfile.set_bool(&group, "xa.noenumerate", true);
        }
        if remote.nodeps {
            self.keyfile.set_bool(&group, "xa.nodeps", true);
        }
        if remote.disabled {
            self.keyfile.set_bool(&group, "xa.disable", true);
        }
        self.keyfile.set(&group, "xa.prio", remote.prio.to_string());
        if let Some(ref t) = remote.title {
            self.keyfile.set(&group, "xa.title", t.clone());
        }
        if let Some(ref b) = remote.default_branch {
            self.keyfile.set(&group, "xa.default-branch", b.clone());
        }
        if remote.remote_type != RemoteType::Static {
            self.keyfile
                .set(&group, "xa.type", remote.remote_type.as_str());
        }
        Ok(())
    }

    pub fn remove_remote(&mut self, name: &str) -> Result<(), InstallError> {
        let group = format!("remote \"{name}\"");
        if !self.keyfile.has_group(&group) {
            return Err(InstallError::RemoteNotFound(name.to_owned()));
        }
        self.keyfile.remove_group(&group);
        Ok(())
    }

    /// Enabled remotes eligible for listings, highest priority first.
    pub fn enumerable_remotes(&self) -> Vec<Remote> {
        let mut remotes: Vec<Remote> = self
            .remote_names()
            .iter()
            .filter_map(|n| self.get_remote(n).ok())
            .filter(|r| !r.disabled && !r.noenumerate)
            .collect();
        remotes.sort_by(|a, b| b.prio.cmp(&a.prio).then(a.name.cmp(&b.name)));
        remotes
    }

    /// Enabled remotes consulted for dependency resolution.
    pub fn dependency_remotes(&self) -> Vec<Remote> {
        let mut remotes: Vec<Remote> = self
            .remote_names()
            .iter()
            .filter_map(|n| self.get_remote(n).ok())
            .filter(|r| !r.disabled && !r.nodeps)
            .collect();
        remotes.sort_by(|a, b| b.prio.cmp(&a.prio).then(a.name.cmp(&b.name)));
        remotes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_roundtrip_through_keyfile() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = InstallationConfig::default();
        let mut remote = Remote::new("test-repo", "https://repo.example.com/stable");
        remote.collection_id = Some("org.example.Stable".to_owned());
        remote.prio = 5;
        remote.nodeps = true;
        remote.title = Some("Example".to_owned());
        cfg.set_remote(&remote).unwrap();
        cfg.save(dir.path()).unwrap();

        let loaded = InstallationConfig::load(dir.path()).unwrap();
        let back = loaded.get_remote("test-repo").unwrap();
        assert_eq!(back, remote);
    }

    #[test]
    fn invalid_url_rejected() {
        let mut cfg = InstallationConfig::default();
        let remote = Remote::new("bad", "not a url");
        assert!(matches!(
            cfg.set_remote(&remote),
            Err(InstallError::InvalidRemote(_))
        ));
    }

    #[test]
    fn remote_name_with_slash_rejected() {
        let mut cfg = InstallationConfig::default();
        let remote = Remote::new("bad/name", "https://example.com");
        assert!(cfg.set_remote(&remote).is_err());
    }

    #[test]
    fn missing_remote_reports_not_found() {
        let cfg = InstallationConfig::default();
        assert!(matches!(
            cfg.get_remote("nope"),
            Err(InstallError::RemoteNotFound(_))
        ));
        let mut cfg = cfg;
        assert!(cfg.remove_remote("nope").is_err());
    }

    #[test]
    fn set_remote_replaces_whole_group() {
        let mut cfg = InstallationConfig::default();
        let mut remote = Remote::new("r", "https://a.example.com");
        remote.title = Some("old".to_owned());
        cfg.set_remote(&remote).unwrap();
        remote.title = None;
        remote.url = "https://b.example.com".to_owned();
        cfg.set_remote(&remote).unwrap();
        let back = cfg.get_remote("r").unwrap();
        assert_eq!(back.url, "https://b.example.com");
        assert!(back.title.is_none());
    }

    #[test]
    fn enumerable_excludes_hidden_and_disabled() {
        let mut cfg = InstallationConfig::default();
        cfg.set_remote(&Remote::new("visible", "https://a.example.com"))
            .unwrap();
        let mut hidden = Remote::new("hidden", "https://b.example.com");
        hidden.noenumerate = true;
        cfg.set_remote(&hidden).unwrap();
        let mut off = Remote::new("off", "https://c.example.com");
        off.disabled = true;
        cfg.set_remote(&off).unwrap();

        let names: Vec<String> = cfg.enumerable_remotes().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["visible"]);
        // hidden is still a dependency source, disabled is not
        let dep_names: Vec<String> =
            cfg.dependency_remotes().into_iter().map(|r| r.name).collect();
        assert_eq!(dep_names, vec!["hidden", "visible"]);
    }

    #[test]
    fn priority_orders_remotes() {
        let mut cfg = InstallationConfig::default();
        let mut low = Remote::new("low", "https://l.example.com");
        low.prio = 1;
        let mut high = Remote::new("high", "https://h.example.com");
        high.prio = 10;
        cfg.set_remote(&low).unwrap();
        cfg.set_remote(&high).unwrap();
        let names: Vec<String> = cfg.enumerable_remotes().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["high", "low"]);
    }

    #[test]
    fn languages_default_to_en() {
        let cfg = InstallationConfig::default();
        assert_eq!(cfg.languages(), vec!["en"]);
        let mut cfg = cfg;
        cfg.set_languages(&["de".to_owned(), "fr".to_owned()]);
        assert_eq!(cfg.languages(), vec!["de", "fr"]);
    }

    #[test]
    fn load_absent_config_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = InstallationConfig::load(dir.path()).unwrap();
        assert!(cfg.remote_names().is_empty());
        assert!(cfg.default_arch().is_none());
    }
}
