//! Per-app override keyfiles: sandbox context, environment, and bus policy.
//!
//! Stored under `overrides/{app-id}` in an installation and merged into the
//! launch descriptor. Toggle syntax: `devices=dri;!kvm;` enables `dri` and
//! disables `kvm`.

use crate::keyfile::{KeyFile, KeyFileError};
use std::collections::BTreeMap;

pub const GROUP_CONTEXT: &str = "Context";
pub const GROUP_SESSION_BUS: &str = "Session Bus Policy";
pub const GROUP_SYSTEM_BUS: &str = "System Bus Policy";
pub const GROUP_ENVIRONMENT: &str = "Environment";

/// One enable/disable entry from a `;`-separated toggle list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionToggle {
    pub name: String,
    pub enabled: bool,
}

impl PermissionToggle {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix('!') {
            Some(name) => Self {
                name: name.to_owned(),
                enabled: false,
            },
            None => Self {
                name: raw.to_owned(),
                enabled: true,
            },
        }
    }

    pub fn format(&self) -> String {
        if self.enabled {
            self.name.clone()
        } else {
            format!("!{}", self.name)
        }
    }
}

/// What a name on a bus may be accessed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusPolicy {
    None,
    See,
    Talk,
    Own,
}

impl BusPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "none" => Some(Self::None),
            "see" => Some(Self::See),
            "talk" => Some(Self::Talk),
            "own" => Some(Self::Own),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::See => "see",
            Self::Talk => "talk",
            Self::Own => "own",
        }
    }
}

/// Parsed override keyfile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub shared: Vec<PermissionToggle>,
    pub sockets: Vec<PermissionToggle>,
    pub devices: Vec<PermissionToggle>,
    pub features: Vec<PermissionToggle>,
    pub filesystems: Vec<PermissionToggle>,
    pub persistent: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub session_bus: BTreeMap<String, BusPolicy>,
    pub system_bus: BTreeMap<String, BusPolicy>,
}

fn toggles(kf: &KeyFile, key: &str) -> Vec<PermissionToggle> {
    kf.get_list(GROUP_CONTEXT, key)
        .iter()
        .map(|s| PermissionToggle::parse(s))
        .collect()
}

fn bus_policies(kf: &KeyFile, group: &str) -> Result<BTreeMap<String, BusPolicy>, KeyFileError> {
    let mut out = BTreeMap::new();
    for key in kf.keys(group) {
        let raw = kf.get(group, key).unwrap_or_default();
        let policy = BusPolicy::parse(raw).ok_or_else(|| KeyFileError::InvalidValue {
            group: group.to_owned(),
            key: key.to_owned(),
            reason: format!("expected none/see/talk/own, got '{raw}'"),
        })?;
        out.insert(key.to_owned(), policy);
    }
    Ok(out)
}

impl Overrides {
    pub fn from_keyfile(kf: &KeyFile) -> Result<Self, KeyFileError> {
        let mut environment = BTreeMap::new();
        for key in kf.keys(GROUP_ENVIRONMENT) {
            environment.insert(
                key.to_owned(),
                kf.get(GROUP_ENVIRONMENT, key).unwrap_or_default().to_owned(),
            );
        }
        Ok(Self {
            shared: toggles(kf, "shared"),
            sockets: toggles(kf, "sockets"),
            devices: toggles(kf, "devices"),
            features: toggles(kf, "features"),
            filesystems: toggles(kf, "filesystems"),
            persistent: kf.get_list(GROUP_CONTEXT, "persistent"),
            environment,
            session_bus: bus_policies(kf, GROUP_SESSION_BUS)?,
            system_bus: bus_policies(kf, GROUP_SYSTEM_BUS)?,
        })
    }

    pub fn parse(text: &str) -> Result<Self, KeyFileError> {
        Self::from_keyfile(&KeyFile::parse(text)?)
    }

    pub fn to_keyfile(&self) -> KeyFile {
        let mut kf = KeyFile::new();
        let mut set_toggles = |key: &str, items: &[PermissionToggle]| {
            if !items.is_empty() {
                let values: Vec<String> = items.iter().map(PermissionToggle::format).collect();
                kf.set_list(GROUP_CONTEXT, key, &values);
            }
        };
        set_toggles("shared", &self.shared);
        set_toggles("sockets", &self.sockets);
        set_toggles("devices", &self.devices);
        set_toggles("features", &self.features);
        set_toggles("filesystems", &self.filesystems);
        if !self.persistent.is_empty() {
            kf.set_list(GROUP_CONTEXT, "persistent", &self.persistent);
        }
        for (k, v) in &self.session_bus {
            kf.set(GROUP_SESSION_BUS, k, v.as_str());
        }
        for (k, v) in &self.system_bus {
            kf.set(GROUP_SYSTEM_BUS, k, v.as_str());
        }
        for (k, v) in &self.environment {
            kf.set(GROUP_ENVIRONMENT, k, v.clone());
        }
        kf
    }

    /// Overlay `other` on top of `self`: later toggles win per name, maps
    /// merge with `other` taking precedence.
    #[must_use]
    pub fn merged_with(&self, other: &Self) -> Self {
        fn merge_toggles(
            base: &[PermissionToggle],
            over: &[PermissionToggle],
        ) -> Vec<PermissionToggle> {
            let mut out: Vec<PermissionToggle> = base.to_vec();
            for t in over {
                if let Some(existing) = out.iter_mut().find(|e| e.name == t.name) {
                    existing.enabled = t.enabled;
                } else {
                    out.push(t.clone());
                }
            }
            out
        }
        let mut persistent = self.persistent.clone();
        for p in &other.persistent {
            if !persistent.contains(p) {
                persistent.push(p.clone());
            }
        }
        let mut environment = self.environment.clone();
        environment.extend(other.environment.clone());
        let mut session_bus = self.session_bus.clone();
        session_bus.extend(other.session_bus.clone());
        let mut system_bus = self.system_bus.clone();
        system_bus.extend(other.system_bus.clone());
        Self {
            shared: merge_toggles(&self.shared, &other.shared),
            sockets: merge_toggles(&self.sockets, &other.sockets),
            devices: merge_toggles(&self.devices, &other.devices),
            features: merge_toggles(&self.features, &other.features),
            filesystems: merge_toggles(&self.filesystems, &other.filesystems),
            persistent,
            environment,
            session_bus,
            system_bus,
        }
    }

    /// Resolved enabled-set for a toggle list (disabled entries removed).
    pub fn enabled(items: &[PermissionToggle]) -> Vec<&str> {
        items
            .iter()
            .filter(|t| t.enabled)
            .map(|t| t.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
[Context]
shared=network;
sockets=x11;wayland;
devices=dri;!kvm;
filesystems=home;!host;

[Session Bus Policy]
org.freedesktop.Notifications=talk

[Environment]
MOZ_ENABLE_WAYLAND=1
";

    #[test]
    fn parse_toggles() {
        let o = Overrides::parse(SAMPLE).unwrap();
        assert_eq!(
            o.devices,
            vec![
                PermissionToggle {
                    name: "dri".into(),
                    enabled: true
                },
                PermissionToggle {
                    name: "kvm".into(),
                    enabled: false
                },
            ]
        );
        assert_eq!(Overrides::enabled(&o.devices), vec!["dri"]);
    }

    #[test]
    fn parse_bus_policy_and_env() {
        let o = Overrides::parse(SAMPLE).unwrap();
        assert_eq!(
            o.session_bus.get("org.freedesktop.Notifications"),
            Some(&BusPolicy::Talk)
        );
        assert_eq!(o.environment.get("MOZ_ENABLE_WAYLAND").unwrap(), "1");
    }

    #[test]
    fn invalid_bus_policy_rejected() {
        let text = "[Session Bus Policy]\norg.x.Y=shout\n";
        assert!(Overrides::parse(text).is_err());
    }

    #[test]
    fn keyfile_roundtrip() {
        let o = Overrides::parse(SAMPLE).unwrap();
        let text = o.to_keyfile().to_text();
        let back = Overrides::parse(&text).unwrap();
        assert_eq!(back, o);
    }

    #[test]
    fn merge_later_wins() {
        let base = Overrides::parse("[Context]\ndevices=dri;kvm;\n").unwrap();
        let over = Overrides::parse("[Context]\ndevices=!kvm;all;\n").unwrap();
        let merged = base.merged_with(&over);
        assert_eq!(Overrides::enabled(&merged.devices), vec!["dri", "all"]);
    }

    #[test]
    fn merge_env_overlays() {
        let base = Overrides::parse("[Environment]\nA=1\nB=2\n").unwrap();
        let over = Overrides::parse("[Environment]\nB=3\n").unwrap();
        let merged = base.merged_with(&over);
        assert_eq!(merged.environment.get("A").unwrap(), "1");
        assert_eq!(merged.environment.get("B").unwrap(), "3");
    }

    #[test]
    fn empty_overrides_serialize_empty() {
        let o = Overrides::default();
        assert_eq!(o.to_keyfile().to_text(), "");
    }
}
