//! GKeyFile-style configuration format: `[Group]` headers, `key=value`
//! entries, `;`-separated lists, `#` comments.
//!
//! Every configuration surface in the system (installation config, deploy
//! origin files, application metadata, overrides, flatpakref files) is a
//! keyfile. Group and key order is preserved so files round-trip cleanly.

use std::fmt::Write as _;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyFileError {
    #[error("keyfile parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("missing group '{0}'")]
    MissingGroup(String),
    #[error("missing key '{key}' in group '{group}'")]
    MissingKey { group: String, key: String },
    #[error("invalid value for '{group}/{key}': {reason}")]
    InvalidValue {
        group: String,
        key: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Group {
    name: String,
    entries: Vec<(String, String)>,
}

/// An ordered collection of groups of `key=value` entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFile {
    groups: Vec<Group>,
}

impl KeyFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self, KeyFileError> {
        let mut groups: Vec<Group> = Vec::new();
        for (i, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                let name = rest.strip_suffix(']').ok_or(KeyFileError::Parse {
                    line: i + 1,
                    reason: "unterminated group header".to_owned(),
                })?;
                if name.is_empty() {
                    return Err(KeyFileError::Parse {
                        line: i + 1,
                        reason: "empty group name".to_owned(),
                    });
                }
                groups.push(Group {
                    name: name.to_owned(),
                    entries: Vec::new(),
                });
                continue;
            }
            let (key, value) = line.split_once('=').ok_or(KeyFileError::Parse {
                line: i + 1,
                reason: "expected 'key=value'".to_owned(),
            })?;
            let key = key.trim_end();
            if key.is_empty() {
                return Err(KeyFileError::Parse {
                    line: i + 1,
                    reason: "empty key".to_owned(),
                });
            }
            let group = groups.last_mut().ok_or(KeyFileError::Parse {
                line: i + 1,
                reason: "entry before any group header".to_owned(),
            })?;
            group
                .entries
                .push((key.to_owned(), value.trim_start().to_owned()));
        }
        Ok(Self { groups })
    }

    /// Serialize back to keyfile text. Groups separated by a blank line.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (i, group) in self.groups.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            let _ = writeln!(out, "[{}]", group.name);
            for (k, v) in &group.entries {
                let _ = writeln!(out, "{k}={v}");
            }
        }
        out
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.name.as_str())
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.groups.iter().any(|g| g.name == name)
    }

    fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    fn group_mut(&mut self, name: &str) -> &mut Group {
        let index = match self.groups.iter().position(|g| g.name == name) {
            Some(i) => i,
            None => {
                self.groups.push(Group {
                    name: name.to_owned(),
                    entries: Vec::new(),
                });
                self.groups.len() - 1
            }
        };
        &mut self.groups[index]
    }

    pub fn keys(&self, group: &str) -> Vec<&str> {
        self.group(group)
            .map(|g| g.entries.iter().map(|(k, _)| k.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn get(&self, group: &str, key: &str) -> Option<&str> {
        self.group(group)?
            .entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn require(&self, group: &str, key: &str) -> Result<&str, KeyFileError> {
        if !self.has_group(group) {
            return Err(KeyFileError::MissingGroup(group.to_owned()));
        }
        self.get(group, key).ok_or_else(|| KeyFileError::MissingKey {
            group: group.to_owned(),
            key: key.to_owned(),
        })
    }

    pub fn get_bool(&self, group: &str, key: &str) -> Result<Option<bool>, KeyFileError> {
        match self.get(group, key) {
            None => Ok(None),
            Some("true") => Ok(Some(true)),
            Some("false") => Ok(Some(false)),
            Some(other) => Err(KeyFileError::InvalidValue {
                group: group.to_owned(),
                key: key.to_owned(),
                reason: format!("expected true/false, got '{other}'"),
            }),
        }
    }

    pub fn get_u64(&self, group: &str, key: &str) -> Result<Option<u64>, KeyFileError> {
        match self.get(group, key) {
            None => Ok(None),
            Some(v) => v.parse().map(Some).map_err(|_| KeyFileError::InvalidValue {
                group: group.to_owned(),
                key: key.to_owned(),
                reason: format!("expected unsigned integer, got '{v}'"),
            }),
        }
    }

    pub fn get_i64(&self, group: &str, key: &str) -> Result<Option<i64>, KeyFileError> {
        match self.get(group, key) {
            None => Ok(None),
            Some(v) => v.parse().map(Some).map_err(|_| KeyFileError::InvalidValue {
                group: group.to_owned(),
                key: key.to_owned(),
                reason: format!("expected integer, got '{v}'"),
            }),
        }
    }

    /// `;`-separated list; a trailing separator is tolerated.
    pub fn get_list(&self, group: &str, key: &str) -> Vec<String> {
        self.get(group, key)
            .map(|v| {
                v.split(';')
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set(&mut self, group: &str, key: &str, value: impl Into<String>) {
        let value = value.into();
        let g = self.group_mut(group);
        if let Some(entry) = g.entries.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            g.entries.push((key.to_owned(), value));
        }
    }

    pub fn set_bool(&mut self, group: &str, key: &str, value: bool) {
        self.set(group, key, if value { "true" } else { "false" });
    }

    pub fn set_list(&mut self, group: &str, key: &str, values: &[String]) {
        let mut joined = values.join(";");
        if !joined.is_empty() {
            joined.push(';');
        }
        self.set(group, key, joined);
    }

    pub fn remove_key(&mut self, group: &str, key: &str) {
        if let Some(g) = self.groups.iter_mut().find(|g| g.name == group) {
            g.entries.retain(|(k, _)| k != key);
        }
    }

    pub fn remove_group(&mut self, group: &str) {
        self.groups.retain(|g| g.name != group);
    }

    /// Ensure an (empty) group exists, preserving order for later entries.
    pub fn add_group(&mut self, group: &str) {
        let _ = self.group_mut(group);
    }
}
