//! The application `metadata` keyfile model.
//!
//! A deploy carries a `metadata` keyfile with an `[Application]` or
//! `[Runtime]` group naming the artifact and its runtime, `[Extension *]`
//! groups declaring related refs, and an optional `[Extra Data]` group
//! listing external downloads verified by sha-256.

use crate::keyfile::{KeyFile, KeyFileError};
use crate::refs::{validate_name, RefKind};
use crate::variant::ExtraDataRecord;

pub const GROUP_APPLICATION: &str = "Application";
pub const GROUP_RUNTIME: &str = "Runtime";
pub const GROUP_EXTRA_DATA: &str = "Extra Data";
const EXTENSION_PREFIX: &str = "Extension ";

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error(transparent)]
    KeyFile(#[from] KeyFileError),
    #[error("metadata has neither [Application] nor [Runtime] group")]
    MissingKindGroup,
    #[error("metadata names both [Application] and [Runtime]")]
    AmbiguousKindGroup,
    #[error("invalid extension name '{0}'")]
    InvalidExtensionName(String),
    #[error("extra data source '{key}': {reason}")]
    InvalidExtraData { key: String, reason: String },
}

/// One `[Extension name]` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionInfo {
    pub name: String,
    pub directory: Option<String>,
    /// `version=`/`versions=`; empty means "follow the parent branch".
    pub versions: Vec<String>,
    pub subdirectories: bool,
    pub no_autodownload: bool,
    pub autodelete: bool,
    pub autoprune_unless: Option<String>,
    pub locale_subset: bool,
}

/// One `[Extra Data]` source after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraDataSource {
    pub name: Option<String>,
    pub size: u64,
    pub installed_size: u64,
    /// Lowercase sha-256 hex of the downloaded payload.
    pub checksum: String,
    pub uri: String,
}

impl ExtraDataSource {
    pub fn to_record(&self) -> ExtraDataRecord {
        let mut checksum = [0u8; 32];
        if let Ok(raw) = hex::decode(&self.checksum) {
            if raw.len() == 32 {
                checksum.copy_from_slice(&raw);
            }
        }
        ExtraDataRecord {
            name: self.name.clone().unwrap_or_default(),
            size: self.size,
            installed_size: self.installed_size,
            checksum,
            uri: self.uri.clone(),
        }
    }
}

/// Parsed application or runtime metadata.
#[derive(Debug, Clone)]
pub struct AppMetadata {
    pub id: String,
    pub kind: RefKind,
    /// `name/arch/branch` of the runtime this artifact executes against.
    pub runtime: Option<String>,
    pub sdk: Option<String>,
    pub command: Option<String>,
    /// Minimum client version required by this artifact.
    pub required_version: Option<String>,
    pub extensions: Vec<ExtensionInfo>,
    pub extra_data: Vec<ExtraDataSource>,
    /// The underlying keyfile, preserved verbatim for re-serialization.
    pub keyfile: KeyFile,
}

impl AppMetadata {
    pub fn kind_group(&self) -> &'static str {
        match self.kind {
            RefKind::App => GROUP_APPLICATION,
            RefKind::Runtime => GROUP_RUNTIME,
        }
    }
}

/// Parse and validate a metadata keyfile.
pub fn parse_metadata(text: &str) -> Result<AppMetadata, MetadataError> {
    let keyfile = KeyFile::parse(text)?;

    let kind = match (
        keyfile.has_group(GROUP_APPLICATION),
        keyfile.has_group(GROUP_RUNTIME),
    ) {
        (true, false) => RefKind::App,
        (false, true) => RefKind::Runtime,
        (false, false) => return Err(MetadataError::MissingKindGroup),
        (true, true) => return Err(MetadataError::AmbiguousKindGroup),
    };
    let group = match kind {
        RefKind::App => GROUP_APPLICATION,
        RefKind::Runtime => GROUP_RUNTIME,
    };

    let id = keyfile.require(group, "name")?.to_owned();
    let runtime = keyfile.get(group, "runtime").map(str::to_owned);
    let sdk = keyfile.get(group, "sdk").map(str::to_owned);
    let command = keyfile.get(group, "command").map(str::to_owned);
    let required_version = keyfile.get(group, "required-version").map(str::to_owned);

    let mut extensions = Vec::new();
    for gname in keyfile.group_names() {
        let Some(ext_name) = gname.strip_prefix(EXTENSION_PREFIX) else {
            continue;
        };
        if validate_name(ext_name).is_err() {
            return Err(MetadataError::InvalidExtensionName(ext_name.to_owned()));
        }
        let mut versions = keyfile.get_list(gname, "versions");
        if versions.is_empty() {
            if let Some(v) = keyfile.get(gname, "version") {
                versions.push(v.to_owned());
            }
        }
        extensions.push(ExtensionInfo {
            name: ext_name.to_owned(),
            directory: keyfile.get(gname, "directory").map(str::to_owned),
            versions,
            subdirectories: keyfile.get_bool(gname, "subdirectories")?.unwrap_or(false),
            no_autodownload: keyfile.get_bool(gname, "no-autodownload")?.unwrap_or(false),
            autodelete: keyfile.get_bool(gname, "autodelete")?.unwrap_or(false),
            autoprune_unless: keyfile.get(gname, "autoprune-unless").map(str::to_owned),
            locale_subset: keyfile.get_bool(gname, "locale-subset")?.unwrap_or(false),
        });
    }

    let extra_data = parse_extra_data(&keyfile)?;

    Ok(AppMetadata {
        id,
        kind,
        runtime,
        sdk,
        command,
        required_version,
        extensions,
        extra_data,
        keyfile,
    })
}

/// Collect `[Extra Data]` sources. Keys carry an optional numeric suffix:
/// `uri`, `uri1`, `uri2`, ... each requiring the matching `checksum{N}` and
/// `size{N}`.
fn parse_extra_data(keyfile: &KeyFile) -> Result<Vec<ExtraDataSource>, MetadataError> {
    if !keyfile.has_group(GROUP_EXTRA_DATA) {
        return Ok(Vec::new());
    }
    let err = |key: &str, reason: &str| MetadataError::InvalidExtraData {
        key: key.to_owned(),
        reason: reason.to_owned(),
    };

    let mut sources = Vec::new();
    for key in keyfile.keys(GROUP_EXTRA_DATA) {
        let Some(suffix) = key.strip_prefix("uri") else {
            continue;
        };
        if !suffix.is_empty() && !suffix.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let uri = keyfile.get(GROUP_EXTRA_DATA, key).unwrap_or_default();
        if !(uri.starts_with("http://") || uri.starts_with("https://")) {
            return Err(err(key, "only http:// and https:// URIs are accepted"));
        }

        let checksum_key = format!("checksum{suffix}");
        let checksum = keyfile
            .get(GROUP_EXTRA_DATA, &checksum_key)
            .ok_or_else(|| err(key, "missing matching checksum"))?;
        if checksum.len() != 64 || hex::decode(checksum).is_err() {
            return Err(err(&checksum_key, "checksum must be 64 hex characters"));
        }

        let size_key = format!("size{suffix}");
        let size = keyfile
            .get_u64(GROUP_EXTRA_DATA, &size_key)?
            .ok_or_else(|| err(key, "missing matching size"))?;
        if size == 0 {
            return Err(err(&size_key, "size must be greater than zero"));
        }

        let installed_size = keyfile
            .get_u64(GROUP_EXTRA_DATA, &format!("installed-size{suffix}"))?
            .unwrap_or(size);

        let name = keyfile
            .get(GROUP_EXTRA_DATA, &format!("name{suffix}"))
            .map(str::to_owned);
        if let Some(ref n) = name {
            if n.contains('/') {
                return Err(err(key, "name must not contain '/'"));
            }
        }

        sources.push(ExtraDataSource {
            name,
            size,
            installed_size,
            checksum: checksum.to_lowercase(),
            uri: uri.to_owned(),
        });
    }
    Ok(sources)
}
