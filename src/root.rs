//! Root descriptors, case policy resolution and OS path helpers
//!
//! A root is an OS directory that snapshots are taken of. Roots are
//! deduplicated on registration by their *root key*, a normalized absolute
//! path string that is stable across spellings of the same directory
//! (`/data//x/`, `/data/x`, `\\?\C:\data` and `c:/data` style variants).

use crate::error::{Result, TreesnapError};
use crate::node;
use crate::types::{CasePolicy, FileIdentity, OsKind, RootCapabilities, RootDescriptor};
use crate::vpath;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

const LONG_PATH_PREFIX: &str = r"\\?\";
const LONG_UNC_PREFIX: &str = r"\\?\UNC\";

/// Resolve a configured case policy against a root's capabilities
///
/// `Auto` becomes `Sensitive` or `Insensitive` from
/// `capabilities.case_sensitive`; explicit policies pass through. Callers
/// resolve on every operation instead of caching the result.
pub fn resolve_case_policy(policy: CasePolicy, capabilities: &RootCapabilities) -> CasePolicy {
    match policy {
        CasePolicy::Auto if capabilities.case_sensitive => CasePolicy::Sensitive,
        CasePolicy::Auto => CasePolicy::Insensitive,
        explicit => explicit,
    }
}

impl RootCapabilities {
    /// Typical capabilities of the given OS family
    ///
    /// POSIX filesystems are assumed case sensitive with inode identities.
    /// Windows volumes are assumed case insensitive, and file ids are not
    /// read from them.
    pub fn for_os(os: OsKind) -> Self {
        match os {
            OsKind::Posix => Self {
                case_sensitive: true,
                supports_file_id: true,
            },
            OsKind::Windows => Self {
                case_sensitive: false,
                supports_file_id: false,
            },
        }
    }
}

impl RootDescriptor {
    /// Describe a root at `os_path`, computing its root key
    ///
    /// The case policy defaults to `Auto` and capabilities to the typical
    /// values for `os`.
    pub fn new(
        root_id: impl Into<String>,
        os_path: impl Into<PathBuf>,
        os: OsKind,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let root_id = root_id.into();
        node::validate_root_id(&root_id)?;
        let os_path = os_path.into();
        let path_str = os_path
            .to_str()
            .ok_or_else(|| TreesnapError::custom(format!("root path is not valid UTF-8: {:?}", os_path)))?;
        let root_key = normalize_root_key(path_str, os)?;
        Ok(Self {
            root_id,
            root_key,
            os,
            os_path,
            created_at,
            case_policy: CasePolicy::Auto,
            capabilities: RootCapabilities::for_os(os),
        })
    }

    /// Override the case policy
    pub fn with_case_policy(mut self, policy: CasePolicy) -> Self {
        self.case_policy = policy;
        self
    }

    /// Override the detected capabilities
    pub fn with_capabilities(mut self, capabilities: RootCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Case policy in effect for this root right now
    pub fn effective_case_policy(&self) -> CasePolicy {
        resolve_case_policy(self.case_policy, &self.capabilities)
    }
}

fn current_dir_string() -> Result<String> {
    let cwd = std::env::current_dir()?;
    cwd.to_str()
        .map(str::to_string)
        .ok_or_else(|| TreesnapError::custom(format!("current directory is not valid UTF-8: {:?}", cwd)))
}

fn collapse_segments<'a>(segments: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut out: Vec<&str> = Vec::new();
    for segment in segments {
        match segment {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn normalize_posix(os_path: &str) -> Result<String> {
    let absolute = if os_path.starts_with('/') {
        os_path.to_string()
    } else {
        format!("{}/{}", current_dir_string()?, os_path)
    };
    let segments = collapse_segments(absolute.split('/'));
    Ok(format!("posixpath:/{}", segments.join("/")))
}

fn normalize_windows(os_path: &str) -> Result<String> {
    let stripped = if let Some(rest) = os_path.strip_prefix(LONG_UNC_PREFIX) {
        format!(r"\\{}", rest)
    } else if let Some(rest) = os_path.strip_prefix(LONG_PATH_PREFIX) {
        rest.to_string()
    } else {
        os_path.to_string()
    };
    let mut value = stripped.replace('/', "\\");

    let bytes = value.as_bytes();
    let has_drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    if !value.starts_with(r"\\") && !has_drive {
        value = format!("{}\\{}", current_dir_string()?.replace('/', "\\"), value);
    }

    let (prefix, rest) = if let Some(unc) = value.strip_prefix(r"\\") {
        let mut parts = unc.splitn(3, '\\');
        let server = parts.next().unwrap_or_default();
        let share = parts.next().unwrap_or_default();
        (format!(r"\\{}\{}", server, share), parts.next().unwrap_or_default().to_string())
    } else if value.len() >= 2 && value.as_bytes()[1] == b':' {
        let drive = value[..1].to_ascii_uppercase();
        (format!("{}:", drive), value[2..].to_string())
    } else {
        (String::new(), value.clone())
    };

    let segments = collapse_segments(rest.split('\\'));
    let mut resolved = format!("{}\\{}", prefix, segments.join("\\"));
    while resolved.len() > 3 && resolved.ends_with('\\') {
        resolved.pop();
    }
    Ok(format!("winpath:{}", resolved))
}

/// Normalized root key of an OS path
///
/// POSIX keys are `posixpath:` followed by the absolute path with `.`/`..`
/// resolved, duplicate slashes collapsed and no trailing slash. Windows keys
/// are `winpath:` followed by the absolute path with long-path prefixes
/// removed, backslash separators, an uppercase drive letter and no trailing
/// backslash except on a drive root.
///
/// # Errors
///
/// Fails only when a relative path has to be resolved against a current
/// directory that cannot be read or is not UTF-8.
pub fn normalize_root_key(os_path: &str, os: OsKind) -> Result<String> {
    match os {
        OsKind::Posix => normalize_posix(os_path),
        OsKind::Windows => normalize_windows(os_path),
    }
}

/// OS path of a vpath on the root's OS layer
pub fn vpath_to_os_path(root: &RootDescriptor, vpath: &str) -> Result<PathBuf> {
    let segments = vpath::decode_segments(vpath)?;
    let mut path = root.os_path.clone();
    for segment in segments {
        path.push(segment);
    }
    Ok(path)
}

/// OS identity of a file from its metadata
///
/// Available only on POSIX roots that support file ids.
#[allow(unused_variables)]
pub fn identity_from_metadata(root: &RootDescriptor, metadata: &std::fs::Metadata) -> FileIdentity {
    if !root.capabilities.supports_file_id {
        return FileIdentity::unavailable();
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if root.os == OsKind::Posix {
            return FileIdentity::posix(metadata.dev(), metadata.ino());
        }
    }
    FileIdentity::unavailable()
}

/// Read metadata for `path` without following a final symlink and derive its identity
pub fn identity_of_path(root: &RootDescriptor, path: &Path) -> Result<FileIdentity> {
    let metadata = std::fs::symlink_metadata(path)?;
    Ok(identity_from_metadata(root, &metadata))
}
