//! Node reference keys and identity derivation
//!
//! Pure functions that turn a [`NodeRef`] and its observed attributes into
//! the string keys both store backends index on. They are called for every
//! ingested node and every lookup, so they avoid anything beyond string
//! building and one SHA-256 where a key calls for it.
//!
//! ## Keys
//!
//! | Key | Form |
//! |-----|------|
//! | canonical string | `root:<rootId>:<container1>!...!<vpath>` |
//! | layers signature | SHA-256 of a fixed-order JSON rendering of the layer stack |
//! | ref key | `<rootId>:<layersSig>:<vpathKey>` |
//! | parent key | `pk:` + SHA-256 of the parent's canonical string |
//! | identity value | `posix:<dev>:<inode>` or `win:<volume>:<fileId padded to 32>` |
//! | entity key | identity value, else `path:<rootId>:<layersSig>:<vpathKey>` |

use crate::error::{Result, TreesnapError};
use crate::types::{CasePolicy, ErrorCode, FileIdentity, IdentityPlatform, Layer, NodeRef};
use crate::utils::hash_str;
use crate::vpath;

const CANONICAL_PREFIX: &str = "root:";
/// Separates the root id from the first vpath in a canonical string
const ROOT_ID_DELIMITER: &str = ":/";

/// Check that `root_id` can be embedded in a canonical string
///
/// Vpaths percent-encode `:`, so a root id free of `:/` makes the first
/// `:/` of a canonical string the end of the root id.
pub fn validate_root_id(root_id: &str) -> Result<()> {
    if root_id.is_empty() || root_id.contains(ROOT_ID_DELIMITER) {
        return Err(TreesnapError::InvalidRootId(root_id.to_string()));
    }
    Ok(())
}

fn ensure_os_first(node_ref: &NodeRef) -> Result<()> {
    match node_ref.layers.first() {
        Some(Layer::Os { .. }) => Ok(()),
        _ => Err(TreesnapError::InvalidLayers(format!(
            "layers of {}:{} must start with the OS layer",
            node_ref.root_id, node_ref.vpath
        ))),
    }
}

/// Canonical string of a reference
///
/// The canonical string round-trips through [`parse_canonical`] and is the
/// universal tie-break key for sorting.
///
/// # Errors
///
/// Returns [`TreesnapError::InvalidLayers`] if the layer stack is empty or
/// does not start with [`Layer::Os`], and [`TreesnapError::InvalidRootId`]
/// if the root id fails [`validate_root_id`].
pub fn canonical_string(node_ref: &NodeRef) -> Result<String> {
    ensure_os_first(node_ref)?;
    validate_root_id(&node_ref.root_id)?;
    let mut out = String::with_capacity(CANONICAL_PREFIX.len() + node_ref.root_id.len() + node_ref.vpath.len() + 1);
    out.push_str(CANONICAL_PREFIX);
    out.push_str(&node_ref.root_id);
    out.push(':');
    for layer in &node_ref.layers {
        if let Layer::Archive { container_vpath, .. } = layer {
            out.push_str(container_vpath);
            out.push('!');
        }
    }
    out.push_str(&node_ref.vpath);
    Ok(out)
}

/// Parse a canonical string back into a reference
///
/// Archive formats are not part of the canonical string; they are guessed
/// from each container's extension.
pub fn parse_canonical(value: &str) -> Result<NodeRef> {
    let rest = value.strip_prefix(CANONICAL_PREFIX).ok_or_else(|| {
        TreesnapError::invalid_vpath(ErrorCode::InvalidVpathFormat, "Canonical string must start with root:")
    })?;
    let delim = rest.find(ROOT_ID_DELIMITER).ok_or_else(|| {
        TreesnapError::invalid_vpath(ErrorCode::InvalidVpathFormat, "Canonical string missing \":/\" delimiter")
    })?;
    let root_id = &rest[..delim];
    if root_id.is_empty() {
        return Err(TreesnapError::invalid_vpath(
            ErrorCode::InvalidVpathFormat,
            "rootId cannot be empty",
        ));
    }

    let parts: Vec<&str> = rest[delim + 1..].split('!').collect();
    let mut layers = vec![Layer::Os { root_id: root_id.to_string() }];
    for container in &parts[..parts.len() - 1] {
        let container = vpath::normalize(container)?;
        layers.push(Layer::Archive {
            format: guess_archive_format(&container),
            container_vpath: container,
        });
    }
    let inner = vpath::normalize(parts[parts.len() - 1])?;

    Ok(NodeRef {
        root_id: root_id.to_string(),
        layers,
        vpath: inner,
    })
}

/// Archive format from a container's extension (lowercase, may be empty)
pub fn guess_archive_format(container_vpath: &str) -> String {
    match container_vpath.rfind('.') {
        Some(idx) => container_vpath[idx + 1..].to_ascii_lowercase(),
        None => String::new(),
    }
}

/// Fixed key-order JSON rendering of a layer stack
pub fn layers_signature_json(layers: &[Layer]) -> String {
    let rendered: Vec<String> = layers
        .iter()
        .map(|layer| match layer {
            Layer::Os { root_id } => format!(
                "{{\"kind\":\"OS\",\"rootId\":{}}}",
                serde_json::Value::from(root_id.as_str())
            ),
            Layer::Archive { format, container_vpath } => format!(
                "{{\"containerVPath\":{},\"format\":{},\"kind\":\"ARCHIVE\"}}",
                serde_json::Value::from(container_vpath.as_str()),
                serde_json::Value::from(format.as_str())
            ),
        })
        .collect();
    format!("[{}]", rendered.join(","))
}

/// SHA-256 hex of [`layers_signature_json`]
pub fn layers_signature(layers: &[Layer]) -> String {
    hash_str(&layers_signature_json(layers))
}

/// Uniqueness key of a reference in a snapshot
pub fn node_ref_key(node_ref: &NodeRef, policy: CasePolicy) -> String {
    format!(
        "{}:{}:{}",
        node_ref.root_id,
        layers_signature(&node_ref.layers),
        vpath::key(&node_ref.vpath, policy)
    )
}

/// Reference to the parent location within the same layer, if any
pub fn parent_ref_of(node_ref: &NodeRef) -> Option<NodeRef> {
    vpath::parent(&node_ref.vpath).map(|parent| node_ref.with_vpath(parent))
}

/// Parent key stored on a node: empty for a layer root
pub fn parent_key_of(node_ref: &NodeRef) -> Result<String> {
    match parent_ref_of(node_ref) {
        Some(parent) => parent_key_for(&parent),
        None => Ok(String::new()),
    }
}

/// Key under which the children of `node_ref` are indexed
pub fn parent_key_for(node_ref: &NodeRef) -> Result<String> {
    Ok(format!("pk:{}", hash_str(&canonical_string(node_ref)?)))
}

/// Comparison key of a decoded name
pub fn name_key(name: &str, policy: CasePolicy) -> String {
    match policy {
        CasePolicy::Insensitive => name.to_ascii_lowercase(),
        CasePolicy::Sensitive | CasePolicy::Auto => name.to_string(),
    }
}

/// Normalized string form of an OS identity
///
/// Windows ids are lowercased and the file id is zero-padded to 32 hex
/// digits so that ids of different widths compare consistently.
pub fn identity_value(identity: &FileIdentity) -> Option<String> {
    if !identity.is_available {
        return None;
    }
    match identity.platform {
        IdentityPlatform::Windows => identity.windows.as_ref().map(|win| {
            format!(
                "win:{}:{:0>32}",
                win.volume_id.to_ascii_lowercase(),
                win.file_id.to_ascii_lowercase()
            )
        }),
        IdentityPlatform::Posix => identity
            .posix
            .as_ref()
            .map(|posix| format!("posix:{}:{}", posix.dev, posix.inode)),
        IdentityPlatform::Unknown => None,
    }
}

/// Entity key: OS identity when available, otherwise a path-derived key
///
/// A path-derived entity cannot follow a rename; the renamed node gets a new
/// entity key and therefore a fresh `first_seen_at`.
pub fn entity_key(identity: &FileIdentity, node_ref: &NodeRef, policy: CasePolicy) -> String {
    if let Some(value) = identity_value(identity) {
        return value;
    }
    format!(
        "path:{}:{}:{}",
        node_ref.root_id,
        layers_signature(&node_ref.layers),
        vpath::key(&node_ref.vpath, policy)
    )
}

/// VPath of the node as seen on the OS layer
///
/// For nodes inside archives this is the outermost container's vpath.
pub fn os_layer_vpath(node_ref: &NodeRef) -> &str {
    node_ref
        .layers
        .iter()
        .find_map(|layer| match layer {
            Layer::Archive { container_vpath, .. } => Some(container_vpath.as_str()),
            Layer::Os { .. } => None,
        })
        .unwrap_or(node_ref.vpath.as_str())
}
